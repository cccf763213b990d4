//! Cache keys derived from request paths.

use std::fmt;
use std::path::PathBuf;

use crate::Error;

/// Slash-delimited identifier of one cached artifact.
///
/// Built from the inbound request path with the leading `/` stripped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive a key from an inbound request path.
    ///
    /// Rejects paths that could escape the cache root or alias another key:
    /// empty paths, empty segments, `.` and `..` segments, backslashes and NUL.
    pub fn from_request_path(path: &str) -> Result<Self, Error> {
        let key = path.strip_prefix('/').unwrap_or(path);

        if key.is_empty() {
            return Err(Error::InvalidKey("empty path".into()));
        }
        if key.contains(['\\', '\0']) {
            return Err(Error::InvalidKey(format!("illegal character in {key}")));
        }
        if key.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..") {
            return Err(Error::InvalidKey(format!("illegal segment in {key}")));
        }

        Ok(Self(key.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Relative filesystem path with `/` mapped to the host separator.
    pub fn relative_path(&self) -> PathBuf {
        self.0.split('/').collect()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_strips_leading_slash() {
        let key = CacheKey::from_request_path("/example.com/@v/list").unwrap();
        assert_eq!(key.as_str(), "example.com/@v/list");
    }

    #[test]
    fn test_without_leading_slash() {
        let key = CacheKey::from_request_path("golang.org/x/mod/@v/v0.17.0.mod").unwrap();
        assert_eq!(key.to_string(), "golang.org/x/mod/@v/v0.17.0.mod");
    }

    #[test]
    fn test_relative_path() {
        let key = CacheKey::from_request_path("/example.com/@v/v1.0.0.zip").unwrap();
        assert_eq!(key.relative_path(), Path::new("example.com").join("@v").join("v1.0.0.zip"));
    }

    #[test]
    fn test_rejects_traversal() {
        assert!(matches!(CacheKey::from_request_path("/../etc/passwd"), Err(Error::InvalidKey(_))));
        assert!(matches!(CacheKey::from_request_path("/a/./b.info"), Err(Error::InvalidKey(_))));
    }

    #[test]
    fn test_rejects_empty() {
        assert!(matches!(CacheKey::from_request_path("/"), Err(Error::InvalidKey(_))));
        assert!(matches!(CacheKey::from_request_path(""), Err(Error::InvalidKey(_))));
        assert!(matches!(CacheKey::from_request_path("/a//b.mod"), Err(Error::InvalidKey(_))));
    }

    #[test]
    fn test_rejects_backslash() {
        assert!(matches!(CacheKey::from_request_path("/a\\..\\b.mod"), Err(Error::InvalidKey(_))));
    }
}
