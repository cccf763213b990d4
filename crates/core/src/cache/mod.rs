//! Disk-backed cache for module proxy artifacts.
//!
//! One file per cache key, rooted under the configured cache directory.
//! It supports:
//!
//! - Path-derived keys, used verbatim as relative filesystem paths
//! - Atomic writes (sibling `.tmp` file, then a single rename)
//! - Streaming writes that commit only when the stream completes
//! - One cache-wide read/write lock around the filesystem metadata steps
//!
//! Entries never expire and are never deleted by the cache itself.

pub mod key;
pub mod staged;
pub mod store;

pub use crate::Error;

pub use key::CacheKey;
pub use staged::StagedWrite;
pub use store::DiskCache;
