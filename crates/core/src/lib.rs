//! Core types and shared functionality for modcache.
//!
//! This crate provides:
//! - Disk cache engine with atomic temp-then-rename writes
//! - Unified error types
//! - Configuration structures

pub mod cache;
pub mod config;
pub mod error;

pub use cache::{CacheKey, DiskCache, StagedWrite};
pub use config::{AppConfig, ConfigError, Overrides};
pub use error::Error;
