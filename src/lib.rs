// gencache - Generational content-addressed object cache
// A fixed-capacity, memory-mapped blob store with approximate LRU eviction

#![warn(rust_2018_idioms)]

pub mod cache;
pub mod config;
pub mod metrics;

// Re-exports for convenience
pub use cache::{CacheStats, CacheStore, ContentHash, ContentStore, Item, LruCache, View};
pub use config::CacheConfig;

/// gencache error types
pub mod error {
    use std::path::PathBuf;
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("I/O error at {path}: {source}")]
        Io {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },

        #[error("Unsupported index version {found} (newest supported is {supported})")]
        UnsupportedVersion { found: u8, supported: u8 },

        #[error("Index file missing and no transaction to recover: {0}")]
        MissingIndex(PathBuf),

        #[error("Corrupt index: {0}")]
        Corrupt(String),

        #[error("Invalid argument: {0}")]
        InvalidArgument(String),

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("Internal error: {0}")]
        Internal(String),
    }

    impl Error {
        /// Wrap an I/O error with the path it happened on
        pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
            Error::Io {
                path: path.into(),
                source,
            }
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = error::Error::UnsupportedVersion {
            found: 9,
            supported: 1,
        };
        let msg = err.to_string();
        assert!(msg.contains("9"));
        assert!(msg.contains("1"));

        let err = error::Error::io(
            "/tmp/cache.idx",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.to_string().contains("cache.idx"));
    }

    #[test]
    fn test_version_format() {
        assert!(!VERSION.is_empty());
    }
}
