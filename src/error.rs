//! The error type shared by all cache operations.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// An error returned by cache construction or [`get`](crate::FsCache::get).
///
/// The type is `Clone` so that a single builder failure can be delivered to
/// the initiating caller and to every concurrent request waiting on the same
/// digest.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Construction-time parameter validation failed.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// The user-supplied builder returned an error.
    #[error("builder failed: {0:#}")]
    Builder(Arc<anyhow::Error>),

    /// A filesystem operation failed.
    #[error("{}: {source}", .path.display())]
    Io {
        /// The path the failed operation was addressing.
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    /// An invariant of the in-flight op protocol was violated. Signals a bug.
    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    pub(crate) fn builder(source: anyhow::Error) -> Self {
        Self::Builder(Arc::new(source))
    }

    /// Returns whether this is a [`Builder`](Self::Builder) error.
    pub fn is_builder(&self) -> bool {
        matches!(self, Self::Builder(_))
    }
}

/// Result alias used throughout the crate.
pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_carry_path_context() {
        let err = CacheError::io("/cache/ab/cd/feed", io::Error::from(io::ErrorKind::NotFound));
        assert!(err.to_string().starts_with("/cache/ab/cd/feed:"));
    }

    #[test]
    fn builder_errors_share_one_source() {
        let err = CacheError::builder(anyhow::anyhow!("boom"));
        let other = err.clone();
        assert!(other.is_builder());
        assert_eq!(err.to_string(), "builder failed: boom");
    }
}
