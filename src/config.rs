//! User-facing cache configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{CacheError, CacheResult};

/// Interval between collector cycles when none is configured.
pub(crate) const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for an [`FsCache`](crate::FsCache).
///
/// The struct deserializes with all fields optional, so it can be embedded
/// in a service configuration file:
///
/// ```yaml
/// dir: thumbnails
/// max_files: 512
/// max_size: 1000000000
/// max_age: 24h
/// gc_interval: 1m
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// The cache directory, used exclusively by this cache.
    ///
    /// Created if it does not exist. A relative path is resolved against the
    /// user cache directory; an empty path derives a directory name from the
    /// program name.
    pub dir: PathBuf,

    /// Upper cap on the number of cached files. Zero means unbounded.
    ///
    /// More files than this may exist temporarily; the cap triggers the
    /// collector rather than rejecting writes.
    pub max_files: u64,

    /// Upper cap on the aggregate size of cached files, in bytes. Zero means
    /// unbounded.
    pub max_size: u64,

    /// Maximum age of an entry since its last access. `None` means entries
    /// never expire. An expired entry may still be served until the
    /// collector gets to it.
    #[serde(with = "humantime_serde")]
    pub max_age: Option<Duration>,

    /// Sleep between collector cycles. `None` means one minute.
    #[serde(with = "humantime_serde")]
    pub gc_interval: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::new(),
            max_files: 512,
            max_size: 1_000_000_000,
            max_age: Some(Duration::from_secs(24 * 3600)),
            gc_interval: None,
        }
    }
}

impl CacheConfig {
    /// The effective interval between collector cycles.
    pub(crate) fn effective_gc_interval(&self) -> Duration {
        match self.gc_interval {
            Some(interval) if !interval.is_zero() => interval,
            _ => DEFAULT_GC_INTERVAL,
        }
    }

    /// Resolves the configured directory to an absolute path.
    ///
    /// An empty path falls back to the program's base name; a relative path
    /// is placed under the user cache directory.
    pub(crate) fn resolve_dir(&self) -> CacheResult<PathBuf> {
        let dir = if self.dir.as_os_str().is_empty() {
            let exe = std::env::current_exe().map_err(|e| {
                CacheError::InvalidConfig(format!("empty dir and no program name: {e}"))
            })?;
            match exe.file_stem() {
                Some(stem) => PathBuf::from(stem),
                None => {
                    return Err(CacheError::InvalidConfig(
                        "empty dir and no program name".into(),
                    ))
                }
            }
        } else {
            self.dir.clone()
        };

        if dir.is_absolute() {
            return Ok(dir);
        }
        let base = dirs::cache_dir().ok_or_else(|| {
            CacheError::InvalidConfig(format!(
                "{}: can not resolve relative cache dir",
                dir.display()
            ))
        })?;
        Ok(base.join(dir))
    }
}

/// Creates a directory tree readable and writable only by the owner.
pub(crate) fn create_dir_private(dir: &Path) -> std::io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}
