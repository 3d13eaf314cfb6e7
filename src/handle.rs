//! The read-only handle returned by [`FsCache::get`](crate::FsCache::get).

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::SystemTime;

use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};

use crate::cache::Shared;
use crate::key::{CacheKey, Digest};

/// An open, read-only view of one cache entry.
///
/// The handle pins the entry: the collector will not remove the underlying
/// file while the handle is alive. Dropping the handle releases the pin and
/// closes the descriptors; holding on to handles indefinitely keeps the
/// entries on disk past every cap.
///
/// Sequential reads and seeking go through [`AsyncRead`]/[`AsyncSeek`];
/// positional reads through [`read_at`](Self::read_at) do not disturb the
/// sequential cursor.
pub struct CacheFile<K> {
    shared: Arc<Shared<K>>,
    key: K,
    digest: Digest,
    file: tokio::fs::File,
    /// A duplicate descriptor used for positional reads.
    raw: std::fs::File,
    size: u64,
    modified: SystemTime,
}

impl<K: CacheKey> fmt::Debug for CacheFile<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheFile")
            .field("key", &self.key.to_string())
            .field("digest", &self.digest)
            .field("size", &self.size)
            .field("modified", &self.modified)
            .finish()
    }
}

impl<K: CacheKey> CacheFile<K> {
    pub(crate) fn open(
        shared: Arc<Shared<K>>,
        key: K,
        digest: Digest,
        file: std::fs::File,
        size: u64,
        modified: SystemTime,
    ) -> io::Result<Self> {
        let raw = file.try_clone()?;
        shared.ref_entry(&digest);
        Ok(Self {
            shared,
            key,
            digest,
            file: tokio::fs::File::from_std(file),
            raw,
            size,
            modified,
        })
    }

    /// The key this entry was requested with.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// The key's display label. Note that this is not the on-disk file name.
    pub fn name(&self) -> String {
        self.key.to_string()
    }

    /// The entry size in bytes, captured when the handle was opened.
    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Last access time of the entry, captured when the handle was opened.
    pub fn modified(&self) -> SystemTime {
        self.modified
    }

    /// The mode the entry is exposed with. Always `0o400`: the view is
    /// read-only regardless of the permissions of the file itself.
    pub fn mode(&self) -> u32 {
        0o400
    }

    /// Reads from the given byte offset, leaving the sequential read
    /// position untouched.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.raw.read_at(buf, offset)
        }
        #[cfg(windows)]
        {
            use std::os::windows::fs::FileExt;
            self.raw.seek_read(buf, offset)
        }
    }

    /// Closes the handle, releasing its pin on the entry.
    ///
    /// Dropping the handle has the same effect.
    pub fn close(self) {}
}

impl<K: Unpin> AsyncRead for CacheFile<K> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_read(cx, buf)
    }
}

impl<K: Unpin> AsyncSeek for CacheFile<K> {
    fn start_seek(self: Pin<&mut Self>, position: io::SeekFrom) -> io::Result<()> {
        Pin::new(&mut self.get_mut().file).start_seek(position)
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Pin::new(&mut self.get_mut().file).poll_complete(cx)
    }
}

impl<K> Drop for CacheFile<K> {
    fn drop(&mut self) {
        self.shared.unref_entry(&self.digest);
    }
}
