//! The cache instance: registry state, lookup/build coordination, status.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use filetime::FileTime;
use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Notify};

use crate::config::{create_dir_private, CacheConfig};
use crate::error::{CacheError, CacheResult};
use crate::handle::CacheFile;
use crate::key::{CacheKey, Digest};
use crate::paths;

/// Produces the artifact for a missing cache entry.
///
/// The builder receives the key and an already-open writable file and writes
/// the artifact into it. The cache closes the file afterwards, whether the
/// builder succeeded or not; the builder must not rename, remove, or close
/// the file itself.
pub trait ArtifactBuilder<K>: Send + Sync + 'static {
    /// Writes the artifact for `key` into `file`.
    fn build<'a>(
        &'a self,
        key: &'a K,
        file: &'a mut tokio::fs::File,
    ) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Wraps a plain function as an [`ArtifactBuilder`].
///
/// ```ignore
/// fn render<'a>(key: &'a u64, file: &'a mut File) -> BoxFuture<'a, anyhow::Result<()>> { ... }
/// let cache = FsCache::new("thumbnails", builder_fn(render))?;
/// ```
pub fn builder_fn<K, F>(f: F) -> BuilderFn<F>
where
    F: for<'a> Fn(&'a K, &'a mut tokio::fs::File) -> BoxFuture<'a, anyhow::Result<()>>,
    F: Send + Sync + 'static,
{
    BuilderFn(f)
}

/// An [`ArtifactBuilder`] backed by a function, see [`builder_fn`].
pub struct BuilderFn<F>(F);

impl<K, F> ArtifactBuilder<K> for BuilderFn<F>
where
    F: for<'a> Fn(&'a K, &'a mut tokio::fs::File) -> BoxFuture<'a, anyhow::Result<()>>,
    F: Send + Sync + 'static,
{
    fn build<'a>(
        &'a self,
        key: &'a K,
        file: &'a mut tokio::fs::File,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        (self.0)(key, file)
    }
}

/// Terminal state of an in-flight op, broadcast to its waiters.
///
/// The error slot is only ever populated by a failed build.
#[derive(Debug, Clone)]
pub(crate) enum OpProgress {
    Pending,
    Done(Option<CacheError>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    Building,
    Removing,
}

/// An operation currently owning a digest. At most one exists per digest.
///
/// Waiters clone the receiver while holding the registry mutex; the owner
/// sends [`OpProgress::Done`] exactly once after its terminal transition.
#[derive(Debug)]
pub(crate) struct InFlight {
    pub(crate) kind: OpKind,
    pub(crate) done: watch::Receiver<OpProgress>,
}

/// Everything guarded by the registry mutex.
#[derive(Debug, Default)]
pub(crate) struct State {
    pub(crate) op_map: HashMap<Digest, InFlight>,
    pub(crate) ref_map: HashMap<Digest, usize>,

    pub(crate) num_files: u64,
    pub(crate) total_size: u64,
    pub(crate) requested: u64,
    pub(crate) hit: u64,
    pub(crate) created: u64,
    pub(crate) failed: u64,
    pub(crate) removed: u64,
}

pub(crate) struct Shared<K> {
    pub(crate) root: PathBuf,
    builder: Box<dyn ArtifactBuilder<K>>,
    pub(crate) max_files: u64,
    pub(crate) max_size: u64,
    pub(crate) max_age: Option<Duration>,
    pub(crate) gc_interval: Duration,

    pub(crate) state: Mutex<State>,
    /// Wakes the collector after a publish pushes a counter past its cap.
    pub(crate) gc_wakeup: Notify,
}

impl<K> Shared<K> {
    pub(crate) fn is_overflowing(&self, state: &State) -> bool {
        (self.max_files != 0 && state.num_files > self.max_files)
            || (self.max_size != 0 && state.total_size > self.max_size)
    }

    pub(crate) fn ref_entry(&self, digest: &Digest) {
        let mut state = self.state.lock().unwrap();
        *state.ref_map.entry(*digest).or_insert(0) += 1;
    }

    pub(crate) fn unref_entry(&self, digest: &Digest) {
        let mut state = self.state.lock().unwrap();
        match state.ref_map.get_mut(digest) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                state.ref_map.remove(digest);
            }
            None => debug_assert!(false, "unref without ref"),
        }
    }
}

/// A disk-backed, bounded, content-addressed cache of expensive-to-produce
/// artifacts.
///
/// [`get`](Self::get) returns a read-only [`CacheFile`] for the entry
/// addressed by a key, invoking the [`ArtifactBuilder`] at most once per
/// digest no matter how many requests race on a missing entry. A background
/// collector started with [`serve`](Self::serve) keeps the directory within
/// the configured bounds; entries with open handles are never removed.
///
/// The type is a cheap handle over shared state and can be cloned freely.
pub struct FsCache<K> {
    pub(crate) shared: Arc<Shared<K>>,
}

impl<K> Clone for FsCache<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K> fmt::Debug for FsCache<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock().unwrap();
        f.debug_struct("FsCache")
            .field("dir", &self.shared.root)
            .field("files", &state.num_files)
            .field("bytes", &state.total_size)
            .field("ops", &state.op_map.len())
            .field("refs", &state.ref_map.len())
            .finish()
    }
}

impl<K: CacheKey + 'static> FsCache<K> {
    /// Creates a cache with the default configuration in `dir`.
    pub fn new(dir: impl Into<PathBuf>, builder: impl ArtifactBuilder<K>) -> CacheResult<Self> {
        Self::with_config(
            CacheConfig {
                dir: dir.into(),
                ..Default::default()
            },
            builder,
        )
    }

    /// Creates a cache from the given configuration.
    ///
    /// Resolves and creates the cache directory, then scans it once to pick
    /// up entries left over from previous runs: expired entries are removed,
    /// surviving ones are counted towards the caps.
    pub fn with_config(config: CacheConfig, builder: impl ArtifactBuilder<K>) -> CacheResult<Self> {
        let root = config.resolve_dir()?;
        create_dir_private(&root).map_err(|e| CacheError::io(&root, e))?;
        tracing::info!(dir = %root.display(), "cache directory ready");

        let shared = Shared {
            root,
            builder: Box::new(builder),
            max_files: config.max_files,
            max_size: config.max_size,
            // a zero age bound means "unbounded", like the zero caps
            max_age: config.max_age.filter(|age| !age.is_zero()),
            gc_interval: config.effective_gc_interval(),
            state: Mutex::new(State::default()),
            gc_wakeup: Notify::new(),
        };

        let cache = Self {
            shared: Arc::new(shared),
        };
        cache.initial_scan()?;
        Ok(cache)
    }

    /// The resolved cache directory.
    pub fn dir(&self) -> &Path {
        &self.shared.root
    }

    /// Returns a snapshot of the current counters.
    pub fn status(&self) -> CacheStatus {
        let state = self.shared.state.lock().unwrap();
        CacheStatus {
            num_files: state.num_files,
            total_size: state.total_size,
            requested: state.requested,
            hit: state.hit,
            created: state.created,
            failed: state.failed,
            removed: state.removed,
            ops: state.op_map.len(),
            refs: state.ref_map.len(),
        }
    }

    /// Returns the cached file for `key`, building it on a miss.
    ///
    /// On a miss the [`ArtifactBuilder`] runs on the calling task while
    /// concurrent requests for the same digest wait for that single build;
    /// its error, if any, is delivered to every waiter. The returned flag is
    /// true when the entry was served from the cache and false when this
    /// call created it.
    ///
    /// The returned handle pins the entry: it will not be removed by the
    /// collector until the handle is dropped.
    pub async fn get(&self, key: K) -> CacheResult<(CacheFile<K>, bool)> {
        let digest = key.digest();
        tracing::debug!(key = %key, digest = %digest, "get");

        let (dir, path) = paths::entry_paths(&self.shared.root, &digest);

        enum Next {
            Open,
            WaitBuild(watch::Receiver<OpProgress>),
            WaitRemove(watch::Receiver<OpProgress>),
            Build(watch::Sender<OpProgress>),
        }

        let mut created = false;
        let mut last_mod = None;
        let mut first_attempt = true;
        let mut removal_waited = false;

        loop {
            let next = {
                let mut state = self.shared.state.lock().unwrap();
                if first_attempt {
                    state.requested += 1;
                    first_attempt = false;
                }
                match state.op_map.get(&digest) {
                    Some(op) if op.kind == OpKind::Building => {
                        // This request will be served by someone else's
                        // build, which counts as a hit.
                        let done = op.done.clone();
                        state.hit += 1;
                        Next::WaitBuild(done)
                    }
                    Some(op) => {
                        if removal_waited {
                            return Err(CacheError::Internal("removal op observed twice"));
                        }
                        Next::WaitRemove(op.done.clone())
                    }
                    None => match std::fs::metadata(&path) {
                        Ok(meta) => {
                            state.hit += 1;
                            last_mod = meta.modified().ok();
                            if let Err(e) = filetime::set_file_mtime(&path, FileTime::now()) {
                                tracing::debug!(
                                    path = %path.display(),
                                    error = &e as &dyn std::error::Error,
                                    "failed to refresh entry mtime",
                                );
                            }
                            Next::Open
                        }
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {
                            let (tx, rx) = watch::channel(OpProgress::Pending);
                            state.op_map.insert(
                                digest,
                                InFlight {
                                    kind: OpKind::Building,
                                    done: rx,
                                },
                            );
                            Next::Build(tx)
                        }
                        Err(e) => {
                            state.failed += 1;
                            return Err(CacheError::io(&path, e));
                        }
                    },
                }
            };

            match next {
                Next::Open => {
                    tracing::debug!(digest = %digest, "cache hit");
                    break;
                }
                Next::WaitBuild(rx) => {
                    tracing::debug!(digest = %digest, "entry is being built concurrently, waiting");
                    if let Some(err) = wait_done(rx).await {
                        self.shared.state.lock().unwrap().failed += 1;
                        return Err(err);
                    }
                    // the build succeeded, the file exists now
                    break;
                }
                Next::WaitRemove(rx) => {
                    tracing::debug!(digest = %digest, "entry is being removed concurrently, waiting");
                    let _ = wait_done(rx).await;
                    removal_waited = true;
                }
                Next::Build(tx) => {
                    self.build_entry(&key, &digest, &dir, &path, tx).await?;
                    created = true;
                    break;
                }
            }
        }

        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| CacheError::io(&path, e))?;
        let meta = file.metadata().await.map_err(|e| CacheError::io(&path, e))?;
        let size = meta.len();
        let modified = last_mod
            .or_else(|| meta.modified().ok())
            .unwrap_or_else(SystemTime::now);

        let file = file.into_std().await;
        let handle = CacheFile::open(Arc::clone(&self.shared), key, digest, file, size, modified)
            .map_err(|e| CacheError::io(&path, e))?;
        Ok((handle, !created))
    }

    /// Runs the build for a freshly installed building op.
    ///
    /// Publishes the artifact atomically on success; on failure restores the
    /// "no entry" state and hands the error to every waiter. The op is
    /// unregistered on every path out of here, including cancellation of the
    /// calling future.
    async fn build_entry(
        &self,
        key: &K,
        digest: &Digest,
        dir: &Path,
        path: &Path,
        tx: watch::Sender<OpProgress>,
    ) -> CacheResult<()> {
        tracing::debug!(digest = %digest, "entry does not exist, building");

        let mut op = OpGuard {
            shared: &self.shared,
            digest,
            path,
            tmp: paths::temp_path(path),
            tx: Some(tx),
        };

        match self.write_artifact(key, dir, path, &op.tmp).await {
            Ok(size) => {
                tracing::info!(key = %key, size, "created cache entry");
                op.publish(size);
                Ok(())
            }
            Err(err) => {
                op.abort(err.clone());
                Err(err)
            }
        }
    }

    /// Writes the artifact to the temp path and renames it into place.
    ///
    /// Returns the authoritative size of the published entry.
    async fn write_artifact(
        &self,
        key: &K,
        dir: &Path,
        path: &Path,
        tmp: &Path,
    ) -> CacheResult<u64> {
        create_dir_private(dir).map_err(|e| CacheError::io(dir, e))?;

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o644);
        let mut file = options.open(tmp).await.map_err(|e| CacheError::io(tmp, e))?;

        let built = self.shared.builder.build(key, &mut file).await;

        // The file is closed no matter what the builder did with it.
        let flushed = file.flush().await;
        drop(file);

        built.map_err(CacheError::builder)?;
        flushed.map_err(|e| CacheError::io(tmp, e))?;

        let meta = tokio::fs::metadata(tmp)
            .await
            .map_err(|e| CacheError::io(tmp, e))?;
        let size = meta.len();

        tokio::fs::rename(tmp, path)
            .await
            .map_err(|e| CacheError::io(path, e))?;
        Ok(size)
    }

    fn initial_scan(&self) -> CacheResult<()> {
        let now = SystemTime::now();
        let max_age = self.shared.max_age;

        let mut expired_files = 0u64;
        let mut expired_size = 0u64;
        let mut state = State::default();

        walk_entries(&self.shared.root, &mut |path, meta, _| {
            let size = meta.len();
            if is_expired(max_age, now, meta.modified().ok()) {
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::warn!(
                        path = %path.display(),
                        error = &e as &dyn std::error::Error,
                        "failed to remove expired cache entry",
                    );
                    return;
                }
                expired_files += 1;
                expired_size += size;
                return;
            }
            state.num_files += 1;
            state.total_size += size;
            tracing::debug!(path = %path.display(), size, "cache entry found");
        })
        .map_err(|e| CacheError::io(&self.shared.root, e))?;

        if expired_files != 0 {
            tracing::info!(
                files = expired_files,
                bytes = expired_size,
                "removed expired cache entries",
            );
        }
        if state.num_files != 0 {
            tracing::info!(
                files = state.num_files,
                bytes = state.total_size,
                "found existing cache entries",
            );
        }

        *self.shared.state.lock().unwrap() = state;
        Ok(())
    }
}

/// Owns a registered building op for the duration of the build.
///
/// Exactly one of [`publish`](Self::publish) or [`abort`](Self::abort) runs;
/// if the owning future is dropped mid-build, `Drop` aborts the op so that
/// waiters are not left behind on a registered op nobody owns.
struct OpGuard<'a, K> {
    shared: &'a Shared<K>,
    digest: &'a Digest,
    path: &'a Path,
    tmp: PathBuf,
    tx: Option<watch::Sender<OpProgress>>,
}

impl<K> OpGuard<'_, K> {
    fn publish(&mut self, size: u64) {
        let Some(tx) = self.tx.take() else { return };
        {
            let mut state = self.shared.state.lock().unwrap();
            state.num_files += 1;
            state.total_size += size;
            state.created += 1;
            state.op_map.remove(self.digest);
        }
        self.shared.gc_wakeup.notify_one();
        let _ = tx.send(OpProgress::Done(None));
    }

    fn abort(&mut self, err: CacheError) {
        let Some(tx) = self.tx.take() else { return };
        let _ = std::fs::remove_file(&self.tmp);
        let _ = std::fs::remove_file(self.path);
        {
            let mut state = self.shared.state.lock().unwrap();
            state.failed += 1;
            state.op_map.remove(self.digest);
        }
        let _ = tx.send(OpProgress::Done(Some(err)));
    }
}

impl<K> Drop for OpGuard<'_, K> {
    fn drop(&mut self) {
        self.abort(CacheError::Internal("build aborted"));
    }
}

/// Awaits the terminal transition of an in-flight op.
///
/// Returns the error slot, which is populated only for failed builds. An op
/// whose owner vanished without signalling is reported as an internal error.
async fn wait_done(mut rx: watch::Receiver<OpProgress>) -> Option<CacheError> {
    match rx.wait_for(|p| matches!(p, OpProgress::Done(_))).await {
        Ok(progress) => match &*progress {
            OpProgress::Done(err) => err.clone(),
            OpProgress::Pending => unreachable!("wait_for returned a pending op"),
        },
        Err(_) => Some(CacheError::Internal("in-flight op abandoned")),
    }
}

pub(crate) fn is_expired(
    max_age: Option<Duration>,
    now: SystemTime,
    mtime: Option<SystemTime>,
) -> bool {
    let (Some(max_age), Some(mtime)) = (max_age, mtime) else {
        return false;
    };
    match now.duration_since(mtime) {
        Ok(age) => age > max_age,
        // mtime in the future, leave it alone
        Err(_) => false,
    }
}

/// Walks the cache directory, invoking the callback for every regular file
/// whose name parses as a digest. Anything else is ignored.
///
/// Failing to read the top-level directory is an error; everything below
/// that is skipped with a log line.
pub(crate) fn walk_entries(
    root: &Path,
    on_entry: &mut dyn FnMut(PathBuf, std::fs::Metadata, Digest),
) -> io::Result<()> {
    fn walk_below(
        dir: &Path,
        on_entry: &mut dyn FnMut(PathBuf, std::fs::Metadata, Digest),
    ) -> io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!(
                        dir = %dir.display(),
                        error = &e as &dyn std::error::Error,
                        "skipping unreadable directory entry",
                    );
                    continue;
                }
            };
            let path = entry.path();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };

            if file_type.is_dir() {
                if let Err(e) = walk_below(&path, on_entry) {
                    tracing::debug!(
                        dir = %path.display(),
                        error = &e as &dyn std::error::Error,
                        "skipping unreadable cache subdirectory",
                    );
                }
                continue;
            }
            if !file_type.is_file() {
                continue;
            }

            let digest = entry
                .file_name()
                .to_str()
                .and_then(Digest::from_file_name);
            let Some(digest) = digest else {
                tracing::debug!(path = %path.display(), "ignoring unexpected file in cache dir");
                continue;
            };

            match entry.metadata() {
                Ok(meta) => on_entry(path, meta, digest),
                Err(e) => {
                    tracing::debug!(
                        path = %path.display(),
                        error = &e as &dyn std::error::Error,
                        "failed to stat cache entry",
                    );
                }
            }
        }
        Ok(())
    }

    // An unreadable root is fatal to the caller; subdirectory failures are
    // handled inside the recursion.
    walk_below(root, on_entry)
}

/// A snapshot of the cache counters, taken atomically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatus {
    /// Number of files currently cached.
    pub num_files: u64,
    /// Aggregate size of the cached files, in bytes.
    pub total_size: u64,
    /// Lifetime number of [`get`](FsCache::get) calls.
    pub requested: u64,
    /// Lifetime number of requests served from an existing or concurrently
    /// built entry.
    pub hit: u64,
    /// Lifetime number of entries created.
    pub created: u64,
    /// Lifetime number of failed operations.
    pub failed: u64,
    /// Lifetime number of entries removed by the collector.
    pub removed: u64,
    /// In-flight ops at the time of the snapshot.
    pub ops: usize,
    /// Digests with open reader handles at the time of the snapshot.
    pub refs: usize,
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "files={}, size={}B, req={}, hit={}, new={}, fail={}, del={}, op={}, ref={}",
            self.num_files,
            self.total_size,
            self.requested,
            self.hit,
            self.created,
            self.failed,
            self.removed,
            self.ops,
            self.refs,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_requires_both_bounds() {
        let now = SystemTime::now();
        let old = now - Duration::from_secs(120);
        assert!(is_expired(Some(Duration::from_secs(60)), now, Some(old)));
        assert!(!is_expired(Some(Duration::from_secs(300)), now, Some(old)));
        assert!(!is_expired(None, now, Some(old)));
        assert!(!is_expired(Some(Duration::from_secs(60)), now, None));
        // future mtimes never expire
        assert!(!is_expired(
            Some(Duration::from_secs(60)),
            now,
            Some(now + Duration::from_secs(600)),
        ));
    }

    #[test]
    fn status_one_liner() {
        let status = CacheStatus {
            num_files: 2,
            total_size: 200,
            requested: 5,
            hit: 3,
            created: 2,
            failed: 0,
            removed: 0,
            ops: 0,
            refs: 1,
        };
        assert_eq!(
            status.to_string(),
            "files=2, size=200B, req=5, hit=3, new=2, fail=0, del=0, op=0, ref=1"
        );
    }
}
