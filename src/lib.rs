//! # fscache
//!
//! A disk-backed, bounded, content-addressed cache for artifacts that are
//! expensive to produce, such as generated images or downloaded blobs.
//! Entries are requested by a caller-defined key; on a miss, a
//! caller-supplied builder writes the artifact to disk while every other
//! concurrent request for the same key waits for that single build.
//!
//! ## How it works
//!
//! Each key hashes to a fixed 32-byte [`Digest`] which addresses a single
//! file under the cache root, spread over a two-level directory fanout. The
//! file's mtime tracks its last access (it is refreshed on every hit), and
//! its size is what the byte accounting believes.
//!
//! A request goes through the following steps:
//! - If another request is currently *building* the same digest, the call
//!   waits for that build and shares its outcome, success or error.
//! - If the collector is currently *removing* the same digest, the call
//!   waits for the removal and then starts over.
//! - If the entry exists on disk, its mtime is refreshed and a read-only
//!   handle is returned.
//! - Otherwise the builder runs on the calling task. The artifact is written
//!   to a sibling `.tmp` file and renamed into place, so a partially written
//!   entry is never visible to readers.
//!
//! All of this is coordinated through a registry of in-flight operations
//! (at most one *building* or *removing* op exists per digest at any moment)
//! plus a per-digest count of open reader handles. The registry lives behind
//! a single mutex; waiting happens on per-op channels outside of it.
//!
//! ## Bounds and eviction
//!
//! [`CacheConfig`] caps the file count, the aggregate byte size, and the age
//! of entries since their last access. The caps are upper bounds that
//! trigger cleanup, not hard limits: a publish may briefly overshoot them
//! until the collector catches up.
//!
//! The collector is a background task driven by [`FsCache::serve`]. It
//! sleeps until a publish pushes a counter past its cap, then scans the
//! directory and removes the least-recently-used entries until the caps hold
//! again, using a size-bounded candidate set so that even huge directories
//! are scanned in constant memory. Entries that have aged out are reclaimed
//! eagerly during the scan. An entry is only ever removed if it has no open
//! handles, no in-flight op, and has not been touched since it was selected.
//!
//! On construction the cache directory is scanned once to restore the
//! counters from a previous run and to drop entries that expired in the
//! meantime.
//!
//! ## Errors
//!
//! Everything surfaces as [`CacheError`]. A failed build reports the
//! builder's error to the initiating call *and* to every waiter; the failed
//! digest is left absent so a later request retries the builder. Collector
//! errors are logged and never surface to callers. Diagnostics are emitted
//! through [`tracing`]: routine operations at `debug`, lifecycle events at
//! `info`, and reclamation problems at `warn`.
//!
//! ## Example
//!
//! ```no_run
//! use fscache::{builder_fn, CacheConfig, FsCache};
//! use futures::future::BoxFuture;
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//! use tokio_util::sync::CancellationToken;
//!
//! fn render<'a>(
//!     key: &'a u64,
//!     file: &'a mut tokio::fs::File,
//! ) -> BoxFuture<'a, anyhow::Result<()>> {
//!     Box::pin(async move {
//!         // produce the artifact for `key`
//!         file.write_all(format!("artifact #{key}").as_bytes()).await?;
//!         Ok(())
//!     })
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> anyhow::Result<()> {
//! // "thumbnails" is relative, so it resolves under the user cache dir
//! let cache = FsCache::with_config(
//!     CacheConfig {
//!         dir: "thumbnails".into(),
//!         max_files: 512,
//!         ..Default::default()
//!     },
//!     builder_fn(render),
//! )?;
//!
//! let shutdown = CancellationToken::new();
//! let collector = {
//!     let cache = cache.clone();
//!     let shutdown = shutdown.clone();
//!     tokio::spawn(async move { cache.serve(shutdown).await })
//! };
//!
//! let (mut file, from_cache) = cache.get(42).await?;
//! let mut artifact = String::new();
//! file.read_to_string(&mut artifact).await?;
//! println!("{artifact} (cached: {from_cache})");
//! drop(file); // releases the entry for eviction
//!
//! shutdown.cancel();
//! collector.await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Caveats
//!
//! - The cache directory must be used exclusively by one [`FsCache`]
//!   instance; external writers are not coordinated with. Independent
//!   instances over disjoint directories coexist fine.
//! - Two keys whose digests collide are treated as the same entry.
//! - Entries are immutable once published; there is no update operation.
//! - Atomic publication is the only durability guarantee; there is no
//!   fsync, journal, or checksum.

mod cache;
mod config;
mod error;
mod gc;
mod handle;
mod key;
mod paths;

pub use cache::{builder_fn, ArtifactBuilder, BuilderFn, CacheStatus, FsCache};
pub use config::CacheConfig;
pub use error::{CacheError, CacheResult};
pub use handle::CacheFile;
pub use key::{BytesKey, CacheKey, Digest, DIGEST_LEN};
