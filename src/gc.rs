//! The background collector: scanning, candidate selection, eviction.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::cache::{is_expired, walk_entries, FsCache, InFlight, OpKind, OpProgress};
use crate::error::{CacheError, CacheResult};
use crate::key::{CacheKey, Digest};

/// A file considered for eviction during one collector cycle. Candidates are
/// consumed in ascending mtime order, oldest first.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Candidate {
    last_mod: SystemTime,
    digest: Digest,
    path: PathBuf,
}

/// A size-bounded set of eviction candidates ordered by mtime.
///
/// Inserting past the capacity drops the newest element, so the set always
/// holds the oldest entries seen so far without ever buffering the whole
/// directory.
struct CandidateSelector {
    capacity: usize,
    candidates: BTreeSet<Candidate>,
}

impl CandidateSelector {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            candidates: BTreeSet::new(),
        }
    }

    fn insert(&mut self, candidate: Candidate) {
        self.candidates.insert(candidate);
        if self.candidates.len() > self.capacity {
            self.candidates.pop_last();
        }
    }
}

impl<K: CacheKey> FsCache<K> {
    /// Serves the collector until `shutdown` is cancelled.
    ///
    /// The task sleeps until a publish pushes the file count or the total
    /// size past its cap, runs an eviction cycle, then rests for the
    /// configured interval. Entries whose age exceeds `max_age` are also
    /// reclaimed whenever a cycle scans past them. Spawn this once per cache
    /// instance:
    ///
    /// ```ignore
    /// let gc = cache.clone();
    /// tokio::spawn(async move { gc.serve(shutdown).await });
    /// ```
    pub async fn serve(&self, shutdown: CancellationToken) {
        loop {
            loop {
                let wakeup = self.shared.gc_wakeup.notified();
                if self
                    .shared
                    .is_overflowing(&self.shared.state.lock().unwrap())
                {
                    break;
                }
                tokio::select! {
                    _ = wakeup => {}
                    _ = shutdown.cancelled() => return,
                }
            }
            if shutdown.is_cancelled() {
                return;
            }

            self.gc_cycle(&shutdown);

            tokio::select! {
                _ = tokio::time::sleep(self.shared.gc_interval) => {}
                _ = shutdown.cancelled() => return,
            }
        }
    }

    /// One scan-select-evict cycle.
    pub(crate) fn gc_cycle(&self, shutdown: &CancellationToken) {
        tracing::debug!("collector cycle started");
        let now = SystemTime::now();

        // Size the candidate set comfortably above the expected overflow
        // margin, so one pass over the oldest candidates is enough without
        // holding the whole directory in memory.
        let mut capacity: u64 = 64;
        {
            let state = self.shared.state.lock().unwrap();
            while state.num_files.saturating_add(capacity) < self.shared.max_files {
                capacity = capacity.saturating_mul(2);
            }
        }

        let mut selector = CandidateSelector::new(usize::try_from(capacity).unwrap_or(usize::MAX));
        let scanned = walk_entries(&self.shared.root, &mut |path, meta, digest| {
            let last_mod = match meta.modified() {
                Ok(mtime) => mtime,
                Err(_) => return,
            };
            if is_expired(self.shared.max_age, now, Some(last_mod)) {
                if let Err(err) = self.try_evict(&digest, &path, last_mod) {
                    tracing::warn!(
                        path = %path.display(),
                        error = &err as &dyn std::error::Error,
                        "failed to remove expired cache entry",
                    );
                }
                return;
            }
            selector.insert(Candidate {
                last_mod,
                digest,
                path,
            });
        });
        if let Err(err) = scanned {
            tracing::warn!(
                dir = %self.shared.root.display(),
                error = &err as &dyn std::error::Error,
                "failed to scan cache dir",
            );
            return;
        }

        for candidate in selector.candidates {
            if shutdown.is_cancelled() {
                return;
            }
            if !self
                .shared
                .is_overflowing(&self.shared.state.lock().unwrap())
            {
                break;
            }
            if let Err(err) = self.try_evict(&candidate.digest, &candidate.path, candidate.last_mod)
            {
                tracing::warn!(
                    path = %candidate.path.display(),
                    error = &err as &dyn std::error::Error,
                    "failed to remove cache entry",
                );
            }
        }
        tracing::debug!("collector cycle finished");
    }

    /// Removes one entry if it is still safe to do so.
    ///
    /// The candidate is re-validated under the lock: an open reader, an
    /// in-flight op, a vanished file, or an mtime differing from the
    /// snapshot all turn the eviction into a no-op. A Removing op fences
    /// concurrent lookups for the duration of the unlink.
    pub(crate) fn try_evict(
        &self,
        digest: &Digest,
        path: &Path,
        snapshot_mtime: SystemTime,
    ) -> CacheResult<()> {
        let (tx, size) = {
            let mut state = self.shared.state.lock().unwrap();
            if state.ref_map.contains_key(digest) {
                // an open handle pins the entry
                return Ok(());
            }
            if state.op_map.contains_key(digest) {
                // an in-flight op owns the digest
                return Ok(());
            }
            let meta = match std::fs::metadata(path) {
                Ok(meta) => meta,
                // already gone
                Err(_) => return Ok(()),
            };
            if meta.modified().ok() != Some(snapshot_mtime) {
                // concurrently accessed, no longer the candidate we picked
                return Ok(());
            }

            let (tx, rx) = watch::channel(OpProgress::Pending);
            state.op_map.insert(
                *digest,
                InFlight {
                    kind: OpKind::Removing,
                    done: rx,
                },
            );
            (tx, meta.len())
        };

        if let Err(err) = std::fs::remove_file(path) {
            let mut state = self.shared.state.lock().unwrap();
            state.op_map.remove(digest);
            drop(state);
            let _ = tx.send(OpProgress::Done(None));
            return Err(CacheError::io(path, err));
        }
        tracing::info!(digest = %digest, size, "removed cache entry");

        let mut state = self.shared.state.lock().unwrap();
        state.op_map.remove(digest);
        state.removed += 1;
        state.num_files = state.num_files.saturating_sub(1);
        state.total_size = state.total_size.saturating_sub(size);
        drop(state);
        let _ = tx.send(OpProgress::Done(None));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn candidate(age_secs: u64) -> Candidate {
        Candidate {
            last_mod: SystemTime::UNIX_EPOCH + Duration::from_secs(age_secs),
            digest: age_secs.digest(),
            path: PathBuf::from(format!("/cache/{age_secs}")),
        }
    }

    #[test]
    fn selector_keeps_oldest() {
        let mut selector = CandidateSelector::new(8);
        // insert newest-first so every retained element gets displaced
        for age in (0..100).rev() {
            selector.insert(candidate(age));
        }
        assert_eq!(selector.candidates.len(), 8);
        let ages: Vec<_> = selector
            .candidates
            .iter()
            .map(|c| {
                c.last_mod
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .unwrap()
                    .as_secs()
            })
            .collect();
        assert_eq!(ages, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn selector_orders_by_mtime() {
        let mut selector = CandidateSelector::new(16);
        for age in [5, 3, 9, 1] {
            selector.insert(candidate(age));
        }
        let first = selector.candidates.iter().next().unwrap();
        assert_eq!(
            first.last_mod,
            SystemTime::UNIX_EPOCH + Duration::from_secs(1)
        );
    }
}
