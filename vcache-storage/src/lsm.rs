//! The Local-Storage Manager: admission control, registration, eviction,
//! and access-accounting for a node's staging area.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;
use vcache_core::{
    AccessHistory, BackendKind, CacheDuration, CacheError, CachePurpose, ReplacementPolicy,
};

use crate::backend::StorageBackend;

/// The bookkeeping unit the LSM tracks: one file's write stage or one
/// dataset's read mirror.
#[derive(Debug, Clone)]
pub struct CacheRecord {
    pub id: Uuid,
    /// Dataset or file basename, carried for legible log lines (not part
    /// of the original data model, added so `tracing` output identifies
    /// which object an eviction or claim touched).
    pub label: String,
    pub purpose: CachePurpose,
    pub duration: CacheDuration,
    pub total_bytes: u64,
    pub bytes_remaining: u64,
    pub per_rank_total: u64,
    pub per_rank_remaining: u64,
    pub path: Option<PathBuf>,
    pub created_at: chrono::DateTime<Utc>,
    pub access_history: AccessHistory,
}

impl CacheRecord {
    pub fn new(
        label: impl Into<String>,
        purpose: CachePurpose,
        duration: CacheDuration,
        total_bytes: u64,
        per_rank_total: u64,
        path: Option<PathBuf>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            label: label.into(),
            purpose,
            duration,
            total_bytes,
            bytes_remaining: total_bytes,
            per_rank_total,
            per_rank_remaining: per_rank_total,
            path,
            created_at: now,
            access_history: AccessHistory::new(now),
        }
    }
}

struct PoolState {
    bytes_remaining: u64,
    /// Live caches, most-recently-registered first.
    live: Vec<CacheRecord>,
}

/// One configured storage tier. Claims, registrations, and evictions all
/// serialize through `state`'s mutex.
pub struct StoragePool {
    pub kind: BackendKind,
    pub root_path: Option<PathBuf>,
    pub total_bytes: u64,
    pub policy: ReplacementPolicy,
    /// Whether this rank is the node-local I/O node: only it actually
    /// purges folders on release.
    pub is_io_node: bool,
    backend: Arc<dyn StorageBackend>,
    state: Mutex<PoolState>,
}

impl StoragePool {
    pub fn new(
        kind: BackendKind,
        root_path: Option<PathBuf>,
        total_bytes: u64,
        policy: ReplacementPolicy,
        is_io_node: bool,
        backend: Arc<dyn StorageBackend>,
    ) -> Self {
        Self {
            kind,
            root_path,
            total_bytes,
            policy,
            is_io_node,
            backend,
            state: Mutex::new(PoolState {
                bytes_remaining: total_bytes,
                live: Vec::new(),
            }),
        }
    }

    /// Bytes currently unclaimed. Exposed for tests and for callers deciding
    /// whether a claim is even worth attempting.
    pub fn bytes_remaining(&self) -> u64 {
        self.state.lock().bytes_remaining
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Reserve `bytes` against this pool. `Soft` fails immediately with no
    /// side effect; `Hard` evicts temporal caches by `self.policy` until
    /// enough space frees up or none remain.
    pub fn claim(&self, bytes: u64, mode: vcache_core::ClaimMode) -> Result<(), CacheError> {
        use vcache_core::ClaimMode;

        let mut state = self.state.lock();
        if state.bytes_remaining >= bytes {
            state.bytes_remaining -= bytes;
            return Ok(());
        }
        if mode == ClaimMode::Soft {
            return Err(CacheError::OutOfSpace {
                requested: bytes,
                available: state.bytes_remaining,
            });
        }

        loop {
            if state.bytes_remaining >= bytes {
                break;
            }
            let Some(victim_idx) = select_victim(&state.live, self.policy) else {
                return Err(CacheError::OutOfSpace {
                    requested: bytes,
                    available: state.bytes_remaining,
                });
            };
            let victim = state.live.remove(victim_idx);
            tracing::info!(cache = %victim.label, bytes = victim.total_bytes, "evicting cache under space pressure");
            self.purge(&victim);
            state.bytes_remaining += victim.total_bytes;
        }
        state.bytes_remaining -= bytes;
        Ok(())
    }

    /// Prepend `cache` to the live list and stamp its first access. The
    /// caller must have already `claim`ed its bytes.
    pub fn register(&self, cache: CacheRecord) -> Uuid {
        let id = cache.id;
        tracing::info!(cache = %cache.label, bytes = cache.total_bytes, "registering cache");
        self.state.lock().live.insert(0, cache);
        id
    }

    /// Remove `id` from the live list, purge its folder if file-backed and
    /// this rank is the I/O node, and return its bytes to the pool. A
    /// missing `id` is a warned no-op, making release idempotent.
    pub fn release(&self, id: Uuid) {
        let mut state = self.state.lock();
        let Some(idx) = state.live.iter().position(|c| c.id == id) else {
            tracing::warn!(%id, "{}", CacheError::PartialCacheRemoval(id.to_string()));
            return;
        };
        let cache = state.live.remove(idx);
        self.purge(&cache);
        state.bytes_remaining += cache.total_bytes;
    }

    fn purge(&self, cache: &CacheRecord) {
        if !self.is_io_node {
            return;
        }
        if let Some(path) = &cache.path {
            if matches!(self.kind, BackendKind::FileMmap | BackendKind::Global) {
                if let Err(err) = self.backend.purge_folder(path) {
                    tracing::warn!(cache = %cache.label, error = %err, "purge_folder failed");
                }
            }
        }
    }

    /// Bump `id`'s access counter and append a timestamp to its ring.
    pub fn record_access(&self, id: Uuid) {
        let mut state = self.state.lock();
        if let Some(cache) = state.live.iter_mut().find(|c| c.id == id) {
            cache.access_history.record(Utc::now());
        }
    }
}

/// Pick the index of the eviction victim among temporal caches under
/// `policy`. Ties break deterministically on insertion order: the scan
/// keeps the first (lowest-index) minimal score it sees and never
/// replaces it with an equally-scored later one.
fn select_victim(live: &[CacheRecord], policy: ReplacementPolicy) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (idx, cache) in live.iter().enumerate() {
        if cache.duration != CacheDuration::Temporal {
            continue;
        }
        let score = match policy {
            ReplacementPolicy::Lru => cache.access_history.last().timestamp_millis() as f64,
            ReplacementPolicy::Fifo => cache.access_history.first().timestamp_millis() as f64,
            ReplacementPolicy::Lfu => cache.access_history.inverse_frequency(),
        };
        match best {
            Some((_, best_score)) if score >= best_score => {}
            _ => best = Some((idx, score)),
        }
    }
    best.map(|(idx, _)| idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::RamBackend;
    use vcache_core::ClaimMode;

    fn pool(total: u64, policy: ReplacementPolicy) -> StoragePool {
        StoragePool::new(
            BackendKind::Ram,
            None,
            total,
            policy,
            true,
            Arc::new(RamBackend::default()),
        )
    }

    #[test]
    fn claim_and_release_preserve_byte_accounting() {
        let p = pool(1024, ReplacementPolicy::Lru);
        p.claim(512, ClaimMode::Soft).unwrap();
        let id = p.register(CacheRecord::new(
            "a",
            CachePurpose::Write,
            CacheDuration::Temporal,
            512,
            512,
            None,
        ));
        assert_eq!(p.bytes_remaining() + 512, p.total_bytes);
        p.release(id);
        assert_eq!(p.bytes_remaining(), p.total_bytes);
    }

    #[test]
    fn soft_claim_fails_without_eviction() {
        let p = pool(100, ReplacementPolicy::Lru);
        let err = p.claim(200, ClaimMode::Soft).unwrap_err();
        assert!(matches!(err, CacheError::OutOfSpace { .. }));
        assert_eq!(p.bytes_remaining(), 100);
    }

    #[test]
    fn hard_claim_evicts_lru_victim() {
        let p = pool(100, ReplacementPolicy::Lru);
        p.claim(100, ClaimMode::Soft).unwrap();
        let old = CacheRecord::new(
            "old",
            CachePurpose::Write,
            CacheDuration::Temporal,
            60,
            60,
            None,
        );
        let old_id = p.register(old);
        p.record_access(old_id);

        std::thread::sleep(std::time::Duration::from_millis(5));

        let recent = CacheRecord::new(
            "recent",
            CachePurpose::Write,
            CacheDuration::Temporal,
            40,
            40,
            None,
        );
        let recent_id = p.register(recent);
        p.record_access(recent_id);

        // No room left; a hard claim of 50 must evict `old` since LRU never
        // evicts the maximum last-access among temporal caches.
        p.claim(50, ClaimMode::Hard).unwrap();
        assert_eq!(p.live_count(), 1);
    }

    #[test]
    fn permanent_caches_are_never_evicted() {
        let p = pool(100, ReplacementPolicy::Lru);
        p.claim(100, ClaimMode::Soft).unwrap();
        p.register(CacheRecord::new(
            "pinned",
            CachePurpose::Write,
            CacheDuration::Permanent,
            100,
            100,
            None,
        ));
        let err = p.claim(1, ClaimMode::Hard).unwrap_err();
        assert!(matches!(err, CacheError::OutOfSpace { .. }));
    }

    #[test]
    fn release_of_unregistered_cache_is_a_noop() {
        let p = pool(100, ReplacementPolicy::Lru);
        p.release(Uuid::new_v4());
        p.release(Uuid::new_v4());
        assert_eq!(p.bytes_remaining(), 100);
    }
}
