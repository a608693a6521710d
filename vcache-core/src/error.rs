//! The core error taxonomy. Every variant here names exactly one failure
//! condition the cache layer can hit; propagation rules (latched vs.
//! immediate) live with the component that produces each error, not here.

use thiserror::Error;

/// Errors produced by the Local-Storage Manager, storage backends, the
/// write pipeline, and the read mirror.
#[derive(Debug, Error)]
pub enum CacheError {
    /// `LSM.claim` exceeded the pool even after evicting every eligible
    /// temporal cache. Callers fall back to an uncached pass-through.
    #[error("out of space: requested {requested} bytes, pool has {available} bytes free after eviction")]
    OutOfSpace { requested: u64, available: u64 },

    /// A storage backend could not stage bytes into its write or read
    /// stage. The triggering call fails.
    #[error("failed to stage {context}: {source}")]
    StageWriteError {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The slow store's async wait reported failure. Surfaced at the next
    /// `flush`, not at enqueue time.
    #[error("slow store operation failed: {0}")]
    SlowStoreError(String),

    /// Config names an unknown backend or invalid replacement policy.
    /// Fatal at file-open time.
    #[error("misconfigured cache: {0}")]
    MisconfiguredCache(String),

    /// A one-sided RMA primitive failed. Fatal to the owning mirror; the
    /// mirror disables itself and future reads pass through.
    #[error("MPI window operation failed: {0}")]
    WindowError(String),

    /// Removal of a cache that was never registered, or already removed.
    /// Not fatal (callers warn and continue).
    #[error("cache {0} was not registered or already removed")]
    PartialCacheRemoval(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;
