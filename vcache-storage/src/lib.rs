//! The Local-Storage Manager and the Storage Backend capability set:
//! admission control over a node's staging area, and the narrow trait
//! the write pipeline and read mirror stage bytes through.

mod backend;
mod backends;
mod lsm;

pub use backend::{for_each_run, MirrorHandle, OpaqueRef, StageHandle, StorageBackend};
pub use backends::{DeviceBackend, FileMmapBackend, GlobalBackend, RamBackend};
pub use lsm::{CacheRecord, StoragePool};

use std::sync::Arc;

use vcache_core::{BackendKind, StorageScope};

/// Construct the backend implementation for a resolved `BackendKind`.
/// `scope` only matters in that `BackendKind::Global` is itself the
/// resolved form of "global scope" (see
/// `vcache_core::config::StorageType::resolve_backend`); it is accepted
/// here purely so callers can assert consistency.
pub fn backend_for(kind: BackendKind, _scope: StorageScope) -> Arc<dyn StorageBackend> {
    match kind {
        BackendKind::FileMmap => Arc::new(FileMmapBackend),
        BackendKind::Ram => Arc::new(RamBackend),
        BackendKind::Device => Arc::new(DeviceBackend),
        BackendKind::Global => Arc::new(GlobalBackend),
    }
}
