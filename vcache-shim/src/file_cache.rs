//! The File Cache: the per-open-file object that claims staging space
//! from the Local-Storage Manager, owns one Write Pipeline, and hosts
//! zero-or-more Read Mirrors.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use vcache_core::{AppConfig, BackendKind, CacheDuration, CachePurpose, CacheError, ClaimMode};
use vcache_mirror::{ReadMirror, SampleShape, WindowFactory};
use vcache_pipeline::{DatasetHandle, SlowStore, WritePipeline};
use vcache_storage::{CacheRecord, MirrorHandle, StorageBackend, StoragePool};

/// One opened dataset's Read Mirror plus the bookkeeping needed to
/// release it again.
pub struct DatasetCache {
    pub mirror: Arc<ReadMirror>,
    cache_record_id: Uuid,
    /// The backend-owned mirror backing storage (the mmap file, RAM
    /// buffer, etc.), torn down via `destroy_read_mirror` in
    /// `close_dataset`. `None` for a file-mmap-backed mirror once
    /// `enable_remap` has handed the handle to `mirror` itself.
    mirror_handle: Mutex<Option<MirrorHandle>>,
    /// Effective read-cache flag for this dataset, after flag propagation
    /// from the file (parent → child, never widening).
    pub read_enabled: bool,
}

/// Per-open-file cache state. MPI-agnostic: the caller (`vcache-demo`, or
/// a test) supplies the rank/IO-node facts and a `WindowFactory`, since
/// communicator splitting itself is handled elsewhere.
pub struct FileCache {
    pub path: PathBuf,
    pool: Arc<StoragePool>,
    backend: Arc<dyn StorageBackend>,
    slow_store: Arc<dyn SlowStore>,
    window_factory: Arc<dyn WindowFactory>,
    config: AppConfig,
    is_io_node: bool,
    rank: u32,
    cache_dir: Option<PathBuf>,

    write_cache_record_id: Option<Uuid>,
    /// `None` when write caching is disabled (config says so, or the
    /// initial claim failed): the shim then passes writes straight
    /// through.
    pub pipeline: Option<Arc<WritePipeline>>,
    pub write_enabled: bool,
    pub read_enabled: bool,

    datasets: Mutex<HashMap<DatasetHandle, Arc<DatasetCache>>>,
}

impl FileCache {
    /// Communicator split and I/O-node election are already performed by
    /// the caller and passed in as `is_io_node`/`window_factory`.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        path: &Path,
        config: AppConfig,
        pool: Arc<StoragePool>,
        backend: Arc<dyn StorageBackend>,
        slow_store: Arc<dyn SlowStore>,
        window_factory: Arc<dyn WindowFactory>,
        is_io_node: bool,
        procs_per_node: u32,
        rank: u32,
    ) -> Self {
        let basename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let cache_dir = pool
            .root_path
            .as_ref()
            .map(|root| root.join(format!("{basename}-cache")));

        let mut write_enabled = config.pipeline.write_cache_enabled;
        let mut pipeline = None;
        let mut write_cache_record_id = None;

        if write_enabled {
            let per_rank = config.storage.write_buffer_size;
            let aggregate = per_rank.saturating_mul(procs_per_node as u64);
            match pool.claim(aggregate, ClaimMode::Hard) {
                Ok(()) => {
                    let id = pool.register(CacheRecord::new(
                        basename.clone(),
                        CachePurpose::Write,
                        CacheDuration::Temporal,
                        aggregate,
                        per_rank,
                        cache_dir.clone(),
                    ));
                    let stage_path = cache_dir
                        .clone()
                        .map(|dir| dir.join(format!("mmap-{rank}.dat")))
                        .unwrap_or_else(|| PathBuf::from(format!("{basename}-mmap-{rank}.dat")));
                    match backend.create_write_stage(&stage_path, per_rank) {
                        Ok(stage) => {
                            pipeline = Some(Arc::new(WritePipeline::new(
                                backend.clone(),
                                stage,
                                slow_store.clone(),
                                per_rank,
                            )));
                            write_cache_record_id = Some(id);
                        }
                        Err(err) => {
                            warn!(file = %basename, error = %err, "failed to create write stage, disabling write caching for this file");
                            pool.release(id);
                            write_enabled = false;
                        }
                    }
                }
                Err(err) => {
                    warn!(file = %basename, error = %err, "write-cache claim failed, falling back to pass-through writes");
                    write_enabled = false;
                }
            }
        }

        Self {
            path: path.to_path_buf(),
            pool,
            backend,
            slow_store,
            window_factory,
            read_enabled: config.mirror.read_cache_enabled,
            config,
            is_io_node,
            rank,
            cache_dir,
            write_cache_record_id,
            pipeline,
            write_enabled,
            datasets: Mutex::new(HashMap::new()),
        }
    }

    /// Open a dataset's Read Mirror. `enabled` lets a caller override the
    /// file's propagated read-cache flag for one dataset (flags propagate
    /// file → group → dataset, and any level may turn caching off for its
    /// children).
    pub fn open_dataset(
        &self,
        dataset: DatasetHandle,
        name: &str,
        shape: SampleShape,
        total_samples: u64,
        enabled: bool,
    ) -> Option<Arc<DatasetCache>> {
        if let Some(existing) = self.datasets.lock().get(&dataset) {
            return Some(existing.clone());
        }
        if !enabled {
            return None;
        }

        let rank = self.rank;
        let num_ranks = self.window_factory.num_ranks() as u32;
        let partition = vcache_mirror::SamplePartition::new(total_samples, num_ranks);
        let local_bytes = partition.samples_for_rank(rank) * shape.sample_bytes();

        if let Err(err) = self.pool.claim(local_bytes, ClaimMode::Hard) {
            warn!(dataset = name, error = %err, "read-mirror claim failed, falling back to pass-through reads");
            return None;
        }

        let mirror_path = self
            .cache_dir
            .as_ref()
            .map(|dir| dir.join(name).join(format!("dset-mmap-{rank}.dat")));

        // Register before the backend call so a failure can release the
        // claim through the normal (registered) path rather than leaking
        // it: `StoragePool::release` only returns bytes for a cache it
        // knows about.
        let cache_record_id = self.pool.register(CacheRecord::new(
            name,
            CachePurpose::Read,
            CacheDuration::Temporal,
            local_bytes,
            local_bytes,
            mirror_path.clone(),
        ));

        let resolved_path = mirror_path.clone().unwrap_or_else(|| PathBuf::from(name));

        let mirror_handle = match self.backend.create_read_mirror(&resolved_path, local_bytes) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(dataset = name, error = %err, "failed to create read-mirror backing storage");
                self.pool.release(cache_record_id);
                return None;
            }
        };

        let window = self.window_factory.create_window(local_bytes);
        let mirror = Arc::new(ReadMirror::new(
            dataset,
            shape,
            total_samples,
            window,
            self.config.mirror.prefetch_block_bytes,
        ));

        // A file-mmap-backed mirror hands its handle to the mirror itself
        // so `remap()` can unmap/reopen/remap it later; every other
        // backend keeps the handle here, same as before.
        let mirror_handle_storage = if self.pool.kind == BackendKind::FileMmap {
            mirror.enable_remap(self.backend.clone(), mirror_handle, resolved_path, local_bytes);
            None
        } else {
            Some(mirror_handle)
        };

        let entry = Arc::new(DatasetCache {
            mirror,
            cache_record_id,
            mirror_handle: Mutex::new(mirror_handle_storage),
            read_enabled: true,
        });
        self.datasets.lock().insert(dataset, entry.clone());
        info!(dataset = name, bytes = local_bytes, "read mirror opened");
        Some(entry)
    }

    pub fn dataset(&self, dataset: DatasetHandle) -> Option<Arc<DatasetCache>> {
        self.datasets.lock().get(&dataset).cloned()
    }

    /// Destroys the dataset's read mirror and releases its storage claim.
    pub fn close_dataset(&self, dataset: DatasetHandle) {
        if let Some(entry) = self.datasets.lock().remove(&dataset) {
            let handle = entry
                .mirror_handle
                .lock()
                .take()
                .or_else(|| entry.mirror.take_remap_handle().map(|(_, handle)| handle));
            if let Some(handle) = handle {
                if let Err(err) = self.backend.destroy_read_mirror(handle) {
                    warn!(dataset, error = %err, "failed to destroy read-mirror backing storage");
                }
            }
            self.pool.release(entry.cache_record_id);
        }
    }

    /// Flushes the write pipeline to completion, releases the cache
    /// record, and closes every dataset's read mirror. Stage/comm
    /// teardown is left to `Drop` (the `StageHandle`/window are freed
    /// when their `Arc`s drop); this method performs the ordered
    /// flush-then-release.
    pub fn close(&self) -> Result<(), CacheError> {
        if let Some(pipeline) = &self.pipeline {
            pipeline.flush_all()?;
        }
        if let Some(id) = self.write_cache_record_id {
            self.pool.release(id);
        }
        let datasets: Vec<DatasetHandle> = self.datasets.lock().keys().copied().collect();
        for dataset in datasets {
            self.close_dataset(dataset);
        }
        Ok(())
    }

    pub fn is_io_node(&self) -> bool {
        self.is_io_node
    }
}
