//! The Interposing Shim: the public façade an application's
//! array-create/open/read/write/close calls land on. It decides, per
//! object, whether caching is enabled and routes to the Write Pipeline or
//! Read Mirror accordingly; everything else is forwarded straight to the
//! slow store.
//!
//! `vcache-shim` is also where the File Cache lives, since the shim is the
//! only thing that ever constructs one.

mod file_cache;
mod memory_store;

pub use file_cache::{DatasetCache, FileCache};
pub use memory_store::InMemorySlowStore;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::info;

use vcache_core::AppConfig;
use vcache_mirror::{Batch, MirrorState, SampleShape, SlowStoreReader, WindowFactory};
use vcache_pipeline::{DatasetHandle, SlowStore};
use vcache_storage::{StorageBackend, StoragePool};

pub type FileHandle = u64;
pub type GroupHandle = u64;

/// Read/write cache-enable flags a file, group, or dataset carries.
/// Propagated parent-to-child: file → group → dataset, on every
/// create/open. A child can only narrow its parent's flags, never widen
/// them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheFlags {
    pub read: bool,
    pub write: bool,
}

impl CacheFlags {
    pub fn new(read: bool, write: bool) -> Self {
        Self { read, write }
    }

    /// Resolve this (parent's) flags against an optional override
    /// requested at the child's create/open call. `None` means "inherit
    /// exactly"; `Some` ANDs the override against the parent so a child
    /// can turn caching off but never on behind its parent's back.
    fn resolve_child(self, override_flags: Option<CacheFlags>) -> CacheFlags {
        match override_flags {
            None => self,
            Some(o) => CacheFlags {
                read: self.read && o.read,
                write: self.write && o.write,
            },
        }
    }
}

struct OpenFile {
    cache: Arc<FileCache>,
    flags: CacheFlags,
    groups: Mutex<HashMap<GroupHandle, CacheFlags>>,
    /// Datasets the application asked to close while
    /// `HDF5_CACHE_DCLOSE_DELAY=yes` held them open. Released for real
    /// when the owning file closes.
    deferred_closes: Mutex<Vec<DatasetHandle>>,
}

/// The public façade. One `InterposingShim` wraps one configured storage
/// pool and routes every file/dataset operation an application performs
/// through it.
pub struct InterposingShim {
    config: AppConfig,
    pool: Arc<StoragePool>,
    backend: Arc<dyn StorageBackend>,
    slow_store: Arc<dyn SlowStore>,
    reader: Arc<dyn SlowStoreReader>,
    window_factory: Arc<dyn WindowFactory>,
    is_io_node: bool,
    procs_per_node: u32,
    files: DashMap<FileHandle, OpenFile>,
    next_file: AtomicU64,
    next_group: AtomicU64,
}

impl InterposingShim {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AppConfig,
        pool: Arc<StoragePool>,
        backend: Arc<dyn StorageBackend>,
        slow_store: Arc<dyn SlowStore>,
        reader: Arc<dyn SlowStoreReader>,
        window_factory: Arc<dyn WindowFactory>,
        is_io_node: bool,
        procs_per_node: u32,
    ) -> Self {
        Self {
            config,
            pool,
            backend,
            slow_store,
            reader,
            window_factory,
            is_io_node,
            procs_per_node,
            files: DashMap::new(),
            next_file: AtomicU64::new(1),
            next_group: AtomicU64::new(1),
        }
    }

    /// Open (or create) `path` with caching requested at the top-level
    /// flags `cfg` names. The returned handle is the root of the
    /// file → group → dataset flag-propagation chain.
    pub fn open_file(&self, path: &Path) -> FileHandle {
        let flags = CacheFlags::new(
            self.config.mirror.read_cache_enabled,
            self.config.pipeline.write_cache_enabled,
        );
        let cache = FileCache::open(
            path,
            self.config.clone(),
            self.pool.clone(),
            self.backend.clone(),
            self.slow_store.clone(),
            self.window_factory.clone(),
            self.is_io_node,
            self.procs_per_node,
            self.window_factory.rank() as u32,
        );
        let handle = self.next_file.fetch_add(1, Ordering::SeqCst);
        info!(file = %path.display(), handle, read = flags.read, write = flags.write, "file opened");
        self.files.insert(
            handle,
            OpenFile {
                cache: Arc::new(cache),
                flags,
                groups: Mutex::new(HashMap::new()),
                deferred_closes: Mutex::new(Vec::new()),
            },
        );
        handle
    }

    /// Open (or create) a group under `file`, inheriting its flags unless
    /// `override_flags` narrows them.
    pub fn open_group(&self, file: FileHandle, override_flags: Option<CacheFlags>) -> GroupHandle {
        let open_file = self.files.get(&file).expect("unknown file handle");
        let resolved = open_file.flags.resolve_child(override_flags);
        let handle = self.next_group.fetch_add(1, Ordering::SeqCst);
        open_file.groups.lock().insert(handle, resolved);
        handle
    }

    fn group_flags(open_file: &OpenFile, group: Option<GroupHandle>) -> CacheFlags {
        match group {
            Some(g) => *open_file
                .groups
                .lock()
                .get(&g)
                .expect("unknown group handle"),
            None => open_file.flags,
        }
    }

    /// Open (or create) a dataset, resolving its effective cache flags
    /// from its group (or file, if opened outside any group) and its own
    /// override, and, if read caching ends up enabled, standing up a
    /// Read Mirror for it.
    #[allow(clippy::too_many_arguments)]
    pub fn open_dataset(
        &self,
        file: FileHandle,
        group: Option<GroupHandle>,
        dataset: DatasetHandle,
        name: &str,
        shape: SampleShape,
        total_samples: u64,
        override_flags: Option<CacheFlags>,
    ) -> CacheFlags {
        let open_file = self.files.get(&file).expect("unknown file handle");
        let parent = Self::group_flags(&open_file, group);
        let effective = parent.resolve_child(override_flags);

        if effective.read {
            open_file
                .cache
                .open_dataset(dataset, name, shape, total_samples, true);
        }

        if self.config.mirror.prefetch_at_open && effective.read {
            if let Some(entry) = open_file.cache.dataset(dataset) {
                let requests = entry.mirror.prefetch(self.reader.clone());
                if let Err(err) = entry.mirror.prefetch_wait(requests) {
                    tracing::warn!(dataset = name, error = %err, "prefetch-at-open failed");
                }
            }
        }

        effective
    }

    /// Enqueue onto the write pipeline when write caching is on for
    /// this dataset, otherwise write straight through to the slow store.
    pub fn write(
        &self,
        file: FileHandle,
        dataset: DatasetHandle,
        flags: CacheFlags,
        mem_type: vcache_core::TypeDescriptor,
        mem_sel: vcache_core::Selection,
        file_sel: vcache_core::Selection,
        xfer_props: vcache_core::TransferProperties,
        src: &[u8],
    ) -> anyhow::Result<()> {
        let open_file = self.files.get(&file).expect("unknown file handle");
        if flags.write {
            if let Some(pipeline) = &open_file.cache.pipeline {
                pipeline.write(dataset, mem_type, mem_sel, file_sel, xfer_props, src)?;
                return Ok(());
            }
        }
        self.slow_store.write_direct(dataset, src)?;
        Ok(())
    }

    /// If the dataset's mirror is fully cached, serve from it with
    /// `read_from_cache`; if read caching is on but not yet fully cached,
    /// `read_to_cache` does both the real read and the staging; otherwise
    /// pass straight through to the slow store.
    pub fn read(
        &self,
        file: FileHandle,
        dataset: DatasetHandle,
        flags: CacheFlags,
        batch: &Batch,
        file_sel: &vcache_core::Selection,
        elem: vcache_core::TypeDescriptor,
        dst: &mut [u8],
    ) -> anyhow::Result<()> {
        let open_file = self.files.get(&file).expect("unknown file handle");
        if flags.read {
            if let Some(entry) = open_file.cache.dataset(dataset) {
                if !entry.mirror.is_disabled() {
                    return if entry.mirror.state() == MirrorState::FullyCached {
                        entry.mirror.read_from_cache(batch, dst).map_err(Into::into)
                    } else {
                        entry
                            .mirror
                            .read_to_cache(self.reader.as_ref(), batch, file_sel, dst)
                            .map_err(Into::into)
                    };
                }
            }
        }
        self.reader.read(dataset, file_sel, elem, dst)?;
        Ok(())
    }

    /// Trigger the mirror's prefetch when read caching is on, otherwise a
    /// no-op pass-through.
    pub fn prefetch(&self, file: FileHandle, dataset: DatasetHandle, flags: CacheFlags) -> anyhow::Result<()> {
        if !flags.read {
            return Ok(());
        }
        let open_file = self.files.get(&file).expect("unknown file handle");
        if let Some(entry) = open_file.cache.dataset(dataset) {
            let requests = entry.mirror.prefetch(self.reader.clone());
            entry.mirror.prefetch_wait(requests)?;
        }
        Ok(())
    }

    pub fn pause(&self, file: FileHandle) {
        if let Some(pipeline) = &self.files.get(&file).expect("unknown file handle").cache.pipeline {
            pipeline.pause();
        }
    }

    pub fn resume(&self, file: FileHandle) {
        if let Some(pipeline) = &self.files.get(&file).expect("unknown file handle").cache.pipeline {
            pipeline.resume();
        }
    }

    /// Flushes the write pipeline for this dataset, then releases its
    /// read mirror and cache-pool claim. `HDF5_CACHE_DCLOSE_DELAY=yes`
    /// defers the actual release until the file closes.
    pub fn close_dataset(&self, file: FileHandle, dataset: DatasetHandle) -> anyhow::Result<()> {
        let open_file = self.files.get(&file).expect("unknown file handle");
        if let Some(pipeline) = &open_file.cache.pipeline {
            pipeline.flush(dataset)?;
        }
        if self.config.pipeline.dclose_delay {
            open_file.deferred_closes.lock().push(dataset);
        } else {
            open_file.cache.close_dataset(dataset);
        }
        Ok(())
    }

    /// Flushes and releases all write-pipeline state for this file;
    /// every dataset deferred under `dclose_delay` is released here too.
    pub fn close_file(&self, file: FileHandle) -> anyhow::Result<()> {
        let (_, open_file) = self.files.remove(&file).expect("unknown file handle");
        for dataset in open_file.deferred_closes.into_inner() {
            open_file.cache.close_dataset(dataset);
        }
        open_file.cache.close()?;
        info!(handle = file, "file closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use vcache_core::{BackendKind, ReplacementPolicy, Selection, TransferProperties, TypeDescriptor};
    use vcache_mirror::local::{LocalRmaFabric, LocalWindowFactory};
    use vcache_storage::RamBackend;

    fn shim(cfg: AppConfig) -> (InterposingShim, Arc<InMemorySlowStore>) {
        let backend: Arc<dyn StorageBackend> = Arc::new(RamBackend::default());
        let pool = Arc::new(StoragePool::new(
            BackendKind::Ram,
            None,
            1 << 30,
            ReplacementPolicy::Lru,
            true,
            backend.clone(),
        ));
        let store = Arc::new(InMemorySlowStore::new());
        let fabric = LocalRmaFabric::new(1, 1 << 20);
        let window_factory: Arc<dyn WindowFactory> = Arc::new(LocalWindowFactory::new(fabric, 0));
        let reader: Arc<dyn SlowStoreReader> = store.clone();
        let slow_store: Arc<dyn SlowStore> = store.clone();
        (
            InterposingShim::new(cfg, pool, backend, slow_store, reader, window_factory, true, 1),
            store,
        )
    }

    /// Single-rank write-through: every write lands at the slow store
    /// after the dataset is flushed.
    #[test]
    fn single_rank_write_through_lands_at_slow_store() {
        let mut cfg = AppConfig::default();
        cfg.pipeline.write_cache_enabled = true;
        let (shim, store) = shim(cfg);

        let file = shim.open_file(Path::new("run.h5"));
        let flags = CacheFlags::new(false, true);
        let elem = TypeDescriptor::new(4);
        let sel = Selection::contiguous(0, 4);
        let src: Vec<u8> = (0u8..16).collect();

        shim.write(file, 1, flags, elem, sel.clone(), sel, TransferProperties::default(), &src)
            .unwrap();
        shim.close_dataset(file, 1).unwrap();
        shim.close_file(file).unwrap();

        assert_eq!(store.dataset_bytes(1), src);
    }

    /// Write caching disabled: the shim forwards straight to the slow
    /// store with no staging at all.
    #[test]
    fn write_cache_disabled_passes_through() {
        let cfg = AppConfig::default();
        let (shim, store) = shim(cfg);
        let file = shim.open_file(Path::new("run.h5"));
        let flags = CacheFlags::default();
        let elem = TypeDescriptor::new(4);
        let sel = Selection::contiguous(0, 4);
        let src: Vec<u8> = (0u8..16).collect();

        shim.write(file, 2, flags, elem, sel.clone(), sel, TransferProperties::default(), &src)
            .unwrap();
        assert_eq!(store.dataset_bytes(2), src);
    }

    /// `HDF5_CACHE_DCLOSE_DELAY=yes`: a dataset closed mid-file stays
    /// registered with the LSM until the file itself closes.
    #[test]
    fn dclose_delay_defers_release_to_file_close() {
        let mut cfg = AppConfig::default();
        cfg.mirror.read_cache_enabled = true;
        cfg.pipeline.dclose_delay = true;
        let (shim, _store) = shim(cfg);

        let file = shim.open_file(Path::new("run.h5"));
        let shape = SampleShape {
            dims: 1,
            elements_per_sample: 2,
            bytes_per_element: 4,
        };
        let flags = shim.open_dataset(file, None, 1, "d0", shape, 4, None);
        assert!(flags.read);

        shim.close_dataset(file, 1).unwrap();
        // Still registered: dclose_delay holds the release until file
        // close, so a second lookup-by-dataset still finds the mirror.
        assert!(shim.files.get(&file).unwrap().cache.dataset(1).is_some());

        shim.close_file(file).unwrap();
    }

    /// Child datasets can only narrow a parent's flags, never widen them.
    #[test]
    fn dataset_override_can_only_narrow_parent_flags() {
        let mut cfg = AppConfig::default();
        cfg.mirror.read_cache_enabled = false;
        let (shim, _store) = shim(cfg);
        let file = shim.open_file(Path::new("run.h5"));
        let shape = SampleShape {
            dims: 1,
            elements_per_sample: 1,
            bytes_per_element: 4,
        };
        let flags = shim.open_dataset(
            file,
            None,
            1,
            "d0",
            shape,
            4,
            Some(CacheFlags::new(true, true)),
        );
        assert!(!flags.read, "a dataset override cannot enable what the file disabled");
    }
}
