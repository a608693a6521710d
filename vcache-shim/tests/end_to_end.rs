//! Cross-crate walkthroughs that exercise the full
//! config → backend → pool → pipeline/mirror → shim stack together,
//! rather than any one crate's internals in isolation.

use std::path::Path;
use std::sync::Arc;

use vcache_core::{AppConfig, BackendKind, ReplacementPolicy, Selection, TransferProperties, TypeDescriptor};
use vcache_mirror::local::{LocalRmaFabric, LocalWindowFactory};
use vcache_mirror::{Batch, SampleShape, SlowStoreReader, WindowFactory};
use vcache_shim::{CacheFlags, InMemorySlowStore, InterposingShim};
use vcache_storage::{FileMmapBackend, RamBackend, StorageBackend, StoragePool};

fn single_rank_shim(cfg: AppConfig) -> (InterposingShim, Arc<InMemorySlowStore>) {
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
    let shim = InterposingShim::new(cfg, pool, backend, store.clone(), reader, window_factory, true, 1);
    (shim, store)
}

/// Write caching on, read caching on: bytes written through the pipeline
/// land at the slow store, and a freshly opened read mirror serves the
/// same dataset's content back once its single-rank partition is fully
/// cached.
#[test]
fn write_then_read_round_trip_through_the_shim() {
    let mut cfg = AppConfig::default();
    cfg.pipeline.write_cache_enabled = true;
    cfg.mirror.read_cache_enabled = true;
    let (shim, store) = single_rank_shim(cfg);

    let file = shim.open_file(Path::new("round_trip.h5"));
    let elem = TypeDescriptor::new(4);
    let write_sel = Selection::contiguous(0, 8);
    let payload: Vec<u8> = (0u8..32).collect();

    shim.write(
        file,
        1,
        CacheFlags::new(false, true),
        elem,
        write_sel.clone(),
        write_sel,
        TransferProperties::default(),
        &payload,
    )
    .unwrap();
    shim.close_dataset(file, 1).unwrap();
    assert_eq!(store.dataset_bytes(1), payload);

    let shape = SampleShape {
        dims: 1,
        elements_per_sample: 8,
        bytes_per_element: 4,
    };
    let read_flags = shim.open_dataset(file, None, 1, "d1", shape, 1, Some(CacheFlags::new(true, false)));
    assert!(read_flags.read);

    let batch = Batch::new(vec![0]);
    let mut dst = vec![0u8; shape.sample_bytes() as usize];
    let file_sel = Selection::contiguous(0, shape.elements_per_sample);
    shim.read(file, 1, read_flags, &batch, &file_sel, elem, &mut dst).unwrap();
    assert_eq!(dst, payload);

    shim.close_dataset(file, 1).unwrap();
    shim.close_file(file).unwrap();
}

/// A per-rank write buffer too small for even one batch forces the
/// pipeline's synchronous fallback: the write still lands correctly,
/// just without ever touching the stage.
#[test]
fn write_larger_than_stage_falls_back_to_direct_write() {
    let mut cfg = AppConfig::default();
    cfg.pipeline.write_cache_enabled = true;
    cfg.storage.write_buffer_size = 4096;
    let (shim, store) = single_rank_shim(cfg);

    let file = shim.open_file(Path::new("overflow.h5"));
    let elem = TypeDescriptor::new(4);
    let sel = Selection::contiguous(0, 4096);
    let payload = vec![7u8; 16384];

    shim.write(
        file,
        9,
        CacheFlags::new(false, true),
        elem,
        sel.clone(),
        sel,
        TransferProperties::default(),
        &payload,
    )
    .unwrap();
    shim.close_dataset(file, 9).unwrap();
    shim.close_file(file).unwrap();

    assert_eq!(store.dataset_bytes(9), payload);
}

/// Two ranks opening the same file concurrently each get their own
/// rank-numbered stage file on disk, so neither rank's write stage
/// clobbers the other's.
#[test]
fn two_ranks_open_the_same_file_without_colliding_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let backend: Arc<dyn StorageBackend> = Arc::new(FileMmapBackend::default());
    let fabric = LocalRmaFabric::new(2, 1 << 20);

    let mut cfg = AppConfig::default();
    cfg.pipeline.write_cache_enabled = true;
    cfg.storage.write_buffer_size = 4096;

    let mut dataset_bytes = Vec::new();
    for rank in 0..2u32 {
        let pool = Arc::new(StoragePool::new(
            BackendKind::FileMmap,
            Some(dir.path().to_path_buf()),
            1 << 30,
            ReplacementPolicy::Lru,
            true,
            backend.clone(),
        ));
        let store = Arc::new(InMemorySlowStore::new());
        let window_factory: Arc<dyn WindowFactory> =
            Arc::new(LocalWindowFactory::new(fabric.clone(), rank as i32));
        let reader: Arc<dyn SlowStoreReader> = store.clone();
        let shim = InterposingShim::new(
            cfg.clone(),
            pool,
            backend.clone(),
            store.clone(),
            reader,
            window_factory,
            true,
            2,
        );

        let file = shim.open_file(Path::new("shared.h5"));
        let elem = TypeDescriptor::new(4);
        let sel = Selection::contiguous(0, 4);
        let payload: Vec<u8> = vec![rank as u8; 16];
        shim.write(
            file,
            1,
            CacheFlags::new(false, true),
            elem,
            sel.clone(),
            sel,
            TransferProperties::default(),
            &payload,
        )
        .unwrap();
        shim.close_dataset(file, 1).unwrap();
        shim.close_file(file).unwrap();
        dataset_bytes.push(store.dataset_bytes(1));
    }

    assert_eq!(dataset_bytes[0], vec![0u8; 16]);
    assert_eq!(dataset_bytes[1], vec![1u8; 16]);

    let cache_dir = dir.path().join("shared.h5-cache");
    assert!(cache_dir.join("mmap-0.dat").exists());
    assert!(cache_dir.join("mmap-1.dat").exists());
}
