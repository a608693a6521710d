//! `vcache-demo`: a single-process, single-rank walkthrough of the staging
//! cache, wiring the five component crates together the way an MPI job's
//! rank 0 would after the communicator split and I/O-node election (both
//! someone else's responsibility, out of scope here) have already happened.
//!
//! Real deployments plug the array-file library's actual slow store and a
//! real `mpi`-backed window factory behind the same traits; this binary
//! uses the in-process stand-ins (`vcache_shim::InMemorySlowStore`,
//! `vcache_mirror::local`) so it runs anywhere without `mpirun`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use vcache_core::AppConfig;
use vcache_core::{Selection, TransferProperties, TypeDescriptor};
use vcache_mirror::local::{LocalRmaFabric, LocalWindowFactory};
use vcache_mirror::{Batch, SampleShape, SlowStoreReader, WindowFactory};
use vcache_shim::{CacheFlags, InMemorySlowStore, InterposingShim};
use vcache_storage::{backend_for, StorageBackend, StoragePool};

fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = AppConfig::load(config_path.as_deref())?;

    let _tracing_guard = vcache_core::logging::init_tracing(cfg.debug_level, cfg.io_node);
    info!(config = %cfg.to_json_pretty()?, "vcache-demo starting with effective configuration");

    let backend_kind = cfg.storage.storage_type.resolve_backend(cfg.storage.scope);
    let backend: Arc<dyn StorageBackend> = backend_for(backend_kind, cfg.storage.scope);
    let pool = Arc::new(StoragePool::new(
        backend_kind,
        Some(cfg.storage.path.clone()),
        cfg.storage.size_bytes,
        cfg.storage.replacement_policy,
        cfg.io_node == 0,
        backend.clone(),
    ));

    let slow_store = Arc::new(InMemorySlowStore::new());
    let fabric = LocalRmaFabric::new(1, 1 << 20);
    let window_factory: Arc<dyn WindowFactory> = Arc::new(LocalWindowFactory::new(fabric, 0));

    let shim = InterposingShim::new(
        cfg.clone(),
        pool,
        backend,
        slow_store.clone(),
        slow_store.clone() as Arc<dyn SlowStoreReader>,
        window_factory,
        cfg.io_node == 0,
        1,
    );

    run_demo(&shim, &slow_store, &cfg)?;

    info!("vcache-demo finished");
    Ok(())
}

/// Open a file with write caching on, write a dataset, close it, and
/// confirm the bytes landed at the slow store once the flush on close
/// completed.
fn run_demo(shim: &InterposingShim, slow_store: &InMemorySlowStore, cfg: &AppConfig) -> Result<()> {
    let file = shim.open_file(std::path::Path::new("demo.h5"));
    info!(file, "opened demo.h5");

    let write_flags = CacheFlags::new(false, cfg.pipeline.write_cache_enabled);
    let elem = TypeDescriptor::new(4);
    let sel = Selection::contiguous(0, 8);
    let payload: Vec<u8> = (0u8..32).collect();

    shim.write(
        file,
        1,
        write_flags,
        elem,
        sel.clone(),
        sel,
        TransferProperties::default(),
        &payload,
    )?;
    shim.close_dataset(file, 1)?;
    info!(bytes = payload.len(), "wrote and flushed dataset 1");

    let shape = SampleShape {
        dims: 1,
        elements_per_sample: 8,
        bytes_per_element: 4,
    };
    let read_flags = shim.open_dataset(file, None, 2, "d2", shape, 4, None);
    if read_flags.read {
        shim.prefetch(file, 2, read_flags)?;
        let batch = Batch::new(vec![0, 1, 2, 3]);
        let mut dst = vec![0u8; shape.sample_bytes() as usize * batch.samples.len()];
        let file_sel = Selection::contiguous(0, shape.elements_per_sample * batch.samples.len() as u64);
        shim.read(file, 2, read_flags, &batch, &file_sel, elem, &mut dst)?;
        info!(bytes = dst.len(), "prefetched and read dataset 2 back from the mirror");
        shim.close_dataset(file, 2)?;
    } else {
        info!("read caching disabled, dataset 2 left untouched");
    }

    shim.close_file(file)?;
    info!(bytes = slow_store.dataset_bytes(1).len(), "demo.h5 closed");
    Ok(())
}
