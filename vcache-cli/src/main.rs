//! `vcache-cli`: config-file validation plus a thin write-throughput
//! benchmark. Kept deliberately small: the real array-file library and
//! its MPI job launcher own argument parsing and batch scheduling; this
//! binary only exercises the staging layer in isolation, as tooling
//! rather than core logic.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use vcache_core::{AppConfig, Selection, TransferProperties, TypeDescriptor};
use vcache_pipeline::WritePipeline;
use vcache_shim::InMemorySlowStore;
use vcache_storage::{backend_for, StorageBackend};

#[derive(Parser)]
#[command(name = "vcache-cli", about = "Validate vcache config files and benchmark write staging")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a config file the same way the shim would and print the
    /// resolved settings, catching malformed keys before a real job runs.
    Validate {
        /// Path to the flat `KEY VALUE` config file.
        config: PathBuf,
    },
    /// Drive a synthetic write-only workload through a `WritePipeline`
    /// backed by an in-memory stage and slow store, reporting throughput.
    Benchmark {
        /// Number of writes to issue.
        #[arg(long, default_value_t = 1000)]
        writes: u64,
        /// Bytes per write.
        #[arg(long, default_value_t = 65536)]
        bytes_per_write: u64,
        /// Per-rank stage size in bytes.
        #[arg(long, default_value_t = 64 << 20)]
        stage_bytes: u64,
    },
}

fn main() -> Result<()> {
    let _tracing_guard = tracing_subscriber_init();
    let cli = Cli::parse();
    match cli.command {
        Command::Validate { config } => validate(&config),
        Command::Benchmark {
            writes,
            bytes_per_write,
            stage_bytes,
        } => benchmark(writes, bytes_per_write, stage_bytes),
    }
}

fn tracing_subscriber_init() -> tracing::span::EnteredSpan {
    vcache_core::logging::init_tracing(1, 0)
}

fn validate(config: &PathBuf) -> Result<()> {
    let cfg = AppConfig::load(Some(config.as_path()))?;
    println!("{}", cfg.to_json_pretty()?);
    info!(path = %config.display(), "config file validated");
    Ok(())
}

fn benchmark(writes: u64, bytes_per_write: u64, stage_bytes: u64) -> Result<()> {
    let backend: Arc<dyn StorageBackend> = backend_for(
        vcache_core::BackendKind::Ram,
        vcache_core::StorageScope::Local,
    );
    let stage = backend.create_write_stage(std::path::Path::new("/unused"), stage_bytes)?;
    let slow_store = Arc::new(InMemorySlowStore::new());
    let pipeline = WritePipeline::new(backend, stage, slow_store, stage_bytes);

    let elem = TypeDescriptor::new(4);
    let elements = bytes_per_write / elem.element_size.max(1);
    let sel = Selection::contiguous(0, elements);
    let payload = vec![0u8; bytes_per_write as usize];

    let start = Instant::now();
    for _ in 0..writes {
        pipeline.write(1, elem, sel.clone(), sel.clone(), TransferProperties::default(), &payload)?;
    }
    pipeline.flush_all()?;
    let elapsed = start.elapsed();

    let total_bytes = writes * bytes_per_write;
    let mib_per_sec = (total_bytes as f64 / (1 << 20) as f64) / elapsed.as_secs_f64().max(1e-9);
    println!(
        "{writes} writes, {bytes_per_write} bytes each, {total_bytes} bytes total in {elapsed:?} ({mib_per_sec:.1} MiB/s)"
    );
    Ok(())
}
