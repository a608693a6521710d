//! `AppConfig`: the config-file + environment-variable layer. Precedence
//! (lowest to highest): built-in defaults, the config file, environment
//! variables. `vcache-cli` applies a further CLI layer on top by
//! constructing an `AppConfig` and overwriting individual fields from
//! parsed flags before handing it to the shim.

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::{ReplacementPolicy, StorageScope};

/// `HDF5_CACHE_STORAGE_TYPE`: the legacy storage-type vocabulary the config
/// file speaks, distinct from the backend-capability `BackendKind` a pool
/// actually instantiates (`global` scope can pair with any of these).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageType {
    Ssd,
    BurstBuffer,
    Memory,
    Gpu,
}

impl StorageType {
    /// Resolve the concrete backend a pool should instantiate, folding in
    /// scope: `global` scope always swaps in the shared-file backend
    /// regardless of the underlying storage-type tag.
    pub fn resolve_backend(self, scope: StorageScope) -> crate::types::BackendKind {
        use crate::types::BackendKind;
        if scope == StorageScope::Global {
            return BackendKind::Global;
        }
        match self {
            StorageType::Ssd | StorageType::BurstBuffer => BackendKind::FileMmap,
            StorageType::Memory => BackendKind::Ram,
            StorageType::Gpu => BackendKind::Device,
        }
    }
}

/// Storage-pool configuration: `HDF5_CACHE_STORAGE_*` config-file keys plus
/// the legacy `SSD_PATH`/`SSD_SIZE` environment overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub storage_type: StorageType,
    pub scope: StorageScope,
    pub replacement_policy: ReplacementPolicy,
    pub write_buffer_size: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/tmp/vcache"),
            size_bytes: 1 << 30,
            storage_type: StorageType::Ssd,
            scope: StorageScope::Local,
            replacement_policy: ReplacementPolicy::Lru,
            write_buffer_size: 64 << 20,
        }
    }
}

/// Write-pipeline configuration: `HDF5_CACHE_WR`, `HDF5_ASYNC_DELAY_TIME`,
/// `HDF5_CACHE_DCLOSE_DELAY`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub write_cache_enabled: bool,
    pub async_delay_time_micros: u64,
    /// `HDF5_CACHE_DCLOSE_DELAY=yes`: defer a dataset's effective close
    /// until the owning file closes.
    pub dclose_delay: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            write_cache_enabled: false,
            async_delay_time_micros: 0,
            dclose_delay: false,
        }
    }
}

/// Read-mirror configuration: `HDF5_CACHE_RD`, `DATASET_PREFETCH_AT_OPEN`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    pub read_cache_enabled: bool,
    pub prefetch_at_open: bool,
    /// Threshold above which `prefetch` splits into sub-blocks, default
    /// 1 GiB.
    pub prefetch_block_bytes: u64,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            read_cache_enabled: false,
            prefetch_at_open: false,
            prefetch_block_bytes: 1 << 30,
        }
    }
}

/// The full config tree handed to the File Cache / Interposing Shim at
/// startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// `IO_NODE`: which node-local rank performs file-system-affecting
    /// operations (stage creation, purge-folder) and emits log lines.
    pub io_node: i32,
    /// `HDF5_CACHE_DEBUG` / `HDF5_CACHE_LOG`: 0-3 verbosity, translated
    /// into a `tracing_subscriber::EnvFilter` directive by the caller.
    pub debug_level: u8,
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
    pub mirror: MirrorConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            io_node: 0,
            debug_level: 0,
            storage: StorageConfig::default(),
            pipeline: PipelineConfig::default(),
            mirror: MirrorConfig::default(),
        }
    }
}

impl AppConfig {
    /// Render the effective config as pretty JSON, for the startup log line
    /// every rank emits once it has finished layering file and environment
    /// overrides.
    pub fn to_json_pretty(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load defaults, overlay a config file if one is given and exists,
    /// then overlay environment-variable overrides. CLI flags are applied
    /// by the caller (`vcache-cli`) after this returns, so they win over
    /// everything here.
    pub fn load(config_path: Option<&Path>) -> anyhow::Result<Self> {
        let mut cfg = Self::default();

        if let Some(path) = config_path {
            if path.exists() {
                cfg.apply_config_file(path)?;
            }
        }

        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// The config file is a flat `KEY VALUE` text format, one key per
    /// line; parsed with the `config` crate's Ini reader since Ini is the
    /// closest built-in format to "flat key=value lines".
    fn apply_config_file(&mut self, path: &Path) -> anyhow::Result<()> {
        let raw = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Ini))
            .build()?;

        if let Ok(v) = raw.get_string("HDF5_CACHE_STORAGE_PATH") {
            self.storage.path = PathBuf::from(v);
        }
        if let Ok(v) = raw.get_int("HDF5_CACHE_STORAGE_SIZE") {
            self.storage.size_bytes = v as u64;
        }
        if let Ok(v) = raw.get_string("HDF5_CACHE_STORAGE_TYPE") {
            self.storage.storage_type = parse_storage_type(&v)?;
        }
        if let Ok(v) = raw.get_string("HDF5_CACHE_STORAGE_SCOPE") {
            self.storage.scope = parse_scope(&v)?;
        }
        if let Ok(v) = raw.get_string("HDF5_CACHE_REPLACEMENT_POLICY") {
            self.storage.replacement_policy = parse_policy(&v)?;
        }
        if let Ok(v) = raw.get_int("HDF5_CACHE_WRITE_BUFFER_SIZE") {
            self.storage.write_buffer_size = v as u64;
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Some(yes) = env_yes("HDF5_CACHE_WR") {
            self.pipeline.write_cache_enabled = yes;
        }
        if let Some(yes) = env_yes("HDF5_CACHE_RD") {
            self.mirror.read_cache_enabled = yes;
        }
        if let Some(level) = env_u8("HDF5_CACHE_DEBUG") {
            self.debug_level = level;
        } else if let Some(level) = env_u8("HDF5_CACHE_LOG") {
            self.debug_level = level;
        }
        if let Some(rank) = env::var("IO_NODE").ok().and_then(|v| v.parse().ok()) {
            self.io_node = rank;
        }
        if let Some(micros) = env::var("HDF5_ASYNC_DELAY_TIME")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.pipeline.async_delay_time_micros = micros;
        }
        if let Some(yes) = env_yes("HDF5_CACHE_DCLOSE_DELAY") {
            self.pipeline.dclose_delay = yes;
        }
        if let Some(yes) = env_yes("DATASET_PREFETCH_AT_OPEN") {
            self.mirror.prefetch_at_open = yes;
        }
        // Legacy overrides: SSD_PATH/SSD_SIZE win over everything else the
        // config file or newer env vars set.
        if let Ok(path) = env::var("SSD_PATH") {
            self.storage.path = PathBuf::from(path);
        }
        if let Some(gib) = env::var("SSD_SIZE").ok().and_then(|v| v.parse::<u64>().ok()) {
            self.storage.size_bytes = gib * (1 << 30);
        }
    }
}

fn env_yes(name: &str) -> Option<bool> {
    env::var(name).ok().map(|v| v.eq_ignore_ascii_case("yes"))
}

fn env_u8(name: &str) -> Option<u8> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

fn parse_storage_type(raw: &str) -> anyhow::Result<StorageType> {
    match raw.to_ascii_uppercase().as_str() {
        "SSD" => Ok(StorageType::Ssd),
        "BURST_BUFFER" => Ok(StorageType::BurstBuffer),
        "MEMORY" => Ok(StorageType::Memory),
        "GPU" => Ok(StorageType::Gpu),
        other => Err(anyhow::anyhow!("unknown HDF5_CACHE_STORAGE_TYPE: {other}")),
    }
}

fn parse_scope(raw: &str) -> anyhow::Result<StorageScope> {
    match raw.to_ascii_uppercase().as_str() {
        "LOCAL" => Ok(StorageScope::Local),
        "GLOBAL" => Ok(StorageScope::Global),
        other => Err(anyhow::anyhow!("unknown HDF5_CACHE_STORAGE_SCOPE: {other}")),
    }
}

fn parse_policy(raw: &str) -> anyhow::Result<ReplacementPolicy> {
    match raw.to_ascii_uppercase().as_str() {
        "LRU" => Ok(ReplacementPolicy::Lru),
        "LFU" => Ok(ReplacementPolicy::Lfu),
        "FIFO" => Ok(ReplacementPolicy::Fifo),
        other => Err(anyhow::anyhow!(
            "unknown HDF5_CACHE_REPLACEMENT_POLICY: {other}"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_disable_caching() {
        let cfg = AppConfig::default();
        assert!(!cfg.pipeline.write_cache_enabled);
        assert!(!cfg.mirror.read_cache_enabled);
    }

    #[test]
    fn effective_config_renders_as_json() {
        let cfg = AppConfig::default();
        let rendered = cfg.to_json_pretty().unwrap();
        assert!(rendered.contains("\"io_node\""));
    }

    #[test]
    fn global_scope_overrides_storage_type() {
        assert_eq!(
            StorageType::Ssd.resolve_backend(StorageScope::Global),
            crate::types::BackendKind::Global
        );
        assert_eq!(
            StorageType::Memory.resolve_backend(StorageScope::Local),
            crate::types::BackendKind::Ram
        );
    }
}
