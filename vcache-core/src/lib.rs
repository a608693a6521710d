//! Shared types, error taxonomy, and configuration for the staging cache
//! that sits between an application's array I/O and the slow parallel file
//! system. `vcache-storage`, `vcache-pipeline`, `vcache-mirror`, and
//! `vcache-shim` all depend on this crate for ids, the `Selection`
//! run-list contract, `CacheError`, and `AppConfig`.

mod config;
mod error;
mod logging;
mod types;

pub use config::*;
pub use error::*;
pub use logging::*;
pub use types::*;
