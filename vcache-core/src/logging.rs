//! Structured logging setup, gated by `IO_NODE` and `HDF5_CACHE_DEBUG`.
//!
//! Only the configured I/O-node rank is meant to emit file-system-affecting
//! log lines; every rank may still log, but the shim checks `is_io_node`
//! before logging storage-affecting operations. This module only owns
//! translating the verbosity knob into a `tracing_subscriber` filter, plus
//! stamping every event with the emitting rank.

use tracing_subscriber::EnvFilter;

/// `HDF5_CACHE_DEBUG`/`HDF5_CACHE_LOG` verbosity levels.
fn level_directive(level: u8) -> &'static str {
    match level {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Install a global `tracing` subscriber whose verbosity tracks
/// `debug_level` (0-3) unless `RUST_LOG` is already set, in which case the
/// environment wins. Call once at process startup.
///
/// Returns a guard that stamps `rank` onto every event logged for as long
/// as it stays in scope, via the json formatter's current-span fields:
/// tracing_subscriber doesn't carry MPI rank on its own, so the caller
/// must hold this guard for the life of the process (typically by binding
/// it in `main`).
pub fn init_tracing(debug_level: u8, rank: i32) -> tracing::span::EnteredSpan {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(debug_level)));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::debug!("tracing subscriber already installed, skipping");
    }

    tracing::info_span!("rank", rank).entered()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_escalates_with_level() {
        assert_eq!(level_directive(0), "warn");
        assert_eq!(level_directive(3), "trace");
        assert_eq!(level_directive(99), "trace");
    }
}
