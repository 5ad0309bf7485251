// src/listener.rs - Host notification surface
use std::collections::BTreeMap;

use crate::files::PrinterFileEntry;
use crate::state::ConnectionState;
use crate::telemetry::TemperatureReading;

/// Temperatures keyed by zone (`tool0`, `bed`, `chamber`).
pub type Temperatures = BTreeMap<String, TemperatureReading>;

/// Events the connector reports to its host. Every method defaults to a no-op.
///
/// Calls arrive on the device callback thread or the command worker thread,
/// never while the connector holds an internal lock, so implementations may
/// call back into the connector. State notifications arrive one at a time in
/// the order the state changed; a change made from inside a callback is
/// reported after that callback returns.
pub trait PrinterListener: Send + Sync {
    fn on_state_changed(&self, _from: ConnectionState, _to: ConnectionState, _error: Option<&str>) {}
    fn on_connected(&self) {}
    fn on_job_started(&self) {}
    fn on_job_resumed(&self) {}
    fn on_job_paused(&self) {}
    fn on_job_done(&self) {}
    fn on_job_cancelled(&self) {}
    fn on_temperature_update(&self, _temperatures: &Temperatures) {}
    fn on_files_available(&self, _available: bool) {}
    fn on_files_refreshed(&self, _files: &[PrinterFileEntry]) {}
    fn on_log(&self, _message: &str) {}
}

/// Listener that forwards every event to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

impl PrinterListener for TracingListener {
    fn on_state_changed(&self, from: ConnectionState, to: ConnectionState, error: Option<&str>) {
        match error {
            Some(error) => tracing::warn!("Printer state {} -> {} ({})", from, to, error),
            None => tracing::info!("Printer state {} -> {}", from, to),
        }
    }

    fn on_connected(&self) {
        tracing::info!("Printer connected");
    }

    fn on_job_started(&self) {
        tracing::info!("Job started");
    }

    fn on_job_resumed(&self) {
        tracing::info!("Job resumed");
    }

    fn on_job_paused(&self) {
        tracing::info!("Job paused");
    }

    fn on_job_done(&self) {
        tracing::info!("Job done");
    }

    fn on_job_cancelled(&self) {
        tracing::info!("Job cancelled");
    }

    fn on_temperature_update(&self, temperatures: &Temperatures) {
        for (zone, reading) in temperatures {
            tracing::debug!("{}: {}", zone, reading);
        }
    }

    fn on_files_available(&self, available: bool) {
        tracing::info!("Printer files available: {}", available);
    }

    fn on_files_refreshed(&self, files: &[PrinterFileEntry]) {
        for file in files {
            tracing::debug!("  {} ({} bytes)", file.path, file.size);
        }
    }

    fn on_log(&self, message: &str) {
        tracing::debug!("{}", message);
    }
}
