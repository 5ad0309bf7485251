// src/telemetry.rs - Entry point for device status updates
//
// Runs on the vendor library's callback thread. The sink never calls the
// device directly; anything that needs the device is queued on the worker.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use crate::device::{DeviceReport, DeviceSlot, SessionId, UpdateHandler};
use crate::files::PrinterFileCatalog;
use crate::lifecycle::{LifecycleStateMachine, Milestone};
use crate::listener::{PrinterListener, Temperatures};
use crate::state::ConnectionState;
use crate::status::DeviceStatusSnapshot;

pub const TOOL_ZONE: &str = "tool0";
pub const BED_ZONE: &str = "bed";
pub const CHAMBER_ZONE: &str = "chamber";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TemperatureReading {
    pub actual: f64,
    pub target: f64,
}

impl fmt::Display for TemperatureReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1} / {:.1}", self.actual, self.target)
    }
}

/// Zones without an actual reading are omitted. A missing target reads as 0.
pub fn temperatures(report: &DeviceReport) -> Temperatures {
    let mut readings = Temperatures::new();
    for (zone, actual, target) in [
        (TOOL_ZONE, report.tool_temp, report.tool_temp_target),
        (BED_ZONE, report.bed_temp, report.bed_temp_target),
        (CHAMBER_ZONE, report.chamber_temp, report.chamber_temp_target),
    ] {
        if let Some(actual) = actual {
            readings.insert(
                zone.to_string(),
                TemperatureReading {
                    actual,
                    target: target.unwrap_or(0.0),
                },
            );
        }
    }
    readings
}

pub struct TelemetrySink {
    device: Arc<DeviceSlot>,
    machine: Arc<LifecycleStateMachine>,
    catalog: Arc<PrinterFileCatalog>,
    listener: Arc<dyn PrinterListener>,
    snapshot: watch::Sender<Arc<DeviceStatusSnapshot>>,
}

impl TelemetrySink {
    pub fn new(
        device: Arc<DeviceSlot>,
        machine: Arc<LifecycleStateMachine>,
        catalog: Arc<PrinterFileCatalog>,
        listener: Arc<dyn PrinterListener>,
    ) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(DeviceStatusSnapshot::default()));
        Self {
            device,
            machine,
            catalog,
            listener,
            snapshot,
        }
    }

    /// Handler to register with a device client.
    pub fn handler(self: &Arc<Self>) -> UpdateHandler {
        let sink = Arc::clone(self);
        Arc::new(move |session: SessionId, report: DeviceReport| sink.handle_update(session, report))
    }

    pub fn handle_update(&self, session: SessionId, report: DeviceReport) {
        if !self.device.is_current(session) {
            tracing::trace!("Dropping update from stale session {}", session);
            return;
        }

        let snapshot = Arc::new(DeviceStatusSnapshot::from_report(&report));
        let previous = self.snapshot.send_replace(Arc::clone(&snapshot));
        if previous.firmware != snapshot.firmware {
            if snapshot.firmware.is_fault() {
                tracing::warn!("Printer firmware reports {}", snapshot.firmware);
            } else {
                tracing::info!("Printer firmware is {}", snapshot.firmware);
            }
        }

        if self.machine.state() == ConnectionState::Connecting
            && self.machine.apply(Milestone::SessionEstablished(session)).is_some()
        {
            self.catalog.spawn_refresh();
        }

        self.machine.evaluate(session, &snapshot);

        let readings = temperatures(&report);
        if !readings.is_empty() {
            self.listener.on_temperature_update(&readings);
        }
    }

    pub fn snapshot(&self) -> Arc<DeviceStatusSnapshot> {
        Arc::clone(&self.snapshot.borrow())
    }

    pub fn reset(&self) {
        self.snapshot.send_replace(Arc::new(DeviceStatusSnapshot::default()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_zones_are_omitted() {
        let report = DeviceReport {
            tool_temp: Some(215.3),
            tool_temp_target: Some(220.0),
            bed_temp: Some(60.0),
            ..DeviceReport::default()
        };
        let readings = temperatures(&report);
        assert_eq!(readings.len(), 2);
        assert_eq!(
            readings[TOOL_ZONE],
            TemperatureReading {
                actual: 215.3,
                target: 220.0
            }
        );
        assert_eq!(readings[BED_ZONE].target, 0.0);
        assert!(!readings.contains_key(CHAMBER_ZONE));
    }

    #[test]
    fn test_updates_from_other_sessions_are_dropped() {
        use crate::listener::TracingListener;
        use crate::status::JobPhase;
        use crate::worker::AsyncCommandWorker;

        let worker = AsyncCommandWorker::new("telemetry-test").unwrap();
        let listener: Arc<dyn PrinterListener> = Arc::new(TracingListener);
        let device = Arc::new(DeviceSlot::new());
        let machine = Arc::new(LifecycleStateMachine::new(Arc::clone(&device), Arc::clone(&listener)));
        let catalog = Arc::new(PrinterFileCatalog::new(
            Arc::clone(&device),
            worker.submitter(),
            Arc::clone(&listener),
        ));
        let sink = TelemetrySink::new(device.clone(), machine.clone(), catalog, listener);

        let current = SessionId::new();
        device.claim(current);
        machine.apply(Milestone::ConnectRequested);

        let report = DeviceReport {
            job_state: Some("printing".to_string()),
            ..DeviceReport::default()
        };
        sink.handle_update(SessionId::new(), report.clone());
        assert_eq!(machine.state(), ConnectionState::Connecting);
        assert_eq!(sink.snapshot().job, JobPhase::Unknown);

        sink.handle_update(current, report.clone());
        assert_eq!(machine.state(), ConnectionState::Operational);
        assert_eq!(sink.snapshot().job, JobPhase::Printing);

        device.release();
        sink.reset();
        sink.handle_update(current, report);
        assert_eq!(sink.snapshot().job, JobPhase::Unknown);
        worker.shutdown();
    }

    #[test]
    fn test_superseded_session_does_not_establish_next_attempt() {
        use crate::listener::TracingListener;
        use crate::worker::AsyncCommandWorker;

        let worker = AsyncCommandWorker::new("telemetry-reconnect-test").unwrap();
        let listener: Arc<dyn PrinterListener> = Arc::new(TracingListener);
        let device = Arc::new(DeviceSlot::new());
        let machine = Arc::new(LifecycleStateMachine::new(Arc::clone(&device), Arc::clone(&listener)));
        let catalog = Arc::new(PrinterFileCatalog::new(
            Arc::clone(&device),
            worker.submitter(),
            Arc::clone(&listener),
        ));
        let sink = TelemetrySink::new(device.clone(), machine.clone(), catalog, listener);

        // Session A is closed and a new attempt is CONNECTING before its
        // session has been claimed.
        let old = SessionId::new();
        device.claim(old);
        machine.apply(Milestone::ConnectRequested);
        device.release();
        machine.apply(Milestone::SessionClosed);
        machine.apply(Milestone::ConnectRequested);

        assert!(machine.apply(Milestone::SessionEstablished(old)).is_none());
        sink.handle_update(old, DeviceReport::default());
        assert_eq!(machine.state(), ConnectionState::Connecting);

        let fresh = SessionId::new();
        device.claim(fresh);
        sink.handle_update(fresh, DeviceReport::default());
        assert_eq!(machine.state(), ConnectionState::Operational);
        worker.shutdown();
    }

    #[test]
    fn test_reading_display() {
        let reading = TemperatureReading {
            actual: 59.96,
            target: 60.0,
        };
        assert_eq!(reading.to_string(), "60.0 / 60.0");
    }
}
