// src/status.rs - Typed device status axes and the immutable snapshot built from a report
//
// The device reports every axis as a free-form string. Each axis has an explicit
// lookup table with an `Unknown` fallback; raw strings never travel further.

use serde::Serialize;
use std::fmt;

use crate::device::DeviceReport;

/// State of the print job as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum JobPhase {
    Standby,
    Printing,
    Paused,
    Complete,
    Error,
    Cancelled,
    Running,
    #[default]
    Unknown,
}

impl JobPhase {
    /// Accepts both the lower-case job vocabulary and the device's upper-case
    /// `gcode_state` vocabulary.
    pub fn from_raw(raw: &str) -> Self {
        match raw {
            "standby" | "IDLE" => Self::Standby,
            "printing" => Self::Printing,
            "paused" | "PAUSE" => Self::Paused,
            "complete" | "FINISH" => Self::Complete,
            "error" | "FAILED" => Self::Error,
            "cancelled" => Self::Cancelled,
            "running" | "RUNNING" => Self::Running,
            _ => Self::Unknown,
        }
    }
}

/// Whether the device is actively executing anything, independent of the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum IdlePhase {
    Printing,
    Ready,
    Idle,
    #[default]
    Unknown,
}

impl IdlePhase {
    pub fn from_raw(raw: &str) -> Self {
        match raw {
            "Printing" => Self::Printing,
            "Ready" => Self::Ready,
            "Idle" => Self::Idle,
            _ => Self::Unknown,
        }
    }
}

/// Firmware / host-system state of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum FirmwarePhase {
    Ready,
    Error,
    Shutdown,
    Startup,
    Disconnected,
    #[default]
    Unknown,
}

impl FirmwarePhase {
    pub fn from_raw(raw: &str) -> Self {
        match raw {
            "ready" => Self::Ready,
            "error" => Self::Error,
            "shutdown" => Self::Shutdown,
            "startup" => Self::Startup,
            "disconnected" => Self::Disconnected,
            _ => Self::Unknown,
        }
    }

    pub fn is_fault(self) -> bool {
        matches!(self, Self::Error | Self::Shutdown)
    }
}

impl fmt::Display for FirmwarePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Job details carried alongside the phase axes.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct JobTelemetry {
    pub file: Option<String>,
    pub progress: Option<f64>,
    pub current_layer: Option<u32>,
    pub total_layer: Option<u32>,
}

/// Latest known values of the device status axes at one point in time.
///
/// The axes are updated independently by the device and may disagree
/// transiently. Snapshots are replaced wholesale, never patched.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct DeviceStatusSnapshot {
    pub job: JobPhase,
    pub idle: IdlePhase,
    pub firmware: FirmwarePhase,
    pub telemetry: JobTelemetry,
}

impl DeviceStatusSnapshot {
    pub fn new(job: JobPhase, idle: IdlePhase, firmware: FirmwarePhase) -> Self {
        Self {
            job,
            idle,
            firmware,
            telemetry: JobTelemetry::default(),
        }
    }

    /// Missing fields leave the corresponding axis `Unknown`.
    pub fn from_report(report: &DeviceReport) -> Self {
        Self {
            job: report.job_state.as_deref().map(JobPhase::from_raw).unwrap_or_default(),
            idle: report.idle_state.as_deref().map(IdlePhase::from_raw).unwrap_or_default(),
            firmware: report
                .system_state
                .as_deref()
                .map(FirmwarePhase::from_raw)
                .unwrap_or_default(),
            telemetry: JobTelemetry {
                file: report.file.clone(),
                progress: report.progress.map(|p| p.clamp(0.0, 1.0)),
                current_layer: report.current_layer,
                total_layer: report.total_layer,
            },
        }
    }
}
