// src/state.rs - Host-facing connection state and job progress
use serde::Serialize;
use std::fmt;

/// The single discrete state the host sees for this connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum ConnectionState {
    #[default]
    Closed,
    ClosedWithError,
    Connecting,
    Operational,
    Starting,
    Printing,
    Pausing,
    Paused,
    Resuming,
    Finishing,
    Cancelling,
}

impl ConnectionState {
    /// States that wait for the device to confirm a job action.
    pub fn is_job_transient(self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Resuming | Self::Finishing | Self::Cancelling | Self::Pausing
        )
    }

    pub fn is_transient(self) -> bool {
        self == Self::Connecting || self.is_job_transient()
    }

    pub fn is_closed(self) -> bool {
        matches!(self, Self::Closed | Self::ClosedWithError)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::ClosedWithError => "CLOSED_WITH_ERROR",
            Self::Connecting => "CONNECTING",
            Self::Operational => "OPERATIONAL",
            Self::Starting => "STARTING",
            Self::Printing => "PRINTING",
            Self::Pausing => "PAUSING",
            Self::Paused => "PAUSED",
            Self::Resuming => "RESUMING",
            Self::Finishing => "FINISHING",
            Self::Cancelling => "CANCELLING",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A job action requested of the device, entered as a transient state until
/// telemetry confirms it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobIntent {
    Start,
    Pause,
    Resume,
    Cancel,
    Finish,
}

impl JobIntent {
    pub fn target_state(self) -> ConnectionState {
        match self {
            Self::Start => ConnectionState::Starting,
            Self::Pause => ConnectionState::Pausing,
            Self::Resume => ConnectionState::Resuming,
            Self::Cancel => ConnectionState::Cancelling,
            Self::Finish => ConnectionState::Finishing,
        }
    }

    pub fn allowed_from(self, state: ConnectionState) -> bool {
        use ConnectionState::*;
        match self {
            Self::Start => state == Operational,
            Self::Pause => state == Printing,
            Self::Resume => state == Paused,
            Self::Cancel => matches!(state, Printing | Paused | Pausing | Resuming | Starting),
            Self::Finish => state == Printing,
        }
    }
}

impl fmt::Display for JobIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            Self::Start => "start a job",
            Self::Pause => "pause the job",
            Self::Resume => "resume the job",
            Self::Cancel => "cancel the job",
            Self::Finish => "finish the job",
        };
        f.write_str(verb)
    }
}

/// Progress of the job the device is currently running.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct JobProgress {
    /// Fractional completion, 0.0 to 1.0.
    pub progress: f64,
    pub file: Option<String>,
    pub current_layer: Option<u32>,
    pub total_layer: Option<u32>,
}

impl JobProgress {
    pub fn new(file: Option<String>) -> Self {
        Self {
            file,
            ..Self::default()
        }
    }
}
