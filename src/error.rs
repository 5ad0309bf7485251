// src/error.rs - Error types for the connector
use thiserror::Error;

use crate::config::ConfigError;
use crate::device::DeviceError;
use crate::state::{ConnectionState, JobIntent};

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Connection preconditions not met: {0}")]
    Preconditions(String),
    #[error("Connector is already connected")]
    AlreadyConnected,
    #[error("Printer is not connected")]
    NotConnected,
    #[error("Operation not supported by this connector: {0}")]
    Unsupported(&'static str),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Cannot {intent} while {state}")]
    InvalidTransition {
        state: ConnectionState,
        intent: JobIntent,
    },
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
    #[error("Command worker failed to start: {0}")]
    WorkerStart(String),
    #[error("Command worker has shut down")]
    WorkerShutdown,
    #[error("Command unit panicked: {0}")]
    CommandPanicked(String),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, ConnectorError>;
