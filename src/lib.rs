//! Connector between a host print-management API and a Bambu printer.
//!
//! The device pushes status on its own thread; the host expects blocking calls
//! and a single discrete connection state. [`BambuConnector`] bridges the two:
//! device calls run on a dedicated [`worker::AsyncCommandWorker`], status
//! updates flow through [`telemetry::TelemetrySink`] into the
//! [`lifecycle::LifecycleStateMachine`].

pub mod config;
pub mod connector;
pub mod device;
pub mod error;
pub mod files;
pub mod gcode;
pub mod lifecycle;
pub mod listener;
pub mod simulator;
pub mod state;
pub mod status;
pub mod telemetry;
pub mod worker;

pub use config::{ConnectionParameters, ConnectorConfig, PrinterProfile, load_config};
pub use connector::{BambuConnector, JobStorage, StorageCapabilities};
pub use device::{DeviceClient, DeviceConfig, DeviceError, DeviceFactory, DeviceReport, SessionId};
pub use error::{ConnectorError, Result};
pub use files::{FileNode, PrinterFileEntry};
pub use gcode::{Axis, Heater};
pub use listener::{PrinterListener, Temperatures, TracingListener};
pub use state::{ConnectionState, JobIntent, JobProgress};
pub use status::DeviceStatusSnapshot;
pub use telemetry::TemperatureReading;
pub use worker::{AsyncCommandWorker, CommandHandle};
