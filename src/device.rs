// src/device.rs - Boundary to the vendor device-communication library
//
// The vendor library is not thread-safe. Every `DeviceClient` call is made from
// a unit running on the command worker; only the update handler runs elsewhere,
// on a thread the library owns.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::ConnectionParameters;
use crate::error::ConnectorError;
use crate::files::FileNode;

#[derive(Debug, Error, Clone)]
pub enum DeviceError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Session is not open")]
    NotConnected,
    #[error("Device rejected request: {0}")]
    Rejected(String),
}

/// Identity of one device session. A new session gets a new id, so callbacks
/// from a superseded session can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration handed to the vendor library when a session is created.
#[derive(Clone)]
pub struct DeviceConfig {
    pub hostname: String,
    pub access_code: String,
    pub serial_number: String,
}

impl From<&ConnectionParameters> for DeviceConfig {
    fn from(params: &ConnectionParameters) -> Self {
        Self {
            hostname: params.host.clone(),
            access_code: params.access_code.clone(),
            serial_number: params.serial.clone(),
        }
    }
}

impl fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("hostname", &self.hostname)
            .field("access_code", &"<redacted>")
            .field("serial_number", &self.serial_number)
            .finish()
    }
}

/// Raw status fields pushed by the device. Every field is optional: the device
/// sends partial updates and malformed payloads must not fail the whole update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceReport {
    #[serde(alias = "gcode_state")]
    pub job_state: Option<String>,
    pub idle_state: Option<String>,
    pub system_state: Option<String>,
    pub tool_temp: Option<f64>,
    pub tool_temp_target: Option<f64>,
    pub bed_temp: Option<f64>,
    pub bed_temp_target: Option<f64>,
    pub chamber_temp: Option<f64>,
    pub chamber_temp_target: Option<f64>,
    pub file: Option<String>,
    pub progress: Option<f64>,
    pub current_layer: Option<u32>,
    pub total_layer: Option<u32>,
}

/// Invoked by the vendor library whenever any status field changes.
pub type UpdateHandler = Arc<dyn Fn(SessionId, DeviceReport) + Send + Sync>;

#[async_trait]
pub trait DeviceClient: Send + Sync {
    fn session_id(&self) -> SessionId;
    fn set_update_handler(&self, handler: UpdateHandler);
    fn is_connected(&self) -> bool;
    async fn start_session(&self) -> Result<(), DeviceError>;
    async fn quit(&self) -> Result<(), DeviceError>;
    async fn send_gcode(&self, gcode: &str) -> Result<(), DeviceError>;
    async fn file_tree(&self) -> Result<FileNode, DeviceError>;
}

#[async_trait]
impl<T: DeviceClient + ?Sized> DeviceClient for Arc<T> {
    fn session_id(&self) -> SessionId {
        (**self).session_id()
    }

    fn set_update_handler(&self, handler: UpdateHandler) {
        (**self).set_update_handler(handler)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    async fn start_session(&self) -> Result<(), DeviceError> {
        (**self).start_session().await
    }

    async fn quit(&self) -> Result<(), DeviceError> {
        (**self).quit().await
    }

    async fn send_gcode(&self, gcode: &str) -> Result<(), DeviceError> {
        (**self).send_gcode(gcode).await
    }

    async fn file_tree(&self) -> Result<FileNode, DeviceError> {
        (**self).file_tree().await
    }
}

/// Creates vendor clients. Called on the command worker thread.
pub trait DeviceFactory: Send + Sync {
    fn create(&self, config: DeviceConfig) -> Result<Box<dyn DeviceClient>, DeviceError>;
}

/// The device session currently owned by the connector.
///
/// The session id is published through a watch channel so the callback thread
/// can check it without touching the client lock.
pub struct DeviceSlot {
    client: Mutex<Option<Arc<dyn DeviceClient>>>,
    session: watch::Sender<Option<SessionId>>,
}

impl DeviceSlot {
    pub fn new() -> Self {
        let (session, _) = watch::channel(None);
        Self {
            client: Mutex::new(None),
            session,
        }
    }

    pub fn session(&self) -> Option<SessionId> {
        *self.session.borrow()
    }

    pub fn is_current(&self, session: SessionId) -> bool {
        self.session() == Some(session)
    }

    pub fn has_session(&self) -> bool {
        self.session().is_some()
    }

    /// Claims ownership of a session before it starts, so that its first
    /// callbacks are accepted.
    pub fn claim(&self, session: SessionId) {
        self.session.send_replace(Some(session));
    }

    pub fn install(&self, client: Arc<dyn DeviceClient>) {
        *self.client.lock().unwrap_or_else(PoisonError::into_inner) = Some(client);
    }

    /// Releases the session; callbacks from it are dropped from now on.
    pub fn release(&self) -> Option<SessionId> {
        self.session.send_replace(None)
    }

    pub fn take_client(&self) -> Option<Arc<dyn DeviceClient>> {
        self.client.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub fn client(&self) -> Result<Arc<dyn DeviceClient>, ConnectorError> {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ConnectorError::NotConnected)
    }
}

impl Default for DeviceSlot {
    fn default() -> Self {
        Self::new()
    }
}
