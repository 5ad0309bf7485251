// src/connector.rs - The connector object the host holds
//
// Host calls return immediately with a `CommandHandle`; anything that touches
// the device runs as a unit on the command worker.

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

use crate::config::{ConnectionParameters, ConnectorConfig, PrinterProfile};
use crate::device::{DeviceClient, DeviceConfig, DeviceFactory, DeviceSlot};
use crate::error::{ConnectorError, Result};
use crate::files::{PrinterFileCatalog, PrinterFileEntry};
use crate::gcode::{self, Axis, Heater};
use crate::lifecycle::{LifecycleStateMachine, Milestone};
use crate::listener::PrinterListener;
use crate::state::{ConnectionState, JobProgress};
use crate::status::DeviceStatusSnapshot;
use crate::telemetry::TelemetrySink;
use crate::worker::{AsyncCommandWorker, CommandHandle, CommandSubmitter};

const WORKER_THREAD_NAME: &str = "bambu-command-worker";

/// File operations the printer's storage offers to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StorageCapabilities {
    pub read_file: bool,
    pub write_file: bool,
    pub remove_file: bool,
    pub copy_file: bool,
    pub move_file: bool,
    pub add_folder: bool,
    pub remove_folder: bool,
    pub copy_folder: bool,
    pub move_folder: bool,
}

/// Where the file of a print job is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobStorage {
    Printer,
    Host,
}

pub struct BambuConnector {
    params: ConnectionParameters,
    profile: PrinterProfile,
    factory: Arc<dyn DeviceFactory>,
    device: Arc<DeviceSlot>,
    machine: Arc<LifecycleStateMachine>,
    catalog: Arc<PrinterFileCatalog>,
    sink: Arc<TelemetrySink>,
    /// Bumped on every connect and disconnect; an open-session unit only
    /// proceeds while its attempt is still the latest.
    attempt: Arc<AtomicU64>,
    submitter: CommandSubmitter,
    worker: Option<AsyncCommandWorker>,
}

impl BambuConnector {
    pub const STORAGE_CAPABILITIES: StorageCapabilities = StorageCapabilities {
        read_file: true,
        write_file: true,
        remove_file: true,
        copy_file: false,
        move_file: false,
        add_folder: false,
        remove_folder: false,
        copy_folder: false,
        move_folder: false,
    };

    pub const CAN_SET_JOB_ON_HOLD: bool = false;

    /// Only files already on the printer can be printed.
    pub fn supports_job(storage: JobStorage) -> bool {
        storage == JobStorage::Printer
    }

    pub fn new(
        params: ConnectionParameters,
        profile: PrinterProfile,
        factory: Arc<dyn DeviceFactory>,
        listener: Arc<dyn PrinterListener>,
    ) -> Result<Self> {
        profile.validate()?;
        let worker = AsyncCommandWorker::new(WORKER_THREAD_NAME)?;
        let submitter = worker.submitter();

        let device = Arc::new(DeviceSlot::new());
        let machine = Arc::new(LifecycleStateMachine::new(Arc::clone(&device), Arc::clone(&listener)));
        let catalog = Arc::new(PrinterFileCatalog::new(
            Arc::clone(&device),
            submitter.clone(),
            Arc::clone(&listener),
        ));
        let sink = Arc::new(TelemetrySink::new(
            Arc::clone(&device),
            Arc::clone(&machine),
            Arc::clone(&catalog),
            listener,
        ));

        Ok(Self {
            params,
            profile,
            factory,
            device,
            machine,
            catalog,
            sink,
            attempt: Arc::new(AtomicU64::new(0)),
            submitter,
            worker: Some(worker),
        })
    }

    pub fn from_config(
        config: &ConnectorConfig,
        factory: Arc<dyn DeviceFactory>,
        listener: Arc<dyn PrinterListener>,
    ) -> Result<Self> {
        Self::new(config.connection.clone(), config.profile.clone(), factory, listener)
    }

    /// Starts opening a device session. The handle resolves to `true` once the
    /// session is up and to `false` if setup failed; the failure itself is
    /// reported through [`error`](Self::error) and `CLOSED_WITH_ERROR`.
    pub fn connect(&self) -> Result<CommandHandle<bool>> {
        if self.device.has_session() || !self.machine.state().is_closed() {
            return Err(ConnectorError::AlreadyConnected);
        }
        if let Err(e) = self.params.validate() {
            tracing::warn!("Not connecting: {}", e);
            return Err(e);
        }
        if self.machine.apply(Milestone::ConnectRequested).is_none() {
            return Err(ConnectorError::AlreadyConnected);
        }

        tracing::info!("Connecting to printer {} at {}", self.params.serial, self.params.host);
        let attempt = self.attempt.fetch_add(1, Ordering::SeqCst) + 1;
        let opener = SessionOpener {
            factory: Arc::clone(&self.factory),
            device: Arc::clone(&self.device),
            machine: Arc::clone(&self.machine),
            sink: Arc::clone(&self.sink),
            attempts: Arc::clone(&self.attempt),
            attempt,
            config: DeviceConfig::from(&self.params),
        };
        Ok(self.submitter.submit(opener.open()))
    }

    /// Closes the session. Updates still in flight from it are ignored from
    /// this call on.
    pub fn disconnect(&self) -> Result<CommandHandle<()>> {
        let released = self.device.release();
        if released.is_none() && self.machine.state() != ConnectionState::Connecting {
            return Err(ConnectorError::NotConnected);
        }
        self.attempt.fetch_add(1, Ordering::SeqCst);
        tracing::info!("Disconnecting from printer {}", self.params.serial);

        self.machine.apply(Milestone::SessionClosed);
        self.catalog.clear();
        self.sink.reset();

        let device = Arc::clone(&self.device);
        Ok(self.submitter.submit(async move {
            device.release();
            let Some(client) = device.take_client() else {
                return Ok(());
            };
            client.quit().await?;
            tracing::debug!("Printer session {} closed", client.session_id());
            Ok(())
        }))
    }

    /// Sends the commands to the device as one newline-joined batch.
    pub fn send_commands<S: AsRef<str>>(&self, commands: &[S]) -> Result<CommandHandle<()>> {
        if commands.is_empty() {
            return Err(ConnectorError::InvalidArgument("no commands given".to_string()));
        }
        let gcode = commands.iter().map(AsRef::as_ref).collect::<Vec<_>>().join("\n");
        let device = Arc::clone(&self.device);
        Ok(self.submitter.submit(async move {
            let client = device.client()?;
            tracing::debug!("Sending G-code: {}", gcode.replace('\n', " | "));
            client.send_gcode(&gcode).await?;
            Ok(())
        }))
    }

    pub fn jog(&self, axes: &[(Axis, f64)], relative: bool, speed: Option<f64>) -> Result<CommandHandle<()>> {
        let commands = gcode::jog(axes, relative, speed, &self.profile)?;
        self.send_commands(&commands)
    }

    pub fn home(&self, axes: &[Axis]) -> Result<CommandHandle<()>> {
        self.send_commands(&gcode::home(axes))
    }

    pub fn extrude(&self, amount: f64, speed: Option<f64>) -> Result<CommandHandle<()>> {
        self.send_commands(&gcode::extrude(amount, speed, &self.profile))
    }

    pub fn change_tool(&self, tool: &str) -> Result<CommandHandle<()>> {
        self.send_commands(&[gcode::change_tool(tool)?])
    }

    pub fn set_temperature(&self, heater: &str, value: f64) -> Result<CommandHandle<()>> {
        let heater: Heater = heater.parse()?;
        self.send_commands(&[gcode::set_temperature(heater, value, &self.profile)])
    }

    pub fn emergency_stop(&self) -> Result<CommandHandle<()>> {
        tracing::warn!("Emergency stop requested");
        self.send_commands(&[gcode::EMERGENCY_STOP])
    }

    /// Files stored on the printer. Blocks on a device round trip when the
    /// cache is empty or `refresh` is set, so it must not run on the worker.
    pub fn get_files(&self, refresh: bool) -> Result<Vec<PrinterFileEntry>> {
        if !self.files_mounted() {
            return Ok(Vec::new());
        }
        let cached = self.catalog.cached();
        if cached.is_empty() || refresh {
            return self.catalog.refresh().wait();
        }
        Ok(cached.as_ref().clone())
    }

    pub fn current_state(&self) -> ConnectionState {
        self.machine.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.machine.subscribe()
    }

    pub fn current_progress(&self) -> Option<JobProgress> {
        self.machine.progress()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<Option<JobProgress>> {
        self.machine.subscribe_progress()
    }

    pub fn status_snapshot(&self) -> Arc<DeviceStatusSnapshot> {
        self.sink.snapshot()
    }

    pub fn error(&self) -> Option<String> {
        self.machine.error()
    }

    pub fn is_ready(&self) -> bool {
        self.device.has_session() && self.machine.state() == ConnectionState::Operational
    }

    pub fn files_mounted(&self) -> bool {
        self.device.has_session()
    }

    pub fn connection_parameters(&self) -> &ConnectionParameters {
        &self.params
    }

    pub fn profile(&self) -> &PrinterProfile {
        &self.profile
    }

    pub fn start_print(&self, _path: &str) -> Result<()> {
        unsupported("start_print")
    }

    pub fn pause_print(&self) -> Result<()> {
        unsupported("pause_print")
    }

    pub fn resume_print(&self) -> Result<()> {
        unsupported("resume_print")
    }

    pub fn cancel_print(&self) -> Result<()> {
        unsupported("cancel_print")
    }

    /// A no-op while disconnected.
    pub fn refresh_printer_files(&self) -> Result<()> {
        let connected = self.device.has_session()
            && self.device.client().map(|client| client.is_connected()).unwrap_or(false);
        if !connected {
            return Ok(());
        }
        unsupported("refresh_printer_files")
    }

    pub fn create_folder(&self, _path: &str) -> Result<()> {
        unsupported("create_folder")
    }

    pub fn delete_folder(&self, _path: &str) -> Result<()> {
        unsupported("delete_folder")
    }

    pub fn copy_folder(&self, _source: &str, _target: &str) -> Result<()> {
        unsupported("copy_folder")
    }

    pub fn move_folder(&self, _source: &str, _target: &str) -> Result<()> {
        unsupported("move_folder")
    }

    pub fn upload_file(&self, _local: &Path, _target: &str) -> Result<()> {
        unsupported("upload_file")
    }

    pub fn download_file(&self, _path: &str, _local: &Path) -> Result<()> {
        unsupported("download_file")
    }

    pub fn delete_file(&self, _path: &str) -> Result<()> {
        unsupported("delete_file")
    }

    pub fn copy_file(&self, _source: &str, _target: &str) -> Result<()> {
        unsupported("copy_file")
    }

    pub fn move_file(&self, _source: &str, _target: &str) -> Result<()> {
        unsupported("move_file")
    }

    /// Disconnects if needed and stops the command worker.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if self.device.has_session() || self.machine.state() == ConnectionState::Connecting {
            match self.disconnect().map(CommandHandle::wait) {
                Ok(Ok(())) | Err(ConnectorError::NotConnected) => {}
                Ok(Err(e)) | Err(e) => tracing::warn!("Disconnect during shutdown failed: {}", e),
            }
        }
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }
    }
}

impl Drop for BambuConnector {
    fn drop(&mut self) {
        self.close();
    }
}

fn unsupported<T>(operation: &'static str) -> Result<T> {
    tracing::debug!("Unsupported operation requested: {}", operation);
    Err(ConnectorError::Unsupported(operation))
}

/// Everything the open-session unit needs, moved onto the worker.
struct SessionOpener {
    factory: Arc<dyn DeviceFactory>,
    device: Arc<DeviceSlot>,
    machine: Arc<LifecycleStateMachine>,
    sink: Arc<TelemetrySink>,
    attempts: Arc<AtomicU64>,
    attempt: u64,
    config: DeviceConfig,
}

impl SessionOpener {
    fn is_current(&self) -> bool {
        self.attempts.load(Ordering::SeqCst) == self.attempt
    }

    async fn open(self) -> Result<bool> {
        if !self.is_current() {
            tracing::debug!("Connect attempt {} superseded before it started", self.attempt);
            return Ok(false);
        }

        let client: Arc<dyn DeviceClient> = match self.factory.create(self.config.clone()) {
            Ok(client) => Arc::from(client),
            Err(e) => return Ok(self.fail(e.to_string())),
        };
        let session = client.session_id();
        self.device.claim(session);
        client.set_update_handler(self.sink.handler());
        self.device.install(Arc::clone(&client));

        match client.start_session().await {
            Ok(()) if self.device.is_current(session) => {
                tracing::info!("Printer session {} started", session);
                Ok(true)
            }
            Ok(()) => {
                tracing::debug!("Printer session {} started after disconnect", session);
                Ok(false)
            }
            Err(e) => {
                if self.device.is_current(session) {
                    self.device.release();
                }
                self.device.take_client();
                Ok(self.fail(e.to_string()))
            }
        }
    }

    fn fail(&self, message: String) -> bool {
        tracing::error!("Failed to connect to printer {}: {}", self.config.hostname, message);
        if self.is_current() {
            self.machine.apply(Milestone::SessionFailed(message));
        }
        false
    }
}
