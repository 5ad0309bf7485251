// src/simulator/mod.rs - In-process stand-in for the vendor device library
//
// Status reports are delivered on a dedicated callback thread, the same way the
// real library calls back from a thread it owns.

use async_trait::async_trait;
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use crate::device::{DeviceClient, DeviceConfig, DeviceError, DeviceFactory, DeviceReport, SessionId, UpdateHandler};
use crate::files::FileNode;

#[derive(Debug, Clone)]
pub struct SimulatorOptions {
    /// When set, `start_session` fails with this message.
    pub fail_with: Option<String>,
    pub file_tree: FileNode,
    /// Pushed back to back as soon as the session starts.
    pub initial_reports: Vec<DeviceReport>,
}

impl Default for SimulatorOptions {
    fn default() -> Self {
        Self {
            fail_with: None,
            file_tree: FileNode::folder(vec![
                FileNode::file("/benchy.gcode.3mf", "benchy.gcode.3mf", 2_430_112, 1_700_000_000.0),
                FileNode::folder(vec![FileNode::file(
                    "/cache/plate_1.gcode",
                    "plate_1.gcode",
                    88_412,
                    1_700_003_600.0,
                )]),
            ]),
            initial_reports: vec![DeviceReport {
                job_state: Some("IDLE".to_string()),
                idle_state: Some("Idle".to_string()),
                system_state: Some("ready".to_string()),
                tool_temp: Some(24.5),
                tool_temp_target: Some(0.0),
                bed_temp: Some(23.0),
                bed_temp_target: Some(0.0),
                ..DeviceReport::default()
            }],
        }
    }
}

pub struct SimulatedPrinter {
    session: SessionId,
    config: DeviceConfig,
    options: SimulatorOptions,
    handler: Arc<Mutex<Option<UpdateHandler>>>,
    connected: AtomicBool,
    sent: Mutex<Vec<String>>,
    reports: Mutex<Option<Sender<DeviceReport>>>,
}

impl SimulatedPrinter {
    pub fn new(config: DeviceConfig, options: SimulatorOptions) -> Self {
        Self {
            session: SessionId::new(),
            config,
            options,
            handler: Arc::new(Mutex::new(None)),
            connected: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            reports: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Queues a report for the callback thread. Returns `false` when no
    /// session is running.
    pub fn push_report(&self, report: DeviceReport) -> bool {
        let reports = self.reports.lock().unwrap_or_else(PoisonError::into_inner);
        match reports.as_ref() {
            Some(sender) => sender.send(report).is_ok(),
            None => false,
        }
    }

    /// Calls the update handler on the calling thread, bypassing the
    /// callback thread.
    pub fn deliver_now(&self, report: DeviceReport) {
        let current = self.handler.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(handler) = current {
            handler(self.session, report);
        }
    }

    /// Every G-code batch received, in arrival order.
    pub fn sent_gcode(&self) -> Vec<String> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn spawn_callbacks(&self) -> Result<Sender<DeviceReport>, DeviceError> {
        let (sender, receiver) = unbounded();
        let handler = Arc::clone(&self.handler);
        let session = self.session;
        thread::Builder::new()
            .name("sim-device-callbacks".to_string())
            .spawn(move || deliver_reports(session, receiver, handler))
            .map_err(|e| DeviceError::Connection(e.to_string()))?;
        Ok(sender)
    }

    fn ensure_connected(&self) -> Result<(), DeviceError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DeviceError::NotConnected)
        }
    }
}

fn deliver_reports(session: SessionId, receiver: Receiver<DeviceReport>, handler: Arc<Mutex<Option<UpdateHandler>>>) {
    for report in receiver {
        let current = handler.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(handler) = current {
            handler(session, report);
        }
    }
    tracing::trace!("Simulated callback thread for {} exited", session);
}

#[async_trait]
impl DeviceClient for SimulatedPrinter {
    fn session_id(&self) -> SessionId {
        self.session
    }

    fn set_update_handler(&self, handler: UpdateHandler) {
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn start_session(&self) -> Result<(), DeviceError> {
        if let Some(reason) = &self.options.fail_with {
            return Err(DeviceError::Connection(reason.clone()));
        }
        tracing::debug!("Simulated printer {} starting session {}", self.config.serial_number, self.session);
        let sender = self.spawn_callbacks()?;
        self.connected.store(true, Ordering::SeqCst);
        for report in &self.options.initial_reports {
            let _ = sender.send(report.clone());
        }
        *self.reports.lock().unwrap_or_else(PoisonError::into_inner) = Some(sender);
        Ok(())
    }

    async fn quit(&self) -> Result<(), DeviceError> {
        self.connected.store(false, Ordering::SeqCst);
        self.handler.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.reports.lock().unwrap_or_else(PoisonError::into_inner).take();
        Ok(())
    }

    async fn send_gcode(&self, gcode: &str) -> Result<(), DeviceError> {
        self.ensure_connected()?;
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).push(gcode.to_string());
        Ok(())
    }

    async fn file_tree(&self) -> Result<FileNode, DeviceError> {
        self.ensure_connected()?;
        Ok(self.options.file_tree.clone())
    }
}

/// Creates simulated printers and keeps them reachable for inspection.
#[derive(Default)]
pub struct SimulatedPrinterFactory {
    options: SimulatorOptions,
    printers: Mutex<Vec<Arc<SimulatedPrinter>>>,
}

impl SimulatedPrinterFactory {
    pub fn new(options: SimulatorOptions) -> Self {
        Self {
            options,
            printers: Mutex::new(Vec::new()),
        }
    }

    /// The most recently created printer.
    pub fn latest(&self) -> Option<Arc<SimulatedPrinter>> {
        self.printers.lock().unwrap_or_else(PoisonError::into_inner).last().cloned()
    }

    pub fn created(&self) -> usize {
        self.printers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl DeviceFactory for SimulatedPrinterFactory {
    fn create(&self, config: DeviceConfig) -> Result<Box<dyn DeviceClient>, DeviceError> {
        let printer = Arc::new(SimulatedPrinter::new(config, self.options.clone()));
        self.printers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&printer));
        Ok(Box::new(printer))
    }
}
