// src/files/catalog.rs - Cached printer file catalog, refreshed through the command worker
use std::sync::Arc;
use tokio::sync::watch;

use crate::device::DeviceSlot;
use crate::error::Result;
use crate::files::tree::{PrinterFileEntry, project};
use crate::listener::PrinterListener;
use crate::worker::{CommandHandle, CommandSubmitter};

pub struct PrinterFileCatalog {
    files: watch::Sender<Arc<Vec<PrinterFileEntry>>>,
    device: Arc<DeviceSlot>,
    submitter: CommandSubmitter,
    listener: Arc<dyn PrinterListener>,
}

impl PrinterFileCatalog {
    pub fn new(
        device: Arc<DeviceSlot>,
        submitter: CommandSubmitter,
        listener: Arc<dyn PrinterListener>,
    ) -> Self {
        let (files, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            files,
            device,
            submitter,
            listener,
        }
    }

    /// The last projection, empty until the first refresh completes.
    pub fn cached(&self) -> Arc<Vec<PrinterFileEntry>> {
        Arc::clone(&self.files.borrow())
    }

    pub fn clear(&self) {
        self.files.send_replace(Arc::new(Vec::new()));
    }

    /// Queues a refresh on the worker. The catalog is replaced wholesale and
    /// the listener is told once the device answers.
    pub fn refresh(self: &Arc<Self>) -> CommandHandle<Vec<PrinterFileEntry>> {
        let catalog = Arc::clone(self);
        self.submitter.submit(async move { catalog.fetch().await })
    }

    /// Fire-and-forget variant of [`refresh`](Self::refresh); failures are logged.
    pub fn spawn_refresh(self: &Arc<Self>) {
        let catalog = Arc::clone(self);
        drop(self.submitter.submit(async move {
            if let Err(e) = catalog.fetch().await {
                tracing::warn!("Printer file refresh failed: {}", e);
            }
            Ok(())
        }));
    }

    async fn fetch(&self) -> Result<Vec<PrinterFileEntry>> {
        let client = self.device.client()?;
        let tree = client.file_tree().await?;
        let entries = project(&tree);
        if !self.device.is_current(client.session_id()) {
            tracing::debug!("Discarding file listing from a closed session");
            return Ok(entries);
        }
        tracing::info!("Printer file catalog refreshed: {} files", entries.len());
        self.files.send_replace(Arc::new(entries.clone()));
        self.listener.on_files_refreshed(&entries);
        Ok(entries)
    }
}
