// src/worker.rs - Dedicated command worker bridging blocking host calls to async device calls
//
// One OS thread owns a current-thread tokio runtime and a LocalSet. Units are
// queued from any thread and run one at a time, in the order each submitter
// queued them.

use futures::future::{BoxFuture, FutureExt};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::thread;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::LocalSet;

use crate::error::{ConnectorError, Result};

type Unit = BoxFuture<'static, ()>;

/// Result of a submitted unit. Await it, poll it with
/// [`try_result`](Self::try_result), or block on it with [`wait`](Self::wait).
#[must_use = "dropping a handle discards the unit's result, not the unit"]
pub struct CommandHandle<T> {
    response: oneshot::Receiver<Result<T>>,
}

impl<T> CommandHandle<T> {
    /// Blocks the calling thread until the unit has run.
    ///
    /// Never call this from the worker thread itself: the unit can only run
    /// once the current one returns.
    pub fn wait(self) -> Result<T> {
        futures::executor::block_on(self)
    }

    /// Returns the result if the unit has finished, without blocking.
    pub fn try_result(&mut self) -> Option<Result<T>> {
        match self.response.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(ConnectorError::WorkerShutdown)),
        }
    }
}

impl<T> Future for CommandHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.response)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ConnectorError::WorkerShutdown)))
    }
}

/// Cloneable entry point into the worker's queue.
#[derive(Clone)]
pub struct CommandSubmitter {
    queue: mpsc::UnboundedSender<Unit>,
}

impl CommandSubmitter {
    /// Queues `unit` and returns immediately.
    ///
    /// A panic inside the unit is reported through the handle as
    /// [`ConnectorError::CommandPanicked`]; the worker keeps running.
    pub fn submit<F, T>(&self, unit: F) -> CommandHandle<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (respond_to, response) = oneshot::channel();
        let wrapped = async move {
            let outcome = match AssertUnwindSafe(unit).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(ConnectorError::CommandPanicked(panic_message(panic.as_ref()))),
            };
            let _ = respond_to.send(outcome);
        }
        .boxed();
        // On failure the unit is dropped along with its responder, which
        // resolves the handle to `WorkerShutdown`.
        if self.queue.send(wrapped).is_err() {
            tracing::debug!("Command submitted after worker shutdown");
        }
        CommandHandle { response }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub struct AsyncCommandWorker {
    submitter: CommandSubmitter,
    shutdown_tx: broadcast::Sender<()>,
    thread: Option<thread::JoinHandle<()>>,
}

impl AsyncCommandWorker {
    /// Starts the worker thread and returns once its loop accepts work.
    pub fn new(name: &str) -> Result<Self> {
        let (queue, mut units) = mpsc::unbounded_channel::<Unit>();
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut shutdown_rx = shutdown_tx.subscribe();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<std::result::Result<(), String>>(1);

        tracing::info!("Starting command worker thread {}", name);
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let local = LocalSet::new();
                local.block_on(&runtime, async move {
                    let _ = ready_tx.send(Ok(()));
                    loop {
                        tokio::select! {
                            biased;
                            _ = shutdown_rx.recv() => break,
                            unit = units.recv() => {
                                let Some(unit) = unit else { break };
                                tokio::select! {
                                    biased;
                                    _ = shutdown_rx.recv() => break,
                                    _ = unit => {}
                                }
                            }
                        }
                    }
                });
                tracing::debug!("Command worker loop exited");
            })
            .map_err(|e| ConnectorError::WorkerStart(e.to_string()))?;

        let handshake = ready_rx.recv();
        match handshake {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                let _ = thread.join();
                return Err(ConnectorError::WorkerStart(reason));
            }
            Err(_) => {
                let _ = thread.join();
                return Err(ConnectorError::WorkerStart(
                    "worker thread exited before it was ready".to_string(),
                ));
            }
        }

        Ok(Self {
            submitter: CommandSubmitter { queue },
            shutdown_tx,
            thread: Some(thread),
        })
    }

    pub fn submit<F, T>(&self, unit: F) -> CommandHandle<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.submitter.submit(unit)
    }

    pub fn submitter(&self) -> CommandSubmitter {
        self.submitter.clone()
    }

    /// Stops the loop and joins the thread. In-flight and queued units are
    /// abandoned; their handles resolve to `WorkerShutdown`.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        tracing::warn!("Command worker shutdown initiated");
        let _ = self.shutdown_tx.send(());
        if thread.thread().id() == thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            tracing::error!("Command worker thread panicked");
        }
    }
}

impl Drop for AsyncCommandWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
