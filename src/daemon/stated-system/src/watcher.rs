//! Async notification stream
//!
//! Registers the client's event descriptor with the tokio reactor and fans
//! drained notifications out over a broadcast channel. While a watcher runs
//! it owns the event queue: calling [`Client::check`] concurrently steals
//! events from it.

use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use metrics::counter;
use stated_core::{Error, Result};
use tokio::io::unix::AsyncFd;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::{Client, Drained, Notification};

/// Queue failures in a row before the watcher gives up
const MAX_QUEUE_ERRORS: u32 = 8;

struct QueueFd(Arc<Client>);

impl AsRawFd for QueueFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.event_fd()
    }
}

/// Background task delivering notifications for one client
pub struct Watcher {
    sender: broadcast::Sender<Notification>,
    shutdown: broadcast::Sender<()>,
    task: Option<JoinHandle<()>>,
}

impl Watcher {
    /// Start watching on the current tokio runtime
    ///
    /// `capacity` bounds how many notifications a slow receiver may fall
    /// behind before it observes a lag.
    pub fn spawn(client: Arc<Client>, capacity: usize) -> Result<Self> {
        let fd = AsyncFd::new(QueueFd(client)).map_err(|e| {
            error!("unable to register the event queue with the runtime: {}", e);
            Error::from(e)
        })?;

        let (sender, _) = broadcast::channel(capacity.max(1));
        let (shutdown, shutdown_receiver) = broadcast::channel(1);
        let task = tokio::spawn(Self::run(fd, sender.clone(), shutdown_receiver));

        info!("notification watcher started");
        Ok(Self {
            sender,
            shutdown,
            task: Some(task),
        })
    }

    /// A new receiver for notifications delivered from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    /// Stop the background task and wait for it
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("notification watcher ended abnormally: {}", e);
            }
        }
        info!("notification watcher stopped");
    }

    async fn run(
        fd: AsyncFd<QueueFd>,
        sender: broadcast::Sender<Notification>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut queue_errors = 0;

        loop {
            let mut guard = tokio::select! {
                _ = shutdown.recv() => break,
                ready = fd.readable() => match ready {
                    Ok(guard) => guard,
                    Err(e) => {
                        error!("event queue readiness failed: {}", e);
                        break;
                    }
                },
            };

            let client = &fd.get_ref().0;
            loop {
                match client.drain_one() {
                    Ok(Drained::Empty) => {
                        guard.clear_ready();
                        break;
                    }
                    Ok(Drained::Skipped) => {}
                    Ok(Drained::Delivered(notification)) => {
                        queue_errors = 0;
                        if sender.send(notification).is_err() {
                            debug!("no notification receivers");
                        }
                    }
                    Err(Error::Io { path: None, source }) => {
                        queue_errors += 1;
                        warn!("event queue error ({} in a row): {}", queue_errors, source);
                        break;
                    }
                    Err(e) => {
                        warn!("dropping notification: {}", e);
                        counter!("stated_errors_total").increment(1);
                    }
                }
            }

            if queue_errors >= MAX_QUEUE_ERRORS {
                error!("event queue keeps failing; stopping the watcher");
                break;
            }
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
