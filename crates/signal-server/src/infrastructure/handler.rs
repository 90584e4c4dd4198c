//! Public entry point: owns the queue, the session loop task and the keep-alive.
//!
//! [`ConnectionHandler`] is what the control process talks to.  It exposes
//! three operations:
//!
//! - [`ConnectionHandler::add_message`] queues a payload for the signal.
//! - [`ConnectionHandler::reset_server`] closes the current sockets; the
//!   session loop then binds a fresh endpoint and waits for the signal again.
//! - [`ConnectionHandler::kill_server`] stops the keep-alive and the session
//!   loop for good.
//!
//! Both lifecycle operations may be called any number of times.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use signal_core::{MessageFraming, NullTerminatedFraming};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::application::message_queue::{Enqueued, MessageQueue, PendingMessage, QueueError};
use crate::application::transact::{AckLimits, Transactor};
use crate::infrastructure::scheduler::{Scheduler, TaskId};
use crate::infrastructure::server::{LoopTimers, ResetRequest, SessionLoop};
use crate::infrastructure::storage::config::{ConfigError, ServerConfig};
use crate::infrastructure::transport::Transport;

/// Pending lifecycle requests.  Requests are rare and each waits for its
/// reply, so a handful of slots is plenty.
const CONTROL_CHANNEL_CAPACITY: usize = 4;

/// Errors returned by the lifecycle operations.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Closing the listening endpoint or the signal session failed.
    #[error("failed to close signal sockets: {0}")]
    Close(#[source] io::Error),
}

/// Handle to a running signal server.
///
/// Dropping the handle stops the keep-alive and lets the session loop wind
/// down on its own; call [`stop`](Self::stop) to wait for it.
pub struct ConnectionHandler {
    queue: Arc<MessageQueue>,
    control_tx: mpsc::Sender<ResetRequest>,
    stop: Arc<AtomicBool>,
    scheduler: Arc<dyn Scheduler>,
    keepalive: Mutex<Option<TaskId>>,
    listening_rx: watch::Receiver<Option<SocketAddr>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionHandler {
    /// Starts the session loop and the keep-alive using NUL-terminated framing.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidBindAddress`] if the configured bind
    /// address is not an IP address.
    pub fn start<T: Transport>(
        config: &ServerConfig,
        transport: T,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<Self, ConfigError> {
        Self::start_with_framing(config, transport, scheduler, NullTerminatedFraming)
    }

    /// Like [`start`](Self::start) with a custom framing.
    ///
    /// # Errors
    ///
    /// See [`start`](Self::start).
    pub fn start_with_framing<T, F>(
        config: &ServerConfig,
        transport: T,
        scheduler: Arc<dyn Scheduler>,
        framing: F,
    ) -> Result<Self, ConfigError>
    where
        T: Transport,
        F: MessageFraming + 'static,
    {
        let addr = config.listen_addr()?;
        let link = &config.link;

        let queue = Arc::new(MessageQueue::new(link.queue_capacity));
        let stop = Arc::new(AtomicBool::new(false));
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let (listening_tx, listening_rx) = watch::channel(None);

        let ping = framing.ping_message().to_vec();
        let keepalive = {
            let queue = Arc::clone(&queue);
            scheduler.schedule_task(
                Box::new(move || {
                    if let Some(Ok(_)) = queue.push_if_connected(ping.clone()) {
                        debug!("queued keep-alive ping");
                    }
                }),
                link.keepalive_interval(),
                true,
            )
        };
        debug!("keep-alive registered as {keepalive}");

        let session = SessionLoop::new(
            addr,
            transport,
            Arc::clone(&queue),
            Transactor::new(framing, AckLimits::from(link)),
            LoopTimers {
                idle_wake: link.idle_wake(),
                rebind_delay: link.rebind_delay(),
            },
            Arc::clone(&stop),
            control_rx,
            listening_tx,
        );
        let task = tokio::spawn(session.run());
        info!("signal server starting on {addr}");

        Ok(Self {
            queue,
            control_tx,
            stop,
            scheduler,
            keepalive: Mutex::new(Some(keepalive)),
            listening_rx,
            task: Mutex::new(Some(task)),
        })
    }

    /// Queues `payload` for delivery to the signal.
    ///
    /// Returns `false` only if a signal is connected and the queue is full.
    pub fn add_message(&self, payload: impl Into<PendingMessage>) -> bool {
        self.try_add_message(payload).is_ok()
    }

    /// Like [`add_message`](Self::add_message), reporting how the payload was queued.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Full`] if a signal is connected and the queue is full.
    pub fn try_add_message(
        &self,
        payload: impl Into<PendingMessage>,
    ) -> Result<Enqueued, QueueError> {
        self.queue.push(payload)
    }

    /// Closes the listening endpoint and the current session, if any.
    ///
    /// Unless the server was killed, the session loop then binds a new
    /// endpoint and waits for the signal to reconnect.  Calling this after
    /// the loop has stopped does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Close`] if shutting a socket down failed.
    pub async fn reset_server(&self) -> Result<(), HandlerError> {
        let (reply, rx) = oneshot::channel();
        if self.control_tx.send(ResetRequest { reply }).await.is_err() {
            debug!("reset requested after session loop stopped");
            return Ok(());
        }
        match rx.await {
            Ok(result) => result.map_err(HandlerError::Close),
            // The loop exited before serving the request; nothing left open.
            Err(_) => Ok(()),
        }
    }

    /// Stops the keep-alive and the session loop, then closes all sockets.
    ///
    /// The keep-alive is cancelled on the first call only.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Close`] if shutting a socket down failed.
    pub async fn kill_server(&self) -> Result<(), HandlerError> {
        info!("stopping signal server");
        self.stop.store(true, Ordering::SeqCst);
        self.cancel_keepalive();
        self.reset_server().await
    }

    /// Kills the server and waits for the session loop task to finish.
    ///
    /// # Errors
    ///
    /// See [`kill_server`](Self::kill_server).
    pub async fn stop(&self) -> Result<(), HandlerError> {
        let killed = self.kill_server().await;
        let task = lock(&self.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("session loop task failed: {e}");
            }
        }
        killed
    }

    /// Waits until the server is listening and returns the bound address.
    ///
    /// Returns `None` if the session loop stops first.
    pub async fn listening_addr(&self) -> Option<SocketAddr> {
        let mut rx = self.listening_rx.clone();
        let ready = rx.wait_for(Option::is_some).await;
        ready.ok().and_then(|addr| *addr)
    }

    /// Whether a signal session is currently open.
    pub fn is_signal_connected(&self) -> bool {
        self.queue.is_connected()
    }

    /// Whether [`kill_server`](Self::kill_server) has been called.
    pub fn is_killed(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    fn cancel_keepalive(&self) {
        if let Some(id) = lock(&self.keepalive).take() {
            self.scheduler.cancel_task(id);
            debug!("keep-alive {id} cancelled");
        }
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.cancel_keepalive();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
