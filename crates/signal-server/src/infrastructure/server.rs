//! Listener manager and session loop.
//!
//! One Tokio task owns the listening endpoint and at most one signal
//! session.  It cycles through:
//!
//! 1. **Listening**: bind if no endpoint exists.  A failed bind is logged and
//!    retried after `rebind_delay`.
//! 2. **Accepting**: wait for the signal to connect.  A failed accept drops
//!    the endpoint and waits `rebind_delay` before the next cycle binds a
//!    fresh one.
//! 3. **Serving**: flush the queue with the send/ack discipline, then sleep
//!    until a message arrives or `idle_wake` elapses.  The first messaging
//!    failure closes the session and the loop goes back to accepting.
//!
//! # Lifecycle requests
//!
//! Reset and kill arrive as [`ResetRequest`]s on an `mpsc` channel.  Every
//! suspension point (backoff sleep, accept, flush, idle sleep) races that
//! channel, so a request is served promptly even while a read is blocked
//! waiting for an ack.  Serving a request drops the endpoint, shuts the
//! session down, and replies with the close result.  The loop then exits if
//! the stop flag is set, or starts over by binding a new endpoint.
//!
//! Dropping every sender of the channel stops the loop as well.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use signal_core::MessageFraming;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::application::message_queue::MessageQueue;
use crate::application::transact::{TransactError, Transactor};
use crate::infrastructure::transport::{Listener, Transport};

/// Asks the session loop to close its sockets and start over.
#[derive(Debug)]
pub struct ResetRequest {
    /// Receives the result of closing the endpoint and session.
    pub reply: oneshot::Sender<io::Result<()>>,
}

/// Timers the session loop runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopTimers {
    /// Longest idle sleep between flush cycles.
    pub idle_wake: Duration,
    /// Backoff after a failed bind or accept.
    pub rebind_delay: Duration,
}

impl Default for LoopTimers {
    fn default() -> Self {
        Self {
            idle_wake: Duration::from_secs(60),
            rebind_delay: Duration::from_secs(5),
        }
    }
}

enum LoopEvent<S> {
    Accepted(io::Result<(S, String)>),
    Control(Option<ResetRequest>),
}

/// How a session ended.
enum SessionEnd {
    /// Messaging failed; the loop keeps the endpoint and accepts again.
    Failed(TransactError),
    /// A lifecycle request arrived (`None` when the channel closed).
    Interrupted(Option<ResetRequest>),
}

/// The task body that owns the endpoint and the session.
pub struct SessionLoop<T: Transport, F> {
    addr: SocketAddr,
    transport: T,
    queue: Arc<MessageQueue>,
    transactor: Transactor<F>,
    timers: LoopTimers,
    stop: Arc<AtomicBool>,
    control_rx: mpsc::Receiver<ResetRequest>,
    listening_tx: watch::Sender<Option<SocketAddr>>,
}

impl<T, F> SessionLoop<T, F>
where
    T: Transport,
    F: MessageFraming,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        addr: SocketAddr,
        transport: T,
        queue: Arc<MessageQueue>,
        transactor: Transactor<F>,
        timers: LoopTimers,
        stop: Arc<AtomicBool>,
        control_rx: mpsc::Receiver<ResetRequest>,
        listening_tx: watch::Sender<Option<SocketAddr>>,
    ) -> Self {
        Self {
            addr,
            transport,
            queue,
            transactor,
            timers,
            stop,
            control_rx,
            listening_tx,
        }
    }

    /// Runs until the stop flag is set and a request has been served, or the
    /// lifecycle channel closes.
    pub async fn run(mut self) {
        let mut listener: Option<T::Listener> = None;

        while !self.stop.load(Ordering::SeqCst) {
            let Some(active) = listener.as_mut() else {
                listener = self.open_listener().await;
                continue;
            };

            let event = tokio::select! {
                accepted = active.accept() => LoopEvent::Accepted(accepted),
                request = self.control_rx.recv() => LoopEvent::Control(request),
            };

            match event {
                LoopEvent::Accepted(Ok((stream, peer))) => {
                    if let Some((request, closed)) = self.serve(stream, &peer).await {
                        self.close_listener(&mut listener);
                        self.answer(request, closed);
                    }
                }
                LoopEvent::Accepted(Err(e)) => {
                    error!("failed to accept signal connection: {e}");
                    self.close_listener(&mut listener);
                    self.back_off().await;
                }
                LoopEvent::Control(request) => {
                    self.close_listener(&mut listener);
                    self.answer(request, Ok(()));
                }
            }
        }

        self.close_listener(&mut listener);
        info!("signal server stopped");
    }

    /// Binds a new endpoint, or backs off after a failure.
    async fn open_listener(&mut self) -> Option<T::Listener> {
        match self.transport.bind(self.addr).await {
            Ok(listener) => {
                let bound = listener.local_addr().unwrap_or(self.addr);
                info!("waiting for signal connection on {bound}");
                self.listening_tx.send_replace(Some(bound));
                Some(listener)
            }
            Err(e) => {
                error!("failed to create server socket on {}: {e}", self.addr);
                self.back_off().await;
                None
            }
        }
    }

    /// Sleeps `rebind_delay` with no endpoint open.  A lifecycle request cuts
    /// the sleep short and is answered at once.
    async fn back_off(&mut self) {
        let interrupted = tokio::select! {
            _ = tokio::time::sleep(self.timers.rebind_delay) => None,
            request = self.control_rx.recv() => Some(request),
        };
        if let Some(request) = interrupted {
            self.answer(request, Ok(()));
        }
    }

    /// Runs one session to its end and shuts the stream down.
    ///
    /// Returns the interrupting request and the close result if a lifecycle
    /// request ended the session.
    async fn serve<S>(
        &mut self,
        mut stream: S,
        peer: &str,
    ) -> Option<(Option<ResetRequest>, io::Result<()>)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        info!("signal connected from {peer}");
        self.queue.set_connected(true);

        let end = self.drive_session(&mut stream).await;

        self.queue.set_connected(false);
        let closed = close_stream(&mut stream).await;
        drop(stream);
        info!("signal session with {peer} closed");

        match end {
            SessionEnd::Failed(e) => {
                error!("signal messaging failed, closing connection: {e}");
                if let Err(e) = closed {
                    warn!("failed to close signal socket: {e}");
                }
                None
            }
            SessionEnd::Interrupted(request) => Some((request, closed)),
        }
    }

    async fn drive_session<S>(&mut self, stream: &mut S) -> SessionEnd
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let flushed = tokio::select! {
                flushed = self.transactor.flush(&self.queue, stream) => flushed,
                request = self.control_rx.recv() => return SessionEnd::Interrupted(request),
            };
            match flushed {
                Ok(0) => {}
                Ok(n) => debug!("delivered {n} message(s) to signal"),
                Err(e) => return SessionEnd::Failed(e),
            }

            let woken = tokio::select! {
                woken = self.queue.wait_for_message(self.timers.idle_wake) => woken,
                request = self.control_rx.recv() => return SessionEnd::Interrupted(request),
            };
            if !woken {
                debug!("idle wake after {:?}", self.timers.idle_wake);
            }
        }
    }

    fn close_listener(&self, listener: &mut Option<T::Listener>) {
        if listener.take().is_some() {
            debug!("closed listening socket on {}", self.addr);
            self.listening_tx.send_replace(None);
        }
    }

    /// Replies to a served request.  A closed channel means the handler is
    /// gone, which stops the loop.
    fn answer(&self, request: Option<ResetRequest>, result: io::Result<()>) {
        match request {
            Some(request) => {
                if let Err(e) = &result {
                    error!("failed to close signal sockets: {e}");
                }
                // The requester may have given up waiting.
                let _ = request.reply.send(result);
            }
            None => {
                debug!("lifecycle channel closed");
                self.stop.store(true, Ordering::SeqCst);
            }
        }
    }
}

/// Shuts the write side down.  A peer that already went away counts as closed.
async fn close_stream<S>(stream: &mut S) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    match stream.shutdown().await {
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::transact::AckLimits;
    use crate::infrastructure::transport::MemoryTransport;
    use signal_core::NullTerminatedFraming;
    use tokio::io::AsyncReadExt;

    struct Harness {
        transport: MemoryTransport,
        queue: Arc<MessageQueue>,
        stop: Arc<AtomicBool>,
        control_tx: mpsc::Sender<ResetRequest>,
        listening_rx: watch::Receiver<Option<SocketAddr>>,
        task: tokio::task::JoinHandle<()>,
    }

    fn spawn_loop() -> Harness {
        let transport = MemoryTransport::new();
        let queue = Arc::new(MessageQueue::new(5));
        let stop = Arc::new(AtomicBool::new(false));
        let (control_tx, control_rx) = mpsc::channel(4);
        let (listening_tx, listening_rx) = watch::channel(None);
        let session = SessionLoop::new(
            "127.0.0.1:19100".parse().unwrap(),
            transport.clone(),
            Arc::clone(&queue),
            Transactor::new(NullTerminatedFraming, AckLimits::default()),
            LoopTimers::default(),
            Arc::clone(&stop),
            control_rx,
            listening_tx,
        );
        let task = tokio::spawn(session.run());
        Harness {
            transport,
            queue,
            stop,
            control_tx,
            listening_rx,
            task,
        }
    }

    async fn reset(control_tx: &mpsc::Sender<ResetRequest>) -> io::Result<()> {
        let (reply, rx) = oneshot::channel();
        control_tx.send(ResetRequest { reply }).await.unwrap();
        rx.await.unwrap()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_bound_address() {
        let mut h = spawn_loop();

        let addr = *h.listening_rx.wait_for(|a| a.is_some()).await.unwrap();

        assert_eq!(addr, Some("127.0.0.1:19100".parse().unwrap()));
        assert!(h.transport.is_listening());
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_session_marks_queue_connected() {
        // Arrange
        let h = spawn_loop();

        // Act
        let _device = h.transport.connect();
        let queue = Arc::clone(&h.queue);
        wait_until(|| queue.is_connected()).await;

        // Assert
        assert!(h.queue.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_closes_session_and_rebinds() {
        // Arrange
        let mut h = spawn_loop();
        let mut device = h.transport.connect();
        let queue = Arc::clone(&h.queue);
        wait_until(|| queue.is_connected()).await;

        // Act
        reset(&h.control_tx).await.unwrap();

        // Assert: the device sees end-of-stream and the loop listens again
        let mut buf = [0u8; 1];
        assert_eq!(device.read(&mut buf).await.unwrap(), 0);
        assert!(!h.queue.is_connected());
        h.listening_rx.wait_for(|a| a.is_some()).await.unwrap();
        assert_eq!(h.transport.bind_attempts(), 2);
        assert!(!h.task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_flag_with_reset_ends_loop() {
        let h = spawn_loop();

        h.stop.store(true, Ordering::SeqCst);
        reset(&h.control_tx).await.unwrap();

        h.task.await.unwrap();
        assert!(!h.transport.is_listening());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_control_channel_ends_loop() {
        let h = spawn_loop();
        let transport = h.transport.clone();

        drop(h.control_tx);

        h.task.await.unwrap();
        assert!(!transport.is_listening());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_interrupts_bind_backoff() {
        // Arrange: every bind fails
        let transport = MemoryTransport::new();
        transport.fail_next_binds(usize::MAX);
        let stop = Arc::new(AtomicBool::new(false));
        let (control_tx, control_rx) = mpsc::channel(4);
        let (listening_tx, _listening_rx) = watch::channel(None);
        let session = SessionLoop::new(
            "127.0.0.1:19100".parse().unwrap(),
            transport.clone(),
            Arc::new(MessageQueue::new(5)),
            Transactor::new(NullTerminatedFraming, AckLimits::default()),
            LoopTimers::default(),
            Arc::clone(&stop),
            control_rx,
            listening_tx,
        );
        let task = tokio::spawn(session.run());
        tokio::task::yield_now().await;

        // Act
        let started = tokio::time::Instant::now();
        stop.store(true, Ordering::SeqCst);
        reset(&control_tx).await.unwrap();
        task.await.unwrap();

        // Assert: served without waiting out the backoff
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(transport.bind_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_failure_waits_before_rebinding() {
        // Arrange: the first accept fails
        let h = spawn_loop();
        h.transport.fail_next_accepts(1);

        // Act
        let transport = h.transport.clone();
        wait_until(|| transport.accept_attempts() == 1).await;
        tokio::time::sleep(Duration::from_secs(4)).await;
        let binds_during_backoff = h.transport.bind_attempts();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        // Assert: one endpoint during the delay, a fresh one after it
        assert_eq!(binds_during_backoff, 1);
        assert_eq!(h.transport.bind_attempts(), 2);
        assert!(h.transport.is_listening());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_interrupts_accept_failure_backoff() {
        // Arrange
        let h = spawn_loop();
        h.transport.fail_next_accepts(1);
        let transport = h.transport.clone();
        wait_until(|| transport.accept_attempts() == 1).await;

        // Act
        let started = tokio::time::Instant::now();
        h.stop.store(true, Ordering::SeqCst);
        reset(&h.control_tx).await.unwrap();
        h.task.await.unwrap();

        // Assert
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(h.transport.bind_attempts(), 1);
    }

    #[tokio::test]
    async fn test_close_stream_signals_end_of_stream_to_peer() {
        // Arrange
        let (mut server, mut device) = tokio::io::duplex(8);

        // Act
        close_stream(&mut server).await.unwrap();

        // Assert
        let mut buf = [0u8; 1];
        assert_eq!(device.read(&mut buf).await.unwrap(), 0);
    }
}
