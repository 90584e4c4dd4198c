//! Send/ack transactor: delivers queued messages one at a time.
//!
//! For each message the transactor writes the full payload, then reads the
//! signal's reply in small chunks until the reply is a complete frame, the
//! reply grows past the size cap, the stream ends, or a read times out.  The
//! accumulated reply must be an ack before the next message is sent.
//!
//! Delivery is at most once: a message is removed from the queue before it
//! is written and is never retried.  The first failure aborts the whole flush
//! and is returned to the session loop, which closes the connection.
//!
//! The transactor is generic over any `AsyncRead + AsyncWrite` stream so it
//! can be driven by a TCP socket in production and by scripted in-memory
//! streams in tests.

use std::time::Duration;

use signal_core::MessageFraming;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::application::message_queue::{MessageQueue, PendingMessage};

/// Errors that abort a flush.
#[derive(Debug, Error)]
pub enum TransactError {
    /// Writing the payload or reading the reply failed.
    #[error("signal I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The signal sent nothing within the read timeout.
    #[error("timed out after {after:?} waiting for ack from signal")]
    Timeout { after: Duration },

    /// The reply was not an ack (wrong frame, truncated, or oversized).
    #[error("did not receive expected ack from signal (got {} bytes)", received.len())]
    UnexpectedResponse { received: Vec<u8> },
}

/// Size and time bounds applied to every ack wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckLimits {
    /// Bytes requested per read.
    pub read_chunk: usize,
    /// Replies longer than this stop the read loop.
    pub max_response: usize,
    /// Per-read timeout.
    pub read_timeout: Duration,
}

impl Default for AckLimits {
    fn default() -> Self {
        Self {
            read_chunk: 16,
            max_response: 64,
            read_timeout: Duration::from_millis(2000),
        }
    }
}

/// Why the response read loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStop {
    /// The accumulated bytes form a complete frame.
    Terminated,
    /// More than `max_response` bytes arrived without a complete frame.
    Oversized,
    /// The signal closed its side of the stream.
    EndOfStream,
}

/// The bytes read back from the signal for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub bytes: Vec<u8>,
    pub stop: ReadStop,
}

/// Delivers messages under the strict request/acknowledge discipline.
#[derive(Debug, Clone)]
pub struct Transactor<F> {
    framing: F,
    limits: AckLimits,
}

impl<F: MessageFraming> Transactor<F> {
    pub fn new(framing: F, limits: AckLimits) -> Self {
        Self { framing, limits }
    }

    /// Drains `queue` against `stream`, one acked message at a time.
    ///
    /// Returns the number of messages acknowledged.  Returns `Ok(0)`
    /// immediately when the queue is empty or no signal is connected.
    ///
    /// # Errors
    ///
    /// Returns the first [`TransactError`]; the failed message has already
    /// been removed from the queue and is not retried.
    pub async fn flush<S>(
        &self,
        queue: &MessageQueue,
        stream: &mut S,
    ) -> Result<usize, TransactError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut delivered = 0;
        while queue.is_connected() {
            let Some(message) = queue.pop() else {
                break;
            };
            self.transact(stream, &message).await?;
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Writes one message and waits for its ack.
    ///
    /// # Errors
    ///
    /// See [`TransactError`].
    pub async fn transact<S>(
        &self,
        stream: &mut S,
        message: &PendingMessage,
    ) -> Result<(), TransactError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream.write_all(message.as_bytes()).await?;
        stream.flush().await?;
        debug!("sent {} bytes to signal", message.as_bytes().len());

        let response = self.read_response(stream).await?;
        if response.stop == ReadStop::Oversized {
            warn!(
                "signal response exceeded {} bytes without a terminator",
                self.limits.max_response
            );
        }

        if !self.framing.is_ack(&response.bytes) {
            return Err(TransactError::UnexpectedResponse {
                received: response.bytes,
            });
        }
        debug!("signal acknowledged message");
        Ok(())
    }

    /// Reads the signal's reply until it is complete, oversized, or the stream ends.
    ///
    /// The accumulated reply never exceeds `max_response` bytes: a chunk that
    /// would push the total past the cap is discarded and the loop stops.
    ///
    /// # Errors
    ///
    /// Returns [`TransactError::Timeout`] if any single read exceeds
    /// `read_timeout`, or [`TransactError::Io`] if a read fails.
    pub async fn read_response<S>(&self, stream: &mut S) -> Result<Response, TransactError>
    where
        S: AsyncRead + Unpin,
    {
        let mut bytes = Vec::with_capacity(self.limits.max_response);
        let mut chunk = vec![0u8; self.limits.read_chunk.max(1)];
        let mut total = 0usize;

        let stop = loop {
            let n = tokio::time::timeout(self.limits.read_timeout, stream.read(&mut chunk))
                .await
                .map_err(|_| TransactError::Timeout {
                    after: self.limits.read_timeout,
                })??;
            if n == 0 {
                break ReadStop::EndOfStream;
            }

            total += n;
            if total > self.limits.max_response {
                break ReadStop::Oversized;
            }

            bytes.extend_from_slice(&chunk[..n]);
            if self.framing.is_terminated(&bytes) {
                break ReadStop::Terminated;
            }
        };

        Ok(Response { bytes, stop })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
