//! Bounded outbound queue with the connected/disconnected enqueue policy.
//!
//! Producers (operator commands, the keep-alive callback) push from any task;
//! the session loop is the single consumer.  The queue also carries the
//! "is a signal connected?" flag, written only by the session loop, under the
//! same lock producers read it through, so a producer always sees the regime
//! that was current when its message was inserted.
//!
//! # Two regimes
//!
//! - **Disconnected**: every push clears the queue first.  Only the freshest
//!   command matters once the signal comes back, and nothing grows while no
//!   one is draining.
//! - **Connected**: pushes append up to `capacity` and wake the session loop.
//!   A full queue rejects the push; nothing is silently evicted.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tracing::{error, warn};

/// Error returned when a message cannot be queued.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("signal message queue is full ({capacity} pending); message dropped")]
    Full { capacity: usize },
}

/// How a successful push was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Appended behind the messages already pending for a connected signal.
    Appended,
    /// Stored as the only pending message because no signal is connected.
    Replaced,
}

/// An opaque payload waiting to be delivered to the signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage(Vec<u8>);

impl PendingMessage {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for PendingMessage {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for PendingMessage {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<PendingMessage>,
    connected: bool,
}

/// The shared outbound queue.
#[derive(Debug)]
pub struct MessageQueue {
    state: Mutex<QueueState>,
    wake: Notify,
    capacity: usize,
}

impl MessageQueue {
    /// Creates an empty queue in the disconnected regime.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
            capacity,
        }
    }

    /// Queues `message` according to the current regime.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Full`] if a signal is connected and `capacity`
    /// messages are already pending.
    pub fn push(&self, message: impl Into<PendingMessage>) -> Result<Enqueued, QueueError> {
        let state = self.lock();
        self.push_locked(state, message.into())
    }

    /// Queues `message` only if a signal is connected at this instant.
    ///
    /// Returns `None` without touching the queue when disconnected; the
    /// regime check and the insert happen under one lock.
    pub fn push_if_connected(
        &self,
        message: impl Into<PendingMessage>,
    ) -> Option<Result<Enqueued, QueueError>> {
        let state = self.lock();
        if !state.connected {
            return None;
        }
        Some(self.push_locked(state, message.into()))
    }

    fn push_locked(
        &self,
        mut state: MutexGuard<'_, QueueState>,
        message: PendingMessage,
    ) -> Result<Enqueued, QueueError> {
        if !state.connected {
            state.messages.clear();
            state.messages.push_back(message);
            warn!(
                "message added while signal disconnected; only the most recent message will be \
                 sent once connected"
            );
            return Ok(Enqueued::Replaced);
        }

        if state.messages.len() >= self.capacity {
            error!("signal message queue size exceeded; ignoring message");
            return Err(QueueError::Full {
                capacity: self.capacity,
            });
        }

        state.messages.push_back(message);
        drop(state);
        self.wake.notify_one();
        Ok(Enqueued::Appended)
    }

    /// Removes the oldest pending message.
    pub fn pop(&self) -> Option<PendingMessage> {
        self.lock().messages.pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().messages.is_empty()
    }

    /// Copies of the pending messages, oldest first.
    pub fn snapshot(&self) -> Vec<PendingMessage> {
        self.lock().messages.iter().cloned().collect()
    }

    /// Whether messages are currently deliverable to a connected signal.
    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Switches regime.  Called only by the session loop on accept and close.
    pub(crate) fn set_connected(&self, connected: bool) {
        self.lock().connected = connected;
    }

    /// Sleeps until a connected-regime push wakes the queue or `timeout` elapses.
    ///
    /// Returns `true` if woken by a push.  A push that happened while the
    /// consumer was busy flushing is remembered, so the next call returns
    /// immediately instead of losing the wake.
    pub async fn wait_for_message(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wake.notified())
            .await
            .is_ok()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A panic while holding this lock cannot leave the state half-updated
        // (every critical section is a single collection operation), so a
        // poisoned lock is still safe to use.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn connected_queue() -> MessageQueue {
        let queue = MessageQueue::new(5);
        queue.set_connected(true);
        queue
    }

    #[test]
    fn test_new_queue_is_empty_and_disconnected() {
        let queue = MessageQueue::new(5);
        assert!(queue.is_empty());
        assert!(!queue.is_connected());
    }

    #[test]
    fn test_disconnected_push_keeps_only_latest() {
        // Arrange
        let queue = MessageQueue::new(5);

        // Act
        for payload in [b"A\0", b"B\0", b"C\0"] {
            assert_eq!(queue.push(&payload[..]), Ok(Enqueued::Replaced));
        }

        // Assert
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().unwrap().as_bytes(), b"C\0");
    }

    #[test]
    fn test_disconnected_push_never_rejects() {
        // Even far more pushes than capacity succeed while disconnected.
        let queue = MessageQueue::new(2);
        for i in 0..10u8 {
            assert!(queue.push(vec![i]).is_ok());
        }
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_connected_push_appends_in_order() {
        // Arrange
        let queue = connected_queue();

        // Act
        queue.push(&b"A"[..]).unwrap();
        queue.push(&b"B"[..]).unwrap();
        queue.push(&b"C"[..]).unwrap();

        // Assert
        let order: Vec<Vec<u8>> = std::iter::from_fn(|| queue.pop())
            .map(PendingMessage::into_bytes)
            .collect();
        assert_eq!(order, vec![b"A".to_vec(), b"B".to_vec(), b"C".to_vec()]);
    }

    #[test]
    fn test_connected_push_rejects_sixth_message() {
        // Arrange
        let queue = connected_queue();
        for i in 0..5u8 {
            assert_eq!(queue.push(vec![i]), Ok(Enqueued::Appended));
            assert_eq!(queue.len(), usize::from(i) + 1);
        }

        // Act
        let result = queue.push(vec![99]);

        // Assert
        assert_eq!(result, Err(QueueError::Full { capacity: 5 }));
        assert_eq!(queue.len(), 5);
        assert!(!queue.snapshot().contains(&PendingMessage::from(vec![99])));
    }

    #[test]
    fn test_disconnect_after_full_collapses_on_next_push() {
        // Arrange: fill while connected, then lose the signal
        let queue = connected_queue();
        for i in 0..5u8 {
            queue.push(vec![i]).unwrap();
        }
        queue.set_connected(false);

        // Act
        queue.push(&b"latest"[..]).unwrap();

        // Assert
        assert_eq!(queue.snapshot(), vec![PendingMessage::from(&b"latest"[..])]);
    }

    #[test]
    fn test_push_if_connected_skips_when_disconnected() {
        // Arrange: a user command is waiting for the signal to come back
        let queue = MessageQueue::new(5);
        queue.push(&b"user"[..]).unwrap();

        // Act
        let result = queue.push_if_connected(&b"ping"[..]);

        // Assert: the pending command is not superseded
        assert!(result.is_none());
        assert_eq!(queue.snapshot(), vec![PendingMessage::from(&b"user"[..])]);
    }

    #[test]
    fn test_push_if_connected_applies_capacity() {
        let queue = connected_queue();
        for i in 0..5u8 {
            assert_eq!(queue.push_if_connected(vec![i]), Some(Ok(Enqueued::Appended)));
        }
        assert_eq!(
            queue.push_if_connected(vec![5]),
            Some(Err(QueueError::Full { capacity: 5 }))
        );
    }

    #[test]
    fn test_pop_on_empty_returns_none() {
        assert!(MessageQueue::new(5).pop().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_message_times_out_without_push() {
        let queue = connected_queue();
        assert!(!queue.wait_for_message(Duration::from_secs(60)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_push_wakes_waiter() {
        // Arrange
        let queue = Arc::new(connected_queue());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.wait_for_message(Duration::from_secs(60)).await })
        };
        tokio::task::yield_now().await;

        // Act
        queue.push(&b"A"[..]).unwrap();

        // Assert
        assert!(waiter.await.unwrap(), "push must wake the idle consumer");
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_before_wait_is_not_lost() {
        // A push that lands while the consumer is busy must still cut the
        // next idle sleep short.
        let queue = connected_queue();
        queue.push(&b"A"[..]).unwrap();
        assert!(queue.wait_for_message(Duration::from_secs(60)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_push_does_not_wake() {
        let queue = MessageQueue::new(5);
        queue.push(&b"A"[..]).unwrap();
        assert!(!queue.wait_for_message(Duration::from_secs(1)).await);
    }

    #[test]
    fn test_concurrent_producers_respect_capacity() {
        // Arrange
        let queue = Arc::new(connected_queue());

        // Act: 8 threads race to push 10 messages each
        let accepted: usize = (0..8u8)
            .map(|t| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    (0..10u8).filter(|i| queue.push(vec![t, *i]).is_ok()).count()
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().expect("producer panicked"))
            .sum();

        // Assert
        assert_eq!(accepted, 5);
        assert_eq!(queue.len(), 5);
    }
}
