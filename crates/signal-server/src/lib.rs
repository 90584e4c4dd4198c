//! signal-server library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # Architecture
//!
//! ```text
//! control process ──add_message──▶ MessageQueue ──flush──▶ signal (TCP)
//!        │                              ▲                      │
//!        └──reset/kill──▶ SessionLoop ──┘◀──────── ack ────────┘
//!                              ▲
//!                   keep-alive ping every 10 s
//! ```
//!
//! The server accepts exactly one signal at a time.  Every message must be
//! acknowledged before the next is sent, and a message whose exchange fails
//! is dropped rather than retried.

pub mod application;
pub mod infrastructure;

pub use application::message_queue::{Enqueued, MessageQueue, PendingMessage, QueueError};
pub use application::transact::{AckLimits, TransactError, Transactor};
pub use infrastructure::handler::{ConnectionHandler, HandlerError};
pub use infrastructure::scheduler::{Scheduler, TaskCallback, TaskId, TokioScheduler};
pub use infrastructure::storage::config::{load_config, ConfigError, ServerConfig};
pub use infrastructure::transport::{MemoryTransport, TcpTransport, Transport};
