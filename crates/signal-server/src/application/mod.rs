//! Application layer: the outbound queue and the send/ack discipline.
//!
//! Nothing here opens sockets or spawns tasks.  [`transact::Transactor`]
//! works on any `AsyncRead + AsyncWrite` stream, so the same code drives a
//! TCP socket in production and a scripted mock in tests.
//!
//! - **`message_queue`** – Bounded queue with the connected/disconnected
//!   enqueue policy.
//! - **`transact`** – Writes one message at a time and waits for the
//!   signal's ack before the next.

pub mod message_queue;
pub mod transact;
