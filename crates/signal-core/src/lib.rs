//! # signal-core
//!
//! Shared wire rules for the train signal link.
//!
//! The signal speaks a raw byte stream: every frame the server sends is a
//! command payload followed by a NUL terminator, and every command must be
//! answered by the signal with an acknowledgement frame before the next one
//! may be sent.  This crate owns those byte-level rules so that the server,
//! its tests and any tooling agree on them.
//!
//! It has no dependencies on sockets, async runtimes or the OS.
//!
//! - **`protocol`** – The [`MessageFraming`] trait the server consults to
//!   decide whether a response is complete and whether it is an ack, plus the
//!   default [`NullTerminatedFraming`] implementation.

pub mod protocol;

pub use protocol::framing::{
    frame_payload, MessageFraming, NullTerminatedFraming, ACK_MESSAGE, PING_MESSAGE, TERMINATOR,
};
