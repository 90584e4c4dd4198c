//! Protocol module containing the framing rules for the signal link.

pub mod framing;

pub use framing::{frame_payload, MessageFraming, NullTerminatedFraming};
