//! Infrastructure layer: sockets, timers, configuration and the public handle.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `signal_core`, but MUST NOT be imported by the `application` layer.

pub mod handler;
pub mod scheduler;
pub mod server;
pub mod storage;
pub mod transport;
