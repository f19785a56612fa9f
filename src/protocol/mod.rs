// src/protocol/mod.rs

//! Worker-coordination protocol and the client protocol.
//!
//! Every exchange is idempotent on retransmission: the coordinator ignores a
//! duplicate `TaskReport` for a finished task and a worker rejects a
//! duplicate `Dispatch` with `AlreadyRunning`.

pub mod codec;
pub mod messages;

pub use messages::*;
