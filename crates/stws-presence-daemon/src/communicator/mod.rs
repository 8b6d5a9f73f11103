//! StellwerkSim communicator client
//!
//! This module talks to the communicator's plugin interface, a TCP socket
//! the simulator opens on the local machine. It lets stws-presence:
//! - Register as a plugin
//! - Query the signal box name, region and online flag
//! - Query the in-game clock
//!
//! ## Architecture
//!
//! - `WireCodec`: frames and parses the flat XML element stream (no I/O)
//! - `ProtocolClient`: owns the socket and runs the request/response state machine
//! - `ClientError` / `CodecError`: error types for the two layers
//!
//! ## Protocol
//!
//! Each message is a single XML element terminated by a newline. There is
//! no XML declaration and no document root. Only one request may be
//! outstanding at a time; see `ProtocolClient` for the handshake.

mod client;
mod codec;
mod error;
mod types;

pub use client::ProtocolClient;
pub use error::ClientError;
pub use types::Snapshot;
