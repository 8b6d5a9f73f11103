//! Error types for communicator operations

use thiserror::Error;

use super::types::QueryState;

/// Errors surfaced by the `ProtocolClient` API
///
/// Connection-fatal socket errors never appear here; the client recovers from
/// them locally by dropping the socket and reporting `Disconnected`.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No socket is open
    #[error("Not connected to the communicator")]
    NotConnected,

    /// Another request is still waiting for its response
    #[error("A {pending:?} query is still outstanding")]
    QueryPending { pending: QueryState },

    /// The TCP connect was refused or failed
    #[error("Failed to connect to communicator at {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The TCP connect did not finish in time
    #[error("Timed out connecting to communicator at {addr}")]
    ConnectTimeout { addr: String },

    /// Request could not be serialized
    #[error("Failed to encode request: {0}")]
    Encode(#[from] CodecError),

    /// Writing a request to the socket failed
    #[error("Failed to send request to communicator: {0}")]
    SendFailed(#[source] std::io::Error),
}

/// Errors from encoding or decoding a single XML element
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Malformed XML: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("Malformed attribute: {0}")]
    Attribute(#[from] quick_xml::events::attributes::AttrError),

    #[error("Element is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// The element slice ended before its root was closed
    #[error("Element ended before its closing tag")]
    Truncated,
}
