//! Presence provider boundary
//!
//! Everything the worker needs from a rich-presence service fits into three
//! calls. Keeping them behind a trait lets the worker run against Discord
//! in production and against a recording fake in tests.

use std::path::PathBuf;

use thiserror::Error;

use crate::communicator::Snapshot;

/// Errors raised by presence providers
#[derive(Debug, Error)]
pub enum PresenceError {
    /// No presence service socket was found
    #[error("No Discord IPC socket found (tried {tried} path(s)) - is Discord running?")]
    SocketNotFound { tried: usize },

    /// Failed to connect to a socket that exists
    #[error("Failed to connect to Discord IPC socket at {path}: {source}")]
    ConnectionFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Discord IPC I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid Discord IPC payload: {0}")]
    Json(#[from] serde_json::Error),

    /// The service rejected or did not complete the handshake
    #[error("Discord IPC handshake failed: {message}")]
    Handshake { message: String },

    /// The service closed the session
    #[error("Discord IPC connection closed")]
    Closed,
}

/// What gets shown as the user's activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activity {
    /// First line, the signal box name
    pub details: String,
    /// Second line, `Online, 13:07` or `Offline, 13:07`
    pub state: String,
    /// Session start (unix seconds), rendered as elapsed time
    pub start_timestamp: u64,
    /// Asset key of the large image
    pub large_image: String,
}

impl Activity {
    pub fn from_snapshot(snapshot: &Snapshot, large_image: &str) -> Self {
        let online = if snapshot.is_online() { "Online" } else { "Offline" };
        Self {
            details: snapshot.name.clone(),
            state: format!("{}, {}", online, snapshot.sim_clock),
            start_timestamp: snapshot.session_start,
            large_image: large_image.to_string(),
        }
    }
}

/// A rich-presence service session
///
/// Calls are fire-and-forget: a successful return means the request was
/// handed to the service, and its outcome is reported when the provider's
/// callbacks are pumped with `run_callbacks`.
pub trait PresenceProvider: Send {
    /// Returns the name of this presence provider (for logging)
    fn name(&self) -> &'static str;

    /// Replace the current activity
    fn publish(&mut self, activity: &Activity) -> Result<(), PresenceError>;

    /// Remove the activity
    fn clear(&mut self) -> Result<(), PresenceError>;

    /// Process pending responses from the service without blocking
    fn run_callbacks(&mut self) -> Result<(), PresenceError>;
}
