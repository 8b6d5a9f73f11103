//! Status reporting to the outside world
//!
//! The orchestrator reports coarse connection states and session snapshots
//! to any number of observers. Observers see each distinct update once.

use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::communicator::Snapshot;

/// Coarse view of the link to the simulator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No communicator accepted a connection
    ConnectorNotRunning,
    /// TCP connection is up, registration pending
    ConnectorRunning,
    /// Registered with the communicator
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectionStatus::ConnectorNotRunning => "Connector not running",
            ConnectionStatus::ConnectorRunning => "Connector running",
            ConnectionStatus::Connected => "Connected",
        };
        f.write_str(text)
    }
}

/// What observers are told about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    Connection(ConnectionStatus),
    Snapshot(Snapshot),
}

/// Receives status updates from the orchestrator
///
/// Called on the orchestrator task; implementations must not block.
pub trait StatusObserver: Send + Sync {
    fn status_changed(&self, update: &StatusUpdate);
}

/// Writes every update to the log
#[derive(Debug, Default)]
pub struct LoggingObserver;

impl StatusObserver for LoggingObserver {
    fn status_changed(&self, update: &StatusUpdate) {
        match update {
            StatusUpdate::Connection(status) => info!(%status, "Connection status changed"),
            StatusUpdate::Snapshot(snapshot) => info!(
                name = %snapshot.name,
                region = %snapshot.region,
                online = snapshot.is_online(),
                simzeit = %snapshot.sim_clock,
                "Session changed"
            ),
        }
    }
}

/// Everything the status socket reports
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonStatus {
    /// `None` until the first tick has run
    pub connection: Option<ConnectionStatus>,
    pub registered: bool,
    pub snapshot: Option<Snapshot>,
}

/// Latest status, shared between the orchestrator and the IPC server
#[derive(Debug, Clone, Default)]
pub struct SharedStatus {
    inner: Arc<RwLock<DaemonStatus>>,
}

impl SharedStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current status
    pub fn get(&self) -> DaemonStatus {
        match self.inner.read() {
            Ok(status) => status.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl StatusObserver for SharedStatus {
    fn status_changed(&self, update: &StatusUpdate) {
        let mut status = match self.inner.write() {
            Ok(status) => status,
            Err(poisoned) => poisoned.into_inner(),
        };

        match update {
            StatusUpdate::Connection(connection) => {
                status.connection = Some(*connection);
                status.registered = *connection == ConnectionStatus::Connected;
                // A session snapshot only means something while registered
                if !status.registered {
                    status.snapshot = None;
                }
            }
            StatusUpdate::Snapshot(snapshot) => status.snapshot = Some(snapshot.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> Snapshot {
        Snapshot {
            name: "Hagen Hbf".to_string(),
            region: "Ruhrgebiet".to_string(),
            online: "true".to_string(),
            sim_clock: "13:07".to_string(),
            session_start: 1_700_000_000,
        }
    }

    #[test]
    fn test_connection_status_display() {
        assert_eq!(ConnectionStatus::ConnectorNotRunning.to_string(), "Connector not running");
        assert_eq!(ConnectionStatus::ConnectorRunning.to_string(), "Connector running");
        assert_eq!(ConnectionStatus::Connected.to_string(), "Connected");
    }

    #[test]
    fn test_shared_status_tracks_updates() {
        let shared = SharedStatus::new();
        assert_eq!(shared.get(), DaemonStatus::default());

        shared.status_changed(&StatusUpdate::Connection(ConnectionStatus::Connected));
        shared.status_changed(&StatusUpdate::Snapshot(snapshot()));

        let status = shared.get();
        assert_eq!(status.connection, Some(ConnectionStatus::Connected));
        assert!(status.registered);
        assert_eq!(status.snapshot, Some(snapshot()));
    }

    #[test]
    fn test_shared_status_drops_snapshot_on_disconnect() {
        let shared = SharedStatus::new();
        shared.status_changed(&StatusUpdate::Connection(ConnectionStatus::Connected));
        shared.status_changed(&StatusUpdate::Snapshot(snapshot()));

        shared.status_changed(&StatusUpdate::Connection(ConnectionStatus::ConnectorNotRunning));

        let status = shared.get();
        assert!(!status.registered);
        assert_eq!(status.snapshot, None);
    }

    #[test]
    fn test_daemon_status_json_shape() {
        let status = DaemonStatus {
            connection: Some(ConnectionStatus::ConnectorRunning),
            registered: false,
            snapshot: None,
        };
        let json = serde_json::to_string(&status).unwrap();

        assert_eq!(
            json,
            r#"{"connection":"connector_running","registered":false,"snapshot":null}"#
        );
    }
}
