//! Rich presence publishing
//!
//! - `PresenceProvider`: the three calls a presence service must support
//! - `DiscordIpc`: the Discord desktop client implementation
//! - `PresenceWorkerHandle`: runs a provider on its own thread, fed with snapshots

mod discord;
mod provider;
mod worker;

pub use discord::DiscordIpc;
pub use provider::{Activity, PresenceError, PresenceProvider};
pub use worker::{PresenceWorkerHandle, ProviderFactory, WorkerMessage, WorkerSettings};
