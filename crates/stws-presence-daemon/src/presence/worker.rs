//! Presence worker thread
//!
//! Presence providers are synchronous and may block on their socket, so they
//! live on a dedicated OS thread. The orchestrator talks to it only through
//! an unbounded channel of `WorkerMessage`s and never waits on it, except
//! for a bounded join at shutdown.
//!
//! ## Loop
//!
//! Each iteration takes at most one message without blocking, publishes a
//! snapshot if it differs from the last one, pumps the provider callbacks and
//! sleeps the idle delay. `Shutdown` or a dropped sender ends the loop.

use std::any::Any;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use stws_presence_config::PresenceConfig;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, trace, warn};

use super::provider::{Activity, PresenceError, PresenceProvider};
use crate::communicator::Snapshot;

/// Messages from the orchestrator to the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerMessage {
    Snapshot(Snapshot),
    Shutdown,
}

/// Creates the provider on the worker thread
pub type ProviderFactory =
    Box<dyn FnOnce() -> Result<Box<dyn PresenceProvider>, PresenceError> + Send + 'static>;

/// Tunables of the worker loop
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Asset key shown as the large image
    pub large_image: String,
    /// Sleep between loop iterations
    pub idle: Duration,
    /// How long `shutdown` waits for the thread before detaching it
    pub join_timeout: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &PresenceConfig) -> Self {
        Self {
            large_image: config.large_image.clone(),
            idle: config.idle,
            join_timeout: config.join_timeout,
        }
    }
}

/// Owning handle to a running presence worker
///
/// Dropping the handle closes the channel, which the worker treats like
/// `Shutdown`, but does not wait for the thread.
#[derive(Debug)]
pub struct PresenceWorkerHandle {
    sender: UnboundedSender<WorkerMessage>,
    thread: Option<JoinHandle<()>>,
    join_timeout: Duration,
}

impl PresenceWorkerHandle {
    /// Start the worker thread
    ///
    /// The provider is created by `factory` on the new thread. If that
    /// fails the worker still runs and discards every message.
    ///
    /// # Errors
    ///
    /// Returns an error only if the OS refuses to create the thread.
    pub fn spawn(factory: ProviderFactory, settings: WorkerSettings) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let join_timeout = settings.join_timeout;

        let thread = thread::Builder::new()
            .name("presence-worker".to_string())
            .spawn(move || run(factory, receiver, settings))?;

        debug!("Presence worker started");

        Ok(Self {
            sender,
            thread: Some(thread),
            join_timeout,
        })
    }

    /// Queue a snapshot for publication
    ///
    /// Does nothing if the worker has already exited.
    pub fn send_snapshot(&self, snapshot: Snapshot) {
        if self.sender.send(WorkerMessage::Snapshot(snapshot)).is_err() {
            trace!("Presence worker gone, snapshot dropped");
        }
    }

    /// Whether the worker thread is still alive
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|thread| !thread.is_finished())
    }

    /// Stop the worker and wait for it, at most `join_timeout`
    ///
    /// Messages queued before this call are processed first. A panic on the
    /// worker thread is reported here; on timeout the thread is detached.
    pub async fn shutdown(mut self) {
        if self.sender.send(WorkerMessage::Shutdown).is_err() {
            trace!("Presence worker already stopped");
        }

        let Some(thread) = self.thread.take() else {
            return;
        };

        let join = tokio::task::spawn_blocking(move || thread.join());
        match tokio::time::timeout(self.join_timeout, join).await {
            Ok(Ok(Ok(()))) => debug!("Presence worker stopped"),
            Ok(Ok(Err(panic))) => {
                error!(reason = %panic_message(&*panic), "Presence worker panicked");
            }
            Ok(Err(e)) => error!(error = %e, "Failed to join presence worker"),
            Err(_) => warn!(
                timeout_ms = self.join_timeout.as_millis() as u64,
                "Presence worker did not stop in time, detaching it"
            ),
        }
    }
}

impl Drop for PresenceWorkerHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.sender.send(WorkerMessage::Shutdown);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}

/// Provider state inside the worker thread
struct Session {
    provider: Option<Box<dyn PresenceProvider>>,
    last_published: Option<Snapshot>,
    published_any: bool,
    large_image: String,
}

impl Session {
    fn publish(&mut self, snapshot: Snapshot) {
        if self.last_published.as_ref() == Some(&snapshot) {
            return;
        }

        if let Some(provider) = self.provider.as_mut() {
            let activity = Activity::from_snapshot(&snapshot, &self.large_image);
            match provider.publish(&activity) {
                Ok(()) => {
                    self.published_any = true;
                    debug!(details = %activity.details, state = %activity.state, "Updated presence");
                }
                Err(e) => self.fail("publish", e),
            }
        }
        self.last_published = Some(snapshot);
    }

    fn pump(&mut self) {
        if let Some(provider) = self.provider.as_mut() {
            if let Err(e) = provider.run_callbacks() {
                self.fail("callbacks", e);
            }
        }
    }

    fn clear(&mut self) {
        if !self.published_any {
            return;
        }
        if let Some(provider) = self.provider.as_mut() {
            match provider.clear() {
                Ok(()) => debug!("Cleared presence"),
                Err(e) => warn!(error = %e, "Failed to clear presence"),
            }
        }
    }

    fn fail(&mut self, operation: &str, e: PresenceError) {
        if matches!(e, PresenceError::Closed) {
            warn!(operation, "Presence session closed, further updates are discarded");
            self.provider = None;
        } else {
            error!(operation, error = %e, "Presence update failed");
        }
    }
}

fn run(
    factory: ProviderFactory,
    mut receiver: UnboundedReceiver<WorkerMessage>,
    settings: WorkerSettings,
) {
    let provider = match factory() {
        Ok(provider) => {
            info!(provider = provider.name(), "Presence provider ready");
            Some(provider)
        }
        Err(e) => {
            warn!(error = %e, "Presence provider unavailable, updates are discarded");
            None
        }
    };

    let mut session = Session {
        provider,
        last_published: None,
        published_any: false,
        large_image: settings.large_image,
    };

    loop {
        match receiver.try_recv() {
            Ok(WorkerMessage::Snapshot(snapshot)) => session.publish(snapshot),
            Ok(WorkerMessage::Shutdown) => break,
            Err(TryRecvError::Disconnected) => {
                debug!("Presence channel closed");
                break;
            }
            Err(TryRecvError::Empty) => {}
        }

        session.pump();
        thread::sleep(settings.idle);
    }

    session.clear();
    debug!("Presence worker exiting");
}
