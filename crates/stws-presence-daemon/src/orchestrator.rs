//! Main control loop
//!
//! The orchestrator owns the communicator client and the presence worker.
//! It runs one tick at a time on a single tokio task:
//!
//! 1. Disconnected: stop the worker, try to (re)connect with backoff
//! 2. Connected, not registered: poll the socket quickly until the handshake completes
//! 3. Registered: make sure a worker runs, schedule queries, forward new snapshots
//!
//! Stopping is cooperative. `ShutdownHandle::stop` is checked between ticks
//! and cuts the inter-tick sleep short; `wait_stopped` resolves once the
//! worker has been joined and the socket closed.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use stws_presence_config::Config;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::communicator::{ClientError, ProtocolClient, Snapshot};
use crate::observer::{ConnectionStatus, StatusObserver, StatusUpdate};
use crate::presence::{
    DiscordIpc, PresenceError, PresenceProvider, PresenceWorkerHandle, ProviderFactory,
    WorkerSettings,
};
use crate::probe::CommunicatorProbe;

/// Number of disconnected ticks between two process scans
const PROBE_EVERY: u64 = 5;

/// Builds a fresh presence provider each time a worker starts
pub type ProviderBuilder =
    Arc<dyn Fn() -> Result<Box<dyn PresenceProvider>, PresenceError> + Send + Sync>;

/// Exponential reconnect delay
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; the following one doubles up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Which queries are due on a registered tick
///
/// Returns `(status, clock)`.
fn due_queries(tick: u64, status_every: u64, clock_offset: u64) -> (bool, bool) {
    (
        tick % status_every == 0,
        (tick + clock_offset) % status_every == 0,
    )
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Stops a running orchestrator and waits for it
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    stop_tx: Arc<watch::Sender<bool>>,
    stopped_rx: watch::Receiver<bool>,
}

impl ShutdownHandle {
    /// Ask the orchestrator to stop after the current tick
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Resolve once the orchestrator has finished its teardown
    pub async fn wait_stopped(&self) {
        let mut stopped = self.stopped_rx.clone();
        // An error means the orchestrator is gone, which is just as stopped
        let _ = stopped.wait_for(|stopped| *stopped).await;
    }
}

pub struct Orchestrator {
    config: Config,
    client: ProtocolClient,
    probe: Option<CommunicatorProbe>,
    provider_builder: ProviderBuilder,
    worker: Option<PresenceWorkerHandle>,
    observers: Vec<Arc<dyn StatusObserver>>,

    tick: u64,
    disconnected_ticks: u64,
    process_seen: bool,
    backoff: Backoff,
    previous_snapshot: Option<Snapshot>,
    previous_status: Option<ConnectionStatus>,

    stop_rx: watch::Receiver<bool>,
    stopped_tx: watch::Sender<bool>,
}

impl Orchestrator {
    /// Create an orchestrator publishing to Discord
    pub fn new(config: Config) -> (Self, ShutdownHandle) {
        let application_id = config.presence.application_id.clone();
        let builder: ProviderBuilder = Arc::new(move || {
            DiscordIpc::connect(&application_id)
                .map(|ipc| Box::new(ipc) as Box<dyn PresenceProvider>)
        });

        let (stop_tx, stop_rx) = watch::channel(false);
        let (stopped_tx, stopped_rx) = watch::channel(false);

        let probe = config
            .communicator
            .process_check
            .then(CommunicatorProbe::new);

        let orchestrator = Self {
            client: ProtocolClient::new(config.communicator.connect_timeout),
            backoff: Backoff::new(
                config.schedule.reconnect_delay,
                config.schedule.reconnect_delay_max,
            ),
            config,
            probe,
            provider_builder: builder,
            worker: None,
            observers: Vec::new(),
            tick: 0,
            disconnected_ticks: 0,
            process_seen: false,
            previous_snapshot: None,
            previous_status: None,
            stop_rx,
            stopped_tx,
        };

        let handle = ShutdownHandle {
            stop_tx: Arc::new(stop_tx),
            stopped_rx,
        };

        (orchestrator, handle)
    }

    /// Use a different presence provider
    pub fn with_provider_builder(mut self, builder: ProviderBuilder) -> Self {
        self.provider_builder = builder;
        self
    }

    /// Replace the process probe, `None` disables it
    pub fn with_probe(mut self, probe: Option<CommunicatorProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn add_observer(&mut self, observer: Arc<dyn StatusObserver>) {
        self.observers.push(observer);
    }

    /// Run ticks until a stop is requested, then tear down
    pub async fn run(mut self) {
        info!(
            host = %self.config.communicator.host,
            port = self.config.communicator.port,
            presence = self.config.presence.enabled,
            "Orchestrator starting"
        );

        while !self.stop_requested() {
            let pause = self.step().await;
            self.pause(pause).await;
        }

        info!("Orchestrator stopping");
        self.stop_worker().await;
        self.client.disconnect();
        self.stopped_tx.send_replace(true);
        info!("Orchestrator stopped");
    }

    fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Sleep, but wake up early on a stop request
    async fn pause(&mut self, duration: Duration) {
        if self.stop_requested() {
            return;
        }

        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);

        let changed = tokio::select! {
            _ = &mut sleep => return,
            changed = self.stop_rx.changed() => changed,
        };
        if changed.is_err() {
            // Every handle is gone, nobody can stop us any more
            sleep.await;
        }
    }

    /// Run one tick and return how long to wait before the next
    async fn step(&mut self) -> Duration {
        if !self.client.is_connected() {
            if let Some(pause) = self.reconnect().await {
                return pause;
            }
        }

        if !self.client.is_registered() {
            self.client.process_socket();
            return self.config.schedule.handshake_poll;
        }

        if self.worker.is_none() && self.config.presence.enabled {
            self.start_worker();
        }
        self.set_status(ConnectionStatus::Connected);

        self.tick += 1;
        let (status_due, clock_due) = due_queries(
            self.tick,
            self.config.schedule.status_every,
            self.config.schedule.clock_offset,
        );
        if status_due && self.client.query_state().is_none() {
            log_trigger("status", self.client.trigger_status_query());
        }
        if clock_due && self.client.query_state().is_none() {
            log_trigger("clock", self.client.trigger_clock_query());
        }

        self.client.process_socket();
        let snapshot = self.client.current_snapshot();
        if let Some(current) = &snapshot {
            if self.previous_snapshot.as_ref() != Some(current) {
                if let Some(worker) = &self.worker {
                    worker.send_snapshot(current.clone());
                }
                self.notify(StatusUpdate::Snapshot(current.clone()));
            }
        }
        self.previous_snapshot = snapshot;

        self.config.schedule.tick
    }

    /// Disconnected part of a tick
    ///
    /// Returns the pause if the tick ends here, `None` once connected.
    async fn reconnect(&mut self) -> Option<Duration> {
        self.stop_worker().await;
        self.previous_snapshot = None;

        let probe_due = self.disconnected_ticks % PROBE_EVERY == 0;
        self.disconnected_ticks += 1;

        if let Some(probe) = self.probe.as_mut() {
            if probe_due {
                self.process_seen = probe.is_running();
            }
            if !self.process_seen {
                self.set_status(ConnectionStatus::ConnectorNotRunning);
                return Some(self.config.schedule.tick);
            }
        }

        let host = self.config.communicator.host.clone();
        let port = self.config.communicator.port;

        match self.client.connect(&host, port).await {
            Ok(()) => {
                info!(%host, port, "Connected to communicator");
                self.client.set_session_start(unix_now());
                self.backoff.reset();
                self.disconnected_ticks = 0;
                self.set_status(ConnectionStatus::ConnectorRunning);
                None
            }
            Err(e) => {
                let delay = self.backoff.next_delay();
                debug!(error = %e, delay_ms = delay.as_millis() as u64, "Communicator not reachable");
                self.set_status(ConnectionStatus::ConnectorNotRunning);
                Some(delay)
            }
        }
    }

    fn start_worker(&mut self) {
        let builder = self.provider_builder.clone();
        let factory: ProviderFactory = Box::new(move || builder());

        match PresenceWorkerHandle::spawn(factory, WorkerSettings::from_config(&self.config.presence)) {
            Ok(worker) => {
                debug!("Presence worker launched");
                self.worker = Some(worker);
            }
            Err(e) => error!(error = %e, "Failed to start presence worker"),
        }
    }

    async fn stop_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            debug!("Shutting down presence worker");
            worker.shutdown().await;
        }
    }

    /// Report a connection status, unless it is the current one
    fn set_status(&mut self, status: ConnectionStatus) {
        if self.previous_status == Some(status) {
            return;
        }
        self.previous_status = Some(status);
        self.notify(StatusUpdate::Connection(status));
    }

    fn notify(&self, update: StatusUpdate) {
        trace!(?update, "Status changed");
        for observer in &self.observers {
            observer.status_changed(&update);
        }
    }
}

fn log_trigger(query: &str, result: Result<(), ClientError>) {
    if let Err(e) = result {
        warn!(query, error = %e, "Query not sent");
    }
}
