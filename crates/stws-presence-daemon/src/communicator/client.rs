//! Communicator protocol client
//!
//! This module provides the `ProtocolClient` that talks to the StellwerkSim
//! communicator. The client owns the TCP socket and the wire codec, runs the
//! registration handshake and keeps the fields the status and clock queries
//! report.
//!
//! ## Protocol
//!
//! 1. Client connects to the communicator (TCP, port 3691 by default)
//! 2. Communicator sends `<status code="300">` asking for registration
//! 3. Client writes `<register .../>`, communicator answers `<status code="220">`
//! 4. From then on the client may ask `<anlageninfo/>` and `<simzeit sender=".."/>`,
//!    one request at a time
//!
//! The socket is non-blocking. `process_socket()` performs at most one read
//! and never waits; the orchestrator calls it once per tick.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn, Instrument, Span};

use super::codec::WireCodec;
use super::error::ClientError;
use super::types::{
    format_sim_clock, ConnectionState, ElementClosed, QueryState, Request, Snapshot,
    STATUS_REGISTER_ACCEPTED, STATUS_REGISTER_CHALLENGE,
};

/// Size of the buffer for a single socket read
const READ_BUFFER_SIZE: usize = 4096;

/// Client for the communicator's plugin interface
///
/// # Example
///
/// ```ignore
/// let mut client = ProtocolClient::new(Duration::from_secs(2));
/// client.connect("localhost", 3691).await?;
/// loop {
///     client.process_socket();
///     if let Some(snapshot) = client.current_snapshot() {
///         println!("{} ({})", snapshot.name, snapshot.sim_clock);
///     }
/// }
/// ```
#[derive(Debug)]
pub struct ProtocolClient {
    /// Non-blocking connection to the communicator, `None` while disconnected
    socket: Option<TcpStream>,
    codec: WireCodec,
    connect_timeout: Duration,

    state: ConnectionState,
    query: Option<QueryState>,

    status_name: String,
    status_region: String,
    status_online: String,
    sim_clock: String,
    session_start: u64,

    /// Carries the communicator address on every log line of this client
    span: Span,
}

impl ProtocolClient {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            socket: None,
            codec: WireCodec::new(),
            connect_timeout,
            state: ConnectionState::Disconnected,
            query: None,
            status_name: String::new(),
            status_region: String::new(),
            status_online: String::new(),
            sim_clock: String::new(),
            session_start: 0,
            span: tracing::info_span!("communicator", addr = tracing::field::Empty),
        }
    }

    /// Open a fresh connection to the communicator
    ///
    /// All session state is discarded first, so a failed attempt always
    /// leaves the client `Disconnected`. Failures are logged here and
    /// returned for callers that care; they are never fatal.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ConnectFailed` if the connection is refused or
    /// otherwise fails, `ClientError::ConnectTimeout` if it does not complete
    /// within the configured timeout.
    pub async fn connect(&mut self, host: &str, port: u16) -> Result<(), ClientError> {
        self.reset();

        let addr = format!("{}:{}", host, port);
        self.span.record("addr", addr.as_str());
        let span = self.span.clone();

        debug!(parent: &span, "Trying to connect to communicator");

        let result = timeout(self.connect_timeout, tokio::net::TcpStream::connect((host, port)))
            .instrument(span.clone())
            .await;

        let _enter = span.enter();

        let stream = match result {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                info!(error = %source, "Failed creating connection");
                return Err(ClientError::ConnectFailed { addr, source });
            }
            Err(_) => {
                info!(timeout_ms = self.connect_timeout.as_millis() as u64, "Connect timed out");
                return Err(ClientError::ConnectTimeout { addr });
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            trace!(error = %e, "Could not disable Nagle on communicator socket");
        }

        // Hand the socket over to plain non-blocking reads
        let socket = stream
            .into_std()
            .and_then(|socket| socket.set_nonblocking(true).map(|_| socket))
            .map_err(|source| ClientError::ConnectFailed {
                addr: addr.clone(),
                source,
            })?;

        self.socket = Some(socket);
        self.state = ConnectionState::Connected;
        debug!("Connection established");

        Ok(())
    }

    /// Read whatever the communicator sent since the last call
    ///
    /// Performs at most one non-blocking read. Received bytes are decoded and
    /// applied to the client state. A closed peer or a socket error drops
    /// the connection; "no data yet" is not an error.
    pub fn process_socket(&mut self) {
        let span = self.span.clone();
        let _enter = span.enter();

        let Some(socket) = self.socket.as_mut() else {
            return;
        };

        let mut buf = [0u8; READ_BUFFER_SIZE];
        match socket.read(&mut buf) {
            Ok(0) => {
                debug!("Communicator closed the connection, terminating socket");
                self.teardown();
            }
            Ok(len) => {
                trace!(bytes = len, "Got some data, processing");
                self.codec.feed(&buf[..len]);
                self.drive();
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {}
            Err(e) if e.kind() == ErrorKind::TimedOut => {
                info!("Socket timeout waiting for data, destroying connection");
                self.teardown();
            }
            Err(e) => {
                info!(error = %e, "Socket error waiting for data, destroying connection");
                self.teardown();
            }
        }
    }

    /// Start the registration handshake
    ///
    /// # Errors
    ///
    /// Returns `ClientError::QueryPending` if a query is outstanding and
    /// `ClientError::NotConnected` without a connection.
    pub fn trigger_register(&mut self) -> Result<(), ClientError> {
        self.issue(Request::Register)
    }

    /// Ask for signal box name, region and online flag
    pub fn trigger_status_query(&mut self) -> Result<(), ClientError> {
        self.issue(Request::StatusInfo)
    }

    /// Ask for the in-game clock
    pub fn trigger_clock_query(&mut self) -> Result<(), ClientError> {
        self.issue(Request::SimClock)
    }

    /// The combined session view, if every part of it is known
    pub fn current_snapshot(&self) -> Option<Snapshot> {
        if self.state != ConnectionState::Registered
            || self.status_name.is_empty()
            || self.status_region.is_empty()
            || self.status_online.is_empty()
            || self.sim_clock.is_empty()
        {
            return None;
        }

        Some(Snapshot {
            name: self.status_name.clone(),
            region: self.status_region.clone(),
            online: self.status_online.clone(),
            sim_clock: self.sim_clock.clone(),
            session_start: self.session_start,
        })
    }

    /// Record when the current session started (unix seconds)
    pub fn set_session_start(&mut self, unix_secs: u64) {
        self.session_start = unix_secs;
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    pub fn query_state(&self) -> Option<QueryState> {
        self.query
    }

    pub fn is_connected(&self) -> bool {
        self.state != ConnectionState::Disconnected
    }

    pub fn is_registered(&self) -> bool {
        self.state == ConnectionState::Registered
    }

    /// Close the connection, if any
    pub fn disconnect(&mut self) {
        let span = self.span.clone();
        let _enter = span.enter();
        if self.socket.is_some() {
            debug!("Closing connection to communicator");
        }
        self.teardown();
    }

    /// Discard the socket and all session state
    fn reset(&mut self) {
        self.teardown();
        self.codec.reset();
        self.query = None;
        self.status_name.clear();
        self.status_region.clear();
        self.status_online.clear();
        self.sim_clock.clear();
        self.session_start = 0;
    }

    /// Best-effort close; the socket is dropped even if shutdown fails
    fn teardown(&mut self) {
        if let Some(socket) = self.socket.take() {
            if let Err(e) = socket.shutdown(Shutdown::Both) {
                trace!(error = %e, "Ignoring error while closing socket");
            }
        }
        self.state = ConnectionState::Disconnected;
    }

    fn issue(&mut self, request: Request) -> Result<(), ClientError> {
        if self.socket.is_none() {
            return Err(ClientError::NotConnected);
        }
        if let Some(pending) = self.query {
            return Err(ClientError::QueryPending { pending });
        }

        let span = self.span.clone();
        let _enter = span.enter();
        self.send(request)
    }

    /// Write a request and occupy its query slot
    ///
    /// A failed write may have left part of the element on the wire, so the
    /// connection is dropped rather than reused.
    fn send(&mut self, request: Request) -> Result<(), ClientError> {
        let bytes = WireCodec::encode(request)?;
        let socket = self.socket.as_mut().ok_or(ClientError::NotConnected)?;

        if let Err(e) = socket.write_all(&bytes).and_then(|_| socket.flush()) {
            warn!(error = %e, request = request.tag(), "Failed to send request, destroying connection");
            self.teardown();
            return Err(ClientError::SendFailed(e));
        }

        self.query = Some(request.query_state());
        debug!(request = request.tag(), "Sent request");
        Ok(())
    }

    /// Apply every element decoded so far
    ///
    /// Stops early if handling an element dropped the connection.
    fn drive(&mut self) {
        while self.socket.is_some() {
            let Some(element) = self.codec.read_events().next() else {
                break;
            };
            self.handle_element(element);
        }
    }

    fn handle_element(&mut self, element: ElementClosed) {
        trace!(tag = %element.tag, "Received element");

        match element.tag.as_str() {
            "status" => self.handle_status(&element),
            "anlageninfo" => {
                self.status_name = element.attribute("name").unwrap_or_default().to_string();
                self.status_region = element.attribute("region").unwrap_or_default().to_string();
                self.status_online = element.attribute("online").unwrap_or_default().to_string();
                debug!(
                    name = %self.status_name,
                    region = %self.status_region,
                    online = %self.status_online,
                    "Got info response"
                );
                self.query = None;
            }
            "simzeit" => {
                let zeit = element.attribute("zeit").unwrap_or_default();
                match zeit.trim().parse::<i64>() {
                    Ok(millis) => {
                        self.sim_clock = format_sim_clock(millis);
                        debug!(simzeit = %self.sim_clock, "Got simzeit response");
                    }
                    Err(_) => {
                        warn!(zeit = %zeit, "Could not convert simzeit to an integer");
                    }
                }
                self.query = None;
            }
            other => {
                trace!(tag = %other, "Got tag end but not used, ignored");
            }
        }
    }

    fn handle_status(&mut self, element: &ElementClosed) {
        let raw = element.attribute("code").unwrap_or_default();
        let code = match raw.trim().parse::<i64>() {
            Ok(code) => code,
            Err(e) => {
                error!(code = %raw, error = %e, text = %element.text, "Unhandled chars in status response");
                return;
            }
        };

        debug!(code, text = %element.text, "Got status");

        if code == STATUS_REGISTER_CHALLENGE && self.state != ConnectionState::Registered {
            debug!("Got register request");
            // Answers the challenge even if a register is already in flight
            if let Err(e) = self.send(Request::Register) {
                debug!(error = %e, "Register request not sent");
            }
        } else if code == STATUS_REGISTER_ACCEPTED
            && self.query == Some(QueryState::AwaitingRegister)
        {
            info!("Registered with communicator");
            self.query = None;
            self.state = ConnectionState::Registered;
        } else {
            // The query slot, if any, stays occupied until the next reconnect
            warn!(
                code,
                text = %element.text,
                pending = ?self.query,
                "Unexpected status code received"
            );
        }
    }
}
