//! Configuration data model

use std::time::Duration;

/// Default TCP port of the StellwerkSim communicator plugin interface
pub const DEFAULT_COMMUNICATOR_PORT: u16 = 3691;

/// Discord application the presence is published under
pub const DEFAULT_APPLICATION_ID: &str = "934472966455046194";

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub global: GlobalConfig,
    pub communicator: CommunicatorConfig,
    pub schedule: ScheduleConfig,
    pub presence: PresenceConfig,
}

/// Global settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalConfig {
    pub log_level: LogLevel,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!("Unknown log level: {}", s)),
        }
    }
}

/// Where and how to reach the communicator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommunicatorConfig {
    /// Host running the simulator (usually the local machine)
    pub host: String,
    pub port: u16,
    /// Upper bound for a single TCP connect attempt
    pub connect_timeout: Duration,
    /// Only attempt to connect while a communicator process is detected
    pub process_check: bool,
}

impl Default for CommunicatorConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_COMMUNICATOR_PORT,
            connect_timeout: Duration::from_millis(2000),
            process_check: false,
        }
    }
}

/// Timing of the orchestrator tick loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleConfig {
    /// Sleep between two ticks once registered
    pub tick: Duration,
    /// Sleep between socket polls while the registration handshake runs
    pub handshake_poll: Duration,
    /// First delay after a failed connect attempt
    pub reconnect_delay: Duration,
    /// Cap for the exponential reconnect backoff
    pub reconnect_delay_max: Duration,
    /// A status query is issued every `status_every` ticks
    pub status_every: u64,
    /// The clock query runs `clock_offset` ticks out of phase with the status query
    pub clock_offset: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(1000),
            handshake_poll: Duration::from_millis(100),
            reconnect_delay: Duration::from_millis(5000),
            reconnect_delay_max: Duration::from_millis(30_000),
            status_every: 10,
            clock_offset: 5,
        }
    }
}

/// Presence publishing settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceConfig {
    /// Disable to run the communicator connection without any presence worker
    pub enabled: bool,
    pub application_id: String,
    /// Asset key shown as the large image of the activity
    pub large_image: String,
    /// Idle delay of the presence worker loop
    pub idle: Duration,
    /// How long teardown waits for the worker thread to exit
    pub join_timeout: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            application_id: DEFAULT_APPLICATION_ID.to_string(),
            large_image: "signale".to_string(),
            idle: Duration::from_millis(100),
            join_timeout: Duration::from_millis(2000),
        }
    }
}
