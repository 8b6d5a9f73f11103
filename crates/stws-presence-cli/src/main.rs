//! stws-presence CLI
//!
//! Configuration and diagnostics tool for the stws-presence daemon.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use miette::IntoDiagnostic;
use serde_json::Value;
use stws_presence_config::{Config, DEFAULT_CONFIG_PATH};

/// How long `status` waits for the daemon to answer
const STATUS_TIMEOUT: Duration = Duration::from_secs(2);

/// How long `check` waits for the communicator's greeting
const GREETING_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Parser, Debug)]
#[command(name = "stws-presence")]
#[command(about = "StellwerkSim rich presence tool")]
#[command(version)]
struct Cli {
    /// Path to configuration file [default: ~/.config/stws-presence/config.kdl]
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the configuration file and print the effective settings
    Validate,

    /// Show current daemon status
    Status,

    /// Check that the communicator accepts plugin connections
    Check {
        /// Host to probe (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to probe (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Write a configuration file with all defaults
    Init {
        /// Output path [default: ~/.config/stws-presence/config.kdl]
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate => cmd_validate(cli.config.as_deref()),
        Commands::Status => cmd_status(),
        Commands::Check { host, port } => cmd_check(cli.config.as_deref(), host, port),
        Commands::Init { output, force } => cmd_init(output, force),
    }
}

fn load(config: Option<&str>) -> miette::Result<(Config, Option<PathBuf>)> {
    stws_presence_config::load_config(config).map_err(miette::Report::new)
}

fn cmd_validate(config: Option<&str>) -> miette::Result<()> {
    let (config, path) = load(config)?;

    match path {
        Some(path) => println!("Configuration is valid: {}", path.display()),
        None => println!("No configuration file found, defaults apply"),
    }

    let c = &config.communicator;
    let s = &config.schedule;
    let p = &config.presence;
    println!("  Log level: {}", config.global.log_level.as_str());
    println!("  Communicator: {}:{}", c.host, c.port);
    println!("    Connect timeout: {}ms", c.connect_timeout.as_millis());
    println!("    Process check: {}", c.process_check);
    println!("  Schedule:");
    println!("    Tick: {}ms", s.tick.as_millis());
    println!("    Handshake poll: {}ms", s.handshake_poll.as_millis());
    println!(
        "    Reconnect delay: {}ms (max {}ms)",
        s.reconnect_delay.as_millis(),
        s.reconnect_delay_max.as_millis()
    );
    println!(
        "    Status query every {} ticks, clock query offset {}",
        s.status_every, s.clock_offset
    );
    println!("  Presence: {}", if p.enabled { "enabled" } else { "disabled" });
    if p.enabled {
        println!("    Application id: {}", p.application_id);
        println!("    Large image: {}", p.large_image);
    }

    Ok(())
}

/// Mirrors the daemon's choice of socket location
fn status_socket_path() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir).join("stws-presence.sock"),
        _ => PathBuf::from(format!("/tmp/stws-presence-{}.sock", nix::unistd::getuid())),
    }
}

fn query_status(socket_path: &Path) -> miette::Result<Value> {
    let mut stream = UnixStream::connect(socket_path)
        .into_diagnostic()
        .map_err(|e| e.wrap_err(format!("Is the daemon running? ({})", socket_path.display())))?;
    stream.set_read_timeout(Some(STATUS_TIMEOUT)).into_diagnostic()?;

    stream.write_all(b"{\"type\":\"status\"}\n").into_diagnostic()?;
    stream.flush().into_diagnostic()?;

    let mut line = String::new();
    BufReader::new(stream).read_line(&mut line).into_diagnostic()?;
    serde_json::from_str(line.trim()).into_diagnostic()
}

fn cmd_status() -> miette::Result<()> {
    let response = query_status(&status_socket_path())?;

    match response.get("type").and_then(Value::as_str) {
        Some("status") => {}
        Some("error") => {
            let message = response.get("message").and_then(Value::as_str).unwrap_or("unknown");
            return Err(miette::miette!("Daemon reported an error: {}", message));
        }
        _ => return Err(miette::miette!("Unexpected response: {}", response)),
    }

    let connection = match response.get("connection").and_then(Value::as_str) {
        Some("connector_not_running") => "Connector not running",
        Some("connector_running") => "Connector running",
        Some("connected") => "Connected",
        _ => "Starting",
    };
    println!("Communicator: {}", connection);

    match response.get("snapshot").filter(|s| !s.is_null()) {
        Some(snapshot) => {
            let field = |name: &str| snapshot.get(name).and_then(Value::as_str).unwrap_or("?");
            let online = if field("online") == "true" { "Online" } else { "Offline" };
            println!("Signal box: {} ({})", field("name"), field("region"));
            println!("Game: {}, {}", online, field("sim_clock"));
        }
        None => println!("No session information yet"),
    }

    Ok(())
}

/// Whether the communicator's first message is the registration challenge
fn is_register_challenge(greeting: &str) -> bool {
    greeting.contains("<status") && greeting.contains("code=\"300\"")
}

fn cmd_check(config: Option<&str>, host: Option<String>, port: Option<u16>) -> miette::Result<()> {
    let (config, _) = load(config)?;
    let host = host.unwrap_or(config.communicator.host);
    let port = port.unwrap_or(config.communicator.port);
    let timeout = config.communicator.connect_timeout;

    println!("Checking communicator at {}:{}", host, port);

    let addrs: Vec<_> = (host.as_str(), port).to_socket_addrs().into_diagnostic()?.collect();
    let stream = addrs
        .iter()
        .find_map(|addr| TcpStream::connect_timeout(addr, timeout).ok())
        .ok_or_else(|| {
            miette::miette!("Communicator not reachable - is StellwerkSim running with the plugin interface enabled?")
        })?;
    stream.set_read_timeout(Some(GREETING_TIMEOUT)).into_diagnostic()?;

    let mut buf = [0u8; 1024];
    let mut greeting = String::new();
    let mut reader = &stream;
    while !greeting.contains('\n') {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(len) => greeting.push_str(&String::from_utf8_lossy(&buf[..len])),
            Err(e) => {
                tracing::debug!(error = %e, "No further greeting data");
                break;
            }
        }
    }

    if is_register_challenge(&greeting) {
        println!("Communicator is running and asks for registration");
        Ok(())
    } else if greeting.is_empty() {
        Err(miette::miette!("Connected, but the communicator sent nothing"))
    } else {
        Err(miette::miette!("Unexpected greeting: {}", greeting.trim()))
    }
}

fn cmd_init(output: Option<PathBuf>, force: bool) -> miette::Result<()> {
    let path = output
        .unwrap_or_else(|| shellexpand::tilde(DEFAULT_CONFIG_PATH).into_owned().into());

    if path.exists() && !force {
        return Err(miette::miette!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ));
    }

    let content = stws_presence_config::generate_config(&Config::default());

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).into_diagnostic()?;
    }
    std::fs::write(&path, content).into_diagnostic()?;

    println!("Wrote configuration: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::os::unix::net::UnixListener;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_register_challenge_detection() {
        assert!(is_register_challenge("<status code=\"300\">Bitte registrieren</status>\n"));
        assert!(!is_register_challenge("<status code=\"220\">OK</status>\n"));
        assert!(!is_register_challenge("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn test_query_status_reads_one_line() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("stws-presence.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut request = String::new();
            reader.read_line(&mut request).unwrap();
            let mut stream = stream;
            stream
                .write_all(b"{\"type\":\"status\",\"connection\":\"connected\",\"registered\":true,\"snapshot\":null}\n")
                .unwrap();
            request
        });

        let response = query_status(&socket_path).unwrap();
        assert_eq!(server.join().unwrap(), "{\"type\":\"status\"}\n");
        assert_eq!(response["connection"], "connected");
        assert!(response["snapshot"].is_null());
    }

    #[test]
    fn test_query_status_without_daemon() {
        let temp_dir = TempDir::new().unwrap();
        assert!(query_status(&temp_dir.path().join("missing.sock")).is_err());
    }

    #[test]
    fn test_check_against_fake_communicator() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"<status code=\"300\">Register</status>\n").unwrap();
        });

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.kdl");
        std::fs::write(&config_path, "communicator {\n    host \"127.0.0.1\"\n}\n").unwrap();

        let result = cmd_check(config_path.to_str(), None, Some(port));
        server.join().unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn test_init_writes_parseable_config() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested/config.kdl");

        cmd_init(Some(path.clone()), false).unwrap();
        let config = stws_presence_config::parse_config(&path).unwrap();
        assert_eq!(config, Config::default());

        // Refuses to overwrite without --force
        assert!(cmd_init(Some(path.clone()), false).is_err());
        assert!(cmd_init(Some(path), true).is_ok());
    }
}
