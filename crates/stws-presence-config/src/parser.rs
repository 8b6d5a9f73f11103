//! KDL configuration parser

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::model::*;

/// Location used when no `--config` is given
pub const DEFAULT_CONFIG_PATH: &str = "~/.config/stws-presence/config.kdl";

/// Load the configuration for a binary
///
/// With an explicit path the file must exist. Without one the default
/// location is tried, and a missing file there simply yields the defaults.
pub fn load_config(explicit: Option<&str>) -> Result<(Config, Option<PathBuf>), ConfigError> {
    match explicit {
        Some(path) => {
            let path: PathBuf = shellexpand::tilde(path).into_owned().into();
            let config = parse_config(&path)?;
            Ok((config, Some(path)))
        }
        None => {
            let path: PathBuf = shellexpand::tilde(DEFAULT_CONFIG_PATH).into_owned().into();
            if path.exists() {
                let config = parse_config(&path)?;
                Ok((config, Some(path)))
            } else {
                tracing::debug!("No config at {}, using defaults", path.display());
                Ok((Config::default(), None))
            }
        }
    }
}

/// Parse a configuration file from the given path
pub fn parse_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_config_str(&content)
}

/// Parse configuration from a string
pub fn parse_config_str(content: &str) -> Result<Config, ConfigError> {
    let doc: kdl::KdlDocument = content.parse().map_err(|e: kdl::KdlError| {
        // kdl carries its own miette version, so rebuild the span by hand
        let offset = e.span.offset();
        let len = e.span.len();
        let span = miette::SourceSpan::from((offset, len));
        ConfigError::ParseError {
            src: content.to_string(),
            span,
            source: e,
        }
    })?;

    let mut config = Config::default();

    for node in doc.nodes() {
        match node.name().value() {
            "global" => parse_global(node, &mut config.global)?,
            "communicator" => parse_communicator(node, &mut config.communicator)?,
            "schedule" => parse_schedule(node, &mut config.schedule)?,
            "presence" => parse_presence(node, &mut config.presence)?,
            name => {
                tracing::warn!("Unknown top-level node: {}", name);
            }
        }
    }

    validate(&config)?;

    Ok(config)
}

fn children(node: &kdl::KdlNode) -> impl Iterator<Item = &kdl::KdlNode> {
    node.children()
        .map(|doc| doc.nodes())
        .unwrap_or_default()
        .iter()
}

fn first_value<'a>(node: &'a kdl::KdlNode) -> Option<&'a kdl::KdlValue> {
    node.entries().first().map(|entry| entry.value())
}

fn string_value(node: &kdl::KdlNode) -> Result<String, ConfigError> {
    first_value(node)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
        .ok_or_else(|| ConfigError::WrongType {
            key: node.name().value().to_string(),
            expected: "a string",
        })
}

fn integer_value(node: &kdl::KdlNode) -> Result<i64, ConfigError> {
    first_value(node)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| ConfigError::WrongType {
            key: node.name().value().to_string(),
            expected: "an integer",
        })
}

fn bool_value(node: &kdl::KdlNode) -> Result<bool, ConfigError> {
    first_value(node)
        .and_then(|v| v.as_bool())
        .ok_or_else(|| ConfigError::WrongType {
            key: node.name().value().to_string(),
            expected: "a boolean",
        })
}

fn positive(node: &kdl::KdlNode) -> Result<u64, ConfigError> {
    let value = integer_value(node)?;
    if value <= 0 {
        return Err(ConfigError::Invalid {
            message: format!(
                "`{}` must be greater than zero, got {}",
                node.name().value(),
                value
            ),
        });
    }
    Ok(value as u64)
}

fn millis(node: &kdl::KdlNode) -> Result<Duration, ConfigError> {
    positive(node).map(Duration::from_millis)
}

fn parse_global(node: &kdl::KdlNode, global: &mut GlobalConfig) -> Result<(), ConfigError> {
    for child in children(node) {
        match child.name().value() {
            "log-level" => {
                global.log_level = string_value(child)?
                    .parse()
                    .map_err(|message| ConfigError::Invalid { message })?;
            }
            name => {
                tracing::warn!("Unknown global config option: {}", name);
            }
        }
    }
    Ok(())
}

fn parse_communicator(
    node: &kdl::KdlNode,
    communicator: &mut CommunicatorConfig,
) -> Result<(), ConfigError> {
    for child in children(node) {
        match child.name().value() {
            "host" => communicator.host = string_value(child)?,
            "port" => {
                let port = integer_value(child)?;
                communicator.port = u16::try_from(port)
                    .ok()
                    .filter(|p| *p != 0)
                    .ok_or_else(|| ConfigError::Invalid {
                        message: format!("port {} is out of range", port),
                    })?;
            }
            "connect-timeout-ms" => communicator.connect_timeout = millis(child)?,
            "process-check" => communicator.process_check = bool_value(child)?,
            name => {
                tracing::warn!("Unknown communicator config option: {}", name);
            }
        }
    }
    Ok(())
}

fn parse_schedule(node: &kdl::KdlNode, schedule: &mut ScheduleConfig) -> Result<(), ConfigError> {
    for child in children(node) {
        match child.name().value() {
            "tick-ms" => schedule.tick = millis(child)?,
            "handshake-poll-ms" => schedule.handshake_poll = millis(child)?,
            "reconnect-delay-ms" => schedule.reconnect_delay = millis(child)?,
            "reconnect-delay-max-ms" => schedule.reconnect_delay_max = millis(child)?,
            "status-every" => schedule.status_every = positive(child)?,
            "clock-offset" => {
                let offset = integer_value(child)?;
                schedule.clock_offset = u64::try_from(offset).map_err(|_| ConfigError::Invalid {
                    message: format!("`clock-offset` must not be negative, got {}", offset),
                })?;
            }
            name => {
                tracing::warn!("Unknown schedule config option: {}", name);
            }
        }
    }
    Ok(())
}

fn parse_presence(node: &kdl::KdlNode, presence: &mut PresenceConfig) -> Result<(), ConfigError> {
    for child in children(node) {
        match child.name().value() {
            "enabled" => presence.enabled = bool_value(child)?,
            "application-id" => presence.application_id = string_value(child)?,
            "large-image" => presence.large_image = string_value(child)?,
            "idle-ms" => presence.idle = millis(child)?,
            "join-timeout-ms" => presence.join_timeout = millis(child)?,
            name => {
                tracing::warn!("Unknown presence config option: {}", name);
            }
        }
    }
    Ok(())
}

/// Cross-field checks that a single node cannot express
fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.communicator.host.trim().is_empty() {
        return Err(ConfigError::Invalid {
            message: "communicator host must not be empty".to_string(),
        });
    }

    if config.schedule.reconnect_delay_max < config.schedule.reconnect_delay {
        return Err(ConfigError::Invalid {
            message: format!(
                "`reconnect-delay-max-ms` ({}) is smaller than `reconnect-delay-ms` ({})",
                config.schedule.reconnect_delay_max.as_millis(),
                config.schedule.reconnect_delay.as_millis()
            ),
        });
    }

    if config.presence.enabled && config.presence.application_id.trim().is_empty() {
        return Err(ConfigError::Invalid {
            message: "presence is enabled but `application-id` is empty".to_string(),
        });
    }

    Ok(())
}
