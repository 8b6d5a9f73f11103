//! Configuration parsing for stws-presence
//!
//! This crate handles parsing the KDL configuration file shared by the
//! daemon and the CLI, and rendering a configuration back to KDL.

mod error;
mod model;
mod parser;
mod generator;

pub use error::ConfigError;
pub use model::*;
pub use parser::{load_config, parse_config, parse_config_str, DEFAULT_CONFIG_PATH};
pub use generator::generate_config;
