//! Types exchanged with the StellwerkSim communicator
//!
//! The communicator speaks a flat stream of XML elements. This module defines
//! the outbound requests, the decoded inbound events and the client-side
//! state derived from them.

use serde::{Deserialize, Serialize};

/// Plugin name announced in the `register` request
pub const PLUGIN_NAME: &str = "StellwerksimPresence";

/// Plugin author announced in the `register` request
pub const PLUGIN_AUTHOR: &str = "stws-presence contributors";

/// Plugin version announced in the `register` request
pub const PLUGIN_VERSION: &str = "1.0.0";

/// Only protocol revision this client understands
pub const PROTOCOL_VERSION: &str = "1";

/// Free text shown by the communicator next to the plugin name
pub const PLUGIN_DESCRIPTION: &str = "Shows current game info as rich presence";

/// Sender id attached to `simzeit` requests, echoed back by the communicator
pub const SIMZEIT_SENDER: &str = "123456";

/// Status code the communicator sends to ask for registration
pub const STATUS_REGISTER_CHALLENGE: i64 = 300;

/// Status code confirming a successful registration
pub const STATUS_REGISTER_ACCEPTED: i64 = 220;

/// Lifecycle of the TCP connection to the communicator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
    Registered,
}

/// The single outstanding request slot
///
/// `None` is represented by `Option<QueryState>::None` on the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryState {
    AwaitingRegister,
    AwaitingStatusInfo,
    AwaitingSimClock,
}

/// Requests this client writes to the communicator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// `<register name=".." autor=".." version="1.0.0" protokoll="1" text=".."/>`
    Register,
    /// `<anlageninfo/>`
    StatusInfo,
    /// `<simzeit sender="123456"/>`
    SimClock,
}

impl Request {
    /// XML element name on the wire
    pub fn tag(&self) -> &'static str {
        match self {
            Request::Register => "register",
            Request::StatusInfo => "anlageninfo",
            Request::SimClock => "simzeit",
        }
    }

    /// Attributes in wire order
    pub fn attributes(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            Request::Register => &[
                ("name", PLUGIN_NAME),
                ("autor", PLUGIN_AUTHOR),
                ("version", PLUGIN_VERSION),
                ("protokoll", PROTOCOL_VERSION),
                ("text", PLUGIN_DESCRIPTION),
            ],
            Request::StatusInfo => &[],
            Request::SimClock => &[("sender", SIMZEIT_SENDER)],
        }
    }

    /// Query slot this request occupies until its response arrives
    pub fn query_state(&self) -> QueryState {
        match self {
            Request::Register => QueryState::AwaitingRegister,
            Request::StatusInfo => QueryState::AwaitingStatusInfo,
            Request::SimClock => QueryState::AwaitingSimClock,
        }
    }
}

/// An element whose closing tag has been fully received
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementClosed {
    pub tag: String,
    /// Unescaped attributes in document order
    pub attributes: Vec<(String, String)>,
    /// Trimmed, unescaped character data directly inside the element
    pub text: String,
}

impl ElementClosed {
    /// Look up an attribute value by name
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// A complete view of the running simulator session
///
/// Only built when every field is known; see `ProtocolClient::current_snapshot`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Snapshot {
    /// Name of the signal box being played
    pub name: String,
    pub region: String,
    /// Online flag exactly as the communicator reported it
    pub online: String,
    /// In-game clock, `HH:MM`
    pub sim_clock: String,
    /// Unix timestamp (seconds) of the connect that started this session
    pub session_start: u64,
}

impl Snapshot {
    /// Whether the communicator reported an online game
    ///
    /// The communicator sometimes sends odd values, so only the literal
    /// string `true` counts.
    pub fn is_online(&self) -> bool {
        self.online == "true"
    }
}

/// Convert an in-game time in milliseconds to `HH:MM`
///
/// Hours are not wrapped at 24, a session running past midnight shows `24:10`.
pub fn format_sim_clock(millis: i64) -> String {
    let total_minutes = millis / 1000 / 60;
    let hours = total_minutes / 60;
    let minutes = total_minutes % 60;
    format!("{:02}:{:02}", hours, minutes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_sim_clock_ninety_minutes() {
        assert_eq!(format_sim_clock(5_400_000), "01:30");
    }

    #[test]
    fn test_format_sim_clock_truncates_seconds() {
        // 13:07:59.999
        assert_eq!(format_sim_clock(47_279_999), "13:07");
    }

    #[test]
    fn test_format_sim_clock_not_wrapped() {
        assert_eq!(format_sim_clock(0), "00:00");
        assert_eq!(format_sim_clock(87_000_000), "24:10");
    }

    #[test]
    fn test_request_wire_shape() {
        assert_eq!(Request::Register.tag(), "register");
        assert_eq!(Request::StatusInfo.tag(), "anlageninfo");
        assert_eq!(Request::SimClock.tag(), "simzeit");

        let keys: Vec<&str> = Request::Register
            .attributes()
            .iter()
            .map(|(key, _)| *key)
            .collect();
        assert_eq!(keys, vec!["name", "autor", "version", "protokoll", "text"]);
        assert!(Request::Register
            .attributes()
            .contains(&("protokoll", "1")));
        assert_eq!(Request::SimClock.attributes(), &[("sender", "123456")]);
    }

    #[test]
    fn test_element_attribute_lookup() {
        let element = ElementClosed {
            tag: "anlageninfo".to_string(),
            attributes: vec![
                ("name".to_string(), "Hagen".to_string()),
                ("region".to_string(), "Ruhrgebiet".to_string()),
            ],
            text: String::new(),
        };

        assert_eq!(element.attribute("region"), Some("Ruhrgebiet"));
        assert_eq!(element.attribute("online"), None);
    }

    #[test]
    fn test_snapshot_online_is_strict() {
        let mut snapshot = Snapshot {
            name: "Hagen".to_string(),
            region: "Ruhrgebiet".to_string(),
            online: "true".to_string(),
            sim_clock: "08:15".to_string(),
            session_start: 0,
        };
        assert!(snapshot.is_online());

        snapshot.online = "TRUE".to_string();
        assert!(!snapshot.is_online());
        snapshot.online = "false".to_string();
        assert!(!snapshot.is_online());
    }
}
