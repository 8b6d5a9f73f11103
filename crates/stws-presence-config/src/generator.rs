//! Render a configuration back to KDL
//!
//! Used by `stws-presence init` to write a starting config file that spells
//! out every option with its effective value.

use std::time::{Duration, SystemTime};

use crate::model::Config;

/// Format a SystemTime as an ISO 8601 timestamp (UTC).
fn format_timestamp(time: SystemTime) -> String {
    let duration = time
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = duration.as_secs();

    let days = secs / 86400;
    let remaining = secs % 86400;
    let hours = remaining / 3600;
    let minutes = (remaining % 3600) / 60;
    let seconds = remaining % 60;

    let mut year = 1970;
    let mut remaining_days = days as i64;

    loop {
        let days_in_year = if is_leap_year(year) { 366 } else { 365 };
        if remaining_days < days_in_year {
            break;
        }
        remaining_days -= days_in_year;
        year += 1;
    }

    let days_in_months: [i64; 12] = if is_leap_year(year) {
        [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    } else {
        [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    };

    let mut month = 1;
    for days_in_month in days_in_months.iter() {
        if remaining_days < *days_in_month {
            break;
        }
        remaining_days -= days_in_month;
        month += 1;
    }
    let day = remaining_days + 1;

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year, month, day, hours, minutes, seconds
    )
}

fn is_leap_year(year: i64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || (year % 400 == 0)
}

/// Quote a string as a KDL string literal
fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

fn ms(duration: Duration) -> u128 {
    duration.as_millis()
}

/// Generate a complete KDL config file for the given configuration
pub fn generate_config(config: &Config) -> String {
    generate_config_at(config, SystemTime::now())
}

fn generate_config_at(config: &Config, now: SystemTime) -> String {
    let mut out = String::new();

    out.push_str("// stws-presence configuration\n");
    out.push_str(&format!("// Generated: {}\n\n", format_timestamp(now)));

    out.push_str("global {\n");
    out.push_str(&format!(
        "    log-level {}\n",
        quote(config.global.log_level.as_str())
    ));
    out.push_str("}\n\n");

    let c = &config.communicator;
    out.push_str("communicator {\n");
    out.push_str(&format!("    host {}\n", quote(&c.host)));
    out.push_str(&format!("    port {}\n", c.port));
    out.push_str(&format!("    connect-timeout-ms {}\n", ms(c.connect_timeout)));
    out.push_str(&format!("    process-check {}\n", c.process_check));
    out.push_str("}\n\n");

    let s = &config.schedule;
    out.push_str("schedule {\n");
    out.push_str(&format!("    tick-ms {}\n", ms(s.tick)));
    out.push_str(&format!("    handshake-poll-ms {}\n", ms(s.handshake_poll)));
    out.push_str(&format!("    reconnect-delay-ms {}\n", ms(s.reconnect_delay)));
    out.push_str(&format!(
        "    reconnect-delay-max-ms {}\n",
        ms(s.reconnect_delay_max)
    ));
    out.push_str(&format!("    status-every {}\n", s.status_every));
    out.push_str(&format!("    clock-offset {}\n", s.clock_offset));
    out.push_str("}\n\n");

    let p = &config.presence;
    out.push_str("presence {\n");
    out.push_str(&format!("    enabled {}\n", p.enabled));
    out.push_str(&format!("    application-id {}\n", quote(&p.application_id)));
    out.push_str(&format!("    large-image {}\n", quote(&p.large_image)));
    out.push_str(&format!("    idle-ms {}\n", ms(p.idle)));
    out.push_str(&format!("    join-timeout-ms {}\n", ms(p.join_timeout)));
    out.push_str("}\n");

    out
}
