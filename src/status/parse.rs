//! Status report parsing.
//!
//! Decodes one concentrator status report into [`SessionObservation`] values.
//! Soft per-field problems (mangled counter, bad timestamp, missing port)
//! degrade to defaults so a connected client is never dropped for a cosmetic
//! defect; only lines below the structural minimum field count are rejected.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;
use tracing::warn;

use super::{SessionObservation, UNKNOWN_PORT};

/// Minimum comma-separated fields in a client-list line.
const CLIENT_LIST_MIN_FIELDS: usize = 8;

/// Minimum comma-separated fields in a routing-table line.
const ROUTING_MIN_FIELDS: usize = 3;

/// Timestamp layout used by the concentrator for "connected since".
const CONNECTED_SINCE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Errors for structurally unusable report lines.
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("client-list line has {fields} fields, need 8")]
    ShortClientRecord { fields: usize },

    #[error("routing-table line has {fields} fields, need 3")]
    ShortRoutingRecord { fields: usize },
}

/// One decoded status report.
#[derive(Debug, Default)]
pub struct ParsedReport {
    /// Observations in file order.
    pub observations: Vec<SessionObservation>,
    /// Lines rejected as structurally invalid.
    pub skipped_lines: usize,
}

/// Parse a full status report.
///
/// `now` substitutes for unparseable connection timestamps; callers pass the
/// cycle's capture time so all defaults inside one cycle agree. Virtual
/// addresses missing from the client list are backfilled from the routing
/// table after the full pass, last route wins per identity.
pub fn parse_report(server: &str, text: &str, now: DateTime<Utc>) -> ParsedReport {
    let mut report = ParsedReport::default();
    let mut routes: HashMap<String, String> = HashMap::new();

    for (idx, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();

        if line.starts_with("CLIENT_LIST,") {
            if line.starts_with("CLIENT_LIST,Common Name") {
                continue; // section header
            }
            match parse_client_record(server, line, now) {
                Ok(obs) => report.observations.push(obs),
                Err(e) => {
                    warn!(server, line = idx + 1, error = %e, "skipping client-list line");
                    report.skipped_lines += 1;
                }
            }
        } else if line.starts_with("ROUTING_TABLE,") {
            if line.starts_with("ROUTING_TABLE,Virtual Address") {
                continue; // section header
            }
            match parse_routing_record(line) {
                Ok((identity, virtual_addr)) => {
                    routes.insert(identity, virtual_addr);
                }
                Err(e) => {
                    warn!(server, line = idx + 1, error = %e, "skipping routing-table line");
                    report.skipped_lines += 1;
                }
            }
        }
        // TITLE, TIME, GLOBAL_STATS, HEADER, END and blank lines carry
        // nothing we track.
    }

    for obs in &mut report.observations {
        if obs.virtual_addr.is_none() {
            if let Some(addr) = routes.get(&obs.identity) {
                obs.virtual_addr = Some(addr.clone());
            }
        }
    }

    report
}

/// Parse one `CLIENT_LIST` line.
///
/// Layout: `CLIENT_LIST,<identity>,<origin addr:port>,<virtual addr>,
/// <unused>,<bytes_in>,<bytes_out>,<connected since>,...`
fn parse_client_record(
    server: &str,
    line: &str,
    now: DateTime<Utc>,
) -> Result<SessionObservation, RecordError> {
    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() < CLIENT_LIST_MIN_FIELDS {
        return Err(RecordError::ShortClientRecord {
            fields: parts.len(),
        });
    }

    let identity = parts[1].trim().to_string();
    let (origin_addr, origin_port) = split_origin(parts[2].trim());

    let virtual_addr = match parts[3].trim() {
        "" => None,
        addr => Some(addr.to_string()),
    };

    let bytes_received = parse_counter(server, &identity, "bytes_received", parts[5]);
    let bytes_sent = parse_counter(server, &identity, "bytes_sent", parts[6]);

    let connected_at = match parse_connected_since(parts[7]) {
        Some(ts) => ts,
        None => {
            warn!(
                server,
                identity,
                raw = parts[7],
                "unparseable connection timestamp, defaulting to now",
            );
            now
        }
    };

    Ok(SessionObservation {
        identity,
        server: server.to_string(),
        origin_addr,
        origin_port,
        virtual_addr,
        bytes_received,
        bytes_sent,
        connected_at,
    })
}

/// Parse one `ROUTING_TABLE` line into (identity, virtual address).
///
/// Layout: `ROUTING_TABLE,<virtual addr>,<identity>,...`
fn parse_routing_record(line: &str) -> Result<(String, String), RecordError> {
    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() < ROUTING_MIN_FIELDS {
        return Err(RecordError::ShortRoutingRecord {
            fields: parts.len(),
        });
    }

    Ok((parts[2].trim().to_string(), parts[1].trim().to_string()))
}

/// Split an "address:port" origin on the last colon.
///
/// The last colon keeps colon-bearing IPv6 addresses intact. A missing or
/// non-numeric trailing segment means the whole field is the address and the
/// port becomes the "unknown" sentinel.
fn split_origin(raw: &str) -> (String, String) {
    if let Some((addr, port)) = raw.rsplit_once(':') {
        if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) {
            return (addr.to_string(), port.to_string());
        }
    }
    (raw.to_string(), UNKNOWN_PORT.to_string())
}

/// Parse a cumulative byte counter, defaulting to zero on any defect.
fn parse_counter(server: &str, identity: &str, field: &'static str, raw: &str) -> u64 {
    match raw.trim().parse::<u64>() {
        Ok(v) => v,
        Err(_) => {
            warn!(server, identity, field, raw, "non-numeric counter, defaulting to 0");
            0
        }
    }
}

/// Report timestamps carry no zone marker; they are taken as UTC.
fn parse_connected_since(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw.trim(), CONNECTED_SINCE_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
