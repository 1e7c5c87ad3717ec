pub mod parse;

use std::fmt;

use chrono::{DateTime, Utc};

/// Sentinel origin port recorded when the report omits or mangles the port.
pub const UNKNOWN_PORT: &str = "unknown";

/// Uniquely identifies one concurrent session.
///
/// A single identity can hold several simultaneous sessions from different
/// origin addresses or ports; the full tuple keeps them apart. At most one
/// active `SessionRecord` exists per key at any time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub identity: String,
    pub server: String,
    pub origin_addr: String,
    pub origin_port: String,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} {}:{}",
            self.identity, self.server, self.origin_addr, self.origin_port,
        )
    }
}

/// Cumulative byte counters as reported by the concentrator.
///
/// "Total since session start" values; they never decrease except when the
/// peer re-establishes a session reusing the same key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// One connected client as seen in a single status report.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionObservation {
    pub identity: String,
    pub server: String,
    pub origin_addr: String,
    pub origin_port: String,
    pub virtual_addr: Option<String>,
    /// Cumulative bytes received from the client.
    pub bytes_received: u64,
    /// Cumulative bytes sent to the client.
    pub bytes_sent: u64,
    pub connected_at: DateTime<Utc>,
}

impl SessionObservation {
    /// The session key this observation belongs to.
    pub fn key(&self) -> SessionKey {
        SessionKey {
            identity: self.identity.clone(),
            server: self.server.clone(),
            origin_addr: self.origin_addr.clone(),
            origin_port: self.origin_port.clone(),
        }
    }

    /// The observation's cumulative counters in ledger orientation.
    pub fn counters(&self) -> Counters {
        Counters {
            bytes_in: self.bytes_received,
            bytes_out: self.bytes_sent,
        }
    }
}
