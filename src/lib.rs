//! Poll-based VPN session monitoring and traffic accounting.
//!
//! The agent polls concentrator status files on an interval, reconciles the
//! reported clients against stored sessions, and keeps a per-cycle traffic
//! ledger that the query surface turns into charts and rollups.

pub mod agent;
pub mod collector;
pub mod config;
pub mod export;
pub mod query;
pub mod status;
pub mod store;
