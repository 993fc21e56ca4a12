//! State machine vocabulary for asynchronous write transactions.
//!
//! A write accepted over the RPC surface doesn't complete inline; it
//! produces a transaction the caller polls. The status advances in
//! one direction only, `Unknown → Pending → Writing → Done`, and the
//! state may flip once from `Ok` to `Error`.

use chrono::{DateTime, Utc};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Status {
    Unknown,
    Pending,
    Writing,
    Done,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Unknown => write!(f, "UNKNOWN"),
            Status::Pending => write!(f, "PENDING"),
            Status::Writing => write!(f, "WRITING"),
            Status::Done => write!(f, "DONE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Ok,
    Error,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Ok => write!(f, "OK"),
            State::Error => write!(f, "ERROR"),
        }
    }
}

/// A point-in-time view of a write transaction, as returned by the
/// RPC surface. The live record is owned by the plugin's transaction
/// cache; this snapshot is what leaves the process.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: String,
    pub status: Status,
    pub state: State,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub message: String,
}

impl Transaction {
    /// Timestamps render as RFC 3339 on the wire.
    pub fn created_rfc3339(&self) -> String {
        self.created.to_rfc3339()
    }

    pub fn updated_rfc3339(&self) -> String {
        self.updated.to_rfc3339()
    }
}
