//! Append-only audit log of domain state transitions
//!
//! Events are written inside the same transaction as the state change they
//! describe, so the log never disagrees with the domain table.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

/// Kinds of audited transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    DomainAdded,
    SslIssued,
    DomainActivated,
    DomainDeactivated,
    DomainBlocked,
    DomainDeleted,
}

impl EventKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "domain_added" => Some(Self::DomainAdded),
            "ssl_issued" => Some(Self::SslIssued),
            "domain_activated" => Some(Self::DomainActivated),
            "domain_deactivated" => Some(Self::DomainDeactivated),
            "domain_blocked" => Some(Self::DomainBlocked),
            "domain_deleted" => Some(Self::DomainDeleted),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DomainAdded => "domain_added",
            Self::SslIssued => "ssl_issued",
            Self::DomainActivated => "domain_activated",
            Self::DomainDeactivated => "domain_deactivated",
            Self::DomainBlocked => "domain_blocked",
            Self::DomainDeleted => "domain_deleted",
        }
    }
}

/// Event record from database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl EventRecord {
    pub fn kind(&self) -> Option<EventKind> {
        EventKind::from_str(&self.event_type)
    }

    /// The `host` field of the payload, when present
    pub fn host(&self) -> Option<&str> {
        self.payload.get("host").and_then(|h| h.as_str())
    }
}

/// Insert an event using an open connection or transaction
pub(crate) fn append(
    conn: &Connection,
    kind: EventKind,
    payload: &serde_json::Value,
    at: DateTime<Utc>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO event_log (event_type, payload, created_at) VALUES (?1, ?2, ?3)",
        params![kind.as_str(), payload.to_string(), at],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Payload for events that only carry the host
pub(crate) fn host_payload(host: &str) -> serde_json::Value {
    serde_json::json!({ "host": host })
}
