//! SQLite database for mirror domains, monitor state and the event log
//!
//! The domain table is the single source of truth for domain status. Every
//! status mutation runs in an immediate transaction together with its audit
//! event, so concurrent writers (the monitor daemon and the admin CLI) never
//! interleave a read-modify-write.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::events::{self, EventKind, EventRecord};
use crate::hostname::Host;
use crate::monitor::MonitorState;

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

const DOMAIN_COLUMNS: &str = "id, host, status, ssl_ready, created_at, updated_at, activated_at";

/// Lifecycle status of a mirror domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainStatus {
    /// Validated standby domain, possibly with a certificate, not serving
    Pending,
    /// Receiving proxied traffic
    Active,
    /// Confirmed unreachable; retired from rotation
    Blocked,
}

impl DomainStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" | "hot" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Blocked => "blocked",
        }
    }
}

impl ToSql for DomainStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for DomainStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        DomainStatus::from_str(s).ok_or_else(|| FromSqlError::Other(format!("unknown domain status {s:?}").into()))
    }
}

/// Domain record from database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainRecord {
    /// Insertion order; replacement selection is FIFO on this
    pub id: i64,
    pub host: String,
    pub status: DomainStatus,
    pub ssl_ready: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the domain was last promoted to active
    pub activated_at: Option<DateTime<Utc>>,
}

impl DomainRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            host: row.get(1)?,
            status: row.get(2)?,
            ssl_ready: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
            activated_at: row.get(6)?,
        })
    }
}

/// Per-status domain counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DomainCounts {
    pub pending: i64,
    pub active: i64,
    pub blocked: i64,
    pub ssl_ready: i64,
}

impl DomainCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.active + self.blocked
    }
}

/// A new domain to insert
#[derive(Debug, Clone)]
pub struct NewDomain {
    pub host: Host,
    /// Certificate material already exists for the host
    pub ssl_ready: bool,
}

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // WAL lets the CLI read while the daemon writes
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        let db = Self {
            conn: Mutex::new(conn),
        };

        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        let db = Self {
            conn: Mutex::new(conn),
        };

        db.run_migrations()?;
        Ok(db)
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: Initial schema
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: initial schema");

        conn.execute_batch(r#"
            -- Mirror domains
            CREATE TABLE IF NOT EXISTS domains (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                host TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'active', 'blocked')),
                ssl_ready INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                activated_at TEXT,
                CHECK (status <> 'active' OR ssl_ready = 1)
            );

            -- Health monitor state, one row per probed host
            CREATE TABLE IF NOT EXISTS monitor_state (
                host TEXT PRIMARY KEY,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                first_failure_at TEXT,
                last_failure_at TEXT,
                last_success_at TEXT,
                last_status INTEGER,
                last_error TEXT
            );

            -- Append-only audit log
            CREATE TABLE IF NOT EXISTS event_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_domains_status ON domains(status);
            CREATE INDEX IF NOT EXISTS idx_event_log_type ON event_log(event_type);

            INSERT INTO schema_migrations (version) VALUES (1);
        "#)?;

        Ok(())
    }

    // ==================== Domains ====================

    /// Insert domains as pending; hosts already present are left untouched
    ///
    /// Returns the hosts that were actually inserted.
    pub fn add_domains(&self, domains: &[NewDomain], at: DateTime<Utc>) -> Result<Vec<Host>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut added = Vec::new();

        for domain in domains {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO domains (host, status, ssl_ready, created_at, updated_at)
                 VALUES (?1, 'pending', ?2, ?3, ?3)",
                params![domain.host.as_str(), domain.ssl_ready, at],
            )?;
            if inserted > 0 {
                events::append(
                    &tx,
                    EventKind::DomainAdded,
                    &serde_json::json!({ "host": domain.host.as_str(), "ssl_ready": domain.ssl_ready }),
                    at,
                )?;
                added.push(domain.host.clone());
            }
        }

        tx.commit()?;
        Ok(added)
    }

    /// Get a domain by host
    pub fn get_domain(&self, host: &str) -> Result<Option<DomainRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {DOMAIN_COLUMNS} FROM domains WHERE host = ?1"),
            params![host],
            DomainRecord::from_row,
        )
        .optional()
        .context("Failed to get domain")
    }

    /// List domains in insertion order, optionally filtered by status
    pub fn list_domains(&self, status: Option<DomainStatus>) -> Result<Vec<DomainRecord>> {
        let conn = self.conn.lock();

        let domains = match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {DOMAIN_COLUMNS} FROM domains WHERE status = ?1 ORDER BY id ASC"
                ))?;
                let rows = stmt
                    .query_map(params![status], DomainRecord::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt =
                    conn.prepare(&format!("SELECT {DOMAIN_COLUMNS} FROM domains ORDER BY id ASC"))?;
                let rows = stmt
                    .query_map([], DomainRecord::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };

        Ok(domains)
    }

    /// Domains currently serving traffic
    pub fn active_domains(&self) -> Result<Vec<DomainRecord>> {
        self.list_domains(Some(DomainStatus::Active))
    }

    /// Count domains per status
    pub fn count_domains(&self) -> Result<DomainCounts> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*), SUM(ssl_ready) FROM domains GROUP BY status",
        )?;
        let mut counts = DomainCounts::default();

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, DomainStatus>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<i64>>(2)?.unwrap_or(0),
            ))
        })?;

        for row in rows {
            let (status, count, ssl) = row?;
            match status {
                DomainStatus::Pending => counts.pending = count,
                DomainStatus::Active => counts.active = count,
                DomainStatus::Blocked => counts.blocked = count,
            }
            counts.ssl_ready += ssl;
        }

        Ok(counts)
    }

    /// Pending hosts that still need a certificate, oldest first
    pub fn hosts_missing_ssl(&self, limit: Option<usize>) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT host FROM domains WHERE ssl_ready = 0 AND status = 'pending'
             ORDER BY id ASC LIMIT ?1",
        )?;
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let hosts = stmt
            .query_map(params![limit], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(hosts)
    }

    /// Record that certificate material has been issued for a host
    pub fn mark_ssl_ready(&self, host: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let changed = tx.execute(
            "UPDATE domains SET ssl_ready = 1, updated_at = ?1 WHERE host = ?2 AND ssl_ready = 0",
            params![at, host],
        )?;
        if changed > 0 {
            events::append(&tx, EventKind::SslIssued, &events::host_payload(host), at)?;
        }

        tx.commit()?;
        Ok(changed > 0)
    }

    /// Promote pending, SSL-ready hosts to active
    ///
    /// Hosts that are blocked, already active, unknown or without a
    /// certificate are skipped. Returns the hosts that were promoted.
    pub fn activate_hosts(&self, hosts: &[String], at: DateTime<Utc>) -> Result<Vec<String>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut activated = Vec::new();

        for host in hosts {
            let changed = tx.execute(
                "UPDATE domains SET status = 'active', activated_at = ?1, updated_at = ?1
                 WHERE host = ?2 AND status = 'pending' AND ssl_ready = 1",
                params![at, host],
            )?;
            if changed > 0 {
                events::append(&tx, EventKind::DomainActivated, &events::host_payload(host), at)?;
                activated.push(host.clone());
            }
        }

        tx.commit()?;
        Ok(activated)
    }

    /// Promote every pending, SSL-ready host
    pub fn activate_all_ready(&self, at: DateTime<Utc>) -> Result<Vec<String>> {
        let hosts: Vec<String> = self
            .list_domains(Some(DomainStatus::Pending))?
            .into_iter()
            .filter(|d| d.ssl_ready)
            .map(|d| d.host)
            .collect();
        self.activate_hosts(&hosts, at)
    }

    /// Take active hosts out of rotation, back to pending
    pub fn deactivate_hosts(&self, hosts: &[String], at: DateTime<Utc>) -> Result<Vec<String>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut deactivated = Vec::new();

        for host in hosts {
            let changed = tx.execute(
                "UPDATE domains SET status = 'pending', updated_at = ?1
                 WHERE host = ?2 AND status = 'active'",
                params![at, host],
            )?;
            if changed > 0 {
                events::append(&tx, EventKind::DomainDeactivated, &events::host_payload(host), at)?;
                tx.execute("DELETE FROM monitor_state WHERE host = ?1", params![host])?;
                deactivated.push(host.clone());
            }
        }

        tx.commit()?;
        Ok(deactivated)
    }

    /// Take every active host out of rotation
    pub fn deactivate_all(&self, at: DateTime<Utc>) -> Result<Vec<String>> {
        let hosts: Vec<String> = self.active_domains()?.into_iter().map(|d| d.host).collect();
        self.deactivate_hosts(&hosts, at)
    }

    /// Delete domains and their monitor state
    pub fn delete_domains(&self, hosts: &[String], at: DateTime<Utc>) -> Result<Vec<String>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut deleted = Vec::new();

        for host in hosts {
            let changed = tx.execute("DELETE FROM domains WHERE host = ?1", params![host])?;
            if changed > 0 {
                tx.execute("DELETE FROM monitor_state WHERE host = ?1", params![host])?;
                events::append(&tx, EventKind::DomainDeleted, &events::host_payload(host), at)?;
                deleted.push(host.clone());
            }
        }

        tx.commit()?;
        Ok(deleted)
    }

    /// Retire an active host after a confirmed block
    ///
    /// Returns false if the host was not active anymore (another writer got
    /// there first), in which case nothing is recorded.
    pub fn mark_blocked(&self, host: &str, reason: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let changed = tx.execute(
            "UPDATE domains SET status = 'blocked', updated_at = ?1 WHERE host = ?2 AND status = 'active'",
            params![at, host],
        )?;
        if changed > 0 {
            events::append(
                &tx,
                EventKind::DomainBlocked,
                &serde_json::json!({ "host": host, "reason": reason }),
                at,
            )?;
        }

        tx.commit()?;
        Ok(changed > 0)
    }

    /// Promote the oldest pending, SSL-ready domain to active
    ///
    /// Selection and promotion happen in one immediate transaction, so two
    /// concurrent failovers can never pick the same standby.
    pub fn promote_replacement(&self, replaced: &str, at: DateTime<Utc>) -> Result<Option<DomainRecord>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidate: Option<String> = tx
            .query_row(
                "SELECT host FROM domains WHERE status = 'pending' AND ssl_ready = 1
                 ORDER BY id ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let Some(host) = candidate else {
            tx.commit()?;
            return Ok(None);
        };

        tx.execute(
            "UPDATE domains SET status = 'active', activated_at = ?1, updated_at = ?1 WHERE host = ?2",
            params![at, host],
        )?;
        events::append(
            &tx,
            EventKind::DomainActivated,
            &serde_json::json!({ "host": host, "replaces": replaced }),
            at,
        )?;

        let record = tx.query_row(
            &format!("SELECT {DOMAIN_COLUMNS} FROM domains WHERE host = ?1"),
            params![host],
            DomainRecord::from_row,
        )?;

        tx.commit()?;
        Ok(Some(record))
    }

    // ==================== Event Log ====================

    /// Most recent events first, optionally filtered by kind
    pub fn list_events(&self, kind: Option<EventKind>, limit: usize) -> Result<Vec<EventRecord>> {
        let conn = self.conn.lock();

        let map_row = |row: &Row<'_>| -> rusqlite::Result<(i64, String, String, DateTime<Utc>)> {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        };

        let rows = match kind {
            Some(kind) => {
                let mut stmt = conn.prepare(
                    "SELECT id, event_type, payload, created_at FROM event_log
                     WHERE event_type = ?1 ORDER BY id DESC LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![kind.as_str(), limit as i64], map_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, event_type, payload, created_at FROM event_log
                     ORDER BY id DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(params![limit as i64], map_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };

        rows.into_iter()
            .map(|(id, event_type, payload, created_at)| {
                Ok(EventRecord {
                    id,
                    event_type,
                    payload: serde_json::from_str(&payload).context("Corrupt event payload")?,
                    created_at,
                })
            })
            .collect()
    }

    // ==================== Monitor State ====================
    //
    // Only `monitor::MonitorStates` calls these.

    pub(crate) fn load_monitor_state(&self, host: &str) -> Result<Option<MonitorState>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT host, consecutive_failures, first_failure_at, last_failure_at, last_success_at,
                    last_status, last_error
             FROM monitor_state WHERE host = ?1",
            params![host],
            |row| {
                Ok(MonitorState {
                    host: row.get(0)?,
                    consecutive_failures: row.get(1)?,
                    first_failure_at: row.get(2)?,
                    last_failure_at: row.get(3)?,
                    last_success_at: row.get(4)?,
                    last_status: row.get(5)?,
                    last_error: row.get(6)?,
                })
            },
        )
        .optional()
        .context("Failed to load monitor state")
    }

    pub(crate) fn save_monitor_state(&self, state: &MonitorState) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO monitor_state
                (host, consecutive_failures, first_failure_at, last_failure_at, last_success_at,
                 last_status, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(host) DO UPDATE SET
                consecutive_failures = excluded.consecutive_failures,
                first_failure_at = excluded.first_failure_at,
                last_failure_at = excluded.last_failure_at,
                last_success_at = excluded.last_success_at,
                last_status = excluded.last_status,
                last_error = excluded.last_error",
            params![
                state.host,
                state.consecutive_failures,
                state.first_failure_at,
                state.last_failure_at,
                state.last_success_at,
                state.last_status,
                state.last_error,
            ],
        )?;
        Ok(())
    }

    /// Drop monitor state rows for hosts not in `keep`
    pub(crate) fn retain_monitor_states(&self, keep: &[String]) -> Result<usize> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT host FROM monitor_state")?;
        let hosts = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut removed = 0;
        for host in hosts.iter().filter(|h| !keep.contains(h)) {
            removed += conn.execute("DELETE FROM monitor_state WHERE host = ?1", params![host])?;
        }
        Ok(removed)
    }
}
