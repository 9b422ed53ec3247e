//! Per-host failure streaks

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;

use super::probe::ProbeResult;
use crate::db::Database;

/// Where a domain stands from the monitor's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", content = "failures", rename_all = "snake_case")]
pub enum HealthPhase {
    Healthy,
    /// Recently activated; not probed yet
    Grace,
    Failing(u32),
    Blocked,
}

/// Failure bookkeeping for one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitorState {
    pub host: String,
    pub consecutive_failures: u32,
    pub first_failure_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_status: Option<u16>,
    pub last_error: Option<String>,
}

impl MonitorState {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            consecutive_failures: 0,
            first_failure_at: None,
            last_failure_at: None,
            last_success_at: None,
            last_status: None,
            last_error: None,
        }
    }

    pub fn record_success(&mut self, status: Option<u16>, at: DateTime<Utc>) {
        self.consecutive_failures = 0;
        self.first_failure_at = None;
        self.last_failure_at = None;
        self.last_success_at = Some(at);
        self.last_status = status;
        self.last_error = None;
    }

    /// Count a failure; returns the streak length
    ///
    /// The streak starts over when the last success is older than
    /// `fail_window`. A host that never succeeded starts over when the
    /// previous failure is that old instead.
    pub fn record_failure(&mut self, result: &ProbeResult, at: DateTime<Utc>, fail_window: Duration) -> u32 {
        let since = self.last_success_at.or(self.last_failure_at);
        if since.map_or(false, |since| at - since > fail_window) {
            self.consecutive_failures = 0;
        }
        if self.consecutive_failures == 0 {
            self.first_failure_at = Some(at);
        }

        self.consecutive_failures += 1;
        self.last_failure_at = Some(at);
        self.last_status = result.status;
        self.last_error = Some(result.note.clone());
        self.consecutive_failures
    }

    /// Forget the streak after a block fired
    ///
    /// Counts as a fresh start at `at`; the last observed status and note
    /// are kept for inspection.
    pub fn clear_streak(&mut self, at: DateTime<Utc>) {
        self.consecutive_failures = 0;
        self.first_failure_at = None;
        self.last_failure_at = None;
        self.last_success_at = Some(at);
    }
}

/// Keyed store of monitor state, persisted in the database
#[derive(Clone)]
pub struct MonitorStates {
    db: Arc<Database>,
}

impl MonitorStates {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Stored state, or a fresh one for hosts never probed
    pub fn get(&self, host: &str) -> Result<MonitorState> {
        Ok(self
            .db
            .load_monitor_state(host)?
            .unwrap_or_else(|| MonitorState::new(host)))
    }

    pub fn save(&self, state: &MonitorState) -> Result<()> {
        self.db.save_monitor_state(state)
    }

    /// Drop state for hosts that are no longer monitored
    pub fn retain(&self, hosts: &[String]) -> Result<usize> {
        self.db.retain_monitor_states(hosts)
    }
}
