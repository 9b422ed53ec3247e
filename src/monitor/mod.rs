//! Health monitor and failover engine
//!
//! Each iteration probes every active domain that is past its grace period.
//! A domain is retired only after `fail_threshold` consecutive failed probes,
//! each within `fail_window` of the last success. When that happens the oldest
//! standby with a certificate takes over, the proxy is resynced and admins
//! get one alert.

mod probe;
mod state;

pub use probe::{classify_error, classify_response, Classification, HttpProber, ProbeResult, Prober, BODY_SCAN_LIMIT};
pub use state::{HealthPhase, MonitorState, MonitorStates};

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::MonitorConfig;
use crate::db::{Database, DomainRecord, DomainStatus};
use crate::notifications::{AdminAlert, FailoverAction, Notifier, SyncOutcome};
use crate::sync::ProxySync;

/// Monitor tunables
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub interval: Duration,
    pub grace_period: chrono::Duration,
    pub fail_threshold: u32,
    pub fail_window: chrono::Duration,
    pub max_concurrent_probes: usize,
}

impl MonitorSettings {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            interval: config.check_interval(),
            grace_period: chrono::Duration::seconds(config.grace_period_secs as i64),
            fail_threshold: config.fail_threshold.max(1),
            fail_window: chrono::Duration::seconds(config.fail_window_secs as i64),
            max_concurrent_probes: config.max_concurrent_probes.max(1),
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from_config(&MonitorConfig::default())
    }
}

/// Verdict after recording one probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockDecision {
    Continue { failures: u32 },
    Block { reason: String },
}

/// A block the monitor acted on
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockOutcome {
    pub host: String,
    pub reason: String,
    pub action: FailoverAction,
}

/// Summary of one monitor iteration
#[derive(Debug, Clone, Default, Serialize)]
pub struct IterationReport {
    pub probed: usize,
    pub in_grace: usize,
    pub failures: usize,
    pub blocked: Vec<BlockOutcome>,
    /// Domains whose handling hit an internal error
    pub errors: usize,
}

pub struct Monitor {
    db: Arc<Database>,
    states: MonitorStates,
    prober: Arc<dyn Prober>,
    sync: Arc<dyn ProxySync>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    settings: MonitorSettings,
}

impl Monitor {
    pub fn new(
        db: Arc<Database>,
        prober: Arc<dyn Prober>,
        sync: Arc<dyn ProxySync>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            states: MonitorStates::new(db.clone()),
            db,
            prober,
            sync,
            notifier,
            clock,
            settings,
        }
    }

    pub fn states(&self) -> &MonitorStates {
        &self.states
    }

    /// Run until shutdown is signalled
    ///
    /// Shutdown is checked between iterations; an iteration in progress
    /// always finishes.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.settings.interval.as_secs(),
            fail_threshold = self.settings.fail_threshold,
            grace_secs = self.settings.grace_period.num_seconds(),
            "Monitor started"
        );

        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_iteration().await {
                        Ok(report) => debug!(
                            probed = report.probed,
                            in_grace = report.in_grace,
                            failures = report.failures,
                            blocked = report.blocked.len(),
                            "Monitor iteration complete"
                        ),
                        Err(e) => error!(error = %e, "Monitor iteration failed"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Probe all active domains once and act on confirmed blocks
    pub async fn run_iteration(&self) -> Result<IterationReport> {
        let now = self.clock.now();
        let active = self.db.active_domains()?;
        let mut report = IterationReport::default();

        let hosts: Vec<String> = active.iter().map(|d| d.host.clone()).collect();
        let dropped = self.states.retain(&hosts)?;
        if dropped > 0 {
            debug!(dropped, "Dropped monitor state for inactive hosts");
        }

        let (grace, due): (Vec<DomainRecord>, Vec<DomainRecord>) =
            active.into_iter().partition(|d| self.in_grace(d, now));
        report.in_grace = grace.len();
        for domain in &grace {
            debug!(host = %domain.host, "In grace period, not probing");
        }

        let prober = &self.prober;
        let mut results: Vec<(DomainRecord, Result<ProbeResult>)> = stream::iter(due)
            .map(|domain| async move {
                let result = prober.probe(&domain.host).await;
                (domain, result)
            })
            .buffer_unordered(self.settings.max_concurrent_probes)
            .collect()
            .await;
        results.sort_by_key(|(domain, _)| domain.id);
        report.probed = results.len();

        for (domain, result) in results {
            let result = result.unwrap_or_else(|e| {
                warn!(host = %domain.host, error = %e, "Probe could not run");
                report.errors += 1;
                ProbeResult::fail(None, format!("internal:{}", e))
            });
            if result.classification.is_failure() {
                report.failures += 1;
            }

            match self.handle_result(&domain.host, &result).await {
                Ok(Some(outcome)) => report.blocked.push(outcome),
                Ok(None) => {}
                Err(e) => {
                    error!(host = %domain.host, error = %e, "Failed to handle probe result");
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }

    /// Record one probe result and fail over if it confirms a block
    pub async fn handle_result(&self, host: &str, result: &ProbeResult) -> Result<Option<BlockOutcome>> {
        match self.record(host, result)? {
            BlockDecision::Continue { failures } => {
                if failures > 0 {
                    info!(
                        host = %host,
                        failures,
                        threshold = self.settings.fail_threshold,
                        reason = %result.reason(),
                        "Probe failed"
                    );
                }
                Ok(None)
            }
            BlockDecision::Block { reason } => self.fail_over(host, &reason).await,
        }
    }

    /// Update the host's streak and decide whether it is blocked
    pub fn record(&self, host: &str, result: &ProbeResult) -> Result<BlockDecision> {
        let at = self.clock.now();
        let mut state = self.states.get(host)?;

        if !result.classification.is_failure() {
            state.record_success(result.status, at);
            self.states.save(&state)?;
            return Ok(BlockDecision::Continue { failures: 0 });
        }

        let failures = state.record_failure(result, at, self.settings.fail_window);
        self.states.save(&state)?;

        if failures >= self.settings.fail_threshold {
            Ok(BlockDecision::Block {
                reason: result.reason(),
            })
        } else {
            Ok(BlockDecision::Continue { failures })
        }
    }

    async fn fail_over(&self, host: &str, reason: &str) -> Result<Option<BlockOutcome>> {
        let at = self.clock.now();

        let mut state = self.states.get(host)?;
        state.clear_streak(at);
        self.states.save(&state)?;

        if !self.db.mark_blocked(host, reason, at)? {
            debug!(host = %host, "Domain no longer active, skipping failover");
            return Ok(None);
        }
        warn!(host = %host, reason = %reason, "Domain blocked");

        let action = match self.db.promote_replacement(host, at)? {
            Some(replacement) => {
                info!(host = %host, replacement = %replacement.host, "Replacement activated");
                let result = self.sync.sync().await;
                if let Err(e) = &result {
                    error!(error = %e, "Proxy sync after failover failed");
                }
                FailoverAction::Replaced {
                    replacement: replacement.host,
                    sync: SyncOutcome::from_result(&result),
                }
            }
            None => {
                warn!(host = %host, "No replacement domain available");
                FailoverAction::NoReplacement
            }
        };

        let alert = AdminAlert {
            host: host.to_string(),
            reason: reason.to_string(),
            action: action.clone(),
            at,
        };
        if let Err(e) = self.notifier.notify(&alert).await {
            error!(host = %host, error = %e, "Failed to notify admins");
        }

        Ok(Some(BlockOutcome {
            host: host.to_string(),
            reason: reason.to_string(),
            action,
        }))
    }

    /// Activated less than `grace_period` ago
    pub fn in_grace(&self, domain: &DomainRecord, now: DateTime<Utc>) -> bool {
        domain.status == DomainStatus::Active
            && domain
                .activated_at
                .map_or(false, |at| now - at < self.settings.grace_period)
    }

    /// Current phase of a domain
    pub fn phase(&self, domain: &DomainRecord) -> Result<HealthPhase> {
        match domain.status {
            DomainStatus::Blocked => return Ok(HealthPhase::Blocked),
            DomainStatus::Active if self.in_grace(domain, self.clock.now()) => {
                return Ok(HealthPhase::Grace)
            }
            _ => {}
        }

        let state = self.states.get(&domain.host)?;
        if state.consecutive_failures > 0 {
            Ok(HealthPhase::Failing(state.consecutive_failures))
        } else {
            Ok(HealthPhase::Healthy)
        }
    }
}
