//! Operator workflows over the domain pool
//!
//! Every operator command is an [`AdminAction`]; [`Admin::dispatch`] is the
//! single entry point. Actions that change what the proxy serves finish with
//! a config sync.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::acme::{CertificateIssuer, IssueOutcome, LiveCertificates};
use crate::clock::Clock;
use crate::db::{Database, DomainCounts, DomainRecord, DomainStatus, NewDomain};
use crate::error::Rejection;
use crate::events::{EventKind, EventRecord};
use crate::hostname::{normalize_batch, Host};
use crate::notifications::SyncOutcome;
use crate::reload::ApplyReport;
use crate::sync::ProxySync;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AdminAction {
    /// Register domains, obtain certificates, optionally activate them
    AddDomains { inputs: Vec<String>, activate: bool },
    /// Request certificates for pending domains that lack one
    IssueMissing { limit: Option<usize> },
    /// Activate the given hosts; an empty list means every ready domain
    Activate { hosts: Vec<String> },
    /// Return active hosts to pending; an empty list means all of them
    Deactivate { hosts: Vec<String> },
    Delete { hosts: Vec<String> },
    List { status: Option<DomainStatus> },
    Events { kind: Option<EventKind>, limit: usize },
    Sync,
}

/// Result of the add-domain workflow
#[derive(Debug, Clone, Default, Serialize)]
pub struct AddReport {
    /// Inputs that normalized, deduplicated
    pub accepted: Vec<String>,
    pub rejected: Vec<Rejection>,
    /// Hosts that were not in the store before
    pub added: Vec<String>,
    /// Hosts that already had usable certificates
    pub already_ssl: Vec<String>,
    pub issued: Vec<IssueOutcome>,
    pub activated: Vec<String>,
    pub sync: Option<SyncOutcome>,
}

/// Result of issuing missing certificates
#[derive(Debug, Clone, Default, Serialize)]
pub struct IssueReport {
    pub issued: Vec<IssueOutcome>,
    pub sync: Option<SyncOutcome>,
}

/// Result of activate / deactivate / delete
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChangeReport {
    pub changed: Vec<String>,
    pub rejected: Vec<Rejection>,
    /// `None` when nothing changed and no sync was needed
    pub sync: Option<SyncOutcome>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdminOutcome {
    Added(AddReport),
    Issued(IssueReport),
    Activated(ChangeReport),
    Deactivated(ChangeReport),
    Deleted(ChangeReport),
    Listing { domains: Vec<DomainRecord>, counts: DomainCounts },
    Events { events: Vec<EventRecord> },
    Synced(ApplyReport),
}

pub struct Admin {
    db: Arc<Database>,
    issuer: Arc<dyn CertificateIssuer>,
    sync: Arc<dyn ProxySync>,
    certs: LiveCertificates,
    min_valid_days: i64,
    clock: Arc<dyn Clock>,
}

impl Admin {
    pub fn new(
        db: Arc<Database>,
        issuer: Arc<dyn CertificateIssuer>,
        sync: Arc<dyn ProxySync>,
        certs: LiveCertificates,
        min_valid_days: i64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            issuer,
            sync,
            certs,
            min_valid_days,
            clock,
        }
    }

    pub async fn dispatch(&self, action: AdminAction) -> Result<AdminOutcome> {
        match action {
            AdminAction::AddDomains { inputs, activate } => {
                Ok(AdminOutcome::Added(self.add_domains(&inputs, activate).await?))
            }
            AdminAction::IssueMissing { limit } => Ok(AdminOutcome::Issued(self.issue_missing(limit).await?)),
            AdminAction::Activate { hosts } => Ok(AdminOutcome::Activated(self.activate(&hosts).await?)),
            AdminAction::Deactivate { hosts } => Ok(AdminOutcome::Deactivated(self.deactivate(&hosts).await?)),
            AdminAction::Delete { hosts } => Ok(AdminOutcome::Deleted(self.delete(&hosts).await?)),
            AdminAction::List { status } => Ok(AdminOutcome::Listing {
                domains: self.db.list_domains(status)?,
                counts: self.db.count_domains()?,
            }),
            AdminAction::Events { kind, limit } => Ok(AdminOutcome::Events {
                events: self.db.list_events(kind, limit)?,
            }),
            AdminAction::Sync => Ok(AdminOutcome::Synced(self.sync.sync().await?)),
        }
    }

    async fn add_domains(&self, inputs: &[String], activate: bool) -> Result<AddReport> {
        let batch = normalize_batch(inputs);
        let mut report = AddReport {
            accepted: batch.accepted.iter().map(|h| h.to_string()).collect(),
            rejected: batch.rejected,
            ..AddReport::default()
        };
        if batch.accepted.is_empty() {
            return Ok(report);
        }

        let now = self.clock.now();
        let new_domains: Vec<NewDomain> = batch
            .accepted
            .iter()
            .map(|host| NewDomain {
                host: host.clone(),
                ssl_ready: self
                    .certs
                    .has_valid_certificate(host.as_str(), self.min_valid_days, now),
            })
            .collect();
        report.added = self
            .db
            .add_domains(&new_domains, now)?
            .into_iter()
            .map(Host::into_string)
            .collect();
        info!(accepted = report.accepted.len(), added = report.added.len(), "Domains registered");

        let mut needs_cert = Vec::new();
        for host in &batch.accepted {
            match self.db.get_domain(host.as_str())? {
                Some(d) if d.ssl_ready => report.already_ssl.push(d.host),
                Some(d) if d.status == DomainStatus::Pending => needs_cert.push(host.clone()),
                _ => {}
            }
        }

        if !needs_cert.is_empty() {
            self.sync_before_issue().await;
            report.issued = self.issue_and_mark(&needs_cert).await?;
        }

        if activate {
            report.activated = self.db.activate_hosts(&report.accepted, self.clock.now())?;
        }

        report.sync = Some(SyncOutcome::from_result(&self.sync.sync().await));
        Ok(report)
    }

    async fn issue_missing(&self, limit: Option<usize>) -> Result<IssueReport> {
        let mut hosts = Vec::new();
        for host in self.db.hosts_missing_ssl(limit)? {
            match host.parse::<Host>() {
                Ok(h) => hosts.push(h),
                Err(e) => warn!(host = %host, error = %e, "Skipping stored host that no longer validates"),
            }
        }
        if hosts.is_empty() {
            return Ok(IssueReport::default());
        }

        self.sync_before_issue().await;
        let issued = self.issue_and_mark(&hosts).await?;
        let sync = if issued.iter().any(|o| o.ok) {
            Some(SyncOutcome::from_result(&self.sync.sync().await))
        } else {
            None
        };
        Ok(IssueReport { issued, sync })
    }

    /// The port-80 blocks must be live before the CA comes knocking
    async fn sync_before_issue(&self) {
        match SyncOutcome::from_result(&self.sync.sync().await) {
            SyncOutcome::Applied { .. } => {}
            other => warn!(outcome = ?other, "Proxy sync before issuance did not apply cleanly"),
        }
    }

    async fn issue_and_mark(&self, hosts: &[Host]) -> Result<Vec<IssueOutcome>> {
        let outcomes = self.issuer.issue(hosts).await;
        for outcome in &outcomes {
            if outcome.ok {
                self.db.mark_ssl_ready(&outcome.host, self.clock.now())?;
            } else {
                warn!(host = %outcome.host, message = %outcome.message, "Certificate not issued");
            }
        }
        Ok(outcomes)
    }

    async fn activate(&self, inputs: &[String]) -> Result<ChangeReport> {
        let now = self.clock.now();
        let (changed, rejected) = if inputs.is_empty() {
            (self.db.activate_all_ready(now)?, Vec::new())
        } else {
            let (hosts, rejected) = normalize_hosts(inputs);
            (self.db.activate_hosts(&hosts, now)?, rejected)
        };
        self.finish_change(changed, rejected).await
    }

    async fn deactivate(&self, inputs: &[String]) -> Result<ChangeReport> {
        let now = self.clock.now();
        let (changed, rejected) = if inputs.is_empty() {
            (self.db.deactivate_all(now)?, Vec::new())
        } else {
            let (hosts, rejected) = normalize_hosts(inputs);
            (self.db.deactivate_hosts(&hosts, now)?, rejected)
        };
        self.finish_change(changed, rejected).await
    }

    async fn delete(&self, inputs: &[String]) -> Result<ChangeReport> {
        let (hosts, rejected) = normalize_hosts(inputs);
        let changed = self.db.delete_domains(&hosts, self.clock.now())?;
        self.finish_change(changed, rejected).await
    }

    async fn finish_change(&self, changed: Vec<String>, rejected: Vec<Rejection>) -> Result<ChangeReport> {
        let sync = if changed.is_empty() {
            None
        } else {
            Some(SyncOutcome::from_result(&self.sync.sync().await))
        };
        Ok(ChangeReport {
            changed,
            rejected,
            sync,
        })
    }
}

fn normalize_hosts(inputs: &[String]) -> (Vec<String>, Vec<Rejection>) {
    let batch = normalize_batch(inputs);
    (
        batch.accepted.into_iter().map(Host::into_string).collect(),
        batch.rejected,
    )
}

fn write_sync(f: &mut fmt::Formatter<'_>, sync: &Option<SyncOutcome>) -> fmt::Result {
    match sync {
        None => Ok(()),
        Some(SyncOutcome::Applied { summary }) => writeln!(f, "{}", summary),
        Some(SyncOutcome::Failed { failure }) => writeln!(f, "sync {}: {}", failure.as_str(), failure),
        Some(SyncOutcome::Error { message }) => writeln!(f, "sync error: {}", message),
    }
}

fn write_rejected(f: &mut fmt::Formatter<'_>, rejected: &[Rejection]) -> fmt::Result {
    for r in rejected {
        writeln!(f, "  rejected {:?}: {}", r.input, r.reason)?;
    }
    Ok(())
}

impl fmt::Display for AdminOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminOutcome::Added(r) => {
                writeln!(
                    f,
                    "accepted: {}, added: {}, rejected: {}",
                    r.accepted.len(),
                    r.added.len(),
                    r.rejected.len()
                )?;
                write_rejected(f, &r.rejected)?;
                if !r.already_ssl.is_empty() {
                    writeln!(f, "already have SSL: {}", r.already_ssl.join(", "))?;
                }
                for o in &r.issued {
                    writeln!(f, "  {} {}: {}", if o.ok { "issued" } else { "FAILED" }, o.host, o.message)?;
                }
                if !r.activated.is_empty() {
                    writeln!(f, "activated: {}", r.activated.join(", "))?;
                }
                write_sync(f, &r.sync)
            }
            AdminOutcome::Issued(r) => {
                if r.issued.is_empty() {
                    writeln!(f, "no domains need certificates")?;
                }
                for o in &r.issued {
                    writeln!(f, "  {} {}: {}", if o.ok { "issued" } else { "FAILED" }, o.host, o.message)?;
                }
                write_sync(f, &r.sync)
            }
            AdminOutcome::Activated(r) | AdminOutcome::Deactivated(r) | AdminOutcome::Deleted(r) => {
                let verb = match self {
                    AdminOutcome::Activated(_) => "activated",
                    AdminOutcome::Deactivated(_) => "deactivated",
                    _ => "deleted",
                };
                if r.changed.is_empty() {
                    writeln!(f, "nothing {}", verb)?;
                } else {
                    writeln!(f, "{}: {}", verb, r.changed.join(", "))?;
                }
                write_rejected(f, &r.rejected)?;
                write_sync(f, &r.sync)
            }
            AdminOutcome::Listing { domains, counts } => {
                for d in domains {
                    writeln!(
                        f,
                        "{:>5}  {:<8} {:<4} {}",
                        d.id,
                        d.status.as_str(),
                        if d.ssl_ready { "ssl" } else { "-" },
                        d.host
                    )?;
                }
                writeln!(
                    f,
                    "total: {}, active: {}, pending: {}, blocked: {}, with SSL: {}",
                    counts.total(),
                    counts.active,
                    counts.pending,
                    counts.blocked,
                    counts.ssl_ready
                )
            }
            AdminOutcome::Events { events } => {
                for e in events {
                    writeln!(
                        f,
                        "{}  {:<18} {}",
                        e.created_at.format("%Y-%m-%d %H:%M:%S"),
                        e.event_type,
                        e.payload
                    )?;
                }
                Ok(())
            }
            AdminOutcome::Synced(report) => writeln!(f, "{}", report),
        }
    }
}
