//! Typed errors and failure codes for mirror management
//!
//! Plumbing (database, filesystem, configuration) uses `anyhow`. The types
//! here describe the outcomes that callers must act on: rejected hostnames
//! and proxy sync failures. Probe failures and block decisions are not
//! errors; they live in [`crate::monitor`].

use serde::Serialize;
use thiserror::Error;

/// Why a raw hostname input was rejected by the normalizer
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Nothing left after stripping scheme, path and dots
    #[error("empty input")]
    Empty,
    /// The input could not be parsed as a URL authority
    #[error("unparseable host: {0}")]
    Unparseable(String),
    /// The host is an IP address, not a domain name
    #[error("IP addresses are not accepted")]
    IpAddress,
    /// Longer than 253 characters once encoded
    #[error("hostname longer than 253 characters")]
    TooLong,
    /// A label is empty, too long, or contains invalid characters
    #[error("invalid label: {0:?}")]
    InvalidLabel(String),
    /// Only one label, no TLD
    #[error("missing top-level domain")]
    MissingTld,
    /// The final label is not an alphabetic TLD of at least 2 characters
    #[error("invalid top-level domain: {0:?}")]
    InvalidTld(String),
}

impl RejectReason {
    /// Short machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::Empty => "empty",
            RejectReason::Unparseable(_) => "unparseable",
            RejectReason::IpAddress => "ip_address",
            RejectReason::TooLong => "too_long",
            RejectReason::InvalidLabel(_) => "invalid_label",
            RejectReason::MissingTld => "missing_tld",
            RejectReason::InvalidTld(_) => "invalid_tld",
        }
    }
}

/// A raw input that did not normalize to a hostname
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("rejected {input:?}: {reason}")]
pub struct Rejection {
    /// The input as given (trimmed)
    pub input: String,
    pub reason: RejectReason,
}

impl Rejection {
    pub fn new(input: &str, reason: RejectReason) -> Self {
        Self {
            input: input.trim().to_string(),
            reason,
        }
    }
}

/// Failure of the write-validate-reload cycle for proxy configuration
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncFailure {
    /// The proxy rejected the generated configuration; nothing was reloaded
    /// and the previous files were restored
    #[error("config validation failed: {output}")]
    ConfigValidation { output: String },
    /// The configuration validated but the reload command failed; files on
    /// disk may be ahead of the running proxy
    #[error("proxy reload failed: {output}")]
    Reload { output: String },
}

impl SyncFailure {
    /// Whether an operator has to look at the proxy by hand
    pub fn needs_manual_intervention(&self) -> bool {
        matches!(self, SyncFailure::Reload { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncFailure::ConfigValidation { .. } => "CONFIG_VALIDATION_FAILED",
            SyncFailure::Reload { .. } => "RELOAD_FAILED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_display() {
        let r = Rejection::new("  bad_host  ", RejectReason::MissingTld);
        assert_eq!(r.input, "bad_host");
        assert_eq!(r.to_string(), "rejected \"bad_host\": missing top-level domain");
    }

    #[test]
    fn test_reject_reason_codes() {
        assert_eq!(RejectReason::Empty.code(), "empty");
        assert_eq!(RejectReason::InvalidTld("1".into()).code(), "invalid_tld");
        assert_eq!(RejectReason::IpAddress.code(), "ip_address");
    }

    #[test]
    fn test_sync_failure_manual_intervention() {
        let validation = SyncFailure::ConfigValidation { output: "bad".into() };
        let reload = SyncFailure::Reload { output: "down".into() };
        assert!(!validation.needs_manual_intervention());
        assert!(reload.needs_manual_intervention());
        assert_eq!(reload.as_str(), "RELOAD_FAILED");
    }

    #[test]
    fn test_sync_failure_json() {
        let failure = SyncFailure::ConfigValidation { output: "nginx: [emerg]".into() };
        let json = serde_json::to_string(&failure).unwrap();
        assert!(json.contains("\"kind\":\"config_validation\""));
        assert!(json.contains("nginx: [emerg]"));
    }
}
