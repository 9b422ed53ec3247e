//! Hostname normalization and validation
//!
//! Operators paste domains in any shape: bare names, full URLs, mixed case,
//! internationalized names. Everything goes through [`normalize`] before it
//! touches the store, so the store only ever sees canonical ASCII hostnames.

use crate::error::{RejectReason, Rejection};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

const MAX_HOST_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// A canonical hostname: lowercase, IDNA-encoded, no trailing dot
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Host(String);

impl Host {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Host {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for Host {
    type Err = Rejection;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        normalize(s)
    }
}

/// Turn arbitrary user input into a canonical hostname
///
/// Strips scheme, credentials, port, path and query; lowercases; applies
/// IDNA encoding; trims surrounding dots; then checks the hostname grammar.
pub fn normalize(raw: &str) -> Result<Host, Rejection> {
    let reject = |reason| Rejection::new(raw, reason);

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(reject(RejectReason::Empty));
    }

    // Whatever the scheme was, reparse as http so the host gets the
    // special-scheme treatment (lowercasing and IDNA)
    let authority = match trimmed.find("://") {
        Some(idx) => &trimmed[idx + 3..],
        None => trimmed,
    };
    if authority.trim_matches(|c| c == '/' || c == '.').is_empty() {
        return Err(reject(RejectReason::Empty));
    }

    let url = Url::parse(&format!("http://{}", authority))
        .map_err(|e| reject(RejectReason::Unparseable(e.to_string())))?;

    let host = match url.host_str() {
        Some(h) if h.starts_with('[') || h.parse::<Ipv4Addr>().is_ok() => {
            return Err(reject(RejectReason::IpAddress))
        }
        Some(h) => h.trim_matches('.').to_lowercase(),
        None => return Err(reject(RejectReason::Empty)),
    };

    validate(&host).map_err(reject)?;
    Ok(Host(host))
}

/// Check an already-lowercased ASCII hostname against the grammar
fn validate(host: &str) -> Result<(), RejectReason> {
    if host.is_empty() {
        return Err(RejectReason::Empty);
    }
    if host.len() > MAX_HOST_LEN {
        return Err(RejectReason::TooLong);
    }

    let labels: Vec<&str> = host.split('.').collect();
    for label in &labels {
        if !is_valid_label(label) {
            return Err(RejectReason::InvalidLabel(label.to_string()));
        }
    }

    if labels.len() < 2 {
        return Err(RejectReason::MissingTld);
    }

    let tld = labels[labels.len() - 1];
    if !is_valid_tld(tld) {
        return Err(RejectReason::InvalidTld(tld.to_string()));
    }

    Ok(())
}

fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= MAX_LABEL_LEN
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn is_valid_tld(tld: &str) -> bool {
    if let Some(encoded) = tld.strip_prefix("xn--") {
        return !encoded.is_empty();
    }
    tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic())
}

/// Result of normalizing a batch of operator input
#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    /// Canonical hosts, deduplicated, in first-seen order
    pub accepted: Vec<Host>,
    /// Inputs that failed normalization
    pub rejected: Vec<Rejection>,
}

/// Normalize every input; blank entries are skipped, failures never abort
pub fn normalize_batch<I, S>(inputs: I) -> NormalizedBatch
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut batch = NormalizedBatch::default();
    let mut seen = HashSet::new();

    for raw in inputs {
        let raw = raw.as_ref();
        if raw.trim().is_empty() {
            continue;
        }
        match normalize(raw) {
            Ok(host) => {
                if seen.insert(host.clone()) {
                    batch.accepted.push(host);
                }
            }
            Err(rejection) => batch.rejected.push(rejection),
        }
    }

    batch
}
