//! Certificate material on disk and the issuance boundary
//!
//! Issuance itself is delegated to an external ACME client (certbot by
//! default) using the webroot method: the proxy serves
//! `/.well-known/acme-challenge/` from the webroot on port 80 for every
//! domain, and the client drops challenge files there.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::AcmeConfig;
use crate::hostname::Host;

/// Live certificate directory (`<live_dir>/<host>/fullchain.pem`)
#[derive(Debug, Clone)]
pub struct LiveCertificates {
    live_dir: PathBuf,
}

impl LiveCertificates {
    pub fn new(live_dir: impl Into<PathBuf>) -> Self {
        Self {
            live_dir: live_dir.into(),
        }
    }

    pub fn live_dir(&self) -> &Path {
        &self.live_dir
    }

    /// Get certificate chain path for a host
    pub fn fullchain_path(&self, host: &str) -> PathBuf {
        self.live_dir.join(host).join("fullchain.pem")
    }

    /// Get private key path for a host
    pub fn privkey_path(&self, host: &str) -> PathBuf {
        self.live_dir.join(host).join("privkey.pem")
    }

    /// Both the chain and the key exist
    pub fn has_certificate(&self, host: &str) -> bool {
        self.fullchain_path(host).exists() && self.privkey_path(host).exists()
    }

    /// Whole days until the leaf certificate expires (negative once expired)
    pub fn days_remaining(&self, host: &str, now: DateTime<Utc>) -> Result<i64> {
        let path = self.fullchain_path(host);
        let cert_pem = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let pem = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
            .context("Failed to parse PEM")?;

        let cert = pem.1.parse_x509()
            .context("Failed to parse X509")?;

        let expires_at = cert.validity().not_after.timestamp();
        Ok((expires_at - now.timestamp()) / 86400)
    }

    /// A certificate exists and stays valid for more than `min_days`
    pub fn has_valid_certificate(&self, host: &str, min_days: i64, now: DateTime<Utc>) -> bool {
        if !self.has_certificate(host) {
            return false;
        }

        match self.days_remaining(host, now) {
            Ok(days) => days > min_days,
            Err(e) => {
                debug!(host = %host, error = %e, "Unreadable certificate treated as missing");
                false
            }
        }
    }
}

/// Result of one issuance attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssueOutcome {
    pub host: String,
    pub ok: bool,
    pub message: String,
}

impl IssueOutcome {
    fn failed(host: &str, message: impl Into<String>) -> Self {
        Self {
            host: host.to_string(),
            ok: false,
            message: message.into(),
        }
    }
}

/// Obtains certificates; every host succeeds or fails independently
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn issue(&self, hosts: &[Host]) -> Vec<IssueOutcome>;
}

/// Runs certbot (or a compatible client) with the webroot authenticator
#[derive(Debug, Clone)]
pub struct CertbotIssuer {
    program: String,
    base_args: Vec<String>,
    email: Option<String>,
    staging: bool,
    webroot: PathBuf,
    timeout: Duration,
}

impl CertbotIssuer {
    pub fn from_config(config: &AcmeConfig) -> Result<Self> {
        let mut words = shell_words::split(&config.command)
            .with_context(|| format!("Invalid acme.command {:?}", config.command))?;
        if words.is_empty() {
            anyhow::bail!("acme.command is empty");
        }
        let program = words.remove(0);

        Ok(Self {
            program,
            base_args: words,
            email: config.email.clone(),
            staging: config.staging,
            webroot: config.webroot.clone(),
            timeout: config.issue_timeout(),
        })
    }

    /// Arguments for one host, after any configured prefix arguments
    pub fn certbot_args(&self, host: &str) -> Vec<String> {
        let email = self
            .email
            .clone()
            .unwrap_or_else(|| format!("admin@{}", host));

        let mut args = self.base_args.clone();
        args.extend(
            [
                "certonly",
                "--webroot",
                "-w",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        args.push(self.webroot.display().to_string());
        args.extend(["-d".to_string(), host.to_string()]);
        args.extend(
            ["--agree-tos", "--non-interactive", "--expand", "-m"]
                .iter()
                .map(|s| s.to_string()),
        );
        args.push(email);
        if self.staging {
            args.push("--staging".to_string());
        }
        args
    }

    /// Make sure the challenge directory exists and nginx can read it
    pub fn ensure_webroot(&self) -> Result<()> {
        let well_known = self.webroot.join(".well-known");
        let challenge = well_known.join("acme-challenge");
        std::fs::create_dir_all(&challenge)
            .with_context(|| format!("Failed to create {}", challenge.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            for dir in [&self.webroot, &well_known, &challenge] {
                std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755))
                    .with_context(|| format!("Failed to chmod {}", dir.display()))?;
            }
        }

        Ok(())
    }

    async fn issue_one(&self, host: &str) -> IssueOutcome {
        let args = self.certbot_args(host);
        debug!(host = %host, program = %self.program, ?args, "Requesting certificate");

        let run = Command::new(&self.program).args(&args).kill_on_drop(true).output();
        let output = match tokio::time::timeout(self.timeout, run).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(host = %host, error = %e, "Failed to spawn certificate client");
                return IssueOutcome::failed(host, format!("failed to run {}: {}", self.program, e));
            }
            Err(_) => {
                warn!(host = %host, timeout_secs = self.timeout.as_secs(), "Certificate client timed out");
                return IssueOutcome::failed(host, format!("{} timed out after {:?}", self.program, self.timeout));
            }
        };

        if output.status.success() {
            info!(host = %host, "Certificate issued");
            IssueOutcome {
                host: host.to_string(),
                ok: true,
                message: "issued".to_string(),
            }
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let text = if stderr.trim().is_empty() { stdout } else { stderr };
            warn!(host = %host, status = %output.status, "Certificate issuance failed");
            IssueOutcome::failed(host, tail(text.trim(), 800))
        }
    }
}

#[async_trait]
impl CertificateIssuer for CertbotIssuer {
    async fn issue(&self, hosts: &[Host]) -> Vec<IssueOutcome> {
        if hosts.is_empty() {
            return Vec::new();
        }

        if let Err(e) = self.ensure_webroot() {
            warn!(error = %e, "ACME webroot unavailable");
            return hosts
                .iter()
                .map(|h| IssueOutcome::failed(h.as_str(), format!("webroot: {:#}", e)))
                .collect();
        }

        let mut outcomes = Vec::with_capacity(hosts.len());
        for host in hosts {
            outcomes.push(self.issue_one(host.as_str()).await);
        }
        outcomes
    }
}

/// Last `max` characters of a message
fn tail(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        text.to_string()
    } else {
        text.chars().skip(count - max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{generate_simple_self_signed, CertifiedKey};

    fn issuer(command: &str, webroot: &Path) -> CertbotIssuer {
        CertbotIssuer::from_config(&AcmeConfig {
            command: command.to_string(),
            webroot: webroot.to_path_buf(),
            ..AcmeConfig::default()
        })
        .unwrap()
    }

    fn write_cert(live: &Path, host: &str) {
        let CertifiedKey { cert, key_pair } = generate_simple_self_signed(vec![host.to_string()]).unwrap();
        let dir = live.join(host);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("fullchain.pem"), cert.pem()).unwrap();
        std::fs::write(dir.join("privkey.pem"), key_pair.serialize_pem()).unwrap();
    }

    #[test]
    fn test_certificate_paths() {
        let certs = LiveCertificates::new("/etc/letsencrypt/live");
        assert_eq!(
            certs.fullchain_path("a.example.com"),
            PathBuf::from("/etc/letsencrypt/live/a.example.com/fullchain.pem")
        );
        assert_eq!(
            certs.privkey_path("a.example.com"),
            PathBuf::from("/etc/letsencrypt/live/a.example.com/privkey.pem")
        );
        assert!(!certs.has_certificate("a.example.com"));
    }

    #[test]
    fn test_certificate_expiry() {
        let dir = tempfile::tempdir().unwrap();
        write_cert(dir.path(), "a.example.com");

        let certs = LiveCertificates::new(dir.path());
        assert!(certs.has_certificate("a.example.com"));

        let days = certs.days_remaining("a.example.com", Utc::now()).unwrap();
        assert!(days > 365, "self-signed cert should be long-lived, got {} days", days);
        assert!(certs.has_valid_certificate("a.example.com", 7, Utc::now()));
        assert!(!certs.has_valid_certificate("b.example.com", 7, Utc::now()));
    }

    #[test]
    fn test_garbage_certificate_is_not_valid() {
        let dir = tempfile::tempdir().unwrap();
        let host_dir = dir.path().join("a.example.com");
        std::fs::create_dir_all(&host_dir).unwrap();
        std::fs::write(host_dir.join("fullchain.pem"), "not a cert").unwrap();
        std::fs::write(host_dir.join("privkey.pem"), "not a key").unwrap();

        let certs = LiveCertificates::new(dir.path());
        assert!(certs.has_certificate("a.example.com"));
        assert!(!certs.has_valid_certificate("a.example.com", 7, Utc::now()));
    }

    #[test]
    fn test_certbot_args() {
        let mut issuer = issuer("certbot", Path::new("/var/www/certbot"));
        assert_eq!(
            issuer.certbot_args("a.example.com").join(" "),
            "certonly --webroot -w /var/www/certbot -d a.example.com --agree-tos --non-interactive --expand -m admin@a.example.com"
        );

        issuer.email = Some("ops@example.com".to_string());
        issuer.staging = true;
        let args = issuer.certbot_args("a.example.com");
        assert!(args.contains(&"ops@example.com".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("--staging"));
    }

    #[test]
    fn test_command_prefix_arguments() {
        let issuer = issuer("sudo -n certbot", Path::new("/w"));
        assert_eq!(issuer.program, "sudo");
        assert_eq!(&issuer.certbot_args("a.example.com")[..3], ["-n", "certbot", "certonly"]);
    }

    #[tokio::test]
    async fn test_issue_outcomes_per_host() {
        let dir = tempfile::tempdir().unwrap();
        let webroot = dir.path().join("webroot");
        let hosts: Vec<Host> = vec!["a.example.com".parse().unwrap(), "b.example.com".parse().unwrap()];

        let ok = issuer("true", &webroot).issue(&hosts).await;
        assert_eq!(ok.len(), 2);
        assert!(ok.iter().all(|o| o.ok));
        assert!(webroot.join(".well-known/acme-challenge").is_dir());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(webroot.join(".well-known/acme-challenge"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o755);
        }

        let failed = issuer("false", &webroot).issue(&hosts).await;
        assert!(failed.iter().all(|o| !o.ok));

        let missing = issuer("/nonexistent/certbot", &webroot).issue(&hosts[..1]).await;
        assert!(!missing[0].ok);
        assert!(missing[0].message.contains("failed to run"));
    }

    #[tokio::test]
    async fn test_hung_client_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut hung = issuer("sh -c 'sleep 30'", &dir.path().join("webroot"));
        hung.timeout = Duration::from_millis(200);

        let outcomes = hung.issue(&["a.example.com".parse().unwrap()]).await;
        assert!(!outcomes[0].ok);
        assert!(outcomes[0].message.contains("timed out"), "message was {}", outcomes[0].message);
    }

    #[test]
    fn test_tail() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 3), "ab");
    }
}
