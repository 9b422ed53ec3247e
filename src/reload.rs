//! Write rendered configuration, validate it and reload the proxy
//!
//! The files under `sites_dir` (`*.conf`) and `aux_dir/domains_map.conf` are
//! owned by this module. A sync replaces them wholesale. If the proxy rejects
//! the new set, the previous files are put back so the disk keeps matching
//! what the running proxy serves.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;
use crate::error::SyncFailure;
use crate::render::RenderedSet;

const DOMAIN_MAP_FILE: &str = "domains_map.conf";
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 60;

/// Result of running one external command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutcome {
    pub success: bool,
    /// Combined stdout and stderr, trimmed
    pub output: String,
}

/// What one `apply_and_reload` did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub files_written: usize,
    pub hosts_in_map: usize,
    /// Stale per-domain files removed
    pub files_removed: usize,
    pub validation: CommandOutcome,
    /// `None` when validation failed and reload was skipped
    pub reload: Option<CommandOutcome>,
    /// The previous files were restored after a failed validation
    pub rolled_back: bool,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool {
        self.failure().is_none()
    }

    pub fn failure(&self) -> Option<SyncFailure> {
        if !self.validation.success {
            return Some(SyncFailure::ConfigValidation {
                output: self.validation.output.clone(),
            });
        }
        match &self.reload {
            Some(reload) if !reload.success => Some(SyncFailure::Reload {
                output: reload.output.clone(),
            }),
            _ => None,
        }
    }
}

impl fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "generated: {} files, domains_map: {}",
            self.files_written, self.hosts_in_map
        )?;
        match self.failure() {
            Some(SyncFailure::ConfigValidation { output }) => {
                write!(f, "\nconfig test FAILED (previous config restored):\n{}", output)
            }
            Some(SyncFailure::Reload { output }) => write!(f, "\nproxy reload FAILED:\n{}", output),
            None => write!(f, "\nproxy reload: OK"),
        }
    }
}

/// Owns the managed config files and the test/reload commands
#[derive(Debug, Clone)]
pub struct ProxyReloader {
    sites_dir: PathBuf,
    aux_dir: PathBuf,
    test_command: Vec<String>,
    reload_command: Vec<String>,
    command_timeout: Duration,
}

impl ProxyReloader {
    pub fn new(
        sites_dir: impl Into<PathBuf>,
        aux_dir: impl Into<PathBuf>,
        test_command: &str,
        reload_command: &str,
    ) -> Result<Self> {
        Ok(Self {
            sites_dir: sites_dir.into(),
            aux_dir: aux_dir.into(),
            test_command: parse_command(test_command)?,
            reload_command: parse_command(reload_command)?,
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
        })
    }

    /// Give up on the test or reload command after `timeout`
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        Ok(Self::new(
            &config.sites_dir,
            &config.aux_dir,
            &config.test_command,
            &config.reload_command,
        )?
        .with_command_timeout(config.command_timeout()))
    }

    pub fn site_path(&self, host: &str) -> PathBuf {
        self.sites_dir.join(format!("{}.conf", host))
    }

    pub fn domain_map_path(&self) -> PathBuf {
        self.aux_dir.join(DOMAIN_MAP_FILE)
    }

    /// Replace the managed files, validate, and reload only if valid
    pub async fn apply_and_reload(&self, set: &RenderedSet) -> Result<ApplyReport> {
        std::fs::create_dir_all(&self.sites_dir)
            .with_context(|| format!("Failed to create {}", self.sites_dir.display()))?;
        std::fs::create_dir_all(&self.aux_dir)
            .with_context(|| format!("Failed to create {}", self.aux_dir.display()))?;

        let snapshot = self.snapshot()?;

        let (files_written, files_removed) = match self.write_set(set) {
            Ok(counts) => counts,
            Err(e) => {
                error!(error = %e, "Failed to write proxy configuration");
                if let Err(restore_err) = self.restore(&snapshot) {
                    error!(error = %restore_err, "Failed to restore previous proxy configuration");
                } else {
                    warn!("Previous proxy configuration restored");
                }
                return Err(e);
            }
        };

        let validation = run_command(&self.test_command, self.command_timeout).await;
        if !validation.success {
            error!(output = %validation.output, "Proxy rejected generated configuration");
            self.restore(&snapshot)?;
            warn!("Previous proxy configuration restored");
            return Ok(ApplyReport {
                files_written,
                hosts_in_map: set.hosts_in_map(),
                files_removed,
                validation,
                reload: None,
                rolled_back: true,
            });
        }

        let reload = run_command(&self.reload_command, self.command_timeout).await;
        if reload.success {
            info!(
                files = files_written,
                hosts_in_map = set.hosts_in_map(),
                removed = files_removed,
                "Proxy configuration applied"
            );
        } else {
            error!(output = %reload.output, "Proxy reload failed");
        }

        Ok(ApplyReport {
            files_written,
            hosts_in_map: set.hosts_in_map(),
            files_removed,
            validation,
            reload: Some(reload),
            rolled_back: false,
        })
    }

    /// Write every rendered file and prune stale ones; returns (written, removed)
    fn write_set(&self, set: &RenderedSet) -> Result<(usize, usize)> {
        let mut files_written = 0;
        for site in &set.sites {
            write_atomic(&self.site_path(&site.host), site.contents.as_bytes())?;
            files_written += 1;
        }
        write_atomic(&self.domain_map_path(), set.domain_map.as_bytes())?;

        let keep: HashSet<PathBuf> = set.sites.iter().map(|s| self.site_path(&s.host)).collect();
        let mut files_removed = 0;
        for path in self.managed_site_files()? {
            if !keep.contains(&path) {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
                debug!(path = %path.display(), "Removed stale site config");
                files_removed += 1;
            }
        }
        Ok((files_written, files_removed))
    }

    fn managed_site_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let entries = std::fs::read_dir(&self.sites_dir)
            .with_context(|| format!("Failed to read {}", self.sites_dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && path.extension().map_or(false, |ext| ext == "conf") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn snapshot(&self) -> Result<Snapshot> {
        let mut sites = Vec::new();
        for path in self.managed_site_files()? {
            let contents = std::fs::read(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            sites.push((path, contents));
        }

        let map_path = self.domain_map_path();
        let domain_map = if map_path.exists() {
            Some(std::fs::read(&map_path).with_context(|| format!("Failed to read {}", map_path.display()))?)
        } else {
            None
        };

        Ok(Snapshot { sites, domain_map })
    }

    fn restore(&self, snapshot: &Snapshot) -> Result<()> {
        let previous: HashSet<&PathBuf> = snapshot.sites.iter().map(|(p, _)| p).collect();
        for path in self.managed_site_files()? {
            if !previous.contains(&path) {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
        }
        for (path, contents) in &snapshot.sites {
            write_atomic(path, contents)?;
        }

        let map_path = self.domain_map_path();
        match &snapshot.domain_map {
            Some(contents) => write_atomic(&map_path, contents)?,
            None => {
                if map_path.exists() {
                    std::fs::remove_file(&map_path)
                        .with_context(|| format!("Failed to remove {}", map_path.display()))?;
                }
            }
        }
        Ok(())
    }
}

/// Managed files as they were before a sync
struct Snapshot {
    sites: Vec<(PathBuf, Vec<u8>)>,
    domain_map: Option<Vec<u8>>,
}

fn parse_command(command: &str) -> Result<Vec<String>> {
    let words = shell_words::split(command)
        .with_context(|| format!("Invalid command line {:?}", command))?;
    if words.is_empty() {
        anyhow::bail!("Empty command line");
    }
    Ok(words)
}

/// Write through a temp file in the same directory, then rename over
fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(contents)?;
    tmp.flush()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))?;
    }

    tmp.persist(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Run a command to completion; failures are reported, never raised
///
/// A command still running after `timeout` is killed.
async fn run_command(argv: &[String], timeout: Duration) -> CommandOutcome {
    let Some((program, args)) = argv.split_first() else {
        return CommandOutcome {
            success: false,
            output: "empty command".to_string(),
        };
    };

    let output = Command::new(program).args(args).kill_on_drop(true).output();
    match tokio::time::timeout(timeout, output).await {
        Ok(Ok(output)) => {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            CommandOutcome {
                success: output.status.success(),
                output: text.trim().to_string(),
            }
        }
        Ok(Err(e)) => CommandOutcome {
            success: false,
            output: format!("failed to run {}: {}", program, e),
        },
        Err(_) => {
            warn!(program = %program, timeout_secs = timeout.as_secs(), "Command timed out");
            CommandOutcome {
                success: false,
                output: format!("{} timed out after {:?}", program, timeout),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::RenderedSite;

    fn set(hosts: &[&str]) -> RenderedSet {
        RenderedSet {
            sites: hosts
                .iter()
                .map(|h| RenderedSite {
                    host: h.to_string(),
                    contents: format!("server {{ server_name {}; }}\n", h),
                })
                .collect(),
            domain_map: hosts.iter().map(|h| format!("{} 1;\n", h)).collect(),
        }
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("nginx -t").unwrap(), vec!["nginx", "-t"]);
        assert_eq!(
            parse_command("sh -c 'nginx -t 2>&1'").unwrap(),
            vec!["sh", "-c", "nginx -t 2>&1"]
        );
        assert!(parse_command("   ").is_err());
        assert!(parse_command("'unterminated").is_err());
    }

    #[tokio::test]
    async fn test_run_command_captures_output() {
        let ok = run_command(&["sh".into(), "-c".into(), "echo out; echo err >&2".into()], Duration::from_secs(10)).await;
        assert!(ok.success);
        assert!(ok.output.contains("out"));
        assert!(ok.output.contains("err"));

        let missing = run_command(&["/nonexistent/nginx".into()], Duration::from_secs(10)).await;
        assert!(!missing.success);
        assert!(missing.output.starts_with("failed to run"));
    }

    #[tokio::test]
    async fn test_apply_writes_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let reloader = ProxyReloader::new(dir.path().join("sites"), dir.path().join("aux"), "true", "true").unwrap();

        let report = reloader.apply_and_reload(&set(&["a.example.com", "b.example.com"])).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.files_written, 2);
        assert_eq!(report.hosts_in_map, 2);
        assert!(reloader.site_path("a.example.com").exists());

        let report = reloader.apply_and_reload(&set(&["b.example.com"])).await.unwrap();
        assert_eq!(report.files_removed, 1);
        assert!(!reloader.site_path("a.example.com").exists());
        assert_eq!(
            std::fs::read_to_string(reloader.domain_map_path()).unwrap(),
            "b.example.com 1;\n"
        );
        assert_eq!(report.to_string(), "generated: 1 files, domains_map: 1\nproxy reload: OK");
    }

    #[tokio::test]
    async fn test_reload_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let reloader = ProxyReloader::new(dir.path().join("sites"), dir.path().join("aux"), "true", "false").unwrap();

        let report = reloader.apply_and_reload(&set(&["a.example.com"])).await.unwrap();
        assert!(!report.rolled_back);
        let failure = report.failure().unwrap();
        assert!(failure.needs_manual_intervention());
        assert!(reloader.site_path("a.example.com").exists());
    }

    #[tokio::test]
    async fn test_hung_command_times_out() {
        let hung = run_command(&["sleep".into(), "30".into()], Duration::from_millis(200)).await;
        assert!(!hung.success);
        assert!(hung.output.contains("timed out"), "output was {}", hung.output);
    }

    #[tokio::test]
    async fn test_hung_validation_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let sites = dir.path().join("sites");
        let aux = dir.path().join("aux");
        ProxyReloader::new(&sites, &aux, "true", "true")
            .unwrap()
            .apply_and_reload(&set(&["a.example.com"]))
            .await
            .unwrap();

        let reloader = ProxyReloader::new(&sites, &aux, "sleep 30", "true")
            .unwrap()
            .with_command_timeout(Duration::from_millis(200));
        let report = reloader.apply_and_reload(&set(&["b.example.com"])).await.unwrap();

        assert!(report.rolled_back);
        assert!(report.reload.is_none());
        assert!(reloader.site_path("a.example.com").exists());
        assert!(!reloader.site_path("b.example.com").exists());
    }

    #[tokio::test]
    async fn test_write_error_restores_previous_files() {
        let dir = tempfile::tempdir().unwrap();
        let reloader = ProxyReloader::new(dir.path().join("sites"), dir.path().join("aux"), "true", "true").unwrap();
        reloader.apply_and_reload(&set(&["a.example.com"])).await.unwrap();
        let before = std::fs::read_to_string(reloader.site_path("a.example.com")).unwrap();

        // A directory where b's file should go makes its write fail after a's
        std::fs::create_dir(reloader.site_path("b.example.com")).unwrap();
        let mut next = set(&["a.example.com", "b.example.com"]);
        next.sites[0].contents = "server { changed; }\n".to_string();

        assert!(reloader.apply_and_reload(&next).await.is_err());
        assert_eq!(std::fs::read_to_string(reloader.site_path("a.example.com")).unwrap(), before);
        assert_eq!(
            std::fs::read_to_string(reloader.domain_map_path()).unwrap(),
            "a.example.com 1;\n"
        );
    }
}
