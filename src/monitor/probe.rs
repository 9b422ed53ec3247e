//! Reachability probes and response classification

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::error::Error as StdError;
use std::fmt;
use tracing::debug;

use crate::config::MonitorConfig;

/// Only this much of an error page is searched for block phrases
pub const BODY_SCAN_LIMIT: usize = 4000;

/// How one probe turned out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// The site answered with 2xx or 3xx
    Ok,
    /// 451, or an error page that looks like a block page
    MaybeBlocked,
    /// Any other failure
    Fail,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::MaybeBlocked => "maybe_blocked",
            Self::Fail => "fail",
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Ok)
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub classification: Classification,
    /// HTTP status, if a response arrived
    pub status: Option<u16>,
    /// Short machine-readable note (`451`, `pattern`, `connect_timeout`, ...)
    pub note: String,
}

impl ProbeResult {
    pub fn ok(status: u16) -> Self {
        Self {
            classification: Classification::Ok,
            status: Some(status),
            note: String::new(),
        }
    }

    pub fn maybe_blocked(status: u16, note: &str) -> Self {
        Self {
            classification: Classification::MaybeBlocked,
            status: Some(status),
            note: note.to_string(),
        }
    }

    pub fn fail(status: Option<u16>, note: impl Into<String>) -> Self {
        Self {
            classification: Classification::Fail,
            status,
            note: note.into(),
        }
    }

    /// `classification:status:note`, with `none` for a missing status
    pub fn reason(&self) -> String {
        let status = self
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "none".to_string());
        format!("{}:{}:{}", self.classification, status, self.note)
    }
}

/// Classify an HTTP response
///
/// 403 is never treated as a block signal: too many sites use it for
/// ordinary bot protection.
pub fn classify_response(status: u16, body: &str, block_patterns: &[String]) -> ProbeResult {
    if (200..400).contains(&status) {
        return ProbeResult::ok(status);
    }
    if status == 451 {
        return ProbeResult::maybe_blocked(status, "451");
    }
    if status != 403 && matches_block_pattern(body, block_patterns) {
        return ProbeResult::maybe_blocked(status, "pattern");
    }
    ProbeResult::fail(Some(status), "http_error")
}

fn matches_block_pattern(body: &str, block_patterns: &[String]) -> bool {
    let scanned: String = body.chars().take(BODY_SCAN_LIMIT).collect::<String>().to_lowercase();
    block_patterns
        .iter()
        .any(|p| !p.is_empty() && scanned.contains(&p.to_lowercase()))
}

/// Classify a transport-level failure
pub fn classify_error(err: &reqwest::Error) -> ProbeResult {
    if err.is_timeout() {
        return ProbeResult::fail(None, "connect_timeout");
    }
    if looks_like_tls_failure(err) {
        return ProbeResult::fail(None, "ssl_error");
    }
    if err.is_connect() {
        return ProbeResult::fail(None, format!("conn_err:{}", io_error_kind(err).unwrap_or("connect")));
    }
    if err.is_redirect() {
        return ProbeResult::fail(None, "err:redirect");
    }
    if err.is_request() {
        return ProbeResult::fail(None, "conn_err:request");
    }
    ProbeResult::fail(None, "err:other")
}

/// Underlying causes, without the top-level error
///
/// reqwest's own message embeds the request URL, so only its sources are
/// worth matching on.
fn causes<'a>(err: &'a (dyn StdError + 'static)) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(err.source(), |e: &&'a (dyn StdError + 'static)| (*e).source())
}

fn looks_like_tls_failure(err: &reqwest::Error) -> bool {
    causes(err).any(|e| {
        let text = e.to_string().to_lowercase();
        text.contains("certificate") || text.contains("handshake") || text.contains("tls")
    })
}

fn io_error_kind(err: &reqwest::Error) -> Option<&'static str> {
    causes(err).find_map(|e| {
        e.downcast_ref::<std::io::Error>().map(|io| match io.kind() {
            std::io::ErrorKind::ConnectionRefused => "refused",
            std::io::ErrorKind::ConnectionReset => "reset",
            std::io::ErrorKind::ConnectionAborted => "aborted",
            std::io::ErrorKind::NotFound => "dns",
            _ => "io",
        })
    })
}

/// Checks whether a host is reachable
#[async_trait]
pub trait Prober: Send + Sync {
    /// `Err` means the probe could not be attempted at all
    async fn probe(&self, host: &str) -> Result<ProbeResult>;
}

/// Plain HTTP(S) GET probe
pub struct HttpProber {
    client: reqwest::Client,
    scheme: String,
    path: String,
    block_patterns: Vec<String>,
}

impl HttpProber {
    pub fn from_config(config: &MonitorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            scheme: config.probe_scheme.clone(),
            path: config.probe_path.clone(),
            block_patterns: config.block_patterns.clone(),
        })
    }

    pub fn url_for(&self, host: &str) -> String {
        format!("{}://{}{}", self.scheme, host, self.path)
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, host: &str) -> Result<ProbeResult> {
        let url = self.url_for(host);

        let response = match self
            .client
            .get(&url)
            .header("Accept", "text/html,application/xhtml+xml")
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let result = classify_error(&e);
                debug!(host = %host, error = %e, note = %result.note, "Probe failed");
                return Ok(result);
            }
        };

        let status = response.status().as_u16();
        if (200..400).contains(&status) {
            return Ok(ProbeResult::ok(status));
        }

        // An unreadable error body is just an error page without phrases
        let body = match response.bytes().await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                debug!(host = %host, error = %e, "Failed to read error body");
                String::new()
            }
        };

        Ok(classify_response(status, &body, &self.block_patterns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns() -> Vec<String> {
        MonitorConfig::default().block_patterns
    }

    #[test]
    fn test_success_statuses() {
        for status in [200, 204, 301, 302, 399] {
            assert_eq!(classify_response(status, "", &patterns()).classification, Classification::Ok);
        }
    }

    #[test]
    fn test_451_is_maybe_blocked() {
        let result = classify_response(451, "", &patterns());
        assert_eq!(result.classification, Classification::MaybeBlocked);
        assert_eq!(result.note, "451");
        assert_eq!(result.reason(), "maybe_blocked:451:451");
    }

    #[test]
    fn test_block_page_pattern() {
        let body = "<html><h1>Доступ ограничен</h1> по решению РКН</html>";
        let result = classify_response(502, body, &patterns());
        assert_eq!(result.classification, Classification::MaybeBlocked);
        assert_eq!(result.note, "pattern");

        let english = classify_response(404, "This Site Is Blocked by your provider", &patterns());
        assert_eq!(english.classification, Classification::MaybeBlocked);
    }

    #[test]
    fn test_403_is_never_a_block_signal() {
        let result = classify_response(403, "site blocked", &patterns());
        assert_eq!(result.classification, Classification::Fail);
        assert_eq!(result.note, "http_error");
        assert!(result.reason().starts_with("fail:403"));
    }

    #[test]
    fn test_plain_error_status() {
        let result = classify_response(500, "Internal Server Error", &patterns());
        assert_eq!(result, ProbeResult::fail(Some(500), "http_error"));
    }

    #[test]
    fn test_pattern_beyond_scan_limit_is_ignored() {
        let body = format!("{}site blocked", "x".repeat(BODY_SCAN_LIMIT));
        assert_eq!(
            classify_response(502, &body, &patterns()).classification,
            Classification::Fail
        );
    }

    #[test]
    fn test_reason_without_status() {
        assert_eq!(
            ProbeResult::fail(None, "connect_timeout").reason(),
            "fail:none:connect_timeout"
        );
    }

    #[test]
    fn test_probe_url() {
        let prober = HttpProber::from_config(&MonitorConfig::default()).unwrap();
        assert_eq!(prober.url_for("a.example.com"), "https://a.example.com/");
    }

    #[tokio::test]
    async fn test_connection_refused_is_fail() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let prober = HttpProber::from_config(&MonitorConfig {
            probe_scheme: "http".to_string(),
            http_timeout_secs: 2,
            ..MonitorConfig::default()
        })
        .unwrap();

        let result = prober.probe(&format!("127.0.0.1:{}", port)).await.unwrap();
        assert_eq!(result.classification, Classification::Fail);
        assert!(result.note.starts_with("conn_err:"), "note was {}", result.note);
    }

    #[tokio::test]
    async fn test_tls_words_in_url_do_not_look_like_tls_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let prober = HttpProber::from_config(&MonitorConfig {
            probe_scheme: "http".to_string(),
            probe_path: "/tls-handshake/certificate".to_string(),
            http_timeout_secs: 2,
            ..MonitorConfig::default()
        })
        .unwrap();

        let result = prober.probe(&format!("127.0.0.1:{}", port)).await.unwrap();
        assert_eq!(result.classification, Classification::Fail);
        assert_ne!(result.note, "ssl_error");
        assert!(result.note.starts_with("conn_err:"), "note was {}", result.note);
    }
}
