//! Admin notifications for failover events
//!
//! Supports multiple notification channels:
//! - Telegram Bot API (every configured admin chat)
//! - Webhooks (HTTP POST, optionally HMAC-signed)
//! - Email (SMTP)
//!
//! Every alert is also written to the log. Delivery failures are logged and
//! never propagate into the monitor loop.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::config::{EmailConfig, NotificationsConfig, TelegramConfig, WebhookConfig};
use crate::error::SyncFailure;
use crate::reload::ApplyReport;

/// Outcome of the proxy sync that followed a promotion
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SyncOutcome {
    Applied { summary: String },
    Failed { failure: SyncFailure },
    /// Sync could not run at all (database or filesystem error)
    Error { message: String },
}

impl SyncOutcome {
    pub fn from_result(result: &Result<ApplyReport>) -> Self {
        match result {
            Ok(report) => match report.failure() {
                None => SyncOutcome::Applied {
                    summary: report.to_string(),
                },
                Some(failure) => SyncOutcome::Failed { failure },
            },
            Err(e) => SyncOutcome::Error {
                message: format!("{:#}", e),
            },
        }
    }
}

/// What the monitor did after confirming a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailoverAction {
    Replaced { replacement: String, sync: SyncOutcome },
    /// No pending domain with a certificate was left
    NoReplacement,
}

/// One consolidated alert per confirmed block
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdminAlert {
    pub host: String,
    /// `classification:status:note`
    pub reason: String,
    pub action: FailoverAction,
    pub at: DateTime<Utc>,
}

impl AdminAlert {
    pub fn subject(&self) -> String {
        format!("Mirror blocked: {}", self.host)
    }

    /// Plain-text body shared by every channel
    pub fn text(&self) -> String {
        let mut text = format!(
            "{}\nReason: {}\nAt: {}\n",
            self.subject(),
            self.reason,
            self.at.format("%Y-%m-%d %H:%M:%S UTC")
        );

        match &self.action {
            FailoverAction::Replaced { replacement, sync } => {
                text.push_str(&format!("Action: replaced with {}\n", replacement));
                match sync {
                    SyncOutcome::Applied { .. } => text.push_str("Proxy sync: OK\n"),
                    SyncOutcome::Failed { failure } => {
                        text.push_str(&format!("Proxy sync: {}\n", failure.as_str()));
                        if failure.needs_manual_intervention() {
                            text.push_str("Manual intervention required.\n");
                        }
                        text.push_str(&format!("{}\n", failure));
                    }
                    SyncOutcome::Error { message } => {
                        text.push_str(&format!("Proxy sync: ERROR\n{}\n", message));
                    }
                }
            }
            FailoverAction::NoReplacement => {
                text.push_str("Action: no replacement available, add and certify new domains\n");
            }
        }

        text
    }
}

/// A destination for admin alerts
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn notify(&self, alert: &AdminAlert) -> Result<()>;
}

/// Writes alerts to the log
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn notify(&self, alert: &AdminAlert) -> Result<()> {
        let replacement = match &alert.action {
            FailoverAction::Replaced { replacement, .. } => replacement.as_str(),
            FailoverAction::NoReplacement => "none",
        };
        warn!(
            host = %alert.host,
            reason = %alert.reason,
            replacement = %replacement,
            "Mirror blocked"
        );
        Ok(())
    }
}

/// Telegram Bot API `sendMessage` to every admin chat
pub struct TelegramNotifier {
    http_client: reqwest::Client,
    settings: TelegramConfig,
}

impl TelegramNotifier {
    pub fn new(http_client: reqwest::Client, settings: TelegramConfig) -> Self {
        Self {
            http_client,
            settings,
        }
    }

    fn send_message_url(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.settings.api_base.trim_end_matches('/'),
            self.settings.bot_token
        )
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn notify(&self, alert: &AdminAlert) -> Result<()> {
        let url = self.send_message_url();
        let text = alert.text();
        let mut failures = Vec::new();

        for chat_id in &self.settings.chat_ids {
            let body = serde_json::json!({
                "chat_id": chat_id,
                "text": text,
                "disable_web_page_preview": true,
            });

            let result = self.http_client.post(&url).json(&body).send().await;
            match result {
                Ok(response) if response.status().is_success() => {
                    debug!(chat_id, "Telegram alert sent");
                }
                Ok(response) => failures.push(format!("chat {}: HTTP {}", chat_id, response.status())),
                Err(e) => failures.push(format!("chat {}: {}", chat_id, e)),
            }
        }

        if !failures.is_empty() {
            return Err(anyhow!("Telegram delivery failed: {}", failures.join("; ")));
        }
        Ok(())
    }
}

/// JSON POST, signed with `X-Signature-256` when a secret is set
pub struct WebhookNotifier {
    http_client: reqwest::Client,
    settings: WebhookConfig,
}

impl WebhookNotifier {
    pub fn new(http_client: reqwest::Client, settings: WebhookConfig) -> Self {
        Self {
            http_client,
            settings,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn notify(&self, alert: &AdminAlert) -> Result<()> {
        let body = serde_json::to_string(&serde_json::json!({
            "event": "domain_blocked",
            "alert": alert,
        }))?;

        let mut request = self.http_client.post(&self.settings.url);

        if let Some(secret) = &self.settings.secret {
            let signature = compute_hmac_signature(secret, &body);
            request = request.header("X-Signature-256", format!("sha256={}", signature));
        }

        let response = request
            .header("Content-Type", "application/json")
            .header("User-Agent", "MirrorGate-Notifications/1.0")
            .body(body)
            .send()
            .await
            .map_err(|e| anyhow!("Webhook request failed: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Webhook returned error: {} - {}", status, body));
        }

        debug!(url = %self.settings.url, "Webhook notification sent");
        Ok(())
    }
}

/// SMTP email to every configured recipient
pub struct EmailNotifier {
    settings: EmailConfig,
}

impl EmailNotifier {
    pub fn new(settings: EmailConfig) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn notify(&self, alert: &AdminAlert) -> Result<()> {
        use lettre::{
            message::{header::ContentType, Mailbox},
            transport::smtp::authentication::Credentials,
            AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
        };

        let settings = &self.settings;
        let from: Mailbox = settings.from.parse()
            .map_err(|e| anyhow!("Invalid from address: {}", e))?;

        let mut transport_builder = if settings.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.smtp_host)
                .map_err(|e| anyhow!("Failed to create SMTP transport: {}", e))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.smtp_host)
        };

        transport_builder = transport_builder.port(settings.smtp_port);

        if let (Some(username), Some(password)) = (&settings.smtp_user, &settings.smtp_password) {
            transport_builder = transport_builder.credentials(Credentials::new(
                username.clone(),
                password.clone(),
            ));
        }

        let transport = transport_builder.build();

        for to_addr in &settings.to {
            let to: Mailbox = to_addr.parse()
                .map_err(|e| anyhow!("Invalid to address {}: {}", to_addr, e))?;

            let email = Message::builder()
                .from(from.clone())
                .to(to)
                .subject(alert.subject())
                .header(ContentType::TEXT_PLAIN)
                .body(alert.text())
                .map_err(|e| anyhow!("Failed to build email: {}", e))?;

            transport.send(email).await
                .map_err(|e| anyhow!("Failed to send email to {}: {}", to_addr, e))?;

            debug!(to = %to_addr, "Email sent successfully");
        }

        Ok(())
    }
}

/// Fans one alert out to every configured channel
pub struct NotifierHub {
    sinks: Vec<Box<dyn Notifier>>,
}

impl NotifierHub {
    pub fn new(sinks: Vec<Box<dyn Notifier>>) -> Self {
        Self { sinks }
    }

    /// Log sink plus whatever channels the config enables
    pub fn from_config(config: &NotificationsConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        let mut sinks: Vec<Box<dyn Notifier>> = vec![Box::new(LogNotifier)];
        if let Some(telegram) = &config.telegram {
            sinks.push(Box::new(TelegramNotifier::new(http_client.clone(), telegram.clone())));
        }
        if let Some(webhook) = &config.webhook {
            sinks.push(Box::new(WebhookNotifier::new(http_client.clone(), webhook.clone())));
        }
        if let Some(email) = &config.email {
            sinks.push(Box::new(EmailNotifier::new(email.clone())));
        }

        Ok(Self::new(sinks))
    }

    pub fn channel_names(&self) -> Vec<&'static str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }
}

#[async_trait]
impl Notifier for NotifierHub {
    fn name(&self) -> &'static str {
        "hub"
    }

    /// Never fails; each channel's failure is logged on its own
    async fn notify(&self, alert: &AdminAlert) -> Result<()> {
        for sink in &self.sinks {
            if let Err(e) = sink.notify(alert).await {
                error!(channel = sink.name(), host = %alert.host, error = %e, "Failed to send notification");
            }
        }
        Ok(())
    }
}

/// Hex HMAC-SHA256 of the request body
pub fn compute_hmac_signature(secret: &str, body: &str) -> String {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn alert(action: FailoverAction) -> AdminAlert {
        AdminAlert {
            host: "a.example.com".to_string(),
            reason: "fail:none:connect_timeout".to_string(),
            action,
            at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    struct Recording(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl Notifier for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn notify(&self, alert: &AdminAlert) -> Result<()> {
            self.0.lock().push(alert.host.clone());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Notifier for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn notify(&self, _alert: &AdminAlert) -> Result<()> {
            Err(anyhow!("channel down"))
        }
    }

    #[test]
    fn test_alert_text_replaced() {
        let text = alert(FailoverAction::Replaced {
            replacement: "b.example.com".to_string(),
            sync: SyncOutcome::Applied {
                summary: "generated: 2 files, domains_map: 2".to_string(),
            },
        })
        .text();

        assert!(text.starts_with("Mirror blocked: a.example.com\n"));
        assert!(text.contains("Reason: fail:none:connect_timeout"));
        assert!(text.contains("Action: replaced with b.example.com"));
        assert!(text.contains("Proxy sync: OK"));
        assert!(text.contains("2024-05-01 12:00:00 UTC"));
    }

    #[test]
    fn test_alert_text_reload_failure() {
        let text = alert(FailoverAction::Replaced {
            replacement: "b.example.com".to_string(),
            sync: SyncOutcome::Failed {
                failure: SyncFailure::Reload {
                    output: "nginx.service is not active".to_string(),
                },
            },
        })
        .text();

        assert!(text.contains("Proxy sync: RELOAD_FAILED"));
        assert!(text.contains("Manual intervention required."));
        assert!(text.contains("nginx.service is not active"));
    }

    #[test]
    fn test_alert_text_no_replacement() {
        let text = alert(FailoverAction::NoReplacement).text();
        assert!(text.contains("no replacement available"));
    }

    #[test]
    fn test_alert_serialization() {
        let json = serde_json::to_value(alert(FailoverAction::NoReplacement)).unwrap();
        assert_eq!(json["host"], "a.example.com");
        assert_eq!(json["action"]["kind"], "no_replacement");
    }

    #[test]
    fn test_hmac_signature() {
        // RFC 4231 test case 2
        assert_eq!(
            compute_hmac_signature("Jefe", "what do ya want for nothing?"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_telegram_url() {
        let notifier = TelegramNotifier::new(
            reqwest::Client::new(),
            TelegramConfig {
                bot_token: "123:abc".to_string(),
                chat_ids: vec![1],
                api_base: "https://api.telegram.org/".to_string(),
            },
        );
        assert_eq!(notifier.send_message_url(), "https://api.telegram.org/bot123:abc/sendMessage");
    }

    #[tokio::test]
    async fn test_hub_isolates_channel_failures() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hub = NotifierHub::new(vec![
            Box::new(Failing),
            Box::new(Recording(seen.clone())),
        ]);

        hub.notify(&alert(FailoverAction::NoReplacement)).await.unwrap();
        assert_eq!(*seen.lock(), vec!["a.example.com".to_string()]);
        assert_eq!(hub.channel_names(), vec!["failing", "recording"]);
    }

    #[test]
    fn test_hub_from_config() {
        let hub = NotifierHub::from_config(&NotificationsConfig::default()).unwrap();
        assert_eq!(hub.channel_names(), vec!["log"]);
    }
}
