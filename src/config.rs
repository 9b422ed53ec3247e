use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the mirror manager
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Database location
    #[serde(default)]
    pub storage: StorageConfig,

    /// Health monitor and failover tunables
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Reverse proxy (nginx) layout and commands
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Certificate issuance
    #[serde(default)]
    pub acme: AcmeConfig,

    /// Admin notification channels
    #[serde(default)]
    pub notifications: NotificationsConfig,

    /// Daemon process settings
    #[serde(default)]
    pub daemon: DaemonConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// SQLite database path (default: /var/lib/mirrorgate/mirrors.sqlite3)
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("/var/lib/mirrorgate/mirrors.sqlite3")
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    /// Seconds between monitor iterations (default: 60)
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Per-probe HTTP timeout in seconds (default: 8)
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    /// User-Agent sent with every probe
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Newly activated domains are not probed for this long (default: 1200)
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,

    /// Consecutive failures that confirm a block (default: 5)
    #[serde(default = "default_fail_threshold")]
    pub fail_threshold: u32,

    /// A failure arriving more than this long after the previous one starts
    /// a new streak (default: 3600)
    #[serde(default = "default_fail_window")]
    pub fail_window_secs: u64,

    /// Probes in flight at once (default: 8)
    #[serde(default = "default_max_concurrent_probes")]
    pub max_concurrent_probes: usize,

    /// URL scheme used for probes (default: https)
    #[serde(default = "default_probe_scheme")]
    pub probe_scheme: String,

    /// Path requested by probes (default: /)
    #[serde(default = "default_probe_path")]
    pub probe_path: String,

    /// Case-insensitive phrases that mark an error page as a block page
    #[serde(default = "default_block_patterns")]
    pub block_patterns: Vec<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            http_timeout_secs: default_http_timeout(),
            user_agent: default_user_agent(),
            grace_period_secs: default_grace_period(),
            fail_threshold: default_fail_threshold(),
            fail_window_secs: default_fail_window(),
            max_concurrent_probes: default_max_concurrent_probes(),
            probe_scheme: default_probe_scheme(),
            probe_path: default_probe_path(),
            block_patterns: default_block_patterns(),
        }
    }
}

fn default_check_interval() -> u64 {
    60
}

fn default_http_timeout() -> u64 {
    8
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (compatible; MirrorGateMonitor/1.0)".to_string()
}

fn default_grace_period() -> u64 {
    20 * 60
}

fn default_fail_threshold() -> u32 {
    5
}

fn default_fail_window() -> u64 {
    60 * 60
}

fn default_max_concurrent_probes() -> usize {
    8
}

fn default_probe_scheme() -> String {
    "https".to_string()
}

fn default_probe_path() -> String {
    "/".to_string()
}

fn default_block_patterns() -> Vec<String> {
    [
        "роском",
        "roskom",
        "доступ ограничен",
        "доступ к ресурсу ограничен",
        "this site is blocked",
        "site blocked",
        "blocked by",
        "запрещено",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl MonitorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn fail_window(&self) -> Duration {
        Duration::from_secs(self.fail_window_secs)
    }

    fn validate(&self, errors: &mut Vec<String>) {
        if self.check_interval_secs == 0 {
            errors.push("monitor.check_interval_secs must be greater than 0".to_string());
        }
        if self.http_timeout_secs == 0 {
            errors.push("monitor.http_timeout_secs must be greater than 0".to_string());
        }
        if self.fail_threshold == 0 {
            errors.push("monitor.fail_threshold must be at least 1".to_string());
        }
        if self.fail_window_secs == 0 {
            errors.push("monitor.fail_window_secs must be greater than 0".to_string());
        }
        if self.max_concurrent_probes == 0 {
            errors.push("monitor.max_concurrent_probes must be at least 1".to_string());
        }
        if self.probe_scheme != "https" && self.probe_scheme != "http" {
            errors.push(format!(
                "monitor.probe_scheme must be \"http\" or \"https\", got {:?}",
                self.probe_scheme
            ));
        }
        if !self.probe_path.starts_with('/') {
            errors.push(format!("monitor.probe_path must start with '/', got {:?}", self.probe_path));
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Backend every active mirror proxies to (default: http://127.0.0.1:8080)
    #[serde(default = "default_upstream")]
    pub upstream: String,

    /// Directory holding one `<host>.conf` per domain
    #[serde(default = "default_sites_dir")]
    pub sites_dir: PathBuf,

    /// Directory holding `domains_map.conf`
    #[serde(default = "default_aux_dir")]
    pub aux_dir: PathBuf,

    /// Access log path written into every server block
    #[serde(default = "default_access_log")]
    pub access_log: String,

    /// Named nginx log format for the access log
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// TLS options file included in every 443 block
    #[serde(default = "default_ssl_options_include")]
    pub ssl_options_include: String,

    /// proxy_read_timeout for active mirrors in seconds (default: 60)
    #[serde(default = "default_proxy_read_timeout")]
    pub proxy_read_timeout_secs: u64,

    /// Command that validates the configuration (default: nginx -t)
    #[serde(default = "default_test_command")]
    pub test_command: String,

    /// Command that reloads the proxy (default: systemctl reload nginx)
    #[serde(default = "default_reload_command")]
    pub reload_command: String,

    /// Test and reload commands are killed after this many seconds (default: 60)
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream: default_upstream(),
            sites_dir: default_sites_dir(),
            aux_dir: default_aux_dir(),
            access_log: default_access_log(),
            log_format: default_log_format(),
            ssl_options_include: default_ssl_options_include(),
            proxy_read_timeout_secs: default_proxy_read_timeout(),
            test_command: default_test_command(),
            reload_command: default_reload_command(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

fn default_upstream() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_sites_dir() -> PathBuf {
    PathBuf::from("/etc/nginx/sites-mirrorgate.d")
}

fn default_aux_dir() -> PathBuf {
    PathBuf::from("/etc/nginx/mirrorgate")
}

fn default_access_log() -> String {
    "/var/log/nginx/mirrorgate_access.log".to_string()
}

fn default_log_format() -> String {
    "json_mirrorgate_v1".to_string()
}

fn default_ssl_options_include() -> String {
    "/etc/letsencrypt/options-ssl-nginx.conf".to_string()
}

fn default_proxy_read_timeout() -> u64 {
    60
}

fn default_test_command() -> String {
    "nginx -t".to_string()
}

fn default_reload_command() -> String {
    "systemctl reload nginx".to_string()
}

fn default_command_timeout() -> u64 {
    60
}

impl ProxyConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    fn validate(&self, errors: &mut Vec<String>) {
        if self.command_timeout_secs == 0 {
            errors.push("proxy.command_timeout_secs must be greater than 0".to_string());
        }
        if !(self.upstream.starts_with("http://") || self.upstream.starts_with("https://")) {
            errors.push(format!("proxy.upstream must be an http(s) URL, got {:?}", self.upstream));
        }
        if self.sites_dir == self.aux_dir {
            errors.push("proxy.sites_dir and proxy.aux_dir must differ".to_string());
        }
        for (name, command) in [("test_command", &self.test_command), ("reload_command", &self.reload_command)] {
            match shell_words::split(command) {
                Ok(words) if words.is_empty() => errors.push(format!("proxy.{} is empty", name)),
                Ok(_) => {}
                Err(e) => errors.push(format!("proxy.{} cannot be parsed: {}", name, e)),
            }
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AcmeConfig {
    /// Issuance tool (default: certbot)
    #[serde(default = "default_certbot_command")]
    pub command: String,

    /// Contact email; when unset `admin@<host>` is used
    pub email: Option<String>,

    /// Use the staging CA
    #[serde(default)]
    pub staging: bool,

    /// Webroot served for HTTP-01 challenges
    #[serde(default = "default_webroot")]
    pub webroot: PathBuf,

    /// Directory containing `<host>/fullchain.pem` and `<host>/privkey.pem`
    #[serde(default = "default_live_dir")]
    pub live_dir: PathBuf,

    /// Existing certificates with fewer days left are not reused (default: 7)
    #[serde(default = "default_min_valid_days")]
    pub min_valid_days: i64,

    /// One issuance run is killed after this many seconds (default: 300)
    #[serde(default = "default_issue_timeout")]
    pub issue_timeout_secs: u64,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            command: default_certbot_command(),
            email: None,
            staging: false,
            webroot: default_webroot(),
            live_dir: default_live_dir(),
            min_valid_days: default_min_valid_days(),
            issue_timeout_secs: default_issue_timeout(),
        }
    }
}

impl AcmeConfig {
    pub fn issue_timeout(&self) -> Duration {
        Duration::from_secs(self.issue_timeout_secs)
    }
}

fn default_certbot_command() -> String {
    "certbot".to_string()
}

fn default_webroot() -> PathBuf {
    PathBuf::from("/var/www/certbot")
}

fn default_live_dir() -> PathBuf {
    PathBuf::from("/etc/letsencrypt/live")
}

fn default_min_valid_days() -> i64 {
    7
}

fn default_issue_timeout() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct NotificationsConfig {
    pub telegram: Option<TelegramConfig>,
    pub webhook: Option<WebhookConfig>,
    pub email: Option<EmailConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Every admin chat that receives alerts
    #[serde(default)]
    pub chat_ids: Vec<i64>,
    /// Bot API base URL (default: https://api.telegram.org)
    #[serde(default = "default_telegram_api")]
    pub api_base: String,
}

fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    pub url: String,
    /// HMAC-SHA256 key for the X-Signature-256 header
    pub secret: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmailConfig {
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub smtp_user: Option<String>,
    pub smtp_password: Option<String>,
    pub from: String,
    pub to: Vec<String>,
    #[serde(default = "default_true")]
    pub starttls: bool,
}

fn default_smtp_port() -> u16 {
    587
}

fn default_true() -> bool {
    true
}

impl NotificationsConfig {
    fn validate(&self, errors: &mut Vec<String>) {
        if let Some(telegram) = &self.telegram {
            if telegram.bot_token.is_empty() {
                errors.push("notifications.telegram.bot_token is empty".to_string());
            }
            if telegram.chat_ids.is_empty() {
                errors.push("notifications.telegram.chat_ids is empty".to_string());
            }
        }
        if let Some(webhook) = &self.webhook {
            if !(webhook.url.starts_with("http://") || webhook.url.starts_with("https://")) {
                errors.push(format!("notifications.webhook.url must be an http(s) URL, got {:?}", webhook.url));
            }
        }
        if let Some(email) = &self.email {
            if email.to.is_empty() {
                errors.push("notifications.email.to is empty".to_string());
            }
            if email.smtp_user.is_some() != email.smtp_password.is_some() {
                errors.push("notifications.email needs both smtp_user and smtp_password".to_string());
            }
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DaemonConfig {
    /// Path to PID file (optional)
    pub pid_file: Option<String>,

    /// Regenerate and reload proxy configuration on startup
    #[serde(default)]
    pub sync_on_start: bool,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        self.monitor.validate(&mut errors);
        self.proxy.validate(&mut errors);
        self.notifications.validate(&mut errors);

        if self.acme.command.trim().is_empty() {
            errors.push("acme.command is empty".to_string());
        }
        if self.acme.issue_timeout_secs == 0 {
            errors.push("acme.issue_timeout_secs must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
