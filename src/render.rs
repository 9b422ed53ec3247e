//! nginx configuration rendering
//!
//! Output depends only on the domain rows passed in and on which hosts have
//! certificate material in the live directory. Rendering the same snapshot
//! twice yields byte-identical text.

use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::acme::LiveCertificates;
use crate::config::{AcmeConfig, ProxyConfig};
use crate::db::{DomainRecord, DomainStatus};

/// Values substituted into every server block
#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub upstream: String,
    pub access_log: String,
    pub log_format: String,
    pub webroot: PathBuf,
    pub ssl_options_include: String,
    pub proxy_read_timeout_secs: u64,
}

impl RenderSettings {
    pub fn from_config(proxy: &ProxyConfig, acme: &AcmeConfig) -> Self {
        Self {
            upstream: proxy.upstream.clone(),
            access_log: proxy.access_log.clone(),
            log_format: proxy.log_format.clone(),
            webroot: acme.webroot.clone(),
            ssl_options_include: proxy.ssl_options_include.clone(),
            proxy_read_timeout_secs: proxy.proxy_read_timeout_secs,
        }
    }
}

/// Configuration for one domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedSite {
    pub host: String,
    pub contents: String,
}

/// Complete artifact set for one sync
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RenderedSet {
    /// One entry per domain, in the order the domains were given
    pub sites: Vec<RenderedSite>,
    /// `domains_map.conf` contents
    pub domain_map: String,
}

impl RenderedSet {
    pub fn hosts_in_map(&self) -> usize {
        self.domain_map.lines().count()
    }
}

#[derive(Debug, Clone)]
pub struct Renderer {
    settings: RenderSettings,
    certs: LiveCertificates,
}

impl Renderer {
    pub fn new(settings: RenderSettings, certs: LiveCertificates) -> Self {
        Self { settings, certs }
    }

    pub fn certificates(&self) -> &LiveCertificates {
        &self.certs
    }

    /// Render every domain plus the aggregate map
    pub fn render(&self, domains: &[DomainRecord]) -> RenderedSet {
        let mut sites = Vec::with_capacity(domains.len());
        let mut map_hosts = BTreeSet::new();

        for domain in domains {
            let host = domain.host.trim();
            if host.is_empty() {
                continue;
            }
            sites.push(RenderedSite {
                host: host.to_string(),
                contents: self.render_domain(host, domain.status, domain.ssl_ready),
            });
            map_hosts.insert(host);
        }

        let mut domain_map = String::new();
        for host in map_hosts {
            domain_map.push_str(host);
            domain_map.push_str(" 1;\n");
        }

        RenderedSet { sites, domain_map }
    }

    /// Port-80 block, plus a port-443 block when the certificate is on disk
    pub fn render_domain(&self, host: &str, status: DomainStatus, ssl_ready: bool) -> String {
        let mut parts = vec![self.http_server(host, ssl_ready)];

        if ssl_ready && self.certs.has_certificate(host) {
            if status == DomainStatus::Active {
                parts.push(self.https_server_active(host));
            } else {
                parts.push(self.https_server_forbidden(host));
            }
        }

        parts.join("\n")
    }

    fn access_log_line(&self) -> String {
        format!(
            "    access_log {} {};\n",
            self.settings.access_log, self.settings.log_format
        )
    }

    fn http_server(&self, host: &str, ssl_ready: bool) -> String {
        let mut out = String::new();
        out.push_str("server {\n");
        out.push_str("    listen 80;\n");
        out.push_str(&format!("    server_name {};\n", host));
        out.push_str(&self.access_log_line());
        out.push_str("    location /.well-known/acme-challenge/ {\n");
        out.push_str(&format!("        root {};\n", self.settings.webroot.display()));
        out.push_str("        try_files $uri =404;\n");
        out.push_str("    }\n");
        if ssl_ready {
            out.push_str("    return 301 https://$host$request_uri;\n");
        } else {
            out.push_str("    location / { return 404; }\n");
        }
        out.push_str("}\n");
        out
    }

    fn tls_preamble(&self, host: &str) -> String {
        let mut out = String::new();
        out.push_str("server {\n");
        out.push_str("    listen 443 ssl http2;\n");
        out.push_str(&format!("    server_name {};\n", host));
        out.push_str(&self.access_log_line());
        out.push_str(&format!(
            "    ssl_certificate {};\n",
            self.certs.fullchain_path(host).display()
        ));
        out.push_str(&format!(
            "    ssl_certificate_key {};\n",
            self.certs.privkey_path(host).display()
        ));
        out.push_str(&format!("    include {};\n", self.settings.ssl_options_include));
        out
    }

    fn https_server_active(&self, host: &str) -> String {
        let mut out = self.tls_preamble(host);
        out.push_str("    ssl_stapling on;\n");
        out.push_str("    ssl_stapling_verify on;\n");
        out.push('\n');
        out.push_str("    location / {\n");
        out.push_str(&format!("        proxy_pass {};\n", self.settings.upstream));
        out.push_str("        proxy_set_header Host $host;\n");
        out.push_str("        proxy_set_header X-Real-IP $remote_addr;\n");
        out.push_str("        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n");
        out.push_str("        proxy_set_header X-Forwarded-Proto $scheme;\n");
        out.push_str("        proxy_buffering off;\n");
        out.push_str(&format!(
            "        proxy_read_timeout {}s;\n",
            self.settings.proxy_read_timeout_secs
        ));
        out.push_str("    }\n");
        out.push_str("}\n");
        out
    }

    fn https_server_forbidden(&self, host: &str) -> String {
        let mut out = self.tls_preamble(host);
        out.push_str("    return 403;\n");
        out.push_str("}\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::Path;

    fn settings() -> RenderSettings {
        RenderSettings {
            upstream: "http://127.0.0.1:8080".to_string(),
            access_log: "/var/log/nginx/mirrors.log".to_string(),
            log_format: "json_mirrors".to_string(),
            webroot: PathBuf::from("/var/www/certbot"),
            ssl_options_include: "/etc/letsencrypt/options-ssl-nginx.conf".to_string(),
            proxy_read_timeout_secs: 60,
        }
    }

    fn domain(id: i64, host: &str, status: DomainStatus, ssl_ready: bool) -> DomainRecord {
        let now = Utc::now();
        DomainRecord {
            id,
            host: host.to_string(),
            status,
            ssl_ready,
            created_at: now,
            updated_at: now,
            activated_at: None,
        }
    }

    fn touch_cert(live: &Path, host: &str) {
        let dir = live.join(host);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("fullchain.pem"), "chain").unwrap();
        std::fs::write(dir.join("privkey.pem"), "key").unwrap();
    }

    #[test]
    fn test_pending_without_ssl() {
        let renderer = Renderer::new(settings(), LiveCertificates::new("/nonexistent"));
        let conf = renderer.render_domain("a.example.com", DomainStatus::Pending, false);

        assert_eq!(
            conf,
            "server {\n\
             \x20   listen 80;\n\
             \x20   server_name a.example.com;\n\
             \x20   access_log /var/log/nginx/mirrors.log json_mirrors;\n\
             \x20   location /.well-known/acme-challenge/ {\n\
             \x20       root /var/www/certbot;\n\
             \x20       try_files $uri =404;\n\
             \x20   }\n\
             \x20   location / { return 404; }\n\
             }\n"
        );
    }

    #[test]
    fn test_active_with_certificate() {
        let dir = tempfile::tempdir().unwrap();
        touch_cert(dir.path(), "a.example.com");
        let renderer = Renderer::new(settings(), LiveCertificates::new(dir.path()));

        let conf = renderer.render_domain("a.example.com", DomainStatus::Active, true);
        assert!(conf.contains("    return 301 https://$host$request_uri;\n"));
        assert!(conf.contains("    listen 443 ssl http2;\n"));
        assert!(conf.contains(&format!(
            "    ssl_certificate {}/a.example.com/fullchain.pem;\n",
            dir.path().display()
        )));
        assert!(conf.contains("    include /etc/letsencrypt/options-ssl-nginx.conf;\n"));
        assert!(conf.contains("    ssl_stapling on;\n"));
        assert!(conf.contains("        proxy_pass http://127.0.0.1:8080;\n"));
        assert!(conf.contains("        proxy_set_header X-Forwarded-Proto $scheme;\n"));
        assert!(conf.contains("        proxy_read_timeout 60s;\n"));
        assert!(!conf.contains("return 403"));
        // 80 block, blank separator, 443 block
        assert_eq!(conf.matches("server {").count(), 2);
        assert!(conf.contains("}\n\nserver {"));
    }

    #[test]
    fn test_pending_and_blocked_with_certificate_return_403() {
        let dir = tempfile::tempdir().unwrap();
        touch_cert(dir.path(), "a.example.com");
        let renderer = Renderer::new(settings(), LiveCertificates::new(dir.path()));

        for status in [DomainStatus::Pending, DomainStatus::Blocked] {
            let conf = renderer.render_domain("a.example.com", status, true);
            assert!(conf.contains("    listen 443 ssl http2;\n"));
            assert!(conf.contains("    return 403;\n"));
            assert!(!conf.contains("proxy_pass"));
            assert!(!conf.contains("ssl_stapling"));
        }
    }

    #[test]
    fn test_ssl_ready_without_files_has_no_tls_block() {
        let renderer = Renderer::new(settings(), LiveCertificates::new("/nonexistent"));
        let conf = renderer.render_domain("a.example.com", DomainStatus::Active, true);

        assert!(conf.contains("return 301"));
        assert!(!conf.contains("listen 443"));
    }

    #[test]
    fn test_domain_map_sorted_and_unique() {
        let renderer = Renderer::new(settings(), LiveCertificates::new("/nonexistent"));
        let set = renderer.render(&[
            domain(1, "zeta.example.com", DomainStatus::Active, true),
            domain(2, "alpha.example.com", DomainStatus::Pending, false),
            domain(3, "mid.example.com", DomainStatus::Blocked, true),
        ]);

        assert_eq!(
            set.domain_map,
            "alpha.example.com 1;\nmid.example.com 1;\nzeta.example.com 1;\n"
        );
        assert_eq!(set.hosts_in_map(), 3);
        let hosts: Vec<_> = set.sites.iter().map(|s| s.host.as_str()).collect();
        assert_eq!(hosts, vec!["zeta.example.com", "alpha.example.com", "mid.example.com"]);
    }

    #[test]
    fn test_empty_domain_set() {
        let renderer = Renderer::new(settings(), LiveCertificates::new("/nonexistent"));
        let set = renderer.render(&[]);
        assert!(set.sites.is_empty());
        assert_eq!(set.domain_map, "");
        assert_eq!(set.hosts_in_map(), 0);
    }

    #[test]
    fn test_render_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        touch_cert(dir.path(), "b.example.com");
        let renderer = Renderer::new(settings(), LiveCertificates::new(dir.path()));
        let domains = vec![
            domain(1, "a.example.com", DomainStatus::Pending, false),
            domain(2, "b.example.com", DomainStatus::Active, true),
        ];

        assert_eq!(renderer.render(&domains), renderer.render(&domains));
    }
}
