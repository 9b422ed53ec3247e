//! Store → render → apply glue

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::acme::LiveCertificates;
use crate::config::Config;
use crate::db::Database;
use crate::reload::{ApplyReport, ProxyReloader};
use crate::render::{RenderSettings, Renderer};

/// Brings the proxy in line with the domain table
#[async_trait]
pub trait ProxySync: Send + Sync {
    async fn sync(&self) -> Result<ApplyReport>;
}

pub struct ConfigSync {
    db: Arc<Database>,
    renderer: Renderer,
    reloader: ProxyReloader,
    // one write-validate-reload cycle at a time
    lock: Mutex<()>,
}

impl ConfigSync {
    pub fn new(db: Arc<Database>, renderer: Renderer, reloader: ProxyReloader) -> Self {
        Self {
            db,
            renderer,
            reloader,
            lock: Mutex::new(()),
        }
    }

    pub fn from_config(db: Arc<Database>, config: &Config) -> Result<Self> {
        let renderer = Renderer::new(
            RenderSettings::from_config(&config.proxy, &config.acme),
            LiveCertificates::new(&config.acme.live_dir),
        );
        let reloader = ProxyReloader::from_config(&config.proxy)?;
        Ok(Self::new(db, renderer, reloader))
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }
}

#[async_trait]
impl ProxySync for ConfigSync {
    async fn sync(&self) -> Result<ApplyReport> {
        let _guard = self.lock.lock().await;

        let domains = self.db.list_domains(None)?;
        debug!(domains = domains.len(), "Rendering proxy configuration");
        let set = self.renderer.render(&domains);

        self.reloader.apply_and_reload(&set).await
    }
}
