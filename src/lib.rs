//! Mirrorgate - keeps a pool of mirror domains in front of one backend
//!
//! This library provides:
//! - A domain store with a pending/active/blocked lifecycle and an audit log
//! - Hostname normalization for operator input (URLs, IDNA, mixed case)
//! - nginx configuration rendering with validate-then-reload and rollback
//! - Certificate issuance through an external ACME client
//! - A health monitor that retires blocked domains and promotes standbys
//! - Admin alerts via Telegram, webhooks and email

pub mod acme;
pub mod admin;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod hostname;
pub mod monitor;
pub mod notifications;
pub mod reload;
pub mod render;
pub mod sync;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
