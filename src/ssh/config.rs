//! Outbound tunnel settings
//!
//! Connection parameters the connector uses for every tunnel it opens.

use std::sync::Arc;
use std::time::Duration;

use encoding_rs::Encoding;
use russh::keys::PrivateKey;

use crate::config::Config;

/// Settings shared by all tunnels of a gateway
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    /// Login used on the target nodes
    pub tunnel_user: String,

    /// Gateway identity presented to the target nodes
    pub identity: Arc<PrivateKey>,

    /// Bound on connect + authenticate, and separately on channel setup
    pub connect_timeout: Duration,

    /// Identity switch template, `{0}` is the inbound user
    pub login_command: Option<String>,

    /// Text encoding of audited transcripts
    pub audit_encoding: &'static Encoding,
}

impl TunnelSettings {
    /// Create settings with the default timeout and no identity switch
    pub fn new(tunnel_user: impl Into<String>, identity: Arc<PrivateKey>) -> Self {
        Self {
            tunnel_user: tunnel_user.into(),
            identity,
            connect_timeout: Duration::from_secs(10),
            login_command: None,
            audit_encoding: encoding_rs::UTF_8,
        }
    }

    /// Settings taken from the gateway configuration
    pub fn from_config(config: &Config, identity: Arc<PrivateKey>) -> Self {
        let settings = Self::new(config.tunnel_user.clone(), identity)
            .with_timeout(config.connect_timeout)
            .with_audit_encoding(config.audit_encoding);
        match &config.login_command {
            Some(template) => settings.with_login_command(template.clone()),
            None => settings,
        }
    }

    /// Set the connect/channel timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the identity switch template
    pub fn with_login_command(mut self, template: impl Into<String>) -> Self {
        self.login_command = Some(template.into());
        self
    }

    pub fn with_audit_encoding(mut self, encoding: &'static Encoding) -> Self {
        self.audit_encoding = encoding;
        self
    }

    pub fn timeout_ms(&self) -> u64 {
        u64::try_from(self.connect_timeout.as_millis()).unwrap_or(u64::MAX)
    }
}
