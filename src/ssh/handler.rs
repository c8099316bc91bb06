//! Client handler for outbound tunnels
//!
//! Implements `russh::client::Handler` for connections the gateway opens to
//! target nodes.

use russh::keys::{HashAlg, PublicKey};
use tracing::debug;

/// Client handler used by the connector
///
/// Target nodes sit inside the protected network and are addressed by the
/// operator, so every server key is accepted. The fingerprint is logged.
#[derive(Debug, Clone)]
pub struct TunnelHandler {
    target: String,
}

impl TunnelHandler {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

impl russh::client::Handler for TunnelHandler {
    type Error = anyhow::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        debug!(
            target = %self.target,
            fingerprint = %server_public_key.fingerprint(HashAlg::Sha256),
            "Accepting target host key"
        );
        Ok(true)
    }
}
