//! Host and identity keys

use std::path::Path;

use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::LineEnding;
use russh::keys::{Algorithm, PrivateKey};
use tracing::info;

use crate::error::{GatewayError, Result};

/// Load the host key, generating an Ed25519 key on first start
pub async fn load_or_generate_host_key(path: &Path) -> Result<PrivateKey> {
    if tokio::fs::try_exists(path).await? {
        info!("Loading host key from {}", path.display());
        return load_key(path);
    }

    info!("Generating new Ed25519 host key");
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .map_err(|e| GatewayError::SshKey(format!("Failed to generate host key: {}", e)))?;
    let encoded = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| GatewayError::SshKey(format!("Failed to encode host key: {}", e)))?;
    tokio::fs::write(path, encoded.as_bytes()).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    info!("Saved host key to {}", path.display());
    Ok(key)
}

/// Load the key the gateway presents to target nodes
pub fn load_identity(path: &Path) -> Result<PrivateKey> {
    info!("Loading tunnel identity from {}", path.display());
    load_key(path)
}

fn load_key(path: &Path) -> Result<PrivateKey> {
    russh::keys::load_secret_key(path, None).map_err(|e| {
        GatewayError::SshKey(format!("Failed to load key from {}: {}", path.display(), e))
    })
}
