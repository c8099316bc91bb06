//! Realm-based authentication
//!
//! A [`SecurityRealm`] checks a username/password token. Every way a login
//! can fail maps to a rejection; the realm error only changes what is logged.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{info, warn};

use super::{AuthDecision, AuthRequest, Authenticator, Credential};
use crate::error::{GatewayError, Result};

#[derive(Debug, Error)]
pub enum RealmError {
    #[error("unknown account")]
    UnknownAccount,

    #[error("incorrect credentials")]
    IncorrectCredentials,

    #[error("account is locked")]
    LockedAccount,

    #[error("realm failure: {0}")]
    Other(String),
}

/// Username and password presented to a realm, zeroized on drop
pub struct UsernamePasswordToken {
    pub username: String,
    pub password: SecretString,
}

impl std::fmt::Debug for UsernamePasswordToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsernamePasswordToken")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
pub trait SecurityRealm: Send + Sync {
    async fn login(&self, token: &UsernamePasswordToken) -> std::result::Result<(), RealmError>;
}

#[derive(Deserialize)]
struct UsersFile {
    users: Vec<UserRecord>,
}

#[derive(Deserialize)]
struct UserRecord {
    name: String,
    password: String,
    #[serde(default)]
    locked: bool,
}

struct Account {
    password: SecretString,
    locked: bool,
}

/// Realm backed by a JSON users file
///
/// ```json
/// {"users": [{"name": "alice", "password": "secret", "locked": false}]}
/// ```
pub struct StaticRealm {
    accounts: HashMap<String, Account>,
}

impl StaticRealm {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::config(format!("Failed to read realm users {}: {}", path.display(), e))
        })?;
        let realm = Self::from_json(&content).map_err(|e| {
            GatewayError::config(format!("Invalid realm users {}: {}", path.display(), e))
        })?;
        info!(accounts = realm.accounts.len(), "Loaded realm users from {}", path.display());
        Ok(realm)
    }

    pub fn from_json(content: &str) -> std::result::Result<Self, serde_json::Error> {
        let file: UsersFile = serde_json::from_str(content)?;
        let accounts = file
            .users
            .into_iter()
            .map(|u| {
                (
                    u.name,
                    Account {
                        password: SecretString::from(u.password),
                        locked: u.locked,
                    },
                )
            })
            .collect();
        Ok(Self { accounts })
    }
}

#[async_trait]
impl SecurityRealm for StaticRealm {
    async fn login(&self, token: &UsernamePasswordToken) -> std::result::Result<(), RealmError> {
        let account = self
            .accounts
            .get(&token.username)
            .ok_or(RealmError::UnknownAccount)?;

        let matches: bool = account
            .password
            .expose_secret()
            .as_bytes()
            .ct_eq(token.password.expose_secret().as_bytes())
            .into();
        if !matches {
            return Err(RealmError::IncorrectCredentials);
        }
        if account.locked {
            return Err(RealmError::LockedAccount);
        }
        Ok(())
    }
}

/// Authenticator delegating to a [`SecurityRealm`]
pub struct RealmAuthenticator {
    realm: Box<dyn SecurityRealm>,
}

impl RealmAuthenticator {
    pub fn new(realm: impl SecurityRealm + 'static) -> Self {
        Self {
            realm: Box::new(realm),
        }
    }
}

#[async_trait]
impl Authenticator for RealmAuthenticator {
    fn name(&self) -> &'static str {
        "realm"
    }

    async fn authenticate(&self, request: AuthRequest) -> AuthDecision {
        let AuthRequest {
            username,
            credential: Credential::Password(password),
        } = request
        else {
            return AuthDecision::Reject;
        };

        let token = UsernamePasswordToken { username, password };
        let result = self.realm.login(&token).await;
        match result {
            Ok(()) => {
                info!(user = %token.username, "Realm login succeeded");
                AuthDecision::Accept
            }
            Err(RealmError::Other(e)) => {
                warn!(user = %token.username, "Realm login failed: {}", e);
                AuthDecision::Reject
            }
            Err(e) => {
                info!(user = %token.username, "Realm login rejected: {}", e);
                AuthDecision::Reject
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USERS: &str = r#"{
        "users": [
            {"name": "alice", "password": "secret"},
            {"name": "mallory", "password": "hunter2", "locked": true}
        ]
    }"#;

    fn request(user: &str, password: &str) -> AuthRequest {
        AuthRequest {
            username: user.to_string(),
            credential: Credential::Password(SecretString::from(password)),
        }
    }

    fn token(user: &str, password: &str) -> UsernamePasswordToken {
        UsernamePasswordToken {
            username: user.to_string(),
            password: SecretString::from(password),
        }
    }

    struct BrokenRealm;

    #[async_trait]
    impl SecurityRealm for BrokenRealm {
        async fn login(&self, _token: &UsernamePasswordToken) -> std::result::Result<(), RealmError> {
            Err(RealmError::Other("backend down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_static_realm_outcomes() {
        let realm = StaticRealm::from_json(USERS).unwrap();
        assert!(realm.login(&token("alice", "secret")).await.is_ok());
        assert!(matches!(
            realm.login(&token("alice", "wrong")).await,
            Err(RealmError::IncorrectCredentials)
        ));
        assert!(matches!(
            realm.login(&token("bob", "secret")).await,
            Err(RealmError::UnknownAccount)
        ));
        assert!(matches!(
            realm.login(&token("mallory", "hunter2")).await,
            Err(RealmError::LockedAccount)
        ));
    }

    #[tokio::test]
    async fn test_every_failure_rejects() {
        let auth = RealmAuthenticator::new(StaticRealm::from_json(USERS).unwrap());
        assert_eq!(auth.authenticate(request("alice", "secret")).await, AuthDecision::Accept);
        assert_eq!(auth.authenticate(request("alice", "secre")).await, AuthDecision::Reject);
        assert_eq!(auth.authenticate(request("bob", "secret")).await, AuthDecision::Reject);
        assert_eq!(auth.authenticate(request("mallory", "hunter2")).await, AuthDecision::Reject);

        let broken = RealmAuthenticator::new(BrokenRealm);
        assert_eq!(broken.authenticate(request("alice", "secret")).await, AuthDecision::Reject);
    }

    #[tokio::test]
    async fn test_gss_token_rejected() {
        let auth = RealmAuthenticator::new(StaticRealm::from_json(USERS).unwrap());
        let request = AuthRequest {
            username: "alice".to_string(),
            credential: Credential::GssToken(vec![0x60]),
        };
        assert_eq!(auth.authenticate(request).await, AuthDecision::Reject);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        std::fs::write(&path, USERS).unwrap();
        let realm = StaticRealm::load(&path).unwrap();
        assert_eq!(realm.accounts.len(), 2);
        assert!(realm.accounts["mallory"].locked);
    }

    #[test]
    fn test_load_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        std::fs::write(&path, "{\"users\": 3}").unwrap();
        assert!(matches!(StaticRealm::load(&path), Err(GatewayError::Config(_))));
        assert!(matches!(
            StaticRealm::load(&dir.path().join("absent.json")),
            Err(GatewayError::Config(_))
        ));
    }

    #[test]
    fn test_token_debug_redacts_password() {
        let rendered = format!("{:?}", token("alice", "secret"));
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("secret"));
    }
}
