//! Kerberos (GSS-API) authentication
//!
//! Token exchange is delegated to a [`GssNegotiator`]. The authenticator only
//! maps the negotiation state onto a decision and checks that the
//! authenticated principal belongs to the login name.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{AuthDecision, AuthRequest, Authenticator, Credential};
use crate::config::KerberosConfig;
use crate::error::Result;

/// State of a GSS security context after consuming a token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GssStatus {
    /// Context established for `principal`
    Complete { principal: String },
    /// The peer must send another token
    ContinueNeeded,
}

/// Accepts GSS tokens against the service keytab
#[async_trait]
pub trait GssNegotiator: Send + Sync {
    async fn accept(&self, username: &str, token: &[u8]) -> Result<GssStatus>;
}

/// Primary component of a principal: `alice` for `alice/admin@EXAMPLE.COM`
pub fn principal_primary(principal: &str) -> &str {
    let end = principal.find(['/', '@']).unwrap_or(principal.len());
    &principal[..end]
}

pub struct KerberosAuthenticator {
    negotiator: Box<dyn GssNegotiator>,
    keytab: Option<PathBuf>,
    principal: Option<String>,
}

impl KerberosAuthenticator {
    pub fn new(negotiator: impl GssNegotiator + 'static) -> Self {
        Self::from_boxed(Box::new(negotiator))
    }

    pub fn from_boxed(negotiator: Box<dyn GssNegotiator>) -> Self {
        Self {
            negotiator,
            keytab: None,
            principal: None,
        }
    }

    /// Record the service identity for diagnostics
    pub fn with_service(mut self, config: &KerberosConfig) -> Self {
        self.keytab = Some(config.keytab.clone());
        self.principal = Some(config.principal.clone());
        self
    }
}

#[async_trait]
impl Authenticator for KerberosAuthenticator {
    fn name(&self) -> &'static str {
        "kerberos"
    }

    async fn authenticate(&self, request: AuthRequest) -> AuthDecision {
        let Credential::GssToken(token) = &request.credential else {
            return AuthDecision::Reject;
        };

        match self.negotiator.accept(&request.username, token).await {
            Ok(GssStatus::Complete { principal }) => {
                if principal_primary(&principal) == request.username {
                    info!(user = %request.username, principal = %principal, "GSS authentication succeeded");
                    AuthDecision::Accept
                } else {
                    warn!(
                        user = %request.username,
                        principal = %principal,
                        "Principal does not match login name"
                    );
                    AuthDecision::Reject
                }
            }
            Ok(GssStatus::ContinueNeeded) => {
                debug!(user = %request.username, "GSS negotiation continues");
                AuthDecision::Pending
            }
            Err(e) => {
                warn!(
                    user = %request.username,
                    service = ?self.principal,
                    keytab = ?self.keytab,
                    "GSS negotiation failed: {}", e
                );
                AuthDecision::Reject
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use secrecy::SecretString;

    use super::*;
    use crate::error::GatewayError;

    /// Replays scripted negotiation results
    struct ScriptedNegotiator {
        script: Mutex<Vec<Result<GssStatus>>>,
    }

    impl ScriptedNegotiator {
        fn new(mut script: Vec<Result<GssStatus>>) -> Self {
            script.reverse();
            Self {
                script: Mutex::new(script),
            }
        }
    }

    #[async_trait]
    impl GssNegotiator for ScriptedNegotiator {
        async fn accept(&self, _username: &str, _token: &[u8]) -> Result<GssStatus> {
            self.script
                .lock()
                .pop()
                .unwrap_or_else(|| Err(GatewayError::auth("script exhausted")))
        }
    }

    fn token_request(user: &str) -> AuthRequest {
        AuthRequest {
            username: user.to_string(),
            credential: Credential::GssToken(vec![0x60, 0x82]),
        }
    }

    fn complete(principal: &str) -> Result<GssStatus> {
        Ok(GssStatus::Complete {
            principal: principal.to_string(),
        })
    }

    #[test]
    fn test_principal_primary() {
        assert_eq!(principal_primary("alice@EXAMPLE.COM"), "alice");
        assert_eq!(principal_primary("alice/admin@EXAMPLE.COM"), "alice");
        assert_eq!(principal_primary("alice"), "alice");
        assert_eq!(principal_primary("@EXAMPLE.COM"), "");
    }

    #[tokio::test]
    async fn test_continue_then_complete() {
        let auth = KerberosAuthenticator::new(ScriptedNegotiator::new(vec![
            Ok(GssStatus::ContinueNeeded),
            complete("alice@EXAMPLE.COM"),
        ]));
        assert_eq!(auth.authenticate(token_request("alice")).await, AuthDecision::Pending);
        assert_eq!(auth.authenticate(token_request("alice")).await, AuthDecision::Accept);
    }

    #[tokio::test]
    async fn test_principal_mismatch_rejected() {
        let auth = KerberosAuthenticator::new(ScriptedNegotiator::new(vec![complete(
            "mallory@EXAMPLE.COM",
        )]));
        assert_eq!(auth.authenticate(token_request("alice")).await, AuthDecision::Reject);
    }

    #[tokio::test]
    async fn test_negotiator_error_rejected() {
        let auth = KerberosAuthenticator::new(ScriptedNegotiator::new(vec![Err(
            GatewayError::auth("defective token"),
        )]));
        assert_eq!(auth.authenticate(token_request("alice")).await, AuthDecision::Reject);
    }

    #[tokio::test]
    async fn test_password_rejected() {
        let auth = KerberosAuthenticator::new(ScriptedNegotiator::new(vec![complete("alice")]));
        let request = AuthRequest {
            username: "alice".to_string(),
            credential: Credential::Password(SecretString::from("secret")),
        };
        assert_eq!(auth.authenticate(request).await, AuthDecision::Reject);
    }
}
