//! Inbound authentication
//!
//! Every strategy implements [`Authenticator`] and answers with an
//! [`AuthDecision`]; failures never escape as errors. [`build_authenticator`]
//! picks the strategy for the configured mode and wraps it in the audit
//! decorator.

pub mod audited;
pub mod directory;
pub mod escape;
pub mod kerberos;
pub mod realm;

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;
use tracing::info;

use crate::audit::AuditService;
use crate::config::{AuthMode, Config, KERBEROS_UNAVAILABLE};
use crate::error::{GatewayError, Result};

pub use audited::AuditedAuthenticator;
pub use directory::{DirectoryAuthenticator, DirectoryAuthorizer, LdapConnector};
pub use escape::escape_filter_value;
pub use kerberos::{GssNegotiator, GssStatus, KerberosAuthenticator};
pub use realm::{RealmAuthenticator, RealmError, SecurityRealm, StaticRealm};

/// What the client presented
pub enum Credential {
    Password(SecretString),
    GssToken(Vec<u8>),
}

pub struct AuthRequest {
    pub username: String,
    pub credential: Credential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Accept,
    Reject,
    /// Negotiation needs another round trip
    Pending,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    fn name(&self) -> &'static str;

    async fn authenticate(&self, request: AuthRequest) -> AuthDecision;
}

/// Authenticator for the configured mode
///
/// Kerberos needs a GSS negotiator, which has to be supplied through
/// [`build_authenticator_with`].
pub fn build_authenticator(config: &Config, audit: Arc<AuditService>) -> Result<Arc<dyn Authenticator>> {
    build_authenticator_with(config, audit, None)
}

pub fn build_authenticator_with(
    config: &Config,
    audit: Arc<AuditService>,
    negotiator: Option<Box<dyn GssNegotiator>>,
) -> Result<Arc<dyn Authenticator>> {
    let strategy: Arc<dyn Authenticator> = match config.auth_mode {
        AuthMode::Ldap => Arc::new(DirectoryAuthenticator::ldap(
            &config.directory,
            config.connect_timeout,
        )),
        AuthMode::Realm => {
            let path = config
                .realm_users
                .as_deref()
                .ok_or_else(|| GatewayError::config("realm mode requires a users file"))?;
            Arc::new(RealmAuthenticator::new(StaticRealm::load(path)?))
        }
        AuthMode::Kerberos => {
            let negotiator = negotiator.ok_or_else(|| GatewayError::config(KERBEROS_UNAVAILABLE))?;
            let mut auth = KerberosAuthenticator::from_boxed(negotiator);
            if let Some(kerberos) = &config.kerberos {
                auth = auth.with_service(kerberos);
            }
            Arc::new(auth)
        }
    };

    info!(
        strategy = strategy.name(),
        audited = config.audit_authentication,
        "Authenticator configured"
    );
    if config.audit_authentication {
        Ok(Arc::new(AuditedAuthenticator::new(strategy, audit)))
    } else {
        Ok(strategy)
    }
}
