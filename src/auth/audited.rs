//! Authentication auditing

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::{AuthDecision, AuthRequest, Authenticator};
use crate::audit::{AuditEvent, AuditService};

/// Records the final decision of the wrapped authenticator
///
/// `Pending` is not a result and is passed through without an event.
pub struct AuditedAuthenticator {
    inner: Arc<dyn Authenticator>,
    audit: Arc<AuditService>,
}

impl AuditedAuthenticator {
    pub fn new(inner: Arc<dyn Authenticator>, audit: Arc<AuditService>) -> Self {
        Self { inner, audit }
    }
}

#[async_trait]
impl Authenticator for AuditedAuthenticator {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn authenticate(&self, request: AuthRequest) -> AuthDecision {
        let username = request.username.clone();
        let decision = self.inner.authenticate(request).await;

        let success = match decision {
            AuthDecision::Accept => true,
            AuthDecision::Reject => false,
            AuthDecision::Pending => return decision,
        };
        if let Err(e) = self
            .audit
            .record_event(AuditEvent::authentication(&username, success))
            .await
        {
            warn!(user = %username, "Authentication result not audited: {}", e);
        }
        decision
    }
}
