//! Directory (LDAP) authorization and bind authentication
//!
//! The transport sits behind [`DirectoryConnector`] / [`DirectoryConnection`]
//! so the authorizer logic can be exercised without a directory server. The
//! production connector is [`LdapConnector`], built on `ldap3`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, Scope};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use super::escape::escape_filter_value;
use super::{AuthDecision, AuthRequest, Authenticator, Credential};
use crate::config::DirectoryConfig;
use crate::error::{GatewayError, Result};

/// Search filter selecting a user that belongs to any configured group
///
/// Renders as `(&(name=user)(|(group=g1)(group=g2)))`, or `(&(name=user))`
/// without groups. The user must already be escaped; groups are escaped here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipFilter<'a> {
    pub name_attribute: &'a str,
    pub group_attribute: &'a str,
    pub groups: &'a [String],
    pub user: &'a str,
}

impl fmt::Display for MembershipFilter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(&({}={})", self.name_attribute, self.user)?;
        if !self.groups.is_empty() {
            f.write_str("(|")?;
            for group in self.groups {
                write!(f, "({}={})", self.group_attribute, escape_filter_value(group))?;
            }
            f.write_str(")")?;
        }
        f.write_str(")")
    }
}

/// An open directory connection
#[async_trait]
pub trait DirectoryConnection: Send {
    async fn bind(&mut self, dn: &str, password: &str) -> Result<()>;

    /// Subtree search under `base`; true if at least one entry matches
    async fn search_exists(&mut self, base: &str, filter: &str) -> Result<bool>;

    /// Unbind and drop the connection
    async fn release(&mut self);
}

/// Opens directory connections
#[async_trait]
pub trait DirectoryConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn DirectoryConnection>>;
}

/// `ldap3` connector trying each URL in order
#[derive(Debug, Clone)]
pub struct LdapConnector {
    urls: Vec<String>,
    timeout: Duration,
}

impl LdapConnector {
    pub fn new(urls: Vec<String>, timeout: Duration) -> Self {
        Self { urls, timeout }
    }
}

#[async_trait]
impl DirectoryConnector for LdapConnector {
    async fn connect(&self) -> Result<Box<dyn DirectoryConnection>> {
        let mut last_error = None;

        for url in &self.urls {
            let settings = LdapConnSettings::new().set_conn_timeout(self.timeout);
            match LdapConnAsync::with_settings(settings, url).await {
                Ok((conn, ldap)) => {
                    let drive_url = url.clone();
                    tokio::spawn(async move {
                        if let Err(e) = conn.drive().await {
                            warn!(url = %drive_url, "Directory connection error: {}", e);
                        }
                    });
                    debug!(url = %url, "Connected to directory");
                    return Ok(Box::new(LdapConnection {
                        ldap,
                        url: url.clone(),
                    }));
                }
                Err(e) => {
                    warn!(url = %url, "Directory unreachable: {}", e);
                    last_error = Some(e.to_string());
                }
            }
        }

        Err(GatewayError::directory(
            last_error.unwrap_or_else(|| "no directory URL configured".to_string()),
        ))
    }
}

struct LdapConnection {
    ldap: Ldap,
    url: String,
}

#[async_trait]
impl DirectoryConnection for LdapConnection {
    async fn bind(&mut self, dn: &str, password: &str) -> Result<()> {
        self.ldap
            .simple_bind(dn, password)
            .await
            .and_then(|result| result.success())
            .map(|_| ())
            .map_err(|e| GatewayError::directory(format!("bind as {} failed: {}", dn, e)))
    }

    async fn search_exists(&mut self, base: &str, filter: &str) -> Result<bool> {
        // "1.1" requests no attributes
        let mut stream = self
            .ldap
            .streaming_search(base, Scope::Subtree, filter, vec!["1.1"])
            .await
            .map_err(|e| GatewayError::directory(format!("search failed: {}", e)))?;

        let mut found = false;
        let mut failure = None;
        loop {
            match stream.next().await {
                Ok(Some(_)) => found = true,
                Ok(None) => break,
                Err(e) => {
                    failure = Some(e.to_string());
                    break;
                }
            }
        }

        let outcome = stream.finish().await;
        if let Some(e) = failure {
            return Err(GatewayError::directory(format!("search failed: {}", e)));
        }
        outcome
            .success()
            .map_err(|e| GatewayError::directory(format!("search failed: {}", e)))?;
        Ok(found)
    }

    async fn release(&mut self) {
        if let Err(e) = self.ldap.unbind().await {
            debug!(url = %self.url, "Unbind failed: {}", e);
        }
    }
}

/// Group/name membership check against the directory
pub struct DirectoryAuthorizer {
    connector: Arc<dyn DirectoryConnector>,
    bind_dn: Option<String>,
    bind_password: Option<SecretString>,
    base_dn: String,
    name_attribute: String,
    group_attribute: String,
    groups: Vec<String>,
}

impl DirectoryAuthorizer {
    pub fn new(connector: Arc<dyn DirectoryConnector>, config: &DirectoryConfig) -> Self {
        Self {
            connector,
            bind_dn: config.bind_dn.clone(),
            bind_password: config
                .bind_password
                .as_ref()
                .map(|p| SecretString::from(p.expose_secret())),
            base_dn: config.base_dn.clone(),
            name_attribute: config.name_attribute.clone(),
            group_attribute: config.group_attribute.clone(),
            groups: config.groups.clone(),
        }
    }

    /// True if the (already escaped) user matches the membership filter.
    /// Every failure means false.
    pub async fn is_authorized(&self, escaped_user: &str) -> bool {
        let mut conn = match self.connector.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(user = %escaped_user, "Authorization lookup failed: {}", e);
                return false;
            }
        };

        let result = self.lookup(conn.as_mut(), escaped_user).await;
        conn.release().await;

        match result {
            Ok(found) => {
                if !found {
                    info!(user = %escaped_user, "User is not a member of an allowed group");
                }
                found
            }
            Err(e) => {
                warn!(user = %escaped_user, "Authorization lookup failed: {}", e);
                false
            }
        }
    }

    async fn lookup(&self, conn: &mut dyn DirectoryConnection, escaped_user: &str) -> Result<bool> {
        if let Some(dn) = &self.bind_dn {
            let password = self
                .bind_password
                .as_ref()
                .map(|p| p.expose_secret())
                .unwrap_or("");
            conn.bind(dn, password).await?;
        }

        let filter = MembershipFilter {
            name_attribute: &self.name_attribute,
            group_attribute: &self.group_attribute,
            groups: &self.groups,
            user: escaped_user,
        }
        .to_string();
        debug!(filter = %filter, base = %self.base_dn, "Searching directory");
        conn.search_exists(&self.base_dn, &filter).await
    }
}

/// Authenticates by binding as the user after a membership check
pub struct DirectoryAuthenticator {
    authorizer: DirectoryAuthorizer,
    connector: Arc<dyn DirectoryConnector>,
    auth_pattern: String,
}

impl DirectoryAuthenticator {
    pub fn new(connector: Arc<dyn DirectoryConnector>, config: &DirectoryConfig) -> Self {
        Self {
            authorizer: DirectoryAuthorizer::new(connector.clone(), config),
            connector,
            auth_pattern: config.auth_pattern.clone(),
        }
    }

    /// Authenticator over `ldap3`
    pub fn ldap(config: &DirectoryConfig, timeout: Duration) -> Self {
        let connector = Arc::new(LdapConnector::new(config.urls.clone(), timeout));
        Self::new(connector, config)
    }

    fn user_dn(&self, escaped_user: &str) -> String {
        self.auth_pattern.replace("{0}", escaped_user)
    }
}

#[async_trait]
impl Authenticator for DirectoryAuthenticator {
    fn name(&self) -> &'static str {
        "ldap"
    }

    async fn authenticate(&self, request: AuthRequest) -> AuthDecision {
        let Credential::Password(password) = &request.credential else {
            return AuthDecision::Reject;
        };
        // An empty simple bind is an anonymous bind
        if password.expose_secret().is_empty() {
            info!(user = %request.username, "Rejecting empty password");
            return AuthDecision::Reject;
        }

        let escaped = escape_filter_value(&request.username);
        if !self.authorizer.is_authorized(&escaped).await {
            return AuthDecision::Reject;
        }

        let dn = self.user_dn(&escaped);
        let mut conn = match self.connector.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(user = %request.username, "Directory bind failed: {}", e);
                return AuthDecision::Reject;
            }
        };
        let result = conn.bind(&dn, password.expose_secret()).await;
        conn.release().await;

        match result {
            Ok(()) => {
                info!(user = %request.username, "Directory bind succeeded");
                AuthDecision::Accept
            }
            Err(e) => {
                info!(user = %request.username, "Directory bind failed: {}", e);
                AuthDecision::Reject
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::*;

    /// In-memory directory recording every call
    #[derive(Default)]
    pub struct FakeDirectory {
        pub reachable: bool,
        /// dn -> password
        pub accounts: HashMap<String, String>,
        /// Filters that match an entry
        pub matching_filters: Vec<String>,
        pub fail_search: bool,
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeDirectory {
        pub fn new() -> Self {
            Self {
                reachable: true,
                ..Default::default()
            }
        }

        pub fn with_account(mut self, dn: &str, password: &str) -> Self {
            self.accounts.insert(dn.to_string(), password.to_string());
            self
        }

        pub fn with_match(mut self, filter: &str) -> Self {
            self.matching_filters.push(filter.to_string());
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    struct FakeConnection {
        directory: Arc<FakeDirectory>,
    }

    #[async_trait]
    impl DirectoryConnection for FakeConnection {
        async fn bind(&mut self, dn: &str, password: &str) -> Result<()> {
            self.directory.calls.lock().push(format!("bind {}", dn));
            match self.directory.accounts.get(dn) {
                Some(expected) if expected == password => Ok(()),
                _ => Err(GatewayError::directory("invalid credentials")),
            }
        }

        async fn search_exists(&mut self, base: &str, filter: &str) -> Result<bool> {
            self.directory
                .calls
                .lock()
                .push(format!("search {} {}", base, filter));
            if self.directory.fail_search {
                return Err(GatewayError::directory("search failed"));
            }
            Ok(self.directory.matching_filters.iter().any(|f| f == filter))
        }

        async fn release(&mut self) {
            self.directory.calls.lock().push("release".to_string());
        }
    }

    #[async_trait]
    impl DirectoryConnector for Arc<FakeDirectory> {
        async fn connect(&self) -> Result<Box<dyn DirectoryConnection>> {
            if !self.reachable {
                self.calls.lock().push("connect failed".to_string());
                return Err(GatewayError::directory("unreachable"));
            }
            Ok(Box::new(FakeConnection {
                directory: self.clone(),
            }))
        }
    }
}
