//! Configuration and CLI argument parsing for the SSH gateway

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use encoding_rs::Encoding;
use secrecy::SecretString;

use crate::error::{GatewayError, Result};

/// Default outbound connect timeout in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Default audit queue capacity
pub const DEFAULT_AUDIT_QUEUE_SIZE: usize = 1024;

/// Default interval between forced output flushes in milliseconds
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 100;

/// Reason the binary refuses `--auth-mode kerberos`
pub const KERBEROS_UNAVAILABLE: &str =
    "kerberos mode requires a GSS negotiator and is only available when the gateway is embedded \
     through SshGateway::with_components";

/// Inbound authentication strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AuthMode {
    /// Bind against an LDAP directory after a group membership check
    Ldap,
    /// GSS/Kerberos negotiation; needs a negotiator supplied by an embedding
    /// application, so the standalone binary refuses it
    Kerberos,
    /// Username/password lookup in a security realm
    Realm,
}

/// SSH gateway CLI arguments
#[derive(Parser, Debug, Clone)]
#[command(name = "knox-ssh")]
#[command(version)]
#[command(about = "Audited SSH bastion that tunnels into protected cluster nodes")]
pub struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0", env = "KNOX_SSH_BIND")]
    pub bind: String,

    /// Port to listen on
    #[arg(long, default_value = "2222", env = "KNOX_SSH_PORT")]
    pub port: u16,

    /// Topology (cluster) name shown in the shell prompt
    #[arg(long, default_value = "sandbox", env = "KNOX_SSH_TOPOLOGY")]
    pub topology: String,

    /// Host key file; generated on first start if missing
    #[arg(long, default_value = "knox-ssh-hostkey", env = "KNOX_SSH_HOST_KEY")]
    pub host_key: PathBuf,

    /// Number of runtime worker threads
    #[arg(long, default_value = "4", env = "KNOX_SSH_WORKERS")]
    pub workers: usize,

    /// Inbound authentication mode
    #[arg(long, value_enum, default_value = "realm", env = "KNOX_SSH_AUTH_MODE")]
    pub auth_mode: AuthMode,

    /// Emit audit events for authentication results
    #[arg(long, default_value = "true", env = "KNOX_SSH_AUDIT_AUTH", action = clap::ArgAction::Set)]
    pub audit_authentication: bool,

    /// Kerberos keytab
    #[arg(long, env = "KNOX_SSH_KEYTAB")]
    pub keytab: Option<PathBuf>,

    /// Kerberos service principal
    #[arg(long, env = "KNOX_SSH_PRINCIPAL")]
    pub principal: Option<String>,

    /// Directory URLs, tried in order
    #[arg(long = "ldap-url", env = "KNOX_SSH_LDAP_URL", value_delimiter = ',')]
    pub ldap_urls: Vec<String>,

    /// Service account DN used for membership searches
    #[arg(long, env = "KNOX_SSH_LDAP_BIND_DN")]
    pub ldap_bind_dn: Option<String>,

    /// Service account password
    #[arg(long, env = "KNOX_SSH_LDAP_BIND_PASSWORD")]
    pub ldap_bind_password: Option<String>,

    /// Search base DN
    #[arg(long, default_value = "", env = "KNOX_SSH_LDAP_BASE_DN")]
    pub ldap_base_dn: String,

    /// Attribute holding the login name
    #[arg(long, default_value = "uid", env = "KNOX_SSH_LDAP_NAME_ATTRIBUTE")]
    pub ldap_name_attribute: String,

    /// Attribute holding group membership
    #[arg(long, default_value = "memberOf", env = "KNOX_SSH_LDAP_GROUP_ATTRIBUTE")]
    pub ldap_group_attribute: String,

    /// Groups allowed to log in (any of)
    #[arg(long = "ldap-group", env = "KNOX_SSH_LDAP_GROUPS", value_delimiter = ';')]
    pub ldap_groups: Vec<String>,

    /// Bind DN template for user authentication, `{0}` is the login name
    #[arg(
        long,
        default_value = "uid={0},ou=people,dc=hadoop,dc=apache,dc=org",
        env = "KNOX_SSH_LDAP_AUTH_PATTERN"
    )]
    pub ldap_auth_pattern: String,

    /// JSON users file for realm authentication
    #[arg(long, env = "KNOX_SSH_REALM_USERS")]
    pub realm_users: Option<PathBuf>,

    /// Command sent ahead of the user's input on connect, `{0}` is the login name.
    /// Escapes `\n`, `\r` and `\t` are honoured.
    #[arg(long, env = "KNOX_SSH_LOGIN_COMMAND")]
    pub login_command: Option<String>,

    /// User the gateway logs in as on target nodes
    #[arg(long, default_value = "knox", env = "KNOX_SSH_TUNNEL_USER")]
    pub tunnel_user: String,

    /// Private key used for outbound connections (defaults to the host key)
    #[arg(long, env = "KNOX_SSH_IDENTITY_KEY")]
    pub identity_key: Option<PathBuf>,

    /// Outbound connect timeout in milliseconds
    #[arg(long, default_value = "10000", env = "KNOX_SSH_CONNECT_TIMEOUT")]
    pub connect_timeout: u64,

    /// Audit queue capacity
    #[arg(long, default_value = "1024", env = "KNOX_SSH_AUDIT_QUEUE_SIZE")]
    pub audit_queue_size: usize,

    /// How long a submission may wait for queue space, in milliseconds
    #[arg(long, default_value = "5000", env = "KNOX_SSH_AUDIT_SUBMIT_TIMEOUT")]
    pub audit_submit_timeout: u64,

    /// Encoding of audited transcripts
    #[arg(long, default_value = "UTF-8", env = "KNOX_SSH_AUDIT_ENCODING")]
    pub audit_encoding: String,

    /// Append audit events as JSON lines to this file instead of the log
    #[arg(long, env = "KNOX_SSH_AUDIT_LOG")]
    pub audit_log: Option<PathBuf>,

    /// Interval between forced output flushes in milliseconds
    #[arg(long, default_value = "100", env = "KNOX_SSH_FLUSH_INTERVAL")]
    pub flush_interval: u64,
}

/// Directory service settings
#[derive(Debug)]
pub struct DirectoryConfig {
    pub urls: Vec<String>,
    pub bind_dn: Option<String>,
    pub bind_password: Option<SecretString>,
    pub base_dn: String,
    pub name_attribute: String,
    pub group_attribute: String,
    pub groups: Vec<String>,
    pub auth_pattern: String,
}

/// Kerberos service settings
#[derive(Debug, Clone)]
pub struct KerberosConfig {
    pub keytab: PathBuf,
    pub principal: String,
}

/// Parsed and validated configuration
#[derive(Debug)]
pub struct Config {
    /// Listen address
    pub bind: String,

    /// Listen port
    pub port: u16,

    /// Topology name
    pub topology: String,

    /// Host key location
    pub host_key: PathBuf,

    /// Outbound identity key location
    pub identity_key: PathBuf,

    /// Runtime worker threads
    pub workers: usize,

    /// Active authentication mode
    pub auth_mode: AuthMode,

    /// Whether authentication results are audited
    pub audit_authentication: bool,

    /// Directory settings (ldap mode)
    pub directory: DirectoryConfig,

    /// Kerberos settings (kerberos mode)
    pub kerberos: Option<KerberosConfig>,

    /// Realm users file (realm mode)
    pub realm_users: Option<PathBuf>,

    /// Rendered-per-user identity switch template
    pub login_command: Option<String>,

    /// Login user on target nodes
    pub tunnel_user: String,

    /// Outbound connect timeout
    pub connect_timeout: Duration,

    /// Audit queue capacity
    pub audit_queue_size: usize,

    /// Maximum wait for audit queue space
    pub audit_submit_timeout: Duration,

    /// Transcript encoding
    pub audit_encoding: &'static Encoding,

    /// JSON lines audit file
    pub audit_log: Option<PathBuf>,

    /// Output flush interval
    pub flush_interval: Duration,
}

impl Config {
    /// Create Config from CLI Args
    pub fn from_args(args: Args) -> Result<Self> {
        validate_args(&args)?;

        let audit_encoding = Encoding::for_label(args.audit_encoding.as_bytes()).ok_or_else(|| {
            GatewayError::config(format!("Unknown audit encoding: {}", args.audit_encoding))
        })?;

        let kerberos = match (args.keytab, args.principal) {
            (Some(keytab), Some(principal)) => Some(KerberosConfig { keytab, principal }),
            _ => None,
        };

        let identity_key = args.identity_key.unwrap_or_else(|| args.host_key.clone());

        Ok(Config {
            bind: args.bind,
            port: args.port,
            topology: args.topology,
            host_key: args.host_key,
            identity_key,
            workers: args.workers,
            auth_mode: args.auth_mode,
            audit_authentication: args.audit_authentication,
            directory: DirectoryConfig {
                urls: args.ldap_urls,
                bind_dn: non_empty(args.ldap_bind_dn),
                bind_password: non_empty(args.ldap_bind_password).map(SecretString::from),
                base_dn: args.ldap_base_dn,
                name_attribute: args.ldap_name_attribute,
                group_attribute: args.ldap_group_attribute,
                groups: args
                    .ldap_groups
                    .into_iter()
                    .map(|g| g.trim().to_string())
                    .filter(|g| !g.is_empty())
                    .collect(),
                auth_pattern: args.ldap_auth_pattern,
            },
            kerberos,
            realm_users: args.realm_users,
            login_command: non_empty(args.login_command).map(|t| unescape_template(&t)),
            tunnel_user: args.tunnel_user,
            connect_timeout: Duration::from_millis(args.connect_timeout),
            audit_queue_size: args.audit_queue_size,
            audit_submit_timeout: Duration::from_millis(args.audit_submit_timeout),
            audit_encoding,
            audit_log: args.audit_log,
            flush_interval: Duration::from_millis(args.flush_interval),
        })
    }
}

/// Validate CLI arguments
fn validate_args(args: &Args) -> Result<()> {
    let mut errors = Vec::new();

    if args.topology.trim().is_empty() {
        errors.push("Missing required --topology".to_string());
    }

    if args.tunnel_user.trim().is_empty() {
        errors.push("Missing required --tunnel-user".to_string());
    }

    if args.workers == 0 {
        errors.push("--workers must be at least 1".to_string());
    }

    if args.audit_queue_size == 0 {
        errors.push("--audit-queue-size must be at least 1".to_string());
    }

    if args.connect_timeout == 0 {
        errors.push("--connect-timeout must be positive".to_string());
    }

    if args.flush_interval == 0 {
        errors.push("--flush-interval must be positive".to_string());
    }

    if let Some(ref key_path) = args.identity_key {
        if !key_path.exists() {
            errors.push(format!("Identity key file not found: {}", key_path.display()));
        }
    }

    match args.auth_mode {
        AuthMode::Ldap => {
            if args.ldap_urls.iter().all(|u| u.trim().is_empty()) {
                errors.push("ldap mode requires at least one --ldap-url".to_string());
            }
            if args.ldap_base_dn.trim().is_empty() {
                errors.push("ldap mode requires --ldap-base-dn".to_string());
            }
            if !args.ldap_auth_pattern.contains("{0}") {
                errors.push("--ldap-auth-pattern must contain {0}".to_string());
            }
        }
        AuthMode::Kerberos => {
            match (&args.keytab, &args.principal) {
                (Some(keytab), Some(_)) => {
                    if !keytab.exists() {
                        errors.push(format!("Keytab file not found: {}", keytab.display()));
                    }
                }
                _ => errors.push("kerberos mode requires --keytab and --principal".to_string()),
            }
            errors.push(KERBEROS_UNAVAILABLE.to_string());
        }
        AuthMode::Realm => match args.realm_users {
            Some(ref path) if !path.exists() => {
                errors.push(format!("Realm users file not found: {}", path.display()));
            }
            Some(_) => {}
            None => errors.push("realm mode requires --realm-users".to_string()),
        },
    }

    if !errors.is_empty() {
        return Err(GatewayError::Config(format!(
            "Configuration error:\n{}",
            errors.join("\n")
        )));
    }

    Ok(())
}

/// Expand `\n`, `\r`, `\t` and `\\` in a template taken from the command line
///
/// Unknown escapes are kept verbatim.
pub fn unescape_template(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Return None if empty
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        bind: "127.0.0.1".to_string(),
        port: 0,
        topology: "sandbox".to_string(),
        host_key: PathBuf::from("knox-ssh-hostkey"),
        identity_key: PathBuf::from("knox-ssh-hostkey"),
        workers: 1,
        auth_mode: AuthMode::Realm,
        audit_authentication: true,
        directory: DirectoryConfig {
            urls: vec!["ldap://localhost:33389".to_string()],
            bind_dn: Some("uid=guest,ou=people,dc=hadoop,dc=apache,dc=org".to_string()),
            bind_password: Some(SecretString::from("guest-password")),
            base_dn: "dc=hadoop,dc=apache,dc=org".to_string(),
            name_attribute: "uid".to_string(),
            group_attribute: "memberOf".to_string(),
            groups: Vec::new(),
            auth_pattern: "uid={0},ou=people,dc=hadoop,dc=apache,dc=org".to_string(),
        },
        kerberos: None,
        realm_users: None,
        login_command: None,
        tunnel_user: "knox".to_string(),
        connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
        audit_queue_size: 16,
        audit_submit_timeout: Duration::from_millis(200),
        audit_encoding: encoding_rs::UTF_8,
        audit_log: None,
        flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
    }
}
