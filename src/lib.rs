//! knox-ssh - An audited SSH bastion
//!
//! Clients log in to the gateway over SSH, authenticated against a directory
//! (LDAP bind plus group membership), a static realm, or Kerberos. They land
//! in a small shell whose `connect` command opens an SSH session to a node in
//! the protected cluster, optionally switching to the user's own identity
//! with a login command such as `sudo`. Every line typed into a tunnel is
//! recorded on the audit trail.
//!
//! # Shell commands
//!
//! - `connect <host>[:<port>]` - Open an interactive session on a cluster node
//! - `help` - List the available commands
//! - `exit` - Leave the gateway
//!
//! # Example Usage (CLI)
//!
//! ```bash
//! knox-ssh --topology=sandbox --auth-mode=ldap \
//!   --ldap-url=ldap://localhost:33389 --ldap-base-dn=dc=hadoop,dc=apache,dc=org \
//!   --login-command='exec sudo -iu {0} ; logout\n'
//! ```

pub mod audit;
pub mod auth;
pub mod config;
pub mod error;
pub mod server;
pub mod shell;
pub mod ssh;

// Re-exports for convenience
pub use audit::{AuditEvent, AuditService, AuditSink};
pub use auth::{build_authenticator, AuthDecision, AuthRequest, Authenticator, Credential};
pub use config::{Args, AuthMode, Config};
pub use error::{GatewayError, Result};
pub use server::SshGateway;
pub use shell::{ShellSession, SessionExit};
pub use ssh::{parse_target, Target, TunnelSettings};
