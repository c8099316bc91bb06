//! Outbound SSH tunnels
//!
//! Everything the gateway needs in the client role: target parsing, the
//! identity switch, the russh client handler, key loading and the `connect`
//! command that ties them together.

pub mod config;
pub mod connector;
pub mod elevation;
pub mod handler;
pub mod keys;
pub mod target;

// Re-exports
pub use config::TunnelSettings;
pub use connector::ConnectCommand;
pub use elevation::{is_safe_login_name, render_login_command};
pub use handler::TunnelHandler;
pub use keys::{load_identity, load_or_generate_host_key};
pub use target::{parse_target, Target};
