//! Tunnel target parsing
//!
//! Validates the argument of `connect` before any connection attempt.

use std::fmt;
use std::net::Ipv6Addr;

use crate::error::{GatewayError, Result};

/// Port used when the target omits one
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Host and port of a tunnel target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    fn is_ipv6(&self) -> bool {
        self.host.parse::<Ipv6Addr>().is_ok()
    }
}

/// Formats as `host:port`, bracketing IPv6 literals
impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ipv6() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parse `<host>[:<port>]`
///
/// Accepts `[v6addr]:port`, `[v6addr]` and bare IPv6 literals. The port
/// defaults to 22.
///
/// # Examples
/// ```
/// use knox_ssh::ssh::target::parse_target;
///
/// let target = parse_target("node1.internal").unwrap();
/// assert_eq!(target.to_string(), "node1.internal:22");
///
/// let target = parse_target("[::1]:2222").unwrap();
/// assert_eq!(target.port, 2222);
///
/// assert!(parse_target("node1:ssh").is_err());
/// ```
pub fn parse_target(input: &str) -> Result<Target> {
    let input = input.trim();
    if input.is_empty() {
        return Err(GatewayError::invalid_params("Missing host"));
    }
    if input.chars().any(char::is_whitespace) {
        return Err(GatewayError::invalid_params(format!(
            "Unexpected whitespace in '{}'",
            input
        )));
    }

    if let Some(rest) = input.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(|| {
            GatewayError::invalid_params(format!("Unterminated IPv6 literal in '{}'", input))
        })?;
        if host.parse::<Ipv6Addr>().is_err() {
            return Err(GatewayError::invalid_params(format!(
                "Invalid IPv6 address '{}'",
                host
            )));
        }
        let port = match after {
            "" => DEFAULT_SSH_PORT,
            _ => match after.strip_prefix(':') {
                Some(port) => parse_port(port)?,
                None => {
                    return Err(GatewayError::invalid_params(format!(
                        "Unexpected '{}' after IPv6 literal",
                        after
                    )))
                }
            },
        };
        return Ok(Target::new(host, port));
    }

    // More than one colon without brackets can only be an IPv6 literal
    if input.matches(':').count() > 1 {
        if input.parse::<Ipv6Addr>().is_ok() {
            return Ok(Target::new(input, DEFAULT_SSH_PORT));
        }
        return Err(GatewayError::invalid_params(format!(
            "Invalid host '{}'",
            input
        )));
    }

    match input.split_once(':') {
        Some((host, port)) => {
            if host.is_empty() {
                return Err(GatewayError::invalid_params("Missing host"));
            }
            Ok(Target::new(host, parse_port(port)?))
        }
        None => Ok(Target::new(input, DEFAULT_SSH_PORT)),
    }
}

fn parse_port(port: &str) -> Result<u16> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(GatewayError::invalid_params(format!(
            "Invalid port '{}'",
            port
        ))),
        Ok(port) => Ok(port),
    }
}
