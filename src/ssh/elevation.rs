//! Identity switch for tunnelled sessions
//!
//! The login template is a shell snippet typed into the remote shell before
//! the caller's own input, usually something like
//! `exec sudo -iu {0} ; logout\n`. `{0}` is replaced by the inbound user.

use crate::error::{GatewayError, Result};

/// Placeholder substituted with the login name
pub const USER_PLACEHOLDER: &str = "{0}";

/// Renders a login template for `user`.
///
/// The rendered text is typed into a remote shell, so the name must be a
/// plain login name (see [`is_safe_login_name`]); anything else is refused.
///
/// # Examples
///
/// ```
/// use knox_ssh::ssh::elevation::render_login_command;
///
/// let cmd = render_login_command("exec sudo -iu {0} ; logout\n", "client").unwrap();
/// assert_eq!(cmd, "exec sudo -iu client ; logout\n");
///
/// assert!(render_login_command("exec sudo -iu {0}\n", "x; reboot").is_err());
/// ```
pub fn render_login_command(template: &str, user: &str) -> Result<String> {
    if !is_safe_login_name(user) {
        return Err(GatewayError::invalid_params(format!(
            "Refusing identity switch to '{}': not a valid login name",
            user.escape_default()
        )));
    }
    Ok(template.replace(USER_PLACEHOLDER, user))
}

/// Checks that a name can be pasted into a shell command line verbatim.
///
/// A safe name:
/// - Is 1 to 256 characters of `[A-Za-z0-9._@-]`
/// - Does not start with `-`, so it cannot be read as an option
pub fn is_safe_login_name(user: &str) -> bool {
    !user.is_empty()
        && user.len() <= 256
        && !user.starts_with('-')
        && user
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '@' | '-'))
}
