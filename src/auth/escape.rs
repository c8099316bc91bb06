//! Escaping of untrusted values embedded in directory search filters

/// Escape a value for use inside an LDAP search filter
///
/// `*`, `(`, `)`, `\` and NUL are replaced by their `\xx` hex form. Everything
/// else passes through unchanged.
///
/// ```
/// use knox_ssh::auth::escape::escape_filter_value;
///
/// assert_eq!(escape_filter_value("a*(b)"), "a\\2a\\28b\\29");
/// ```
pub fn escape_filter_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '*' => out.push_str("\\2a"),
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '\\' => out.push_str("\\5c"),
            '\0' => out.push_str("\\00"),
            other => out.push(other),
        }
    }
    out
}
