//! PII-safe log redaction
//!
//! Every log line that touches an email address goes through [`email`].
//! Tokens are opaque by policy and are never logged at all, so no token
//! redaction helper exists on purpose.

/// Redact an email address for logging: keep the first character of the
/// local part and the full domain.
///
/// `ada@example.org` becomes `a***@example.org`. Values without an `@`
/// are fully masked since they may still be an address typo.
#[must_use]
pub fn email(addr: &str) -> String {
    match addr.split_once('@') {
        Some((local, domain)) => {
            let first = local.chars().next().map(String::from).unwrap_or_default();
            format!("{first}***@{domain}")
        }
        None => "***".to_string(),
    }
}
