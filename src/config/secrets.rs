//! Secret handling utilities.
//!
//! Re-exports secrecy types used for the store URL.

pub use secrecy::{ExposeSecret, SecretString};

/// Redact the userinfo part of a URL for logging.
///
/// `redis://:hunter2@cache:6379/0` becomes `redis://***@cache:6379/0`.
pub fn redacted_url(url: &SecretString) -> String {
    let raw = url.expose_secret();
    match (raw.find("://"), raw.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}***{}", &raw[..scheme_end + 3], &raw[at..])
        }
        _ => raw.to_string(),
    }
}
