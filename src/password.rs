//! Random secret generation and hashing for the local identity provider
//!
//! The local IdP consumes bcrypt digests from its users file; the plaintext
//! is handed back to the caller exactly once and never persisted.

use rand::RngExt;
use rand::distr::Alphanumeric;

use crate::{Error, Result};

/// Length of generated secrets.
const SECRET_LEN: usize = 20;

/// Bcrypt work factor for local user passwords.
const BCRYPT_COST: u32 = 10;

/// Generate a random alphanumeric secret from the thread-local CSPRNG.
#[must_use]
pub fn generate_secret() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(SECRET_LEN)
        .map(char::from)
        .collect()
}

/// Hash a secret with bcrypt at the service's fixed cost.
pub fn hash_secret(secret: &str) -> Result<String> {
    bcrypt::hash(secret, BCRYPT_COST)
        .map_err(|e| Error::Unexpected(format!("bcrypt hash: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_is_twenty_alphanumeric_chars() {
        let secret = generate_secret();
        assert_eq!(secret.len(), SECRET_LEN);
        assert!(secret.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn secrets_are_unique() {
        // Two draws colliding would mean the RNG is broken
        assert_ne!(generate_secret(), generate_secret());
    }

    #[test]
    fn hash_verifies_against_plaintext() {
        let secret = generate_secret();
        let digest = hash_secret(&secret).unwrap();

        assert!(digest.starts_with("$2"));
        assert!(bcrypt::verify(&secret, &digest).unwrap());
        assert!(!bcrypt::verify("wrong", &digest).unwrap());
    }
}
