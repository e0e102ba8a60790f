//! JWKS-backed key resolution for hosted-IdP tokens
//!
//! Fetches the tenant's key set from the standard discovery path and turns
//! it into prefilled [`ParseOptions`]: RS256 verification against the
//! tenant key, issuer `https://{domain}/`, audience
//! `https://{domain}/api/v2/`. Fetched keys are cached per domain.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use tracing::debug;

use super::ParseOptions;
use crate::{Error, Result};

/// How long a fetched key set stays valid.
const CACHE_TTL: Duration = Duration::from_secs(3600);

/// A single key from a JWKS document. Only the RSA fields matter here.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    /// Key type (`RSA`, `EC`, ...)
    pub kty: String,
    /// Intended use (`sig`, `enc`, or absent)
    #[serde(default, rename = "use")]
    pub use_: Option<String>,
    /// RSA modulus, base64url
    #[serde(default)]
    pub n: Option<String>,
    /// RSA exponent, base64url
    #[serde(default)]
    pub e: Option<String>,
    /// Key id
    #[serde(default)]
    pub kid: Option<String>,
}

/// A JWKS discovery document.
#[derive(Debug, Clone, Deserialize)]
pub struct KeySet {
    /// Published keys
    pub keys: Vec<Jwk>,
}

impl KeySet {
    /// Select the first RSA signing key and convert it to a decoding key.
    ///
    /// Keys with `use` other than `sig` (or empty/absent) are skipped.
    pub fn signing_key(&self) -> Result<DecodingKey> {
        self.keys
            .iter()
            .find(|k| {
                k.kty == "RSA" && k.use_.as_deref().is_none_or(|u| u.is_empty() || u == "sig")
            })
            .and_then(|k| {
                let (n, e) = (k.n.as_deref()?, k.e.as_deref()?);
                DecodingKey::from_rsa_components(n, e).ok()
            })
            .ok_or_else(|| Error::Unexpected("no usable RSA signing key in JWKS".to_string()))
    }
}

/// The standard JWKS discovery URL for a tenant domain.
#[must_use]
pub fn jwks_url(domain: &str) -> String {
    format!("https://{}/.well-known/jwks.json", domain.trim_end_matches('/'))
}

struct CachedKey {
    key: DecodingKey,
    fetched_at: Instant,
}

/// Per-domain JWKS resolver with a TTL cache.
pub struct JwksResolver {
    http: reqwest::Client,
    cache: DashMap<String, CachedKey>,
}

impl JwksResolver {
    /// Create a resolver with its own short-timeout HTTP client.
    #[must_use]
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            cache: DashMap::new(),
        }
    }

    /// Build verification options for management-API tokens of `domain`.
    ///
    /// The result requires an RS256 signature by the tenant key, issuer
    /// `https://{domain}/`, audience `https://{domain}/api/v2/`, a subject,
    /// and an expiration. Callers add required scopes per operation.
    pub async fn options_for_domain(&self, domain: &str) -> Result<ParseOptions> {
        self.options_from_url(domain, &jwks_url(domain)).await
    }

    /// As [`Self::options_for_domain`], fetching the key set from an
    /// explicit URL.
    pub async fn options_from_url(&self, domain: &str, url: &str) -> Result<ParseOptions> {
        let key = self.resolve_key(domain, url).await?;

        Ok(ParseOptions {
            allow_bearer_prefix: true,
            require_expiration: true,
            require_subject: true,
            verify_signature: true,
            signing_key: Some(key),
            expected_issuer: Some(format!("https://{domain}/")),
            expected_audience: Some(format!("https://{domain}/api/v2/")),
            ..ParseOptions::default()
        })
    }

    async fn resolve_key(&self, domain: &str, url: &str) -> Result<DecodingKey> {
        if let Some(cached) = self.cache.get(domain) {
            if cached.fetched_at.elapsed() < CACHE_TTL {
                return Ok(cached.key.clone());
            }
        }

        debug!(domain = %domain, "fetching JWKS from {url}");
        let key_set: KeySet = self.http.get(url).send().await?.json().await?;
        let key = key_set.signing_key()?;

        self.cache.insert(
            domain.to_string(),
            CachedKey {
                key: key.clone(),
                fetched_at: Instant::now(),
            },
        );

        Ok(key)
    }
}

impl Default for JwksResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key_set(value: serde_json::Value) -> KeySet {
        serde_json::from_value(value).unwrap()
    }

    // A structurally valid base64url modulus/exponent pair. The values are
    // not a real key; from_rsa_components only decodes them.
    const N: &str = "sXchYvLLJmGmDVlLpPVDJ0rEqiWyNQ0mFf2eYmUvQW8";
    const E: &str = "AQAB";

    #[test]
    fn jwks_url_uses_well_known_path() {
        assert_eq!(
            jwks_url("tenant.auth0.com"),
            "https://tenant.auth0.com/.well-known/jwks.json"
        );
        assert_eq!(
            jwks_url("tenant.auth0.com/"),
            "https://tenant.auth0.com/.well-known/jwks.json"
        );
    }

    #[test]
    fn selects_first_rsa_sig_key() {
        // GIVEN: an EC key, an encryption-only RSA key, then a signing key
        let set = key_set(json!({
            "keys": [
                {"kty": "EC", "use": "sig"},
                {"kty": "RSA", "use": "enc", "n": N, "e": E},
                {"kty": "RSA", "use": "sig", "n": N, "e": E, "kid": "good"},
            ]
        }));

        // THEN: a key is produced (the third entry)
        assert!(set.signing_key().is_ok());
    }

    #[test]
    fn empty_use_counts_as_signing() {
        let set = key_set(json!({
            "keys": [{"kty": "RSA", "use": "", "n": N, "e": E}]
        }));
        assert!(set.signing_key().is_ok());

        let set = key_set(json!({
            "keys": [{"kty": "RSA", "n": N, "e": E}]
        }));
        assert!(set.signing_key().is_ok());
    }

    #[test]
    fn no_rsa_key_is_an_error() {
        let set = key_set(json!({
            "keys": [{"kty": "EC", "use": "sig"}]
        }));
        assert!(set.signing_key().is_err());
    }

    #[tokio::test]
    async fn options_prefill_issuer_and_audience() {
        // GIVEN: a JWKS endpoint served locally
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/.well-known/jwks.json"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(json!({
                "keys": [{"kty": "RSA", "use": "sig", "n": N, "e": E}]
            })))
            .mount(&server)
            .await;

        // WHEN: building options for the tenant domain
        let resolver = JwksResolver::new();
        let options = resolver
            .options_from_url(
                "tenant.auth0.com",
                &format!("{}/.well-known/jwks.json", server.uri()),
            )
            .await
            .unwrap();

        // THEN: policy fields are prefilled for the management API
        assert!(options.verify_signature);
        assert!(options.signing_key.is_some());
        assert_eq!(
            options.expected_issuer.as_deref(),
            Some("https://tenant.auth0.com/")
        );
        assert_eq!(
            options.expected_audience.as_deref(),
            Some("https://tenant.auth0.com/api/v2/")
        );
    }
}
