//! Bearer token parsing, verification, and claim policy checks
//!
//! # Parse flow
//!
//! 1. Trim whitespace; optionally strip a leading `Bearer` token.
//! 2. When signature verification is requested, validate the header
//!    algorithm (RS256 only) and verify the RSA signature.
//! 3. Decode the claims, coercing numeric timestamps from integer or
//!    floating-point JSON numbers.
//! 4. Apply the policy checks from [`ParseOptions`]: subject, expiration,
//!    issuer, audience, required scopes.
//!
//! Expiry is strict `now > exp`: a token whose `exp` equals the current
//! second is still accepted.

pub mod jwks;

use std::collections::BTreeSet;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde_json::Value;

use crate::Error;

/// Error variants for token parsing and verification failures.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// The input is not a structurally valid JWT.
    #[error("malformed token")]
    Malformed,

    /// Signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,

    /// The header `alg` is not in the accepted set.
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Signature verification was requested without a signing key.
    #[error("signature verification requires a signing key")]
    MissingSigningKey,

    /// A claim is absent when required, or has the wrong JSON type.
    #[error("invalid claim: {0}")]
    InvalidClaim(&'static str),

    /// The token is expired.
    #[error("token expired")]
    Expired,

    /// The `iss` claim does not match the expected issuer.
    #[error("wrong issuer: expected {expected}")]
    WrongIssuer {
        /// Issuer the verifier was configured with.
        expected: String,
    },

    /// The `aud` claim does not contain the expected audience.
    #[error("wrong audience: expected {expected}")]
    WrongAudience {
        /// Audience the verifier was configured with.
        expected: String,
    },

    /// A required scope is absent from the `scope` claim.
    #[error("missing required scope: {0}")]
    MissingScope(String),
}

impl From<TokenError> for Error {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::MissingScope(_) => Self::Forbidden(e.to_string()),
            TokenError::MissingSigningKey => Self::Validation(e.to_string()),
            _ => Self::Unauthorized(e.to_string()),
        }
    }
}

/// Claims extracted from a parsed token.
///
/// Provider-specific claims land in [`Claims::extra`] untyped.
#[derive(Debug, Clone, Default)]
pub struct Claims {
    /// Subject
    pub sub: Option<String>,
    /// Expiration (Unix seconds)
    pub exp: Option<i64>,
    /// Issued-at (Unix seconds)
    pub iat: Option<i64>,
    /// Not-before (Unix seconds)
    pub nbf: Option<i64>,
    /// Issuer
    pub iss: Option<String>,
    /// Audience; JWTs carry this as a string or an array of strings
    pub aud: Vec<String>,
    /// Space-separated scope list
    pub scope: Option<String>,
    /// Residual provider-specific claims
    pub extra: serde_json::Map<String, Value>,
}

impl Claims {
    /// Iterate over the individual scopes of the `scope` claim.
    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.scope.as_deref().unwrap_or("").split_whitespace()
    }

    /// Whether the `scope` claim contains `scope`.
    #[must_use]
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes().any(|s| s == scope)
    }
}

/// Policy options for [`parse`].
#[derive(Clone, Default)]
pub struct ParseOptions {
    /// Strip a leading `Bearer ` prefix (case-insensitive)
    pub allow_bearer_prefix: bool,
    /// Fail when `exp` is absent
    pub require_expiration: bool,
    /// Fail when `sub` is absent or blank
    pub require_subject: bool,
    /// Scopes that must all be present in the `scope` claim
    pub required_scopes: BTreeSet<String>,
    /// Verify the RSA signature (requires `signing_key`)
    pub verify_signature: bool,
    /// RSA public key used when `verify_signature` is set
    pub signing_key: Option<DecodingKey>,
    /// Expected `iss` claim, when set
    pub expected_issuer: Option<String>,
    /// Expected `aud` claim, when set
    pub expected_audience: Option<String>,
}

impl ParseOptions {
    /// Options for reading claims out of a token the caller has already
    /// decided to trust (no signature verification).
    #[must_use]
    pub fn unverified() -> Self {
        Self {
            allow_bearer_prefix: true,
            require_subject: true,
            ..Self::default()
        }
    }
}

/// Parse a bearer-format string into [`Claims`], applying the policy in
/// `options`.
pub fn parse(raw: &str, options: &ParseOptions) -> Result<Claims, TokenError> {
    let token = strip_bearer(raw, options.allow_bearer_prefix)?;

    if options.verify_signature {
        let key = options
            .signing_key
            .as_ref()
            .ok_or(TokenError::MissingSigningKey)?;
        verify_signature(token, key)?;
    }

    let claims = decode_claims(token)?;

    if options.require_subject && claims.sub.as_deref().is_none_or(|s| s.trim().is_empty()) {
        return Err(TokenError::InvalidClaim("sub"));
    }

    match claims.exp {
        None if options.require_expiration => return Err(TokenError::InvalidClaim("exp")),
        // Strict comparison: a token expiring this very second is valid.
        Some(exp) if chrono::Utc::now().timestamp() > exp => return Err(TokenError::Expired),
        _ => {}
    }

    if let Some(expected) = &options.expected_issuer {
        if claims.iss.as_deref() != Some(expected.as_str()) {
            return Err(TokenError::WrongIssuer {
                expected: expected.clone(),
            });
        }
    }

    if let Some(expected) = &options.expected_audience {
        if !claims.aud.iter().any(|a| a == expected) {
            return Err(TokenError::WrongAudience {
                expected: expected.clone(),
            });
        }
    }

    for scope in &options.required_scopes {
        if !claims.has_scope(scope) {
            return Err(TokenError::MissingScope(scope.clone()));
        }
    }

    Ok(claims)
}

/// Heuristic: does `s` look like a JWT?
///
/// Strips an optional `Bearer ` prefix, then requires exactly three
/// non-empty base64url segments. Used by operations that accept either a
/// token or a bare identifier.
#[must_use]
pub fn looks_like_jwt(s: &str) -> bool {
    let Ok(candidate) = strip_bearer(s, true) else {
        return false;
    };

    let parts: Vec<&str> = candidate.split('.').collect();
    parts.len() == 3
        && parts.iter().all(|p| {
            !p.is_empty()
                && p.bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        })
}

/// Trim and optionally strip a leading `Bearer` token (case-insensitive).
fn strip_bearer(raw: &str, allow_prefix: bool) -> Result<&str, TokenError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(TokenError::Malformed);
    }

    if !allow_prefix {
        return Ok(trimmed);
    }

    let mut parts = trimmed.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(first), Some(rest), None) if first.eq_ignore_ascii_case("bearer") => Ok(rest),
        (Some(only), None, None) => Ok(only),
        _ => Err(TokenError::Malformed),
    }
}

/// Verify the RS256 signature of `token` against `key`.
///
/// All claim validation is disabled here; the policy checks in [`parse`]
/// own those so failures surface as the right typed error.
fn verify_signature(token: &str, key: &DecodingKey) -> Result<(), TokenError> {
    let header = jsonwebtoken::decode_header(token).map_err(|_| TokenError::Malformed)?;
    if header.alg != Algorithm::RS256 {
        return Err(TokenError::UnsupportedAlgorithm(format!("{:?}", header.alg)));
    }

    let mut validation = Validation::new(Algorithm::RS256);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims = std::collections::HashSet::new();

    jsonwebtoken::decode::<Value>(token, key, &validation)
        .map(|_| ())
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::InvalidSignature => TokenError::InvalidSignature,
            _ => TokenError::Malformed,
        })
}

/// Decode the claims segment into [`Claims`], coercing numeric timestamps.
fn decode_claims(token: &str) -> Result<Claims, TokenError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(TokenError::Malformed);
    }

    let payload = URL_SAFE_NO_PAD
        .decode(parts[1])
        .map_err(|_| TokenError::Malformed)?;
    let Value::Object(mut fields) = serde_json::from_slice(&payload).map_err(|_| TokenError::Malformed)?
    else {
        return Err(TokenError::Malformed);
    };

    let mut claims = Claims {
        sub: take_string(&mut fields, "sub")?,
        exp: take_timestamp(&mut fields, "exp")?,
        iat: take_timestamp(&mut fields, "iat")?,
        nbf: take_timestamp(&mut fields, "nbf")?,
        iss: take_string(&mut fields, "iss")?,
        aud: take_audience(&mut fields)?,
        scope: take_string(&mut fields, "scope")?,
        extra: serde_json::Map::new(),
    };
    claims.extra = fields;

    Ok(claims)
}

fn take_string(
    fields: &mut serde_json::Map<String, Value>,
    name: &'static str,
) -> Result<Option<String>, TokenError> {
    match fields.remove(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(TokenError::InvalidClaim(name)),
    }
}

/// Coerce a timestamp claim from an integer or floating-point JSON number.
fn take_timestamp(
    fields: &mut serde_json::Map<String, Value>,
    name: &'static str,
) -> Result<Option<i64>, TokenError> {
    match fields.remove(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(Some)
            .ok_or(TokenError::InvalidClaim(name)),
        Some(_) => Err(TokenError::InvalidClaim(name)),
    }
}

fn take_audience(fields: &mut serde_json::Map<String, Value>) -> Result<Vec<String>, TokenError> {
    match fields.remove("aud") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s]),
        Some(Value::Array(values)) => values
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(TokenError::InvalidClaim("aud")),
            })
            .collect(),
        Some(_) => Err(TokenError::InvalidClaim("aud")),
    }
}
