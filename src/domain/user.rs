//! User projection and profile metadata
//!
//! A user record is owned by the identity provider; these types are the
//! transient in-memory projection valid for a single request. The canonical
//! `user_id` has the shape `provider|local` - the `|` is what
//! distinguishes a canonical identifier from a free-form username.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A single identity, as exchanged over the bus and with adapters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    /// Canonical opaque identifier (`provider|local`); immutable once assigned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Free-form login handle; case preserved, compared case-insensitively
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Primary address; unique across primaries and verified alternates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_email: Option<String>,
    /// Secondary addresses with their verification state
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alternate_emails: Vec<AlternateEmail>,
    /// Optional nested profile document
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_metadata: Option<UserMetadata>,
    /// Inbound bearer token; request-lifetime only, never echoed in replies
    #[serde(skip_serializing)]
    pub token: Option<String>,
    /// Subject claim extracted from `token` when present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
}

/// A secondary email address on a user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlternateEmail {
    /// The address
    pub email: String,
    /// Whether the provider has verified it
    pub verified: bool,
}

/// Nested profile document.
///
/// Every field is optional, and absence is distinct from the empty string:
/// `None` means "leave unchanged" on update, `Some("")` means "clear".
/// Serialization therefore skips absent fields so PATCH bodies carry only
/// what the caller set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserMetadata {
    /// Display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Given name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,
    /// Family name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    /// Avatar URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    /// Job title
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_title: Option<String>,
    /// Organization
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    /// Country
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    /// State or province
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_province: Option<String>,
    /// City
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    /// Street address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Postal code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
    /// Phone number
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    /// T-shirt size
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t_shirt_size: Option<String>,
    /// Timezone name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zoneinfo: Option<String>,
}

/// Token set returned by the OTP exchange step of email linking.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenSet {
    /// Access token for the verified address
    pub access_token: String,
    /// Identity token; the linking payload for the final step
    pub id_token: String,
    /// Token type, normally `Bearer`
    pub token_type: String,
    /// Lifetime in seconds
    pub expires_in: u64,
    /// Refresh token, when the provider issues one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Granted scopes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl User {
    /// Trim leading/trailing whitespace on every string field, including
    /// every metadata field.
    pub fn sanitize(&mut self) {
        trim_opt(&mut self.user_id);
        trim_opt(&mut self.username);
        trim_opt(&mut self.primary_email);
        trim_opt(&mut self.token);
        trim_opt(&mut self.sub);
        for alt in &mut self.alternate_emails {
            alt.email = alt.email.trim().to_string();
        }
        if let Some(metadata) = &mut self.user_metadata {
            metadata.sanitize();
        }
    }

    /// Whether any of the user's addresses (primary or alternate) equals
    /// `email`, compared case-insensitively.
    #[must_use]
    pub fn has_email(&self, email: &str) -> bool {
        let wanted = email.to_lowercase();
        self.primary_email
            .as_deref()
            .is_some_and(|p| p.to_lowercase() == wanted)
            || self
                .alternate_emails
                .iter()
                .any(|alt| alt.email.to_lowercase() == wanted)
    }
}

impl UserMetadata {
    /// Trim every present field. `Some("")` survives - it means "clear".
    pub fn sanitize(&mut self) {
        for field in self.fields_mut() {
            trim_opt(field);
        }
    }

    /// Apply this partial document onto `existing`: present fields replace
    /// (empty string clears), absent fields are left unchanged.
    pub fn apply_to(&self, existing: &mut UserMetadata) {
        let mut update = self.clone();
        for (source, target) in update.fields_mut().into_iter().zip(existing.fields_mut()) {
            if let Some(value) = source.take() {
                *target = if value.is_empty() { None } else { Some(value) };
            }
        }
    }

    fn fields_mut(&mut self) -> [&mut Option<String>; 14] {
        [
            &mut self.name,
            &mut self.given_name,
            &mut self.family_name,
            &mut self.picture,
            &mut self.job_title,
            &mut self.organization,
            &mut self.country,
            &mut self.state_province,
            &mut self.city,
            &mut self.address,
            &mut self.postal_code,
            &mut self.phone_number,
            &mut self.t_shirt_size,
            &mut self.zoneinfo,
        ]
    }
}

fn trim_opt(value: &mut Option<String>) {
    if let Some(s) = value {
        let trimmed = s.trim();
        if trimmed.len() != s.len() {
            *s = trimmed.to_string();
        }
    }
}

/// Whether `input` is a canonical `provider|local` identifier rather than
/// a free-form username.
#[must_use]
pub fn is_canonical_id(input: &str) -> bool {
    input.contains('|')
}

/// Syntactic email check for addresses we are about to send mail to.
///
/// Not a full RFC-5322 parser; rejects the obviously unusable shapes
/// before they reach the provider.
pub fn validate_email(address: &str) -> Result<()> {
    let valid = address.split_once('@').is_some_and(|(local, domain)| {
        !local.is_empty()
            && !domain.is_empty()
            && domain.contains('.')
            && !domain.starts_with('.')
            && !domain.ends_with('.')
            && !address.contains(char::is_whitespace)
    });

    if valid {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "invalid email address: {}",
            crate::redact::email(address)
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn sanitize_trims_every_string_field() {
        let mut user = User {
            user_id: Some(" auth0|abc ".to_string()),
            username: Some("\tada\n".to_string()),
            primary_email: Some(" ada@example.org ".to_string()),
            alternate_emails: vec![AlternateEmail {
                email: " alt@example.org ".to_string(),
                verified: true,
            }],
            user_metadata: Some(UserMetadata {
                name: Some("  Ada Lovelace  ".to_string()),
                city: Some("London ".to_string()),
                ..UserMetadata::default()
            }),
            token: Some(" tok ".to_string()),
            sub: Some(" auth0|abc ".to_string()),
        };

        user.sanitize();

        // Sanitizing is idempotent: fields differing only by surrounding
        // whitespace converge to the same record
        let mut twice = user.clone();
        twice.sanitize();
        assert_eq!(user, twice);

        assert_eq!(user.user_id.as_deref(), Some("auth0|abc"));
        assert_eq!(user.username.as_deref(), Some("ada"));
        assert_eq!(user.alternate_emails[0].email, "alt@example.org");
        assert_eq!(
            user.user_metadata.as_ref().unwrap().name.as_deref(),
            Some("Ada Lovelace")
        );
    }

    #[test]
    fn sanitize_preserves_empty_string_clears() {
        let mut metadata = UserMetadata {
            name: Some(String::new()),
            ..UserMetadata::default()
        };
        metadata.sanitize();

        // Empty string means "clear this field"; it must not become None
        assert_eq!(metadata.name.as_deref(), Some(""));
    }

    #[test]
    fn serialization_skips_absent_metadata_fields() {
        let metadata = UserMetadata {
            name: Some(String::new()),
            city: Some("London".to_string()),
            ..UserMetadata::default()
        };

        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(value, json!({"name": "", "city": "London"}));
    }

    #[test]
    fn token_is_never_serialized() {
        let user = User {
            user_id: Some("auth0|abc".to_string()),
            token: Some("secret".to_string()),
            ..User::default()
        };

        let value = serde_json::to_value(&user).unwrap();
        assert!(value.get("token").is_none());
    }

    #[test]
    fn token_still_deserializes_from_requests() {
        let user: User =
            serde_json::from_value(json!({"token": "tok", "user_metadata": {"name": "Ada"}}))
                .unwrap();
        assert_eq!(user.token.as_deref(), Some("tok"));
    }

    #[test]
    fn apply_to_distinguishes_absent_and_empty() {
        let mut existing = UserMetadata {
            name: Some("Ada".to_string()),
            city: Some("London".to_string()),
            job_title: Some("Countess".to_string()),
            ..UserMetadata::default()
        };

        let update = UserMetadata {
            name: Some(String::new()),          // clear
            city: Some("Paris".to_string()),    // replace
            ..UserMetadata::default()           // everything else unchanged
        };
        update.apply_to(&mut existing);

        assert_eq!(existing.name, None);
        assert_eq!(existing.city.as_deref(), Some("Paris"));
        assert_eq!(existing.job_title.as_deref(), Some("Countess"));
    }

    #[test]
    fn canonical_id_detection() {
        assert!(is_canonical_id("auth0|abc123"));
        assert!(!is_canonical_id("ada"));
    }

    #[test]
    fn email_validation() {
        assert!(validate_email("ada@example.org").is_ok());
        assert!(validate_email("a.b+c@sub.example.org").is_ok());

        assert!(validate_email("ada").is_err());
        assert!(validate_email("ada@").is_err());
        assert!(validate_email("@example.org").is_err());
        assert!(validate_email("ada@nodot").is_err());
        assert!(validate_email("ada@.org").is_err());
        assert!(validate_email("ada @example.org").is_err());
    }

    #[test]
    fn has_email_is_case_insensitive() {
        let user = User {
            primary_email: Some("Ada@Example.org".to_string()),
            alternate_emails: vec![AlternateEmail {
                email: "alt@example.org".to_string(),
                verified: false,
            }],
            ..User::default()
        };

        assert!(user.has_email("ada@example.org"));
        assert!(user.has_email("ALT@EXAMPLE.ORG"));
        assert!(!user.has_email("other@example.org"));
    }
}
