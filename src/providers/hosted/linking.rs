//! Email linking flow against the hosted provider
//!
//! Three steps: send a one-time code to the target address, exchange the
//! code for a token set, then attach the verified identity to the user.
//! The provider owns all ticket state; this side never stores the code.
//!
//! Both mutation steps re-check that the target address is not already a
//! primary or alternate of any user in the tenant, so a race between the
//! steps surfaces as a conflict instead of a hijacked link.

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use super::m2m::CLIENT_ASSERTION_TYPE;
use super::{EMAIL_CONNECTION, HostedProvider};
use crate::domain::{TokenSet, user};
use crate::http::ApiRequest;
use crate::providers::{EmailLinker, IdentityLinker};
use crate::token;
use crate::{Error, Result, redact};

/// Grant type of the passwordless OTP exchange.
const PASSWORDLESS_OTP_GRANT: &str = "http://auth0.com/oauth/grant-type/passwordless/otp";

impl HostedProvider {
    /// Fail with `Conflict` when `email` is already a primary or alternate
    /// address of any user in the tenant.
    async fn ensure_email_available(&self, email: &str) -> Result<()> {
        let taken = match self.lookup_any(email).await {
            Ok(()) => true,
            Err(Error::NotFound(_)) => false,
            Err(e) => return Err(e),
        };

        if taken {
            info!(email = %redact::email(email), "address already belongs to a user");
            Err(Error::Conflict("email already in use".to_string()))
        } else {
            Ok(())
        }
    }

    async fn lookup_any(&self, email: &str) -> Result<()> {
        use crate::providers::UserReader as _;

        match self.user_by_email(email).await {
            Ok(_) => Ok(()),
            Err(Error::NotFound(_)) => self.user_by_alternate_email(email).await.map(|_| ()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl EmailLinker for HostedProvider {
    async fn send_verification(&self, email: &str) -> Result<()> {
        user::validate_email(email)?;
        self.ensure_email_available(email).await?;

        let token = self.m2m().access_token().await?;
        ApiRequest::post(format!("{}/passwordless/start", self.base_url()))
            .token(token)
            .json(json!({
                "client_id": self.client_id(),
                "connection": EMAIL_CONNECTION,
                "email": email,
                "send": "code",
            }))
            .describe("passwordless start")
            .execute(self.http())
            .await?;

        info!(email = %redact::email(email), "verification code sent");
        Ok(())
    }

    async fn verify_code(&self, email: &str, otp: &str) -> Result<TokenSet> {
        // The address may have been claimed since step 1; conflict before
        // any token is minted
        self.ensure_email_available(email).await?;

        let assertion = self.m2m().client_assertion()?;
        ApiRequest::post(format!("{}/oauth/token", self.base_url()))
            .json(json!({
                "grant_type": PASSWORDLESS_OTP_GRANT,
                "client_id": self.client_id(),
                "client_assertion_type": CLIENT_ASSERTION_TYPE,
                "client_assertion": assertion,
                "username": email,
                "otp": otp,
                "realm": EMAIL_CONNECTION,
                "scope": "openid profile email",
            }))
            .describe("passwordless otp exchange")
            .fetch(self.http())
            .await
    }
}

#[async_trait]
impl IdentityLinker for HostedProvider {
    async fn link_identity(&self, user_token: &str, link_with: &str) -> Result<()> {
        let claims = token::parse(user_token, &self.user_token_options(&[]))?;
        let user_id = claims.sub.unwrap_or_default();

        let payload = if token::looks_like_jwt(link_with) {
            json!({"link_with": link_with})
        } else if let Some((provider, id)) = link_with.split_once('|') {
            json!({"provider": provider, "user_id": id})
        } else {
            return Err(Error::Validation(
                "link_with must be an id token or a provider|user_id descriptor".to_string(),
            ));
        };

        let mut url = self.user_url(&user_id)?;
        url.path_segments_mut()
            .map_err(|()| Error::Unexpected("base url cannot carry paths".to_string()))?
            .push("identities");

        // The user's own token authorizes the link, not the m2m token
        ApiRequest::post(url)
            .token(user_token.trim())
            .json(payload)
            .describe("identity link")
            .execute(self.http())
            .await
    }
}
