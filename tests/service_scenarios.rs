//! End-to-end operation scenarios over the in-memory provider
//!
//! Exercises the orchestrator exactly as the dispatcher does: raw JSON
//! payload in, reply value or error out.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use pretty_assertions::assert_eq;
use serde_json::json;

use lfx_auth_service::Error;
use lfx_auth_service::domain::{AlternateEmail, User, UserMetadata};
use lfx_auth_service::providers::mock::MockProvider;
use lfx_auth_service::service::UserService;

fn jwt(claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.c2ln")
}

fn fixture() -> (UserService, Arc<MockProvider>) {
    let provider = Arc::new(MockProvider::new());
    provider.insert(User {
        user_id: Some("provider|abc".to_string()),
        username: Some("ada".to_string()),
        primary_email: Some("ada@example.org".to_string()),
        user_metadata: Some(UserMetadata {
            name: Some("Ada Lovelace".to_string()),
            country: Some("GB".to_string()),
            ..UserMetadata::default()
        }),
        ..User::default()
    });
    (UserService::new(provider.clone()), provider)
}

#[tokio::test]
async fn metadata_read_by_token_returns_the_full_projection() {
    let (service, _) = fixture();

    // A request whose input is a JWT with sub=provider|abc
    let body = serde_json::to_vec(&json!({
        "input": jwt(&json!({"sub": "provider|abc"})),
    }))
    .unwrap();

    let reply = service.metadata_read(&body).await.unwrap();

    assert_eq!(reply["user_id"], "provider|abc");
    assert_eq!(reply["username"], "ada");
    assert_eq!(reply["primary_email"], "ada@example.org");
    assert_eq!(reply["user_metadata"]["name"], "Ada Lovelace");
    assert_eq!(reply["user_metadata"]["country"], "GB");
}

#[tokio::test]
async fn update_with_wrong_scope_is_rejected_and_state_unchanged() {
    let (service, _provider) = fixture();

    let body = serde_json::to_vec(&json!({
        "token": jwt(&json!({"sub": "provider|abc", "scope": "read:current_user"})),
        "user_metadata": {"name": "Mallory"},
    }))
    .unwrap();

    let err = service.metadata_update(&body).await.unwrap_err();
    assert!(matches!(err, Error::Forbidden(_)));
    assert!(err.reply_message().contains("scope"));

    // The provider state is untouched
    let read = service
        .metadata_read(br#"{"input":"provider|abc"}"#)
        .await
        .unwrap();
    assert_eq!(read["user_metadata"]["name"], "Ada Lovelace");
}

#[tokio::test]
async fn email_lookup_hit_replies_with_bare_username_object() {
    let (service, _) = fixture();

    let reply = service
        .email_to_username(br#"{"email":"ada@example.org"}"#)
        .await
        .unwrap();
    assert_eq!(reply, json!({"username": "ada"}));
}

#[tokio::test]
async fn email_lookup_miss_is_not_found() {
    let (service, _) = fixture();

    let err = service
        .email_to_username(br#"{"email":"ghost@example.org"}"#)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn linking_conflict_on_existing_primary() {
    let (service, _) = fixture();

    let err = service
        .send_verification(br#"{"email":"ada@example.org"}"#)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Conflict(_)));
    assert_eq!(err.reply_message(), "email already in use");
}

#[tokio::test]
async fn otp_race_conflicts_and_yields_no_token() {
    let (service, provider) = fixture();

    service
        .send_verification(br#"{"email":"raced@example.org"}"#)
        .await
        .unwrap();
    let otp = provider.pending_code("raced@example.org").unwrap();

    // Between steps 1 and 2 the address becomes someone's alternate
    provider.insert(User {
        user_id: Some("provider|other".to_string()),
        username: Some("other".to_string()),
        alternate_emails: vec![AlternateEmail {
            email: "raced@example.org".to_string(),
            verified: true,
        }],
        ..User::default()
    });

    let body = serde_json::to_vec(&json!({"email": "raced@example.org", "otp": otp})).unwrap();
    let err = service.verify(&body).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
}

#[tokio::test]
async fn full_linking_flow_attaches_the_alternate() {
    let (service, provider) = fixture();

    service
        .send_verification(br#"{"email":"second@example.org"}"#)
        .await
        .unwrap();
    let otp = provider.pending_code("second@example.org").unwrap();

    let body =
        serde_json::to_vec(&json!({"email": "second@example.org", "otp": otp})).unwrap();
    let verify_reply = service.verify(&body).await.unwrap();
    assert_eq!(verify_reply["success"], true);
    let link_token = verify_reply["data"]["token"].as_str().unwrap();

    let body = serde_json::to_vec(&json!({
        "user_token": jwt(&json!({"sub": "provider|abc"})),
        "link_with": link_token,
    }))
    .unwrap();
    let link_reply = service.link(&body).await.unwrap();
    assert_eq!(link_reply["success"], true);

    // The linked address now resolves to ada
    let read = service
        .metadata_read(br#"{"input":"provider|abc"}"#)
        .await
        .unwrap();
    let alternates = read["alternate_emails"].as_array().unwrap();
    assert!(
        alternates
            .iter()
            .any(|alt| alt["email"] == "second@example.org" && alt["verified"] == true)
    );
}

#[tokio::test]
async fn whitespace_only_differences_produce_identical_updates() {
    let (service, _) = fixture();
    let token = jwt(&json!({
        "sub": "provider|abc",
        "scope": "update:current_user_metadata",
    }));

    let tidy = serde_json::to_vec(&json!({
        "token": token,
        "user_metadata": {"city": "London"},
    }))
    .unwrap();
    let padded = serde_json::to_vec(&json!({
        "token": format!("  {token}  "),
        "user_metadata": {"city": "  London  "},
    }))
    .unwrap();

    let first = service.metadata_update(&tidy).await.unwrap();
    let second = service.metadata_update(&padded).await.unwrap();
    assert_eq!(first, second);
}
