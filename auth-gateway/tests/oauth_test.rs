mod common;

use auth_gateway::models::{AuditEventKind, OAuthProvider};
use auth_gateway::services::{GatewayError, IdentityDirectory, LoginOutcome, OAuthCallback};
use common::{build_gateway, seed_account, test_config};

const IP: &str = "198.51.100.200";

fn callback(provider: OAuthProvider, external_id: &str, email: &str) -> OAuthCallback {
    OAuthCallback {
        provider,
        external_id: external_id.to_string(),
        claimed_email: email.to_string(),
        client_ip: IP.to_string(),
    }
}

#[tokio::test]
async fn first_callback_creates_account_and_grants_tokens() {
    let harness = build_gateway(test_config());

    let outcome = harness
        .gateway
        .oauth_callback(callback(OAuthProvider::Google, "sub-1", "dora@example.com"))
        .await
        .unwrap();
    assert!(matches!(outcome, LoginOutcome::Granted(_)));
    assert!(harness
        .audit
        .kinds()
        .contains(&AuditEventKind::OauthIdentityCreated));

    let created = harness
        .directory
        .find_by_email("dora@example.com")
        .await
        .unwrap()
        .expect("identity should have been created");
    assert!(created.email_verified);
    assert!(created.password_hash.is_none());
}

#[tokio::test]
async fn returning_callback_resolves_same_account() {
    let harness = build_gateway(test_config());

    harness
        .gateway
        .oauth_callback(callback(OAuthProvider::Google, "sub-1", "dora@example.com"))
        .await
        .unwrap();
    harness
        .gateway
        .oauth_callback(callback(OAuthProvider::Google, "sub-1", "dora@example.com"))
        .await
        .unwrap();

    assert!(harness.audit.kinds().contains(&AuditEventKind::OauthResolved));
    // Still exactly one account behind the email.
    let identity = harness
        .directory
        .find_by_email("dora@example.com")
        .await
        .unwrap()
        .unwrap();
    let status = harness
        .gateway
        .account_status(identity.identity_id)
        .await
        .unwrap();
    assert_eq!(status.linked_providers, vec![OAuthProvider::Google]);
}

#[tokio::test]
async fn email_match_requires_confirmation_and_notifies_owner() {
    let harness = build_gateway(test_config());
    let owner = seed_account(&harness.directory, "erin@example.com", "erin-pass-123");

    let err = harness
        .gateway
        .oauth_callback(callback(OAuthProvider::Github, "gh-5", "erin@example.com"))
        .await
        .unwrap_err();
    match err {
        GatewayError::OAuthNeedsConfirmation { existing_identity } => {
            assert_eq!(existing_identity, owner.identity_id)
        }
        other => panic!("expected confirmation requirement, got {:?}", other),
    }
    assert_eq!(
        harness.notifier.confirmations(),
        vec![("erin@example.com".to_string(), OAuthProvider::Github)]
    );
    // No tokens, no silent link.
    let status = harness.gateway.account_status(owner.identity_id).await.unwrap();
    assert!(status.linked_providers.is_empty());
}

#[tokio::test]
async fn confirmed_link_allows_future_provider_logins() {
    let harness = build_gateway(test_config());
    let owner = seed_account(&harness.directory, "erin@example.com", "erin-pass-123");

    harness
        .gateway
        .oauth_callback(callback(OAuthProvider::Github, "gh-5", "erin@example.com"))
        .await
        .unwrap_err();
    harness
        .gateway
        .confirm_oauth_link(OAuthProvider::Github, "gh-5", owner.identity_id)
        .await
        .unwrap();

    let outcome = harness
        .gateway
        .oauth_callback(callback(OAuthProvider::Github, "gh-5", "erin@example.com"))
        .await
        .unwrap();
    assert!(matches!(outcome, LoginOutcome::Granted(_)));
    assert!(harness.audit.kinds().contains(&AuditEventKind::OauthLinked));
}

#[tokio::test]
async fn linking_a_taken_provider_identity_conflicts() {
    let harness = build_gateway(test_config());
    let first = seed_account(&harness.directory, "first@example.com", "first-pass-12");
    let second = seed_account(&harness.directory, "second@example.com", "second-pass-1");

    harness
        .gateway
        .confirm_oauth_link(OAuthProvider::Google, "sub-9", first.identity_id)
        .await
        .unwrap();
    let err = harness
        .gateway
        .confirm_oauth_link(OAuthProvider::Google, "sub-9", second.identity_id)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::OAuthAlreadyLinked));
    assert!(harness
        .audit
        .kinds()
        .contains(&AuditEventKind::OauthLinkConflict));
}

#[tokio::test]
async fn unlink_is_idempotent() {
    let harness = build_gateway(test_config());
    let owner = seed_account(&harness.directory, "erin@example.com", "erin-pass-123");
    harness
        .gateway
        .confirm_oauth_link(OAuthProvider::Microsoft, "ms-1", owner.identity_id)
        .await
        .unwrap();

    harness
        .gateway
        .unlink_oauth(OAuthProvider::Microsoft, owner.identity_id)
        .await
        .unwrap();
    harness
        .gateway
        .unlink_oauth(OAuthProvider::Microsoft, owner.identity_id)
        .await
        .unwrap();

    let status = harness.gateway.account_status(owner.identity_id).await.unwrap();
    assert!(status.linked_providers.is_empty());
}

#[tokio::test]
async fn locked_account_refuses_provider_login() {
    let harness = build_gateway(test_config());

    // Create the account through a first callback, then lock it with
    // password failures.
    harness
        .gateway
        .oauth_callback(callback(OAuthProvider::Google, "sub-1", "dora@example.com"))
        .await
        .unwrap();
    let identity = harness
        .directory
        .find_by_email("dora@example.com")
        .await
        .unwrap()
        .unwrap();
    for _ in 0..5 {
        harness
            .gateway
            .login(auth_gateway::services::LoginRequest {
                email: "dora@example.com".to_string(),
                password: common::password("guess"),
                client_ip: IP.to_string(),
            })
            .await
            .unwrap_err();
    }
    let status = harness.gateway.account_status(identity.identity_id).await.unwrap();
    assert!(status.locked);

    let err = harness
        .gateway
        .oauth_callback(callback(OAuthProvider::Google, "sub-1", "dora@example.com"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::AccountLocked { .. }));
}
