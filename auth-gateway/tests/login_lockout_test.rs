mod common;

use auth_gateway::models::AuditEventKind;
use auth_gateway::services::{GatewayError, LoginOutcome, LoginRequest};
use common::{build_gateway, password, seed_account, test_config};

fn login_request(email: &str, pw: &str) -> LoginRequest {
    LoginRequest {
        email: email.to_string(),
        password: password(pw),
        client_ip: "198.51.100.4".to_string(),
    }
}

#[tokio::test]
async fn correct_password_grants_tokens() {
    let harness = build_gateway(test_config());
    seed_account(&harness.directory, "alice@example.com", "s3cret-enough");

    let outcome = harness
        .gateway
        .login(login_request("alice@example.com", "s3cret-enough"))
        .await
        .unwrap();
    let pair = match outcome {
        LoginOutcome::Granted(pair) => pair,
        other => panic!("expected tokens, got {:?}", other),
    };
    assert!(!pair.access_token.is_empty());
    assert!(harness
        .audit
        .kinds()
        .contains(&AuditEventKind::LoginSucceeded));
}

#[tokio::test]
async fn email_lookup_is_case_insensitive() {
    let harness = build_gateway(test_config());
    seed_account(&harness.directory, "alice@example.com", "s3cret-enough");

    let outcome = harness
        .gateway
        .login(login_request("  Alice@Example.COM ", "s3cret-enough"))
        .await
        .unwrap();
    assert!(matches!(outcome, LoginOutcome::Granted(_)));
}

#[tokio::test]
async fn unknown_email_and_wrong_password_look_identical() {
    let harness = build_gateway(test_config());
    seed_account(&harness.directory, "alice@example.com", "s3cret-enough");

    let unknown = harness
        .gateway
        .login(login_request("nobody@example.com", "whatever"))
        .await
        .unwrap_err();
    let wrong = harness
        .gateway
        .login(login_request("alice@example.com", "not-the-password"))
        .await
        .unwrap_err();
    assert_eq!(unknown.to_string(), wrong.to_string());
}

#[tokio::test]
async fn success_resets_failure_streak() {
    let harness = build_gateway(test_config());
    seed_account(&harness.directory, "alice@example.com", "s3cret-enough");

    for _ in 0..4 {
        let err = harness
            .gateway
            .login(login_request("alice@example.com", "bad"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidCredentials));
    }
    // A success at four failures wipes the streak.
    harness
        .gateway
        .login(login_request("alice@example.com", "s3cret-enough"))
        .await
        .unwrap();
    // Four more failures still do not lock.
    for _ in 0..4 {
        let err = harness
            .gateway
            .login(login_request("alice@example.com", "bad"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidCredentials));
    }
}

#[tokio::test]
async fn fifth_failure_locks_and_notifies() {
    let harness = build_gateway(test_config());
    let identity = seed_account(&harness.directory, "alice@example.com", "s3cret-enough");

    for _ in 0..4 {
        harness
            .gateway
            .login(login_request("alice@example.com", "bad"))
            .await
            .unwrap_err();
    }
    let fifth = harness
        .gateway
        .login(login_request("alice@example.com", "bad"))
        .await
        .unwrap_err();
    assert!(matches!(fifth, GatewayError::AccountLocked { .. }));
    assert_eq!(harness.notifier.lockouts(), vec!["alice@example.com"]);
    assert!(harness
        .audit
        .kinds()
        .contains(&AuditEventKind::AccountLocked));

    let status = harness
        .gateway
        .account_status(identity.identity_id)
        .await
        .unwrap();
    assert!(status.locked);
    assert!(status.locked_until.is_some());
}

#[tokio::test]
async fn correct_password_rejected_while_locked() {
    let harness = build_gateway(test_config());
    seed_account(&harness.directory, "alice@example.com", "s3cret-enough");

    for _ in 0..5 {
        harness
            .gateway
            .login(login_request("alice@example.com", "bad"))
            .await
            .unwrap_err();
    }
    let during_lock = harness
        .gateway
        .login(login_request("alice@example.com", "s3cret-enough"))
        .await
        .unwrap_err();
    assert!(matches!(during_lock, GatewayError::AccountLocked { .. }));
    // The wire message must not betray the lock.
    assert_eq!(
        during_lock.to_string(),
        GatewayError::InvalidCredentials.to_string()
    );
}

#[tokio::test]
async fn lock_expires_lazily() {
    let mut config = test_config();
    config.lockout.threshold = 2;
    config.lockout.base_lock_secs = 1;
    let harness = build_gateway(config);
    seed_account(&harness.directory, "alice@example.com", "s3cret-enough");

    for _ in 0..2 {
        harness
            .gateway
            .login(login_request("alice@example.com", "bad"))
            .await
            .unwrap_err();
    }
    let locked = harness
        .gateway
        .login(login_request("alice@example.com", "s3cret-enough"))
        .await
        .unwrap_err();
    assert!(matches!(locked, GatewayError::AccountLocked { .. }));

    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

    let outcome = harness
        .gateway
        .login(login_request("alice@example.com", "s3cret-enough"))
        .await
        .unwrap();
    assert!(matches!(outcome, LoginOutcome::Granted(_)));
}

#[tokio::test]
async fn failures_while_locked_do_not_extend_the_lock() {
    let mut config = test_config();
    config.lockout.threshold = 2;
    config.lockout.base_lock_secs = 2;
    let harness = build_gateway(config);
    let identity = seed_account(&harness.directory, "alice@example.com", "s3cret-enough");

    for _ in 0..2 {
        harness
            .gateway
            .login(login_request("alice@example.com", "bad"))
            .await
            .unwrap_err();
    }
    let status_before = harness
        .gateway
        .account_status(identity.identity_id)
        .await
        .unwrap();

    for _ in 0..3 {
        harness
            .gateway
            .login(login_request("alice@example.com", "bad"))
            .await
            .unwrap_err();
    }
    let status_after = harness
        .gateway
        .account_status(identity.identity_id)
        .await
        .unwrap();
    assert_eq!(status_before.locked_until, status_after.locked_until);
}
