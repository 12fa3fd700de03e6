mod common;

use auth_gateway::models::AuditEventKind;
use auth_gateway::services::{GatewayError, IdentityDirectory, LoginOutcome, LoginRequest};
use chrono::Utc;
use common::{build_gateway, password, seed_account, test_config};
use totp_rs::{Algorithm, Secret, TOTP};

const IP: &str = "198.51.100.77";

fn request() -> LoginRequest {
    LoginRequest {
        email: "carol@example.com".to_string(),
        password: password("pw-of-carol-1"),
        client_ip: IP.to_string(),
    }
}

/// Compute the code an authenticator app would show right now.
fn authenticator_code(secret_base32: &str) -> String {
    let secret = Secret::Encoded(secret_base32.to_string()).to_bytes().unwrap();
    let totp = TOTP::new(Algorithm::SHA1, 6, 1, 30, secret, None, String::new()).unwrap();
    totp.generate(Utc::now().timestamp() as u64)
}

async fn enrolled_harness() -> (common::TestHarness, String) {
    let harness = build_gateway(test_config());
    let identity = seed_account(&harness.directory, "carol@example.com", "pw-of-carol-1");
    let secret = harness
        .gateway
        .provision_two_factor(identity.identity_id)
        .await
        .unwrap();
    harness.directory.set_two_factor(identity.identity_id, true);
    (harness, secret.secret_base32)
}

#[tokio::test]
async fn enrolled_login_withholds_tokens_until_code() {
    let (harness, secret) = enrolled_harness().await;

    let outcome = harness.gateway.login(request()).await.unwrap();
    let challenge = match outcome {
        LoginOutcome::TwoFactorRequired(challenge) => challenge,
        LoginOutcome::Granted(_) => panic!("tokens granted before second factor"),
    };
    assert!(harness
        .audit
        .kinds()
        .contains(&AuditEventKind::TwoFactorChallenged));

    let code = authenticator_code(&secret);
    let pair = harness
        .gateway
        .verify_two_factor(challenge.challenge_id, &code, IP)
        .await
        .unwrap();
    harness.gateway.validate_access(&pair.access_token).await.unwrap();
    assert!(harness
        .audit
        .kinds()
        .contains(&AuditEventKind::TwoFactorVerified));
}

#[tokio::test]
async fn same_code_cannot_answer_two_challenges() {
    let (harness, secret) = enrolled_harness().await;

    let first = match harness.gateway.login(request()).await.unwrap() {
        LoginOutcome::TwoFactorRequired(challenge) => challenge,
        _ => panic!("expected challenge"),
    };
    let second = match harness.gateway.login(request()).await.unwrap() {
        LoginOutcome::TwoFactorRequired(challenge) => challenge,
        _ => panic!("expected challenge"),
    };

    let code = authenticator_code(&secret);
    harness
        .gateway
        .verify_two_factor(first.challenge_id, &code, IP)
        .await
        .unwrap();
    let replay = harness
        .gateway
        .verify_two_factor(second.challenge_id, &code, IP)
        .await
        .unwrap_err();
    assert!(matches!(replay, GatewayError::InvalidTwoFactorCode));
}

#[tokio::test]
async fn wrong_code_fails_and_counts_toward_lockout() {
    let (harness, _) = enrolled_harness().await;

    let challenge = match harness.gateway.login(request()).await.unwrap() {
        LoginOutcome::TwoFactorRequired(challenge) => challenge,
        _ => panic!("expected challenge"),
    };

    for _ in 0..5 {
        let err = harness
            .gateway
            .verify_two_factor(challenge.challenge_id, "000000", IP)
            .await
            .unwrap_err();
        assert!(!matches!(err, GatewayError::RateLimited { .. }));
    }
    // The streak crossed the lockout threshold; even a password login is
    // refused now.
    let err = harness.gateway.login(request()).await.unwrap_err();
    assert!(matches!(err, GatewayError::AccountLocked { .. }));
}

#[tokio::test]
async fn unknown_challenge_is_expired() {
    let (harness, _) = enrolled_harness().await;
    let err = harness
        .gateway
        .verify_two_factor(uuid::Uuid::new_v4(), "123456", IP)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::TokenExpired));
    assert!(harness
        .audit
        .kinds()
        .contains(&AuditEventKind::TwoFactorFailed));
}

#[tokio::test]
async fn backup_code_answers_a_challenge_once() {
    let (harness, _) = enrolled_harness().await;
    let identity = harness
        .directory
        .find_by_email("carol@example.com")
        .await
        .unwrap()
        .unwrap();
    let codes = harness
        .gateway
        .generate_backup_codes(identity.identity_id)
        .await
        .unwrap();

    let first = match harness.gateway.login(request()).await.unwrap() {
        LoginOutcome::TwoFactorRequired(challenge) => challenge,
        _ => panic!("expected challenge"),
    };
    let pair = harness
        .gateway
        .verify_two_factor(first.challenge_id, &codes[0], IP)
        .await
        .unwrap();
    harness.gateway.validate_access(&pair.access_token).await.unwrap();
    assert!(harness
        .audit
        .kinds()
        .contains(&AuditEventKind::BackupCodeConsumed));

    // The spent code is refused with a distinct audit trail entry.
    let second = match harness.gateway.login(request()).await.unwrap() {
        LoginOutcome::TwoFactorRequired(challenge) => challenge,
        _ => panic!("expected challenge"),
    };
    let err = harness
        .gateway
        .verify_two_factor(second.challenge_id, &codes[0], IP)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::InvalidTwoFactorCode));
    assert!(harness
        .audit
        .kinds()
        .contains(&AuditEventKind::BackupCodeReplayed));
}

#[tokio::test]
async fn regenerating_backup_codes_invalidates_old_set() {
    let (harness, _) = enrolled_harness().await;
    let identity = harness
        .directory
        .find_by_email("carol@example.com")
        .await
        .unwrap()
        .unwrap();

    let old_codes = harness
        .gateway
        .generate_backup_codes(identity.identity_id)
        .await
        .unwrap();
    let new_codes = harness
        .gateway
        .generate_backup_codes(identity.identity_id)
        .await
        .unwrap();

    let challenge = match harness.gateway.login(request()).await.unwrap() {
        LoginOutcome::TwoFactorRequired(challenge) => challenge,
        _ => panic!("expected challenge"),
    };
    assert!(harness
        .gateway
        .verify_two_factor(challenge.challenge_id, &old_codes[0], IP)
        .await
        .is_err());

    let challenge = match harness.gateway.login(request()).await.unwrap() {
        LoginOutcome::TwoFactorRequired(challenge) => challenge,
        _ => panic!("expected challenge"),
    };
    harness
        .gateway
        .verify_two_factor(challenge.challenge_id, &new_codes[0], IP)
        .await
        .unwrap();
}
