#![allow(dead_code)]

use std::sync::{Arc, Once};

use auth_gateway::config::GatewayConfig;
use auth_gateway::models::Identity;
use auth_gateway::services::{
    Argon2Verifier, AuthGateway, MemoryAuditSink, MemoryDirectory, MemoryNotifier, MemoryStore,
};
use auth_gateway::utils::password::{hash_password, Password};

pub struct TestHarness {
    pub gateway: Arc<AuthGateway>,
    pub directory: Arc<MemoryDirectory>,
    pub audit: Arc<MemoryAuditSink>,
    pub notifier: Arc<MemoryNotifier>,
}

/// Defaults tuned for tests: rate limits wide open so lockout and token
/// scenarios never trip them. Individual tests tighten what they probe.
pub fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    for rule in [
        &mut config.rate_limit.login,
        &mut config.rate_limit.refresh,
        &mut config.rate_limit.two_factor,
        &mut config.rate_limit.password_reset,
        &mut config.rate_limit.oauth_callback,
    ] {
        rule.ip_threshold = 1000;
        rule.identity_threshold = 1000;
    }
    config
}

pub fn build_gateway(config: GatewayConfig) -> TestHarness {
    init_tracing();
    let directory = Arc::new(MemoryDirectory::new());
    let audit = Arc::new(MemoryAuditSink::new());
    let notifier = Arc::new(MemoryNotifier::new());
    let gateway = Arc::new(AuthGateway::new(
        config,
        Arc::new(MemoryStore::new()),
        directory.clone(),
        Arc::new(Argon2Verifier),
        notifier.clone(),
        audit.clone(),
    ));
    TestHarness {
        gateway,
        directory,
        audit,
        notifier,
    }
}

pub fn seed_account(directory: &MemoryDirectory, email: &str, password: &str) -> Identity {
    let hash = hash_password(&Password::new(password.to_string())).unwrap();
    directory.seed(email, Some(hash.into_string()), true, false)
}

pub fn password(raw: &str) -> Password {
    Password::new(raw.to_string())
}

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}
