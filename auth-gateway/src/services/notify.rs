//! Outbound notification seam.
//!
//! The gateway decides when an account owner must hear about something;
//! actually delivering mail is the host application's job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Mutex;
use tracing::info;

use crate::models::OAuthProvider;

#[async_trait]
pub trait OutboundNotifier: Send + Sync {
    /// The account was just locked after repeated failures.
    async fn notify_lockout(&self, email: &str, locked_until: DateTime<Utc>);

    /// A provider login matched this account's email and waits on the
    /// owner's confirmation.
    async fn notify_link_confirmation(&self, email: &str, provider: OAuthProvider);
}

/// Default notifier: log and move on.
pub struct LoggingNotifier;

#[async_trait]
impl OutboundNotifier for LoggingNotifier {
    async fn notify_lockout(&self, email: &str, locked_until: DateTime<Utc>) {
        info!(email, locked_until = %locked_until, "lockout notification queued");
    }

    async fn notify_link_confirmation(&self, email: &str, provider: OAuthProvider) {
        info!(email, provider = provider.as_str(), "link confirmation requested");
    }
}

/// Records notifications for test assertions.
#[derive(Default)]
pub struct MemoryNotifier {
    lockouts: Mutex<Vec<String>>,
    confirmations: Mutex<Vec<(String, OAuthProvider)>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lockouts(&self) -> Vec<String> {
        self.lockouts.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn confirmations(&self) -> Vec<(String, OAuthProvider)> {
        self.confirmations.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl OutboundNotifier for MemoryNotifier {
    async fn notify_lockout(&self, email: &str, _locked_until: DateTime<Utc>) {
        if let Ok(mut lockouts) = self.lockouts.lock() {
            lockouts.push(email.to_string());
        }
    }

    async fn notify_link_confirmation(&self, email: &str, provider: OAuthProvider) {
        if let Ok(mut confirmations) = self.confirmations.lock() {
            confirmations.push((email.to_string(), provider));
        }
    }
}
