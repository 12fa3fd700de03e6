//! Sliding-window rate limiter.
//!
//! Each window is split into fixed sub-buckets. An admission check
//! increments the current bucket first and then sums the live buckets, so
//! two racing requests at the threshold can never both be admitted: at
//! least one of them observes the other's increment.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::config::{RateLimitConfig, StoreConfig};
use crate::services::error::GatewayError;
use crate::services::store::{with_policy, AuthStore};

const BUCKETS_PER_WINDOW: i64 = 8;

/// What a rate rule keys on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateScope {
    Ip,
    Identity,
}

impl RateScope {
    fn as_str(&self) -> &'static str {
        match self {
            RateScope::Ip => "ip",
            RateScope::Identity => "identity",
        }
    }
}

/// Endpoint classes with independent budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClass {
    Login,
    Refresh,
    TwoFactorVerify,
    PasswordReset,
    OauthCallback,
}

impl EndpointClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointClass::Login => "login",
            EndpointClass::Refresh => "refresh",
            EndpointClass::TwoFactorVerify => "two_factor_verify",
            EndpointClass::PasswordReset => "password_reset",
            EndpointClass::OauthCallback => "oauth_callback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    Admit {
        remaining: u32,
        reset_after: Duration,
    },
    Throttled {
        retry_after: Duration,
    },
}

pub struct RateLimiter {
    store: Arc<dyn AuthStore>,
    config: RateLimitConfig,
    store_config: StoreConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn AuthStore>, config: RateLimitConfig, store_config: StoreConfig) -> Self {
        Self {
            store,
            config,
            store_config,
        }
    }

    /// Check and count one request against the rule for `class`/`scope`.
    ///
    /// Throttled requests are still counted: retrying while throttled
    /// pushes the window further out.
    pub async fn admit(
        &self,
        class: EndpointClass,
        scope: RateScope,
        identifier: &str,
    ) -> Result<RateDecision, GatewayError> {
        let rule = self.config.rule(class);
        let threshold = match scope {
            RateScope::Ip => rule.ip_threshold,
            RateScope::Identity => rule.identity_threshold,
        };
        self.check_and_increment(class, scope, identifier, rule.window_secs, threshold)
            .await
    }

    async fn check_and_increment(
        &self,
        class: EndpointClass,
        scope: RateScope,
        identifier: &str,
        window_secs: i64,
        threshold: u32,
    ) -> Result<RateDecision, GatewayError> {
        let bucket_len = (window_secs / BUCKETS_PER_WINDOW).max(1);
        let now = Utc::now().timestamp();
        let current_bucket = now / bucket_len;

        let key = bucket_key(class, scope, identifier, current_bucket);
        // Counter keys outlive the window by one bucket so a sum taken at
        // the window edge still sees them.
        let ttl = window_secs + bucket_len;
        let store = self.store.clone();
        let current_count = with_policy(&self.store_config, "rate_incr", || {
            let store = store.clone();
            let key = key.clone();
            async move { store.incr_with_expiry(&key, ttl).await }
        })
        .await;

        let mut total = match current_count {
            Ok(count) => count,
            Err(e) => return self.apply_fail_policy(e),
        };

        let mut oldest_bucket = current_bucket;
        for offset in 1..BUCKETS_PER_WINDOW {
            let key = bucket_key(class, scope, identifier, current_bucket - offset);
            let store = self.store.clone();
            let value = with_policy(&self.store_config, "rate_read", || {
                let store = store.clone();
                let key = key.clone();
                async move { store.get(&key).await }
            })
            .await;
            match value {
                Ok(Some(raw)) => {
                    let count = raw.parse::<i64>().unwrap_or(0);
                    if count > 0 {
                        oldest_bucket = current_bucket - offset;
                    }
                    total += count;
                }
                Ok(None) => {}
                Err(e) => return self.apply_fail_policy(e),
            }
        }

        // Quota starts freeing when the oldest live bucket falls out of
        // the window.
        let oldest_expiry_secs = (oldest_bucket * bucket_len + window_secs + bucket_len - now).max(1);

        if total > threshold as i64 {
            debug!(
                class = class.as_str(),
                scope = scope.as_str(),
                total,
                threshold,
                "request throttled"
            );
            return Ok(RateDecision::Throttled {
                retry_after: Duration::from_secs(oldest_expiry_secs as u64),
            });
        }

        Ok(RateDecision::Admit {
            remaining: threshold.saturating_sub(total as u32),
            reset_after: Duration::from_secs(oldest_expiry_secs as u64),
        })
    }

    /// Store failure during a rate check. Fail-open keeps authentication
    /// available at the cost of a softer limit; fail-closed is the
    /// default.
    fn apply_fail_policy(&self, err: GatewayError) -> Result<RateDecision, GatewayError> {
        if self.store_config.fail_open {
            debug!("rate limiter store unavailable, admitting (fail-open)");
            Ok(RateDecision::Admit {
                remaining: 0,
                reset_after: Duration::from_secs(0),
            })
        } else {
            Err(err)
        }
    }
}

fn bucket_key(class: EndpointClass, scope: RateScope, identifier: &str, bucket: i64) -> String {
    format!(
        "rl:{}:{}:{}:{}",
        class.as_str(),
        scope.as_str(),
        identifier,
        bucket
    )
}
