//! Failure-streak tracking and escalating account lockout.
//!
//! Locks expire lazily: nothing fires at the deadline, the TTL on the
//! lock marker does the work and any later check simply no longer sees
//! it. Lockout cycles within the cycle TTL escalate the next lock
//! duration geometrically, capped at a configured maximum.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::info;
use uuid::Uuid;

use crate::config::{LockoutConfig, StoreConfig};
use crate::models::LockoutState;
use crate::services::error::GatewayError;
use crate::services::store::{with_policy, AuthStore};

/// What recording a failure did.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureRecord {
    /// Streak advanced, account still open.
    Counted { failure_count: u32 },
    /// This failure crossed the threshold and the account is now locked.
    Locked { locked_until: DateTime<Utc> },
    /// Account was already locked; the attempt did not advance the streak.
    AlreadyLocked { locked_until: DateTime<Utc> },
}

pub struct LockoutTracker {
    store: Arc<dyn AuthStore>,
    config: LockoutConfig,
    store_config: StoreConfig,
}

impl LockoutTracker {
    pub fn new(store: Arc<dyn AuthStore>, config: LockoutConfig, store_config: StoreConfig) -> Self {
        Self {
            store,
            config,
            store_config,
        }
    }

    fn fails_key(identity_id: Uuid) -> String {
        format!("lockout:fails:{}", identity_id)
    }

    fn first_key(identity_id: Uuid) -> String {
        format!("lockout:first:{}", identity_id)
    }

    fn until_key(identity_id: Uuid) -> String {
        format!("lockout:until:{}", identity_id)
    }

    fn cycles_key(identity_id: Uuid) -> String {
        format!("lockout:cycles:{}", identity_id)
    }

    /// Record one failed authentication attempt.
    ///
    /// Attempts against an already-locked account are not counted, so a
    /// flood during a lock cannot stack further locks.
    pub async fn record_failure(&self, identity_id: Uuid) -> Result<FailureRecord, GatewayError> {
        if let Some(locked_until) = self.locked_until(identity_id).await? {
            return Ok(FailureRecord::AlreadyLocked { locked_until });
        }

        let count = self
            .run("lockout_incr", || {
                let store = self.store.clone();
                let key = Self::fails_key(identity_id);
                let ttl = self.config.window_secs;
                async move { store.incr_with_expiry(&key, ttl).await }
            })
            .await?;

        self.run("lockout_mark_first", || {
            let store = self.store.clone();
            let key = Self::first_key(identity_id);
            let ttl = self.config.window_secs;
            let now = Utc::now().to_rfc3339();
            async move { store.set_if_absent(&key, &now, ttl).await }
        })
        .await?;

        if count < self.config.threshold as i64 {
            return Ok(FailureRecord::Counted {
                failure_count: count as u32,
            });
        }

        // Threshold crossed: escalate lock duration by completed cycles.
        let cycles = self
            .run("lockout_cycle_incr", || {
                let store = self.store.clone();
                let key = Self::cycles_key(identity_id);
                let ttl = self.config.cycle_ttl_secs;
                async move { store.incr_with_expiry(&key, ttl).await }
            })
            .await?;

        let lock_secs = self.lock_duration_secs(cycles);
        let locked_until = Utc::now() + Duration::seconds(lock_secs);

        self.run("lockout_set", || {
            let store = self.store.clone();
            let key = Self::until_key(identity_id);
            let value = locked_until.to_rfc3339();
            async move { store.set_with_expiry(&key, &value, lock_secs).await }
        })
        .await?;

        self.clear_streak(identity_id).await?;

        info!(
            identity_id = %identity_id,
            cycle = cycles,
            lock_secs,
            "account locked after repeated failures"
        );
        Ok(FailureRecord::Locked { locked_until })
    }

    /// A successful authentication resets the streak. Completed lockout
    /// cycles keep counting toward escalation until the cycle TTL lapses.
    pub async fn record_success(&self, identity_id: Uuid) -> Result<(), GatewayError> {
        self.clear_streak(identity_id).await
    }

    pub async fn locked_until(
        &self,
        identity_id: Uuid,
    ) -> Result<Option<DateTime<Utc>>, GatewayError> {
        let raw = self
            .run("lockout_read", || {
                let store = self.store.clone();
                let key = Self::until_key(identity_id);
                async move { store.get(&key).await }
            })
            .await?;
        match raw {
            Some(value) => {
                let until = DateTime::parse_from_rfc3339(&value)
                    .map_err(|e| GatewayError::Internal(anyhow::anyhow!(e)))?
                    .with_timezone(&Utc);
                if until > Utc::now() {
                    Ok(Some(until))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    pub async fn is_locked(&self, identity_id: Uuid) -> Result<bool, GatewayError> {
        Ok(self.locked_until(identity_id).await?.is_some())
    }

    /// Current streak snapshot, for account-status reporting.
    pub async fn state(&self, identity_id: Uuid) -> Result<LockoutState, GatewayError> {
        let locked_until = self.locked_until(identity_id).await?;

        let failure_count = self
            .run("lockout_read_fails", || {
                let store = self.store.clone();
                let key = Self::fails_key(identity_id);
                async move { store.get(&key).await }
            })
            .await?
            .and_then(|raw| raw.parse::<u32>().ok())
            .unwrap_or(0);

        let first_failure_at = self
            .run("lockout_read_first", || {
                let store = self.store.clone();
                let key = Self::first_key(identity_id);
                async move { store.get(&key).await }
            })
            .await?
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Ok(LockoutState {
            failure_count,
            first_failure_at,
            locked_until,
        })
    }

    fn lock_duration_secs(&self, cycle: i64) -> i64 {
        let exponent = (cycle - 1).clamp(0, 30) as u32;
        let factor = (self.config.backoff_factor as i64).saturating_pow(exponent);
        self.config
            .base_lock_secs
            .saturating_mul(factor)
            .min(self.config.max_lock_secs)
    }

    async fn clear_streak(&self, identity_id: Uuid) -> Result<(), GatewayError> {
        self.run("lockout_clear_fails", || {
            let store = self.store.clone();
            let key = Self::fails_key(identity_id);
            async move { store.delete(&key).await }
        })
        .await?;
        self.run("lockout_clear_first", || {
            let store = self.store.clone();
            let key = Self::first_key(identity_id);
            async move { store.delete(&key).await }
        })
        .await
    }

    async fn run<T, F, Fut>(&self, op_name: &str, op: F) -> Result<T, GatewayError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, anyhow::Error>>,
    {
        with_policy(&self.store_config, op_name, op).await
    }
}
