//! Lockout state - per-identity failure streak and lock window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of an identity's failure streak. Lock expiry is lazy: a state
/// with `locked_until` in the past counts as active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockoutState {
    pub failure_count: u32,
    pub first_failure_at: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
}

impl LockoutState {
    pub fn active() -> Self {
        Self {
            failure_count: 0,
            first_failure_at: None,
            locked_until: None,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked_until.map_or(false, |until| until > Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn fresh_state_is_active() {
        assert!(!LockoutState::active().is_locked());
    }

    #[test]
    fn future_lock_is_locked() {
        let state = LockoutState {
            failure_count: 5,
            first_failure_at: Some(Utc::now()),
            locked_until: Some(Utc::now() + Duration::seconds(60)),
        };
        assert!(state.is_locked());
    }

    #[test]
    fn elapsed_lock_is_active() {
        let state = LockoutState {
            failure_count: 5,
            first_failure_at: None,
            locked_until: Some(Utc::now() - Duration::seconds(1)),
        };
        assert!(!state.is_locked());
    }
}
