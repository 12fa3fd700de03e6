//! Audit events emitted at every security decision point.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventKind {
    LoginSucceeded,
    LoginFailed,
    AccountLocked,
    TwoFactorChallenged,
    TwoFactorVerified,
    TwoFactorFailed,
    BackupCodeConsumed,
    BackupCodeReplayed,
    BackupCodesRegenerated,
    TotpProvisioned,
    TokenIssued,
    TokenRefreshed,
    TokenRejected,
    TokenReplayDetected,
    SessionRevoked,
    OauthIdentityCreated,
    OauthResolved,
    OauthLinkConfirmationRequired,
    OauthLinked,
    OauthUnlinked,
    OauthLinkConflict,
    RateLimited,
    StoreUnavailable,
}

impl AuditEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventKind::LoginSucceeded => "login_succeeded",
            AuditEventKind::LoginFailed => "login_failed",
            AuditEventKind::AccountLocked => "account_locked",
            AuditEventKind::TwoFactorChallenged => "two_factor_challenged",
            AuditEventKind::TwoFactorVerified => "two_factor_verified",
            AuditEventKind::TwoFactorFailed => "two_factor_failed",
            AuditEventKind::BackupCodeConsumed => "backup_code_consumed",
            AuditEventKind::BackupCodeReplayed => "backup_code_replayed",
            AuditEventKind::BackupCodesRegenerated => "backup_codes_regenerated",
            AuditEventKind::TotpProvisioned => "totp_provisioned",
            AuditEventKind::TokenIssued => "token_issued",
            AuditEventKind::TokenRefreshed => "token_refreshed",
            AuditEventKind::TokenRejected => "token_rejected",
            AuditEventKind::TokenReplayDetected => "token_replay_detected",
            AuditEventKind::SessionRevoked => "session_revoked",
            AuditEventKind::OauthIdentityCreated => "oauth_identity_created",
            AuditEventKind::OauthResolved => "oauth_resolved",
            AuditEventKind::OauthLinkConfirmationRequired => "oauth_link_confirmation_required",
            AuditEventKind::OauthLinked => "oauth_linked",
            AuditEventKind::OauthUnlinked => "oauth_unlinked",
            AuditEventKind::OauthLinkConflict => "oauth_link_conflict",
            AuditEventKind::RateLimited => "rate_limited",
            AuditEventKind::StoreUnavailable => "store_unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
}

/// A single security-relevant event. The reason field carries the internal
/// cause; it never leaves the audit channel, so it may be more specific
/// than the error returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub kind: AuditEventKind,
    pub identity_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
    pub ip_address: Option<String>,
    pub outcome: AuditOutcome,
    pub reason: Option<String>,
    pub created_utc: DateTime<Utc>,
}

impl AuditEvent {
    pub fn success(kind: AuditEventKind, identity_id: Option<Uuid>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            kind,
            identity_id,
            session_id: None,
            ip_address: None,
            outcome: AuditOutcome::Success,
            reason: None,
            created_utc: Utc::now(),
        }
    }

    pub fn failure(kind: AuditEventKind, identity_id: Option<Uuid>, reason: &str) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            kind,
            identity_id,
            session_id: None,
            ip_address: None,
            outcome: AuditOutcome::Failure,
            reason: Some(reason.to_string()),
            created_utc: Utc::now(),
        }
    }

    pub fn with_ip(mut self, ip: &str) -> Self {
        self.ip_address = Some(ip.to_string());
        self
    }

    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_maps_to_snake_case() {
        assert_eq!(AuditEventKind::LoginFailed.as_str(), "login_failed");
        assert_eq!(
            AuditEventKind::TokenReplayDetected.as_str(),
            "token_replay_detected"
        );
    }

    #[test]
    fn builders_attach_context() {
        let sid = Uuid::new_v4();
        let event = AuditEvent::success(AuditEventKind::TokenIssued, Some(Uuid::new_v4()))
            .with_ip("203.0.113.7")
            .with_session(sid);
        assert_eq!(event.outcome, AuditOutcome::Success);
        assert_eq!(event.ip_address.as_deref(), Some("203.0.113.7"));
        assert_eq!(event.session_id, Some(sid));
    }
}
