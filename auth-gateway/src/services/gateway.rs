//! Login pipeline orchestration.
//!
//! Every attempt walks the same stages in order: rate check, identity
//! lookup, credential verification, lockout check, second factor, token
//! issue. Failures short-circuit, but credential and lockout failures
//! surface identically to the caller; only the audit trail records which
//! stage refused.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::models::{
    AuditEvent, AuditEventKind, BackupCodeStatus, Identity, LockoutState, OAuthProvider,
    TokenPair, TotpSecret,
};
use crate::services::audit::AuditSink;
use crate::services::credential::{CredentialVerifier, DUMMY_HASH};
use crate::services::directory::IdentityDirectory;
use crate::services::error::GatewayError;
use crate::services::lockout::{FailureRecord, LockoutTracker};
use crate::services::notify::OutboundNotifier;
use crate::services::oauth::{OAuthLinker, OAuthResolution};
use crate::services::rate_limit::{EndpointClass, RateDecision, RateLimiter, RateScope};
use crate::services::store::{with_policy, AuthStore};
use crate::services::token::TokenLifecycleManager;
use crate::services::two_factor::TwoFactorEngine;
use crate::utils::password::{Password, PasswordHashString};

#[derive(Debug)]
pub struct LoginRequest {
    pub email: String,
    pub password: Password,
    pub client_ip: String,
}

#[derive(Debug, Clone)]
pub struct TwoFactorChallenge {
    pub challenge_id: Uuid,
    pub expires_in: i64,
}

#[derive(Debug, Clone)]
pub enum LoginOutcome {
    Granted(TokenPair),
    /// Credentials were accepted but the account requires a second
    /// factor. Tokens are withheld until the challenge is answered.
    TwoFactorRequired(TwoFactorChallenge),
}

#[derive(Debug, Clone)]
pub struct OAuthCallback {
    pub provider: OAuthProvider,
    pub external_id: String,
    pub claimed_email: String,
    pub client_ip: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountStatus {
    pub identity_id: Uuid,
    pub locked: bool,
    pub locked_until: Option<DateTime<Utc>>,
    pub failure_count: u32,
    pub two_factor_enabled: bool,
    pub email_verified: bool,
    pub linked_providers: Vec<OAuthProvider>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChallengeRecord {
    identity_id: Uuid,
}

pub struct AuthGateway {
    config: GatewayConfig,
    store: Arc<dyn AuthStore>,
    directory: Arc<dyn IdentityDirectory>,
    credentials: Arc<dyn CredentialVerifier>,
    notifier: Arc<dyn OutboundNotifier>,
    audit: Arc<dyn AuditSink>,
    rate_limiter: RateLimiter,
    lockout: LockoutTracker,
    tokens: TokenLifecycleManager,
    two_factor: TwoFactorEngine,
    oauth: OAuthLinker,
}

impl AuthGateway {
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn AuthStore>,
        directory: Arc<dyn IdentityDirectory>,
        credentials: Arc<dyn CredentialVerifier>,
        notifier: Arc<dyn OutboundNotifier>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let rate_limiter = RateLimiter::new(
            store.clone(),
            config.rate_limit.clone(),
            config.store.clone(),
        );
        let lockout = LockoutTracker::new(store.clone(), config.lockout.clone(), config.store.clone());
        let tokens = TokenLifecycleManager::new(store.clone(), config.token.clone(), config.store.clone());
        let two_factor = TwoFactorEngine::new(
            store.clone(),
            config.totp.clone(),
            config.store.clone(),
            config.issuer.clone(),
        );
        let oauth = OAuthLinker::new(store.clone(), directory.clone(), config.store.clone());
        Self {
            config,
            store,
            directory,
            credentials,
            notifier,
            audit,
            rate_limiter,
            lockout,
            tokens,
            two_factor,
            oauth,
        }
    }

    fn challenge_key(challenge_id: Uuid) -> String {
        format!("mfa:challenge:{}", challenge_id)
    }

    /// Password login.
    #[instrument(skip_all, fields(client_ip = %request.client_ip))]
    pub async fn login(&self, request: LoginRequest) -> Result<LoginOutcome, GatewayError> {
        let email = request.email.trim().to_lowercase();
        let ip = request.client_ip.as_str();

        self.gate(EndpointClass::Login, RateScope::Ip, ip, ip, None).await?;
        self.gate(EndpointClass::Login, RateScope::Identity, &email, ip, None)
            .await?;

        let identity = match self
            .directory
            .find_by_email(&email)
            .await
            .map_err(GatewayError::Internal)?
        {
            Some(identity) => identity,
            None => {
                // Burn the same hashing work an existing account would
                // cost so unknown emails are not observable by timing.
                let dummy = PasswordHashString::new(DUMMY_HASH.to_string());
                let _ = self.credentials.verify(&request.password, &dummy).await;
                self.audit
                    .emit(
                        AuditEvent::failure(AuditEventKind::LoginFailed, None, "unknown identity")
                            .with_ip(ip),
                    )
                    .await;
                return Err(GatewayError::InvalidCredentials);
            }
        };

        let hash = PasswordHashString::new(
            identity
                .password_hash
                .clone()
                .unwrap_or_else(|| DUMMY_HASH.to_string()),
        );
        let verified = self.credentials.verify(&request.password, &hash).await
            && identity.password_hash.is_some();

        // The lock check comes after verification so locked and open
        // accounts spend the same time on a wrong password.
        if let Some(locked_until) = self.lockout.locked_until(identity.identity_id).await? {
            self.audit
                .emit(
                    AuditEvent::failure(
                        AuditEventKind::LoginFailed,
                        Some(identity.identity_id),
                        "account locked",
                    )
                    .with_ip(ip),
                )
                .await;
            return Err(GatewayError::AccountLocked { locked_until });
        }

        if !verified {
            return Err(self.handle_credential_failure(&identity, ip).await?);
        }

        self.lockout.record_success(identity.identity_id).await?;

        if identity.two_factor_enabled {
            return self.open_challenge(&identity, ip).await;
        }

        let pair = self.grant(&identity, None, ip).await?;
        Ok(LoginOutcome::Granted(pair))
    }

    /// Answer a pending two-factor challenge with a TOTP or backup code.
    #[instrument(skip_all, fields(challenge_id = %challenge_id, client_ip = client_ip))]
    pub async fn verify_two_factor(
        &self,
        challenge_id: Uuid,
        code: &str,
        client_ip: &str,
    ) -> Result<TokenPair, GatewayError> {
        self.gate(
            EndpointClass::TwoFactorVerify,
            RateScope::Ip,
            client_ip,
            client_ip,
            None,
        )
        .await?;

        let record = self
            .run("challenge_read", || {
                let store = self.store.clone();
                let key = Self::challenge_key(challenge_id);
                async move { store.get(&key).await }
            })
            .await?;
        let record: ChallengeRecord = match record {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| GatewayError::Internal(anyhow::anyhow!(e)))?,
            None => {
                self.audit
                    .emit(
                        AuditEvent::failure(
                            AuditEventKind::TwoFactorFailed,
                            None,
                            "unknown or expired challenge",
                        )
                        .with_ip(client_ip),
                    )
                    .await;
                return Err(GatewayError::TokenExpired);
            }
        };
        let identity_id = record.identity_id;

        self.gate(
            EndpointClass::TwoFactorVerify,
            RateScope::Identity,
            &identity_id.to_string(),
            client_ip,
            Some(identity_id),
        )
        .await?;

        let identity = self
            .directory
            .find_by_id(identity_id)
            .await
            .map_err(GatewayError::Internal)?
            .ok_or(GatewayError::InvalidCredentials)?;

        if let Some(locked_until) = self.lockout.locked_until(identity_id).await? {
            self.audit
                .emit(
                    AuditEvent::failure(
                        AuditEventKind::TwoFactorFailed,
                        Some(identity_id),
                        "account locked",
                    )
                    .with_ip(client_ip),
                )
                .await;
            return Err(GatewayError::AccountLocked { locked_until });
        }

        if let Some(step) = self.two_factor.check_code(identity_id, code).await? {
            // Tokens are minted before the step marker is claimed; if a
            // concurrent verification got there first, this session is
            // torn down again.
            let pair = self.tokens.issue(identity_id, &identity.capabilities, None).await?;
            if !self.two_factor.consume_step(identity_id, step).await? {
                self.tokens.revoke_session(pair.session_id).await?;
                return Err(self
                    .handle_two_factor_failure(&identity, client_ip, "totp step replayed")
                    .await?);
            }
            self.close_challenge(challenge_id).await?;
            self.lockout.record_success(identity_id).await?;
            self.audit
                .emit(
                    AuditEvent::success(AuditEventKind::TwoFactorVerified, Some(identity_id))
                        .with_ip(client_ip)
                        .with_session(pair.session_id),
                )
                .await;
            self.audit
                .emit(
                    AuditEvent::success(AuditEventKind::LoginSucceeded, Some(identity_id))
                        .with_ip(client_ip)
                        .with_session(pair.session_id),
                )
                .await;
            return Ok(pair);
        }

        match self.two_factor.check_backup_code(identity_id, code).await? {
            BackupCodeStatus::Accepted => {
                let pair = self.tokens.issue(identity_id, &identity.capabilities, None).await?;
                match self.two_factor.consume_backup_code(identity_id, code).await? {
                    BackupCodeStatus::Accepted => {
                        self.close_challenge(challenge_id).await?;
                        self.lockout.record_success(identity_id).await?;
                        self.audit
                            .emit(
                                AuditEvent::success(
                                    AuditEventKind::BackupCodeConsumed,
                                    Some(identity_id),
                                )
                                .with_ip(client_ip)
                                .with_session(pair.session_id),
                            )
                            .await;
                        self.audit
                            .emit(
                                AuditEvent::success(
                                    AuditEventKind::LoginSucceeded,
                                    Some(identity_id),
                                )
                                .with_ip(client_ip)
                                .with_session(pair.session_id),
                            )
                            .await;
                        Ok(pair)
                    }
                    _ => {
                        // Lost the consumption race: someone else spent
                        // this code between check and consume.
                        self.tokens.revoke_session(pair.session_id).await?;
                        self.audit
                            .emit(
                                AuditEvent::failure(
                                    AuditEventKind::BackupCodeReplayed,
                                    Some(identity_id),
                                    "backup code consumed concurrently",
                                )
                                .with_ip(client_ip),
                            )
                            .await;
                        self.lockout.record_failure(identity_id).await?;
                        Err(GatewayError::InvalidTwoFactorCode)
                    }
                }
            }
            BackupCodeStatus::AlreadyUsed => {
                self.audit
                    .emit(
                        AuditEvent::failure(
                            AuditEventKind::BackupCodeReplayed,
                            Some(identity_id),
                            "backup code already used",
                        )
                        .with_ip(client_ip),
                    )
                    .await;
                self.lockout.record_failure(identity_id).await?;
                Err(GatewayError::InvalidTwoFactorCode)
            }
            BackupCodeStatus::Unknown => Err(self
                .handle_two_factor_failure(&identity, client_ip, "code did not match")
                .await?),
        }
    }

    /// Exchange a refresh token for a fresh pair.
    #[instrument(skip_all, fields(client_ip = client_ip))]
    pub async fn refresh(
        &self,
        refresh_token: &str,
        client_ip: &str,
    ) -> Result<TokenPair, GatewayError> {
        self.gate(EndpointClass::Refresh, RateScope::Ip, client_ip, client_ip, None)
            .await?;

        // Best-effort claim extraction so the audit trail names the
        // subject even when rotation fails.
        let hint = self
            .tokens
            .decode(refresh_token, crate::models::TokenType::Refresh)
            .ok();
        let identity_hint = hint.as_ref().map(|claims| claims.sub);

        if let Some(claims) = &hint {
            self.gate(
                EndpointClass::Refresh,
                RateScope::Identity,
                &claims.sub.to_string(),
                client_ip,
                identity_hint,
            )
            .await?;

            // A lock suspends the whole account; rotation must not be a
            // side door around it.
            if let Some(locked_until) = self.lockout.locked_until(claims.sub).await? {
                self.audit
                    .emit(
                        AuditEvent::failure(
                            AuditEventKind::TokenRejected,
                            identity_hint,
                            "account locked",
                        )
                        .with_ip(client_ip)
                        .with_session(claims.sid),
                    )
                    .await;
                return Err(GatewayError::AccountLocked { locked_until });
            }
        }

        match self.tokens.rotate(refresh_token).await {
            Ok(pair) => {
                self.audit
                    .emit(
                        AuditEvent::success(AuditEventKind::TokenRefreshed, identity_hint)
                            .with_ip(client_ip)
                            .with_session(pair.session_id),
                    )
                    .await;
                Ok(pair)
            }
            Err(GatewayError::TokenReplayDetected) => {
                let mut event = AuditEvent::failure(
                    AuditEventKind::TokenReplayDetected,
                    identity_hint,
                    "refresh token replayed, lineage revoked",
                )
                .with_ip(client_ip);
                if let Some(claims) = &hint {
                    event = event.with_session(claims.sid);
                }
                self.audit.emit(event).await;
                Err(GatewayError::TokenReplayDetected)
            }
            Err(GatewayError::BackingStoreUnavailable(source)) => {
                self.audit
                    .emit(
                        AuditEvent::failure(
                            AuditEventKind::StoreUnavailable,
                            identity_hint,
                            "refresh",
                        )
                        .with_ip(client_ip),
                    )
                    .await;
                Err(GatewayError::BackingStoreUnavailable(source))
            }
            Err(other) => {
                let mut event = AuditEvent::failure(
                    AuditEventKind::TokenRejected,
                    identity_hint,
                    &other.to_string(),
                )
                .with_ip(client_ip);
                if let Some(claims) = &hint {
                    event = event.with_session(claims.sid);
                }
                self.audit.emit(event).await;
                Err(other)
            }
        }
    }

    /// Validate an access token, returning its claims.
    pub async fn validate_access(
        &self,
        access_token: &str,
    ) -> Result<crate::models::Claims, GatewayError> {
        self.tokens.validate_access(access_token).await
    }

    /// End a session: both presented tokens and their whole lineage die.
    #[instrument(skip_all)]
    pub async fn logout(
        &self,
        access_token: &str,
        refresh_token: &str,
    ) -> Result<(), GatewayError> {
        let access = self
            .tokens
            .decode(access_token, crate::models::TokenType::Access)?;
        let refresh = self
            .tokens
            .decode(refresh_token, crate::models::TokenType::Refresh)?;
        if access.sid != refresh.sid {
            return Err(GatewayError::InvalidToken);
        }

        self.tokens
            .revoke_access(access.jti, access.remaining_seconds())
            .await?;
        self.tokens.revoke_session(access.sid).await?;
        self.audit
            .emit(
                AuditEvent::success(AuditEventKind::SessionRevoked, Some(access.sub))
                    .with_session(access.sid),
            )
            .await;
        Ok(())
    }

    /// Handle a provider callback end to end.
    #[instrument(skip_all, fields(provider = callback.provider.as_str(), client_ip = %callback.client_ip))]
    pub async fn oauth_callback(
        &self,
        callback: OAuthCallback,
    ) -> Result<LoginOutcome, GatewayError> {
        let ip = callback.client_ip.as_str();
        self.gate(EndpointClass::OauthCallback, RateScope::Ip, ip, ip, None)
            .await?;

        let resolution = match self
            .oauth
            .resolve(callback.provider, &callback.external_id, &callback.claimed_email)
            .await
        {
            Ok(resolution) => resolution,
            Err(GatewayError::OAuthAlreadyLinked) => {
                self.audit
                    .emit(
                        AuditEvent::failure(
                            AuditEventKind::OauthLinkConflict,
                            None,
                            "provider email collides with unverified account",
                        )
                        .with_ip(ip),
                    )
                    .await;
                return Err(GatewayError::OAuthAlreadyLinked);
            }
            Err(other) => return Err(other),
        };

        let identity = match resolution {
            OAuthResolution::NeedsConfirmation { existing_identity } => {
                self.notifier
                    .notify_link_confirmation(
                        callback.claimed_email.trim().to_lowercase().as_str(),
                        callback.provider,
                    )
                    .await;
                self.audit
                    .emit(
                        AuditEvent::failure(
                            AuditEventKind::OauthLinkConfirmationRequired,
                            Some(existing_identity),
                            "provider email matches existing account",
                        )
                        .with_ip(ip),
                    )
                    .await;
                return Err(GatewayError::OAuthNeedsConfirmation { existing_identity });
            }
            OAuthResolution::Created(identity) => {
                self.audit
                    .emit(
                        AuditEvent::success(
                            AuditEventKind::OauthIdentityCreated,
                            Some(identity.identity_id),
                        )
                        .with_ip(ip),
                    )
                    .await;
                identity
            }
            OAuthResolution::Resolved(identity) => {
                self.audit
                    .emit(
                        AuditEvent::success(
                            AuditEventKind::OauthResolved,
                            Some(identity.identity_id),
                        )
                        .with_ip(ip),
                    )
                    .await;
                identity
            }
        };

        if let Some(locked_until) = self.lockout.locked_until(identity.identity_id).await? {
            self.audit
                .emit(
                    AuditEvent::failure(
                        AuditEventKind::LoginFailed,
                        Some(identity.identity_id),
                        "account locked",
                    )
                    .with_ip(ip),
                )
                .await;
            return Err(GatewayError::AccountLocked { locked_until });
        }

        if identity.two_factor_enabled {
            return self.open_challenge(&identity, ip).await;
        }
        let pair = self.grant(&identity, None, ip).await?;
        Ok(LoginOutcome::Granted(pair))
    }

    /// Attach a provider identity after the account owner confirmed.
    pub async fn confirm_oauth_link(
        &self,
        provider: OAuthProvider,
        external_id: &str,
        identity_id: Uuid,
    ) -> Result<(), GatewayError> {
        match self.oauth.link(provider, external_id, identity_id).await {
            Ok(()) => {
                self.audit
                    .emit(AuditEvent::success(AuditEventKind::OauthLinked, Some(identity_id)))
                    .await;
                Ok(())
            }
            Err(GatewayError::OAuthAlreadyLinked) => {
                self.audit
                    .emit(AuditEvent::failure(
                        AuditEventKind::OauthLinkConflict,
                        Some(identity_id),
                        "provider identity attached elsewhere",
                    ))
                    .await;
                Err(GatewayError::OAuthAlreadyLinked)
            }
            Err(other) => Err(other),
        }
    }

    pub async fn unlink_oauth(
        &self,
        provider: OAuthProvider,
        identity_id: Uuid,
    ) -> Result<(), GatewayError> {
        self.oauth.unlink(provider, identity_id).await?;
        self.audit
            .emit(AuditEvent::success(AuditEventKind::OauthUnlinked, Some(identity_id)))
            .await;
        Ok(())
    }

    /// Enroll an account in TOTP. The secret is returned exactly once.
    pub async fn provision_two_factor(
        &self,
        identity_id: Uuid,
    ) -> Result<TotpSecret, GatewayError> {
        let identity = self
            .directory
            .find_by_id(identity_id)
            .await
            .map_err(GatewayError::Internal)?
            .ok_or_else(|| GatewayError::Internal(anyhow::anyhow!("unknown identity")))?;
        let secret = self.two_factor.provision(identity_id, &identity.email).await?;
        self.audit
            .emit(AuditEvent::success(AuditEventKind::TotpProvisioned, Some(identity_id)))
            .await;
        Ok(secret)
    }

    /// Regenerate the backup-code set, invalidating all previous codes.
    pub async fn generate_backup_codes(
        &self,
        identity_id: Uuid,
    ) -> Result<Vec<String>, GatewayError> {
        let codes = self.two_factor.generate_backup_codes(identity_id).await?;
        self.audit
            .emit(AuditEvent::success(
                AuditEventKind::BackupCodesRegenerated,
                Some(identity_id),
            ))
            .await;
        Ok(codes)
    }

    /// Administrative snapshot of an account's security posture.
    pub async fn account_status(&self, identity_id: Uuid) -> Result<AccountStatus, GatewayError> {
        let identity = self
            .directory
            .find_by_id(identity_id)
            .await
            .map_err(GatewayError::Internal)?
            .ok_or_else(|| GatewayError::Internal(anyhow::anyhow!("unknown identity")))?;
        let state: LockoutState = self.lockout.state(identity_id).await?;
        let linked_providers = self.oauth.linked_providers(identity_id).await?;
        Ok(AccountStatus {
            identity_id,
            locked: state.is_locked(),
            locked_until: state.locked_until,
            failure_count: state.failure_count,
            two_factor_enabled: identity.two_factor_enabled,
            email_verified: identity.email_verified,
            linked_providers,
        })
    }

    async fn handle_credential_failure(
        &self,
        identity: &Identity,
        ip: &str,
    ) -> Result<GatewayError, GatewayError> {
        match self.lockout.record_failure(identity.identity_id).await? {
            FailureRecord::Counted { failure_count } => {
                self.audit
                    .emit(
                        AuditEvent::failure(
                            AuditEventKind::LoginFailed,
                            Some(identity.identity_id),
                            &format!("wrong password, streak {}", failure_count),
                        )
                        .with_ip(ip),
                    )
                    .await;
                Ok(GatewayError::InvalidCredentials)
            }
            FailureRecord::Locked { locked_until } => {
                self.audit
                    .emit(
                        AuditEvent::failure(
                            AuditEventKind::AccountLocked,
                            Some(identity.identity_id),
                            "failure threshold crossed",
                        )
                        .with_ip(ip),
                    )
                    .await;
                self.notifier.notify_lockout(&identity.email, locked_until).await;
                Ok(GatewayError::AccountLocked { locked_until })
            }
            FailureRecord::AlreadyLocked { locked_until } => {
                Ok(GatewayError::AccountLocked { locked_until })
            }
        }
    }

    async fn handle_two_factor_failure(
        &self,
        identity: &Identity,
        ip: &str,
        reason: &str,
    ) -> Result<GatewayError, GatewayError> {
        self.audit
            .emit(
                AuditEvent::failure(
                    AuditEventKind::TwoFactorFailed,
                    Some(identity.identity_id),
                    reason,
                )
                .with_ip(ip),
            )
            .await;
        match self.lockout.record_failure(identity.identity_id).await? {
            FailureRecord::Locked { locked_until } => {
                self.notifier.notify_lockout(&identity.email, locked_until).await;
                self.audit
                    .emit(
                        AuditEvent::failure(
                            AuditEventKind::AccountLocked,
                            Some(identity.identity_id),
                            "failure threshold crossed",
                        )
                        .with_ip(ip),
                    )
                    .await;
            }
            FailureRecord::Counted { .. } | FailureRecord::AlreadyLocked { .. } => {}
        }
        Ok(GatewayError::InvalidTwoFactorCode)
    }

    async fn open_challenge(
        &self,
        identity: &Identity,
        ip: &str,
    ) -> Result<LoginOutcome, GatewayError> {
        let challenge_id = Uuid::new_v4();
        let record = serde_json::to_string(&ChallengeRecord {
            identity_id: identity.identity_id,
        })
        .map_err(|e| GatewayError::Internal(anyhow::anyhow!(e)))?;

        self.run("challenge_open", || {
            let store = self.store.clone();
            let key = Self::challenge_key(challenge_id);
            let record = record.clone();
            let ttl = self.config.challenge_ttl_secs;
            async move { store.set_with_expiry(&key, &record, ttl).await }
        })
        .await?;

        self.audit
            .emit(
                AuditEvent::success(
                    AuditEventKind::TwoFactorChallenged,
                    Some(identity.identity_id),
                )
                .with_ip(ip),
            )
            .await;
        Ok(LoginOutcome::TwoFactorRequired(TwoFactorChallenge {
            challenge_id,
            expires_in: self.config.challenge_ttl_secs,
        }))
    }

    async fn close_challenge(&self, challenge_id: Uuid) -> Result<(), GatewayError> {
        self.run("challenge_close", || {
            let store = self.store.clone();
            let key = Self::challenge_key(challenge_id);
            async move { store.delete(&key).await }
        })
        .await
    }

    async fn grant(
        &self,
        identity: &Identity,
        session_id: Option<Uuid>,
        ip: &str,
    ) -> Result<TokenPair, GatewayError> {
        let pair = self
            .tokens
            .issue(identity.identity_id, &identity.capabilities, session_id)
            .await?;
        self.audit
            .emit(
                AuditEvent::success(AuditEventKind::LoginSucceeded, Some(identity.identity_id))
                    .with_ip(ip)
                    .with_session(pair.session_id),
            )
            .await;
        Ok(pair)
    }

    async fn gate(
        &self,
        class: EndpointClass,
        scope: RateScope,
        identifier: &str,
        ip: &str,
        identity_id: Option<Uuid>,
    ) -> Result<(), GatewayError> {
        match self.rate_limiter.admit(class, scope, identifier).await {
            Ok(RateDecision::Admit { .. }) => Ok(()),
            Ok(RateDecision::Throttled { retry_after }) => {
                self.audit
                    .emit(
                        AuditEvent::failure(AuditEventKind::RateLimited, identity_id, class.as_str())
                            .with_ip(ip),
                    )
                    .await;
                Err(GatewayError::RateLimited { retry_after })
            }
            Err(GatewayError::BackingStoreUnavailable(source)) => {
                self.audit
                    .emit(
                        AuditEvent::failure(
                            AuditEventKind::StoreUnavailable,
                            identity_id,
                            class.as_str(),
                        )
                        .with_ip(ip),
                    )
                    .await;
                Err(GatewayError::BackingStoreUnavailable(source))
            }
            Err(other) => Err(other),
        }
    }

    async fn run<T, F, Fut>(&self, op_name: &str, op: F) -> Result<T, GatewayError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, anyhow::Error>>,
    {
        with_policy(&self.config.store, op_name, op).await
    }
}
