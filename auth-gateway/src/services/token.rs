//! Token issue, validation and single-use refresh rotation.
//!
//! Each login opens a session lineage identified by `sid`. The backing
//! store tracks, per lineage, which refresh jti is currently live; a
//! rotation swaps it with compare-and-swap, so of two concurrent
//! rotations of the same token exactly one wins. Presenting a refresh
//! token that was already rotated is treated as replay and revokes the
//! whole lineage.

use std::sync::Arc;

use chrono::Utc;
use jsonwebtoken::{decode, encode, errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation};
use tracing::warn;
use uuid::Uuid;

use crate::config::{StoreConfig, TokenConfig};
use crate::models::{Claims, TokenPair, TokenType};
use crate::services::error::GatewayError;
use crate::services::store::{with_policy, AuthStore, CasOutcome};

const REVOKE_REASON_REPLAY: &str = "replay";
const REVOKE_REASON_LOGOUT: &str = "logout";

pub struct TokenLifecycleManager {
    store: Arc<dyn AuthStore>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    config: TokenConfig,
    store_config: StoreConfig,
}

impl TokenLifecycleManager {
    pub fn new(store: Arc<dyn AuthStore>, config: TokenConfig, store_config: StoreConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.signing_secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.signing_secret.as_bytes());
        Self {
            store,
            encoding_key,
            decoding_key,
            config,
            store_config,
        }
    }

    fn current_key(session_id: Uuid) -> String {
        format!("session:current:{}", session_id)
    }

    fn session_revoked_key(session_id: Uuid) -> String {
        format!("session:revoked:{}", session_id)
    }

    fn token_revoked_key(jti: Uuid) -> String {
        format!("token:revoked:{}", jti)
    }

    /// Issue an access/refresh pair. `session_id` continues an existing
    /// lineage (after a second-factor step); `None` opens a new one.
    pub async fn issue(
        &self,
        identity_id: Uuid,
        capabilities: &[String],
        session_id: Option<Uuid>,
    ) -> Result<TokenPair, GatewayError> {
        let session_id = session_id.unwrap_or_else(Uuid::new_v4);
        let refresh_jti = Uuid::new_v4();

        self.run("session_open", || {
            let store = self.store.clone();
            let key = Self::current_key(session_id);
            let value = refresh_jti.to_string();
            let ttl = self.config.refresh_ttl_seconds();
            async move { store.set_with_expiry(&key, &value, ttl).await }
        })
        .await?;

        self.mint_pair(identity_id, capabilities, session_id, refresh_jti)
    }

    /// Rotate a refresh token: validate it, atomically swap it for a new
    /// one, and return the fresh pair. Exactly one of any set of
    /// concurrent rotations of the same token succeeds.
    pub async fn rotate(&self, refresh_token: &str) -> Result<TokenPair, GatewayError> {
        let claims = self.decode(refresh_token, TokenType::Refresh)?;

        let already_revoked = self
            .run("token_revoked_read", || {
                let store = self.store.clone();
                let key = Self::token_revoked_key(claims.jti);
                async move { store.get(&key).await }
            })
            .await?;
        if already_revoked.is_some() {
            warn!(
                identity_id = %claims.sub,
                session_id = %claims.sid,
                "rotated refresh token presented again, revoking lineage"
            );
            self.revoke_session_with_reason(claims.sid, REVOKE_REASON_REPLAY)
                .await?;
            return Err(GatewayError::TokenReplayDetected);
        }

        if let Some(reason) = self.session_revocation(claims.sid).await? {
            if reason == REVOKE_REASON_REPLAY {
                return Err(GatewayError::TokenReplayDetected);
            }
            return Err(GatewayError::InvalidToken);
        }

        let new_jti = Uuid::new_v4();
        let outcome = self
            .run("session_rotate", || {
                let store = self.store.clone();
                let key = Self::current_key(claims.sid);
                let expected = claims.jti.to_string();
                let new = new_jti.to_string();
                let ttl = self.config.refresh_ttl_seconds();
                async move { store.compare_and_swap(&key, &expected, &new, ttl).await }
            })
            .await?;

        match outcome {
            CasOutcome::Swapped => {
                // Tombstone the spent jti for its own remaining lifetime;
                // past its natural expiry the signature check suffices.
                let remaining = claims.remaining_seconds().max(1);
                self.run("token_tombstone", || {
                    let store = self.store.clone();
                    let key = Self::token_revoked_key(claims.jti);
                    async move { store.set_with_expiry(&key, "rotated", remaining).await }
                })
                .await?;
                self.mint_pair(claims.sub, &claims.caps, claims.sid, new_jti)
            }
            CasOutcome::Mismatch(None) => Err(GatewayError::TokenExpired),
            CasOutcome::Mismatch(Some(_)) => {
                warn!(
                    identity_id = %claims.sub,
                    session_id = %claims.sid,
                    "stale refresh token lost rotation race, revoking lineage"
                );
                self.revoke_session_with_reason(claims.sid, REVOKE_REASON_REPLAY)
                    .await?;
                Err(GatewayError::TokenReplayDetected)
            }
        }
    }

    /// Validate an access token against signature, expiry and the
    /// revocation markers.
    pub async fn validate_access(&self, access_token: &str) -> Result<Claims, GatewayError> {
        let claims = self.decode(access_token, TokenType::Access)?;

        let token_revoked = self
            .run("token_revoked_read", || {
                let store = self.store.clone();
                let key = Self::token_revoked_key(claims.jti);
                async move { store.get(&key).await }
            })
            .await?;
        if token_revoked.is_some() {
            return Err(GatewayError::InvalidToken);
        }

        if self.session_revocation(claims.sid).await?.is_some() {
            return Err(GatewayError::InvalidToken);
        }

        Ok(claims)
    }

    /// Revoke a whole lineage, as on logout or administrative action.
    pub async fn revoke_session(&self, session_id: Uuid) -> Result<(), GatewayError> {
        self.revoke_session_with_reason(session_id, REVOKE_REASON_LOGOUT)
            .await
    }

    /// Tombstone an individual access token for its remaining lifetime.
    pub async fn revoke_access(&self, jti: Uuid, remaining_secs: i64) -> Result<(), GatewayError> {
        self.run("token_tombstone", || {
            let store = self.store.clone();
            let key = Self::token_revoked_key(jti);
            let ttl = remaining_secs.max(1);
            async move { store.set_with_expiry(&key, "revoked", ttl).await }
        })
        .await
    }

    pub async fn is_session_revoked(&self, session_id: Uuid) -> Result<bool, GatewayError> {
        Ok(self.session_revocation(session_id).await?.is_some())
    }

    /// Whether an individual token id has a live revocation record.
    pub async fn is_revoked(&self, jti: Uuid) -> Result<bool, GatewayError> {
        let record = self
            .run("token_revoked_read", || {
                let store = self.store.clone();
                let key = Self::token_revoked_key(jti);
                async move { store.get(&key).await }
            })
            .await?;
        Ok(record.is_some())
    }

    /// Decode a token without hitting the store. Used where only claim
    /// contents are needed and revocation is checked separately.
    pub fn decode(&self, token: &str, expected_type: TokenType) -> Result<Claims, GatewayError> {
        let mut validation = Validation::default();
        validation.leeway = 0;
        let data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => GatewayError::TokenExpired,
                _ => GatewayError::InvalidToken,
            }
        })?;
        if data.claims.token_type != expected_type {
            return Err(GatewayError::InvalidToken);
        }
        Ok(data.claims)
    }

    async fn revoke_session_with_reason(
        &self,
        session_id: Uuid,
        reason: &'static str,
    ) -> Result<(), GatewayError> {
        self.run("session_revoke", || {
            let store = self.store.clone();
            let key = Self::session_revoked_key(session_id);
            let ttl = self.config.refresh_ttl_seconds();
            async move { store.set_with_expiry(&key, reason, ttl).await }
        })
        .await?;
        self.run("session_close", || {
            let store = self.store.clone();
            let key = Self::current_key(session_id);
            async move { store.delete(&key).await }
        })
        .await
    }

    async fn session_revocation(&self, session_id: Uuid) -> Result<Option<String>, GatewayError> {
        self.run("session_revoked_read", || {
            let store = self.store.clone();
            let key = Self::session_revoked_key(session_id);
            async move { store.get(&key).await }
        })
        .await
    }

    fn mint_pair(
        &self,
        identity_id: Uuid,
        capabilities: &[String],
        session_id: Uuid,
        refresh_jti: Uuid,
    ) -> Result<TokenPair, GatewayError> {
        let now = Utc::now();
        let access_claims = Claims {
            sub: identity_id,
            iat: now.timestamp(),
            exp: now.timestamp() + self.config.access_ttl_seconds(),
            jti: Uuid::new_v4(),
            sid: session_id,
            token_type: TokenType::Access,
            caps: capabilities.to_vec(),
        };
        let refresh_claims = Claims {
            sub: identity_id,
            iat: now.timestamp(),
            exp: now.timestamp() + self.config.refresh_ttl_seconds(),
            jti: refresh_jti,
            sid: session_id,
            token_type: TokenType::Refresh,
            caps: capabilities.to_vec(),
        };

        let access_token = encode(&Header::default(), &access_claims, &self.encoding_key)
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!(e)))?;
        let refresh_token = encode(&Header::default(), &refresh_claims, &self.encoding_key)
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!(e)))?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            session_id,
            issued_at: now,
            token_type: "Bearer".to_string(),
            expires_in: self.config.access_ttl_seconds(),
        })
    }

    async fn run<T, F, Fut>(&self, op_name: &str, op: F) -> Result<T, GatewayError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, anyhow::Error>>,
    {
        with_policy(&self.store_config, op_name, op).await
    }
}
