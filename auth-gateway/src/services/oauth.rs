//! External provider identity resolution and linking.
//!
//! The store maps (provider, external id) to a local identity. A
//! callback for an unmapped pair never silently attaches to an existing
//! account: when the provider-asserted email matches a local identity,
//! the caller gets `NeedsConfirmation` and must come back through
//! [`OAuthLinker::link`] after the owner approves.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::models::{Identity, OAuthIdentity, OAuthProvider};
use crate::services::directory::IdentityDirectory;
use crate::services::error::GatewayError;
use crate::services::store::{with_policy, AuthStore, CasOutcome};

/// TTL for the placeholder written while a new identity is being created.
const PENDING_TTL_SECS: i64 = 30;
const PENDING_PREFIX: &str = "pending:";

#[derive(Debug, Clone)]
pub enum OAuthResolution {
    /// The mapping existed; this is a returning login.
    Resolved(Identity),
    /// No mapping and no email collision; a fresh identity was created.
    Created(Identity),
    /// The provider email matches an existing verified account. Linking
    /// requires that account owner's explicit confirmation.
    NeedsConfirmation { existing_identity: Uuid },
}

pub struct OAuthLinker {
    store: Arc<dyn AuthStore>,
    directory: Arc<dyn IdentityDirectory>,
    store_config: StoreConfig,
}

impl OAuthLinker {
    pub fn new(
        store: Arc<dyn AuthStore>,
        directory: Arc<dyn IdentityDirectory>,
        store_config: StoreConfig,
    ) -> Self {
        Self {
            store,
            directory,
            store_config,
        }
    }

    fn map_key(provider: OAuthProvider, external_id: &str) -> String {
        format!("oauth:map:{}:{}", provider.as_str(), external_id)
    }

    fn reverse_key(identity_id: Uuid, provider: OAuthProvider) -> String {
        format!("oauth:ident:{}:{}", identity_id, provider.as_str())
    }

    /// Resolve a provider callback to a local identity.
    pub async fn resolve(
        &self,
        provider: OAuthProvider,
        external_id: &str,
        claimed_email: &str,
    ) -> Result<OAuthResolution, GatewayError> {
        if let Some(identity) = self.mapped_identity(provider, external_id).await? {
            return Ok(OAuthResolution::Resolved(identity));
        }

        let email = claimed_email.trim().to_lowercase();
        if let Some(existing) = self
            .directory
            .find_by_email(&email)
            .await
            .map_err(GatewayError::Internal)?
        {
            if existing.email_verified {
                info!(
                    provider = provider.as_str(),
                    identity_id = %existing.identity_id,
                    "provider email matches existing account, confirmation required"
                );
                return Ok(OAuthResolution::NeedsConfirmation {
                    existing_identity: existing.identity_id,
                });
            }
            // An unverified local account with this email cannot vouch for
            // anything, and auto-creating a duplicate would shadow it.
            return Err(GatewayError::OAuthAlreadyLinked);
        }

        // Reserve the mapping before creating the identity so two racing
        // first-time callbacks cannot create two accounts.
        let reservation = format!("{}{}", PENDING_PREFIX, Uuid::new_v4());
        let reserved = self
            .run("oauth_reserve", || {
                let store = self.store.clone();
                let key = Self::map_key(provider, external_id);
                let reservation = reservation.clone();
                async move { store.set_if_absent(&key, &reservation, PENDING_TTL_SECS).await }
            })
            .await?;
        if !reserved {
            // Lost the race; the winner's mapping is (or will shortly be)
            // in place.
            if let Some(identity) = self.mapped_identity(provider, external_id).await? {
                return Ok(OAuthResolution::Resolved(identity));
            }
            return Err(GatewayError::Internal(anyhow::anyhow!(
                "provider mapping reservation contended"
            )));
        }

        // Provider-asserted emails arrive verified.
        let identity = self
            .directory
            .create_identity(&email, true)
            .await
            .map_err(GatewayError::Internal)?;

        let outcome = self
            .run("oauth_fill", || {
                let store = self.store.clone();
                let key = Self::map_key(provider, external_id);
                let reservation = reservation.clone();
                let id = identity.identity_id.to_string();
                async move { store.compare_and_swap(&key, &reservation, &id, 0).await }
            })
            .await?;
        if outcome != CasOutcome::Swapped {
            return Err(GatewayError::Internal(anyhow::anyhow!(
                "provider mapping reservation expired mid-create"
            )));
        }

        self.write_reverse_index(identity.identity_id, provider, external_id)
            .await?;

        info!(
            provider = provider.as_str(),
            identity_id = %identity.identity_id,
            "identity created from provider callback"
        );
        Ok(OAuthResolution::Created(identity))
    }

    /// Attach a provider identity to an existing account, after the owner
    /// confirmed. Idempotent for the same target; a mapping pointing at a
    /// different account is a conflict.
    pub async fn link(
        &self,
        provider: OAuthProvider,
        external_id: &str,
        identity_id: Uuid,
    ) -> Result<(), GatewayError> {
        let created = self
            .run("oauth_link", || {
                let store = self.store.clone();
                let key = Self::map_key(provider, external_id);
                let id = identity_id.to_string();
                async move { store.set_if_absent(&key, &id, 0).await }
            })
            .await?;
        if !created {
            let current = self
                .run("oauth_map_read", || {
                    let store = self.store.clone();
                    let key = Self::map_key(provider, external_id);
                    async move { store.get(&key).await }
                })
                .await?;
            match current {
                Some(value) if value == identity_id.to_string() => return Ok(()),
                _ => return Err(GatewayError::OAuthAlreadyLinked),
            }
        }

        self.write_reverse_index(identity_id, provider, external_id)
            .await?;
        info!(provider = provider.as_str(), identity_id = %identity_id, "provider identity linked");
        Ok(())
    }

    /// Detach a provider from an account. Unlinking a provider that is
    /// not attached is a no-op.
    pub async fn unlink(
        &self,
        provider: OAuthProvider,
        identity_id: Uuid,
    ) -> Result<(), GatewayError> {
        let record = self
            .run("oauth_reverse_read", || {
                let store = self.store.clone();
                let key = Self::reverse_key(identity_id, provider);
                async move { store.get(&key).await }
            })
            .await?;
        let link: OAuthIdentity = match record {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| GatewayError::Internal(anyhow::anyhow!(e)))?,
            None => return Ok(()),
        };

        self.run("oauth_unlink_map", || {
            let store = self.store.clone();
            let key = Self::map_key(provider, &link.external_id);
            async move { store.delete(&key).await }
        })
        .await?;
        self.run("oauth_unlink_reverse", || {
            let store = self.store.clone();
            let key = Self::reverse_key(identity_id, provider);
            async move { store.delete(&key).await }
        })
        .await?;
        info!(provider = provider.as_str(), identity_id = %identity_id, "provider identity unlinked");
        Ok(())
    }

    /// Providers currently attached to an account.
    pub async fn linked_providers(
        &self,
        identity_id: Uuid,
    ) -> Result<Vec<OAuthProvider>, GatewayError> {
        let mut providers = Vec::new();
        for provider in [
            OAuthProvider::Google,
            OAuthProvider::Github,
            OAuthProvider::Microsoft,
        ] {
            let linked = self
                .run("oauth_reverse_read", || {
                    let store = self.store.clone();
                    let key = Self::reverse_key(identity_id, provider);
                    async move { store.get(&key).await }
                })
                .await?;
            if linked.is_some() {
                providers.push(provider);
            }
        }
        Ok(providers)
    }

    async fn mapped_identity(
        &self,
        provider: OAuthProvider,
        external_id: &str,
    ) -> Result<Option<Identity>, GatewayError> {
        let mapped = self
            .run("oauth_map_read", || {
                let store = self.store.clone();
                let key = Self::map_key(provider, external_id);
                async move { store.get(&key).await }
            })
            .await?;
        let mapped = match mapped {
            Some(value) if !value.starts_with(PENDING_PREFIX) => value,
            _ => return Ok(None),
        };
        let identity_id = mapped
            .parse::<Uuid>()
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!(e)))?;
        let identity = self
            .directory
            .find_by_id(identity_id)
            .await
            .map_err(GatewayError::Internal)?
            .ok_or_else(|| {
                GatewayError::Internal(anyhow::anyhow!(
                    "provider mapping points at missing identity {}",
                    identity_id
                ))
            })?;
        Ok(Some(identity))
    }

    async fn write_reverse_index(
        &self,
        identity_id: Uuid,
        provider: OAuthProvider,
        external_id: &str,
    ) -> Result<(), GatewayError> {
        // Bookkeeping for unlink and status: which external id this
        // account's provider link points back at.
        let link = OAuthIdentity::new(provider, external_id.to_string(), identity_id);
        let payload =
            serde_json::to_string(&link).map_err(|e| GatewayError::Internal(anyhow::anyhow!(e)))?;
        self.run("oauth_reverse_write", || {
            let store = self.store.clone();
            let key = Self::reverse_key(identity_id, provider);
            let payload = payload.clone();
            async move { store.set_with_expiry(&key, &payload, 0).await }
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
