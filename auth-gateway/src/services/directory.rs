//! Identity directory seam.
//!
//! The user store lives outside this crate; the gateway only needs
//! lookup and first-login creation. Deployments implement this trait
//! over whatever holds their accounts.

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::models::Identity;

#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<Identity>, anyhow::Error>;

    async fn find_by_id(&self, identity_id: Uuid) -> Result<Option<Identity>, anyhow::Error>;

    /// Create a fresh identity, as on a first external-provider login.
    async fn create_identity(
        &self,
        email: &str,
        email_verified: bool,
    ) -> Result<Identity, anyhow::Error>;
}

/// In-memory directory for tests and single-node use.
#[derive(Default)]
pub struct MemoryDirectory {
    by_id: DashMap<Uuid, Identity>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pre-built account and return it.
    pub fn seed(
        &self,
        email: &str,
        password_hash: Option<String>,
        email_verified: bool,
        two_factor_enabled: bool,
    ) -> Identity {
        let identity = Identity {
            identity_id: Uuid::new_v4(),
            email: email.to_lowercase(),
            password_hash,
            email_verified,
            two_factor_enabled,
            capabilities: Vec::new(),
        };
        self.by_id.insert(identity.identity_id, identity.clone());
        identity
    }

    pub fn set_capabilities(&self, identity_id: Uuid, capabilities: Vec<String>) {
        if let Some(mut identity) = self.by_id.get_mut(&identity_id) {
            identity.capabilities = capabilities;
        }
    }

    pub fn set_two_factor(&self, identity_id: Uuid, enabled: bool) {
        if let Some(mut identity) = self.by_id.get_mut(&identity_id) {
            identity.two_factor_enabled = enabled;
        }
    }
}

#[async_trait]
impl IdentityDirectory for MemoryDirectory {
    async fn find_by_email(&self, email: &str) -> Result<Option<Identity>, anyhow::Error> {
        let needle = email.to_lowercase();
        Ok(self
            .by_id
            .iter()
            .find(|entry| entry.value().email == needle)
            .map(|entry| entry.value().clone()))
    }

    async fn find_by_id(&self, identity_id: Uuid) -> Result<Option<Identity>, anyhow::Error> {
        Ok(self
            .by_id
            .get(&identity_id)
            .map(|entry| entry.value().clone()))
    }

    async fn create_identity(
        &self,
        email: &str,
        email_verified: bool,
    ) -> Result<Identity, anyhow::Error> {
        if self.find_by_email(email).await?.is_some() {
            return Err(anyhow::anyhow!("email already registered: {}", email));
        }
        let identity = Identity::external(email.to_lowercase(), email_verified);
        self.by_id.insert(identity.identity_id, identity.clone());
        Ok(identity)
    }
}
