//! Identity model - the slice of the external user record the gateway needs.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A local account as seen by the gateway.
///
/// The external user store owns the full record; the gateway carries only
/// the opaque id, the credential hash reference, and the flags that gate
/// the login flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub identity_id: Uuid,
    pub email: String,
    /// `None` for accounts that authenticate through an external provider
    /// only.
    pub password_hash: Option<String>,
    pub email_verified: bool,
    pub two_factor_enabled: bool,
    /// Capability keys granted to this identity. Resolved once at token
    /// issue time and embedded in the claims.
    pub capabilities: Vec<String>,
}

impl Identity {
    /// Create an identity with no password credential, as minted on a
    /// first external-provider login.
    pub fn external(email: String, email_verified: bool) -> Self {
        Self {
            identity_id: Uuid::new_v4(),
            email,
            password_hash: None,
            email_verified,
            two_factor_enabled: false,
            capabilities: Vec::new(),
        }
    }
}
