//! Token models - claims and the issued access/refresh pair.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

/// JWT claims carried by both token types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (identity id)
    pub sub: Uuid,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Unique token id
    pub jti: Uuid,
    /// Session lineage id
    pub sid: Uuid,
    #[serde(rename = "typ")]
    pub token_type: TokenType,
    /// Capability keys resolved at issue time.
    #[serde(default)]
    pub caps: Vec<String>,
}

impl Claims {
    pub fn remaining_seconds(&self) -> i64 {
        self.exp - Utc::now().timestamp()
    }
}

/// Issued pair returned to the caller. The refresh token is single-use:
/// rotating it yields a new pair in the same session lineage.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub session_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub token_type: String,
    /// Access-token lifetime in seconds, for client back-off.
    pub expires_in: i64,
}
