//! External provider identity link.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OAuthProvider {
    Google,
    Github,
    Microsoft,
}

impl OAuthProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            OAuthProvider::Google => "google",
            OAuthProvider::Github => "github",
            OAuthProvider::Microsoft => "microsoft",
        }
    }
}

impl fmt::Display for OAuthProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OAuthProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "google" => Ok(OAuthProvider::Google),
            "github" => Ok(OAuthProvider::Github),
            "microsoft" => Ok(OAuthProvider::Microsoft),
            other => Err(format!("unknown oauth provider: {}", other)),
        }
    }
}

/// One confirmed (provider, external id) -> identity mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthIdentity {
    pub provider: OAuthProvider,
    /// Stable subject identifier issued by the provider. Opaque to us.
    pub external_id: String,
    pub identity_id: Uuid,
    pub linked_utc: DateTime<Utc>,
}

impl OAuthIdentity {
    pub fn new(provider: OAuthProvider, external_id: String, identity_id: Uuid) -> Self {
        Self {
            provider,
            external_id,
            identity_id,
            linked_utc: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_round_trips_through_str() {
        for p in [
            OAuthProvider::Google,
            OAuthProvider::Github,
            OAuthProvider::Microsoft,
        ] {
            assert_eq!(p.as_str().parse::<OAuthProvider>().unwrap(), p);
        }
    }

    #[test]
    fn unknown_provider_rejected() {
        assert!("myspace".parse::<OAuthProvider>().is_err());
    }
}
