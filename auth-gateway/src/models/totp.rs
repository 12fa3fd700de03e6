//! Second-factor models - TOTP secret and single-use backup codes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A provisioned TOTP secret. The plaintext secret and provisioning URI
/// are surfaced to the caller exactly once, at enrollment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TotpSecret {
    pub secret_base32: String,
    /// `otpauth://` URI for authenticator-app enrollment. Rendering it as
    /// a QR code is the caller's concern.
    pub provisioning_uri: String,
    pub created_utc: DateTime<Utc>,
}

/// Outcome of presenting a backup code. `AlreadyUsed` is kept distinct
/// from `Unknown` so audit events can name the replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupCodeStatus {
    Accepted,
    AlreadyUsed,
    Unknown,
}

/// Hashed backup codes for one identity, partitioned into unused and
/// used. Stored as a single document so regeneration and consumption are
/// single-key atomic operations on the backing store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupCodeSet {
    pub unused: Vec<String>,
    pub used: Vec<String>,
}

impl BackupCodeSet {
    pub fn new(hashes: Vec<String>) -> Self {
        Self {
            unused: hashes,
            used: Vec::new(),
        }
    }

    pub fn status_of(&self, hash: &str) -> BackupCodeStatus {
        if self.used.iter().any(|h| h == hash) {
            BackupCodeStatus::AlreadyUsed
        } else if self.unused.iter().any(|h| h == hash) {
            BackupCodeStatus::Accepted
        } else {
            BackupCodeStatus::Unknown
        }
    }

    /// Move `hash` from unused to used. Leaves the set untouched when the
    /// code is unknown or was consumed before.
    pub fn consume(&mut self, hash: &str) -> BackupCodeStatus {
        if self.used.iter().any(|h| h == hash) {
            return BackupCodeStatus::AlreadyUsed;
        }
        match self.unused.iter().position(|h| h == hash) {
            Some(pos) => {
                let taken = self.unused.remove(pos);
                self.used.push(taken);
                BackupCodeStatus::Accepted
            }
            None => BackupCodeStatus::Unknown,
        }
    }
}
