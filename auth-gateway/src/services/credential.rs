//! Password verification seam.

use async_trait::async_trait;

use crate::utils::password::{verify_password, Password, PasswordHashString};

/// A throwaway Argon2id hash verified against when the account does not
/// exist or has no password, so unknown emails cost the same as wrong
/// passwords.
pub const DUMMY_HASH: &str =
    "$argon2id$v=19$m=19456,t=2,p=1$gZiV/M1gPc22ElAH/Jh1Hw$CWOrkoo7oJBQ/45WwZrmdYqK5RjfyUVPYTvhC1LZb2c";

#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, password: &Password, hash: &PasswordHashString) -> bool;
}

/// Argon2id verifier. Hashing is CPU-bound, so it runs on the blocking
/// pool rather than stalling the async runtime.
pub struct Argon2Verifier;

#[async_trait]
impl CredentialVerifier for Argon2Verifier {
    async fn verify(&self, password: &Password, hash: &PasswordHashString) -> bool {
        let password = password.clone();
        let hash = hash.clone();
        tokio::task::spawn_blocking(move || verify_password(&password, &hash).is_ok())
            .await
            .unwrap_or(false)
    }
}
