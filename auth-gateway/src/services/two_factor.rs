//! Second factor: TOTP verification and single-use backup codes.
//!
//! A verified TOTP code consumes its time step: a marker keyed on the
//! step is written with set-if-absent, so the same code cannot pass
//! twice inside the skew window. Backup codes live in one store document
//! and are consumed through compare-and-swap.

use std::sync::Arc;

use base64::Engine;
use chrono::Utc;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use totp_rs::{Algorithm, Secret, TOTP};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{StoreConfig, TotpConfig};
use crate::models::{BackupCodeSet, BackupCodeStatus, TotpSecret};
use crate::services::error::GatewayError;
use crate::services::store::{with_policy, AuthStore, CasOutcome};

const CAS_RETRY_LIMIT: usize = 4;

pub struct TwoFactorEngine {
    store: Arc<dyn AuthStore>,
    config: TotpConfig,
    store_config: StoreConfig,
    issuer: String,
}

impl TwoFactorEngine {
    pub fn new(
        store: Arc<dyn AuthStore>,
        config: TotpConfig,
        store_config: StoreConfig,
        issuer: String,
    ) -> Self {
        Self {
            store,
            config,
            store_config,
            issuer,
        }
    }

    fn secret_key(identity_id: Uuid) -> String {
        format!("totp:secret:{}", identity_id)
    }

    fn used_step_key(identity_id: Uuid, step: u64) -> String {
        format!("totp:used:{}:{}", identity_id, step)
    }

    fn backup_key(identity_id: Uuid) -> String {
        format!("totp:backup:{}", identity_id)
    }

    /// Generate and persist a fresh TOTP secret. The plaintext secret and
    /// provisioning URI are returned to the caller exactly once.
    pub async fn provision(
        &self,
        identity_id: Uuid,
        account_label: &str,
    ) -> Result<TotpSecret, GatewayError> {
        let mut raw = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut raw);
        let secret = Secret::Raw(raw.to_vec());
        let secret_base32 = secret.to_encoded().to_string();

        let totp = self.build_totp(&secret_base32, account_label)?;
        let provisioning_uri = totp.get_url();

        self.run("totp_secret_set", || {
            let store = self.store.clone();
            let key = Self::secret_key(identity_id);
            let value = secret_base32.clone();
            async move { store.set_with_expiry(&key, &value, 0).await }
        })
        .await?;

        info!(identity_id = %identity_id, "totp secret provisioned");
        Ok(TotpSecret {
            secret_base32,
            provisioning_uri,
            created_utc: Utc::now(),
        })
    }

    /// Verify a TOTP code and consume its time step. Returns an error for
    /// wrong codes, unknown enrollments, and same-step replays alike.
    pub async fn verify_totp(&self, identity_id: Uuid, code: &str) -> Result<(), GatewayError> {
        let step = match self.check_code(identity_id, code).await? {
            Some(step) => step,
            None => return Err(GatewayError::InvalidTwoFactorCode),
        };
        if !self.consume_step(identity_id, step).await? {
            debug!(identity_id = %identity_id, step, "totp step already consumed");
            return Err(GatewayError::InvalidTwoFactorCode);
        }
        Ok(())
    }

    /// Check a code without consuming it. Returns the matched time step.
    pub async fn check_code(
        &self,
        identity_id: Uuid,
        code: &str,
    ) -> Result<Option<u64>, GatewayError> {
        let secret_base32 = self
            .run("totp_secret_read", || {
                let store = self.store.clone();
                let key = Self::secret_key(identity_id);
                async move { store.get(&key).await }
            })
            .await?;
        let secret_base32 = match secret_base32 {
            Some(value) => value,
            None => return Ok(None),
        };

        let totp = self.build_totp(&secret_base32, "verify")?;
        let now = Utc::now().timestamp() as u64;
        let period = self.config.period_secs;
        let skew = self.config.skew_steps as i64;

        for offset in -skew..=skew {
            let at = now as i64 + offset * period as i64;
            if at < 0 {
                continue;
            }
            let expected = totp
                .generate(at as u64);
            if constant_time_eq(code, &expected) {
                return Ok(Some(at as u64 / period));
            }
        }
        Ok(None)
    }

    /// Mark a time step consumed. Returns false when another verification
    /// already claimed it.
    pub async fn consume_step(&self, identity_id: Uuid, step: u64) -> Result<bool, GatewayError> {
        // The marker only needs to outlive the skew window around its step.
        let ttl = self.config.period_secs as i64 * (2 * self.config.skew_steps as i64 + 1);
        self.run("totp_step_consume", || {
            let store = self.store.clone();
            let key = Self::used_step_key(identity_id, step);
            async move { store.set_if_absent(&key, "used", ttl).await }
        })
        .await
    }

    pub async fn is_enrolled(&self, identity_id: Uuid) -> Result<bool, GatewayError> {
        let secret = self
            .run("totp_secret_read", || {
                let store = self.store.clone();
                let key = Self::secret_key(identity_id);
                async move { store.get(&key).await }
            })
            .await?;
        Ok(secret.is_some())
    }

    /// Regenerate the full backup-code set, invalidating all previous
    /// codes in one write. Returns the plaintext codes, shown once.
    pub async fn generate_backup_codes(
        &self,
        identity_id: Uuid,
    ) -> Result<Vec<String>, GatewayError> {
        let mut codes = Vec::with_capacity(self.config.backup_code_count);
        let mut rng = rand::thread_rng();
        for _ in 0..self.config.backup_code_count {
            let mut raw = [0u8; 5];
            rng.fill_bytes(&mut raw);
            codes.push(hex::encode(raw));
        }

        let hashes: Vec<String> = codes.iter().map(|c| hash_code(c)).collect();
        let set = BackupCodeSet::new(hashes);
        let payload =
            serde_json::to_string(&set).map_err(|e| GatewayError::Internal(anyhow::anyhow!(e)))?;

        self.run("backup_codes_set", || {
            let store = self.store.clone();
            let key = Self::backup_key(identity_id);
            let payload = payload.clone();
            async move { store.set_with_expiry(&key, &payload, 0).await }
        })
        .await?;

        info!(identity_id = %identity_id, count = codes.len(), "backup codes regenerated");
        Ok(codes)
    }

    /// Report what presenting `code` would do, without consuming it.
    pub async fn check_backup_code(
        &self,
        identity_id: Uuid,
        code: &str,
    ) -> Result<BackupCodeStatus, GatewayError> {
        let set = match self.load_backup_set(identity_id).await? {
            Some((set, _)) => set,
            None => return Ok(BackupCodeStatus::Unknown),
        };
        Ok(set.status_of(&hash_code(code)))
    }

    /// Consume a backup code. The swap retries a few times when a
    /// concurrent consumption moves the document underneath us.
    pub async fn consume_backup_code(
        &self,
        identity_id: Uuid,
        code: &str,
    ) -> Result<BackupCodeStatus, GatewayError> {
        let hash = hash_code(code);
        for _ in 0..CAS_RETRY_LIMIT {
            let (mut set, raw) = match self.load_backup_set(identity_id).await? {
                Some(loaded) => loaded,
                None => return Ok(BackupCodeStatus::Unknown),
            };
            let status = set.consume(&hash);
            if status != BackupCodeStatus::Accepted {
                return Ok(status);
            }
            let updated = serde_json::to_string(&set)
                .map_err(|e| GatewayError::Internal(anyhow::anyhow!(e)))?;
            let outcome = self
                .run("backup_codes_swap", || {
                    let store = self.store.clone();
                    let key = Self::backup_key(identity_id);
                    let raw = raw.clone();
                    let updated = updated.clone();
                    async move { store.compare_and_swap(&key, &raw, &updated, 0).await }
                })
                .await?;
            match outcome {
                CasOutcome::Swapped => return Ok(BackupCodeStatus::Accepted),
                CasOutcome::Mismatch(_) => continue,
            }
        }
        Err(GatewayError::Internal(anyhow::anyhow!(
            "backup code swap contention for identity {}",
            identity_id
        )))
    }

    async fn load_backup_set(
        &self,
        identity_id: Uuid,
    ) -> Result<Option<(BackupCodeSet, String)>, GatewayError> {
        let raw = self
            .run("backup_codes_read", || {
                let store = self.store.clone();
                let key = Self::backup_key(identity_id);
                async move { store.get(&key).await }
            })
            .await?;
        match raw {
            Some(raw) => {
                let set: BackupCodeSet = serde_json::from_str(&raw)
                    .map_err(|e| GatewayError::Internal(anyhow::anyhow!(e)))?;
                Ok(Some((set, raw)))
            }
            None => Ok(None),
        }
    }

    fn build_totp(&self, secret_base32: &str, account: &str) -> Result<TOTP, GatewayError> {
        let secret = Secret::Encoded(secret_base32.to_string())
            .to_bytes()
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("bad totp secret: {:?}", e)))?;
        TOTP::new(
            Algorithm::SHA1,
            self.config.digits,
            self.config.skew_steps,
            self.config.period_secs,
            secret,
            Some(self.issuer.clone()),
            account.to_string(),
        )
        .map_err(|e| GatewayError::Internal(anyhow::anyhow!("totp construction failed: {}", e)))
    }

    async fn run<T, F, Fut>(&self, op_name: &str, op: F) -> Result<T, GatewayError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, anyhow::Error>>,
    {
        with_policy(&self.store_config, op_name, op).await
    }
}

fn hash_code(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.trim().as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::services::store::MemoryStore;

    fn engine() -> TwoFactorEngine {
        let defaults = GatewayConfig::default();
        TwoFactorEngine::new(
            Arc::new(MemoryStore::new()),
            defaults.totp,
            defaults.store,
            defaults.issuer,
        )
    }

    fn current_code(engine: &TwoFactorEngine, secret: &TotpSecret) -> String {
        let totp = engine.build_totp(&secret.secret_base32, "test").unwrap();
        totp.generate(Utc::now().timestamp() as u64)
    }

    #[tokio::test]
    async fn provision_produces_usable_secret() {
        let engine = engine();
        let id = Uuid::new_v4();
        let secret = engine.provision(id, "alice@example.com").await.unwrap();

        assert!(secret.provisioning_uri.starts_with("otpauth://totp/"));
        assert!(engine.is_enrolled(id).await.unwrap());

        let code = current_code(&engine, &secret);
        engine.verify_totp(id, &code).await.unwrap();
    }

    #[tokio::test]
    async fn same_step_code_cannot_pass_twice() {
        let engine = engine();
        let id = Uuid::new_v4();
        let secret = engine.provision(id, "alice@example.com").await.unwrap();
        let code = current_code(&engine, &secret);

        engine.verify_totp(id, &code).await.unwrap();
        assert!(matches!(
            engine.verify_totp(id, &code).await,
            Err(GatewayError::InvalidTwoFactorCode)
        ));
    }

    #[tokio::test]
    async fn skewed_code_within_tolerance_passes() {
        let engine = engine();
        let id = Uuid::new_v4();
        let secret = engine.provision(id, "alice@example.com").await.unwrap();

        let totp = engine.build_totp(&secret.secret_base32, "test").unwrap();
        let previous_step_code =
            totp.generate(Utc::now().timestamp() as u64 - engine.config.period_secs);
        engine.verify_totp(id, &previous_step_code).await.unwrap();
    }

    #[tokio::test]
    async fn wrong_code_rejected() {
        let engine = engine();
        let id = Uuid::new_v4();
        engine.provision(id, "alice@example.com").await.unwrap();
        assert!(matches!(
            engine.verify_totp(id, "000000").await,
            Err(GatewayError::InvalidTwoFactorCode)
        ));
    }

    #[tokio::test]
    async fn unenrolled_identity_rejected() {
        let engine = engine();
        assert!(matches!(
            engine.verify_totp(Uuid::new_v4(), "123456").await,
            Err(GatewayError::InvalidTwoFactorCode)
        ));
    }

    #[tokio::test]
    async fn backup_code_single_use() {
        let engine = engine();
        let id = Uuid::new_v4();
        let codes = engine.generate_backup_codes(id).await.unwrap();
        assert_eq!(codes.len(), engine.config.backup_code_count);

        assert_eq!(
            engine.consume_backup_code(id, &codes[0]).await.unwrap(),
            BackupCodeStatus::Accepted
        );
        assert_eq!(
            engine.consume_backup_code(id, &codes[0]).await.unwrap(),
            BackupCodeStatus::AlreadyUsed
        );
        assert_eq!(
            engine.consume_backup_code(id, "not-a-code").await.unwrap(),
            BackupCodeStatus::Unknown
        );
    }

    #[tokio::test]
    async fn regeneration_invalidates_previous_codes() {
        let engine = engine();
        let id = Uuid::new_v4();
        let old = engine.generate_backup_codes(id).await.unwrap();
        let new = engine.generate_backup_codes(id).await.unwrap();

        assert_eq!(
            engine.consume_backup_code(id, &old[0]).await.unwrap(),
            BackupCodeStatus::Unknown
        );
        assert_eq!(
            engine.consume_backup_code(id, &new[0]).await.unwrap(),
            BackupCodeStatus::Accepted
        );
    }

    #[tokio::test]
    async fn concurrent_consumption_accepts_each_code_once() {
        let engine = std::sync::Arc::new(engine());
        let id = Uuid::new_v4();
        let codes = engine.generate_backup_codes(id).await.unwrap();
        let code = codes[0].clone();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let engine = engine.clone();
            let code = code.clone();
            handles.push(tokio::spawn(async move {
                engine.consume_backup_code(id, &code).await.unwrap()
            }));
        }
        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap() == BackupCodeStatus::Accepted {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
    }
}
