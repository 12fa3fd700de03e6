//! Backing store abstraction.
//!
//! Every stateful component goes through [`AuthStore`]. `RedisStore` is the
//! production implementation; `MemoryStore` backs tests and single-node
//! deployments. Both must honor the same atomicity contract: increment,
//! set-if-absent and compare-and-swap are single indivisible operations.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::Script;
use std::future::Future;
use tracing::warn;

use crate::config::StoreConfig;
use crate::services::error::GatewayError;

/// Result of a compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    Swapped,
    /// The key held a different value (or no value) than expected. Carries
    /// the observed value so callers can distinguish "gone" from "taken
    /// by someone else".
    Mismatch(Option<String>),
}

/// Minimal key-value contract the gateway needs from its backing store.
///
/// TTL semantics: `ttl_secs <= 0` means no expiry.
#[async_trait]
pub trait AuthStore: Send + Sync {
    /// Atomically increment a counter, setting `ttl_secs` on first
    /// creation only. Returns the post-increment value.
    async fn incr_with_expiry(&self, key: &str, ttl_secs: i64) -> Result<i64, anyhow::Error>;

    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error>;

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl_secs: i64,
    ) -> Result<(), anyhow::Error>;

    /// Set `key` to `value` only if it does not exist. Returns true when
    /// this call created the key.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_secs: i64,
    ) -> Result<bool, anyhow::Error>;

    /// Replace the value at `key` with `new` only if it currently equals
    /// `expected`. The swap keeps the existing TTL untouched on mismatch
    /// and applies `ttl_secs` on success.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        ttl_secs: i64,
    ) -> Result<CasOutcome, anyhow::Error>;

    async fn delete(&self, key: &str) -> Result<(), anyhow::Error>;

    async fn health_check(&self) -> Result<(), anyhow::Error>;
}

/// Run a store operation under the configured timeout, retrying once on
/// failure. Exhausted attempts surface as `BackingStoreUnavailable`.
pub(crate) async fn with_policy<T, F, Fut>(
    store_config: &StoreConfig,
    op_name: &str,
    op: F,
) -> Result<T, GatewayError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, anyhow::Error>>,
{
    let timeout = std::time::Duration::from_millis(store_config.op_timeout_ms);
    match tokio::time::timeout(timeout, op()).await {
        Ok(Ok(value)) => return Ok(value),
        Ok(Err(e)) => {
            warn!(operation = op_name, error = %e, "store operation failed, retrying")
        }
        Err(_) => warn!(operation = op_name, "store operation timed out, retrying"),
    }
    match tokio::time::timeout(timeout, op()).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            warn!(operation = op_name, error = %e, "store operation failed after retry");
            Err(GatewayError::BackingStoreUnavailable(e))
        }
        Err(_) => Err(GatewayError::BackingStoreUnavailable(anyhow::anyhow!(
            "operation {} timed out after {}ms",
            op_name,
            store_config.op_timeout_ms
        ))),
    }
}

// ---------------------------------------------------------------------------
// Redis implementation
// ---------------------------------------------------------------------------

/// Redis-backed store. Compound operations that Redis cannot express as a
/// single command run as Lua scripts so they stay atomic server-side.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
    incr_script: Script,
    cas_script: Script,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, anyhow::Error> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self {
            manager,
            incr_script: Script::new(
                r#"
                local n = redis.call('INCR', KEYS[1])
                if n == 1 and tonumber(ARGV[1]) > 0 then
                    redis.call('EXPIRE', KEYS[1], ARGV[1])
                end
                return n
                "#,
            ),
            cas_script: Script::new(
                r#"
                local cur = redis.call('GET', KEYS[1])
                if cur == ARGV[1] then
                    if tonumber(ARGV[3]) > 0 then
                        redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
                    else
                        redis.call('SET', KEYS[1], ARGV[2])
                    end
                    return {1, ''}
                end
                if cur == false then
                    return {0}
                end
                return {0, cur}
                "#,
            ),
        })
    }
}

#[async_trait]
impl AuthStore for RedisStore {
    async fn incr_with_expiry(&self, key: &str, ttl_secs: i64) -> Result<i64, anyhow::Error> {
        let mut conn = self.manager.clone();
        let count: i64 = self
            .incr_script
            .key(key)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        let mut conn = self.manager.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl_secs: i64,
    ) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        if ttl_secs > 0 {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl_secs)
                .query_async::<_, ()>(&mut conn)
                .await?;
        } else {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .query_async::<_, ()>(&mut conn)
                .await?;
        }
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_secs: i64,
    ) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = if ttl_secs > 0 {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("EX")
                .arg(ttl_secs)
                .query_async(&mut conn)
                .await?
        } else {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .query_async(&mut conn)
                .await?
        };
        Ok(reply.is_some())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        ttl_secs: i64,
    ) -> Result<CasOutcome, anyhow::Error> {
        let mut conn = self.manager.clone();
        let reply: Vec<redis::Value> = self
            .cas_script
            .key(key)
            .arg(expected)
            .arg(new)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        match reply.first() {
            Some(redis::Value::Int(1)) => Ok(CasOutcome::Swapped),
            Some(redis::Value::Int(0)) => {
                let current = match reply.get(1) {
                    Some(redis::Value::Data(bytes)) => {
                        Some(String::from_utf8_lossy(bytes).into_owned())
                    }
                    _ => None,
                };
                Ok(CasOutcome::Mismatch(current))
            }
            other => Err(anyhow::anyhow!("unexpected cas reply: {:?}", other)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(anyhow::anyhow!("unexpected ping reply: {}", pong))
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl MemoryEntry {
    fn new(value: String, ttl_secs: i64) -> Self {
        Self {
            value,
            expires_at: (ttl_secs > 0).then(|| Utc::now() + Duration::seconds(ttl_secs)),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.map_or(false, |at| at <= Utc::now())
    }
}

/// In-memory store with lazy expiry. DashMap's per-shard entry locking
/// makes each operation atomic with respect to concurrent callers.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, MemoryEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuthStore for MemoryStore {
    async fn incr_with_expiry(&self, key: &str, ttl_secs: i64) -> Result<i64, anyhow::Error> {
        use dashmap::mapref::entry::Entry;
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(MemoryEntry::new("1".to_string(), ttl_secs));
                    return Ok(1);
                }
                let count: i64 = occupied
                    .get()
                    .value
                    .parse()
                    .map_err(|_| anyhow::anyhow!("key {} holds a non-integer value", key))?;
                occupied.get_mut().value = (count + 1).to_string();
                Ok(count + 1)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(MemoryEntry::new("1".to_string(), ttl_secs));
                Ok(1)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.is_expired() => true,
            Some(entry) => return Ok(Some(entry.value.clone())),
            None => return Ok(None),
        };
        if expired {
            self.entries
                .remove_if(key, |_, entry| entry.is_expired());
        }
        Ok(None)
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl_secs: i64,
    ) -> Result<(), anyhow::Error> {
        self.entries
            .insert(key.to_string(), MemoryEntry::new(value.to_string(), ttl_secs));
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_secs: i64,
    ) -> Result<bool, anyhow::Error> {
        use dashmap::mapref::entry::Entry;
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(MemoryEntry::new(value.to_string(), ttl_secs));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(MemoryEntry::new(value.to_string(), ttl_secs));
                Ok(true)
            }
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        ttl_secs: i64,
    ) -> Result<CasOutcome, anyhow::Error> {
        use dashmap::mapref::entry::Entry;
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.remove();
                    return Ok(CasOutcome::Mismatch(None));
                }
                if occupied.get().value == expected {
                    occupied.insert(MemoryEntry::new(new.to_string(), ttl_secs));
                    Ok(CasOutcome::Swapped)
                } else {
                    Ok(CasOutcome::Mismatch(Some(occupied.get().value.clone())))
                }
            }
            Entry::Vacant(_) => Ok(CasOutcome::Mismatch(None)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), anyhow::Error> {
        self.entries.remove(key);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}
