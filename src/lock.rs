//! Distributed per-resource locking (SPEC_FULL.md S4.B), grounded in the Redis
//! distributed-lock pattern from the reference gateway lock service and in the original
//! `distributed_lock.py` utility.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand::Rng;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::{Error, Result};

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;
const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("EXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Opaque lock ownership token in `<random128>:<unix_seconds>` form.
fn new_token() -> String {
    let random: u128 = rand::thread_rng().gen();
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("{random:032x}:{now}")
}

/// Point-in-time info about a held or formerly-held lock.
#[derive(Debug, Clone, PartialEq)]
pub struct LockInfo {
    pub token: String,
    pub ttl: Duration,
}

/// Backing store for distributed locks. Implementations must make `release`/`extend`
/// atomic check-and-act operations keyed on the caller's token.
#[async_trait]
pub trait LockStore: Send + Sync {
    async fn try_acquire(&self, resource: &str, ttl: Duration) -> Result<Option<String>>;
    async fn release(&self, resource: &str, token: &str) -> Result<bool>;
    async fn extend(&self, resource: &str, token: &str, ttl: Duration) -> Result<bool>;
    async fn locked(&self, resource: &str) -> Result<bool>;
    async fn info(&self, resource: &str) -> Result<Option<LockInfo>>;
}

/// Redis-backed [`LockStore`]: `SET NX EX` to acquire, Lua scripts for atomic
/// check-and-delete / check-and-extend.
pub struct RedisLockStore {
    client: redis::Client,
}

impl RedisLockStore {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    fn key(resource: &str) -> String {
        format!("lock:{resource}")
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn try_acquire(&self, resource: &str, ttl: Duration) -> Result<Option<String>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let token = new_token();
        let key = Self::key(resource);

        let result: Option<String> = conn
            .set_options(
                &key,
                &token,
                redis::SetOptions::default()
                    .conditional_set(redis::ExistenceCheck::NX)
                    .with_expiration(redis::SetExpiry::EX(ttl.as_secs().max(1) as usize)),
            )
            .await?;

        Ok(result.map(|_| token))
    }

    async fn release(&self, resource: &str, token: &str) -> Result<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = Self::key(resource);
        let result: i32 = redis::Script::new(RELEASE_SCRIPT)
            .key(&key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(result == 1)
    }

    async fn extend(&self, resource: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = Self::key(resource);
        let result: i32 = redis::Script::new(EXTEND_SCRIPT)
            .key(&key)
            .arg(token)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(result == 1)
    }

    async fn locked(&self, resource: &str) -> Result<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = Self::key(resource);
        let exists: bool = conn.exists(&key).await?;
        Ok(exists)
    }

    async fn info(&self, resource: &str) -> Result<Option<LockInfo>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = Self::key(resource);
        let token: Option<String> = conn.get(&key).await?;
        let Some(token) = token else { return Ok(None) };
        let ttl_seconds: i64 = conn.ttl(&key).await?;
        let ttl = Duration::from_secs(ttl_seconds.max(0) as u64);
        Ok(Some(LockInfo { token, ttl }))
    }
}

struct Entry {
    token: String,
    expires_at: std::time::Instant,
}

/// In-memory fake [`LockStore`] backed by a mutex-guarded map, for tests that don't want
/// a real Redis dependency.
#[derive(Default)]
pub struct InMemoryLockStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn try_acquire(&self, resource: &str, ttl: Duration) -> Result<Option<String>> {
        let mut entries = self.entries.lock().await;
        let now = std::time::Instant::now();

        if let Some(existing) = entries.get(resource) {
            if existing.expires_at > now {
                return Ok(None);
            }
        }

        let token = new_token();
        entries.insert(
            resource.to_string(),
            Entry {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(Some(token))
    }

    async fn release(&self, resource: &str, token: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        match entries.get(resource) {
            Some(entry) if entry.token == token => {
                entries.remove(resource);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend(&self, resource: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(resource) {
            Some(entry) if entry.token == token => {
                entry.expires_at = std::time::Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn locked(&self, resource: &str) -> Result<bool> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(resource)
            .is_some_and(|e| e.expires_at > std::time::Instant::now()))
    }

    async fn info(&self, resource: &str) -> Result<Option<LockInfo>> {
        let entries = self.entries.lock().await;
        Ok(entries.get(resource).map(|e| LockInfo {
            token: e.token.clone(),
            ttl: e
                .expires_at
                .saturating_duration_since(std::time::Instant::now()),
        }))
    }
}

/// Acquire `resource` against `store`, retrying at a fixed interval while `blocking` and
/// `timeout` has not elapsed. Returns `Error::LockTimeout` when acquisition fails.
pub async fn acquire(
    store: &dyn LockStore,
    resource: &str,
    ttl: Duration,
    blocking: bool,
    timeout: Duration,
) -> Result<String> {
    let deadline = std::time::Instant::now() + timeout;

    loop {
        if let Some(token) = store.try_acquire(resource, ttl).await? {
            return Ok(token);
        }

        if !blocking || std::time::Instant::now() >= deadline {
            return Err(Error::lock_timeout(resource));
        }

        tokio::time::sleep(DEFAULT_RETRY_INTERVAL).await;
    }
}

/// Run `f` while holding `resource`, releasing the lock (and logging, not raising, on
/// release failure) whether or not `f` succeeds.
pub async fn with_lock<F, Fut, T>(
    store: Arc<dyn LockStore>,
    resource: &str,
    ttl: Duration,
    timeout: Duration,
    f: F,
) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let token = acquire(store.as_ref(), resource, ttl, true, timeout).await?;
    debug!(resource, "lock acquired");

    let result = f().await;

    match store.release(resource, &token).await {
        Ok(true) => debug!(resource, "lock released"),
        Ok(false) => warn!(resource, "lock release was a no-op (already expired or stolen)"),
        Err(err) => error!(resource, error = %err, "lock release failed"),
    }

    result
}

/// Thread-state mutual exclusion: `thread_id` maps to `conversation:<thread_id>`, with a
/// 60s ttl and 10s acquisition timeout, matching the contract in SPEC_FULL.md S4.B.
pub struct ConversationLock {
    store: Arc<dyn LockStore>,
}

impl ConversationLock {
    pub const TTL: Duration = Duration::from_secs(60);
    pub const TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self { store }
    }

    fn resource(thread_id: &str) -> String {
        format!("conversation:{thread_id}")
    }

    pub async fn with_lock<F, Fut, T>(&self, thread_id: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        with_lock(self.store.clone(), &Self::resource(thread_id), Self::TTL, Self::TIMEOUT, f).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_release_roundtrip() {
        let store = InMemoryLockStore::new();
        let token = store.try_acquire("r1", Duration::from_secs(10)).await.unwrap().unwrap();
        assert!(store.locked("r1").await.unwrap());

        let released = store.release("r1", &token).await.unwrap();
        assert!(released);
        assert!(!store.locked("r1").await.unwrap());
    }

    #[tokio::test]
    async fn test_second_acquire_fails_while_held() {
        let store = InMemoryLockStore::new();
        let _token = store.try_acquire("r1", Duration::from_secs(10)).await.unwrap().unwrap();
        let second = store.try_acquire("r1", Duration::from_secs(10)).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_release_with_wrong_token_fails() {
        let store = InMemoryLockStore::new();
        let _token = store.try_acquire("r1", Duration::from_secs(10)).await.unwrap().unwrap();
        let released = store.release("r1", "not-the-real-token").await.unwrap();
        assert!(!released);
        assert!(store.locked("r1").await.unwrap());
    }

    #[tokio::test]
    async fn test_extend_requires_matching_token() {
        let store = InMemoryLockStore::new();
        let token = store.try_acquire("r1", Duration::from_millis(50)).await.unwrap().unwrap();
        assert!(store.extend("r1", &token, Duration::from_secs(5)).await.unwrap());
        assert!(!store.extend("r1", "wrong", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_blocking_times_out() {
        let store = InMemoryLockStore::new();
        let _token = store.try_acquire("busy", Duration::from_secs(5)).await.unwrap().unwrap();

        let result = acquire(
            &store,
            "busy",
            Duration::from_secs(5),
            true,
            Duration::from_millis(150),
        )
        .await;

        assert!(matches!(result, Err(Error::LockTimeout { .. })));
    }

    #[tokio::test]
    async fn test_acquire_non_blocking_fails_immediately() {
        let store = InMemoryLockStore::new();
        let _token = store.try_acquire("busy", Duration::from_secs(5)).await.unwrap().unwrap();

        let result = acquire(&store, "busy", Duration::from_secs(5), false, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(Error::LockTimeout { .. })));
    }

    #[tokio::test]
    async fn test_with_lock_releases_even_on_failure() {
        let store = InMemoryLockStore::new();
        let store: Arc<dyn LockStore> = Arc::new(store);

        let result: Result<()> = with_lock(store.clone(), "r1", Duration::from_secs(5), Duration::from_secs(1), || async {
            Err(Error::internal("boom"))
        })
        .await;

        assert!(result.is_err());
        assert!(!store.locked("r1").await.unwrap());
    }

    #[tokio::test]
    async fn test_conversation_lock_serializes_access() {
        let store: Arc<dyn LockStore> = Arc::new(InMemoryLockStore::new());
        let lock = ConversationLock::new(store);

        let result = lock.with_lock("thread-1", || async { Ok::<_, Error>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn test_token_format() {
        let token = new_token();
        let parts: Vec<_> = token.split(':').collect();
        assert_eq!(parts.len(), 2);
        assert!(parts[1].parse::<u64>().is_ok());
    }
}
