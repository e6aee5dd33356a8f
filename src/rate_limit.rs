//! Fixed-bucket rate limiting (SPEC_FULL.md S4.C), grounded in the original
//! `rate_limiter.py` middleware.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::warn;

use crate::{Error, Result};

/// Safety-margin multiplier applied to bucket TTLs so a counter outlives its window.
const EXPIRY_SAFETY_MULTIPLIER: u64 = 2;

/// Per-route or per-identifier rate limit pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPair {
    pub per_minute: u32,
    pub per_hour: u32,
}

impl RateLimitPair {
    pub fn new(per_minute: u32, per_hour: u32) -> Self {
        Self { per_minute, per_hour }
    }
}

/// Outcome of a [`check`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub minute_count: u64,
    pub minute_limit: u32,
    pub minute_remaining: u64,
    pub hour_count: u64,
    pub hour_limit: u32,
    pub hour_remaining: u64,
}

/// Backing counter store for the rate limiter.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<u64>;
    async fn incr_with_expiry(&self, key: &str, expiry_secs: u64) -> Result<u64>;
    async fn delete(&self, keys: &[String]) -> Result<()>;
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn minute_key(identifier: &str) -> String {
    format!("ratelimit:minute:{identifier}:{}", now_secs() / 60)
}

fn hour_key(identifier: &str) -> String {
    format!("ratelimit:hour:{identifier}:{}", now_secs() / 3600)
}

/// Redis-backed [`RateLimitStore`].
pub struct RedisRateLimitStore {
    client: redis::Client,
}

impl RedisRateLimitStore {
    pub fn new(redis_url: &str) -> Result<Self> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
        })
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn get(&self, key: &str) -> Result<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let value: Option<u64> = conn.get(key).await?;
        Ok(value.unwrap_or(0))
    }

    async fn incr_with_expiry(&self, key: &str, expiry_secs: u64) -> Result<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let count: u64 = conn.incr(key, 1u64).await?;
        if count == 1 {
            let _: () = conn.expire(key, expiry_secs as i64).await?;
        }
        Ok(count)
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.del(keys).await?;
        Ok(())
    }
}

/// In-process [`RateLimitStore`] for tests, keyed identically to the Redis store so the
/// identifier/key derivation logic is exercised the same way.
#[derive(Default)]
pub struct InMemoryRateLimitStore {
    counters: tokio::sync::Mutex<std::collections::HashMap<String, u64>>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn get(&self, key: &str) -> Result<u64> {
        Ok(*self.counters.lock().await.get(key).unwrap_or(&0))
    }

    async fn incr_with_expiry(&self, key: &str, _expiry_secs: u64) -> Result<u64> {
        let mut counters = self.counters.lock().await;
        let entry = counters.entry(key.to_string()).or_insert(0);
        *entry += 1;
        Ok(*entry)
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        let mut counters = self.counters.lock().await;
        for key in keys {
            counters.remove(key);
        }
        Ok(())
    }
}

/// Rate limiter over a pluggable [`RateLimitStore`].
pub struct RateLimiter {
    store: Box<dyn RateLimitStore>,
    default_limits: RateLimitPair,
}

impl RateLimiter {
    pub fn new(store: Box<dyn RateLimitStore>, default_limits: RateLimitPair) -> Self {
        Self { store, default_limits }
    }

    /// Check (and optionally increment) the rate-limit counters for `identifier` against
    /// `limits`, or the limiter's configured defaults if `limits` is `None`.
    pub async fn check(
        &self,
        identifier: &str,
        increment: bool,
        limits: Option<RateLimitPair>,
    ) -> Result<RateLimitStatus> {
        let limits = limits.unwrap_or(self.default_limits);
        let minute_key = minute_key(identifier);
        let hour_key = hour_key(identifier);

        let mut minute_count = self.store.get(&minute_key).await?;
        let mut hour_count = self.store.get(&hour_key).await?;

        if minute_count >= limits.per_minute as u64 {
            let retry_after = 60 - (now_secs() % 60);
            warn!(identifier, minute_count, limit = limits.per_minute, "rate limit exceeded (minute)");
            return Err(Error::rate_limited(retry_after));
        }

        if hour_count >= limits.per_hour as u64 {
            let retry_after = (60 - (now_secs() / 60) % 60) * 60;
            warn!(identifier, hour_count, limit = limits.per_hour, "rate limit exceeded (hour)");
            return Err(Error::rate_limited(retry_after));
        }

        if increment {
            minute_count = self
                .store
                .incr_with_expiry(&minute_key, 120 * EXPIRY_SAFETY_MULTIPLIER / 2)
                .await?;
            hour_count = self
                .store
                .incr_with_expiry(&hour_key, 7200 * EXPIRY_SAFETY_MULTIPLIER / 2)
                .await?;
        }

        Ok(RateLimitStatus {
            minute_count,
            minute_limit: limits.per_minute,
            minute_remaining: (limits.per_minute as u64).saturating_sub(minute_count),
            hour_count,
            hour_limit: limits.per_hour,
            hour_remaining: (limits.per_hour as u64).saturating_sub(hour_count),
        })
    }

    /// Derive the rate-limit identifier from a user id, falling back to the client IP.
    pub fn identifier_for(user_id: Option<&str>, client_ip: Option<&str>) -> String {
        match user_id {
            Some(id) => format!("user:{id}"),
            None => format!("ip:{}", client_ip.unwrap_or("unknown")),
        }
    }

    pub async fn reset(&self, identifier: &str) -> Result<()> {
        self.store
            .delete(&[minute_key(identifier), hour_key(identifier)])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(per_minute: u32, per_hour: u32) -> RateLimiter {
        RateLimiter::new(Box::new(InMemoryRateLimitStore::new()), RateLimitPair::new(per_minute, per_hour))
    }

    #[tokio::test]
    async fn test_requests_within_limit_are_allowed() {
        let rl = limiter(5, 100);
        for _ in 0..5 {
            assert!(rl.check("user:1", true, None).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_minute_limit_exceeded() {
        let rl = limiter(2, 100);
        assert!(rl.check("user:1", true, None).await.is_ok());
        assert!(rl.check("user:1", true, None).await.is_ok());
        let result = rl.check("user:1", true, None).await;
        assert!(matches!(result, Err(Error::RateLimited { .. })));
    }

    #[tokio::test]
    async fn test_identifiers_are_independent() {
        let rl = limiter(1, 100);
        assert!(rl.check("user:1", true, None).await.is_ok());
        assert!(rl.check("user:2", true, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_non_incrementing_check_does_not_consume_budget() {
        let rl = limiter(1, 100);
        assert!(rl.check("user:1", false, None).await.is_ok());
        assert!(rl.check("user:1", false, None).await.is_ok());
        assert!(rl.check("user:1", true, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_per_call_override_limits() {
        let rl = limiter(100, 1000);
        let strict = RateLimitPair::new(1, 1000);
        assert!(rl.check("user:1", true, Some(strict)).await.is_ok());
        assert!(rl.check("user:1", true, Some(strict)).await.is_err());
    }

    #[tokio::test]
    async fn test_reset_clears_counters() {
        let rl = limiter(1, 100);
        assert!(rl.check("user:1", true, None).await.is_ok());
        assert!(rl.check("user:1", true, None).await.is_err());

        rl.reset("user:1").await.unwrap();
        assert!(rl.check("user:1", true, None).await.is_ok());
    }

    #[test]
    fn test_identifier_for_prefers_user_id() {
        assert_eq!(RateLimiter::identifier_for(Some("42"), Some("1.2.3.4")), "user:42");
        assert_eq!(RateLimiter::identifier_for(None, Some("1.2.3.4")), "ip:1.2.3.4");
        assert_eq!(RateLimiter::identifier_for(None, None), "ip:unknown");
    }
}
