//! Circuit breaker state machine and named registry (SPEC_FULL.md S4.D), grounded in the
//! original `circuit_breaker.py` middleware.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::info;

use crate::{Error, ErrorFamily, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Configuration for a single circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
    pub success_threshold: u32,
    /// Error families that don't count as failures (e.g. a caller's own `UserError`
    /// shouldn't trip a breaker meant to watch a dependency).
    pub excluded_exceptions: Vec<ErrorFamily>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
            success_threshold: 2,
            excluded_exceptions: Vec::new(),
        }
    }
}

struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    half_open_calls: u32,
}

/// Point-in-time statistics for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitStats {
    pub name: String,
    pub state: &'static str,
    pub failure_count: u32,
    pub success_count: u32,
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

/// A circuit breaker guarding calls to one external dependency.
///
/// `call` wraps an async operation, failing fast with `Error::CircuitOpen` while the
/// circuit is open and transitioning CLOSED -> OPEN -> HALF_OPEN -> CLOSED per the
/// failure/success thresholds in [`CircuitBreakerConfig`].
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
                half_open_calls: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn is_closed(&self) -> bool {
        self.state().await == CircuitState::Closed
    }

    pub async fn is_open(&self) -> bool {
        self.state().await == CircuitState::Open
    }

    fn transition_to(&self, inner: &mut Inner, new_state: CircuitState) {
        let old_state = inner.state;
        inner.state = new_state;

        if new_state == CircuitState::HalfOpen {
            inner.half_open_calls = 0;
            inner.success_count = 0;
        }

        info!(
            circuit = %self.name,
            from = old_state.as_str(),
            to = new_state.as_str(),
            "circuit breaker transitioned"
        );
    }

    fn should_attempt_recovery(&self, inner: &Inner) -> bool {
        if inner.state != CircuitState::Open {
            return false;
        }
        match inner.last_failure_time {
            None => true,
            Some(last) => last.elapsed() >= self.config.recovery_timeout,
        }
    }

    async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    self.transition_to(&mut inner, CircuitState::Closed);
                    inner.failure_count = 0;
                }
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.failure_count += 1;
        inner.last_failure_time = Some(Instant::now());

        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition_to(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                self.transition_to(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Execute `op` under circuit-breaker protection.
    pub async fn call<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        {
            let mut inner = self.inner.lock().await;

            if self.should_attempt_recovery(&inner) {
                self.transition_to(&mut inner, CircuitState::HalfOpen);
            }

            if inner.state == CircuitState::Open {
                let retry_after = match inner.last_failure_time {
                    Some(last) => self
                        .config
                        .recovery_timeout
                        .saturating_sub(last.elapsed())
                        .as_secs(),
                    None => self.config.recovery_timeout.as_secs(),
                };
                return Err(Error::circuit_open(self.name.clone(), retry_after));
            }

            if inner.state == CircuitState::HalfOpen {
                if inner.half_open_calls >= self.config.half_open_max_calls {
                    return Err(Error::circuit_open(self.name.clone(), 1));
                }
                inner.half_open_calls += 1;
            }
        }

        match op().await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(err) => {
                if !self.config.excluded_exceptions.contains(&err.family()) {
                    self.record_failure().await;
                }
                Err(err)
            }
        }
    }

    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        self.transition_to(&mut inner, CircuitState::Closed);
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure_time = None;
        info!(circuit = %self.name, "circuit breaker manually reset");
    }

    pub async fn stats(&self) -> CircuitStats {
        let inner = self.inner.lock().await;
        CircuitStats {
            name: self.name.clone(),
            state: inner.state.as_str(),
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            failure_threshold: self.config.failure_threshold,
            recovery_timeout: self.config.recovery_timeout,
        }
    }
}

/// Named registry of circuit breakers, one per external dependency.
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the llm/vector_store/external_api breakers with sensible defaults, mirroring
    /// the original module's pre-defined breakers.
    pub async fn with_defaults() -> Self {
        let registry = Self::new();
        registry
            .get_or_create_with_config(
                "llm",
                CircuitBreakerConfig {
                    failure_threshold: 3,
                    recovery_timeout: Duration::from_secs(60),
                    ..Default::default()
                },
            )
            .await;
        registry
            .get_or_create_with_config(
                "vector_store",
                CircuitBreakerConfig {
                    failure_threshold: 5,
                    recovery_timeout: Duration::from_secs(30),
                    ..Default::default()
                },
            )
            .await;
        registry
            .get_or_create_with_config(
                "external_api",
                CircuitBreakerConfig {
                    failure_threshold: 5,
                    recovery_timeout: Duration::from_secs(30),
                    ..Default::default()
                },
            )
            .await;
        registry
    }

    pub async fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with_config(name, CircuitBreakerConfig::default()).await
    }

    pub async fn get_or_create_with_config(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().await;
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.lock().await.get(name).cloned()
    }

    pub async fn all_stats(&self) -> Vec<CircuitStats> {
        let breakers = self.breakers.lock().await;
        let mut stats = Vec::with_capacity(breakers.len());
        for breaker in breakers.values() {
            stats.push(breaker.stats().await);
        }
        stats
    }

    pub async fn reset_all(&self) {
        let breakers = self.breakers.lock().await;
        for breaker in breakers.values() {
            breaker.reset().await;
        }
    }
}
