//! # Conversation Middleware Core
//!
//! Concurrency-safe middleware primitives for a multi-tenant conversational agent
//! platform: distributed locking, rate limiting, circuit breaking, input validation,
//! context-window trimming/summarization, memory retrieval, turn metadata, and an
//! observer event bus.
//!
//! This crate is middleware only: it does not speak HTTP, does not hold a database
//! connection pool, and does not call an LLM or vector store directly. Every external
//! collaborator (Redis, the vector store, the LLM client, the event sink) is injected
//! through a trait, so callers can swap in-memory fakes for tests and production
//! backends for deployment.
//!
//! ## Modules
//!
//! - **error**: the crate-wide `Error` enum and `Result` alias, mapped onto the
//!   `UserError`/`QuotaError`/`BusyError`/`DependencyError`/`InternalError` taxonomy.
//! - **types**: shared data model (messages, threads, memories, events, entities).
//! - **config**: environment-driven `MiddlewareSettings`.
//! - **validation**: input length/whitespace/injection screening.
//! - **context**: token accounting and message trimming.
//! - **summarize**: the four-strategy summarization fallback chain.
//! - **circuit_breaker**: per-dependency circuit breakers and a named registry.
//! - **lock**: distributed conversation locking.
//! - **rate_limit**: fixed-bucket per-minute/per-hour rate limiting.
//! - **memory**: embedding provider chain, vector store, and retrieval ranking.
//! - **metadata**: turn intent classification and entity extraction.
//! - **observer**: the event bus producer/consumer and anomaly alerting.
//! - **retry**: exponential-backoff-with-jitter retry helper shared by the LLM path
//!   and the embedding provider chain.

mod circuit_breaker;
mod config;
mod context;
mod error;
mod lock;
mod memory;
mod metadata;
mod observer;
mod rate_limit;
mod summarize;
mod types;
mod validation;

pub mod retry;

// --- Error Handling ---

pub use error::{Error, ErrorFamily, Result};

// --- Configuration ---

pub use config::{BreakerOverride, MiddlewareSettings, MiddlewareSettingsBuilder};

// --- Core Types ---

pub use types::{
    BaseUrl, Entity, Event, EventType, Intent, Memory, MemoryType, Message, MessageRole,
    ModelName, Preferences, Stage, Temperature, ThreadState, ToolCall, TurnMetadata,
};

// --- Input Validation ---

pub use validation::{Validator, ValidationMetadata, validate_input};

// --- Context Management ---

pub use context::{CharEstimateCounter, TokenAccountant, TokenBudget, TokenCounter, TrimOutcome, trim};

// --- Summarization ---

pub use summarize::{SummarizeOutcome, Summarizer, inject_summary, summarize};

// --- Circuit Breaker ---

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitStats, CircuitState,
};

// --- Distributed Locking ---

pub use lock::{ConversationLock, InMemoryLockStore, LockInfo, LockStore, RedisLockStore, acquire, with_lock};

// --- Rate Limiting ---

pub use rate_limit::{
    InMemoryRateLimitStore, RateLimitPair, RateLimitStatus, RateLimitStore, RateLimiter,
    RedisRateLimitStore,
};

// --- Memory Pipeline ---

pub use memory::{
    DeterministicFakeEmbeddingProvider, EmbeddingChain, EmbeddingProvider, InMemoryVectorStore,
    RetrievalConfig, ScoredMemory, SearchFilters, VectorStore, format_for_context, retrieve,
    retrieve_for_context, store_turn,
};

// --- Turn Metadata ---

pub use metadata::{classify_intent, extract_entities};

// --- Observer Bus ---

pub use observer::{
    Alert, AlertSeverity, AlertWebhook, Consumer, EventEmitter, EventQueue, InMemoryEventQueue,
    PerformanceReport, RedisEventQueue, redis_queue,
};

/// Convenience module re-exporting the most commonly used types and functions.
pub mod prelude {
    pub use crate::{
        CircuitBreaker, CircuitBreakerRegistry, ConversationLock, Error, Event, EventEmitter,
        Memory, MemoryType, Message, MessageRole, MiddlewareSettings, RateLimiter, Result,
        TokenAccountant, Validator, classify_intent, extract_entities, summarize, trim,
        validate_input,
    };
}
