//! Token accounting and context-window trimming (SPEC_FULL.md S4.A, S4.F "Trim").
//!
//! Token counting falls back to a `chars / 4` estimate (SPEC_FULL.md S9.1, open question
//! (a)): callers that have a real tokenizer can supply one through the [`TokenCounter`]
//! trait; the crate ships only the character-based estimator. Counting is pure and
//! thread-safe, so results are memoized behind a bounded LRU the way the original
//! `cached_count_tokens` helper memoized repeated strings.
//!
//! Summarization (the other half of S4.F) lives in [`crate::summarize`]; this module only
//! covers accounting and the trim pass itself.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::types::{Message, MessageRole};

/// Fixed per-message overhead (role framing) added on top of content tokens.
const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Pluggable token counting strategy. The default [`CharEstimateCounter`] is a coarse
/// proxy; a caller with access to a model-specific tokenizer can substitute their own.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// `chars / 4` fallback estimator, the only counter this crate ships.
#[derive(Debug, Default, Clone, Copy)]
pub struct CharEstimateCounter;

impl TokenCounter for CharEstimateCounter {
    fn count(&self, text: &str) -> usize {
        text.len() / 4
    }
}

/// A small bounded LRU cache over `count()` results, mirroring the original
/// `lru_cache(maxsize=1000)` around token counting.
struct TokenCache {
    capacity: usize,
    order: VecDeque<String>,
    entries: HashMap<String, usize>,
}

impl TokenCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    fn get_or_insert_with(&mut self, key: &str, compute: impl FnOnce() -> usize) -> usize {
        if let Some(&value) = self.entries.get(key) {
            return value;
        }

        let value = compute();

        if self.entries.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }

        self.order.push_back(key.to_string());
        self.entries.insert(key.to_string(), value);
        value
    }
}

/// Token accountant: counts text and message-list tokens, with a bounded memoization
/// cache over repeated strings (SPEC_FULL.md S4.A).
pub struct TokenAccountant<C: TokenCounter = CharEstimateCounter> {
    counter: C,
    cache: Mutex<TokenCache>,
}

impl Default for TokenAccountant<CharEstimateCounter> {
    fn default() -> Self {
        Self::new(CharEstimateCounter)
    }
}

impl<C: TokenCounter> TokenAccountant<C> {
    pub fn new(counter: C) -> Self {
        Self {
            counter,
            cache: Mutex::new(TokenCache::new(1000)),
        }
    }

    /// Count tokens in a single string, memoized.
    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        let mut cache = self.cache.lock().expect("token cache lock poisoned");
        cache.get_or_insert_with(text, || self.counter.count(text))
    }

    /// Count tokens across a message list, including per-message role overhead.
    pub fn count_messages(&self, messages: &[Message]) -> usize {
        messages
            .iter()
            .map(|m| self.count(&m.content) + MESSAGE_OVERHEAD_TOKENS)
            .sum()
    }

    /// Estimate tokens the model will spend on its reply, capped at `max_response`.
    pub fn estimate_response_tokens(&self, max_response: usize) -> usize {
        max_response.min(max_response / 2)
    }

    /// Combined budget report for a message list against soft/hard token limits.
    pub fn budget(&self, messages: &[Message], soft: usize, hard: usize) -> TokenBudget {
        let current_tokens = self.count_messages(messages);
        let estimated_response = self.estimate_response_tokens(hard.max(1));
        let total_estimate = current_tokens + estimated_response;
        let utilization = if hard == 0 {
            0.0
        } else {
            (current_tokens as f64 / hard as f64) * 100.0
        };

        TokenBudget {
            current_tokens,
            estimated_response,
            total_estimate,
            soft_limit: soft,
            hard_limit: hard,
            within_soft: current_tokens <= soft,
            within_hard: current_tokens <= hard,
            needs_trimming: current_tokens > soft,
            needs_summarization: current_tokens > hard,
            utilization_percent: (utilization * 10.0).round() / 10.0,
        }
    }
}

/// Result of [`TokenAccountant::budget`].
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBudget {
    pub current_tokens: usize,
    pub estimated_response: usize,
    pub total_estimate: usize,
    pub soft_limit: usize,
    pub hard_limit: usize,
    pub within_soft: bool,
    pub within_hard: bool,
    pub needs_trimming: bool,
    pub needs_summarization: bool,
    pub utilization_percent: f64,
}

/// Result of a [`trim`] pass.
#[derive(Debug, Clone)]
pub struct TrimOutcome {
    pub messages: Vec<Message>,
    pub removed: Vec<Message>,
    pub needs_summarization: bool,
}

/// Trim a message list to fit within a soft token limit, preserving system messages and
/// a recent tail, per SPEC_FULL.md S4.F "Trim".
///
/// Messages older than the recent tail are walked newest-to-oldest and kept while they
/// fit in the remaining budget; the rest are evicted into `removed`. If the list already
/// fits, or there are too few conversation messages to trim, it is returned unchanged.
pub fn trim<C: TokenCounter>(
    accountant: &TokenAccountant<C>,
    messages: &[Message],
    soft_limit: usize,
    keep_recent: usize,
) -> TrimOutcome {
    let total_tokens = accountant.count_messages(messages);

    if total_tokens <= soft_limit {
        return TrimOutcome {
            messages: messages.to_vec(),
            removed: Vec::new(),
            needs_summarization: false,
        };
    }

    let (system, conversation): (Vec<Message>, Vec<Message>) = messages
        .iter()
        .cloned()
        .partition(|m| m.role == MessageRole::System);

    if conversation.len() <= keep_recent {
        return TrimOutcome {
            messages: messages.to_vec(),
            removed: Vec::new(),
            needs_summarization: false,
        };
    }

    let split_at = conversation.len() - keep_recent;
    let older = &conversation[..split_at];
    let recent_tail = &conversation[split_at..];

    let system_tokens = accountant.count_messages(&system);
    let recent_tokens = accountant.count_messages(recent_tail);
    let mut remaining_budget = soft_limit.saturating_sub(system_tokens + recent_tokens) as i64;

    let mut kept_older = Vec::new();
    let mut removed = Vec::new();

    for msg in older.iter().rev() {
        let msg_tokens = accountant.count(&msg.content) + 4;
        if remaining_budget >= msg_tokens as i64 {
            kept_older.push(msg.clone());
            remaining_budget -= msg_tokens as i64;
        } else {
            removed.push(msg.clone());
        }
    }

    kept_older.reverse();
    removed.reverse();

    let mut new_messages = system;
    new_messages.extend(kept_older);
    new_messages.extend(recent_tail.iter().cloned());

    TrimOutcome {
        messages: new_messages,
        needs_summarization: !removed.is_empty(),
        removed,
    }
}
