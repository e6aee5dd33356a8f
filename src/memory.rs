//! Memory pipeline: embedding provider fallback chain, vector store, and retrieval
//! ranking (SPEC_FULL.md S4.G), grounded in the original `embeddings.py`,
//! `memory_store.py`, and `retrieval.py` services.

use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::types::{Memory, MemoryType};
use crate::{Error, Result};

/// An embedding backend. Implementations call out to a remote API or a local model; the
/// crate ships no concrete network implementation, only the contract and an in-memory
/// fake for tests.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
    fn dimension(&self) -> usize;
    fn name(&self) -> &str;
}

/// Falls through an ordered list of providers on failure, remembering the
/// last-successful one as a best-effort cache to avoid re-probing dead providers.
pub struct EmbeddingChain {
    providers: Vec<Box<dyn EmbeddingProvider>>,
    last_successful: StdMutex<Option<usize>>,
}

impl EmbeddingChain {
    pub fn new(providers: Vec<Box<dyn EmbeddingProvider>>) -> Self {
        Self {
            providers,
            last_successful: StdMutex::new(None),
        }
    }

    pub async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let mut embeddings = self.embed_texts(&[text.to_string()]).await?;
        Ok(embeddings.remove(0))
    }

    pub async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let preferred = *self.last_successful.lock().expect("lock poisoned");
        let order: Vec<usize> = match preferred {
            Some(idx) if idx < self.providers.len() => {
                let mut order = vec![idx];
                order.extend((0..self.providers.len()).filter(|&i| i != idx));
                order
            }
            _ => (0..self.providers.len()).collect(),
        };

        let mut last_error = None;

        for idx in order {
            let provider = &self.providers[idx];
            match provider.embed_texts(texts).await {
                Ok(embeddings) => {
                    *self.last_successful.lock().expect("lock poisoned") = Some(idx);
                    return Ok(embeddings);
                }
                Err(err) => {
                    warn!(provider = provider.name(), error = %err, "embedding provider failed");
                    last_error = Some(err);
                }
            }
        }

        Err(Error::embedding_failure(
            last_error.map(|e| e.to_string()).unwrap_or_else(|| "no providers configured".to_string()),
        ))
    }

    pub fn dimension(&self) -> usize {
        self.providers.first().map(|p| p.dimension()).unwrap_or(1536)
    }
}

/// Deterministic embedding fake for tests: hashes characters into a fixed-size vector.
/// Never call this in production — it carries no semantic meaning.
pub struct DeterministicFakeEmbeddingProvider {
    dimension: usize,
    name: String,
}

impl DeterministicFakeEmbeddingProvider {
    pub fn new(name: impl Into<String>, dimension: usize) -> Self {
        Self {
            dimension,
            name: name.into(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for DeterministicFakeEmbeddingProvider {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| hash_embed(t, self.dimension)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn hash_embed(text: &str, dimension: usize) -> Vec<f32> {
    let mut vec = vec![0.0f32; dimension];
    for (i, byte) in text.bytes().enumerate() {
        vec[i % dimension] += byte as f32;
    }
    let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vec {
            *v /= norm;
        }
    }
    vec
}

/// Search filters accepted by [`VectorStore::search`].
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub user_id: Option<String>,
    pub thread_id: Option<String>,
    pub memory_type: Option<MemoryType>,
}

/// A memory returned from [`VectorStore::search`], carrying its similarity score.
#[derive(Debug, Clone)]
pub struct ScoredMemory {
    pub memory: Memory,
    pub score: f64,
}

/// Injected vector store backend, keyed on memory id with payload filters on
/// user_id/thread_id/memory_type/created_at.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Upsert by `memory_id`: storing the same id twice replaces the prior embedding and
    /// payload rather than creating a duplicate entry, so retrying a failed write is safe.
    async fn store(&self, memories: Vec<(Memory, Vec<f32>)>) -> Result<Vec<String>>;
    async fn search(
        &self,
        query_embedding: &[f32],
        filters: SearchFilters,
        limit: usize,
        score_threshold: f64,
    ) -> Result<Vec<ScoredMemory>>;
    async fn recent(&self, thread_id: &str, since: DateTime<Utc>, limit: usize) -> Result<Vec<Memory>>;
    async fn list_by_user(&self, user_id: &str, limit: usize) -> Result<Vec<Memory>>;
    async fn delete_by_id(&self, id: &str) -> Result<bool>;
    async fn delete_by_user(&self, user_id: &str) -> Result<usize>;
    async fn delete_by_thread(&self, thread_id: &str) -> Result<usize>;
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)) as f64
}

/// Brute-force cosine-scan in-memory [`VectorStore`], suitable for tests and small
/// deployments; a real driver stays out of scope per the middleware contract.
#[derive(Default)]
pub struct InMemoryVectorStore {
    entries: StdMutex<Vec<(Memory, Vec<f32>)>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn store(&self, memories: Vec<(Memory, Vec<f32>)>) -> Result<Vec<String>> {
        let mut entries = self.entries.lock().expect("lock poisoned");
        let ids = memories.iter().map(|(m, _)| m.memory_id.clone()).collect();
        for (memory, embedding) in memories {
            match entries.iter_mut().find(|(existing, _)| existing.memory_id == memory.memory_id) {
                Some(slot) => *slot = (memory, embedding),
                None => entries.push((memory, embedding)),
            }
        }
        Ok(ids)
    }

    async fn search(
        &self,
        query_embedding: &[f32],
        filters: SearchFilters,
        limit: usize,
        score_threshold: f64,
    ) -> Result<Vec<ScoredMemory>> {
        let entries = self.entries.lock().expect("lock poisoned");

        let mut matches: Vec<ScoredMemory> = entries
            .iter()
            .filter(|(m, _)| {
                filters.user_id.as_ref().is_none_or(|uid| m.user_id.as_deref() == Some(uid.as_str()))
                    && filters.thread_id.as_ref().is_none_or(|tid| m.thread_id.as_deref() == Some(tid.as_str()))
                    && filters.memory_type.is_none_or(|mt| m.memory_type == mt)
            })
            .map(|(m, emb)| ScoredMemory {
                memory: m.clone(),
                score: cosine_similarity(query_embedding, emb),
            })
            .filter(|sm| sm.score >= score_threshold)
            .collect();

        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        matches.truncate(limit);
        Ok(matches)
    }

    async fn recent(&self, thread_id: &str, since: DateTime<Utc>, limit: usize) -> Result<Vec<Memory>> {
        let entries = self.entries.lock().expect("lock poisoned");
        let mut matches: Vec<Memory> = entries
            .iter()
            .filter(|(m, _)| m.thread_id.as_deref() == Some(thread_id) && m.created_at >= since)
            .map(|(m, _)| m.clone())
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matches.truncate(limit);
        Ok(matches)
    }

    async fn list_by_user(&self, user_id: &str, limit: usize) -> Result<Vec<Memory>> {
        let entries = self.entries.lock().expect("lock poisoned");
        let mut matches: Vec<Memory> = entries
            .iter()
            .filter(|(m, _)| m.user_id.as_deref() == Some(user_id))
            .map(|(m, _)| m.clone())
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matches.truncate(limit);
        Ok(matches)
    }

    async fn delete_by_id(&self, id: &str) -> Result<bool> {
        let mut entries = self.entries.lock().expect("lock poisoned");
        let before = entries.len();
        entries.retain(|(m, _)| m.memory_id != id);
        Ok(entries.len() != before)
    }

    async fn delete_by_user(&self, user_id: &str) -> Result<usize> {
        let mut entries = self.entries.lock().expect("lock poisoned");
        let before = entries.len();
        entries.retain(|(m, _)| m.user_id.as_deref() != Some(user_id));
        Ok(before - entries.len())
    }

    async fn delete_by_thread(&self, thread_id: &str) -> Result<usize> {
        let mut entries = self.entries.lock().expect("lock poisoned");
        let before = entries.len();
        entries.retain(|(m, _)| m.thread_id.as_deref() != Some(thread_id));
        Ok(before - entries.len())
    }
}

/// Configuration for [`retrieve_for_context`].
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub max_memories: usize,
    pub score_threshold: f64,
    pub recency_weight: f64,
    pub relevance_weight: f64,
    pub include_user_preferences: bool,
    pub include_recent_context: bool,
    pub recency_window_hours: i64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_memories: 5,
            score_threshold: 0.7,
            recency_weight: 0.2,
            relevance_weight: 0.8,
            include_user_preferences: true,
            include_recent_context: true,
            recency_window_hours: 24,
        }
    }
}

/// Retrieve and rank memories relevant to a turn, per SPEC_FULL.md S4.G's five-step
/// pipeline: semantic search, preference union, recent-context union, combined scoring,
/// top-N truncation.
pub async fn retrieve(
    chain: &EmbeddingChain,
    store: &dyn VectorStore,
    config: &RetrievalConfig,
    query: &str,
    user_id: Option<&str>,
    thread_id: Option<&str>,
) -> Result<Vec<ScoredMemory>> {
    let query_embedding = chain.embed_text(query).await?;

    let mut all: Vec<ScoredMemory> = store
        .search(
            &query_embedding,
            SearchFilters {
                user_id: user_id.map(String::from),
                thread_id: thread_id.map(String::from),
                memory_type: None,
            },
            config.max_memories * 2,
            config.score_threshold,
        )
        .await?;

    if config.include_user_preferences {
        if let Some(user_id) = user_id {
            let preferences = store
                .search(
                    &query_embedding,
                    SearchFilters {
                        user_id: Some(user_id.to_string()),
                        thread_id: None,
                        memory_type: Some(MemoryType::Preference),
                    },
                    3,
                    0.5,
                )
                .await?;

            let existing: std::collections::HashSet<_> =
                all.iter().map(|sm| sm.memory.memory_id.clone()).collect();
            for pref in preferences {
                if !existing.contains(&pref.memory.memory_id) {
                    all.push(pref);
                }
            }
        }
    }

    if config.include_recent_context {
        if let Some(thread_id) = thread_id {
            let cutoff = Utc::now() - chrono::Duration::hours(config.recency_window_hours);
            let recent = store.recent(thread_id, cutoff, 3).await?;

            let existing: std::collections::HashSet<_> =
                all.iter().map(|sm| sm.memory.memory_id.clone()).collect();
            for memory in recent {
                if !existing.contains(&memory.memory_id) {
                    all.push(ScoredMemory { memory, score: 0.5 });
                }
            }
        }
    }

    let ranked = rank_memories(all, config);
    Ok(ranked.into_iter().take(config.max_memories).collect())
}

fn rank_memories(memories: Vec<ScoredMemory>, config: &RetrievalConfig) -> Vec<ScoredMemory> {
    let now = Utc::now();
    let mut scored: Vec<(ScoredMemory, f64)> = memories
        .into_iter()
        .map(|sm| {
            let age_hours = (now - sm.memory.created_at).num_seconds() as f64 / 3600.0;
            let recency = (1.0 - age_hours / (7.0 * config.recency_window_hours as f64)).max(0.0);
            let mut combined = config.relevance_weight * sm.score + config.recency_weight * recency;
            if sm.memory.memory_type == MemoryType::Preference {
                combined *= 1.2;
            }
            (sm, combined)
        })
        .collect();

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored
        .into_iter()
        .map(|(mut sm, score)| {
            sm.score = score;
            sm
        })
        .collect()
}

/// Human-readable label for a memory type, used when rendering retrieved memories into
/// prompt context.
fn type_label(memory_type: MemoryType) -> &'static str {
    match memory_type {
        MemoryType::Conversation => "Previous conversation",
        MemoryType::Preference => "User preference",
        MemoryType::Place => "Visited place",
        MemoryType::Itinerary => "Previous itinerary",
        MemoryType::Feedback => "User feedback",
        MemoryType::Entity => "Known information",
    }
}

fn time_hint(created_at: DateTime<Utc>) -> String {
    let age = Utc::now() - created_at;
    if age < chrono::Duration::hours(1) {
        "just now".to_string()
    } else if age < chrono::Duration::hours(24) {
        format!("{} hours ago", age.num_hours())
    } else if age < chrono::Duration::days(7) {
        format!("{} days ago", age.num_days())
    } else {
        created_at.format("%Y-%m-%d").to_string()
    }
}

/// Format a ranked memory for inclusion in an LLM prompt: `[Label - time hint] content`.
pub fn format_for_context(scored: &ScoredMemory) -> String {
    let label = type_label(scored.memory.memory_type);
    let hint = time_hint(scored.memory.created_at);
    format!("[{label} - {hint}] {}", scored.memory.content)
}

/// Retrieve memories and render them as ready-to-inject prompt-context strings.
pub async fn retrieve_for_context(
    chain: &EmbeddingChain,
    store: &dyn VectorStore,
    config: &RetrievalConfig,
    query: &str,
    user_id: Option<&str>,
    thread_id: Option<&str>,
) -> Result<Vec<String>> {
    let memories = retrieve(chain, store, config, query, user_id, thread_id).await?;
    Ok(memories.iter().map(format_for_context).collect())
}

/// Store a completed turn: one Conversation memory plus one Entity memory per extracted
/// entity, batched into a single embedding call (SPEC_FULL.md S4.G "Turn write-back").
pub async fn store_turn(
    chain: &EmbeddingChain,
    store: &dyn VectorStore,
    user_message: &str,
    assistant_message: &str,
    user_id: Option<&str>,
    thread_id: Option<&str>,
    entities: &[crate::types::Entity],
) -> Result<Vec<String>> {
    let truncated_reply: String = assistant_message.chars().take(500).collect();
    let conversation_content = format!("User asked: {user_message}\nAssistant responded: {truncated_reply}");

    let mut memories = vec![with_ids(Memory::new(conversation_content, MemoryType::Conversation), user_id, thread_id)];

    for entity in entities {
        let content = format!("{}: {}", entity.entity_type, entity.value);
        let mut memory = Memory::new(content, MemoryType::Entity);
        memory.metadata.insert(
            "entity_type".to_string(),
            serde_json::Value::String(entity.entity_type.clone()),
        );
        memory.metadata.insert(
            "entity_value".to_string(),
            serde_json::Value::String(entity.value.clone()),
        );
        memories.push(with_ids(memory, user_id, thread_id));
    }

    let texts: Vec<String> = memories.iter().map(|m| m.content.clone()).collect();
    let embeddings = chain.embed_texts(&texts).await?;

    let pairs: Vec<(Memory, Vec<f32>)> = memories.into_iter().zip(embeddings).collect();
    store.store(pairs).await
}

fn with_ids(mut memory: Memory, user_id: Option<&str>, thread_id: Option<&str>) -> Memory {
    if let Some(uid) = user_id {
        memory = memory.with_user_id(uid);
    }
    if let Some(tid) = thread_id {
        memory = memory.with_thread_id(tid);
    }
    memory
}
