//! Core data model for the conversation middleware core.
//!
//! This module contains the structures shared by every component: messages and thread
//! state (SPEC_FULL.md S3), plus a handful of newtype wrappers reused by [`crate::config`]
//! for validating endpoint/model configuration the same way a client SDK would validate
//! its own connection parameters.
//!
//! Domain tools, multimodal content, and the OpenAI wire format are out of scope here —
//! the LLM client itself is an external collaborator (SPEC_FULL.md S1) invoked through a
//! narrow trait, not a first-class citizen of this type system.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::Error;

// ============================================================================
// NEWTYPE WRAPPERS FOR COMPILE-TIME TYPE SAFETY
// ============================================================================

/// Validated model name with compile-time type safety.
///
/// # Example
///
/// ```
/// use conversation_middleware_core::ModelName;
///
/// let model = ModelName::new("solar-pro").unwrap();
/// assert_eq!(model.as_str(), "solar-pro");
/// assert!(ModelName::new("").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelName(String);

impl ModelName {
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::config("model name must not be empty"));
        }
        Ok(ModelName(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for ModelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validated base URL with compile-time type safety.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BaseUrl(String);

impl BaseUrl {
    pub fn new(url: impl Into<String>) -> crate::Result<Self> {
        let url = url.into();
        if url.trim().is_empty() {
            return Err(Error::config("base url must not be empty"));
        }
        if !(url.starts_with("http://") || url.starts_with("https://") || url.starts_with("redis://")) {
            return Err(Error::config(format!(
                "base url must start with http://, https://, or redis://: {url}"
            )));
        }
        Ok(BaseUrl(url))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for BaseUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validated sampling temperature, 0.0 to 2.0 inclusive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Temperature(f32);

impl Temperature {
    pub fn new(temp: f32) -> crate::Result<Self> {
        if !(0.0..=2.0).contains(&temp) {
            return Err(Error::config("temperature must be between 0.0 and 2.0"));
        }
        Ok(Temperature(temp))
    }

    pub fn value(&self) -> f32 {
        self.0
    }
}

// ============================================================================
// MESSAGE / THREAD DATA MODEL
// ============================================================================

/// Who sent a message within a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool-call descriptor carried by an assistant message that invoked a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// A single message within a thread. Append-only once stored.
///
/// # Example
///
/// ```
/// use conversation_middleware_core::Message;
///
/// let msg = Message::user("What's in Seongsu this weekend?");
/// assert_eq!(msg.content, "What's in Seongsu this weekend?");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    pub tool_call: Option<ToolCall>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn assistant_tool_call(content: impl Into<String>, tool_call: ToolCall) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_call: Some(tool_call),
        }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Tool, content)
    }
}

/// Coarse phase of a thread's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Init,
    Investigation,
    Planning,
    Resolution,
}

impl Default for Stage {
    fn default() -> Self {
        Stage::Init
    }
}

/// A user's standing preferences, accumulated across turns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Preferences {
    pub language: Option<String>,
    pub budget_tier: Option<String>,
    pub dietary_tags: HashSet<String>,
    pub mobility_level: Option<String>,
    pub interests: HashSet<String>,
    pub accommodation_area: Option<String>,
    pub travel_date_window: Option<(String, String)>,
}

/// Classified user intent, a closed set matched by keyword rules (see
/// [`crate::metadata::classify_intent`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Greeting,
    Thanks,
    Farewell,
    Question,
    SearchRequest,
    DirectionsRequest,
    ItineraryRequest,
    SaveRequest,
    Modification,
    General,
}

/// Metadata recorded for a single turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnMetadata {
    pub turn_ordinal: u32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub intent: Intent,
    pub latency_ms: Option<u64>,
    pub token_count: Option<usize>,
}

/// Full state of a single conversation thread.
///
/// A thread is created on first use and, per the concurrency model, mutated only while
/// its [`crate::lock::ConversationLock`] is held.
#[derive(Debug, Clone)]
pub struct ThreadState {
    pub thread_id: String,
    pub messages: Vec<Message>,
    pub stage: Stage,
    pub turn_count: u32,
    pub last_turn: Option<TurnMetadata>,
    pub preferences: Preferences,
    pub summary: Option<String>,
    pub cached_token_count: Option<usize>,
}

impl ThreadState {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            messages: Vec::new(),
            stage: Stage::Init,
            turn_count: 0,
            last_turn: None,
            preferences: Preferences::default(),
            summary: None,
            cached_token_count: None,
        }
    }
}

// ============================================================================
// MEMORY DATA MODEL
// ============================================================================

/// The category a stored memory belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Conversation,
    Preference,
    Place,
    Itinerary,
    Feedback,
    Entity,
}

/// A single stored memory, with its embedding kept alongside in the vector store rather
/// than on this struct (payload vs. vector are separate concerns for the store, see
/// [`crate::memory::VectorStore`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub memory_id: String,
    pub content: String,
    pub memory_type: MemoryType,
    pub user_id: Option<String>,
    pub thread_id: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Memory {
    pub fn new(content: impl Into<String>, memory_type: MemoryType) -> Self {
        Self {
            memory_id: uuid::Uuid::new_v4().to_string(),
            content: content.into(),
            memory_type,
            user_id: None,
            thread_id: None,
            metadata: HashMap::new(),
            created_at: chrono::Utc::now(),
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }
}

// ============================================================================
// EVENT DATA MODEL
// ============================================================================

/// The closed set of event types the observer bus understands. Unknown values on ingress
/// are tolerated (logged, not dispatched) rather than rejected, per SPEC_FULL.md S9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    RequestStarted,
    RequestCompleted,
    ErrorOccurred,
    RateLimited,
    PromptInjectionDetected,
    SummarizationFallback,
    NaverApiCalled,
    LockAcquired,
    LockReleased,
    CircuitOpened,
    CircuitClosed,
}

/// An observability event, as emitted by [`crate::observer::EventEmitter`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub event_type: EventType,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub thread_id: Option<String>,
    pub user_id: Option<String>,
    #[serde(default)]
    pub payload: HashMap<String, serde_json::Value>,
    pub latency_ms: Option<u64>,
    pub token_count: Option<usize>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub stack_trace: Option<String>,
}

impl Event {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type,
            timestamp: chrono::Utc::now(),
            thread_id: None,
            user_id: None,
            payload: HashMap::new(),
            latency_ms: None,
            token_count: None,
            error_code: None,
            error_message: None,
            stack_trace: None,
        }
    }

    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn with_token_count(mut self, token_count: usize) -> Self {
        self.token_count = Some(token_count);
        self
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn with_error(
        mut self,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        self.error_code = Some(code.into());
        self.error_message = Some(message.into());
        self
    }
}

/// A single extracted entity (place/date/budget/time), used only to seed Entity memories
/// on turn write-back (SPEC_FULL.md S3, S9.2). Not a general NER result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_type: String,
    pub value: String,
}
