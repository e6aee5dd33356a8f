//! Summarization fallback chain and synthetic-summary injection (SPEC_FULL.md S4.F
//! "Summarize" / "Inject"), grounded in the original `summarization.py` middleware.
//!
//! Four strategies are attempted in order, stopping at the first success: full LLM
//! summarization, reduced LLM summarization over the latter half of the removed
//! messages, extractive keyword summarization, and finally hard truncation. Strategies
//! 1 and 2 call out to an injected [`Summarizer`] rather than a concrete HTTP client,
//! since the LLM client is an external collaborator (SPEC_FULL.md S1).

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::types::{Message, MessageRole};
use crate::{Error, Result};

/// Minimum summary length (characters) for an LLM-produced summary to count as a success.
const MIN_VIABLE_SUMMARY_LEN: usize = 50;

/// Character cap applied to the formatted conversation before handing it to the
/// summarization model.
const MAX_SUMMARY_INPUT_CHARS: usize = 12_000;

/// Keywords used by the extractive fallback to pick "important" lines without an LLM.
const EXTRACTIVE_KEYWORDS: &[&str] = &[
    "want", "need", "prefer", "like", "visit", "go", "travel", "hotel", "restaurant", "food",
    "museum", "palace", "temple", "subway", "bus", "taxi", "walk", "morning", "afternoon",
    "evening", "night", "budget", "cheap", "expensive", "luxury", "day", "days", "week", "hour",
    "hours", "seoul", "busan", "jeju", "incheon", "gyeongju",
];

/// An injected LLM-backed summarizer. Implementations are expected to honor `deadline` by
/// racing their own request against it, or rely on the caller's `tokio::time::timeout`.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, prompt: &str, deadline: Duration) -> Result<String>;
}

/// Outcome of a [`summarize`] pass.
#[derive(Debug, Clone)]
pub struct SummarizeOutcome {
    pub summary: Option<String>,
    pub performed: bool,
    pub failed: bool,
}

/// Attempt the four-strategy fallback chain over a list of removed messages.
pub async fn summarize(
    summarizer: &dyn Summarizer,
    removed: &[Message],
    deadline: Duration,
) -> SummarizeOutcome {
    if removed.is_empty() {
        return SummarizeOutcome {
            summary: None,
            performed: false,
            failed: false,
        };
    }

    if let Some(summary) = try_llm_summarize(summarizer, removed, deadline).await {
        debug!("llm summarization succeeded");
        return SummarizeOutcome {
            summary: Some(summary),
            performed: true,
            failed: false,
        };
    }

    let reduced = &removed[removed.len() / 2..];
    if let Some(summary) = try_llm_summarize(summarizer, reduced, deadline).await {
        debug!("reduced llm summarization succeeded");
        let summary = format!("[Partial summary - earlier context omitted]\n{summary}");
        return SummarizeOutcome {
            summary: Some(summary),
            performed: true,
            failed: false,
        };
    }

    if let Some(summary) = extractive_summarize(removed) {
        debug!("extractive summarization succeeded");
        return SummarizeOutcome {
            summary: Some(summary),
            performed: true,
            failed: false,
        };
    }

    if let Some(summary) = truncation_fallback(removed) {
        debug!("truncation fallback used");
        return SummarizeOutcome {
            summary: Some(summary),
            performed: true,
            failed: false,
        };
    }

    warn!("all summarization strategies failed");
    SummarizeOutcome {
        summary: None,
        performed: false,
        failed: true,
    }
}

async fn try_llm_summarize(
    summarizer: &dyn Summarizer,
    messages: &[Message],
    deadline: Duration,
) -> Option<String> {
    let mut conversation = format_messages_for_summary(messages);
    if conversation.len() > MAX_SUMMARY_INPUT_CHARS {
        conversation.truncate(MAX_SUMMARY_INPUT_CHARS);
    }

    let prompt = format!(
        "Summarize the following conversation concisely, preserving key information:\n\
         - User's travel plans and preferences\n\
         - Important places, dates, and times mentioned\n\
         - Any specific requests or constraints\n\
         - Decisions made during the conversation\n\n\
         Keep the summary under 500 words. Focus on actionable information.\n\n\
         Conversation to summarize:\n{conversation}\n\nSummary:"
    );

    match tokio::time::timeout(deadline, summarizer.summarize(&prompt, deadline)).await {
        Ok(Ok(summary)) => {
            let summary = summary.trim().to_string();
            if summary.len() >= MIN_VIABLE_SUMMARY_LEN {
                Some(summary)
            } else {
                None
            }
        }
        Ok(Err(err)) => {
            warn!(error = %err, "llm summarization error");
            None
        }
        Err(_) => {
            warn!("llm summarization timed out");
            None
        }
    }
}

fn extractive_summarize(messages: &[Message]) -> Option<String> {
    let mut important = Vec::new();

    for msg in messages {
        let lower = msg.content.to_lowercase();
        let keyword_count = EXTRACTIVE_KEYWORDS.iter().filter(|k| lower.contains(*k)).count();

        if keyword_count >= 2 || msg.role == MessageRole::User {
            let mut content = msg.content.clone();
            if content.len() > 200 {
                content.truncate(200);
                content.push_str("...");
            }
            let role = if msg.role == MessageRole::User { "User" } else { "Assistant" };
            important.push(format!("- {role}: {content}"));
        }
    }

    if important.is_empty() {
        return None;
    }

    let recent: Vec<_> = important
        .iter()
        .rev()
        .take(10)
        .rev()
        .cloned()
        .collect();

    Some(format!(
        "Key points from previous conversation:\n{}",
        recent.join("\n")
    ))
}

fn truncation_fallback(messages: &[Message]) -> Option<String> {
    if messages.len() <= 4 {
        return None;
    }

    let mut parts = Vec::new();

    for msg in &messages[..2] {
        parts.push(format_truncated_line(msg));
    }

    parts.push(format!("[... {} messages omitted ...]", messages.len() - 4));

    for msg in &messages[messages.len() - 2..] {
        parts.push(format_truncated_line(msg));
    }

    Some(parts.join("\n"))
}

fn format_truncated_line(msg: &Message) -> String {
    let role = if msg.role == MessageRole::User { "User" } else { "Assistant" };
    let content: String = msg.content.chars().take(100).collect();
    format!("{role}: {content}...")
}

fn format_messages_for_summary(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|m| m.role != MessageRole::System)
        .map(|m| {
            let role = match m.role {
                MessageRole::User => "User",
                MessageRole::Assistant => "Assistant",
                MessageRole::Tool => "Message",
                MessageRole::System => unreachable!("system messages filtered above"),
            };
            format!("{role}: {}", m.content)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Wrap a summary as a synthetic system message and insert it after existing system
/// messages, before the rest of the conversation (SPEC_FULL.md S4.F "Inject").
pub fn inject_summary(messages: &[Message], summary: &str) -> Vec<Message> {
    let (system, rest): (Vec<Message>, Vec<Message>) = messages
        .iter()
        .cloned()
        .partition(|m| m.role == MessageRole::System);

    let summary_message = Message::system(format!(
        "[Previous conversation summary]\n{summary}\n[End of summary]"
    ));

    let mut result = system;
    result.push(summary_message);
    result.extend(rest);
    result
}

/// A [`Summarizer`] stub that always fails, used by tests to exercise the fallback chain
/// past strategies 1 and 2 deterministically.
pub struct AlwaysFailSummarizer;

#[async_trait]
impl Summarizer for AlwaysFailSummarizer {
    async fn summarize(&self, _prompt: &str, _deadline: Duration) -> Result<String> {
        Err(Error::llm_failure("stubbed failure"))
    }
}
