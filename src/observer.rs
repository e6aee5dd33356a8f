//! Observer event bus (SPEC_FULL.md S4.H), grounded in the original `observer_agent.py`
//! background agent and `events.py` event model.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::{error, info, warn};

use crate::types::{Event, EventType};
use crate::Result;

const EVENT_QUEUE_KEY: &str = "agent:events";
const ERROR_ALERT_THRESHOLD: u32 = 5;
const HIGH_LATENCY_THRESHOLD_MS: u64 = 5000;
const REPORT_EVERY_N_SAMPLES: usize = 100;
const BLOCK_POP_TIMEOUT: Duration = Duration::from_secs(1);

/// Shared FIFO queue of JSON-encoded events; one consumer per deployment.
#[async_trait]
pub trait EventQueue: Send + Sync {
    async fn push(&self, event: &Event) -> Result<()>;
    /// Block for up to `timeout` waiting for an item; `Ok(None)` on timeout.
    async fn blocking_pop(&self, timeout: Duration) -> Result<Option<Event>>;
}

/// Redis-list-backed [`EventQueue`].
pub struct RedisEventQueue {
    client: redis::Client,
    key: String,
}

impl RedisEventQueue {
    pub fn new(redis_url: &str) -> Result<Self> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            key: EVENT_QUEUE_KEY.to_string(),
        })
    }
}

#[async_trait]
impl EventQueue for RedisEventQueue {
    async fn push(&self, event: &Event) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(event)?;
        let _: () = conn.rpush(&self.key, payload).await?;
        Ok(())
    }

    async fn blocking_pop(&self, timeout: Duration) -> Result<Option<Event>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let result: Option<(String, String)> = conn.blpop(&self.key, timeout.as_secs_f64()).await?;
        match result {
            None => Ok(None),
            Some((_, raw)) => Ok(Some(serde_json::from_str(&raw)?)),
        }
    }
}

/// In-process [`EventQueue`] used by the consumer-loop tests.
#[derive(Default)]
pub struct InMemoryEventQueue {
    inner: tokio::sync::Mutex<VecDeque<Event>>,
}

impl InMemoryEventQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventQueue for InMemoryEventQueue {
    async fn push(&self, event: &Event) -> Result<()> {
        self.inner.lock().await.push_back(event.clone());
        Ok(())
    }

    async fn blocking_pop(&self, timeout: Duration) -> Result<Option<Event>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(event) = self.inner.lock().await.pop_front() {
                return Ok(Some(event));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Non-blocking producer-side handle. Enqueue failures are logged and dropped — a turn
/// must never fail because observability couldn't keep up.
pub struct EventEmitter {
    queue: std::sync::Arc<dyn EventQueue>,
}

impl EventEmitter {
    pub fn new(queue: std::sync::Arc<dyn EventQueue>) -> Self {
        Self { queue }
    }

    pub async fn emit(&self, event: Event) {
        if let Err(err) = self.queue.push(&event).await {
            warn!(error = %err, event_type = ?event.event_type, "failed to enqueue event");
        }
    }

    pub async fn emit_request_started(&self, thread_id: &str, user_id: Option<&str>) {
        let mut event = Event::new(EventType::RequestStarted).with_thread_id(thread_id);
        if let Some(uid) = user_id {
            event = event.with_user_id(uid);
        }
        self.emit(event).await;
    }

    pub async fn emit_request_completed(
        &self,
        thread_id: &str,
        user_id: Option<&str>,
        latency_ms: u64,
        token_count: Option<usize>,
    ) {
        let mut event = Event::new(EventType::RequestCompleted)
            .with_thread_id(thread_id)
            .with_latency_ms(latency_ms);
        if let Some(uid) = user_id {
            event = event.with_user_id(uid);
        }
        if let Some(tokens) = token_count {
            event = event.with_token_count(tokens);
        }
        self.emit(event).await;
    }

    pub async fn emit_error(&self, thread_id: &str, user_id: Option<&str>, code: &str, message: &str) {
        let mut event = Event::new(EventType::ErrorOccurred)
            .with_thread_id(thread_id)
            .with_error(code, message);
        if let Some(uid) = user_id {
            event = event.with_user_id(uid);
        }
        self.emit(event).await;
    }

    pub async fn emit_prompt_injection_detected(&self, thread_id: &str, user_id: Option<&str>, pattern: &str) {
        let mut event = Event::new(EventType::PromptInjectionDetected)
            .with_thread_id(thread_id)
            .with_payload("pattern", serde_json::Value::String(pattern.to_string()));
        if let Some(uid) = user_id {
            event = event.with_user_id(uid);
        }
        self.emit(event).await;
    }
}

/// An alert dispatched via [`Consumer::send_alert`].
#[derive(Debug, Clone)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub message: String,
    pub context: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }
}

/// Snapshot of a periodic performance report, emitted every [`REPORT_EVERY_N_SAMPLES`]
/// latency samples.
#[derive(Debug, Clone)]
pub struct PerformanceReport {
    pub avg_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub error_counts: HashMap<String, u32>,
    pub api_call_counts: HashMap<String, u32>,
    pub total_events: usize,
}

/// Consumer-side analysis state: error counters, latency sliding buffer, API call
/// counters, anomaly detection, and alert dispatch. One instance runs per deployment.
pub struct Consumer {
    queue: std::sync::Arc<dyn EventQueue>,
    anomaly_detection_enabled: bool,
    webhook: Option<AlertWebhook>,
    error_counts: HashMap<String, u32>,
    latency_buffer: Vec<u64>,
    api_call_counts: HashMap<String, u32>,
}

/// Webhook sink for dispatched alerts, mirroring the original's Slack integration shape
/// without binding to a specific provider.
pub struct AlertWebhook {
    client: reqwest::Client,
    url: String,
}

impl AlertWebhook {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client"),
            url: url.into(),
        }
    }

    async fn post(&self, alert: &Alert) -> Result<()> {
        let payload = serde_json::json!({
            "text": format!("[{}] {}", alert.severity.as_str().to_uppercase(), alert.message),
            "context": alert.context,
        });
        self.client.post(&self.url).json(&payload).send().await?;
        Ok(())
    }
}

impl Consumer {
    pub fn new(queue: std::sync::Arc<dyn EventQueue>, anomaly_detection_enabled: bool) -> Self {
        Self {
            queue,
            anomaly_detection_enabled,
            webhook: None,
            error_counts: HashMap::new(),
            latency_buffer: Vec::new(),
            api_call_counts: HashMap::new(),
        }
    }

    pub fn with_webhook(mut self, webhook: AlertWebhook) -> Self {
        self.webhook = Some(webhook);
        self
    }

    /// Block-pop one event and process it, returning `false` on a timeout with nothing
    /// to do (the caller should simply loop again).
    pub async fn tick(&mut self) -> Result<bool> {
        match self.queue.blocking_pop(BLOCK_POP_TIMEOUT).await? {
            None => Ok(false),
            Some(event) => {
                self.process_event(event).await;
                Ok(true)
            }
        }
    }

    async fn process_event(&mut self, event: Event) {
        self.log_event(&event);

        if event.event_type == EventType::ErrorOccurred {
            self.handle_error(&event).await;
        }

        if let Some(latency_ms) = event.latency_ms {
            self.latency_buffer.push(latency_ms);
        }

        if event.event_type == EventType::NaverApiCalled {
            let api_type = event
                .payload
                .get("api_type")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            *self.api_call_counts.entry(api_type).or_insert(0) += 1;
        }

        if self.anomaly_detection_enabled {
            self.detect_anomalies(&event).await;
        }

        if self.latency_buffer.len() >= REPORT_EVERY_N_SAMPLES {
            self.analyze_and_report();
        }
    }

    fn log_event(&self, event: &Event) {
        if let Some(code) = &event.error_code {
            error!(
                event_type = ?event.event_type,
                thread_id = ?event.thread_id,
                error_code = code,
                message = event.error_message.as_deref().unwrap_or("error occurred"),
                "observed error event"
            );
        } else {
            info!(event_type = ?event.event_type, thread_id = ?event.thread_id, "observed event");
        }
    }

    async fn handle_error(&mut self, event: &Event) {
        let error_type = event.error_code.clone().unwrap_or_else(|| "unknown".to_string());
        let count = {
            let entry = self.error_counts.entry(error_type.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        if count >= ERROR_ALERT_THRESHOLD {
            let mut context = HashMap::new();
            if let Some(thread_id) = &event.thread_id {
                context.insert("thread_id".to_string(), serde_json::Value::String(thread_id.clone()));
            }
            self.send_alert(Alert {
                severity: AlertSeverity::Critical,
                message: format!("Repeated errors: {error_type} ({count} times)"),
                context,
            })
            .await;
        }
    }

    async fn detect_anomalies(&mut self, event: &Event) {
        if let Some(latency_ms) = event.latency_ms {
            if latency_ms > HIGH_LATENCY_THRESHOLD_MS {
                let mut context = HashMap::new();
                if let Some(thread_id) = &event.thread_id {
                    context.insert("thread_id".to_string(), serde_json::Value::String(thread_id.clone()));
                }
                context.insert("latency_ms".to_string(), serde_json::Value::from(latency_ms));
                self.send_alert(Alert {
                    severity: AlertSeverity::Warning,
                    message: format!("High latency detected: {latency_ms}ms"),
                    context,
                })
                .await;
            }
        }

        if event.event_type == EventType::PromptInjectionDetected {
            self.send_alert(Alert {
                severity: AlertSeverity::Critical,
                message: "Prompt injection attempt detected".to_string(),
                context: event.payload.clone(),
            })
            .await;
        }

        if event.event_type == EventType::RateLimited {
            warn!(thread_id = ?event.thread_id, "rate limit triggered");
        }
    }

    fn analyze_and_report(&mut self) -> Option<PerformanceReport> {
        if self.latency_buffer.is_empty() {
            return None;
        }

        let mut sorted = self.latency_buffer.clone();
        sorted.sort_unstable();
        let sum: u64 = sorted.iter().sum();
        let avg = sum as f64 / sorted.len() as f64;
        let p50 = sorted[sorted.len() / 2] as f64;
        let p95 = sorted[(sorted.len() as f64 * 0.95) as usize] as f64;
        let p99 = sorted[(sorted.len() as f64 * 0.99) as usize] as f64;

        let report = PerformanceReport {
            avg_latency_ms: avg,
            p50_latency_ms: p50,
            p95_latency_ms: p95,
            p99_latency_ms: p99,
            error_counts: self.error_counts.clone(),
            api_call_counts: self.api_call_counts.clone(),
            total_events: self.latency_buffer.len(),
        };

        info!(
            avg_latency_ms = report.avg_latency_ms,
            p50_latency_ms = report.p50_latency_ms,
            p95_latency_ms = report.p95_latency_ms,
            p99_latency_ms = report.p99_latency_ms,
            total_events = report.total_events,
            "performance report"
        );

        self.latency_buffer.clear();
        self.error_counts.clear();
        self.api_call_counts.clear();

        Some(report)
    }

    pub async fn send_alert(&self, alert: Alert) {
        warn!(severity = alert.severity.as_str(), message = %alert.message, "alert triggered");

        if let Some(webhook) = &self.webhook {
            if let Err(err) = webhook.post(&alert).await {
                error!(error = %err, "failed to send alert webhook");
            }
        }
    }
}

/// Construct the queue implementation named by `redis_url`; returns the in-memory queue
/// wrapped the same way so callers can swap backends without touching call sites.
pub fn redis_queue(redis_url: &str) -> Result<std::sync::Arc<dyn EventQueue>> {
    Ok(std::sync::Arc::new(RedisEventQueue::new(redis_url)?) as std::sync::Arc<dyn EventQueue>)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> std::sync::Arc<dyn EventQueue> {
        std::sync::Arc::new(InMemoryEventQueue::new())
    }

    #[tokio::test]
    async fn test_emitter_enqueues_event() {
        let q = queue();
        let emitter = EventEmitter::new(q.clone());
        emitter.emit_request_started("t1", Some("u1")).await;

        let event = q.blocking_pop(Duration::from_millis(50)).await.unwrap();
        assert!(event.is_some());
        assert_eq!(event.unwrap().event_type, EventType::RequestStarted);
    }

    #[tokio::test]
    async fn test_consumer_tick_returns_false_on_timeout() {
        let q = queue();
        let mut consumer = Consumer::new(q, true);
        let processed = consumer.tick().await.unwrap();
        assert!(!processed);
    }

    #[tokio::test]
    async fn test_consumer_tick_processes_event() {
        let q = queue();
        let emitter = EventEmitter::new(q.clone());
        emitter.emit_request_completed("t1", None, 120, Some(40)).await;

        let mut consumer = Consumer::new(q, true);
        let processed = consumer.tick().await.unwrap();
        assert!(processed);
        assert_eq!(consumer.latency_buffer.len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_errors_trigger_alert_threshold() {
        let q = queue();
        let mut consumer = Consumer::new(q, true);

        for _ in 0..ERROR_ALERT_THRESHOLD {
            let event = Event::new(EventType::ErrorOccurred)
                .with_thread_id("t1")
                .with_error("LLM_TIMEOUT", "timed out");
            consumer.process_event(event).await;
        }

        assert_eq!(*consumer.error_counts.get("LLM_TIMEOUT").unwrap(), ERROR_ALERT_THRESHOLD);
    }

    #[tokio::test]
    async fn test_analyze_and_report_resets_buffers() {
        let q = queue();
        let mut consumer = Consumer::new(q, false);

        for i in 0..REPORT_EVERY_N_SAMPLES {
            consumer.latency_buffer.push(i as u64);
        }

        let report = consumer.analyze_and_report().unwrap();
        assert_eq!(report.total_events, REPORT_EVERY_N_SAMPLES);
        assert!(consumer.latency_buffer.is_empty());
    }

    #[tokio::test]
    async fn test_naver_api_called_increments_counter() {
        let q = queue();
        let mut consumer = Consumer::new(q, false);

        let event = Event::new(EventType::NaverApiCalled)
            .with_thread_id("t1")
            .with_payload("api_type", serde_json::Value::String("directions".to_string()));
        consumer.process_event(event).await;

        assert_eq!(*consumer.api_call_counts.get("directions").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_high_latency_triggers_warning_alert() {
        let q = queue();
        let mut consumer = Consumer::new(q, true);

        let event = Event::new(EventType::RequestCompleted)
            .with_thread_id("t1")
            .with_latency_ms(6000);
        // detect_anomalies doesn't return a value we can assert on directly here beyond
        // not panicking; the log line is the effect under test.
        consumer.process_event(event).await;
        assert_eq!(consumer.latency_buffer, vec![6000]);
    }
}
