//! Brain module: LLM provider abstraction and interaction.
//!
//! Defines the `LlmProvider` trait for model-agnostic completions, the
//! `Brain` wrapper that adds the system prompt and transient-error retry,
//! and a queue-driven `MockLlmProvider` for tests.

use crate::error::LlmError;
use crate::types::{
    CompletionRequest, CompletionResponse, Content, Message, Role, TokenUsage, ToolDefinition,
};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Trait for LLM providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Perform a full completion and return the response.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Return the model name.
    fn model_name(&self) -> &str;

    /// Return whether this provider supports tool/function calling.
    fn supports_tools(&self) -> bool {
        true
    }
}

/// Drop tool results whose tool call is no longer in the sequence.
///
/// Conversation memory is trimmed from the front, which can cut an
/// assistant tool call while keeping its result. Providers reject that.
pub fn sanitize_tool_sequence(messages: &mut Vec<Message>) {
    let mut tool_call_ids: HashSet<String> = HashSet::new();
    for msg in messages.iter().filter(|m| m.role == Role::Assistant) {
        for call in msg.content.tool_calls() {
            tool_call_ids.insert(call.id);
        }
    }

    messages.retain(|msg| match &msg.content {
        Content::ToolResult { call_id, .. } if !tool_call_ids.contains(call_id) => {
            warn!(
                call_id = call_id.as_str(),
                "Removing orphaned tool_result (no matching tool_call)"
            );
            false
        }
        _ => true,
    });
}

/// The Brain wraps an LLM provider and adds the system prompt, usage
/// tracking, and retry on transient failures.
pub struct Brain {
    provider: Arc<dyn LlmProvider>,
    system_prompt: String,
    temperature: f32,
    max_tokens: Option<usize>,
    retry_backoff: Duration,
    total_usage: Mutex<TokenUsage>,
}

impl Brain {
    pub fn new(provider: Arc<dyn LlmProvider>, system_prompt: impl Into<String>) -> Self {
        Self {
            provider,
            system_prompt: system_prompt.into(),
            temperature: 0.2,
            max_tokens: None,
            retry_backoff: Duration::from_secs(1),
            total_usage: Mutex::new(TokenUsage::default()),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<usize>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Base delay for the first retry; later retries double it.
    pub fn with_retry_backoff(mut self, base: Duration) -> Self {
        self.retry_backoff = base;
        self
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn total_usage(&self) -> TokenUsage {
        self.total_usage
            .lock()
            .map(|u| *u)
            .unwrap_or_default()
    }

    /// Construct messages for the LLM with the system prompt prepended.
    pub fn build_messages(&self, conversation: &[Message]) -> Vec<Message> {
        let mut messages = Vec::with_capacity(conversation.len() + 1);
        messages.push(Message::system(&self.system_prompt));
        messages.extend_from_slice(conversation);
        sanitize_tool_sequence(&mut messages);
        messages
    }

    /// Send one completion request and return the response, tracking usage.
    pub async fn think(
        &self,
        conversation: &[Message],
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<CompletionResponse, LlmError> {
        let messages = self.build_messages(conversation);
        debug!(
            model = self.provider.model_name(),
            messages = messages.len(),
            "Sending completion request"
        );

        let tools = if self.provider.supports_tools() {
            tools
        } else {
            None
        };
        let request = CompletionRequest {
            messages,
            tools,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            model: None,
        };

        let response = self.provider.complete(request).await?;
        if let Ok(mut total) = self.total_usage.lock() {
            total.accumulate(&response.usage);
        }
        info!(
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "Completion received"
        );
        Ok(response)
    }

    /// Send a completion request with retry logic and exponential backoff.
    ///
    /// Retries on transient errors (RateLimited, Timeout, Connection) up to
    /// `max_retries` times, doubling the wait each time and capping it at 32s.
    pub async fn think_with_retry(
        &self,
        conversation: &[Message],
        tools: Option<Vec<ToolDefinition>>,
        max_retries: usize,
    ) -> Result<CompletionResponse, LlmError> {
        let mut attempt = 0;
        loop {
            match self.think(conversation, tools.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) if Self::is_retryable(&e) && attempt < max_retries => {
                    let backoff = std::cmp::min(
                        self.retry_backoff.saturating_mul(1u32 << attempt.min(5)),
                        Duration::from_secs(32),
                    );
                    let wait = match &e {
                        LlmError::RateLimited { retry_after_secs } => {
                            std::cmp::max(Duration::from_secs(*retry_after_secs), backoff)
                                .min(Duration::from_secs(32))
                        }
                        _ => backoff,
                    };
                    info!(
                        attempt = attempt + 1,
                        max_retries,
                        backoff_ms = wait.as_millis() as u64,
                        error = %e,
                        "Retrying after transient error"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn is_retryable(error: &LlmError) -> bool {
        error.class().is_transient()
    }
}

/// Scripted provider. Pops queued outcomes in order and records every
/// request it receives.
pub struct MockLlmProvider {
    model: String,
    outcomes: Mutex<VecDeque<Result<CompletionResponse, LlmError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockLlmProvider {
    pub fn new() -> Self {
        Self {
            model: "mock-model".to_string(),
            outcomes: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Create a MockLlmProvider that answers every call with `text`.
    pub fn with_response(text: &str) -> Self {
        let provider = Self::new();
        for _ in 0..20 {
            provider.queue_response(Self::text_response(text));
        }
        provider
    }

    /// Queue a response to be returned by the next `complete` call.
    pub fn queue_response(&self, response: CompletionResponse) {
        if let Ok(mut q) = self.outcomes.lock() {
            q.push_back(Ok(response));
        }
    }

    /// Queue a failure to be returned by the next `complete` call.
    pub fn queue_error(&self, error: LlmError) {
        if let Ok(mut q) = self.outcomes.lock() {
            q.push_back(Err(error));
        }
    }

    /// Requests seen so far, oldest first.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Create a simple text response for testing.
    pub fn text_response(text: &str) -> CompletionResponse {
        CompletionResponse {
            message: Message::assistant(text),
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
            },
            model: "mock-model".to_string(),
            finish_reason: Some("stop".to_string()),
        }
    }

    /// Create a tool call response for testing.
    pub fn tool_call_response(tool_name: &str, arguments: serde_json::Value) -> CompletionResponse {
        Self::tool_calls_response(vec![(tool_name, arguments)])
    }

    /// Several tool calls in one assistant turn.
    pub fn tool_calls_response(calls: Vec<(&str, serde_json::Value)>) -> CompletionResponse {
        let mut parts: Vec<Content> = calls
            .into_iter()
            .map(|(name, args)| {
                Content::tool_call(format!("call_{}", uuid::Uuid::new_v4()), name, args)
            })
            .collect();
        let content = if parts.len() == 1 {
            parts.remove(0)
        } else {
            Content::MultiPart { parts }
        };
        CompletionResponse {
            message: Message::new(Role::Assistant, content),
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 30,
            },
            model: "mock-model".to_string(),
            finish_reason: Some("tool_calls".to_string()),
        }
    }
}

impl Default for MockLlmProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        if let Ok(mut seen) = self.requests.lock() {
            seen.push(request);
        }
        let next = self.outcomes.lock().ok().and_then(|mut q| q.pop_front());
        next.unwrap_or_else(|| {
            Ok(MockLlmProvider::text_response(
                "I'm a mock LLM. No queued responses available.",
            ))
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn brain(provider: Arc<MockLlmProvider>) -> Brain {
        Brain::new(provider, "You are a test assistant.").with_retry_backoff(Duration::ZERO)
    }

    #[test]
    fn test_build_messages_prepends_system_prompt() {
        let b = brain(Arc::new(MockLlmProvider::new()));
        let msgs = b.build_messages(&[Message::user("hi")]);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::System);
        assert_eq!(msgs[0].content.as_text(), Some("You are a test assistant."));
    }

    #[test]
    fn test_sanitize_removes_orphaned_results() {
        let mut msgs = vec![
            Message::tool_result("gone", "stale", false),
            Message::new(
                Role::Assistant,
                Content::tool_call("c1", "get_current_date", json!({})),
            ),
            Message::tool_result("c1", "2024-03-04", false),
        ];
        sanitize_tool_sequence(&mut msgs);
        assert_eq!(msgs.len(), 2);
        assert!(matches!(
            &msgs[1].content,
            Content::ToolResult { call_id, .. } if call_id == "c1"
        ));
    }

    #[test]
    fn test_is_retryable() {
        assert!(Brain::is_retryable(&LlmError::RateLimited {
            retry_after_secs: 0
        }));
        assert!(Brain::is_retryable(&LlmError::Timeout { timeout_secs: 30 }));
        assert!(Brain::is_retryable(&LlmError::Connection {
            message: "reset".into()
        }));
        assert!(!Brain::is_retryable(&LlmError::AuthFailed {
            provider: "x".into()
        }));
    }

    #[tokio::test]
    async fn test_think_tracks_usage() {
        let provider = Arc::new(MockLlmProvider::with_response("ok"));
        let b = brain(provider);
        b.think(&[Message::user("a")], None).await.unwrap();
        b.think(&[Message::user("b")], None).await.unwrap();
        assert_eq!(b.total_usage().total(), 300);
    }

    #[tokio::test]
    async fn test_think_with_retry_succeeds_after_failures() {
        let provider = Arc::new(MockLlmProvider::new());
        provider.queue_error(LlmError::Connection {
            message: "reset".into(),
        });
        provider.queue_error(LlmError::Timeout { timeout_secs: 1 });
        provider.queue_response(MockLlmProvider::text_response("finally"));
        let b = brain(provider.clone());

        let result = b.think_with_retry(&[Message::user("x")], None, 3).await;
        assert_eq!(result.unwrap().message.content.as_text(), Some("finally"));
        assert_eq!(provider.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_think_with_retry_exhausted() {
        let provider = Arc::new(MockLlmProvider::new());
        for _ in 0..3 {
            provider.queue_error(LlmError::Connection {
                message: "down".into(),
            });
        }
        let b = brain(provider.clone());
        let result = b.think_with_retry(&[Message::user("x")], None, 2).await;
        assert!(matches!(result, Err(LlmError::Connection { .. })));
        assert_eq!(provider.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_think_with_retry_non_retryable_fails_immediately() {
        let provider = Arc::new(MockLlmProvider::new());
        provider.queue_error(LlmError::AuthFailed {
            provider: "azure".into(),
        });
        let b = brain(provider.clone());
        let result = b.think_with_retry(&[Message::user("x")], None, 3).await;
        assert!(matches!(result, Err(LlmError::AuthFailed { .. })));
        assert_eq!(provider.requests().len(), 1);
    }

    #[test]
    fn test_tool_calls_response_multipart() {
        let resp = MockLlmProvider::tool_calls_response(vec![
            ("get_current_date", json!({})),
            ("get_pending_and_passed_tasks", json!({})),
        ]);
        let calls = resp.message.content.tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].name, "get_pending_and_passed_tasks");
    }
}
