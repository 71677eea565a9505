//! Agent dispatch loop.
//!
//! One inbound utterance becomes one [`ConversationTurn`]: the model is
//! asked for a reply, any tool calls it requests are executed in order and
//! fed back, and the loop repeats until the model answers in plain text or
//! the step ceiling is reached. Every turn ends with exactly one reply.

use crate::brain::Brain;
use crate::config::AgentSettings;
use crate::error::{DispatchError, ToolError};
use crate::memory::ConversationMemory;
use crate::types::{Message, ToolCall, ToolDefinition, ToolOutput};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Reply used when a turn cannot produce an answer.
pub const APOLOGY: &str =
    "Sorry, I couldn't finish that request. Please try again in a moment.";

/// Reply used when the model returns no text at all.
const EMPTY_REPLY: &str = "I don't have anything to add to that.";

/// The set of tools the model may call.
#[async_trait]
pub trait ToolDispatch: Send + Sync {
    /// Definitions advertised to the model.
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Validate and run one call.
    async fn execute(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolOutput, ToolError>;
}

/// One executed tool call as seen by the user-facing turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRecord {
    pub call: ToolCall,
    pub output: String,
    pub is_error: bool,
    pub attempts: usize,
}

/// The record of one utterance.
#[derive(Debug, Clone, Default)]
pub struct ConversationTurn {
    pub input: String,
    pub tool_calls: Vec<ToolCallRecord>,
    /// The model's own final text, when it produced one.
    pub final_reply: Option<String>,
    pub steps: usize,
}

/// A finished turn plus the text to post.
#[derive(Debug)]
pub struct TurnOutcome {
    pub turn: ConversationTurn,
    pub reply: String,
    pub error: Option<DispatchError>,
}

/// Runs turns against a [`Brain`] and a [`ToolDispatch`].
pub struct Dispatcher {
    brain: Arc<Brain>,
    tools: Arc<dyn ToolDispatch>,
    memory: Arc<ConversationMemory>,
    settings: AgentSettings,
    tool_backoff: Duration,
}

impl Dispatcher {
    pub fn new(
        brain: Arc<Brain>,
        tools: Arc<dyn ToolDispatch>,
        memory: Arc<ConversationMemory>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            brain,
            tools,
            memory,
            settings,
            tool_backoff: Duration::from_millis(500),
        }
    }

    /// Base delay between tool retries.
    pub fn with_tool_backoff(mut self, base: Duration) -> Self {
        self.tool_backoff = base;
        self
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// Handle one utterance. Never fails: dispatch errors become an apology.
    pub async fn respond(&self, utterance: &str) -> TurnOutcome {
        let thread_id = self.settings.thread_id.as_str();
        let mut turn = ConversationTurn {
            input: utterance.to_string(),
            ..ConversationTurn::default()
        };

        match self.run_turn(utterance, &mut turn).await {
            Ok((reply, messages)) => {
                self.memory.record_turn(thread_id, messages);
                info!(
                    steps = turn.steps,
                    tool_calls = turn.tool_calls.len(),
                    "Turn complete"
                );
                TurnOutcome {
                    turn,
                    reply,
                    error: None,
                }
            }
            Err(e) => {
                error!(error = %e, steps = turn.steps, "Turn failed");
                self.memory.record_turn(
                    thread_id,
                    vec![Message::user(utterance), Message::assistant(APOLOGY)],
                );
                TurnOutcome {
                    turn,
                    reply: APOLOGY.to_string(),
                    error: Some(e),
                }
            }
        }
    }

    async fn run_turn(
        &self,
        utterance: &str,
        turn: &mut ConversationTurn,
    ) -> Result<(String, Vec<Message>), DispatchError> {
        let history = self.memory.history(&self.settings.thread_id);
        let definitions = self.tools.definitions();
        let mut messages = vec![Message::user(utterance)];

        for step in 1..=self.settings.max_steps {
            turn.steps = step;
            let conversation: Vec<Message> =
                history.iter().chain(messages.iter()).cloned().collect();

            let response = self
                .brain
                .think_with_retry(
                    &conversation,
                    Some(definitions.clone()),
                    self.settings.llm_retries,
                )
                .await?;

            let calls = response.message.content.tool_calls();
            let text = response.message.content.joined_text();
            messages.push(response.message);

            if calls.is_empty() {
                let reply = if text.trim().is_empty() {
                    EMPTY_REPLY.to_string()
                } else {
                    turn.final_reply = Some(text.clone());
                    text
                };
                return Ok((reply, messages));
            }

            debug!(step, count = calls.len(), "Model requested tool calls");
            for call in calls {
                let record = self.execute_with_retry(call).await;
                messages.push(Message::tool_result(
                    &record.call.id,
                    &record.output,
                    record.is_error,
                ));
                turn.tool_calls.push(record);
            }
        }

        Err(DispatchError::MaxStepsReached {
            max: self.settings.max_steps,
        })
    }

    /// Run one call, retrying transient failures. Failures are returned as
    /// an error result for the model to explain, never raised.
    async fn execute_with_retry(&self, call: ToolCall) -> ToolCallRecord {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.tools.execute(&call.name, call.arguments.clone()).await {
                Ok(output) => {
                    debug!(tool = %call.name, attempt, "Tool call succeeded");
                    return ToolCallRecord {
                        call,
                        output: output.content,
                        is_error: false,
                        attempts: attempt,
                    };
                }
                Err(e) if e.class().is_transient() && attempt <= self.settings.tool_retries => {
                    let wait = self.tool_backoff.saturating_mul(1u32 << (attempt - 1).min(5));
                    warn!(
                        tool = %call.name,
                        attempt,
                        backoff_ms = wait.as_millis() as u64,
                        error = %e,
                        "Transient tool failure; retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => {
                    warn!(tool = %call.name, attempt, class = %e.class(), error = %e, "Tool call failed");
                    return ToolCallRecord {
                        call,
                        output: format!("Error: {}", e),
                        is_error: true,
                        attempts: attempt,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::MockLlmProvider;
    use crate::error::{ErrorClass, LlmError};
    use crate::types::{Content, Role};
    use serde_json::json;
    use std::sync::Mutex;

    /// Echoes arguments back and can be told to fail.
    struct ScriptedTools {
        failures: Mutex<Vec<ToolError>>,
        seen: Mutex<Vec<(String, serde_json::Value)>>,
    }

    impl ScriptedTools {
        fn new() -> Self {
            Self {
                failures: Mutex::new(Vec::new()),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn fail_with(&self, err: ToolError) {
            self.failures.lock().unwrap().push(err);
        }

        fn seen(&self) -> Vec<(String, serde_json::Value)> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ToolDispatch for ScriptedTools {
        fn definitions(&self) -> Vec<ToolDefinition> {
            vec![ToolDefinition {
                name: "get_current_date".into(),
                description: "today".into(),
                parameters: json!({"type": "object", "properties": {}}),
            }]
        }

        async fn execute(
            &self,
            name: &str,
            arguments: serde_json::Value,
        ) -> Result<ToolOutput, ToolError> {
            self.seen
                .lock()
                .unwrap()
                .push((name.to_string(), arguments.clone()));
            let next = {
                let mut failures = self.failures.lock().unwrap();
                if failures.is_empty() {
                    None
                } else {
                    Some(failures.remove(0))
                }
            };
            match next {
                Some(err) => Err(err),
                None => Ok(ToolOutput::text(format!("{} ok", name))),
            }
        }
    }

    fn dispatcher(
        provider: Arc<MockLlmProvider>,
        tools: Arc<ScriptedTools>,
        settings: AgentSettings,
    ) -> Dispatcher {
        let brain = Arc::new(Brain::new(provider, "sys").with_retry_backoff(Duration::ZERO));
        Dispatcher::new(
            brain,
            tools,
            Arc::new(ConversationMemory::new(settings.history_limit)),
            settings,
        )
        .with_tool_backoff(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_plain_reply_without_tools() {
        let provider = Arc::new(MockLlmProvider::new());
        provider.queue_response(MockLlmProvider::text_response("Hi there"));
        let tools = Arc::new(ScriptedTools::new());
        let d = dispatcher(provider, tools.clone(), AgentSettings::default());

        let out = d.respond("hello").await;
        assert_eq!(out.reply, "Hi there");
        assert_eq!(out.turn.final_reply.as_deref(), Some("Hi there"));
        assert!(out.turn.tool_calls.is_empty());
        assert!(tools.seen().is_empty());
        assert!(out.error.is_none());
    }

    #[tokio::test]
    async fn test_tool_calls_run_in_order_then_reply() {
        let provider = Arc::new(MockLlmProvider::new());
        provider.queue_response(MockLlmProvider::tool_calls_response(vec![
            ("get_current_date", json!({})),
            ("get_pending_and_passed_tasks", json!({})),
        ]));
        provider.queue_response(MockLlmProvider::text_response("Done"));
        let tools = Arc::new(ScriptedTools::new());
        let d = dispatcher(provider.clone(), tools.clone(), AgentSettings::default());

        let out = d.respond("what is due?").await;
        assert_eq!(out.reply, "Done");
        let names: Vec<_> = tools.seen().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["get_current_date", "get_pending_and_passed_tasks"]);
        assert_eq!(out.turn.steps, 2);

        // Second request carries both tool results after the assistant call.
        let second = &provider.requests()[1].messages;
        let results: Vec<_> = second.iter().filter(|m| m.role == Role::Tool).collect();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn test_step_ceiling_yields_apology() {
        let provider = Arc::new(MockLlmProvider::new());
        for _ in 0..3 {
            provider.queue_response(MockLlmProvider::tool_call_response(
                "get_current_date",
                json!({}),
            ));
        }
        let tools = Arc::new(ScriptedTools::new());
        let settings = AgentSettings {
            max_steps: 3,
            ..AgentSettings::default()
        };
        let d = dispatcher(provider, tools.clone(), settings);

        let out = d.respond("loop forever").await;
        assert_eq!(out.reply, APOLOGY);
        assert!(matches!(
            out.error,
            Some(DispatchError::MaxStepsReached { max: 3 })
        ));
        assert_eq!(tools.seen().len(), 3);
    }

    #[tokio::test]
    async fn test_transient_tool_error_is_retried() {
        let provider = Arc::new(MockLlmProvider::new());
        provider.queue_response(MockLlmProvider::tool_call_response(
            "get_current_date",
            json!({}),
        ));
        provider.queue_response(MockLlmProvider::text_response("ok"));
        let tools = Arc::new(ScriptedTools::new());
        tools.fail_with(ToolError::Upstream {
            name: "get_current_date".into(),
            class: ErrorClass::Transient,
            message: "reset".into(),
        });
        let d = dispatcher(provider, tools.clone(), AgentSettings::default());

        let out = d.respond("date?").await;
        let record = &out.turn.tool_calls[0];
        assert!(!record.is_error);
        assert_eq!(record.attempts, 2);
        assert_eq!(tools.seen().len(), 2);
    }

    #[tokio::test]
    async fn test_retries_exhausted_becomes_error_result() {
        let provider = Arc::new(MockLlmProvider::new());
        provider.queue_response(MockLlmProvider::tool_call_response(
            "get_current_date",
            json!({}),
        ));
        provider.queue_response(MockLlmProvider::text_response("Service is down."));
        let tools = Arc::new(ScriptedTools::new());
        for _ in 0..3 {
            tools.fail_with(ToolError::Upstream {
                name: "get_current_date".into(),
                class: ErrorClass::Transient,
                message: "reset".into(),
            });
        }
        let settings = AgentSettings {
            tool_retries: 2,
            ..AgentSettings::default()
        };
        let d = dispatcher(provider, tools.clone(), settings);

        let out = d.respond("date?").await;
        let record = &out.turn.tool_calls[0];
        assert!(record.is_error);
        assert_eq!(record.attempts, 3);
        assert!(record.output.starts_with("Error: "));
        assert_eq!(out.reply, "Service is down.");
    }

    #[tokio::test]
    async fn test_permanent_tool_error_not_retried() {
        let provider = Arc::new(MockLlmProvider::new());
        provider.queue_response(MockLlmProvider::tool_call_response("create_task", json!({})));
        provider.queue_response(MockLlmProvider::text_response("Need a title."));
        let tools = Arc::new(ScriptedTools::new());
        tools.fail_with(ToolError::invalid("create_task", "title", "is required"));
        let d = dispatcher(provider, tools.clone(), AgentSettings::default());

        let out = d.respond("make a task").await;
        assert_eq!(tools.seen().len(), 1);
        assert!(out.turn.tool_calls[0].output.contains("title: is required"));
    }

    #[tokio::test]
    async fn test_model_failure_yields_apology() {
        let provider = Arc::new(MockLlmProvider::new());
        provider.queue_error(LlmError::AuthFailed {
            provider: "azure".into(),
        });
        let tools = Arc::new(ScriptedTools::new());
        let d = dispatcher(provider, tools, AgentSettings::default());

        let out = d.respond("hello").await;
        assert_eq!(out.reply, APOLOGY);
        assert!(matches!(out.error, Some(DispatchError::Model(_))));
    }

    #[tokio::test]
    async fn test_empty_model_text_still_replies() {
        let provider = Arc::new(MockLlmProvider::new());
        provider.queue_response(MockLlmProvider::text_response("   "));
        let d = dispatcher(provider, Arc::new(ScriptedTools::new()), AgentSettings::default());
        let out = d.respond("hello").await;
        assert!(!out.reply.trim().is_empty());
        assert!(out.turn.final_reply.is_none());
    }

    #[tokio::test]
    async fn test_history_carries_into_next_turn() {
        let provider = Arc::new(MockLlmProvider::new());
        provider.queue_response(MockLlmProvider::text_response("first"));
        provider.queue_response(MockLlmProvider::text_response("second"));
        let d = dispatcher(
            provider.clone(),
            Arc::new(ScriptedTools::new()),
            AgentSettings::default(),
        );
        d.respond("one").await;
        d.respond("two").await;

        let second = &provider.requests()[1].messages;
        // system + user("one") + assistant("first") + user("two")
        assert_eq!(second.len(), 4);
        assert!(matches!(&second[1].content, Content::Text { text } if text == "one"));
    }
}
