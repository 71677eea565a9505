//! # Taskpin Core
//!
//! Core library for the Taskpin homework bridge.
//! Provides the task-list client, classifier and renderer, the pinned
//! dashboard sync, the chat channel adapter, the LLM dispatch loop, and the
//! configuration, credential, and error plumbing they share.

pub mod agent;
pub mod brain;
pub mod bridge;
pub mod channels;
pub mod clock;
pub mod config;
pub mod context;
pub mod credentials;
pub mod dashboard;
pub mod error;
pub mod health;
pub mod memory;
pub mod oauth;
pub mod providers;
pub mod tasks;
pub mod types;

// Re-export commonly used types at the crate root.
pub use agent::{ConversationTurn, Dispatcher, ToolCallRecord, ToolDispatch, TurnOutcome};
pub use brain::{Brain, LlmProvider, MockLlmProvider};
pub use bridge::{Bridge, BridgeSettings};
pub use channels::{ChatChannel, ChatMessage, InMemoryChannel};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{AppConfig, ConfigOverrides, load_config};
pub use context::AppContext;
pub use dashboard::{DashboardState, DashboardSync, SyncOutcome};
pub use error::{ErrorClass, Result, TaskpinError};
pub use memory::ConversationMemory;
pub use tasks::{InMemoryTaskList, Task, TaskListService, TaskStatus};
pub use types::{
    CompletionRequest, CompletionResponse, Content, Message, Role, TokenUsage, ToolCall,
    ToolDefinition, ToolOutput,
};
