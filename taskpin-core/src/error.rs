//! Error types for the Taskpin core.
//!
//! Uses `thiserror` for public API error types. Every domain error can be
//! classified as [`ErrorClass::Transient`] (the caller may retry) or
//! [`ErrorClass::Permanent`] (the caller must not retry).

use std::path::PathBuf;

/// Retry classification shared by every error domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Network failure, rate limit, or refreshable credential expiry.
    Transient,
    /// Not-found, validation failure, malformed input, exhausted dispatch steps.
    Permanent,
}

impl ErrorClass {
    pub fn is_transient(self) -> bool {
        self == ErrorClass::Transient
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Permanent => write!(f, "permanent"),
        }
    }
}

/// Top-level error type for the Taskpin core library.
#[derive(Debug, thiserror::Error)]
pub enum TaskpinError {
    #[error("Task list error: {0}")]
    TaskList(#[from] TaskListError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskpinError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TaskpinError::TaskList(e) => e.class(),
            TaskpinError::Channel(e) => e.class(),
            TaskpinError::Llm(e) => e.class(),
            TaskpinError::Tool(e) => e.class(),
            TaskpinError::Auth(e) => e.class(),
            TaskpinError::Dispatch(e) => e.class(),
            TaskpinError::Config(_) => ErrorClass::Permanent,
            TaskpinError::Io(_) => ErrorClass::Transient,
        }
    }
}

/// Errors from the external task-list service.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskListError {
    #[error("Task service unreachable: {message}")]
    Network { message: String },

    #[error("Task service rate limited the request")]
    RateLimited,

    #[error("Task service credentials expired")]
    AuthExpired,

    #[error("Task service server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Task '{id}' not found")]
    NotFound { id: String },

    #[error("Task list '{title}' not found")]
    ListNotFound { title: String },

    #[error("Task service rejected the request: {message}")]
    InvalidInput { message: String },

    #[error("Unexpected task service response: {message}")]
    Decode { message: String },
}

impl TaskListError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TaskListError::Network { .. }
            | TaskListError::RateLimited
            | TaskListError::AuthExpired
            | TaskListError::Server { .. } => ErrorClass::Transient,
            TaskListError::NotFound { .. }
            | TaskListError::ListNotFound { .. }
            | TaskListError::InvalidInput { .. }
            | TaskListError::Decode { .. } => ErrorClass::Permanent,
        }
    }
}

impl From<AuthError> for TaskListError {
    fn from(err: AuthError) -> Self {
        match err.class() {
            ErrorClass::Transient => TaskListError::Network {
                message: err.to_string(),
            },
            ErrorClass::Permanent => TaskListError::InvalidInput {
                message: err.to_string(),
            },
        }
    }
}

/// Errors from the chat surface.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("Chat service unreachable: {message}")]
    Network { message: String },

    #[error("Chat service rate limited the request, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Chat service server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Message {message_id} no longer exists")]
    MessageMissing { message_id: String },

    #[error("Channel '{name}' not found")]
    ChannelNotFound { name: String },

    #[error("Missing permission for {action}: {message}")]
    Forbidden { action: String, message: String },

    #[error("Authentication failed for channel {name}")]
    AuthFailed { name: String },

    #[error("Unexpected chat service response: {message}")]
    Decode { message: String },
}

impl ChannelError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ChannelError::Network { .. }
            | ChannelError::RateLimited { .. }
            | ChannelError::Server { .. } => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }
}

/// Errors from LLM provider interactions.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Provider connection failed: {message}")]
    Connection { message: String },
}

impl LlmError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LlmError::RateLimited { .. } | LlmError::Timeout { .. } | LlmError::Connection { .. } => {
                ErrorClass::Transient
            }
            _ => ErrorClass::Permanent,
        }
    }
}

/// Errors from tool registration, validation, and execution.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error("Tool not found: {name}")]
    NotFound { name: String },

    #[error("Tool already registered: {name}")]
    AlreadyRegistered { name: String },

    #[error("Invalid arguments for tool '{name}': {field}: {reason}")]
    InvalidArguments {
        name: String,
        field: String,
        reason: String,
    },

    #[error("Tool '{name}' failed: {message}")]
    Upstream {
        name: String,
        class: ErrorClass,
        message: String,
    },

    #[error("Tool '{name}' timed out after {timeout_secs}s")]
    Timeout { name: String, timeout_secs: u64 },
}

impl ToolError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ToolError::Upstream { class, .. } => *class,
            ToolError::Timeout { .. } => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }

    /// Wrap a task-list failure, keeping its retry class.
    pub fn upstream(name: impl Into<String>, err: &TaskListError) -> Self {
        ToolError::Upstream {
            name: name.into(),
            class: err.class(),
            message: err.to_string(),
        }
    }

    pub fn invalid(
        name: impl Into<String>,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        ToolError::InvalidArguments {
            name: name.into(),
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Environment variable not set: {var}")]
    EnvVarMissing { var: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Errors from credential acquisition and refresh.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("Token endpoint unreachable: {message}")]
    Network { message: String },

    #[error("Token endpoint server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Token request rejected: {message}")]
    Rejected { message: String },

    #[error("No stored credential for {provider}; run `taskpin auth login`")]
    MissingCredential { provider: String },

    #[error("Authorization flow failed: {message}")]
    FlowFailed { message: String },
}

impl AuthError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AuthError::Network { .. } | AuthError::Server { .. } => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }
}

/// Errors from the agent dispatch loop.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("Maximum steps ({max}) reached without a final reply")]
    MaxStepsReached { max: usize },

    #[error("Model call failed: {0}")]
    Model(#[from] LlmError),
}

impl DispatchError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DispatchError::MaxStepsReached { .. } => ErrorClass::Permanent,
            DispatchError::Model(e) => e.class(),
        }
    }
}

/// A type alias for results using the top-level `TaskpinError`.
pub type Result<T> = std::result::Result<T, TaskpinError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_not_found_names_title() {
        let err = TaskListError::ListNotFound {
            title: "Schule".into(),
        };
        assert_eq!(err.to_string(), "Task list 'Schule' not found");
        assert_eq!(err.class(), ErrorClass::Permanent);
    }

    #[test]
    fn test_task_list_error_classes() {
        assert!(TaskListError::RateLimited.class().is_transient());
        assert!(TaskListError::AuthExpired.class().is_transient());
        assert!(
            TaskListError::Network {
                message: "reset".into()
            }
            .class()
            .is_transient()
        );
        assert!(
            !TaskListError::NotFound { id: "t1".into() }
                .class()
                .is_transient()
        );
    }

    #[test]
    fn test_channel_error_message_missing_is_permanent() {
        let err = ChannelError::MessageMissing {
            message_id: "42".into(),
        };
        assert_eq!(err.class(), ErrorClass::Permanent);
        assert_eq!(err.to_string(), "Message 42 no longer exists");
    }

    #[test]
    fn test_tool_error_keeps_upstream_class() {
        let err = ToolError::upstream("create_task", &TaskListError::RateLimited);
        assert_eq!(err.class(), ErrorClass::Transient);

        let err = ToolError::invalid("create_task", "title", "must not be empty");
        assert_eq!(err.class(), ErrorClass::Permanent);
        assert_eq!(
            err.to_string(),
            "Invalid arguments for tool 'create_task': title: must not be empty"
        );
    }

    #[test]
    fn test_top_level_class_delegates() {
        let err: TaskpinError = LlmError::Timeout { timeout_secs: 30 }.into();
        assert_eq!(err.class(), ErrorClass::Transient);

        let err: TaskpinError = DispatchError::MaxStepsReached { max: 12 }.into();
        assert_eq!(err.class(), ErrorClass::Permanent);
        assert_eq!(
            err.to_string(),
            "Dispatch error: Maximum steps (12) reached without a final reply"
        );
    }

    #[test]
    fn test_auth_error_into_task_list_error() {
        let err: TaskListError = AuthError::Network {
            message: "dns".into(),
        }
        .into();
        assert!(err.class().is_transient());

        let err: TaskListError = AuthError::MissingCredential {
            provider: "google".into(),
        }
        .into();
        assert_eq!(err.class(), ErrorClass::Permanent);
    }
}
