//! Configuration system for Taskpin.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> CLI args.
//! Configuration is loaded from `~/.config/taskpin/config.toml` and/or `.taskpin/config.toml`
//! in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::tasks::render::Locale;

/// Top-level configuration for the Taskpin bridge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub discord: DiscordSettings,
    pub tasks: TasksSettings,
    pub llm: LlmConfig,
    pub sync: SyncSettings,
    pub agent: AgentSettings,
    pub health: HealthSettings,
}

impl AppConfig {
    /// Check values that deserialize fine but cannot drive the daemon.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        if self.sync.interval_secs == 0 {
            problems.push("sync.interval_secs must be greater than zero".to_string());
        }
        if self.sync.history_scan_limit == 0 {
            problems.push("sync.history_scan_limit must be greater than zero".to_string());
        }
        if self.agent.max_steps == 0 {
            problems.push("agent.max_steps must be greater than zero".to_string());
        }
        if self.agent.history_limit == 0 {
            problems.push("agent.history_limit must be greater than zero".to_string());
        }
        if self.discord.poll_interval_ms == 0 {
            problems.push("discord.poll_interval_ms must be greater than zero".to_string());
        }
        if self.discord.channel_name.trim().is_empty() {
            problems.push("discord.channel_name must not be empty".to_string());
        }
        if self.tasks.list_title.trim().is_empty() {
            problems.push("tasks.list_title must not be empty".to_string());
        }
        if self.llm.timeout_secs == 0 {
            problems.push("llm.timeout_secs must be greater than zero".to_string());
        }
        if let Err(e) = self.sync.tz() {
            problems.push(e.to_string());
        }
        if let Err(e) = self.health.addr() {
            problems.push(e.to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid {
                message: problems.join("; "),
            })
        }
    }
}

/// Discord connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscordSettings {
    /// Inline bot token. Prefer `bot_token_env`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_token: Option<String>,
    pub bot_token_env: String,
    /// Restrict channel lookup to one guild.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<String>,
    pub channel_name: String,
    pub api_base: String,
    pub poll_interval_ms: u64,
}

impl Default for DiscordSettings {
    fn default() -> Self {
        Self {
            bot_token: None,
            bot_token_env: "DISCORD_TOKEN".to_string(),
            guild_id: None,
            channel_name: "hausaufgaben".to_string(),
            api_base: "https://discord.com/api/v10".to_string(),
            poll_interval_ms: 2000,
        }
    }
}

impl DiscordSettings {
    pub fn resolve_token(&self) -> Result<String, ConfigError> {
        if let Some(token) = &self.bot_token {
            return Ok(token.clone());
        }
        read_env(&self.bot_token_env)
    }
}

/// Task-list service settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksSettings {
    pub list_title: String,
    pub api_base: String,
    pub credentials: CredentialSource,
}

impl Default for TasksSettings {
    fn default() -> Self {
        Self {
            list_title: "Schule".to_string(),
            api_base: "https://tasks.googleapis.com/tasks/v1".to_string(),
            credentials: CredentialSource::default(),
        }
    }
}

/// How the task-list client obtains access tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CredentialSource {
    /// A pre-issued access token read from the environment.
    StaticToken { token_env: String },
    /// A long-lived refresh token exchanged for access tokens on demand.
    RefreshToken {
        client_id_env: String,
        client_secret_env: String,
        refresh_token_env: String,
        token_url: String,
    },
    /// Browser login once, then the refresh token lives in the OS keyring.
    Interactive {
        client_id_env: String,
        client_secret_env: String,
        auth_url: String,
        token_url: String,
        redirect_uri: String,
        scopes: Vec<String>,
    },
}

pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const GOOGLE_TASKS_SCOPE: &str = "https://www.googleapis.com/auth/tasks";

impl Default for CredentialSource {
    fn default() -> Self {
        CredentialSource::Interactive {
            client_id_env: "GOOGLE_CLIENT_ID".to_string(),
            client_secret_env: "GOOGLE_CLIENT_SECRET".to_string(),
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            redirect_uri: "http://localhost:8000/auth/callback".to_string(),
            scopes: vec![GOOGLE_TASKS_SCOPE.to_string()],
        }
    }
}

impl CredentialSource {
    pub fn kind(&self) -> &'static str {
        match self {
            CredentialSource::StaticToken { .. } => "static_token",
            CredentialSource::RefreshToken { .. } => "refresh_token",
            CredentialSource::Interactive { .. } => "interactive",
        }
    }
}

/// Configuration for the language model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://models.inference.ai.azure.com".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "AZURE_TOKEN".to_string(),
            api_key: None,
            temperature: 0.2,
            max_tokens: None,
            timeout_secs: 60,
        }
    }
}

/// Dashboard synchronization settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub interval_secs: u64,
    /// How many recent messages to scan for an existing pinned dashboard.
    pub history_scan_limit: usize,
    pub locale: Locale,
    /// IANA zone used for "today" when parsing relative due dates.
    pub timezone: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            history_scan_limit: 10,
            locale: Locale::En,
            timezone: "UTC".to_string(),
        }
    }
}

impl SyncSettings {
    pub fn tz(&self) -> Result<chrono_tz::Tz, ConfigError> {
        self.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| ConfigError::Invalid {
                message: format!("sync.timezone '{}' is not an IANA zone", self.timezone),
            })
    }
}

/// Dispatch loop and reply settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub max_steps: usize,
    pub tool_retries: usize,
    pub llm_retries: usize,
    pub history_limit: usize,
    pub thread_id: String,
    pub reply_prefix: String,
    /// Seconds before the utterance and reply are deleted. 0 keeps them.
    pub reply_ttl_secs: u64,
    pub system_prompt: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_steps: 12,
            tool_retries: 2,
            llm_retries: 2,
            history_limit: 20,
            thread_id: "default".to_string(),
            reply_prefix: "**Agent Response:** ".to_string(),
            reply_ttl_secs: 30,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a homework assistant for a school class. \
Students tell you about assignments in plain language. Use create_task to add an assignment, \
complete_task to mark one done, and get_pending_and_passed_tasks to look up what is open. \
Call get_current_date before working out relative dates like \"Friday\" or \"next week\" \
when you are unsure what today is. Pass due dates through as the student wrote them unless \
you are certain of the exact date. After a task is created, always mention its ID. \
Keep replies short.";

/// Liveness and OAuth callback server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub bind: String,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
        }
    }
}

impl HealthSettings {
    pub fn addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind.parse().map_err(|_| ConfigError::Invalid {
            message: format!("health.bind '{}' is not a socket address", self.bind),
        })
    }
}

/// Values set from command-line flags. Only present fields override.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub channel_name: Option<String>,
    pub list_title: Option<String>,
    pub locale: Option<Locale>,
    pub interval_secs: Option<u64>,
    pub model: Option<String>,
}

fn read_env(var: &str) -> Result<String, ConfigError> {
    std::env::var(var)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::EnvVarMissing {
            var: var.to_string(),
        })
}

/// Read a secret from the named environment variable.
pub fn env_secret(var: &str) -> Result<String, ConfigError> {
    read_env(var)
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("dev", "taskpin", "taskpin")
}

/// Path of the user-level config file, if a home directory exists.
pub fn user_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Directory for rolling log files.
pub fn log_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.data_local_dir().join("logs"))
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `TASKPIN_`)
/// 3. An explicit config file (`--config`)
/// 4. Workspace-local config (`.taskpin/config.toml`)
/// 5. User config (`~/.config/taskpin/config.toml`)
/// 6. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    explicit: Option<&Path>,
    overrides: &ConfigOverrides,
) -> Result<AppConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

    if let Some(user_config) = user_config_path()
        && user_config.exists()
    {
        figment = figment.merge(Toml::file(&user_config));
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".taskpin").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        figment = figment.merge(Toml::file(path));
    }

    // TASKPIN_SYNC__INTERVAL_SECS, TASKPIN_DISCORD__CHANNEL_NAME, etc.
    figment = figment.merge(Env::prefixed("TASKPIN_").split("__"));

    if let Some(v) = &overrides.channel_name {
        figment = figment.merge(Serialized::default("discord.channel_name", v));
    }
    if let Some(v) = &overrides.list_title {
        figment = figment.merge(Serialized::default("tasks.list_title", v));
    }
    if let Some(v) = &overrides.locale {
        figment = figment.merge(Serialized::default("sync.locale", v));
    }
    if let Some(v) = overrides.interval_secs {
        figment = figment.merge(Serialized::default("sync.interval_secs", v));
    }
    if let Some(v) = &overrides.model {
        figment = figment.merge(Serialized::default("llm.model", v));
    }

    figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })
}

/// Write a default config file to `path`, refusing to clobber an existing one.
pub fn write_default_config(path: &Path) -> Result<(), ConfigError> {
    if path.exists() {
        return Err(ConfigError::Invalid {
            message: format!("{} already exists", path.display()),
        });
    }
    let body = toml::to_string_pretty(&AppConfig::default()).map_err(|e| {
        ConfigError::ParseError {
            message: e.to_string(),
        }
    })?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::Invalid {
            message: format!("cannot create {}: {}", parent.display(), e),
        })?;
    }
    std::fs::write(path, body).map_err(|e| ConfigError::Invalid {
        message: format!("cannot write {}: {}", path.display(), e),
    })
}
