//! Explicit wiring of every external collaborator.
//!
//! Components never reach for global handles. [`AppContext`] owns the
//! configuration, clock, credential store, and service clients, and builds
//! the dashboard, dispatcher, and bridge from them. Tests build one from
//! in-memory fakes with [`AppContext::with_services`].

use crate::agent::{Dispatcher, ToolDispatch};
use crate::brain::{Brain, LlmProvider};
use crate::bridge::{Bridge, BridgeSettings};
use crate::channels::ChatChannel;
use crate::channels::discord::create_discord_channel;
use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::credentials::{CredentialStore, KeyringCredentialStore, build_provider};
use crate::dashboard::{DashboardSettings, DashboardSync};
use crate::error::{ChannelError, TaskpinError};
use crate::memory::ConversationMemory;
use crate::oauth::CallbackSlot;
use crate::providers::create_provider;
use crate::tasks::{GoogleTasksClient, TaskListService};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct AppContext {
    pub config: AppConfig,
    pub clock: Arc<dyn Clock>,
    pub credential_store: Arc<dyn CredentialStore>,
    pub callback: Arc<CallbackSlot>,
    pub tasks: Arc<dyn TaskListService>,
    pub channel: Arc<dyn ChatChannel>,
    pub llm: Arc<dyn LlmProvider>,
    pub memory: Arc<ConversationMemory>,
}

impl AppContext {
    /// Connect to the real services named by `config`.
    pub fn from_config(config: AppConfig) -> Result<Self, TaskpinError> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let credential_store: Arc<dyn CredentialStore> = Arc::new(KeyringCredentialStore::new());

        let credentials = build_provider(
            &config.tasks.credentials,
            credential_store.clone(),
            clock.clone(),
        )?;
        let tasks: Arc<dyn TaskListService> =
            Arc::new(GoogleTasksClient::new(&config.tasks.api_base, credentials));

        let token = config.discord.resolve_token()?;
        let channel: Arc<dyn ChatChannel> = Arc::new(create_discord_channel(
            &config.discord.api_base,
            &token,
            config.discord.guild_id.clone(),
        ));

        let llm = create_provider(&config.llm)?;

        Ok(Self::with_services(
            config,
            clock,
            credential_store,
            tasks,
            channel,
            llm,
        ))
    }

    /// Assemble a context from already-built collaborators.
    pub fn with_services(
        config: AppConfig,
        clock: Arc<dyn Clock>,
        credential_store: Arc<dyn CredentialStore>,
        tasks: Arc<dyn TaskListService>,
        channel: Arc<dyn ChatChannel>,
        llm: Arc<dyn LlmProvider>,
    ) -> Self {
        let memory = Arc::new(ConversationMemory::new(config.agent.history_limit));
        Self {
            config,
            clock,
            credential_store,
            callback: Arc::new(CallbackSlot::new()),
            tasks,
            channel,
            llm,
            memory,
        }
    }

    pub fn brain(&self) -> Brain {
        Brain::new(self.llm.clone(), self.config.agent.system_prompt.clone())
            .with_temperature(self.config.llm.temperature)
            .with_max_tokens(self.config.llm.max_tokens)
    }

    pub fn dispatcher(&self, tools: Arc<dyn ToolDispatch>) -> Dispatcher {
        Dispatcher::new(
            Arc::new(self.brain()),
            tools,
            self.memory.clone(),
            self.config.agent.clone(),
        )
    }

    /// Look up the monitored channel's id by its configured name.
    pub async fn resolve_channel_id(&self) -> Result<String, ChannelError> {
        let name = &self.config.discord.channel_name;
        let id = self.channel.resolve_channel(name).await?;
        info!(channel = %name, channel_id = %id, "Resolved monitored channel");
        Ok(id)
    }

    pub fn dashboard(&self, channel_id: &str) -> DashboardSync {
        DashboardSync::new(
            self.channel.clone(),
            self.tasks.clone(),
            self.clock.clone(),
            DashboardSettings {
                channel_id: channel_id.to_string(),
                list_title: self.config.tasks.list_title.clone(),
                locale: self.config.sync.locale,
                history_scan_limit: self.config.sync.history_scan_limit,
            },
        )
    }

    pub fn bridge(&self, channel_id: &str, dispatcher: Arc<Dispatcher>) -> Bridge {
        let ttl = self.config.agent.reply_ttl_secs;
        Bridge::new(
            self.channel.clone(),
            dispatcher,
            BridgeSettings {
                channel_id: channel_id.to_string(),
                poll_interval: Duration::from_millis(self.config.discord.poll_interval_ms),
                reply_prefix: self.config.agent.reply_prefix.clone(),
                reply_ttl: (ttl > 0).then(|| Duration::from_secs(ttl)),
            },
        )
    }
}
