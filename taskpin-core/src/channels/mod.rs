//! Chat surface abstraction.
//!
//! [`ChatChannel`] covers what the dashboard and the reply path need from a
//! chat transport: send, edit, delete, pin, and read history. Inbound
//! delivery is polling based: callers ask for messages newer than the last
//! one they saw.

pub mod discord;
pub mod memory;

use crate::error::ChannelError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use discord::{DiscordChannel, DiscordHttpClient, RealDiscordHttp};
pub use memory::{ChannelCall, ChannelOp, InMemoryChannel};

/// Discord's hard per-message limit.
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 2000;

/// Most messages one history read returns.
pub const MAX_FETCH_PAGE: usize = 100;

/// A message as seen in channel history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub channel_id: String,
    pub author_id: String,
    pub author_name: String,
    pub content: String,
    #[serde(default)]
    pub pinned: bool,
}

/// A chat transport.
#[async_trait]
pub trait ChatChannel: Send + Sync {
    /// Find a text channel by name and return its id.
    async fn resolve_channel(&self, name: &str) -> Result<String, ChannelError>;

    /// The user id this process posts as.
    async fn self_id(&self) -> Result<String, ChannelError>;

    /// Post a message and return its id.
    async fn send(&self, channel_id: &str, text: &str) -> Result<String, ChannelError>;

    /// Replace a message's text. A deleted message yields
    /// [`ChannelError::MessageMissing`].
    async fn edit(&self, channel_id: &str, message_id: &str, text: &str)
    -> Result<(), ChannelError>;

    async fn delete(&self, channel_id: &str, message_id: &str) -> Result<(), ChannelError>;

    async fn pin(&self, channel_id: &str, message_id: &str) -> Result<(), ChannelError>;

    /// The `limit` most recent messages, newest first.
    async fn fetch_history(
        &self,
        channel_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, ChannelError>;

    /// Messages posted after the message id `after`, oldest first. At most
    /// [`MAX_FETCH_PAGE`] are returned; a full page means more may follow.
    async fn fetch_since(
        &self,
        channel_id: &str,
        after: &str,
    ) -> Result<Vec<ChatMessage>, ChannelError>;

    fn max_message_len(&self) -> usize {
        DEFAULT_MAX_MESSAGE_LEN
    }
}
