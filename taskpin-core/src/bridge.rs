//! Chat channel to agent bridge.
//!
//! Polls the monitored channel for new messages, skips the bot's own posts,
//! and hands every utterance to its own task running the [`Dispatcher`].
//! Replies carry a fixed prefix and, when a TTL is set, both the utterance
//! and the reply are deleted once it expires.

use crate::agent::Dispatcher;
use crate::channels::{ChatChannel, ChatMessage, MAX_FETCH_PAGE};
use crate::error::ChannelError;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub channel_id: String,
    pub poll_interval: Duration,
    pub reply_prefix: String,
    /// Delete the utterance and reply after this long. `None` keeps them.
    pub reply_ttl: Option<Duration>,
}

pub struct Bridge {
    channel: Arc<dyn ChatChannel>,
    dispatcher: Arc<Dispatcher>,
    settings: BridgeSettings,
}

impl Bridge {
    pub fn new(
        channel: Arc<dyn ChatChannel>,
        dispatcher: Arc<Dispatcher>,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            channel,
            dispatcher,
            settings,
        }
    }

    /// Id of the newest message in the channel, used as the starting
    /// cursor so history is not replayed on startup.
    pub async fn latest_cursor(&self) -> Result<Option<String>, ChannelError> {
        let newest = self
            .channel
            .fetch_history(&self.settings.channel_id, 1)
            .await?;
        Ok(newest.into_iter().next().map(|m| m.id))
    }

    /// Fetch messages newer than `cursor`, advance it, and return the ones
    /// that need an answer. `None` means the channel was empty at startup.
    /// Full pages are followed until a short one arrives.
    pub async fn poll_once(
        &self,
        cursor: &mut Option<String>,
    ) -> Result<Vec<ChatMessage>, ChannelError> {
        let mut after = cursor.clone().unwrap_or_else(|| "0".to_string());
        let mut fresh = Vec::new();
        loop {
            let page = self
                .channel
                .fetch_since(&self.settings.channel_id, &after)
                .await?;
            let full = page.len() >= MAX_FETCH_PAGE;
            let Some(last) = page.last() else { break };
            after = last.id.clone();
            fresh.extend(page);
            if !full {
                break;
            }
            debug!(after = %after, "Full page of new messages; fetching the next one");
        }

        let self_id = self.channel.self_id().await?;
        if let Some(last) = fresh.last() {
            *cursor = Some(last.id.clone());
        }
        Ok(fresh
            .into_iter()
            .filter(|m| m.author_id != self_id && !m.content.trim().is_empty())
            .collect())
    }

    /// Read the starting cursor, retrying every poll interval until it
    /// succeeds. History is never treated as new. `None` when cancelled.
    async fn startup_cursor(&self, cancel: &CancellationToken) -> Option<Option<String>> {
        loop {
            match self.latest_cursor().await {
                Ok(cursor) => return Some(cursor),
                Err(e) => {
                    warn!(class = %e.class(), error = %e, "Could not read channel history; retrying")
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
    }

    /// Answer one utterance. Returns the reply's message id if it was posted.
    pub async fn handle_message(&self, message: &ChatMessage, cancel: &CancellationToken) -> Option<String> {
        info!(
            channel_id = %message.channel_id,
            message_id = %message.id,
            author = %message.author_name,
            "Handling utterance"
        );
        let outcome = self.dispatcher.respond(&message.content).await;

        let mut text = format!("{}{}", self.settings.reply_prefix, outcome.reply);
        let limit = self.channel.max_message_len();
        if text.chars().count() > limit {
            text = text.chars().take(limit.saturating_sub(1)).collect();
            text.push('…');
        }

        let reply_id = match self.channel.send(&self.settings.channel_id, &text).await {
            Ok(id) => id,
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "Failed to post reply");
                return None;
            }
        };

        if let Some(ttl) = self.settings.reply_ttl {
            tokio::select! {
                _ = cancel.cancelled() => return Some(reply_id),
                _ = tokio::time::sleep(ttl) => {}
            }
            for id in [message.id.as_str(), reply_id.as_str()] {
                if let Err(e) = self.channel.delete(&self.settings.channel_id, id).await {
                    debug!(message_id = %id, error = %e, "Could not delete expired message");
                }
            }
        }
        Some(reply_id)
    }

    /// Poll until cancelled, spawning one task per utterance.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let Some(mut cursor) = self.startup_cursor(&cancel).await else {
            info!("Utterance listener stopped");
            return;
        };
        info!(
            channel_id = %self.settings.channel_id,
            poll_ms = self.settings.poll_interval.as_millis() as u64,
            "Listening for utterances"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }

            let messages = match self.poll_once(&mut cursor).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(class = %e.class(), error = %e, "Polling failed");
                    continue;
                }
            };
            for message in messages {
                let bridge = Arc::clone(&self);
                let cancel = cancel.child_token();
                tokio::spawn(async move {
                    bridge.handle_message(&message, &cancel).await;
                });
            }
        }
        info!("Utterance listener stopped");
    }
}
