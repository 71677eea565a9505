//! In-process chat channel for tests.

use super::{ChatChannel, ChatMessage, MAX_FETCH_PAGE};
use crate::error::ChannelError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Operation kinds, for call counting and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelOp {
    Resolve,
    Send,
    Edit,
    Delete,
    Pin,
    FetchHistory,
    FetchSince,
}

/// A recorded call against [`InMemoryChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelCall {
    pub op: ChannelOp,
    pub message_id: Option<String>,
    pub text: Option<String>,
}

struct State {
    channels: Vec<(String, String)>,
    messages: Vec<ChatMessage>,
    calls: Vec<ChannelCall>,
    failures: VecDeque<(ChannelOp, ChannelError)>,
    next_id: u64,
}

/// One or more named channels held in memory. Messages are stored oldest
/// first with ids that increase numerically.
pub struct InMemoryChannel {
    bot_id: String,
    state: Mutex<State>,
}

impl Default for InMemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryChannel {
    pub const BOT_ID: &'static str = "bot";

    pub fn new() -> Self {
        Self {
            bot_id: Self::BOT_ID.to_string(),
            state: Mutex::new(State {
                channels: Vec::new(),
                messages: Vec::new(),
                calls: Vec::new(),
                failures: VecDeque::new(),
                next_id: 100,
            }),
        }
    }

    /// Convenience constructor with a single channel.
    pub fn with_channel(id: &str, name: &str) -> Self {
        let channel = Self::new();
        channel.add_channel(id, name);
        channel
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn add_channel(&self, id: &str, name: &str) {
        self.lock().channels.push((id.into(), name.into()));
    }

    /// Put a message into history without recording a call.
    pub fn seed_message(&self, channel_id: &str, author_id: &str, content: &str, pinned: bool) -> String {
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id.to_string();
        state.messages.push(ChatMessage {
            id: id.clone(),
            channel_id: channel_id.into(),
            author_id: author_id.into(),
            author_name: author_id.into(),
            content: content.into(),
            pinned,
        });
        id
    }

    /// A user posts into the channel.
    pub fn post_as_user(&self, channel_id: &str, user: &str, content: &str) -> String {
        self.seed_message(channel_id, user, content, false)
    }

    /// Someone deletes a message out from under us.
    pub fn remove_message(&self, message_id: &str) {
        self.lock().messages.retain(|m| m.id != message_id);
    }

    pub fn fail_next(&self, op: ChannelOp, err: ChannelError) {
        self.lock().failures.push_back((op, err));
    }

    pub fn message(&self, message_id: &str) -> Option<ChatMessage> {
        self.lock()
            .messages
            .iter()
            .find(|m| m.id == message_id)
            .cloned()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.lock().messages.clone()
    }

    pub fn calls(&self) -> Vec<ChannelCall> {
        self.lock().calls.clone()
    }

    pub fn count(&self, op: ChannelOp) -> usize {
        self.lock().calls.iter().filter(|c| c.op == op).count()
    }

    fn enter(
        &self,
        op: ChannelOp,
        message_id: Option<&str>,
        text: Option<&str>,
    ) -> Result<std::sync::MutexGuard<'_, State>, ChannelError> {
        let mut state = self.lock();
        state.calls.push(ChannelCall {
            op,
            message_id: message_id.map(str::to_string),
            text: text.map(str::to_string),
        });
        if let Some(pos) = state.failures.iter().position(|(o, _)| *o == op)
            && let Some((_, err)) = state.failures.remove(pos)
        {
            return Err(err);
        }
        Ok(state)
    }
}

fn find_mut<'a>(
    state: &'a mut State,
    channel_id: &str,
    message_id: &str,
) -> Result<&'a mut ChatMessage, ChannelError> {
    state
        .messages
        .iter_mut()
        .find(|m| m.id == message_id && m.channel_id == channel_id)
        .ok_or_else(|| ChannelError::MessageMissing {
            message_id: message_id.to_string(),
        })
}

fn numeric(id: &str) -> u64 {
    id.parse().unwrap_or(0)
}

#[async_trait]
impl ChatChannel for InMemoryChannel {
    async fn resolve_channel(&self, name: &str) -> Result<String, ChannelError> {
        let state = self.enter(ChannelOp::Resolve, None, None)?;
        state
            .channels
            .iter()
            .find(|(_, n)| n == name)
            .map(|(id, _)| id.clone())
            .ok_or_else(|| ChannelError::ChannelNotFound {
                name: name.to_string(),
            })
    }

    async fn self_id(&self) -> Result<String, ChannelError> {
        Ok(self.bot_id.clone())
    }

    async fn send(&self, channel_id: &str, text: &str) -> Result<String, ChannelError> {
        let mut state = self.enter(ChannelOp::Send, None, Some(text))?;
        state.next_id += 1;
        let id = state.next_id.to_string();
        state.messages.push(ChatMessage {
            id: id.clone(),
            channel_id: channel_id.into(),
            author_id: self.bot_id.clone(),
            author_name: self.bot_id.clone(),
            content: text.into(),
            pinned: false,
        });
        Ok(id)
    }

    async fn edit(
        &self,
        channel_id: &str,
        message_id: &str,
        text: &str,
    ) -> Result<(), ChannelError> {
        let mut state = self.enter(ChannelOp::Edit, Some(message_id), Some(text))?;
        find_mut(&mut state, channel_id, message_id)?.content = text.to_string();
        Ok(())
    }

    async fn delete(&self, channel_id: &str, message_id: &str) -> Result<(), ChannelError> {
        let mut state = self.enter(ChannelOp::Delete, Some(message_id), None)?;
        find_mut(&mut state, channel_id, message_id)?;
        state.messages.retain(|m| m.id != message_id);
        Ok(())
    }

    async fn pin(&self, channel_id: &str, message_id: &str) -> Result<(), ChannelError> {
        let mut state = self.enter(ChannelOp::Pin, Some(message_id), None)?;
        find_mut(&mut state, channel_id, message_id)?.pinned = true;
        Ok(())
    }

    async fn fetch_history(
        &self,
        channel_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, ChannelError> {
        let state = self.enter(ChannelOp::FetchHistory, None, None)?;
        Ok(state
            .messages
            .iter()
            .rev()
            .filter(|m| m.channel_id == channel_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn fetch_since(
        &self,
        channel_id: &str,
        after: &str,
    ) -> Result<Vec<ChatMessage>, ChannelError> {
        let state = self.enter(ChannelOp::FetchSince, None, None)?;
        let cursor = numeric(after);
        Ok(state
            .messages
            .iter()
            .filter(|m| m.channel_id == channel_id && numeric(&m.id) > cursor)
            .take(MAX_FETCH_PAGE)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_edit_pin_delete() {
        let ch = InMemoryChannel::with_channel("c1", "hausaufgaben");
        let id = ch.send("c1", "hello").await.unwrap();
        ch.edit("c1", &id, "hello again").await.unwrap();
        ch.pin("c1", &id).await.unwrap();
        let msg = ch.message(&id).unwrap();
        assert_eq!(msg.content, "hello again");
        assert!(msg.pinned);
        assert_eq!(msg.author_id, InMemoryChannel::BOT_ID);

        ch.delete("c1", &id).await.unwrap();
        let err = ch.edit("c1", &id, "x").await.unwrap_err();
        assert!(matches!(err, ChannelError::MessageMissing { .. }));
    }

    #[tokio::test]
    async fn test_history_newest_first_and_since_oldest_first() {
        let ch = InMemoryChannel::with_channel("c1", "hw");
        let a = ch.post_as_user("c1", "u1", "a");
        let b = ch.post_as_user("c1", "u1", "b");
        let c = ch.post_as_user("c1", "u1", "c");

        let history = ch.fetch_history("c1", 2).await.unwrap();
        let ids: Vec<_> = history.iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids, vec![c.clone(), b.clone()]);

        let since = ch.fetch_since("c1", &a).await.unwrap();
        let ids: Vec<_> = since.iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids, vec![b, c]);
    }

    #[tokio::test]
    async fn test_resolve_unknown_channel() {
        let ch = InMemoryChannel::with_channel("c1", "hw");
        assert_eq!(ch.resolve_channel("hw").await.unwrap(), "c1");
        assert!(matches!(
            ch.resolve_channel("general").await,
            Err(ChannelError::ChannelNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let ch = InMemoryChannel::with_channel("c1", "hw");
        ch.fail_next(
            ChannelOp::Send,
            ChannelError::Network {
                message: "reset".into(),
            },
        );
        assert!(ch.send("c1", "x").await.is_err());
        assert!(ch.send("c1", "x").await.is_ok());
        assert_eq!(ch.count(ChannelOp::Send), 2);
    }
}
