//! Discord channel implementation.
//!
//! Uses the Discord REST API for everything, including inbound delivery
//! (polling `after=<last id>`). In tests, the [`DiscordHttpClient`] trait
//! is replaced by a mock.

use super::{ChatChannel, ChatMessage, MAX_FETCH_PAGE};
use crate::error::ChannelError;
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::OnceCell;
use tracing::debug;

/// Discord JSON error code for "Unknown Message".
const UNKNOWN_MESSAGE: u64 = 10008;
/// Discord JSON error code for "Unknown Channel".
const UNKNOWN_CHANNEL: u64 = 10003;
/// Guild text channel type.
const GUILD_TEXT: u64 = 0;

/// A Discord message from the API.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscordMessage {
    pub id: String,
    #[serde(default)]
    pub channel_id: String,
    pub author: DiscordUser,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub pinned: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordUser {
    pub id: String,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordGuildChannel {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordGuild {
    pub id: String,
}

/// Trait for Discord API interactions.
#[async_trait]
pub trait DiscordHttpClient: Send + Sync {
    async fn current_user(&self) -> Result<DiscordUser, ChannelError>;
    async fn guilds(&self) -> Result<Vec<DiscordGuild>, ChannelError>;
    async fn guild_channels(&self, guild_id: &str) -> Result<Vec<DiscordGuildChannel>, ChannelError>;
    async fn create_message(&self, channel_id: &str, text: &str) -> Result<DiscordMessage, ChannelError>;
    async fn edit_message(&self, channel_id: &str, message_id: &str, text: &str) -> Result<(), ChannelError>;
    async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<(), ChannelError>;
    async fn pin_message(&self, channel_id: &str, message_id: &str) -> Result<(), ChannelError>;
    async fn get_messages(
        &self,
        channel_id: &str,
        limit: usize,
        after: Option<&str>,
    ) -> Result<Vec<DiscordMessage>, ChannelError>;
}

/// Discord channel adapter.
pub struct DiscordChannel {
    http: Box<dyn DiscordHttpClient>,
    guild_id: Option<String>,
    me: OnceCell<String>,
}

impl DiscordChannel {
    pub fn new(http: Box<dyn DiscordHttpClient>, guild_id: Option<String>) -> Self {
        Self {
            http,
            guild_id,
            me: OnceCell::new(),
        }
    }
}

fn to_chat(m: DiscordMessage, channel_id: &str) -> ChatMessage {
    ChatMessage {
        channel_id: if m.channel_id.is_empty() {
            channel_id.to_string()
        } else {
            m.channel_id
        },
        id: m.id,
        author_id: m.author.id,
        author_name: m.author.username,
        content: m.content,
        pinned: m.pinned,
    }
}

/// Snowflakes sort numerically; compare as integers.
fn snowflake(id: &str) -> u64 {
    id.parse().unwrap_or(0)
}

#[async_trait]
impl ChatChannel for DiscordChannel {
    async fn resolve_channel(&self, name: &str) -> Result<String, ChannelError> {
        let guild_ids = match &self.guild_id {
            Some(id) => vec![id.clone()],
            None => self.http.guilds().await?.into_iter().map(|g| g.id).collect(),
        };
        for guild_id in guild_ids {
            let found = self
                .http
                .guild_channels(&guild_id)
                .await?
                .into_iter()
                .find(|c| c.kind == GUILD_TEXT && c.name.as_deref() == Some(name));
            if let Some(channel) = found {
                debug!(guild_id = %guild_id, channel_id = %channel.id, "Resolved channel");
                return Ok(channel.id);
            }
        }
        Err(ChannelError::ChannelNotFound {
            name: name.to_string(),
        })
    }

    async fn self_id(&self) -> Result<String, ChannelError> {
        self.me
            .get_or_try_init(|| async { self.http.current_user().await.map(|u| u.id) })
            .await
            .cloned()
    }

    async fn send(&self, channel_id: &str, text: &str) -> Result<String, ChannelError> {
        Ok(self.http.create_message(channel_id, text).await?.id)
    }

    async fn edit(
        &self,
        channel_id: &str,
        message_id: &str,
        text: &str,
    ) -> Result<(), ChannelError> {
        self.http.edit_message(channel_id, message_id, text).await
    }

    async fn delete(&self, channel_id: &str, message_id: &str) -> Result<(), ChannelError> {
        self.http.delete_message(channel_id, message_id).await
    }

    async fn pin(&self, channel_id: &str, message_id: &str) -> Result<(), ChannelError> {
        self.http.pin_message(channel_id, message_id).await
    }

    async fn fetch_history(
        &self,
        channel_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, ChannelError> {
        // Discord already returns newest first.
        Ok(self
            .http
            .get_messages(channel_id, limit.clamp(1, MAX_FETCH_PAGE), None)
            .await?
            .into_iter()
            .map(|m| to_chat(m, channel_id))
            .collect())
    }

    async fn fetch_since(
        &self,
        channel_id: &str,
        after: &str,
    ) -> Result<Vec<ChatMessage>, ChannelError> {
        let mut msgs: Vec<ChatMessage> = self
            .http
            .get_messages(channel_id, MAX_FETCH_PAGE, Some(after))
            .await?
            .into_iter()
            .map(|m| to_chat(m, channel_id))
            .collect();
        msgs.sort_by_key(|m| snowflake(&m.id));
        Ok(msgs)
    }
}

/// Real Discord HTTP client using reqwest.
pub struct RealDiscordHttp {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
}

impl RealDiscordHttp {
    pub fn new(api_base: impl Into<String>, bot_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            bot_token: bot_token.into(),
        }
    }

    fn auth_header(&self) -> String {
        format!("Bot {}", self.bot_token)
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        subject: &str,
    ) -> Result<Option<Value>, ChannelError> {
        let url = format!("{}{}", self.api_base, path);
        let mut req = self
            .client
            .request(method.clone(), &url)
            .header("Authorization", self.auth_header());
        req = match body {
            Some(body) => req.json(&body),
            None if method == Method::PUT => req.header("Content-Length", "0"),
            None => req,
        };

        let resp = req.send().await.map_err(|e| ChannelError::Network {
            message: format!("HTTP error: {e}"),
        })?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| ChannelError::Network {
            message: format!("HTTP error: {e}"),
        })?;

        if !status.is_success() {
            return Err(map_http_error(status, &text, subject));
        }
        if status == StatusCode::NO_CONTENT || text.is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| ChannelError::Decode {
                message: format!("JSON parse error: {e}"),
            })
    }

    async fn call_json<T: for<'de> Deserialize<'de>>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        subject: &str,
    ) -> Result<T, ChannelError> {
        let value = self
            .call(method, path, body, subject)
            .await?
            .ok_or_else(|| ChannelError::Decode {
                message: "empty response body".to_string(),
            })?;
        serde_json::from_value(value).map_err(|e| ChannelError::Decode {
            message: format!("JSON shape error: {e}"),
        })
    }
}

/// Map a Discord error response onto the channel error taxonomy.
pub fn map_http_error(status: StatusCode, body: &str, subject: &str) -> ChannelError {
    let parsed: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let code = parsed["code"].as_u64();
    let message = parsed["message"]
        .as_str()
        .unwrap_or("unknown error")
        .to_string();

    match (status.as_u16(), code) {
        (404, Some(UNKNOWN_MESSAGE)) => ChannelError::MessageMissing {
            message_id: subject.to_string(),
        },
        (404, Some(UNKNOWN_CHANNEL)) => ChannelError::ChannelNotFound {
            name: subject.to_string(),
        },
        (404, _) => ChannelError::MessageMissing {
            message_id: subject.to_string(),
        },
        (401, _) => ChannelError::AuthFailed {
            name: "discord".to_string(),
        },
        (403, _) => ChannelError::Forbidden {
            action: subject.to_string(),
            message,
        },
        (429, _) => {
            let secs = parsed["retry_after"].as_f64().unwrap_or(1.0);
            ChannelError::RateLimited {
                retry_after_ms: (secs * 1000.0).ceil() as u64,
            }
        }
        (s, _) if s >= 500 => ChannelError::Server { status: s, message },
        (s, _) => ChannelError::Decode {
            message: format!("Discord API error ({s}): {message}"),
        },
    }
}

#[async_trait]
impl DiscordHttpClient for RealDiscordHttp {
    async fn current_user(&self) -> Result<DiscordUser, ChannelError> {
        self.call_json(Method::GET, "/users/@me", None, "current user")
            .await
    }

    async fn guilds(&self) -> Result<Vec<DiscordGuild>, ChannelError> {
        self.call_json(Method::GET, "/users/@me/guilds", None, "guilds")
            .await
    }

    async fn guild_channels(&self, guild_id: &str) -> Result<Vec<DiscordGuildChannel>, ChannelError> {
        let path = format!("/guilds/{guild_id}/channels");
        self.call_json(Method::GET, &path, None, guild_id).await
    }

    async fn create_message(&self, channel_id: &str, text: &str) -> Result<DiscordMessage, ChannelError> {
        let path = format!("/channels/{channel_id}/messages");
        self.call_json(Method::POST, &path, Some(json!({ "content": text })), channel_id)
            .await
    }

    async fn edit_message(&self, channel_id: &str, message_id: &str, text: &str) -> Result<(), ChannelError> {
        let path = format!("/channels/{channel_id}/messages/{message_id}");
        self.call(Method::PATCH, &path, Some(json!({ "content": text })), message_id)
            .await
            .map(|_| ())
    }

    async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<(), ChannelError> {
        let path = format!("/channels/{channel_id}/messages/{message_id}");
        self.call(Method::DELETE, &path, None, message_id)
            .await
            .map(|_| ())
    }

    async fn pin_message(&self, channel_id: &str, message_id: &str) -> Result<(), ChannelError> {
        let path = format!("/channels/{channel_id}/pins/{message_id}");
        self.call(Method::PUT, &path, None, message_id)
            .await
            .map(|_| ())
    }

    async fn get_messages(
        &self,
        channel_id: &str,
        limit: usize,
        after: Option<&str>,
    ) -> Result<Vec<DiscordMessage>, ChannelError> {
        let mut path = format!("/channels/{channel_id}/messages?limit={limit}");
        if let Some(after) = after {
            path.push_str(&format!("&after={after}"));
        }
        self.call_json(Method::GET, &path, None, channel_id).await
    }
}

/// Create a Discord channel with a real HTTP client.
pub fn create_discord_channel(
    api_base: &str,
    bot_token: &str,
    guild_id: Option<String>,
) -> DiscordChannel {
    DiscordChannel::new(Box::new(RealDiscordHttp::new(api_base, bot_token)), guild_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn msg(id: &str, author: &str, content: &str) -> DiscordMessage {
        DiscordMessage {
            id: id.into(),
            channel_id: "ch1".into(),
            author: DiscordUser {
                id: author.into(),
                username: author.into(),
            },
            content: content.into(),
            pinned: false,
        }
    }

    struct MockDiscordHttp {
        sent: Arc<Mutex<Vec<(String, String)>>>,
        messages: Vec<DiscordMessage>,
        user_calls: Arc<Mutex<usize>>,
    }

    impl MockDiscordHttp {
        fn new() -> Self {
            Self {
                sent: Arc::new(Mutex::new(Vec::new())),
                messages: Vec::new(),
                user_calls: Arc::new(Mutex::new(0)),
            }
        }

        fn with_messages(mut self, messages: Vec<DiscordMessage>) -> Self {
            self.messages = messages;
            self
        }
    }

    #[async_trait]
    impl DiscordHttpClient for MockDiscordHttp {
        async fn current_user(&self) -> Result<DiscordUser, ChannelError> {
            *self.user_calls.lock().unwrap() += 1;
            Ok(DiscordUser {
                id: "bot-1".into(),
                username: "taskpin".into(),
            })
        }

        async fn guilds(&self) -> Result<Vec<DiscordGuild>, ChannelError> {
            Ok(vec![DiscordGuild { id: "g1".into() }, DiscordGuild { id: "g2".into() }])
        }

        async fn guild_channels(&self, guild_id: &str) -> Result<Vec<DiscordGuildChannel>, ChannelError> {
            if guild_id == "g2" {
                Ok(vec![
                    DiscordGuildChannel {
                        id: "voice".into(),
                        name: Some("hausaufgaben".into()),
                        kind: 2,
                    },
                    DiscordGuildChannel {
                        id: "ch1".into(),
                        name: Some("hausaufgaben".into()),
                        kind: GUILD_TEXT,
                    },
                ])
            } else {
                Ok(vec![])
            }
        }

        async fn create_message(&self, channel_id: &str, text: &str) -> Result<DiscordMessage, ChannelError> {
            self.sent
                .lock()
                .unwrap()
                .push((channel_id.to_string(), text.to_string()));
            Ok(msg("disc-msg-1", "bot-1", text))
        }

        async fn edit_message(&self, _channel_id: &str, message_id: &str, _text: &str) -> Result<(), ChannelError> {
            Err(map_http_error(
                StatusCode::NOT_FOUND,
                r#"{"message":"Unknown Message","code":10008}"#,
                message_id,
            ))
        }

        async fn delete_message(&self, _channel_id: &str, _message_id: &str) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn pin_message(&self, _channel_id: &str, _message_id: &str) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn get_messages(
            &self,
            _channel_id: &str,
            _limit: usize,
            _after: Option<&str>,
        ) -> Result<Vec<DiscordMessage>, ChannelError> {
            Ok(self.messages.clone())
        }
    }

    #[tokio::test]
    async fn test_resolve_channel_scans_guilds_for_text_channel() {
        let ch = DiscordChannel::new(Box::new(MockDiscordHttp::new()), None);
        assert_eq!(ch.resolve_channel("hausaufgaben").await.unwrap(), "ch1");
        assert!(matches!(
            ch.resolve_channel("general").await,
            Err(ChannelError::ChannelNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_self_id_is_cached() {
        let http = MockDiscordHttp::new();
        let calls = http.user_calls.clone();
        let ch = DiscordChannel::new(Box::new(http), None);
        assert_eq!(ch.self_id().await.unwrap(), "bot-1");
        assert_eq!(ch.self_id().await.unwrap(), "bot-1");
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_send_returns_message_id() {
        let http = MockDiscordHttp::new();
        let sent = http.sent.clone();
        let ch = DiscordChannel::new(Box::new(http), None);
        let id = ch.send("ch1", "Hello Discord!").await.unwrap();
        assert_eq!(id, "disc-msg-1");
        assert_eq!(sent.lock().unwrap()[0], ("ch1".to_string(), "Hello Discord!".to_string()));
    }

    #[tokio::test]
    async fn test_edit_unknown_message_maps_to_missing() {
        let ch = DiscordChannel::new(Box::new(MockDiscordHttp::new()), None);
        let err = ch.edit("ch1", "42", "x").await.unwrap_err();
        assert!(matches!(err, ChannelError::MessageMissing { message_id } if message_id == "42"));
    }

    #[tokio::test]
    async fn test_fetch_since_sorts_oldest_first() {
        let http = MockDiscordHttp::new().with_messages(vec![
            msg("300", "u", "c"),
            msg("100", "u", "a"),
            msg("200", "u", "b"),
        ]);
        let ch = DiscordChannel::new(Box::new(http), None);
        let msgs = ch.fetch_since("ch1", "50").await.unwrap();
        let contents: Vec<_> = msgs.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            map_http_error(StatusCode::TOO_MANY_REQUESTS, r#"{"retry_after":1.5}"#, "x"),
            ChannelError::RateLimited { retry_after_ms: 1500 }
        ));
        assert!(matches!(
            map_http_error(StatusCode::FORBIDDEN, r#"{"message":"Missing Permissions","code":50013}"#, "pin"),
            ChannelError::Forbidden { .. }
        ));
        assert!(map_http_error(StatusCode::BAD_GATEWAY, "", "x").class().is_transient());
        assert!(!map_http_error(StatusCode::UNAUTHORIZED, "", "x").class().is_transient());
    }

    #[test]
    fn test_message_deserialize() {
        let m: DiscordMessage = serde_json::from_str(
            r#"{"id":"1","channel_id":"c","author":{"id":"u","username":"bob"},"content":"hi","pinned":true}"#,
        )
        .unwrap();
        let chat = to_chat(m, "c");
        assert!(chat.pinned);
        assert_eq!(chat.author_name, "bob");
    }
}
