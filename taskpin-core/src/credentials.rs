//! Credentials for the task-list service.
//!
//! Two layers:
//! - [`CredentialStore`] persists long-lived secrets (the OS keyring in
//!   production, a `HashMap` in tests).
//! - [`CredentialProvider`] hands out short-lived access tokens. Which
//!   provider runs is chosen from configuration at startup; the task-list
//!   client never knows which one it has.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::{CredentialSource, env_secret};
use crate::error::{AuthError, ConfigError};
use crate::oauth::{self, OAuthClient, OAuthToken, TASKS_CREDENTIAL_KEY};

/// Errors from credential storage operations.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Credential not found for {service}:{account}")]
    NotFound { service: String, account: String },

    #[error("Failed to store credential: {message}")]
    StoreFailed { message: String },

    #[error("Failed to delete credential: {message}")]
    DeleteFailed { message: String },

    #[error("Keyring backend not available: {message}")]
    BackendUnavailable { message: String },
}

/// Trait for credential storage backends.
pub trait CredentialStore: Send + Sync {
    fn store_secret(&self, key: &str, secret: &str) -> Result<(), CredentialError>;

    fn get_secret(&self, key: &str) -> Result<String, CredentialError>;

    fn delete_secret(&self, key: &str) -> Result<(), CredentialError>;

    fn has_secret(&self, key: &str) -> bool {
        self.get_secret(key).is_ok()
    }
}

/// OS-native credential store using the `keyring` crate.
///
/// Entries live under service `"taskpin"` with account `"credential:{key}"`.
pub struct KeyringCredentialStore {
    service: String,
}

impl KeyringCredentialStore {
    pub fn new() -> Self {
        Self {
            service: "taskpin".to_string(),
        }
    }

    pub fn account_name(key: &str) -> String {
        format!("credential:{key}")
    }

    fn entry(&self, key: &str) -> Result<keyring::Entry, CredentialError> {
        keyring::Entry::new(&self.service, &Self::account_name(key)).map_err(|e| {
            CredentialError::BackendUnavailable {
                message: e.to_string(),
            }
        })
    }
}

impl Default for KeyringCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn store_secret(&self, key: &str, secret: &str) -> Result<(), CredentialError> {
        self.entry(key)?
            .set_password(secret)
            .map_err(|e| CredentialError::StoreFailed {
                message: e.to_string(),
            })
    }

    fn get_secret(&self, key: &str) -> Result<String, CredentialError> {
        self.entry(key)?.get_password().map_err(|e| match e {
            keyring::Error::NoEntry => CredentialError::NotFound {
                service: self.service.clone(),
                account: Self::account_name(key),
            },
            other => CredentialError::StoreFailed {
                message: other.to_string(),
            },
        })
    }

    fn delete_secret(&self, key: &str) -> Result<(), CredentialError> {
        self.entry(key)?
            .delete_credential()
            .map_err(|e| CredentialError::DeleteFailed {
                message: e.to_string(),
            })
    }
}

/// In-memory credential store for testing.
#[derive(Default)]
pub struct InMemoryCredentialStore {
    store: Mutex<HashMap<String, String>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.store.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn store_secret(&self, key: &str, secret: &str) -> Result<(), CredentialError> {
        self.map().insert(key.to_string(), secret.to_string());
        Ok(())
    }

    fn get_secret(&self, key: &str) -> Result<String, CredentialError> {
        self.map()
            .get(key)
            .cloned()
            .ok_or_else(|| CredentialError::NotFound {
                service: "taskpin".to_string(),
                account: KeyringCredentialStore::account_name(key),
            })
    }

    fn delete_secret(&self, key: &str) -> Result<(), CredentialError> {
        self.map().remove(key);
        Ok(())
    }
}

// ── Access-token providers ──────────────────────────────────────────────────

/// Source of bearer tokens for the task-list service.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// A currently valid access token.
    async fn access_token(&self) -> Result<String, AuthError>;

    /// Forget any cached token; the next call must fetch a new one.
    async fn invalidate(&self) {}

    fn name(&self) -> &str;
}

/// A fixed, externally issued token.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<String, AuthError> {
        Ok(self.token.clone())
    }

    fn name(&self) -> &str {
        "static_token"
    }
}

/// Where a [`RefreshingProvider`] gets its refresh token.
pub enum RefreshSource {
    Fixed(String),
    Stored(Arc<dyn CredentialStore>),
}

/// Exchanges a refresh token for access tokens and caches the result until
/// shortly before expiry.
pub struct RefreshingProvider {
    client: OAuthClient,
    source: RefreshSource,
    clock: Arc<dyn Clock>,
    cached: tokio::sync::Mutex<Option<OAuthToken>>,
    name: &'static str,
}

impl RefreshingProvider {
    pub fn new(
        client: OAuthClient,
        source: RefreshSource,
        clock: Arc<dyn Clock>,
        name: &'static str,
    ) -> Self {
        Self {
            client,
            source,
            clock,
            cached: tokio::sync::Mutex::new(None),
            name,
        }
    }

    fn refresh_secret(&self) -> Result<String, AuthError> {
        match &self.source {
            RefreshSource::Fixed(secret) => Ok(secret.clone()),
            RefreshSource::Stored(store) => {
                store
                    .get_secret(TASKS_CREDENTIAL_KEY)
                    .map_err(|_| AuthError::MissingCredential {
                        provider: TASKS_CREDENTIAL_KEY.to_string(),
                    })
            }
        }
    }

    /// Seed the cache, e.g. with the token a login just produced.
    pub async fn prime(&self, token: OAuthToken) {
        *self.cached.lock().await = Some(token);
    }
}

#[async_trait]
impl CredentialProvider for RefreshingProvider {
    async fn access_token(&self) -> Result<String, AuthError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && !oauth::is_token_expired(token, self.clock.now())
        {
            return Ok(token.access_token.clone());
        }

        let secret = self.refresh_secret()?;
        let token = oauth::refresh_token(&self.client, &secret).await?;
        debug!(provider = self.name, expires_at = ?token.expires_at, "Access token refreshed");
        let access = token.access_token.clone();
        *cached = Some(token);
        Ok(access)
    }

    async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    fn name(&self) -> &str {
        self.name
    }
}

/// OAuth client settings for a credential source, if it uses OAuth at all.
pub fn oauth_client_for(source: &CredentialSource) -> Result<Option<OAuthClient>, ConfigError> {
    match source {
        CredentialSource::StaticToken { .. } => Ok(None),
        CredentialSource::RefreshToken {
            client_id_env,
            client_secret_env,
            token_url,
            ..
        } => Ok(Some(OAuthClient {
            client_id: env_secret(client_id_env)?,
            client_secret: env_secret(client_secret_env).ok(),
            authorization_url: crate::config::GOOGLE_AUTH_URL.to_string(),
            token_url: token_url.clone(),
            redirect_uri: String::new(),
            scopes: vec![crate::config::GOOGLE_TASKS_SCOPE.to_string()],
        })),
        CredentialSource::Interactive {
            client_id_env,
            client_secret_env,
            auth_url,
            token_url,
            redirect_uri,
            scopes,
        } => Ok(Some(OAuthClient {
            client_id: env_secret(client_id_env)?,
            client_secret: env_secret(client_secret_env).ok(),
            authorization_url: auth_url.clone(),
            token_url: token_url.clone(),
            redirect_uri: redirect_uri.clone(),
            scopes: scopes.clone(),
        })),
    }
}

/// Build the configured provider.
pub fn build_provider(
    source: &CredentialSource,
    store: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn CredentialProvider>, ConfigError> {
    info!(source = source.kind(), "Selecting task-list credential provider");
    match source {
        CredentialSource::StaticToken { token_env } => {
            Ok(Arc::new(StaticTokenProvider::new(env_secret(token_env)?)))
        }
        CredentialSource::RefreshToken {
            refresh_token_env, ..
        } => {
            let secret = env_secret(refresh_token_env)?;
            let client = oauth_client_for(source)?.ok_or_else(|| ConfigError::Invalid {
                message: "refresh_token source without OAuth client".into(),
            })?;
            Ok(Arc::new(RefreshingProvider::new(
                client,
                RefreshSource::Fixed(secret),
                clock,
                "refresh_token",
            )))
        }
        CredentialSource::Interactive { .. } => {
            let client = oauth_client_for(source)?.ok_or_else(|| ConfigError::Invalid {
                message: "interactive source without OAuth client".into(),
            })?;
            Ok(Arc::new(RefreshingProvider::new(
                client,
                RefreshSource::Stored(store),
                clock,
                "interactive",
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::{TimeZone, Utc};

    fn client() -> OAuthClient {
        OAuthClient {
            client_id: "cid".into(),
            client_secret: None,
            authorization_url: "https://auth.invalid/auth".into(),
            // Unroutable: any refresh attempt fails fast with a network error.
            token_url: "http://127.0.0.1:1/token".into(),
            redirect_uri: String::new(),
            scopes: vec![],
        }
    }

    #[test]
    fn test_store_and_retrieve_secret() {
        let store = InMemoryCredentialStore::new();
        store.store_secret("google-tasks", "r-1").unwrap();
        assert_eq!(store.get_secret("google-tasks").unwrap(), "r-1");
        assert!(store.has_secret("google-tasks"));
        store.delete_secret("google-tasks").unwrap();
        assert!(matches!(
            store.get_secret("google-tasks"),
            Err(CredentialError::NotFound { .. })
        ));
    }

    #[test]
    fn test_account_name_format() {
        assert_eq!(
            KeyringCredentialStore::account_name("google-tasks"),
            "credential:google-tasks"
        );
    }

    #[tokio::test]
    async fn test_static_provider() {
        let provider = StaticTokenProvider::new("tok");
        assert_eq!(provider.access_token().await.unwrap(), "tok");
        provider.invalidate().await;
        assert_eq!(provider.access_token().await.unwrap(), "tok");
    }

    #[tokio::test]
    async fn test_refreshing_provider_uses_cached_token() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(now));
        let provider = RefreshingProvider::new(
            client(),
            RefreshSource::Fixed("r".into()),
            clock.clone(),
            "refresh_token",
        );
        provider
            .prime(OAuthToken {
                access_token: "cached".into(),
                refresh_token: Some("r".into()),
                expires_at: Some(now + chrono::Duration::hours(1)),
                token_type: "Bearer".into(),
                scopes: vec![],
            })
            .await;
        assert_eq!(provider.access_token().await.unwrap(), "cached");

        // Inside the 5-minute buffer the provider must go to the network.
        clock.advance(chrono::Duration::minutes(56));
        let err = provider.access_token().await.unwrap_err();
        assert!(err.class().is_transient());
    }

    #[tokio::test]
    async fn test_interactive_without_login_is_missing_credential() {
        let provider = RefreshingProvider::new(
            client(),
            RefreshSource::Stored(Arc::new(InMemoryCredentialStore::new())),
            Arc::new(FixedClock::new(Utc::now())),
            "interactive",
        );
        let err = provider.access_token().await.unwrap_err();
        assert!(matches!(err, AuthError::MissingCredential { .. }));
        assert!(!err.class().is_transient());
    }

    #[tokio::test]
    async fn test_invalidate_drops_cache() {
        let provider = RefreshingProvider::new(
            client(),
            RefreshSource::Stored(Arc::new(InMemoryCredentialStore::new())),
            Arc::new(FixedClock::new(Utc::now())),
            "interactive",
        );
        provider
            .prime(OAuthToken {
                access_token: "cached".into(),
                refresh_token: None,
                expires_at: None,
                token_type: "Bearer".into(),
                scopes: vec![],
            })
            .await;
        assert_eq!(provider.access_token().await.unwrap(), "cached");
        provider.invalidate().await;
        assert!(provider.access_token().await.is_err());
    }
}
