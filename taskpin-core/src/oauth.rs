//! OAuth 2.0 + PKCE for the task-list service.
//!
//! The browser redirect lands on the liveness server's `/auth/callback`
//! route. That handler resolves a [`CallbackSlot`], and the waiting login
//! future receives the code through a `oneshot` channel.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info};

use crate::credentials::CredentialStore;
use crate::error::AuthError;

/// Key under which the refresh token is kept in the credential store.
pub const TASKS_CREDENTIAL_KEY: &str = "google-tasks";

/// Client registration used for token requests.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub authorization_url: String,
    pub token_url: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
}

/// Token endpoint response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub token_type: String,
    pub scopes: Vec<String>,
}

/// PKCE code verifier and challenge pair.
#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

/// What the authorization server sent back to the redirect URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackData {
    pub code: String,
    pub state: String,
}

// ── PKCE ────────────────────────────────────────────────────────────────────

/// Generate a PKCE code verifier and S256 challenge.
pub fn generate_pkce_pair() -> PkcePair {
    let mut rng = rand::thread_rng();
    let verifier: String = (0..64)
        .map(|_| {
            const CHARSET: &[u8] =
                b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";
            let idx = rng.gen_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect();

    PkcePair {
        challenge: pkce_challenge(&verifier),
        verifier,
    }
}

fn pkce_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Random CSRF state parameter.
pub fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

// ── Callback ────────────────────────────────────────────────────────────────

/// Hand-off point between the HTTP callback route and a waiting login.
///
/// At most one login waits at a time. Arming replaces any earlier waiter.
#[derive(Clone, Default)]
pub struct CallbackSlot {
    tx: Arc<Mutex<Option<oneshot::Sender<CallbackData>>>>,
}

impl CallbackSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter and get the receiving end.
    pub async fn arm(&self) -> oneshot::Receiver<CallbackData> {
        let (tx, rx) = oneshot::channel();
        *self.tx.lock().await = Some(tx);
        rx
    }

    /// Deliver a callback. Returns false when nobody was waiting.
    pub async fn resolve(&self, data: CallbackData) -> bool {
        match self.tx.lock().await.take() {
            Some(sender) => sender.send(data).is_ok(),
            None => false,
        }
    }
}

// ── Authorization code flow ─────────────────────────────────────────────────

/// Authorization URL the user opens in a browser.
pub fn authorization_url(
    client: &OAuthClient,
    pkce: &PkcePair,
    state: &str,
) -> Result<url::Url, AuthError> {
    let mut auth_url =
        url::Url::parse(&client.authorization_url).map_err(|e| AuthError::FlowFailed {
            message: format!("Invalid authorization URL: {}", e),
        })?;
    {
        let mut params = auth_url.query_pairs_mut();
        params.append_pair("response_type", "code");
        params.append_pair("client_id", &client.client_id);
        params.append_pair("redirect_uri", &client.redirect_uri);
        params.append_pair("code_challenge", &pkce.challenge);
        params.append_pair("code_challenge_method", "S256");
        params.append_pair("state", state);
        // Needed for Google to issue a refresh token.
        params.append_pair("access_type", "offline");
        params.append_pair("prompt", "consent");
        if !client.scopes.is_empty() {
            params.append_pair("scope", &client.scopes.join(" "));
        }
    }
    Ok(auth_url)
}

/// Run the browser login: open the consent page, wait for the callback on
/// `slot`, exchange the code, and store the refresh token.
pub async fn login(
    client: &OAuthClient,
    slot: &CallbackSlot,
    store: &dyn CredentialStore,
    wait: Duration,
) -> Result<OAuthToken, AuthError> {
    let pkce = generate_pkce_pair();
    let state = generate_state();
    let url = authorization_url(client, &pkce, &state)?;
    let rx = slot.arm().await;

    info!("Opening browser for task-list authorization");
    if let Err(e) = open::that(url.as_str()) {
        // Headless machines: the user can still paste the URL.
        info!(error = %e, url = %url, "Could not open a browser; open this URL manually");
    }

    let callback = tokio::time::timeout(wait, rx)
        .await
        .map_err(|_| AuthError::FlowFailed {
            message: format!("No authorization callback within {}s", wait.as_secs()),
        })?
        .map_err(|_| AuthError::FlowFailed {
            message: "Authorization callback channel closed".to_string(),
        })?;

    let token = complete_login(client, callback, &state, &pkce).await?;
    persist_refresh_token(store, &token)?;
    Ok(token)
}

/// Validate a callback and trade its code for tokens.
pub async fn complete_login(
    client: &OAuthClient,
    callback: CallbackData,
    expected_state: &str,
    pkce: &PkcePair,
) -> Result<OAuthToken, AuthError> {
    if callback.state != expected_state {
        return Err(AuthError::FlowFailed {
            message: "OAuth state parameter mismatch".to_string(),
        });
    }
    if callback.code.is_empty() {
        return Err(AuthError::FlowFailed {
            message: "Callback did not contain an authorization code".to_string(),
        });
    }
    exchange_code_for_token(client, &callback.code, &pkce.verifier).await
}

fn persist_refresh_token(store: &dyn CredentialStore, token: &OAuthToken) -> Result<(), AuthError> {
    let refresh = token
        .refresh_token
        .as_deref()
        .ok_or_else(|| AuthError::FlowFailed {
            message: "Token response did not include a refresh token".to_string(),
        })?;
    store
        .store_secret(TASKS_CREDENTIAL_KEY, refresh)
        .map_err(|e| AuthError::FlowFailed {
            message: format!("Failed to store refresh token: {}", e),
        })
}

/// Exchange an authorization code for tokens.
pub async fn exchange_code_for_token(
    client: &OAuthClient,
    code: &str,
    code_verifier: &str,
) -> Result<OAuthToken, AuthError> {
    let mut body = format!(
        "grant_type={}&code={}&redirect_uri={}&client_id={}&code_verifier={}",
        urlencoding::encode("authorization_code"),
        urlencoding::encode(code),
        urlencoding::encode(&client.redirect_uri),
        urlencoding::encode(&client.client_id),
        urlencoding::encode(code_verifier),
    );
    if let Some(secret) = &client.client_secret {
        body.push_str(&format!("&client_secret={}", urlencoding::encode(secret)));
    }

    debug!("Exchanging authorization code for token");
    let body_text = post_token_request(&client.token_url, body).await?;
    parse_token_response(&body_text, Utc::now())
}

/// Trade a refresh token for a fresh access token.
pub async fn refresh_token(
    client: &OAuthClient,
    refresh_token_str: &str,
) -> Result<OAuthToken, AuthError> {
    let mut body = format!(
        "grant_type=refresh_token&refresh_token={}&client_id={}",
        urlencoding::encode(refresh_token_str),
        urlencoding::encode(&client.client_id),
    );
    if let Some(secret) = &client.client_secret {
        body.push_str(&format!("&client_secret={}", urlencoding::encode(secret)));
    }

    debug!("Refreshing access token");
    let body_text = post_token_request(&client.token_url, body).await?;
    let mut token = parse_token_response(&body_text, Utc::now())?;
    // Google usually omits the refresh token on refresh.
    if token.refresh_token.is_none() {
        token.refresh_token = Some(refresh_token_str.to_string());
    }
    Ok(token)
}

async fn post_token_request(token_url: &str, body: String) -> Result<String, AuthError> {
    let response = reqwest::Client::new()
        .post(token_url)
        .header("Content-Type", "application/x-www-form-urlencoded")
        .body(body)
        .send()
        .await
        .map_err(|e| AuthError::Network {
            message: format!("Token request failed: {}", e),
        })?;

    let status = response.status();
    let body_text = response.text().await.map_err(|e| AuthError::Network {
        message: format!("Failed to read token response: {}", e),
    })?;

    if status.is_server_error() {
        return Err(AuthError::Server {
            status: status.as_u16(),
            message: body_text,
        });
    }
    if !status.is_success() {
        return Err(AuthError::Rejected {
            message: format!("HTTP {}: {}", status, body_text),
        });
    }
    Ok(body_text)
}

/// Parse a token endpoint response. `now` anchors `expires_in`.
pub fn parse_token_response(body: &str, now: DateTime<Utc>) -> Result<OAuthToken, AuthError> {
    let json: serde_json::Value =
        serde_json::from_str(body).map_err(|e| AuthError::Rejected {
            message: format!("Invalid JSON in token response: {}", e),
        })?;

    let access_token = json["access_token"]
        .as_str()
        .ok_or_else(|| AuthError::Rejected {
            message: "Token response missing 'access_token'".to_string(),
        })?
        .to_string();

    let refresh_token = json["refresh_token"].as_str().map(|s| s.to_string());
    let token_type = json["token_type"].as_str().unwrap_or("Bearer").to_string();
    let expires_at = json["expires_in"]
        .as_u64()
        .map(|secs| now + chrono::Duration::seconds(secs as i64));
    let scopes = json["scope"]
        .as_str()
        .map(|s| s.split_whitespace().map(|s| s.to_string()).collect())
        .unwrap_or_default();

    Ok(OAuthToken {
        access_token,
        refresh_token,
        expires_at,
        token_type,
        scopes,
    })
}

/// Whether `token` is expired at `now`, with a 5-minute safety buffer.
pub fn is_token_expired(token: &OAuthToken, now: DateTime<Utc>) -> bool {
    match token.expires_at {
        Some(expires_at) => now >= expires_at - chrono::Duration::minutes(5),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn client() -> OAuthClient {
        OAuthClient {
            client_id: "cid".into(),
            client_secret: Some("secret".into()),
            authorization_url: "https://accounts.example.com/auth".into(),
            token_url: "https://accounts.example.com/token".into(),
            redirect_uri: "http://localhost:8000/auth/callback".into(),
            scopes: vec!["https://www.googleapis.com/auth/tasks".into()],
        }
    }

    #[test]
    fn test_pkce_challenge_matches_rfc_example() {
        // RFC 7636 appendix B.
        assert_eq!(
            pkce_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn test_pkce_pair_shape() {
        let pair = generate_pkce_pair();
        assert_eq!(pair.verifier.len(), 64);
        assert_eq!(pair.challenge, pkce_challenge(&pair.verifier));
        assert_ne!(generate_state(), generate_state());
    }

    #[test]
    fn test_authorization_url_params() {
        let pkce = generate_pkce_pair();
        let url = authorization_url(&client(), &pkce, "st").unwrap();
        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["client_id"], "cid");
        assert_eq!(pairs["state"], "st");
        assert_eq!(pairs["code_challenge_method"], "S256");
        assert_eq!(pairs["redirect_uri"], "http://localhost:8000/auth/callback");
        assert_eq!(pairs["access_type"], "offline");
    }

    #[test]
    fn test_parse_token_response() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let token = parse_token_response(
            r#"{"access_token":"ya29","expires_in":3600,"refresh_token":"1//r","scope":"a b","token_type":"Bearer"}"#,
            now,
        )
        .unwrap();
        assert_eq!(token.access_token, "ya29");
        assert_eq!(token.refresh_token.as_deref(), Some("1//r"));
        assert_eq!(token.expires_at, Some(now + chrono::Duration::hours(1)));
        assert_eq!(token.scopes, vec!["a", "b"]);
    }

    #[test]
    fn test_parse_token_response_missing_access_token() {
        let err = parse_token_response(r#"{"error":"invalid_grant"}"#, Utc::now()).unwrap_err();
        assert!(matches!(err, AuthError::Rejected { .. }));
    }

    #[test]
    fn test_token_expiry_buffer() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let mut token = OAuthToken {
            access_token: "a".into(),
            refresh_token: None,
            expires_at: Some(now + chrono::Duration::minutes(4)),
            token_type: "Bearer".into(),
            scopes: vec![],
        };
        assert!(is_token_expired(&token, now));
        token.expires_at = Some(now + chrono::Duration::minutes(10));
        assert!(!is_token_expired(&token, now));
        token.expires_at = None;
        assert!(!is_token_expired(&token, now));
    }

    #[tokio::test]
    async fn test_callback_slot_delivers_once() {
        let slot = CallbackSlot::new();
        let rx = slot.arm().await;
        let data = CallbackData {
            code: "c".into(),
            state: "s".into(),
        };
        assert!(slot.resolve(data.clone()).await);
        assert_eq!(rx.await.unwrap(), data);
        assert!(!slot.resolve(data).await);
    }

    #[tokio::test]
    async fn test_complete_login_rejects_state_mismatch() {
        let pkce = generate_pkce_pair();
        let err = complete_login(
            &client(),
            CallbackData {
                code: "c".into(),
                state: "forged".into(),
            },
            "expected",
            &pkce,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("state"));
    }

    #[test]
    fn test_persist_requires_refresh_token() {
        let store = crate::credentials::InMemoryCredentialStore::new();
        let token = OAuthToken {
            access_token: "a".into(),
            refresh_token: None,
            expires_at: None,
            token_type: "Bearer".into(),
            scopes: vec![],
        };
        assert!(persist_refresh_token(&store, &token).is_err());

        let token = OAuthToken {
            refresh_token: Some("r".into()),
            ..token
        };
        persist_refresh_token(&store, &token).unwrap();
        assert_eq!(store.get_secret(TASKS_CREDENTIAL_KEY).unwrap(), "r");
    }
}
