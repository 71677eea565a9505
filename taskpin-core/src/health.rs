//! Liveness endpoint and OAuth redirect target.

use crate::oauth::{CallbackData, CallbackSlot};
use axum::{
    Router,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

/// Routes: `GET /` for liveness, `GET /auth/callback` for the OAuth redirect.
pub fn router(slot: Arc<CallbackSlot>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/auth/callback", get(auth_callback))
        .with_state(slot)
}

async fn health() -> &'static str {
    "Health Check OK"
}

async fn auth_callback(
    State(slot): State<Arc<CallbackSlot>>,
    Query(query): Query<CallbackQuery>,
) -> impl IntoResponse {
    if let Some(error) = query.error {
        warn!(error = %error, "Authorization was denied");
        return (
            StatusCode::BAD_REQUEST,
            format!("Authorization failed: {}", error),
        );
    }
    let (Some(code), Some(state)) = (query.code, query.state) else {
        return (
            StatusCode::BAD_REQUEST,
            "Missing code or state parameter".to_string(),
        );
    };

    if slot.resolve(CallbackData { code, state }).await {
        info!("Authorization callback received");
        (
            StatusCode::OK,
            "Authorization received. You can close this window.".to_string(),
        )
    } else {
        (
            StatusCode::CONFLICT,
            "No login is waiting for this callback".to_string(),
        )
    }
}

/// Serve until `cancel` fires.
pub async fn serve(
    addr: SocketAddr,
    slot: Arc<CallbackSlot>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Health server listening");
    axum::serve(listener, router(slot))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use tower::ServiceExt;

    async fn get_path(app: Router, uri: &str) -> (StatusCode, String) {
        let req = axum::http::Request::builder()
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let resp = ServiceExt::<axum::http::Request<Body>>::oneshot(app, req)
            .await
            .unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 10_000)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (status, body) = get_path(router(Arc::new(CallbackSlot::new())), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Health Check OK");
    }

    #[tokio::test]
    async fn test_callback_resolves_waiting_login() {
        let slot = Arc::new(CallbackSlot::new());
        let rx = slot.arm().await;
        let (status, _) = get_path(router(slot), "/auth/callback?code=abc&state=xyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            rx.await.unwrap(),
            CallbackData {
                code: "abc".into(),
                state: "xyz".into()
            }
        );
    }

    #[tokio::test]
    async fn test_callback_without_waiter() {
        let (status, _) = get_path(
            router(Arc::new(CallbackSlot::new())),
            "/auth/callback?code=abc&state=xyz",
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_callback_error_and_missing_params() {
        let slot = Arc::new(CallbackSlot::new());
        let (status, body) =
            get_path(router(slot.clone()), "/auth/callback?error=access_denied").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("access_denied"));

        let (status, _) = get_path(router(slot), "/auth/callback?code=abc").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
