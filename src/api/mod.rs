//! HTTP front door
//!
//! - `POST /message` takes `{content, priority?}` behind HTTP Basic auth
//!   and publishes it on its own broker connection
//! - `GET /health` always answers `{"status": "healthy"}`
//!
//! Errors use a `{"detail": ...}` body. Publish failures are 500s carrying
//! the underlying failure text.

mod auth;

use axum::extract::{FromRef, State};
use axum::http::header::WWW_AUTHENTICATE;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::broker::{Connector, Message};
use crate::config::BasicAuthSettings;
use crate::publisher::Publisher;
use crate::utils::RelayError;

pub use auth::{Authenticated, parse_basic};

pub const PUBLISHED_STATUS: &str = "Message published to RabbitMQ";

#[derive(Debug, Clone)]
pub struct ApiState<C> {
    pub publisher: Publisher<C>,
    pub auth: BasicAuthSettings,
}

impl<C: Clone> FromRef<ApiState<C>> for BasicAuthSettings {
    fn from_ref(state: &ApiState<C>) -> Self {
        state.auth.clone()
    }
}

#[derive(Debug)]
pub enum ApiError {
    NotAuthenticated,
    BadCredentials,
    Publish(RelayError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::NotAuthenticated => (StatusCode::UNAUTHORIZED, "Not authenticated".to_string()),
            ApiError::BadCredentials => (
                StatusCode::UNAUTHORIZED,
                "Incorrect username or password".to_string(),
            ),
            ApiError::Publish(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };

        let mut response = (status, Json(json!({ "detail": detail }))).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Basic"));
        }
        response
    }
}

pub fn router<C>(state: ApiState<C>) -> Router
where
    C: Connector + Clone + 'static,
{
    Router::new()
        .route("/message", post(create_message::<C>))
        .route("/health", get(health_check))
        .with_state(state)
}

async fn create_message<C: Connector + Clone + 'static>(
    State(state): State<ApiState<C>>,
    Authenticated(username): Authenticated,
    Json(message): Json<Message>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.publisher.publish(&message).await {
        Ok(()) => {
            info!(%username, priority = message.priority, "Accepted message");
            Ok(Json(json!({ "status": PUBLISHED_STATUS })))
        }
        Err(e) => {
            error!(%username, error = %e, "Failed to publish message");
            Err(ApiError::Publish(e))
        }
    }
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

/// Serves `app` on `listener` until `cancel` fires, then drains in-flight
/// requests.
pub async fn serve(listener: TcpListener, app: Router, cancel: CancellationToken) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("HTTP server listening on http://{addr}");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}
