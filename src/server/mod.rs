//! HTTP surface of the chat backend.
//!
//! | Method   | Path                          | Purpose                          |
//! |----------|-------------------------------|----------------------------------|
//! | `GET`    | `/api/messages/{session_id}`  | Session history, oldest first    |
//! | `POST`   | `/api/messages`               | Send a turn, get the reply       |
//! | `DELETE` | `/api/messages/{session_id}`  | Clear a session                  |
//! | `GET`    | `/api/pool/status`            | `{available, target}`            |
//! | `GET`    | `/health`                     | Liveness                         |
//!
//! Server shutdown cancels every wait in flight. A turn whose client has gone
//! away may keep polling until the run finishes or the wait times out.

use crate::config::AppConfig;
use crate::coordinator::{RequestCoordinator, TurnExchange};
use crate::pool::{HandlePool, PoolStatus, spawn_maintenance};
use crate::remote::{LocalAssistant, RemoteConversationService, Role};
use crate::store::{Message, StoreHandle, TranscriptStore};
use crate::{Result, SolaceError};
use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// How long shutdown waits for background handle creations.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct AppState {
    coordinator: Arc<RequestCoordinator>,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(coordinator: Arc<RequestCoordinator>, shutdown: CancellationToken) -> Self {
        Self {
            coordinator,
            shutdown,
        }
    }
}

/// Body of `POST /api/messages`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub content: String,
    pub session_id: String,
    #[serde(default)]
    pub role: Option<Role>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_message: Option<Message>,
}

/// Error wrapper that renders as `{message}` JSON.
pub struct ApiError(SolaceError);

impl From<SolaceError> for ApiError {
    fn from(err: SolaceError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.root() {
            SolaceError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            SolaceError::RemoteUnavailable(_)
            | SolaceError::InvalidHandle(_)
            | SolaceError::RunFailed { .. }
            | SolaceError::NoAssistantTurnFound => StatusCode::BAD_GATEWAY,
            SolaceError::WaitTimedOut(_) => StatusCode::GATEWAY_TIMEOUT,
            SolaceError::WaitCancelled => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = self.0.to_string();
        let user_message = match self.0 {
            SolaceError::PartialTurn { user_turn, .. } => Some(*user_turn),
            _ => None,
        };

        (
            status,
            Json(ErrorBody {
                message,
                user_message,
            }),
        )
            .into_response()
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/pool/status", get(pool_status_handler))
        .route("/api/messages", post(send_message_handler))
        .route(
            "/api/messages/{session_id}",
            get(history_handler).delete(clear_handler),
        )
        .with_state(state)
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn pool_status_handler(State(state): State<AppState>) -> Json<PoolStatus> {
    Json(state.coordinator.pool_status())
}

async fn history_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> std::result::Result<Json<Vec<Message>>, ApiError> {
    Ok(Json(state.coordinator.history(&session_id).await?))
}

async fn send_message_handler(
    State(state): State<AppState>,
    body: std::result::Result<Json<SendMessage>, JsonRejection>,
) -> std::result::Result<Json<TurnExchange>, ApiError> {
    let Json(body) =
        body.map_err(|rejection| SolaceError::InvalidInput(rejection.body_text()))?;
    if let Some(role) = body.role {
        if role != Role::User {
            return Err(SolaceError::InvalidInput(format!(
                "only user messages can be sent, got '{}'",
                role
            ))
            .into());
        }
    }

    let cancel = state.shutdown.child_token();
    let exchange = state
        .coordinator
        .submit_turn(&body.session_id, &body.content, &cancel)
        .await?;
    Ok(Json(exchange))
}

#[derive(Serialize)]
struct ClearResponse {
    message: &'static str,
}

async fn clear_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> std::result::Result<Json<ClearResponse>, ApiError> {
    state.coordinator.clear_session(&session_id).await?;
    Ok(Json(ClearResponse {
        message: "Chat history cleared",
    }))
}

/// Serve `state` on `listener` until `shutdown` fires.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let addr = listener.local_addr()?;
    tracing::info!("Listening on http://{}", addr);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| SolaceError::Server(e.to_string()))
}

/// Full server lifecycle: store, pool warm-up, maintenance, HTTP, shutdown.
pub async fn run(config: AppConfig) -> Result<()> {
    config.validate()?;

    let store = StoreHandle::new(TranscriptStore::open(&config.db_path)?);
    tracing::info!("Transcript store at {}", config.db_path.display());

    let remote: Arc<dyn RemoteConversationService> =
        Arc::new(LocalAssistant::new(config.assistant_latency));
    tracing::info!("Using {} assistant", remote.name());

    let pool = HandlePool::new(remote.clone());
    warm_up(&pool, config.pool_target, config.init_timeout).await;

    let shutdown = CancellationToken::new();
    let maintenance = spawn_maintenance(pool.clone(), config.maintenance_period, shutdown.clone());

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown requested");
            }
            shutdown.cancel();
        });
    }

    let coordinator = Arc::new(RequestCoordinator::new(
        remote,
        pool.clone(),
        config.poll,
        store,
    )?);
    let listener = TcpListener::bind(config.bind_addr).await?;
    let served = serve(listener, AppState::new(coordinator, shutdown.clone())).await;

    shutdown.cancel();
    if let Err(e) = maintenance.await {
        tracing::warn!("Maintenance task ended abnormally: {}", e);
    }
    if tokio::time::timeout(SETTLE_TIMEOUT, pool.settle()).await.is_err() {
        tracing::warn!("Background handle creations still pending at exit");
    }
    served
}

/// Fill the pool, waiting at most `limit`. Creations still running after that
/// keep going in the background and land in the pool when they finish.
async fn warm_up(pool: &HandlePool, target: usize, limit: Duration) {
    let init = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.initialize(target).await })
    };

    match tokio::time::timeout(limit, init).await {
        Ok(Ok(report)) => {
            tracing::info!(
                "Handle pool ready: {}/{} created",
                report.created,
                report.requested
            );
        }
        Ok(Err(e)) => tracing::warn!("Pool warm-up task failed: {}", e),
        Err(_) => {
            let status = pool.status();
            tracing::warn!(
                "Pool warm-up exceeded {:?}, starting with {}/{} handles",
                limit,
                status.available,
                status.target
            );
        }
    }
}
