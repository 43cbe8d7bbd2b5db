//! HTTP endpoints: the SSE stream, message submission, and room queries.

use anyhow::Result;
use axum::{
    extract::{rejection::FormRejection, Query, State},
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Sse},
    routing::{get, post},
    Form, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::ChatError;
use crate::hub::Hub;
use crate::models::{validate_username, Message};
use crate::storage::{spawn_purge_task, MessageStore};
use crate::stream::{ChatStream, StreamSettings};

/// Largest history page a client may request.
const MAX_HISTORY_LIMIT: usize = 500;

/// Application state for web server.
#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub store: Arc<dyn MessageStore>,
    pub settings: StreamSettings,
    pub history_limit: usize,
    /// Flipped to `true` to end every open stream
    shutdown: Arc<watch::Sender<bool>>,
}

impl AppState {
    /// Spawn a hub over `store` and wrap both for the router.
    pub fn new(store: Arc<dyn MessageStore>, config: &Config) -> Self {
        let hub = Hub::spawn(store.clone(), config.broadcast_buffer);
        let (shutdown, _) = watch::channel(false);

        Self {
            hub,
            store,
            settings: StreamSettings {
                queue_capacity: config.queue_capacity,
                keepalive: config.keepalive(),
            },
            history_limit: config.history_limit,
            shutdown: Arc::new(shutdown),
        }
    }

    /// End all open streams and stop the hub.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.hub.shutdown();
    }
}

/// Query parameters for the stream endpoint.
#[derive(Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    username: String,
}

/// Form fields for sending a message.
#[derive(Deserialize)]
pub struct SendForm {
    #[serde(default)]
    content: String,
    #[serde(default)]
    username: String,
}

/// Form fields for joining the room.
#[derive(Deserialize)]
pub struct JoinForm {
    #[serde(default)]
    username: String,
}

/// Query parameters for history endpoint. With `since`, the window
/// `[since, until]` is returned instead of the latest messages; `until`
/// defaults to now.
#[derive(Deserialize)]
pub struct HistoryQuery {
    limit: Option<usize>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Stats {
    pub connected_users: usize,
    pub total_messages: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JoinResponse {
    pub username: String,
    pub history: Vec<Message>,
    pub connected_users: Vec<String>,
}

/// Build the chat router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/chat/join", post(join_handler))
        .route("/chat/stream", get(stream_handler))
        .route("/chat/send", post(send_handler))
        .route("/chat/stats", get(stats_handler))
        .route("/chat/history", get(history_handler))
        .route("/chat/users", get(users_handler))
        .with_state(state)
}

/// Run the web server until Ctrl-C.
pub async fn run_web_server(config: &Config, store: Arc<dyn MessageStore>) -> Result<()> {
    let state = AppState::new(store.clone(), config);

    let sweeper = config.retention_days.map(|days| {
        info!("Retaining messages for {} day(s)", days);
        spawn_purge_task(
            store,
            chrono::Duration::days(i64::from(days)),
            std::time::Duration::from_secs(config.purge_interval_secs.max(1)),
        )
    });

    let app = router(state.clone()).layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("{}:{}", config.host, config.http_port).parse()?;
    info!("Chat server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down, closing open streams");
            state.shutdown();
        })
        .await?;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }

    Ok(())
}

/// Health check.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// SSE stream for one viewer.
async fn stream_handler(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    let chat = ChatStream::connect(
        &state.hub,
        &query.username,
        state.settings,
        state.shutdown.subscribe(),
    );
    info!("Stream opened for {} ({})", chat.username(), chat.session_id());

    // Sse sets content-type and cache-control itself.
    (
        [
            (header::CONNECTION, "keep-alive"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(chat.into_stream()),
    )
}

/// Accept a chat message. The response does not depend on delivery.
async fn send_handler(
    State(state): State<AppState>,
    form: Result<Form<SendForm>, FormRejection>,
) -> Result<StatusCode, ChatError> {
    let Form(form) = form?;
    let message = Message::text(&form.username, &form.content)?;
    state.hub.broadcast(message).await;
    Ok(StatusCode::OK)
}

/// Connected users and stored message count.
async fn stats_handler(State(state): State<AppState>) -> Json<Stats> {
    let connected_users = state.hub.connected_count().await;
    let total_messages = match state.store.count_all().await {
        Ok(count) => count,
        Err(e) => {
            error!("Failed to count messages: {}", e);
            0
        }
    };

    Json(Stats {
        connected_users,
        total_messages,
    })
}

/// Validate a display name and hand back what the chat page needs to start.
async fn join_handler(
    State(state): State<AppState>,
    form: Result<Form<JoinForm>, FormRejection>,
) -> Result<Json<JoinResponse>, ChatError> {
    let Form(form) = form?;
    let username = validate_username(&form.username)?;

    let history = state
        .store
        .recent(state.history_limit)
        .await
        .unwrap_or_else(|e| {
            warn!("Failed to load history for {}: {}", username, e);
            Vec::new()
        });
    let connected_users = connected_names(&state.hub).await;

    Ok(Json(JoinResponse {
        username,
        history,
        connected_users,
    }))
}

/// Recent messages, or the newest `limit` within a time window, oldest first.
async fn history_handler(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let limit = query
        .limit
        .unwrap_or(state.history_limit)
        .clamp(1, MAX_HISTORY_LIMIT);

    let result = match query.since {
        Some(since) => {
            let until = query.until.unwrap_or_else(Utc::now);
            state.store.between(since, until).await.map(|mut messages| {
                let skip = messages.len().saturating_sub(limit);
                messages.drain(..skip);
                messages
            })
        }
        None => state.store.recent(limit).await,
    };

    match result {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => {
            error!("Failed to load history: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to load history").into_response()
        }
    }
}

/// Display names of everyone connected.
async fn users_handler(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(connected_names(&state.hub).await)
}

async fn connected_names(hub: &Hub) -> Vec<String> {
    let mut names: Vec<String> = hub.members().await.into_iter().map(|m| m.username).collect();
    names.sort();
    names
}
