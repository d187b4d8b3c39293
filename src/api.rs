//! # HTTP API
//!
//! An `axum` server exposing the engine: publishing, subscription management,
//! delivery inspection, health, and the Prometheus exposition.
//!
//! The server shuts down gracefully when the shared shutdown signal flips.

use crate::core::{ChannelId, ChannelInfo, Metadata, Notification, NotificationId, SubscriptionId};
use crate::engine::{Engine, EngineHealth, SubscriptionInfo};
use crate::error::EngineError;
use crate::filter::{Filter, FilterSpec};
use crate::sink::FailedDelivery;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, trace};
use uuid::Uuid;

/// Error body returned by every failing endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    pub code: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorResponse {
            code: self.code.to_string(),
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let message = err.to_string();
        match err {
            EngineError::SubscriptionNotFound(_) | EngineError::ChannelNotFound(_) => {
                ApiError::not_found(message)
            }
            EngineError::InvalidTopic | EngineError::InvalidFilter(_) => {
                ApiError::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
            }
            EngineError::QueueFull(_) => {
                ApiError::new(StatusCode::TOO_MANY_REQUESTS, "QUEUE_FULL", message)
            }
            EngineError::ShutdownInProgress => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN", message)
            }
            EngineError::DuplicateChannel(_) => {
                ApiError::new(StatusCode::CONFLICT, "CONFLICT", message)
            }
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Clone)]
struct ApiState {
    engine: Arc<Engine>,
    prometheus: Option<PrometheusHandle>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSubscription {
    pub topic: String,
    pub channel: String,
    #[serde(default)]
    pub filter: FilterSpec,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreatedSubscription {
    pub id: SubscriptionId,
}

/// Builds the API router.
pub fn router(engine: Arc<Engine>, prometheus: Option<PrometheusHandle>) -> Router {
    Router::new()
        .route("/topics/{topic}/notifications", post(publish))
        .route("/subscriptions", get(list_subscriptions).post(create_subscription))
        .route(
            "/subscriptions/{id}",
            get(get_subscription).delete(delete_subscription),
        )
        .route("/channels", get(list_channels))
        .route("/notifications/{id}", get(get_notification))
        .route("/dead-letters", get(dead_letters))
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .with_state(ApiState { engine, prometheus })
}

/// Publishes the raw request body. Query parameters become metadata; the
/// request Content-Type is kept under the `content-type` key unless the
/// query already sets it.
async fn publish(
    State(state): State<ApiState>,
    Path(topic): Path<String>,
    Query(mut metadata): Query<Metadata>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    if let Some(content_type) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    {
        metadata
            .entry("content-type".to_string())
            .or_insert_with(|| content_type.to_string());
    }

    let notification = Notification::new(topic, body.to_vec()).with_metadata_map(metadata);
    let report = state.engine.publish_notification(notification)?;
    let summary = report.summary();

    let status = if summary.matched > 0 && summary.accepted == 0 {
        StatusCode::TOO_MANY_REQUESTS
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(summary)).into_response())
}

async fn list_subscriptions(State(state): State<ApiState>) -> Json<Vec<SubscriptionInfo>> {
    Json(state.engine.subscriptions())
}

async fn create_subscription(
    State(state): State<ApiState>,
    Json(request): Json<CreateSubscription>,
) -> ApiResult<(StatusCode, Json<CreatedSubscription>)> {
    let filter = Filter::compile(request.filter)?;
    let id = state
        .engine
        .subscribe(request.topic, filter, ChannelId::from(request.channel))?;
    Ok((StatusCode::CREATED, Json(CreatedSubscription { id })))
}

async fn get_subscription(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SubscriptionInfo>> {
    let id = SubscriptionId(id);
    state
        .engine
        .subscription(id)
        .map(Json)
        .ok_or_else(|| EngineError::SubscriptionNotFound(id).into())
}

async fn delete_subscription(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.engine.unsubscribe(SubscriptionId(id))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_channels(State(state): State<ApiState>) -> Json<Vec<ChannelInfo>> {
    Json(state.engine.channels())
}

async fn get_notification(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let id = NotificationId(id);
    match state.engine.attempts(id) {
        Some(attempts) => Ok(Json(attempts).into_response()),
        None => Err(ApiError::not_found(format!(
            "notification {id} is unknown or fully resolved"
        ))),
    }
}

async fn dead_letters(State(state): State<ApiState>) -> Json<Vec<FailedDelivery>> {
    Json(state.engine.dead_letters())
}

async fn health(State(state): State<ApiState>) -> (StatusCode, Json<EngineHealth>) {
    let health = state.engine.health();
    let status = if health.accepting {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}

async fn render_metrics(State(state): State<ApiState>) -> ApiResult<String> {
    state
        .prometheus
        .as_ref()
        .map(|handle| handle.render())
        .ok_or_else(|| ApiError::not_found("metrics are disabled"))
}

/// The HTTP API server.
///
/// Binding happens in [`ApiServer::bind`] so the caller learns the actual
/// address (useful with port 0) before the server starts.
pub struct ApiServer {
    listener: TcpListener,
    router: Router,
    shutdown_rx: watch::Receiver<bool>,
}

impl ApiServer {
    pub async fn bind(
        address: SocketAddr,
        router: Router,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(address).await.map_err(|e| {
            error!("Failed to bind API server to {}: {}", address, e);
            anyhow::anyhow!("failed to bind API server to {address}: {e}")
        })?;
        Ok(Self {
            listener,
            router,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves requests until the shutdown signal is received.
    pub async fn run(self) {
        let mut shutdown_rx = self.shutdown_rx;
        if let Ok(addr) = self.listener.local_addr() {
            info!(address = %addr, "API server listening");
        }
        let result = axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|v| *v).await;
                trace!("API server received shutdown signal.");
            })
            .await;
        if let Err(e) = result {
            error!("API server error: {}", e);
        }
        trace!("API server task finished.");
    }
}
