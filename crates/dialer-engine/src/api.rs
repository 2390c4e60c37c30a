//! Operational HTTP surface and the error envelope shared with the storage
//! façade

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::engine::{DialerEngine, EngineStatus, LoopStatus};
use crate::error::{DialerError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Timeout(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT", msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE", msg),
            ApiError::Internal(msg) => {
                error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = Json(ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message,
                details: None,
            },
        });
        (status, body).into_response()
    }
}

impl From<DialerError> for ApiError {
    fn from(err: DialerError) -> Self {
        match err {
            DialerError::NotFound(msg) => ApiError::NotFound(msg),
            DialerError::InvalidInput(msg) | DialerError::Serialization(msg) => ApiError::BadRequest(msg),
            DialerError::Timeout(msg) => ApiError::Timeout(msg),
            DialerError::Storage(msg) => ApiError::Unavailable(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub loops: LoopStatus,
}

/// `/health` and `/status` over a running engine
pub fn router(engine: Arc<DialerEngine>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

async fn health(State(engine): State<Arc<DialerEngine>>) -> (StatusCode, Json<HealthResponse>) {
    let loops = engine.loop_status();
    let healthy = loops.all_running();
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(HealthResponse { healthy, loops }))
}

async fn status(State(engine): State<Arc<DialerEngine>>) -> Json<EngineStatus> {
    Json(engine.status())
}

/// Serve `app` until `shutdown` resolves
pub async fn serve<F>(app: Router, addr: SocketAddr, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| DialerError::configuration(format!("cannot bind {}: {}", addr, e)))?;
    info!("HTTP surface listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| DialerError::internal(format!("http server: {}", e)))
}
