//! HTTP surface.
//!
//! | Route                    | Purpose                                   |
//! |--------------------------|-------------------------------------------|
//! | `GET /healthz`, `/readyz`| liveness, no authentication               |
//! | `POST /_emulator/script` | load (or extend) the caller's script      |
//! | `POST /_emulator/reset`  | drop the caller's script                  |
//! | `GET /_emulator/state`   | debug view, when `settings.debug_state`   |
//! | `* /v1/...`              | the emulated API                          |
//!
//! Every route except the health checks requires `Authorization: Bearer`.

use crate::engine::{Emulator, Reply, ReplyBody};
use crate::error::ApiError;
use crate::request::{Endpoint, RequestDescriptor};
use crate::stream::StreamFrame;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream, StreamExt};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub fn router(emulator: Arc<Emulator>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/readyz", get(health))
        .route("/_emulator/script", post(load_script))
        .route("/_emulator/reset", post(reset))
        .route("/_emulator/state", get(state))
        .route("/v1/*rest", any(api))
        .with_state(emulator)
}

/// Bind `addr` and serve until Ctrl-C.
pub async fn serve(emulator: Arc<Emulator>, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %listener.local_addr()?, "LLM emulator listening");

    axum::serve(listener, router(emulator))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}

async fn health() -> &'static str {
    "OK"
}

fn authorization(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
}

async fn load_script(
    State(emulator): State<Arc<Emulator>>,
    headers: HeaderMap,
    body: Bytes,
) -> Reply {
    let token = match emulator.authenticate(authorization(&headers)) {
        Ok(token) => token,
        Err(e) => return e.into(),
    };

    match emulator.load_script(&token, &body).await {
        Ok(summary) => Reply::json(
            200,
            &json!({
                "status": "ok",
                "rules": summary.rules,
                "responses": summary.responses,
                "extended": summary.extended,
            }),
        )
        .unwrap_or_else(Reply::from),
        Err(e) => ApiError::BadRequest(e.to_string()).into(),
    }
}

async fn reset(State(emulator): State<Arc<Emulator>>, headers: HeaderMap) -> Reply {
    match emulator.authenticate(authorization(&headers)) {
        Ok(token) => {
            emulator.reset(&token).await;
            Reply::json(200, &json!({"status": "ok"})).unwrap_or_else(Reply::from)
        }
        Err(e) => e.into(),
    }
}

async fn state(State(emulator): State<Arc<Emulator>>, headers: HeaderMap) -> Reply {
    let result = match emulator.authenticate(authorization(&headers)) {
        Ok(token) => emulator.state(&token).await,
        Err(e) => Err(e),
    };
    result
        .and_then(|state| Reply::json(200, &state))
        .unwrap_or_else(Reply::from)
}

async fn api(
    State(emulator): State<Arc<Emulator>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Reply {
    let token = match emulator.authenticate(authorization(&headers)) {
        Ok(token) => token,
        Err(e) => return e.into(),
    };

    let path = uri.path();
    let body = if body.is_empty() {
        None
    } else {
        match serde_json::from_slice::<Value>(&body) {
            Ok(value) => Some(value),
            Err(_) if Endpoint::from_path(path).is_generation() => {
                return ApiError::BadRequest("Invalid JSON".to_string()).into()
            }
            // JSON predicates simply fail on other paths
            Err(_) => None,
        }
    };

    let req = RequestDescriptor::new(method.as_str(), path, body, &token).with_query(uri.query());
    emulator.handle(&req).await
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let mut response = match self.body {
            ReplyBody::Json(value) => (status, Json(value)).into_response(),
            ReplyBody::Text(text) => (status, text).into_response(),
            ReplyBody::Stream { frames, pace } => {
                (status, event_stream(frames, pace)).into_response()
            }
        };

        for (name, value) in &self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    response.headers_mut().insert(name, value);
                }
                _ => warn!(header = %name, "Skipping invalid response header"),
            }
        }

        response
    }
}

/// Emit frames as `data:` events, sleeping `pace` between consecutive ones.
fn event_stream(
    frames: Vec<StreamFrame>,
    pace: Duration,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let payloads: Vec<String> = frames
        .iter()
        .filter_map(|frame| match frame.data() {
            Ok(data) => Some(data),
            Err(e) => {
                warn!(error = %e, "Failed to encode stream frame");
                None
            }
        })
        .collect();

    let events = stream::iter(payloads.into_iter().enumerate()).then(move |(i, data)| async move {
        if i > 0 && !pace.is_zero() {
            tokio::time::sleep(pace).await;
        }
        Ok::<_, Infallible>(Event::default().data(data))
    });

    Sse::new(events)
}
