//! HTTP route layer and WebSocket session handling.
//!
//! Thin glue: every handler resolves the caller's identity from the
//! forwarded-for headers (falling back to the peer address) and calls into
//! [`ShockApp`](crate::app::ShockApp). Response codes and payload shapes
//! follow the client protocol exactly; see the handler bodies.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::app::SharedApp;
use crate::error::{HubError, HubResult};
use crate::scheduler::SettingsUpdate;
use crate::session::identify;

/// Build the application router. Serve it with
/// `into_make_service_with_connect_info::<SocketAddr>()` so handlers can see
/// the peer address.
pub fn build_router(app: SharedApp) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/ws", get(ws_upgrade))
        .route("/reconnect-mcu", get(reconnect_mcu))
        .route("/claim-master", get(claim_master))
        .route("/set-user-role", post(set_user_role))
        .route("/set-user-nickname", post(set_user_nickname))
        .route("/scheduler-status", get(scheduler_status))
        .route("/scheduler-settings", post(scheduler_settings))
        .with_state(app)
}

/// Resolve the caller's normalized identity: first `x-forwarded-for` entry,
/// then `x-real-ip`, then the peer address.
fn client_identity(headers: &HeaderMap, addr: SocketAddr) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    let raw = forwarded
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_else(|| addr.ip().to_string());
    identify(&raw)
}

fn message(text: impl Into<String>) -> Json<serde_json::Value> {
    Json(json!({ "message": text.into() }))
}

/// Map an application error to the wire status code.
fn error_response(e: HubError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &e {
        HubError::NotFound(_) => StatusCode::NOT_FOUND,
        HubError::Permission(_) => StatusCode::FORBIDDEN,
        HubError::Validation(_) | HubError::Link(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let text = match e {
        HubError::Validation(msg) | HubError::Permission(msg) | HubError::Link(msg) => msg,
        HubError::NotFound(_) => "User not found".to_string(),
        other => other.to_string(),
    };
    (status, message(text))
}

fn respond(result: HubResult<String>) -> impl IntoResponse {
    match result {
        Ok(text) => (StatusCode::OK, message(text)),
        Err(e) => error_response(e),
    }
}

async fn health() -> impl IntoResponse {
    message("Server is running")
}

async fn reconnect_mcu(State(app): State<SharedApp>) -> impl IntoResponse {
    app.dispatch_reconnect();
    message("Attempting to reconnect to the controller")
}

async fn claim_master(
    State(app): State<SharedApp>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let identity = client_identity(&headers, addr);
    respond(
        app.claim_master(&identity)
            .await
            .map(|()| "You are now the master".to_string()),
    )
}

#[derive(Debug, Deserialize)]
struct UserTarget {
    ip: Option<String>,
    role: Option<String>,
    nickname: Option<String>,
}

async fn set_user_role(
    State(app): State<SharedApp>,
    Json(body): Json<UserTarget>,
) -> impl IntoResponse {
    let (Some(ip), Some(role)) = (body.ip, body.role) else {
        return error_response(HubError::Validation("IP and role are required".to_string()));
    };
    match app.admin_set_role(&ip, &role).await {
        Ok(text) => (StatusCode::OK, message(text)),
        Err(e) => error_response(e),
    }
}

async fn set_user_nickname(
    State(app): State<SharedApp>,
    Json(body): Json<UserTarget>,
) -> impl IntoResponse {
    let (Some(ip), Some(nickname)) = (body.ip, body.nickname) else {
        return error_response(HubError::Validation(
            "IP and nickname are required".to_string(),
        ));
    };
    match app.admin_set_nickname(&ip, &nickname).await {
        Ok(text) => (StatusCode::OK, message(text)),
        Err(e) => error_response(e),
    }
}

async fn scheduler_status(State(app): State<SharedApp>) -> impl IntoResponse {
    Json(app.scheduler_status().await)
}

async fn scheduler_settings(
    State(app): State<SharedApp>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    let identity = client_identity(&headers, addr);
    let update: SettingsUpdate = match serde_json::from_value(body) {
        Ok(update) => update,
        Err(e) => return error_response(HubError::Validation(e.to_string())),
    };
    match app.update_scheduler(&identity, update).await {
        Ok(settings) => (StatusCode::OK, Json(json!(settings))),
        Err(e) => error_response(e),
    }
}

async fn ws_upgrade(
    State(app): State<SharedApp>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let identity = client_identity(&headers, addr);
    ws.on_upgrade(move |socket| client_session(app, socket, identity))
}

/// Drive one WebSocket connection: a writer task drains the per-connection
/// channel while this task dispatches incoming frames and probes liveness.
/// A probe left unanswered for a full interval counts as a disconnect.
async fn client_session(app: SharedApp, socket: WebSocket, identity: String) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(32);

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    let conn = app.client_connected(&identity, tx.clone()).await;

    let mut probe = tokio::time::interval(Duration::from_millis(app.settings.hub.probe_interval_ms));
    probe.tick().await;
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    app.handle_client_text(&identity, conn, &text).await;
                }
                Some(Ok(Message::Pong(_))) => awaiting_pong = false,
                Some(Ok(Message::Ping(_))) => {} // answered by the transport
                Some(Ok(Message::Binary(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(conn, error = %e, "socket error");
                    break;
                }
            },
            _ = probe.tick() => {
                if awaiting_pong {
                    debug!(conn, identity = %identity, "liveness probe unanswered");
                    break;
                }
                awaiting_pong = true;
                if tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    app.client_disconnected(&identity, conn).await;
    writer.abort();
}
