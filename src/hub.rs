//! Broadcast hub: fan-out of device state and roster snapshots to every
//! live connection.
//!
//! The hub only holds non-owning send handles; each WebSocket task owns its
//! socket and drains a per-connection channel. A send failure marks the
//! connection dead and drops it from the table; the socket task notices its
//! channel closing and finishes tear-down itself.

use axum::extract::ws::Message;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use crate::link::DeviceSnapshot;
use crate::session::{ConnId, Session, SessionRegistry};

/// One `status` payload, sent identically to every connection.
#[derive(Debug, Clone, Serialize)]
pub struct StatusPayload {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub mcu_status: &'static str,
    pub mcu_power_level: u8,
    pub user_commands: UserCommands,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserCommands {
    pub start: Vec<String>,
    pub stop: Vec<String>,
}

impl StatusPayload {
    pub fn new(snapshot: &DeviceSnapshot, start: Vec<String>, stop: Vec<String>) -> Self {
        Self {
            kind: "status",
            mcu_status: snapshot.state.as_str(),
            mcu_power_level: snapshot.power_level,
            user_commands: UserCommands { start, stop },
        }
    }
}

/// One roster entry in a `users` payload.
#[derive(Debug, Clone, Serialize)]
pub struct UserEntry {
    pub ip: String,
    pub username: String,
    pub role: &'static str,
    pub status: &'static str,
}

impl UserEntry {
    pub fn from_session(session: &Session) -> Self {
        Self {
            ip: session.identity.clone(),
            username: session.nickname.clone(),
            role: session.role.as_str(),
            status: if session.connected() {
                "online"
            } else {
                "offline"
            },
        }
    }
}

/// The receiving connection's own summary, personalizing a `users` payload.
#[derive(Debug, Clone, Serialize)]
pub struct MyUserInfo {
    pub ip: String,
    pub nickname: String,
    pub role: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsersPayload {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub users: Vec<UserEntry>,
    pub my_user_info: MyUserInfo,
}

/// Error envelope, sent only to the offending connection.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: "error",
            message: message.into(),
        }
    }
}

/// In-band keep-alive reply.
#[derive(Debug, Clone, Serialize)]
pub struct PongPayload {
    #[serde(rename = "type")]
    pub kind: &'static str,
}

impl PongPayload {
    pub fn new() -> Self {
        Self { kind: "pong" }
    }
}

impl Default for PongPayload {
    fn default() -> Self {
        Self::new()
    }
}

struct ConnHandle {
    identity: String,
    tx: mpsc::Sender<Message>,
}

/// Registry of live connections.
#[derive(Default)]
pub struct Hub {
    conns: Mutex<HashMap<ConnId, ConnHandle>>,
    conn_counter: AtomicU64,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection's send handle; returns its id.
    pub async fn register(&self, identity: &str, tx: mpsc::Sender<Message>) -> ConnId {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.conns.lock().await.insert(
            id,
            ConnHandle {
                identity: identity.to_string(),
                tx,
            },
        );
        id
    }

    /// Remove a connection. Safe to call for an already-removed id.
    pub async fn unregister(&self, conn: ConnId) {
        self.conns.lock().await.remove(&conn);
    }

    /// Snapshot of (connection id, identity) pairs.
    pub async fn connections(&self) -> Vec<(ConnId, String)> {
        self.conns
            .lock()
            .await
            .iter()
            .map(|(id, handle)| (*id, handle.identity.clone()))
            .collect()
    }

    /// Serialize and send a payload to one connection. Returns false (and
    /// prunes the connection) if it is gone.
    pub async fn send_to<T: Serialize>(&self, conn: ConnId, payload: &T) -> bool {
        let text = match serde_json::to_string(payload) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "payload serialization failed");
                return false;
            }
        };
        let tx = {
            let conns = self.conns.lock().await;
            match conns.get(&conn) {
                Some(handle) => handle.tx.clone(),
                None => return false,
            }
        };
        if tx.send(Message::Text(text)).await.is_err() {
            warn!(conn, "send failed, pruning connection");
            self.unregister(conn).await;
            return false;
        }
        true
    }

    /// Send one status payload to every live connection.
    pub async fn broadcast_status(&self, payload: &StatusPayload) {
        for (conn, _) in self.connections().await {
            self.send_to(conn, payload).await;
        }
    }

    /// Send a personalized users payload to every live connection. The
    /// roster is shared; `my_user_info` is looked up per connection.
    pub async fn broadcast_users(&self, registry: &SessionRegistry) {
        let roster: Vec<UserEntry> = registry.iter().map(UserEntry::from_session).collect();
        for (conn, identity) in self.connections().await {
            let Some(session) = registry.get(&identity) else {
                continue;
            };
            let payload = UsersPayload {
                kind: "users",
                users: roster.clone(),
                my_user_info: MyUserInfo {
                    ip: session.identity.clone(),
                    nickname: session.nickname.clone(),
                    role: session.role.as_str(),
                },
            };
            self.send_to(conn, &payload).await;
        }
    }
}
