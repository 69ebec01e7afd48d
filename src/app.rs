//! Central application state and the operations the server surface calls.
//!
//! `ShockApp` owns every process-wide singleton (settings, the link handle,
//! the scheduler, the broadcast hub, the session registry, and command
//! tracking) and is handed to the route layer as an `Arc`. All mutation
//! funnels through the methods here; handlers stay thin request/response
//! glue.
//!
//! Locking order, where two locks are held together: registry before hub
//! connection table.

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{HubError, HubResult};
use crate::hub::{ErrorPayload, Hub, PongPayload, StatusPayload};
use crate::link::{DeviceSnapshot, LinkHandle, McuState};
use crate::protocol::{McuCommand, MAX_POWER_LEVEL};
use crate::scheduler::{Scheduler, SchedulerStatus, SettingsUpdate};
use crate::session::{
    can_administer, can_issue_command, identify, CommandTracking, ConnId, Role, SessionRegistry,
};

/// A client→server envelope: `{type: "command"|"ping", ...}`.
#[derive(Debug, Deserialize)]
pub struct ClientEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub set_power_to: Option<i64>,
}

pub type SharedApp = Arc<ShockApp>;

pub struct ShockApp {
    pub settings: Settings,
    pub link: LinkHandle,
    pub scheduler: Scheduler,
    pub hub: Hub,
    pub registry: Mutex<SessionRegistry>,
    tracking: Mutex<CommandTracking>,
}

impl ShockApp {
    pub fn new(settings: Settings, link: LinkHandle) -> SharedApp {
        let scheduler = Scheduler::new(
            link.clone(),
            settings.scheduler.defaults.clone(),
            Duration::from_millis(settings.scheduler.cycle_settle_ms),
        );
        Arc::new(Self {
            settings,
            link,
            scheduler,
            hub: Hub::new(),
            registry: Mutex::new(SessionRegistry::new()),
            tracking: Mutex::new(CommandTracking::new()),
        })
    }

    /// Spawn the device-event fan-out task and the periodic roster
    /// re-broadcast task.
    pub fn spawn_background(self: &Arc<Self>) {
        let app = Arc::clone(self);
        let mut events = self.link.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(snapshot) => {
                        // link loss halts any autonomous activity before the
                        // status goes out
                        if snapshot.state == McuState::Disconnected {
                            let _ = app.scheduler.stop().await;
                        }
                        app.broadcast_device_status(&snapshot).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "device event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let app = Arc::clone(self);
        let period = Duration::from_millis(self.settings.hub.roster_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                app.broadcast_users().await;
            }
        });
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    /// Register a new physical connection: attach it to its session, push
    /// the current status to it, and re-broadcast the roster.
    pub async fn client_connected(
        &self,
        identity: &str,
        tx: tokio::sync::mpsc::Sender<axum::extract::ws::Message>,
    ) -> ConnId {
        let conn = self.hub.register(identity, tx).await;
        {
            let mut registry = self.registry.lock().await;
            registry.attach(identity, conn);
            info!(
                identity,
                nickname = %registry.get_or_create(identity).nickname,
                conn,
                "client connected"
            );
        }
        self.push_status_to(conn).await;
        self.broadcast_users().await;
        conn
    }

    /// Tear down a physical connection. When the session's last connection
    /// goes, its command-tracking entries clear and a status update goes out.
    pub async fn client_disconnected(&self, identity: &str, conn: ConnId) {
        self.hub.unregister(conn).await;
        let fully_disconnected = {
            let mut registry = self.registry.lock().await;
            registry.detach(identity, conn)
        };
        info!(identity, conn, fully_disconnected, "client disconnected");
        if fully_disconnected {
            self.tracking.lock().await.clear(identity);
            self.broadcast_status().await;
        }
        self.broadcast_users().await;
    }

    // =========================================================================
    // Client messages
    // =========================================================================

    /// Handle one client→server text frame. Rejections go back to the
    /// sending connection only.
    pub async fn handle_client_text(&self, identity: &str, conn: ConnId, text: &str) {
        let envelope: ClientEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(identity, error = %e, "unparseable client frame");
                return;
            }
        };
        match envelope.kind.as_str() {
            "ping" => {
                self.hub.send_to(conn, &PongPayload::new()).await;
            }
            "command" => {
                if let Err(e) = self.handle_command(identity, &envelope).await {
                    self.hub.send_to(conn, &ErrorPayload::new(e.to_string())).await;
                }
            }
            other => debug!(kind = other, "ignoring unknown envelope type"),
        }
    }

    async fn handle_command(&self, identity: &str, envelope: &ClientEnvelope) -> HubResult<()> {
        let role = {
            let mut registry = self.registry.lock().await;
            registry.get_or_create(identity).role
        };
        if !can_issue_command(role) {
            return Err(HubError::Permission(format!(
                "{}: Cannot send commands",
                role.as_str()
            )));
        }

        let command = envelope.command.as_deref().unwrap_or_default();
        match command {
            "start" => {
                self.link.send(McuCommand::Start).await?;
                info!(identity, role = role.as_str(), "START command");
                self.tracking.lock().await.mark_start(identity);
                self.broadcast_status().await;
            }
            "stop" => {
                self.link.send(McuCommand::Stop).await?;
                info!(identity, role = role.as_str(), "STOP command");
                self.tracking.lock().await.mark_stop(identity);
                self.broadcast_status().await;
            }
            "calibrate" => {
                self.link.send(McuCommand::Calibrate).await?;
                info!(identity, role = role.as_str(), "CALIBRATE command");
            }
            "set_power" => {
                let level = envelope.set_power_to.ok_or_else(|| {
                    HubError::Validation("set_power_to is required".to_string())
                })?;
                let level = u8::try_from(level)
                    .ok()
                    .filter(|l| *l <= MAX_POWER_LEVEL)
                    .ok_or_else(|| {
                        HubError::Validation(format!(
                            "set_power_to must be between 0 and {MAX_POWER_LEVEL}"
                        ))
                    })?;
                self.link.send(McuCommand::SetPower(level)).await?;
                info!(identity, level, "SET_POWER command");
            }
            other => {
                return Err(HubError::Validation(format!("unknown command '{other}'")));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Administrative operations
    // =========================================================================

    /// Claim the Master role for the caller, creating their session if this
    /// is their first contact.
    pub async fn claim_master(&self, raw_addr: &str) -> HubResult<()> {
        let identity = identify(raw_addr);
        {
            let mut registry = self.registry.lock().await;
            registry.get_or_create(&identity);
            registry.claim_master(&identity)?;
        }
        self.broadcast_users().await;
        Ok(())
    }

    /// Assign a role by identity. `role_name` is a wire-format name.
    pub async fn admin_set_role(&self, ip: &str, role_name: &str) -> HubResult<String> {
        let role = Role::parse(role_name).ok_or_else(|| {
            HubError::Validation("Invalid role. Must be: master, guest, or bottom".to_string())
        })?;
        {
            let mut registry = self.registry.lock().await;
            registry.set_role(&identify(ip), role)?;
        }
        self.broadcast_users().await;
        Ok(format!("User role updated to {role_name}"))
    }

    /// Rename a session by identity.
    pub async fn admin_set_nickname(&self, ip: &str, nickname: &str) -> HubResult<String> {
        {
            let mut registry = self.registry.lock().await;
            registry.set_nickname(&identify(ip), nickname)?;
        }
        self.broadcast_users().await;
        Ok(format!("User nickname updated to {nickname}"))
    }

    /// Dispatch a reconnect attempt without waiting for its outcome.
    pub fn dispatch_reconnect(&self) {
        let link = self.link.clone();
        tokio::spawn(async move {
            if let Err(e) = link.connect().await {
                warn!(error = %e, "reconnect attempt failed");
            }
        });
    }

    pub async fn scheduler_status(&self) -> SchedulerStatus {
        self.scheduler.status().await
    }

    /// Apply a scheduler settings update on behalf of `raw_addr`. Only a
    /// Master may do this.
    pub async fn update_scheduler(
        &self,
        raw_addr: &str,
        update: SettingsUpdate,
    ) -> HubResult<crate::scheduler::SchedulerSettings> {
        let identity = identify(raw_addr);
        let role = {
            let mut registry = self.registry.lock().await;
            registry.get_or_create(&identity).role
        };
        if !can_administer(role) {
            return Err(HubError::Permission(
                "Only the master can change scheduler settings".to_string(),
            ));
        }
        self.scheduler.apply_update(update).await
    }

    // =========================================================================
    // Broadcasts
    // =========================================================================

    async fn status_payload(&self, snapshot: &DeviceSnapshot) -> StatusPayload {
        let (start, stop) = {
            let tracking = self.tracking.lock().await;
            (tracking.started(), tracking.stopped())
        };
        StatusPayload::new(snapshot, start, stop)
    }

    /// Status payload from a fresh link snapshot, to every connection.
    pub async fn broadcast_status(&self) {
        let snapshot = self.link.snapshot().await;
        let payload = self.status_payload(&snapshot).await;
        self.hub.broadcast_status(&payload).await;
    }

    /// Status payload from an already-received device event.
    async fn broadcast_device_status(&self, snapshot: &DeviceSnapshot) {
        let payload = self.status_payload(snapshot).await;
        self.hub.broadcast_status(&payload).await;
    }

    async fn push_status_to(&self, conn: ConnId) {
        let snapshot = self.link.snapshot().await;
        let payload = self.status_payload(&snapshot).await;
        self.hub.send_to(conn, &payload).await;
    }

    /// Personalized roster payloads to every connection.
    pub async fn broadcast_users(&self) {
        let registry = self.registry.lock().await;
        self.hub.broadcast_users(&registry).await;
    }
}
