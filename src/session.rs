//! Session registry, roles, and the permission gate.
//!
//! A session is keyed by normalized network identity (one per remote user,
//! spanning any number of simultaneous connections) and lives for the
//! server's uptime. Roles:
//!
//! - `Master`: full control plus administration, at most one at a time
//! - `Guest`: can issue controller commands
//! - `Restricted`: read-only observer (wire name `bottom`)
//!
//! The first identity to arrive while no Master exists becomes `Guest`;
//! everyone after a Master exists starts `Restricted`.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::info;

use crate::error::{HubError, HubResult};

/// Opaque per-connection handle, unique for the server's uptime.
pub type ConnId = u64;

/// Permission tier of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Guest,
    /// Read-only observer
    #[serde(rename = "bottom")]
    Restricted,
}

impl Role {
    /// Parse a wire-format role name (`master`, `guest`, `bottom`).
    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "master" => Some(Role::Master),
            "guest" => Some(Role::Guest),
            "bottom" => Some(Role::Restricted),
            _ => None,
        }
    }

    /// Wire-format name of this role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Guest => "guest",
            Role::Restricted => "bottom",
        }
    }
}

/// Whether a role may issue controller commands.
pub fn can_issue_command(role: Role) -> bool {
    matches!(role, Role::Master | Role::Guest)
}

/// Whether a role may use the administrative surface.
pub fn can_administer(role: Role) -> bool {
    role == Role::Master
}

/// Strip the IPv4-in-IPv6 mapping prefix from a raw address.
pub fn identify(raw_address: &str) -> String {
    raw_address
        .strip_prefix("::ffff:")
        .unwrap_or(raw_address)
        .to_string()
}

/// One remote user, keyed by identity, spanning reconnects.
#[derive(Debug, Clone)]
pub struct Session {
    pub identity: String,
    pub nickname: String,
    pub role: Role,
    pub connections: HashSet<ConnId>,
}

impl Session {
    /// A session counts as connected while it has at least one live
    /// connection.
    pub fn connected(&self) -> bool {
        !self.connections.is_empty()
    }
}

/// Registry of all sessions seen since startup. Sessions are never removed;
/// `connected` toggles as connections attach and detach.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, Session>,
    nickname_counter: u64,
}

/// Maximum accepted nickname length.
pub const MAX_NICKNAME_LEN: usize = 50;

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an existing session.
    pub fn get(&self, identity: &str) -> Option<&Session> {
        self.sessions.get(identity)
    }

    /// Return the existing session for `identity`, creating one lazily.
    ///
    /// A new session gets role `Guest` if no Master exists yet, `Restricted`
    /// otherwise, and a unique auto-generated nickname.
    pub fn get_or_create(&mut self, identity: &str) -> &mut Session {
        let master_exists = self.master_exists();
        let counter = &mut self.nickname_counter;
        self.sessions
            .entry(identity.to_string())
            .or_insert_with(|| {
                let role = if master_exists {
                    Role::Restricted
                } else {
                    Role::Guest
                };
                *counter += 1;
                let session = Session {
                    identity: identity.to_string(),
                    nickname: format!("user_{counter}"),
                    role,
                    connections: HashSet::new(),
                };
                info!(
                    identity,
                    nickname = %session.nickname,
                    role = session.role.as_str(),
                    "new session"
                );
                session
            })
    }

    /// True while some session holds `Master`.
    pub fn master_exists(&self) -> bool {
        self.sessions.values().any(|s| s.role == Role::Master)
    }

    /// Promote `identity` to Master. Fails if the caller already is Master
    /// or any Master exists.
    pub fn claim_master(&mut self, identity: &str) -> HubResult<()> {
        let session = self
            .sessions
            .get(identity)
            .ok_or_else(|| HubError::NotFound(identity.to_string()))?;
        if session.role == Role::Master {
            return Err(HubError::Validation("You are already a master".to_string()));
        }
        if self.master_exists() {
            return Err(HubError::Validation("A master already exists".to_string()));
        }
        if let Some(session) = self.sessions.get_mut(identity) {
            session.role = Role::Master;
            info!(identity, nickname = %session.nickname, "master claimed");
        }
        Ok(())
    }

    /// Assign a role. Assigning `Master` while a different session holds it
    /// is rejected so at most one Master exists at any instant.
    pub fn set_role(&mut self, identity: &str, role: Role) -> HubResult<()> {
        if !self.sessions.contains_key(identity) {
            return Err(HubError::NotFound(identity.to_string()));
        }
        if role == Role::Master {
            let other_master = self
                .sessions
                .values()
                .any(|s| s.role == Role::Master && s.identity != identity);
            if other_master {
                return Err(HubError::Validation("A master already exists".to_string()));
            }
        }
        if let Some(session) = self.sessions.get_mut(identity) {
            session.role = role;
            info!(identity, role = role.as_str(), "role changed");
        }
        Ok(())
    }

    /// Rename a session. Names must be 1-50 characters.
    pub fn set_nickname(&mut self, identity: &str, nickname: &str) -> HubResult<()> {
        if nickname.is_empty() || nickname.len() > MAX_NICKNAME_LEN {
            return Err(HubError::Validation(format!(
                "Nickname must be between 1 and {MAX_NICKNAME_LEN} characters"
            )));
        }
        let session = self
            .sessions
            .get_mut(identity)
            .ok_or_else(|| HubError::NotFound(identity.to_string()))?;
        session.nickname = nickname.to_string();
        info!(identity, nickname, "nickname changed");
        Ok(())
    }

    /// Record a new physical connection for `identity`, creating the session
    /// if needed.
    pub fn attach(&mut self, identity: &str, conn: ConnId) {
        self.get_or_create(identity).connections.insert(conn);
    }

    /// Drop a physical connection. Returns true if the session just became
    /// fully disconnected.
    pub fn detach(&mut self, identity: &str, conn: ConnId) -> bool {
        if let Some(session) = self.sessions.get_mut(identity) {
            session.connections.remove(&conn);
            return session.connections.is_empty();
        }
        false
    }

    /// Iterate all sessions (roster order is unspecified).
    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }
}

/// Which identities most recently asserted start vs. stop. An identity is in
/// at most one of the two sets; both entries clear when the identity fully
/// disconnects.
#[derive(Debug, Default)]
pub struct CommandTracking {
    started: HashSet<String>,
    stopped: HashSet<String>,
}

impl CommandTracking {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_start(&mut self, identity: &str) {
        self.stopped.remove(identity);
        self.started.insert(identity.to_string());
    }

    pub fn mark_stop(&mut self, identity: &str) {
        self.started.remove(identity);
        self.stopped.insert(identity.to_string());
    }

    pub fn clear(&mut self, identity: &str) {
        self.started.remove(identity);
        self.stopped.remove(identity);
    }

    pub fn started(&self) -> Vec<String> {
        self.started.iter().cloned().collect()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stopped.iter().cloned().collect()
    }
}
