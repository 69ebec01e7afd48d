//! # shock-hub
//!
//! Coordination server for a single shock controller reachable over a
//! byte-oriented serial link, shared by any number of remote clients over
//! WebSocket. The server keeps every client's view of controller state
//! consistent, enforces a three-tier permission model keyed by network
//! identity, and can drive the controller autonomously on a randomized
//! timer.
//!
//! ## Crate Structure
//!
//! - **`app`**: `ShockApp`, the central state object the route layer calls
//!   into; owns every process-wide singleton.
//! - **`config`**: figment-based settings loading (TOML file + environment).
//! - **`discovery`**: serial endpoint enumeration and ranked attempt order.
//! - **`error`**: the `HubError` taxonomy used across the crate.
//! - **`hub`**: broadcast hub, fanning status and roster payloads out to
//!   every live connection.
//! - **`link`**: the controller link actor owning the serial port and the
//!   device state machine.
//! - **`mock_serial`**: in-memory serial port pair for tests.
//! - **`protocol`**: wire codec for controller commands and status tokens.
//! - **`scheduler`**: the autonomous command scheduler and its settings.
//! - **`server`**: axum router, administrative endpoints, and WebSocket
//!   session handling.
//! - **`session`**: session registry, roles, and the permission gate.

pub mod app;
pub mod config;
pub mod discovery;
pub mod error;
pub mod hub;
pub mod link;
pub mod mock_serial;
pub mod protocol;
pub mod scheduler;
pub mod server;
pub mod session;
