//! Controller link: owns the serial endpoint and the device state machine.
//!
//! The link runs as a single actor task. All mutation of device state
//! (connection state, power level, port path) happens inside the actor;
//! everything else observes via [`DeviceSnapshot`] values pushed on a
//! broadcast channel. Requests arrive over an mpsc channel, which also
//! serializes `connect()` attempts: at most one physical endpoint is ever
//! opened at a time, and a connect request that lands while another is in
//! flight simply runs after it.
//!
//! State machine:
//!
//! ```text
//! Disconnected -> Connecting -> (Idle | Busy | Running) -> Disconnected
//! ```
//!
//! Wire events from the controller transition the state directly regardless
//! of the current state; the controller is the source of truth. Any read or
//! write failure forces `Disconnected` and clears the port path.
//!
//! Incoming bytes are accumulated and split on `\n` by the reader task, so a
//! status token split across two reads is still decoded whole.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use crate::config::SerialConfig;
use crate::discovery;
use crate::error::{HubError, HubResult};
use crate::protocol::{decode_token, McuCommand, McuEvent};

/// Any async byte stream usable as a controller port. Real hardware uses
/// `tokio_serial::SerialStream`; tests use an in-memory duplex pipe.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed controller port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Connection state of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum McuState {
    Disconnected,
    Connecting,
    Idle,
    Busy,
    Running,
}

impl McuState {
    pub fn as_str(&self) -> &'static str {
        match self {
            McuState::Disconnected => "disconnected",
            McuState::Connecting => "connecting",
            McuState::Idle => "idle",
            McuState::Busy => "busy",
            McuState::Running => "running",
        }
    }
}

/// Read-only view of the device, pushed to subscribers on every change.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub state: McuState,
    pub power_level: u8,
    pub port_path: Option<String>,
}

impl DeviceSnapshot {
    pub fn connected(&self) -> bool {
        matches!(
            self.state,
            McuState::Idle | McuState::Busy | McuState::Running
        )
    }
}

/// Seam for acquiring endpoints, injectable for tests.
#[async_trait]
pub trait PortOpener: Send + Sync {
    /// Candidate paths in ranked attempt order.
    fn attempt_order(&self) -> Vec<String>;

    /// Open one endpoint.
    async fn open(&self, path: &str) -> HubResult<DynSerial>;
}

/// Production opener: enumerates USB/ACM candidates and opens them with
/// tokio-serial at the configured baud rate.
pub struct TokioPortOpener {
    config: SerialConfig,
}

impl TokioPortOpener {
    pub fn new(config: SerialConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PortOpener for TokioPortOpener {
    fn attempt_order(&self) -> Vec<String> {
        let candidates = discovery::list_candidates();
        discovery::ranked_attempt_order(
            self.config.preferred_port.as_deref(),
            &self.config.common_ports,
            &candidates,
        )
    }

    async fn open(&self, path: &str) -> HubResult<DynSerial> {
        let stream = tokio_serial::new(path, self.config.baud_rate)
            .open_native_async()
            .map_err(|e| HubError::Link(format!("open {path}: {e}")))?;
        Ok(Box::new(stream))
    }
}

enum LinkRequest {
    Connect {
        resp: oneshot::Sender<HubResult<DeviceSnapshot>>,
    },
    Send {
        command: McuCommand,
        resp: oneshot::Sender<HubResult<()>>,
    },
    Snapshot {
        resp: oneshot::Sender<DeviceSnapshot>,
    },
    // reader task -> actor; `generation` guards against a stale reader
    // outliving its connection
    Wire {
        generation: u64,
        event: McuEvent,
    },
    Closed {
        generation: u64,
        reason: String,
    },
}

/// Cloneable handle to the link actor.
#[derive(Clone)]
pub struct LinkHandle {
    tx: mpsc::Sender<LinkRequest>,
    events: broadcast::Sender<DeviceSnapshot>,
}

const REQUEST_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 64;

impl LinkHandle {
    /// Spawn the link actor. `settle` is the pause after opening an endpoint
    /// before the connection is trusted.
    pub fn spawn(opener: Arc<dyn PortOpener>, settle: Duration) -> LinkHandle {
        let (tx, rx) = mpsc::channel(REQUEST_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let actor = LinkActor {
            opener,
            settle,
            events: events.clone(),
            self_tx: tx.clone(),
            writer: None,
            reader: None,
            generation: 0,
            state: McuState::Disconnected,
            power_level: 0,
            port_path: None,
        };
        tokio::spawn(actor.run(rx));

        LinkHandle { tx, events }
    }

    /// Attempt to connect, iterating the ranked candidate order. Safe to
    /// call while already connected; the existing link is dropped and
    /// discovery re-runs.
    pub async fn connect(&self) -> HubResult<DeviceSnapshot> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(LinkRequest::Connect { resp })
            .await
            .map_err(|_| link_gone())?;
        rx.await.map_err(|_| link_gone())?
    }

    /// Write one command to the controller. Errors if disconnected.
    pub async fn send(&self, command: McuCommand) -> HubResult<()> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(LinkRequest::Send { command, resp })
            .await
            .map_err(|_| link_gone())?;
        rx.await.map_err(|_| link_gone())?
    }

    /// Current device snapshot.
    pub async fn snapshot(&self) -> DeviceSnapshot {
        let (resp, rx) = oneshot::channel();
        if self.tx.send(LinkRequest::Snapshot { resp }).await.is_err() {
            return DeviceSnapshot {
                state: McuState::Disconnected,
                power_level: 0,
                port_path: None,
            };
        }
        rx.await.unwrap_or(DeviceSnapshot {
            state: McuState::Disconnected,
            power_level: 0,
            port_path: None,
        })
    }

    /// Subscribe to device snapshots, one per state or power change.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceSnapshot> {
        self.events.subscribe()
    }
}

fn link_gone() -> HubError {
    HubError::Link("link actor terminated".to_string())
}

struct LinkActor {
    opener: Arc<dyn PortOpener>,
    settle: Duration,
    events: broadcast::Sender<DeviceSnapshot>,
    self_tx: mpsc::Sender<LinkRequest>,
    writer: Option<WriteHalf<DynSerial>>,
    reader: Option<JoinHandle<()>>,
    generation: u64,
    state: McuState,
    power_level: u8,
    port_path: Option<String>,
}

impl LinkActor {
    async fn run(mut self, mut rx: mpsc::Receiver<LinkRequest>) {
        while let Some(request) = rx.recv().await {
            match request {
                LinkRequest::Connect { resp } => {
                    let result = self.handle_connect().await;
                    let _ = resp.send(result);
                }
                LinkRequest::Send { command, resp } => {
                    let _ = resp.send(self.handle_send(command).await);
                }
                LinkRequest::Snapshot { resp } => {
                    let _ = resp.send(self.snapshot());
                }
                LinkRequest::Wire { generation, event } => {
                    if generation == self.generation {
                        self.apply_event(event);
                    }
                }
                LinkRequest::Closed { generation, reason } => {
                    if generation == self.generation {
                        warn!(reason = %reason, "controller link lost");
                        self.drop_link();
                    }
                }
            }
        }
    }

    fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            state: self.state,
            power_level: self.power_level,
            port_path: self.port_path.clone(),
        }
    }

    fn broadcast(&self) {
        // no receivers is fine
        let _ = self.events.send(self.snapshot());
    }

    fn set_state(&mut self, state: McuState) {
        if self.state != state {
            info!(from = self.state.as_str(), to = state.as_str(), "state change");
            self.state = state;
            self.broadcast();
        }
    }

    fn apply_event(&mut self, event: McuEvent) {
        match event {
            McuEvent::Running => self.set_state(McuState::Running),
            McuEvent::Idle => self.set_state(McuState::Idle),
            McuEvent::Busy => self.set_state(McuState::Busy),
            McuEvent::PowerLevel(level) => {
                if self.power_level != level {
                    self.power_level = level;
                    self.broadcast();
                }
            }
        }
    }

    /// Tear down the current connection and force `Disconnected`.
    fn drop_link(&mut self) {
        self.generation += 1;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.writer = None;
        if self.port_path.is_some() || self.state != McuState::Disconnected {
            self.port_path = None;
            self.power_level = 0;
            self.state = McuState::Disconnected;
            self.broadcast();
        }
    }

    async fn handle_connect(&mut self) -> HubResult<DeviceSnapshot> {
        // Re-attempting while connected drops the existing link first so at
        // most one handle exists.
        self.drop_link();
        self.set_state(McuState::Connecting);

        let order = self.opener.attempt_order();
        if order.is_empty() {
            info!("no serial candidates available");
            self.set_state(McuState::Disconnected);
            return Err(HubError::Link("no serial candidates available".to_string()));
        }

        for path in order {
            debug!(port = %path, "attempting connection");
            let port = match self.opener.open(&path).await {
                Ok(port) => port,
                Err(e) => {
                    warn!(port = %path, error = %e, "connect attempt failed");
                    continue;
                }
            };

            let (read_half, write_half) = tokio::io::split(port);
            self.generation += 1;
            let generation = self.generation;
            let tx = self.self_tx.clone();
            self.reader = Some(tokio::spawn(read_loop(read_half, generation, tx)));
            self.writer = Some(write_half);
            self.port_path = Some(path.clone());

            // settle interval before trusting the connection
            tokio::time::sleep(self.settle).await;

            info!(port = %path, "controller connected");
            self.set_state(McuState::Idle);
            return Ok(self.snapshot());
        }

        self.set_state(McuState::Disconnected);
        Err(HubError::Link(
            "no controller found on any candidate port".to_string(),
        ))
    }

    async fn handle_send(&mut self, command: McuCommand) -> HubResult<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(HubError::Link("controller not connected".to_string()));
        };
        let encoded = command.encode();
        match writer.write_all(encoded.as_bytes()).await {
            Ok(()) => {
                debug!(command = %command, bytes = %encoded, "command written");
                Ok(())
            }
            Err(e) => {
                warn!(command = %command, error = %e, "write failed, dropping link");
                self.drop_link();
                Err(HubError::Link(format!("write failed: {e}")))
            }
        }
    }
}

/// Reads newline-delimited status tokens, reassembling frames split across
/// reads, and feeds decoded events back to the actor.
async fn read_loop(
    read_half: ReadHalf<DynSerial>,
    generation: u64,
    tx: mpsc::Sender<LinkRequest>,
) {
    let mut reader = BufReader::new(read_half);
    let mut line: Vec<u8> = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => {
                let _ = tx
                    .send(LinkRequest::Closed {
                        generation,
                        reason: "endpoint closed".to_string(),
                    })
                    .await;
                return;
            }
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                if let Some(event) = decode_token(&text) {
                    if tx
                        .send(LinkRequest::Wire { generation, event })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = tx
                    .send(LinkRequest::Closed {
                        generation,
                        reason: e.to_string(),
                    })
                    .await;
                return;
            }
        }
    }
}
