#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    missing_docs
)]
//! Integration tests for the controller link state machine.
//!
//! A scripted opener and an in-memory serial pair stand in for real
//! hardware, so every test drives the full actor: connect iteration, wire
//! event decoding, broadcasts, and link-loss handling.

mod common;

use common::{connected_link, dead_link, ScriptedOpener};
use shock_hub::error::HubError;
use shock_hub::link::{DeviceSnapshot, DynSerial, LinkHandle, McuState, PortOpener};
use shock_hub::mock_serial;
use shock_hub::protocol::McuCommand;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::timeout;

/// Receive broadcast snapshots until `pred` matches, or panic after 2s.
async fn wait_for(
    events: &mut broadcast::Receiver<DeviceSnapshot>,
    pred: impl Fn(&DeviceSnapshot) -> bool,
) -> DeviceSnapshot {
    timeout(Duration::from_secs(2), async {
        loop {
            let snapshot = events.recv().await.expect("event stream closed");
            if pred(&snapshot) {
                return snapshot;
            }
        }
    })
    .await
    .expect("timed out waiting for device snapshot")
}

#[tokio::test]
async fn connect_reports_idle_and_port_path() {
    let (link, _harness) = connected_link().await;
    let snapshot = link.snapshot().await;
    assert_eq!(snapshot.state, McuState::Idle);
    assert_eq!(snapshot.port_path.as_deref(), Some("/dev/ttyACM0"));
    assert_eq!(snapshot.power_level, 0);
}

#[tokio::test]
async fn connect_failure_stays_disconnected() {
    let link = dead_link();
    assert!(link.connect().await.is_err());
    let snapshot = link.snapshot().await;
    assert_eq!(snapshot.state, McuState::Disconnected);
    assert!(snapshot.port_path.is_none());
}

#[tokio::test]
async fn connect_tries_candidates_in_order() {
    let (port, _harness) = mock_serial::pair();
    let opener = ScriptedOpener::new(
        &["/dev/ttyACM0", "/dev/ttyACM1"],
        vec![
            Err(HubError::Link("busy".to_string())),
            Ok(Box::new(port) as DynSerial),
        ],
    );
    let link = LinkHandle::spawn(opener.clone(), Duration::ZERO);

    let snapshot = link.connect().await.unwrap();
    assert_eq!(snapshot.port_path.as_deref(), Some("/dev/ttyACM1"));
    assert_eq!(opener.opens.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn wire_events_transition_state() {
    let (link, mut harness) = connected_link().await;
    let mut events = link.subscribe();

    harness.send_line("A").await;
    assert_eq!(
        wait_for(&mut events, |s| s.state == McuState::Running).await.state,
        McuState::Running
    );

    harness.send_line("C").await;
    wait_for(&mut events, |s| s.state == McuState::Busy).await;

    harness.send_line("B").await;
    wait_for(&mut events, |s| s.state == McuState::Idle).await;
}

#[tokio::test]
async fn set_power_round_trip() {
    let (link, mut harness) = connected_link().await;
    let mut events = link.subscribe();

    link.send(McuCommand::SetPower(42)).await.unwrap();
    harness.expect_write(b"P42!").await;

    harness.send_line("P42!").await;
    let snapshot = wait_for(&mut events, |s| s.power_level == 42).await;
    assert_eq!(snapshot.power_level, 42);
    assert_eq!(link.snapshot().await.power_level, 42);
}

#[tokio::test]
async fn malformed_tokens_change_nothing() {
    let (link, mut harness) = connected_link().await;
    let mut events = link.subscribe();

    for garbage in ["Z", "P100!", "P!", "AB", "Stop pressing random buttons"] {
        harness.send_line(garbage).await;
    }
    harness.send_line("A").await;

    // The first observable change after the garbage is the Running
    // transition; state and power were never touched in between.
    let snapshot = events.recv().await.unwrap();
    assert_eq!(snapshot.state, McuState::Running);
    assert_eq!(snapshot.power_level, 0);
}

#[tokio::test]
async fn tokens_split_across_reads_reassemble() {
    let (link, mut harness) = connected_link().await;
    let mut events = link.subscribe();

    harness.send_raw(b"P4").await;
    harness.send_raw(b"2!\n").await;

    let snapshot = wait_for(&mut events, |s| s.power_level == 42).await;
    assert_eq!(snapshot.power_level, 42);
}

#[tokio::test]
async fn write_while_disconnected_surfaces_error() {
    let link = dead_link();
    let err = link.send(McuCommand::Start).await.unwrap_err();
    assert!(matches!(err, HubError::Link(_)));
}

#[tokio::test]
async fn link_loss_forces_disconnected() {
    let (link, harness) = connected_link().await;
    let mut events = link.subscribe();

    drop(harness);

    let snapshot = wait_for(&mut events, |s| s.state == McuState::Disconnected).await;
    assert!(snapshot.port_path.is_none());
    assert_eq!(snapshot.power_level, 0);

    // Writes after the loss error out instead of panicking.
    assert!(link.send(McuCommand::Stop).await.is_err());
}

#[tokio::test]
async fn reconnect_replaces_the_previous_handle() {
    let (first_port, first_harness) = mock_serial::pair();
    let (second_port, mut second_harness) = mock_serial::pair();
    let opener = ScriptedOpener::new(
        &["/dev/ttyACM0"],
        vec![
            Ok(Box::new(first_port) as DynSerial),
            Ok(Box::new(second_port) as DynSerial),
        ],
    );
    let link = LinkHandle::spawn(opener.clone(), Duration::ZERO);

    link.connect().await.unwrap();
    link.connect().await.unwrap();
    assert_eq!(opener.opens.load(Ordering::SeqCst), 2);

    // Only the second port is live now.
    link.send(McuCommand::Start).await.unwrap();
    second_harness.expect_write(b"1").await;
    drop(first_harness);
    assert_eq!(link.snapshot().await.state, McuState::Idle);
}

/// Opener that blocks inside `open` until released, recording how many
/// opens ever run concurrently.
struct GatedOpener {
    release: Mutex<mpsc::Receiver<()>>,
    keep_alive: Mutex<Vec<DynSerial>>,
    opens: AtomicUsize,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
}

#[async_trait::async_trait]
impl PortOpener for GatedOpener {
    fn attempt_order(&self) -> Vec<String> {
        vec!["/dev/ttyACM0".to_string()]
    }

    async fn open(&self, _path: &str) -> shock_hub::error::HubResult<DynSerial> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);

        self.release.lock().await.recv().await;

        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        let (port, other_end) = tokio::io::duplex(64);
        self.keep_alive.lock().await.push(Box::new(other_end));
        Ok(Box::new(port))
    }
}

#[tokio::test]
async fn concurrent_connects_open_one_endpoint_at_a_time() {
    let (release_tx, release_rx) = mpsc::channel(4);
    let opener = Arc::new(GatedOpener {
        release: Mutex::new(release_rx),
        keep_alive: Mutex::new(Vec::new()),
        opens: AtomicUsize::new(0),
        concurrent: AtomicUsize::new(0),
        max_concurrent: AtomicUsize::new(0),
    });
    let link = LinkHandle::spawn(opener.clone(), Duration::ZERO);

    let first = tokio::spawn({
        let link = link.clone();
        async move { link.connect().await }
    });
    let second = tokio::spawn({
        let link = link.clone();
        async move { link.connect().await }
    });

    // Both requests are queued; only the first has reached the opener.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(opener.opens.load(Ordering::SeqCst), 1);

    release_tx.send(()).await.unwrap();
    release_tx.send(()).await.unwrap();

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    assert_eq!(opener.opens.load(Ordering::SeqCst), 2);
    assert_eq!(opener.max_concurrent.load(Ordering::SeqCst), 1);
}
