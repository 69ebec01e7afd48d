//! Shared test support: scripted port openers for driving the link without
//! hardware.
#![allow(dead_code)]

use async_trait::async_trait;
use shock_hub::error::{HubError, HubResult};
use shock_hub::link::{DynSerial, LinkHandle, McuState, PortOpener};
use shock_hub::mock_serial::{self, McuHarness};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Opener that hands out pre-scripted ports in order, regardless of path.
pub struct ScriptedOpener {
    paths: Vec<String>,
    queue: Mutex<VecDeque<HubResult<DynSerial>>>,
    pub opens: AtomicUsize,
}

impl ScriptedOpener {
    pub fn new(paths: &[&str], ports: Vec<HubResult<DynSerial>>) -> Arc<Self> {
        Arc::new(Self {
            paths: paths.iter().map(|s| s.to_string()).collect(),
            queue: Mutex::new(ports.into()),
            opens: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl PortOpener for ScriptedOpener {
    fn attempt_order(&self) -> Vec<String> {
        self.paths.clone()
    }

    async fn open(&self, _path: &str) -> HubResult<DynSerial> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.queue
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(HubError::Link("no port scripted".to_string())))
    }
}

/// Spawn a link with a zero settle interval, already connected to a mock
/// controller.
pub async fn connected_link() -> (LinkHandle, McuHarness) {
    let (port, harness) = mock_serial::pair();
    let opener = ScriptedOpener::new(&["/dev/ttyACM0"], vec![Ok(Box::new(port))]);
    let link = LinkHandle::spawn(opener, Duration::ZERO);
    let snapshot = link.connect().await.expect("scripted connect failed");
    assert_eq!(snapshot.state, McuState::Idle);
    (link, harness)
}

/// Spawn a link whose opener never produces a port.
pub fn dead_link() -> LinkHandle {
    let opener = ScriptedOpener::new(&[], Vec::new());
    LinkHandle::spawn(opener, Duration::ZERO)
}
