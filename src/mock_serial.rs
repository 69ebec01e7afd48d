//! In-memory serial port for testing the controller link.
//!
//! [`pair`] returns a port half (handed to the link as a drop-in for a real
//! `SerialStream`) and a [`McuHarness`] that scripts the controller side of
//! the conversation: assert on bytes the link wrote, push status lines back,
//! or drop the harness to simulate the cable being pulled.
//!
//! ```rust,ignore
//! let (port, mut harness) = mock_serial::pair();
//! // hand `port` to the link, then:
//! harness.expect_write(b"P42!").await;
//! harness.send_line("P42!");
//! ```

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::{timeout, Duration};

/// Buffer size for the in-memory duplex pipe.
const PIPE_CAPACITY: usize = 4096;

/// Scripts the controller end of a mock serial connection.
#[derive(Debug)]
pub struct McuHarness {
    io: DuplexStream,
    received: Vec<u8>,
}

/// Create a connected (port, harness) pair.
pub fn pair() -> (DuplexStream, McuHarness) {
    let (port, controller) = tokio::io::duplex(PIPE_CAPACITY);
    (
        port,
        McuHarness {
            io: controller,
            received: Vec::new(),
        },
    )
}

impl McuHarness {
    /// Wait until the link has written exactly `expected`, panicking on
    /// timeout or mismatch. Excess bytes stay buffered for the next call.
    /// The deadline is generous so paused-clock tests can auto-advance
    /// through multi-second schedules without tripping it.
    ///
    /// # Panics
    /// Panics if `expected` is not received within 10 seconds.
    pub async fn expect_write(&mut self, expected: &[u8]) {
        let deadline = Duration::from_secs(10);
        let mut chunk = [0u8; 256];

        while self.received.len() < expected.len() {
            match timeout(deadline, self.io.read(&mut chunk)).await {
                Ok(Ok(0)) => panic!("port closed while expecting {:?}", as_text(expected)),
                Ok(Ok(n)) => self.received.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => panic!("harness read failed: {e}"),
                Err(_) => panic!(
                    "timeout waiting for {:?}; got {:?} so far",
                    as_text(expected),
                    as_text(&self.received)
                ),
            }
        }

        let actual: Vec<u8> = self.received.drain(..expected.len()).collect();
        assert_eq!(
            actual,
            expected,
            "expected write {:?}, got {:?}",
            as_text(expected),
            as_text(&actual)
        );
    }

    /// Assert that nothing (more) has been written within the grace window.
    pub async fn expect_silence(&mut self, window: Duration) {
        let mut chunk = [0u8; 256];
        if let Ok(Ok(n)) = timeout(window, self.io.read(&mut chunk)).await {
            if n > 0 {
                self.received.extend_from_slice(&chunk[..n]);
            }
        }
        assert!(
            self.received.is_empty(),
            "expected no writes, got {:?}",
            as_text(&self.received)
        );
    }

    /// Send one newline-terminated status line to the link.
    pub async fn send_line(&mut self, line: &str) {
        self.io
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("harness write failed");
    }

    /// Send raw bytes without a terminator (for split-frame tests).
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.io
            .write_all(bytes)
            .await
            .expect("harness write failed");
    }
}

fn as_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
