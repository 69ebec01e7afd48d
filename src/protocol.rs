//! Wire protocol codec for the shock controller.
//!
//! Protocol: ASCII over serial, 115200 baud by default.
//!
//! Outgoing commands:
//!
//! | Command       | Bytes    |
//! |---------------|----------|
//! | Start         | `1`      |
//! | Stop          | `0`      |
//! | Calibrate     | `C`      |
//! | SetPower(n)   | `P{n}!`  |
//!
//! Incoming status tokens, one per newline-terminated line:
//!
//! | Token   | Meaning            |
//! |---------|--------------------|
//! | `A`     | now running        |
//! | `B`     | now idle           |
//! | `C`     | now busy           |
//! | `P{n}!` | power level report |
//!
//! Decoding never fails: anything that is not a recognized token is logged
//! and discarded with no state change. `n` is a decimal integer in `[0, 99]`.

use tracing::debug;

/// Highest power level the controller accepts.
pub const MAX_POWER_LEVEL: u8 = 99;

/// A command sent to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McuCommand {
    /// Begin shocking
    Start,
    /// Stop shocking
    Stop,
    /// Run the controller's self-calibration sequence
    Calibrate,
    /// Set the output power level (0-99)
    SetPower(u8),
}

impl McuCommand {
    /// Encode the command as wire bytes. No terminator is required on send.
    pub fn encode(&self) -> String {
        match self {
            McuCommand::Start => "1".to_string(),
            McuCommand::Stop => "0".to_string(),
            McuCommand::Calibrate => "C".to_string(),
            McuCommand::SetPower(level) => format!("P{level}!"),
        }
    }
}

impl std::fmt::Display for McuCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            McuCommand::Start => write!(f, "start"),
            McuCommand::Stop => write!(f, "stop"),
            McuCommand::Calibrate => write!(f, "calibrate"),
            McuCommand::SetPower(level) => write!(f, "set_power({level})"),
        }
    }
}

/// A status event decoded from the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McuEvent {
    /// Controller reports it is shocking
    Running,
    /// Controller reports it is idle
    Idle,
    /// Controller reports it is busy (e.g. mid-calibration)
    Busy,
    /// Controller reports its current power level
    PowerLevel(u8),
}

/// Decode a single newline-stripped token.
///
/// Returns `None` for anything unrecognized; the caller treats that as a
/// no-op. Whitespace around the token is ignored.
pub fn decode_token(token: &str) -> Option<McuEvent> {
    match token.trim() {
        "" => None,
        "A" => Some(McuEvent::Running),
        "B" => Some(McuEvent::Idle),
        "C" => Some(McuEvent::Busy),
        other => {
            if let Some(event) = decode_power_report(other) {
                return Some(event);
            }
            debug!(token = other, "discarding unrecognized controller token");
            None
        }
    }
}

/// Decode a `P{n}!` power report. `n` must parse as an integer in `[0, 99]`.
fn decode_power_report(token: &str) -> Option<McuEvent> {
    let digits = token.strip_prefix('P')?.strip_suffix('!')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let level: u8 = digits.parse().ok()?;
    if level > MAX_POWER_LEVEL {
        return None;
    }
    Some(McuEvent::PowerLevel(level))
}
