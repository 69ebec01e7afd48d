//! Autonomous command scheduler.
//!
//! When enabled, the scheduler drives the controller through randomized
//! cycles: draw a power level and a duration, set the power, wait a short
//! settle delay, start, wait the duration, stop, then sleep a drawn gap
//! before the next cycle.
//!
//! One invariant rules everything here: there is never more than one pending
//! cycle task, and disabling (whether by request or by link loss) cancels
//! it and forces a `Stop` write, even if the link is already down.
//! Reconfiguring ranges mid-run never interrupts the in-flight cycle; only
//! future draws see the new values.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{HubError, HubResult};
use crate::link::LinkHandle;
use crate::protocol::{McuCommand, MAX_POWER_LEVEL};

/// Bounds for the inter-cycle gap (ms).
pub const GAP_MIN_MS: u64 = 1000;
pub const GAP_MAX_MS: u64 = 300_000;
/// Bounds for the cycle duration (ms).
pub const DURATION_MIN_MS: u64 = 100;
pub const DURATION_MAX_MS: u64 = 30_000;

/// Inclusive millisecond range; degenerate ranges (`min == max`) draw the
/// constant value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MillisRange {
    pub min: u64,
    pub max: u64,
}

impl MillisRange {
    fn draw<R: Rng>(&self, rng: &mut R) -> u64 {
        rng.gen_range(self.min..=self.max)
    }
}

/// Inclusive power-level range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerRange {
    pub min: u8,
    pub max: u8,
}

impl PowerRange {
    fn draw<R: Rng>(&self, rng: &mut R) -> u8 {
        rng.gen_range(self.min..=self.max)
    }
}

/// Scheduler settings. Mutated only through Master-role requests; every
/// range is validated before acceptance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerSettings {
    pub enabled: bool,
    #[serde(rename = "gapRange")]
    pub gap_range: MillisRange,
    #[serde(rename = "durationRange")]
    pub duration_range: MillisRange,
    #[serde(rename = "powerRange")]
    pub power_range: PowerRange,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            gap_range: MillisRange {
                min: 5000,
                max: 120_000,
            },
            duration_range: MillisRange {
                min: 1000,
                max: 5000,
            },
            power_range: PowerRange { min: 1, max: 10 },
        }
    }
}

impl SchedulerSettings {
    /// Validate every range against its bounds.
    pub fn validate(&self) -> Result<(), String> {
        validate_gap_range(&self.gap_range)?;
        validate_duration_range(&self.duration_range)?;
        validate_power_range(&self.power_range)?;
        Ok(())
    }
}

pub fn validate_gap_range(range: &MillisRange) -> Result<(), String> {
    if range.min < GAP_MIN_MS || range.max > GAP_MAX_MS || range.max < range.min {
        return Err(format!(
            "gapRange must satisfy {GAP_MIN_MS} <= min <= max <= {GAP_MAX_MS}"
        ));
    }
    Ok(())
}

pub fn validate_duration_range(range: &MillisRange) -> Result<(), String> {
    if range.min < DURATION_MIN_MS || range.max > DURATION_MAX_MS || range.max < range.min {
        return Err(format!(
            "durationRange must satisfy {DURATION_MIN_MS} <= min <= max <= {DURATION_MAX_MS}"
        ));
    }
    Ok(())
}

pub fn validate_power_range(range: &PowerRange) -> Result<(), String> {
    if range.max < range.min || range.max > MAX_POWER_LEVEL {
        return Err(format!(
            "powerRange must satisfy 0 <= min <= max <= {MAX_POWER_LEVEL}"
        ));
    }
    Ok(())
}

/// Partial settings update; absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsUpdate {
    pub enabled: Option<bool>,
    #[serde(rename = "gapRange")]
    pub gap_range: Option<MillisRange>,
    #[serde(rename = "durationRange")]
    pub duration_range: Option<MillisRange>,
    #[serde(rename = "powerRange")]
    pub power_range: Option<PowerRange>,
}

/// Point-in-time scheduler status for the administrative surface.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub active: bool,
    pub settings: SchedulerSettings,
    pub mcu_connected: bool,
    /// Epoch milliseconds of the next scheduled cycle, if one is pending
    pub next_shock_scheduled: Option<u64>,
}

struct SchedulerInner {
    settings: SchedulerSettings,
    cycle_task: Option<JoinHandle<()>>,
    next_cycle_at_ms: Option<u64>,
}

/// Owns the autonomous cycle task and its settings.
#[derive(Clone)]
pub struct Scheduler {
    link: LinkHandle,
    inner: Arc<Mutex<SchedulerInner>>,
    cycle_settle: Duration,
}

impl Scheduler {
    /// Build a scheduler. `initial` supplies the draw ranges; scheduling
    /// always starts disabled regardless of `initial.enabled`.
    pub fn new(link: LinkHandle, initial: SchedulerSettings, cycle_settle: Duration) -> Self {
        let settings = SchedulerSettings {
            enabled: false,
            ..initial
        };
        Self {
            link,
            inner: Arc::new(Mutex::new(SchedulerInner {
                settings,
                cycle_task: None,
                next_cycle_at_ms: None,
            })),
            cycle_settle,
        }
    }

    pub async fn settings(&self) -> SchedulerSettings {
        self.inner.lock().await.settings.clone()
    }

    pub async fn status(&self) -> SchedulerStatus {
        let snapshot = self.link.snapshot().await;
        let inner = self.inner.lock().await;
        SchedulerStatus {
            active: inner.settings.enabled,
            settings: inner.settings.clone(),
            mcu_connected: snapshot.connected(),
            next_shock_scheduled: inner.next_cycle_at_ms,
        }
    }

    /// Enable autonomous cycling. Requires a connected link; idempotent when
    /// already enabled.
    pub async fn start(&self) -> HubResult<()> {
        if !self.link.snapshot().await.connected() {
            return Err(HubError::Link("controller not connected".to_string()));
        }
        let mut inner = self.inner.lock().await;
        if inner.settings.enabled {
            return Ok(());
        }
        inner.settings.enabled = true;
        inner.next_cycle_at_ms = None;
        info!("autonomous scheduling enabled");
        inner.cycle_task = Some(tokio::spawn(run_cycles(
            self.link.clone(),
            Arc::clone(&self.inner),
            self.cycle_settle,
        )));
        Ok(())
    }

    /// Disable autonomous cycling: cancel any pending cycle and force a
    /// `Stop` write regardless of run state. Idempotent: a second call when
    /// already stopped issues no further writes.
    pub async fn stop(&self) -> HubResult<()> {
        {
            let mut inner = self.inner.lock().await;
            if !inner.settings.enabled && inner.cycle_task.is_none() {
                return Ok(());
            }
            inner.settings.enabled = false;
            inner.next_cycle_at_ms = None;
            if let Some(task) = inner.cycle_task.take() {
                task.abort();
            }
        }
        info!("autonomous scheduling disabled");
        // Fail-safe: the controller may be mid-cycle. A dead link must not
        // turn this into an error.
        if let Err(e) = self.link.send(McuCommand::Stop).await {
            warn!(error = %e, "fail-safe stop write failed");
        }
        Ok(())
    }

    /// Apply a partial settings update. Each present range is validated
    /// independently; valid fields are applied even when another field
    /// fails, and the returned error names every rejected field. An
    /// `enabled` change is applied last and may itself fail (enabling with
    /// the link down).
    pub async fn apply_update(&self, update: SettingsUpdate) -> HubResult<SchedulerSettings> {
        let mut rejected: Vec<String> = Vec::new();

        {
            let mut inner = self.inner.lock().await;
            if let Some(range) = update.gap_range {
                match validate_gap_range(&range) {
                    Ok(()) => inner.settings.gap_range = range,
                    Err(e) => rejected.push(e),
                }
            }
            if let Some(range) = update.duration_range {
                match validate_duration_range(&range) {
                    Ok(()) => inner.settings.duration_range = range,
                    Err(e) => rejected.push(e),
                }
            }
            if let Some(range) = update.power_range {
                match validate_power_range(&range) {
                    Ok(()) => inner.settings.power_range = range,
                    Err(e) => rejected.push(e),
                }
            }
        }

        if let Some(enabled) = update.enabled {
            let result = if enabled { self.start().await } else { self.stop().await };
            if let Err(e) = result {
                rejected.push(e.to_string());
            }
        }

        if rejected.is_empty() {
            Ok(self.settings().await)
        } else {
            Err(HubError::Validation(rejected.join("; ")))
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// The cycle loop. Runs until disabled (abort), a draw finds the scheduler
/// disabled, or a link write fails.
async fn run_cycles(link: LinkHandle, inner: Arc<Mutex<SchedulerInner>>, settle: Duration) {
    loop {
        let (power, duration_ms) = {
            let guard = inner.lock().await;
            if !guard.settings.enabled {
                break;
            }
            let mut rng = rand::thread_rng();
            (
                guard.settings.power_range.draw(&mut rng),
                guard.settings.duration_range.draw(&mut rng),
            )
        };

        info!(power, duration_ms, "cycle firing");
        if link.send(McuCommand::SetPower(power)).await.is_err() {
            break;
        }
        tokio::time::sleep(settle).await;
        if link.send(McuCommand::Start).await.is_err() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(duration_ms)).await;
        if link.send(McuCommand::Stop).await.is_err() {
            break;
        }

        let gap_ms = {
            let mut guard = inner.lock().await;
            if !guard.settings.enabled {
                break;
            }
            let gap = guard.settings.gap_range.draw(&mut rand::thread_rng());
            guard.next_cycle_at_ms = Some(now_ms() + gap);
            gap
        };
        tokio::time::sleep(Duration::from_millis(gap_ms)).await;
        inner.lock().await.next_cycle_at_ms = None;
    }

    // Reached only on a failed write or a disabled flag observed mid-loop;
    // reflect the halt so status reads true.
    let mut guard = inner.lock().await;
    guard.settings.enabled = false;
    guard.next_cycle_at_ms = None;
}
