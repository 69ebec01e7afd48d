#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    missing_docs
)]
//! Integration tests for the autonomous command scheduler.
//!
//! These run with a paused clock: the runtime auto-advances through settle,
//! duration, and gap timers, so multi-second schedules execute instantly and
//! deterministically.

mod common;

use common::{connected_link, dead_link};
use shock_hub::error::HubError;
use shock_hub::scheduler::{
    MillisRange, PowerRange, Scheduler, SchedulerSettings, SettingsUpdate,
};
use std::time::Duration;

fn fixed_settings(gap_ms: u64, duration_ms: u64, power: u8) -> SchedulerSettings {
    SchedulerSettings {
        enabled: false,
        gap_range: MillisRange {
            min: gap_ms,
            max: gap_ms,
        },
        duration_range: MillisRange {
            min: duration_ms,
            max: duration_ms,
        },
        power_range: PowerRange {
            min: power,
            max: power,
        },
    }
}

const SETTLE: Duration = Duration::from_millis(100);

#[tokio::test(start_paused = true)]
async fn degenerate_ranges_collapse_to_constant_cycles() {
    let (link, mut harness) = connected_link().await;
    let scheduler = Scheduler::new(link, fixed_settings(5000, 1000, 50), SETTLE);

    scheduler.start().await.unwrap();
    // Starting again while enabled is a no-op; a second cycle chain would
    // corrupt the exact write order asserted below.
    scheduler.start().await.unwrap();

    // First cycle fires immediately: power, settle, start, duration, stop.
    harness.expect_write(b"P50!").await;
    harness.expect_write(b"1").await;
    harness.expect_write(b"0").await;

    let status = scheduler.status().await;
    assert!(status.active);
    assert!(status.mcu_connected);

    // Second cycle after the 5s gap, identical draws.
    harness.expect_write(b"P50!").await;
    harness.expect_write(b"1").await;
    harness.expect_write(b"0").await;

    scheduler.stop().await.unwrap();
    harness.expect_write(b"0").await;
}

#[tokio::test(start_paused = true)]
async fn stop_is_idempotent() {
    let (link, mut harness) = connected_link().await;
    let scheduler = Scheduler::new(link, fixed_settings(5000, 1000, 50), SETTLE);

    scheduler.start().await.unwrap();
    harness.expect_write(b"P50!").await;

    // First stop cancels the pending cycle mid-settle and forces one Stop.
    scheduler.stop().await.unwrap();
    harness.expect_write(b"0").await;

    // Second stop: same end state, no further writes.
    scheduler.stop().await.unwrap();
    harness.expect_silence(Duration::from_millis(200)).await;

    let status = scheduler.status().await;
    assert!(!status.active);
    assert!(status.next_shock_scheduled.is_none());
}

#[tokio::test(start_paused = true)]
async fn start_requires_a_connected_link() {
    let link = dead_link();
    let scheduler = Scheduler::new(link, fixed_settings(5000, 1000, 50), SETTLE);

    let err = scheduler.start().await.unwrap_err();
    assert!(matches!(err, HubError::Link(_)));
    assert!(!scheduler.status().await.active);
}

#[tokio::test(start_paused = true)]
async fn reconfigure_applies_to_future_draws_only() {
    let (link, mut harness) = connected_link().await;
    let scheduler = Scheduler::new(link, fixed_settings(1000, 1000, 10), SETTLE);

    scheduler.start().await.unwrap();
    harness.expect_write(b"P10!").await;
    harness.expect_write(b"1").await;

    // Mid-cycle update: the in-flight cycle still stops on its old schedule,
    // but the next cycle draws from the new power range.
    let updated = scheduler
        .apply_update(SettingsUpdate {
            power_range: Some(PowerRange { min: 20, max: 20 }),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(updated.power_range, PowerRange { min: 20, max: 20 });

    harness.expect_write(b"0").await;
    harness.expect_write(b"P20!").await;

    scheduler.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn invalid_fields_are_rejected_without_touching_valid_ones() {
    let (link, _harness) = connected_link().await;
    let scheduler = Scheduler::new(link, fixed_settings(5000, 1000, 50), SETTLE);

    let before = scheduler.settings().await;
    let err = scheduler
        .apply_update(SettingsUpdate {
            gap_range: Some(MillisRange {
                min: 2000,
                max: 3000,
            }),
            duration_range: Some(MillisRange { min: 5, max: 50 }),
            ..Default::default()
        })
        .await
        .unwrap_err();

    // The rejection names the failing field.
    assert!(err.to_string().contains("durationRange"));

    let after = scheduler.settings().await;
    // Valid field applied independently, invalid and absent fields untouched.
    assert_eq!(
        after.gap_range,
        MillisRange {
            min: 2000,
            max: 3000
        }
    );
    assert_eq!(after.duration_range, before.duration_range);
    assert_eq!(after.power_range, before.power_range);
    assert_eq!(after.enabled, before.enabled);
}

#[tokio::test(start_paused = true)]
async fn gap_sets_next_cycle_timestamp() {
    let (link, mut harness) = connected_link().await;
    let scheduler = Scheduler::new(link, fixed_settings(5000, 1000, 50), SETTLE);

    scheduler.start().await.unwrap();
    harness.expect_write(b"P50!").await;
    harness.expect_write(b"1").await;
    harness.expect_write(b"0").await;

    // Between cycles, the status advertises the scheduled next shock.
    let status = scheduler.status().await;
    assert!(status.active);
    assert!(status.next_shock_scheduled.is_some());

    scheduler.stop().await.unwrap();
    assert!(scheduler.status().await.next_shock_scheduled.is_none());
}
