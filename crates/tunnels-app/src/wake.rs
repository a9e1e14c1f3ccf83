//! Wake Detection
//!
//! The monotonic clock stops while the machine is suspended; the wall
//! clock does not. A poll that sees the wall clock run ahead of the
//! monotonic clock by more than a threshold means the device slept.

use std::time::{Duration, Instant, SystemTime};
use tokio::task::JoinHandle;
use tracing::info;

/// Poll interval
pub const WAKE_POLL: Duration = Duration::from_secs(5);

/// Minimum wall/monotonic gap treated as a sleep
pub const WAKE_THRESHOLD: Duration = Duration::from_secs(10);

/// Clock pair sampled on each poll
#[derive(Debug, Clone, Copy)]
pub struct ClockSample {
    pub wall: SystemTime,
    pub mono: Instant,
}

impl ClockSample {
    pub fn now() -> Self {
        Self {
            wall: SystemTime::now(),
            mono: Instant::now(),
        }
    }
}

/// Did the device sleep between `before` and `after`?
pub fn slept_between(before: ClockSample, after: ClockSample, threshold: Duration) -> Option<Duration> {
    let wall = after.wall.duration_since(before.wall).ok()?;
    let mono = after.mono.saturating_duration_since(before.mono);
    let gap = wall.checked_sub(mono)?;
    (gap >= threshold).then_some(gap)
}

/// Spawn the detector; `on_wake` runs after every detected sleep
pub fn spawn_wake_detector<F>(on_wake: F) -> JoinHandle<()>
where
    F: Fn() + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(WAKE_POLL);
        let mut last = ClockSample::now();
        loop {
            ticker.tick().await;
            let now = ClockSample::now();
            if let Some(slept) = slept_between(last, now, WAKE_THRESHOLD) {
                info!("Device woke after ~{}s asleep", slept.as_secs());
                on_wake();
            }
            last = now;
        }
    })
}
