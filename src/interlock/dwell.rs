//! Quiescence wait between the two interlock snapshots.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Dwell interrupted by cancellation or deadline")]
pub struct Interrupted;

/// Shared cancellation flag with an optional deadline.
///
/// Clones observe the same flag, so a token handed to a worker running a
/// setpoint proposal can be cancelled from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(deadline),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

pub trait Dwell: Send + Sync {
    /// Block for `period`, or return `Interrupted` once `cancel` fires.
    fn dwell(&self, period: Duration, cancel: &CancelToken) -> Result<(), Interrupted>;
}

/// Sleeps on the calling thread in short slices so cancellation is noticed
/// promptly.
#[derive(Debug, Clone)]
pub struct WallClockDwell {
    slice: Duration,
}

impl WallClockDwell {
    pub fn new(slice: Duration) -> Self {
        Self { slice }
    }
}

impl Default for WallClockDwell {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl Dwell for WallClockDwell {
    fn dwell(&self, period: Duration, cancel: &CancelToken) -> Result<(), Interrupted> {
        let end = Instant::now() + period;
        // A deadline inside the window can never be met; don't bother waiting.
        if cancel.deadline().is_some_and(|d| d < end) {
            debug!("Deadline falls inside the {:?} dwell", period);
            return Err(Interrupted);
        }
        loop {
            if cancel.is_cancelled() {
                return Err(Interrupted);
            }
            let now = Instant::now();
            if now >= end {
                return Ok(());
            }
            std::thread::sleep((end - now).min(self.slice));
        }
    }
}
