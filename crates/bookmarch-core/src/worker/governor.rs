//! Per-stage admission control: concurrency ceiling plus rolling rate
//! window.
//!
//! The ceiling is a tokio semaphore sized when the runtime starts; the rate
//! window is a timestamp deque pruned on each check. Both are shared across
//! all tasks of a stage type -- they protect downstream collaborators (e.g.
//! an external AI service), not individual tasks. Consumers park on a
//! computed wait instead of busy-spinning, and windows are time-bounded, so
//! no task is starved permanently.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bookmarch_types::stage::RateWindow;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Admission governor for one stage type.
pub struct StageGovernor {
    semaphore: Arc<Semaphore>,
    capacity: u32,
    admissions: Mutex<VecDeque<Instant>>,
}

impl StageGovernor {
    /// A governor with the given concurrency ceiling.
    pub fn new(concurrency: u32) -> Self {
        let capacity = concurrency.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
            admissions: Mutex::new(VecDeque::new()),
        }
    }

    /// Wait for a concurrency slot. Returns `None` only if the semaphore
    /// has been closed (never done by the runtime; guards worker exit).
    pub async fn acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore).acquire_owned().await.ok()
    }

    /// Check the rate window without consuming capacity.
    ///
    /// `Ok(())` means an admission would be accepted right now; `Err(wait)`
    /// is how long until the oldest admission falls out of the window.
    pub fn rate_check(&self, window: &RateWindow, now: Instant) -> Result<(), Duration> {
        let span = Duration::from_secs(window.window_secs.max(1));
        let mut admissions = self.admissions.lock().expect("governor lock poisoned");

        while let Some(front) = admissions.front() {
            if now.duration_since(*front) >= span {
                admissions.pop_front();
            } else {
                break;
            }
        }

        if (admissions.len() as u32) < window.max_admissions {
            Ok(())
        } else {
            // Oldest admission limits us; wait until it ages out.
            let oldest = *admissions.front().expect("window full but empty");
            Err(span.saturating_sub(now.duration_since(oldest)))
        }
    }

    /// Record one admission at `now`.
    pub fn record_admission(&self, now: Instant) {
        self.admissions
            .lock()
            .expect("governor lock poisoned")
            .push_back(now);
    }

    /// Number of executions currently holding a concurrency slot.
    pub fn in_flight(&self) -> u32 {
        self.capacity - self.semaphore.available_permits() as u32
    }

    /// The configured concurrency ceiling.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}
