//! Cooperative cancellation and pause requests.
//!
//! Both are plain shared flags: the controller polls them at its suspension
//! points and adapters poll the cancel token while they wait.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const SLEEP_SLICE: Duration = Duration::from_millis(25);

/// Shared cancellation flag handed to planner and executor calls.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless cancelled first. Returns `false` when the
    /// sleep was cut short.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

/// Operator request to pause at the top of the next step.
#[derive(Debug, Clone, Default)]
pub struct PauseRequest(Arc<AtomicBool>);

impl PauseRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// External controls consulted between steps.
#[derive(Debug, Clone, Default)]
pub struct RunControls {
    pub cancel: CancelToken,
    pub pause: PauseRequest,
    /// Pause once this many steps have committed.
    pub stop_after_step: Option<u32>,
}
