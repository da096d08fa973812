//! Drain barrier
//!
//! Installed on a data link of a branch that is about to be removed. It lets
//! items through until a predicate says enough has passed, then drops
//! everything and schedules exactly one callback onto the control thread.
//!
//! `observe` runs on the data thread and touches nothing but the barrier's own
//! atomics. The scheduled callback must only hand work off (post to the control
//! queue); the graph mutation itself happens over there.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

type Predicate = Box<dyn Fn(u64) -> bool + Send + Sync>;
type OnArmed = Box<dyn FnOnce() + Send>;

/// Forwarding decision for one item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Drop,
}

/// Externally visible barrier flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainBarrierState {
    pub armed: bool,
    pub resolved: bool,
}

pub struct DrainBarrier {
    /// Evaluated with the number of items passed so far
    predicate: Predicate,
    on_armed: Mutex<Option<OnArmed>>,
    passed: AtomicU64,
    dropped: AtomicU64,
    armed: AtomicBool,
    scheduled: AtomicBool,
    resolved: AtomicBool,
}

impl DrainBarrier {
    pub fn new<P, F>(predicate: P, on_armed: F) -> Self
    where
        P: Fn(u64) -> bool + Send + Sync + 'static,
        F: FnOnce() + Send + 'static,
    {
        Self {
            predicate: Box::new(predicate),
            on_armed: Mutex::new(Some(Box::new(on_armed))),
            passed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            armed: AtomicBool::new(false),
            scheduled: AtomicBool::new(false),
            resolved: AtomicBool::new(false),
        }
    }

    /// Barrier that arms once `count` items have passed
    pub fn after_items<F>(count: u64, on_armed: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::new(move |passed| passed >= count, on_armed)
    }

    /// Decide the fate of one item crossing the link.
    pub fn observe(&self) -> Verdict {
        if !self.armed.load(Ordering::Acquire) {
            if !(self.predicate)(self.passed.load(Ordering::Relaxed)) {
                self.passed.fetch_add(1, Ordering::Relaxed);
                return Verdict::Pass;
            }
            self.armed.store(true, Ordering::Release);
        }

        self.dropped.fetch_add(1, Ordering::Relaxed);
        if self
            .scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let callback = self.on_armed.lock().ok().and_then(|mut slot| slot.take());
            if let Some(callback) = callback {
                callback();
            }
        }
        Verdict::Drop
    }

    /// Mark the barrier as done: its branch has been removed.
    pub fn resolve(&self) {
        self.resolved.store(true, Ordering::Release);
    }

    pub fn state(&self) -> DrainBarrierState {
        DrainBarrierState {
            armed: self.armed.load(Ordering::Acquire),
            resolved: self.resolved.load(Ordering::Acquire),
        }
    }

    pub fn passed(&self) -> u64 {
        self.passed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for DrainBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrainBarrier")
            .field("state", &self.state())
            .field("passed", &self.passed())
            .field("dropped", &self.dropped())
            .finish()
    }
}
