//! Count-based rolling window of call outcomes.

use std::sync::atomic::{AtomicI64, AtomicU8, AtomicUsize, Ordering};

const EMPTY: u8 = 0;
const SUCCESS: u8 = 1;
const SLOW_SUCCESS: u8 = 2;
const FAILURE: u8 = 3;

/// Outcome of one attempt against a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Succeeded, but slower than the configured slow-call duration.
    SlowSuccess,
    Failure,
}

impl Outcome {
    fn code(self) -> u8 {
        match self {
            Outcome::Success => SUCCESS,
            Outcome::SlowSuccess => SLOW_SUCCESS,
            Outcome::Failure => FAILURE,
        }
    }
}

/// Point-in-time counts over the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowSnapshot {
    pub total: u32,
    pub failures: u32,
    pub slow: u32,
}

impl WindowSnapshot {
    pub fn failure_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            f64::from(self.failures) / f64::from(self.total)
        }
    }

    pub fn slow_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            f64::from(self.slow) / f64::from(self.total)
        }
    }
}

/// Ring buffer of the last `size` outcomes backed by atomics.
///
/// Recording never blocks. Counters are adjusted after the slot swap, so a
/// concurrent reader may briefly observe counts that lag the slots by one
/// sample; [`snapshot`](Self::snapshot) clamps such transients at zero.
pub struct RollingWindow {
    slots: Box<[AtomicU8]>,
    cursor: AtomicUsize,
    total: AtomicI64,
    failures: AtomicI64,
    slow: AtomicI64,
}

impl RollingWindow {
    /// Creates an empty window holding at most `size` outcomes.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            slots: (0..size).map(|_| AtomicU8::new(EMPTY)).collect(),
            cursor: AtomicUsize::new(0),
            total: AtomicI64::new(0),
            failures: AtomicI64::new(0),
            slow: AtomicI64::new(0),
        }
    }

    /// Records one outcome, evicting the oldest when the window is full.
    pub fn record(&self, outcome: Outcome) {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let code = outcome.code();
        let previous = self.slots[idx].swap(code, Ordering::AcqRel);

        match previous {
            EMPTY => {
                self.total.fetch_add(1, Ordering::AcqRel);
            }
            FAILURE => {
                self.failures.fetch_sub(1, Ordering::AcqRel);
            }
            SLOW_SUCCESS => {
                self.slow.fetch_sub(1, Ordering::AcqRel);
            }
            _ => {}
        }
        match code {
            FAILURE => {
                self.failures.fetch_add(1, Ordering::AcqRel);
            }
            SLOW_SUCCESS => {
                self.slow.fetch_add(1, Ordering::AcqRel);
            }
            _ => {}
        }
    }

    /// Returns the current counts.
    pub fn snapshot(&self) -> WindowSnapshot {
        let read = |c: &AtomicI64| c.load(Ordering::Acquire).clamp(0, i64::from(u32::MAX)) as u32;
        WindowSnapshot {
            total: read(&self.total),
            failures: read(&self.failures),
            slow: read(&self.slow),
        }
    }

    /// Empties the window.
    pub fn reset(&self) {
        for slot in self.slots.iter() {
            slot.store(EMPTY, Ordering::Release);
        }
        self.cursor.store(0, Ordering::Release);
        self.total.store(0, Ordering::Release);
        self.failures.store(0, Ordering::Release);
        self.slow.store(0, Ordering::Release);
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
