//! Timers as plain values owned by the channel they guard.
//!
//! Nothing runs in the background: the owner polls a [`Timer`] against the
//! current time of a [`Clock`] from its dispatch loop.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

/// Source of monotonic time in microseconds.
pub trait Clock {
    fn now_us(&self) -> u64;
}

/// Wall clock based on [`Instant`], zero at construction.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// Clock advanced by hand. Clones share the same time, so a test can keep
/// one handle while the engine owns another.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<u64>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance_us(&self, us: u64) {
        self.now.set(self.now.get() + us);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance_us(ms * 1000);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now.get()
    }
}

/// One-shot or periodic timer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timer {
    deadline: Option<u64>,
    period: Option<u64>,
}

impl Timer {
    pub const fn new() -> Self {
        Self { deadline: None, period: None }
    }

    /// Arm as one-shot. Starting an active timer restarts it.
    pub fn start(&mut self, now_us: u64, after_us: u64) {
        self.deadline = Some(now_us.saturating_add(after_us));
        self.period = None;
    }

    pub fn start_periodic(&mut self, now_us: u64, period_us: u64) {
        self.deadline = Some(now_us.saturating_add(period_us));
        self.period = Some(period_us);
    }

    pub fn stop(&mut self) {
        self.deadline = None;
        self.period = None;
    }

    pub fn is_active(&self) -> bool {
        self.deadline.is_some()
    }

    /// True once per expiry. One-shot timers stop, periodic timers re-arm
    /// from their previous deadline.
    pub fn poll(&mut self, now_us: u64) -> bool {
        match self.deadline {
            Some(deadline) if now_us >= deadline => {
                match self.period {
                    Some(period) if period > 0 => {
                        self.deadline = Some(deadline.saturating_add(period));
                    }
                    _ => self.deadline = None,
                }
                true
            }
            _ => false,
        }
    }
}
