//! Elapsed/average/remaining time tracking for bounded step sequences.
//!
//! Used by the measurement engine to produce operator-facing progress and ETA
//! messages. An [`Estimate`] is created per logical phase (ramp-to-begin,
//! main sweep, ramp-to-zero) and advanced exactly once per completed step.

use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
pub struct Estimate {
    total: usize,
    passed: usize,
    started: Instant,
}

impl Estimate {
    /// Starts tracking a sequence of `total` steps. Zero-length sequences are
    /// valid and report zero remaining time.
    pub fn new(total: usize) -> Self {
        Self {
            total,
            passed: 0,
            started: Instant::now(),
        }
    }

    /// Marks one step completed. Advancing past `total` saturates.
    pub fn advance(&mut self) {
        if self.passed < self.total {
            self.passed += 1;
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn passed(&self) -> usize {
        self.passed
    }

    /// Wall-clock time since tracking started; never decreases.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Average time per completed step, zero before the first `advance()`.
    pub fn average(&self) -> Duration {
        if self.passed == 0 {
            Duration::ZERO
        } else {
            self.elapsed() / self.passed as u32
        }
    }

    /// Projected time to finish the remaining steps.
    pub fn remaining(&self) -> Duration {
        let left = self.total.saturating_sub(self.passed);
        self.average() * left as u32
    }
}
