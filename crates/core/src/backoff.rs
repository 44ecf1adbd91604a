// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Exponential backoff with jitter.
//!
//! `delay(n) = min(cap, base * 2^n + jitter)` where `jitter` is drawn from
//! `[0, base * 2^n / 2)`. Since `base * 2^(n+1)` is larger than any jittered
//! value for attempt `n`, delays never shrink from one attempt to the next.

use std::time::Duration;

use rand::Rng;

/// Largest exponent applied; later attempts reuse it without jitter.
const MAX_EXPONENT: u32 = 32;

/// Exponential backoff calculator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base_ms: u64,
    cap_ms: u64,
}

impl Backoff {
    /// Creates a calculator. A cap below the base is raised to the base.
    pub fn new(base: Duration, cap: Duration) -> Self {
        let base_ms = (base.as_millis() as u64).max(1);
        let cap_ms = (cap.as_millis() as u64).max(base_ms);
        Backoff { base_ms, cap_ms }
    }

    /// The configured upper bound on any delay.
    pub fn cap(&self) -> Duration {
        Duration::from_millis(self.cap_ms)
    }

    /// Delay before retry number `attempt` (0 for the first retry).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    /// Same as [`Backoff::delay`] with a caller-supplied random source.
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let raw = self.base_ms.saturating_mul(1u64 << attempt.min(MAX_EXPONENT));
        if attempt >= MAX_EXPONENT {
            return Duration::from_millis(raw.min(self.cap_ms));
        }

        let spread = raw / 2;
        let jitter = if spread > 0 { rng.gen_range(0..spread) } else { 0 };
        Duration::from_millis(raw.saturating_add(jitter).min(self.cap_ms))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(Duration::from_secs(1), Duration::from_secs(3600))
    }
}

#[cfg(test)]
#[path = "backoff_tests.rs"]
mod tests;
