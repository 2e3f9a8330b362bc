// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The playback reference clock.
//!
//! All presentation decisions compare picture timestamps against this
//! clock, which tracks the current playback position in microseconds
//! and can be re-anchored on seeks and audio discontinuities.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

pub trait MediaClock: Send + Sync {
    /// Current playback position in microseconds.
    fn now_us(&self) -> i64;

    /// Re-anchors the clock to `value_us` without rate change, as after
    /// a seek.
    fn discontinuity(&self, value_us: i64);
}

struct ClockState {
    origin: Instant,
    offset_us: i64,
}

/// Wall-clock-driven implementation backed by a monotonic source.
pub struct MonotonicClock {
    state: Mutex<ClockState>,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { state: Mutex::new(ClockState { origin: Instant::now(), offset_us: 0 }) }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaClock for MonotonicClock {
    fn now_us(&self) -> i64 {
        let state = self.state.lock().unwrap();
        state.offset_us + state.origin.elapsed().as_micros() as i64
    }

    fn discontinuity(&self, value_us: i64) {
        let mut state = self.state.lock().unwrap();
        state.origin = Instant::now();
        state.offset_us = value_us;
    }
}

/// Test clock that only moves when told to.
pub struct ManualClock {
    now_us: Arc<Mutex<i64>>,
}

impl ManualClock {
    pub fn new(start_us: i64) -> Self {
        Self { now_us: Arc::new(Mutex::new(start_us)) }
    }

    pub fn advance(&self, delta_us: i64) {
        *self.now_us.lock().unwrap() += delta_us;
    }
}

impl Clone for ManualClock {
    fn clone(&self) -> Self {
        Self { now_us: Arc::clone(&self.now_us) }
    }
}

impl MediaClock for ManualClock {
    fn now_us(&self) -> i64 {
        *self.now_us.lock().unwrap()
    }

    fn discontinuity(&self, value_us: i64) {
        *self.now_us.lock().unwrap() = value_us;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discontinuity_reanchors() {
        let clock = MonotonicClock::new();
        clock.discontinuity(1_000_000);
        let now = clock.now_us();
        assert!(now >= 1_000_000);
        assert!(now < 1_500_000);
    }

    #[test]
    fn manual_clock_is_deterministic() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now_us(), 100);
        clock.advance(40_000);
        assert_eq!(clock.now_us(), 40_100);
        clock.discontinuity(0);
        assert_eq!(clock.now_us(), 0);
    }
}
