// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Frame rate estimation from observed presentation timestamps.
//!
//! Container metadata lies often enough that the true rate is measured
//! from the stream: collect a window of timestamps, bucket the sorted
//! deltas, and accept the result only when the deltas collapse to at
//! most two clusters. Measured rates close to a canonical broadcast
//! rate snap to it exactly. The published rate lives in a shared
//! atomic, in millihertz, so diagnostics can read it without locking.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::TIME_BASE_US;

/// Deltas within this distance of a bucket's mean join the bucket.
const DELTA_TOLERANCE_US: i64 = 500;
/// Measured rates within this fraction of a canonical rate snap to it.
const SNAP_TOLERANCE: f64 = 0.01;
/// Consecutive failed evaluations before detection gives up and the
/// declared rate wins.
const MAX_PATTERN_ERRORS: u32 = 3;
pub const INITIAL_WINDOW: usize = 64;
const MAX_WINDOW: usize = 512;

/// Canonical broadcast rates, in millihertz.
const CANONICAL_RATES_MHZ: [u32; 8] =
    [23_976, 24_000, 25_000, 29_970, 30_000, 50_000, 59_940, 60_000];

struct Bucket {
    sum: i64,
    count: u32,
}

impl Bucket {
    fn mean(&self) -> i64 {
        self.sum / self.count as i64
    }
}

pub struct RateEstimator {
    window: Vec<i64>,
    capacity: usize,
    pattern_found: bool,
    candidate_mhz: Option<u32>,
    confirmed: bool,
    errors: u32,
    suspended: bool,
    advertised_mhz: Arc<AtomicU32>,
}

impl RateEstimator {
    pub fn new() -> Self {
        Self {
            window: Vec::with_capacity(INITIAL_WINDOW),
            capacity: INITIAL_WINDOW,
            pattern_found: false,
            candidate_mhz: None,
            confirmed: false,
            errors: 0,
            suspended: false,
            advertised_mhz: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Shared handle on the published rate, zero while unknown or
    /// suspended. Millihertz.
    pub fn advertised_handle(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.advertised_mhz)
    }

    pub fn rate_mhz(&self) -> Option<u32> {
        match self.advertised_mhz.load(Ordering::Relaxed) {
            0 => None,
            mhz => Some(mhz),
        }
    }

    pub fn pattern_found(&self) -> bool {
        self.pattern_found
    }

    /// The estimate has survived a full window refill and may override
    /// declared metadata.
    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    /// Feeds one presentation timestamp. Evaluation happens each time
    /// the window fills, after which it refills from scratch.
    pub fn add(&mut self, pts: i64) {
        if self.suspended {
            return;
        }
        self.window.push(pts);
        if self.window.len() >= self.capacity {
            self.evaluate();
            self.window.clear();
        }
    }

    /// Clears all detection state, for seeks and stream changes.
    pub fn reset(&mut self) {
        self.window.clear();
        self.capacity = INITIAL_WINDOW;
        self.pattern_found = false;
        self.candidate_mhz = None;
        self.confirmed = false;
        self.errors = 0;
        self.suspended = false;
        self.advertised_mhz.store(0, Ordering::Relaxed);
    }

    fn evaluate(&mut self) {
        let mut deltas: Vec<i64> =
            self.window.windows(2).map(|w| w[1] - w[0]).filter(|d| *d > 0).collect();
        deltas.sort_unstable();

        let mut buckets: Vec<Bucket> = Vec::new();
        for delta in deltas {
            match buckets.last_mut() {
                Some(bucket) if delta - bucket.mean() <= DELTA_TOLERANCE_US => {
                    bucket.sum += delta;
                    bucket.count += 1;
                }
                _ => buckets.push(Bucket { sum: delta, count: 1 }),
            }
        }
        // Isolated deltas are noise (seeks, damaged timestamps).
        buckets.retain(|bucket| bucket.count > 1);

        // More than two clusters means no stable cadence.
        if buckets.is_empty() || buckets.len() > 2 {
            self.pattern_breakage();
            return;
        }

        let total_sum: i64 = buckets.iter().map(|b| b.sum).sum();
        let total_count: u32 = buckets.iter().map(|b| b.count).sum();
        let mean_delta = total_sum as f64 / total_count as f64;
        let rate = TIME_BASE_US as f64 / mean_delta;
        let mhz = Self::snap(rate);

        self.pattern_found = true;
        self.errors = 0;
        if self.candidate_mhz == Some(mhz) {
            self.confirmed = true;
            // Every window that re-confirms the rate earns a longer
            // look, up to the cap.
            self.capacity = (self.capacity * 2).min(MAX_WINDOW);
        } else {
            self.candidate_mhz = Some(mhz);
            self.confirmed = false;
        }
        self.advertised_mhz.store(mhz, Ordering::Relaxed);
    }

    fn pattern_breakage(&mut self) {
        self.pattern_found = false;
        self.confirmed = false;
        self.errors += 1;
        if self.errors >= MAX_PATTERN_ERRORS {
            log::warn!("no stable frame cadence after {} windows, falling back to declared rate", self.errors);
            self.suspended = true;
            self.candidate_mhz = None;
            self.advertised_mhz.store(0, Ordering::Relaxed);
        }
    }

    fn snap(rate: f64) -> u32 {
        for canonical in CANONICAL_RATES_MHZ {
            let canonical_rate = canonical as f64 / 1000.0;
            if (rate - canonical_rate).abs() <= canonical_rate * SNAP_TOLERANCE {
                return canonical;
            }
        }
        (rate * 1000.0).round() as u32
    }
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new()
    }
}
