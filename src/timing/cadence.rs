// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Pulldown cadence correction.
//!
//! Telecined content reaches the decoder with timestamps quantized to
//! the transport's field clock, so frame deltas jitter around the ideal
//! pattern (e.g. 2:3 pulldown). Given the pattern and the duration of
//! one full pattern cycle, this corrector pins each frame to its ideal
//! position within the cycle and reports the exact per-phase duration,
//! removing the jitter deterministically.

/// Result of correcting one frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CorrectedFrame {
    pub pts: i64,
    pub duration_us: i64,
    /// How far the input timestamp was from its ideal position.
    pub offset_us: i64,
}

pub struct CadenceCorrector {
    /// Relative duration weights, one per phase. `[2, 3]` is classic
    /// 2:3 pulldown.
    pattern: Vec<u32>,
    /// Duration of one full pattern cycle in microseconds.
    cycle_duration_us: i64,
    weight_sum: i64,
    phase: usize,
    anchor_pts: i64,
}

impl CadenceCorrector {
    /// Returns `None` for degenerate patterns (empty or zero-weight).
    pub fn new(pattern: &[u32], cycle_duration_us: i64) -> Option<Self> {
        let weight_sum: i64 = pattern.iter().map(|w| *w as i64).sum();
        if pattern.is_empty() || weight_sum == 0 || cycle_duration_us <= 0 {
            return None;
        }
        Some(Self {
            pattern: pattern.to_vec(),
            cycle_duration_us,
            weight_sum,
            phase: 0,
            anchor_pts: 0,
        })
    }

    /// Sum of the weights of all phases before the current one.
    fn elapsed_weight(&self) -> i64 {
        self.pattern[..self.phase].iter().map(|w| *w as i64).sum()
    }

    /// Maps one input timestamp to its corrected position and duration.
    /// The cycle re-anchors on the input at phase zero, so a stream
    /// discontinuity only disturbs a single cycle.
    pub fn correct(&mut self, pts: i64) -> CorrectedFrame {
        if self.phase == 0 {
            self.anchor_pts = pts;
        }
        let ideal = self.anchor_pts + self.cycle_duration_us * self.elapsed_weight() / self.weight_sum;
        let duration_us =
            self.cycle_duration_us * self.pattern[self.phase] as i64 / self.weight_sum;
        let offset_us = ideal - pts;

        self.phase += 1;
        if self.phase == self.pattern.len() {
            self.phase = 0;
        }

        CorrectedFrame { pts: ideal, duration_us, offset_us }
    }

    /// Restarts the phase walk, for seeks and stream changes.
    pub fn reset(&mut self) {
        self.phase = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One 2:3 pulldown cycle: 5 field times of a 59.94Hz field clock.
    const FIELD_US: i64 = 16_683;
    const CYCLE_US: i64 = 5 * FIELD_US;

    #[test]
    fn rejects_degenerate_patterns() {
        assert!(CadenceCorrector::new(&[], CYCLE_US).is_none());
        assert!(CadenceCorrector::new(&[0, 0], CYCLE_US).is_none());
        assert!(CadenceCorrector::new(&[2, 3], 0).is_none());
    }

    #[test]
    fn two_three_pulldown_durations_alternate_exactly() {
        let mut corrector = CadenceCorrector::new(&[2, 3], CYCLE_US).unwrap();
        let short = CYCLE_US * 2 / 5;
        let long = CYCLE_US * 3 / 5;

        // Input follows the pattern exactly; durations must alternate
        // with no rounding jitter over any repetition count.
        let mut pts = 0;
        let mut expected_durations = Vec::new();
        let mut got_durations = Vec::new();
        for cycle in 0..50 {
            let frame = corrector.correct(pts);
            assert_eq!(frame.pts, pts);
            got_durations.push(frame.duration_us);
            expected_durations.push(short);

            let frame = corrector.correct(pts + 2 * FIELD_US + 1);
            // Field-clock jitter of one microsecond is absorbed.
            assert_eq!(frame.pts, pts + short);
            got_durations.push(frame.duration_us);
            expected_durations.push(long);

            pts = (cycle + 1) * CYCLE_US;
        }
        assert_eq!(got_durations, expected_durations);
    }

    #[test]
    fn corrected_deltas_are_jitter_free() {
        let mut corrector = CadenceCorrector::new(&[2, 3], CYCLE_US).unwrap();
        let short = CYCLE_US * 2 / 5;
        let long = CYCLE_US * 3 / 5;

        // Raw input deltas carry +-1 jitter from field snapping.
        let raw = [0, 33_367, 83_415, 116_781, 166_830, 200_197];
        let corrected: Vec<i64> = raw.iter().map(|pts| corrector.correct(*pts).pts).collect();
        let deltas: Vec<i64> = corrected.windows(2).map(|w| w[1] - w[0]).collect();
        for (i, delta) in deltas.iter().enumerate() {
            let expected = if i % 2 == 0 { short } else { long };
            // Cycle boundaries re-anchor on input, everything else is
            // exact.
            assert!((delta - expected).abs() <= 1, "delta {} = {}", i, delta);
        }
    }

    #[test]
    fn reset_restarts_the_cycle() {
        let mut corrector = CadenceCorrector::new(&[2, 3], CYCLE_US).unwrap();
        corrector.correct(0);
        corrector.reset();
        // Phase zero again: the next input becomes the new anchor.
        let frame = corrector.correct(1_000_000);
        assert_eq!(frame.pts, 1_000_000);
        assert_eq!(frame.offset_us, 0);
    }
}
