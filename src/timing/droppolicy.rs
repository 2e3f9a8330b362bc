// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Frame drop policy.
//!
//! Decides, once per presentation cycle, whether playback is far enough
//! behind that frames should be skipped, and keeps the accounting
//! honest: every drop already performed is credited in a FIFO gain
//! ledger until the renderer has caught up past it, so one late spell
//! does not cascade into a burst of drops.

use std::collections::VecDeque;

/// Bitmask of per-cycle decisions.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DropSignals(u32);

impl DropSignals {
    pub const NONE: DropSignals = DropSignals(0);
    /// The render queue is close to starving; decode should not dally.
    pub const HURRY: DropSignals = DropSignals(1 << 0);
    /// A previously requested drop has been observed taking effect.
    pub const DROPPED: DropSignals = DropSignals(1 << 1);
    /// Playback is late enough that the next frame should be skipped.
    pub const VERYLATE: DropSignals = DropSignals(1 << 2);
    pub const EOS: DropSignals = DropSignals(1 << 3);

    pub fn contains(&self, other: DropSignals) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for DropSignals {
    type Output = DropSignals;

    fn bitor(self, rhs: Self) -> Self::Output {
        DropSignals(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for DropSignals {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

#[derive(Clone, Debug)]
pub struct DropPolicyConfig {
    /// Free render slots at or below which HURRY is raised.
    pub hurry_threshold: usize,
    /// Cycles of mild lateness tolerated before a drop is requested.
    pub hysteresis_cycles: u32,
    /// Lateness worse than this many frame intervals bypasses the
    /// hysteresis.
    pub immediate_factor: i64,
    /// Cap on unserviced drop requests carried forward.
    pub max_outstanding_requests: u32,
}

impl Default for DropPolicyConfig {
    fn default() -> Self {
        Self {
            hurry_threshold: 2,
            hysteresis_cycles: 3,
            immediate_factor: 2,
            max_outstanding_requests: 8,
        }
    }
}

/// Everything the policy looks at in one cycle.
#[derive(Clone, Debug, Default)]
pub struct CycleInputs {
    /// Timestamp of the newest picture out of the decoder.
    pub decoder_pts: Option<i64>,
    /// Timestamp of the picture most recently put on screen.
    pub rendered_pts: Option<i64>,
    /// Render feedback: remaining sleep before the last picture was
    /// due. Negative when late.
    pub sleep_budget_us: i64,
    pub free_render_slots: usize,
    /// The decoder handed back an unwoven interlaced picture this
    /// cycle.
    pub deinterlace_skipped: bool,
    /// Nominal frame interval in microseconds.
    pub interval_us: i64,
    /// A trusted frame interval exists (or policy override): dropping
    /// is allowed at all.
    pub drops_permitted: bool,
    /// The upcoming picture must reach the screen regardless of
    /// lateness.
    pub must_not_skip: bool,
    pub eos: bool,
}

struct GainEntry {
    pts: i64,
    gain_us: i64,
}

pub struct DropPolicy {
    config: DropPolicyConfig,
    last_decoder_pts: Option<i64>,
    ledger: VecDeque<GainEntry>,
    gain_total_us: i64,
    outstanding_requests: u32,
    late_cycles: u32,
    dropped_frames: u64,
}

impl DropPolicy {
    pub fn new(config: DropPolicyConfig) -> Self {
        Self {
            config,
            last_decoder_pts: None,
            ledger: VecDeque::new(),
            gain_total_us: 0,
            outstanding_requests: 0,
            late_cycles: 0,
            dropped_frames: 0,
        }
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    pub fn ledger_len(&self) -> usize {
        self.ledger.len()
    }

    /// Credits a drop performed outside the decoder-gap path, e.g. a
    /// picture released unrendered by the presentation loop. `gain_us`
    /// is the display time saved.
    pub fn register_drop(&mut self, pts: i64, gain_us: i64) {
        if gain_us <= 0 {
            return;
        }
        self.ledger.push_back(GainEntry { pts, gain_us });
        self.gain_total_us += gain_us;
        self.dropped_frames += 1;
        self.outstanding_requests = 0;
    }

    /// Clears all transient state, for seeks and stream changes.
    pub fn reset(&mut self) {
        self.last_decoder_pts = None;
        self.ledger.clear();
        self.gain_total_us = 0;
        self.outstanding_requests = 0;
        self.late_cycles = 0;
    }

    pub fn update(&mut self, inputs: &CycleInputs) -> DropSignals {
        let mut signals = DropSignals::NONE;
        if inputs.eos {
            signals |= DropSignals::EOS;
        }
        if inputs.free_render_slots <= self.config.hurry_threshold {
            signals |= DropSignals::HURRY;
        }

        // Watch decoder progress. A timestamp jump wider than one
        // interval while a request is outstanding is that request
        // taking effect.
        if let Some(pts) = inputs.decoder_pts {
            if let Some(last) = self.last_decoder_pts {
                let advance = pts - last;
                if advance < 0 {
                    // Timestamps went backwards underneath us; any
                    // pending request belongs to the old timeline.
                    self.outstanding_requests = 0;
                    self.late_cycles = 0;
                } else if advance > 0
                    && self.outstanding_requests > 0
                    && inputs.drops_permitted
                {
                    // A skipped deinterlace pass earns a whole interval
                    // unconditionally; a timestamp jump only counts
                    // once its gain clearly exceeds normal progress.
                    let gain_us = advance - inputs.interval_us;
                    if inputs.deinterlace_skipped {
                        self.register_drop(pts, inputs.interval_us);
                        signals |= DropSignals::DROPPED;
                    } else if gain_us > inputs.interval_us {
                        self.register_drop(pts, gain_us);
                        signals |= DropSignals::DROPPED;
                    }
                }
            }
            self.last_decoder_pts = Some(pts);
        }

        // Expire ledger entries the renderer has caught up past.
        if let Some(rendered) = inputs.rendered_pts {
            while self.ledger.front().is_some_and(|entry| entry.pts <= rendered) {
                self.gain_total_us -= self.ledger.pop_front().map(|e| e.gain_us).unwrap_or(0);
            }
        }

        // Effective lateness is what the renderer reports, minus credit
        // for drops whose effect has not reached it yet.
        let lateness_us = inputs.sleep_budget_us + self.gain_total_us;
        if lateness_us < 0 {
            self.late_cycles += 1;
            let immediate = lateness_us < -self.config.immediate_factor * inputs.interval_us;
            if (immediate || self.late_cycles > self.config.hysteresis_cycles)
                && inputs.drops_permitted
                && !inputs.must_not_skip
            {
                signals |= DropSignals::VERYLATE;
                if self.outstanding_requests < self.config.max_outstanding_requests {
                    self.outstanding_requests += 1;
                }
                self.late_cycles = 0;
            }
        } else {
            // Healthy again: a stale request must not trigger a drop
            // later.
            self.late_cycles = 0;
            self.outstanding_requests = 0;
        }

        signals
    }
}

impl Default for DropPolicy {
    fn default() -> Self {
        Self::new(Default::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: i64 = 40_000;

    fn inputs() -> CycleInputs {
        CycleInputs {
            interval_us: INTERVAL,
            drops_permitted: true,
            free_render_slots: 4,
            sleep_budget_us: INTERVAL,
            ..Default::default()
        }
    }

    #[test]
    fn hurry_follows_free_slots() {
        let mut policy = DropPolicy::default();
        let mut cycle = inputs();
        cycle.free_render_slots = 2;
        assert!(policy.update(&cycle).contains(DropSignals::HURRY));
        cycle.free_render_slots = 3;
        assert!(!policy.update(&cycle).contains(DropSignals::HURRY));
    }

    #[test]
    fn mild_lateness_needs_hysteresis() {
        let mut policy = DropPolicy::default();
        let mut cycle = inputs();
        cycle.sleep_budget_us = -INTERVAL / 2;
        for _ in 0..3 {
            assert!(!policy.update(&cycle).contains(DropSignals::VERYLATE));
        }
        assert!(policy.update(&cycle).contains(DropSignals::VERYLATE));
    }

    #[test]
    fn severe_lateness_skips_hysteresis() {
        let mut policy = DropPolicy::default();
        let mut cycle = inputs();
        cycle.sleep_budget_us = -3 * INTERVAL;
        assert!(policy.update(&cycle).contains(DropSignals::VERYLATE));
    }

    #[test]
    fn no_drops_without_permission_or_for_protected_frames() {
        let mut policy = DropPolicy::default();
        let mut cycle = inputs();
        cycle.sleep_budget_us = -5 * INTERVAL;
        cycle.drops_permitted = false;
        assert!(!policy.update(&cycle).contains(DropSignals::VERYLATE));

        cycle.drops_permitted = true;
        cycle.must_not_skip = true;
        assert!(!policy.update(&cycle).contains(DropSignals::VERYLATE));
    }

    #[test]
    fn decoder_gap_registers_exactly_one_drop() {
        let mut policy = DropPolicy::default();

        // Request a drop.
        let mut cycle = inputs();
        cycle.decoder_pts = Some(0);
        cycle.sleep_budget_us = -3 * INTERVAL;
        assert!(policy.update(&cycle).contains(DropSignals::VERYLATE));
        assert_eq!(policy.ledger_len(), 0);

        // The decoder jumps five intervals: the drop took effect.
        cycle.decoder_pts = Some(5 * INTERVAL);
        let signals = policy.update(&cycle);
        assert!(signals.contains(DropSignals::DROPPED));
        assert_eq!(policy.ledger_len(), 1);
        assert_eq!(policy.dropped_frames(), 1);

        // Steady progress afterwards registers nothing more.
        cycle.decoder_pts = Some(6 * INTERVAL);
        cycle.sleep_budget_us = INTERVAL;
        assert!(!policy.update(&cycle).contains(DropSignals::DROPPED));
        assert_eq!(policy.dropped_frames(), 1);

        // Ledger entry expires once the renderer passes its pts.
        cycle.rendered_pts = Some(5 * INTERVAL);
        policy.update(&cycle);
        assert_eq!(policy.ledger_len(), 0);
    }

    #[test]
    fn gain_credit_masks_lateness() {
        let mut policy = DropPolicy::default();
        let mut cycle = inputs();
        cycle.decoder_pts = Some(0);
        cycle.sleep_budget_us = -3 * INTERVAL;
        policy.update(&cycle);

        // Drop lands: four intervals of gain are credited.
        cycle.decoder_pts = Some(5 * INTERVAL);
        policy.update(&cycle);

        // Still reporting the same raw lateness, but the credit covers
        // it, so no further drop is requested.
        cycle.decoder_pts = Some(6 * INTERVAL);
        assert!(!policy.update(&cycle).contains(DropSignals::VERYLATE));
    }

    #[test]
    fn deinterlace_skip_counts_one_interval() {
        let mut policy = DropPolicy::default();
        let mut cycle = inputs();
        cycle.decoder_pts = Some(0);
        cycle.sleep_budget_us = -3 * INTERVAL;
        policy.update(&cycle);

        cycle.decoder_pts = Some(INTERVAL);
        cycle.deinterlace_skipped = true;
        let signals = policy.update(&cycle);
        assert!(signals.contains(DropSignals::DROPPED));
        assert_eq!(policy.ledger_len(), 1);
    }

    #[test]
    fn eos_signal_passes_through() {
        let mut policy = DropPolicy::default();
        let mut cycle = inputs();
        cycle.eos = true;
        assert!(policy.update(&cycle).contains(DropSignals::EOS));
    }
}
