// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The render sink seam.
//!
//! The presentation loop schedules pictures into whatever puts them on
//! screen through this trait. The sink owns a small queue of render
//! slots; its feedback (free slots, how far ahead of schedule the last
//! render was) drives the drop policy.

use std::time::Duration;

use thiserror::Error;

use crate::buffer_pool::OutputPicture;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no render slot available")]
    Busy,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Feedback snapshot used by the drop policy each presentation cycle.
#[derive(Copy, Clone, Debug, Default)]
pub struct RenderStats {
    /// How long the sink could still have slept before the last
    /// submitted picture was due, in microseconds. Negative means the
    /// picture arrived late.
    pub sleep_budget_us: i64,
    /// Timestamp of the picture most recently put on screen.
    pub rendered_pts: Option<i64>,
    pub free_slots: usize,
}

pub trait RenderSink: Send + Sync {
    /// Blocks until a render slot is free, up to `timeout`. Returns
    /// whether one is available.
    fn wait_for_slot(&self, timeout: Duration) -> bool;

    /// Hands `picture` over for display at `target_time_us` on the
    /// shared media clock. The sink owns the handle from here and
    /// releases it once the picture leaves the screen.
    fn submit(&self, picture: OutputPicture, target_time_us: i64) -> Result<(), RenderError>;

    fn stats(&self) -> RenderStats;
}
