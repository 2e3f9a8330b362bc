// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Presentation timing: frame rate estimation, pulldown cadence
//! correction, and the frame drop policy.

pub mod cadence;
pub mod droppolicy;
pub mod framerate;

use crate::TIME_BASE_US;

/// Converts a rate in millihertz to a frame interval in microseconds.
pub fn interval_from_mhz(rate_mhz: u32) -> Option<i64> {
    if rate_mhz == 0 {
        return None;
    }
    Some(TIME_BASE_US * 1000 / rate_mhz as i64)
}
