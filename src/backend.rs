// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The platform codec seam.
//!
//! A backend is a provider of hardware decoding. The session never sees
//! vendor details: it talks to a [`CodecCandidate`] to probe whether the
//! platform can decode a given stream, and to the [`CodecInstance`] the
//! candidate produces, through an indexed input/output buffer protocol
//! with bounded timeouts on every wait.

pub mod dummy;

use std::time::Duration;

use thiserror::Error;

use crate::PictureFlags;
use crate::PixelLayout;
use crate::Resolution;
use crate::StreamParams;

#[derive(Debug, Error)]
pub enum BackendError {
    /// No buffer became available within the caller's timeout. This is
    /// the ordinary backpressure signal, not a fault.
    #[error("timed out waiting on the codec")]
    Timeout,
    #[error("the codec does not support this stream configuration")]
    Unsupported,
    /// A decode fault the codec may recover from if flushed.
    #[error("recoverable codec fault: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Output geometry reported by the codec once it has parsed enough of
/// the stream, and again whenever it changes mid-stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    pub coded_size: Resolution,
    pub display_size: Resolution,
    pub interlaced: bool,
    /// Minimum number of output buffers the codec needs in rotation.
    pub min_num_buffers: usize,
}

/// An owned claim on one input slot, returned by [`CodecInstance::dequeue_input`]
/// and consumed by [`CodecInstance::queue_input`].
#[derive(Debug)]
pub struct InputSlot {
    pub index: usize,
    /// Payloads longer than this cannot be queued into this slot.
    pub capacity: usize,
}

/// A decoded picture still owned by the codec. The caller must hand the
/// buffer index back via [`CodecInstance::recycle_output`] before the
/// codec can reuse it.
#[derive(Clone, Debug)]
pub struct DecodedPictureDesc {
    pub buffer_index: usize,
    /// Timestamp the codec associated with this picture, in microseconds.
    pub timestamp: i64,
    pub flags: PictureFlags,
}

/// One result of polling the codec's output side.
#[derive(Debug)]
pub enum OutputEvent {
    Picture(DecodedPictureDesc),
    FormatChanged(StreamInfo),
    EndOfStream,
}

/// A running decoder. All waits take an explicit timeout and fail with
/// [`BackendError::Timeout`] rather than blocking indefinitely.
pub trait CodecInstance: Send {
    fn name(&self) -> &str;

    /// Transitions the codec to its running state. May fail late even
    /// when the candidate matched, e.g. because the secure world denied
    /// the session.
    fn start(&mut self) -> Result<(), BackendError>;

    /// Releases the codec. Must tolerate being called at any point.
    fn stop(&mut self);

    /// Pushes out-of-band configuration (extradata) ahead of stream
    /// payload. Called once after `start` and again after every flush.
    fn prime_config(&mut self, extradata: &[u8]) -> Result<(), BackendError>;

    /// Claims a free input slot, waiting at most `timeout`.
    fn dequeue_input(&mut self, timeout: Duration) -> Result<InputSlot, BackendError>;

    /// Queues `payload` for decoding in a previously claimed slot.
    fn queue_input(
        &mut self,
        slot: InputSlot,
        payload: &[u8],
        timestamp: i64,
        eos: bool,
    ) -> Result<(), BackendError>;

    /// Polls the output side, waiting at most `timeout` for an event.
    fn dequeue_output(&mut self, timeout: Duration) -> Result<OutputEvent, BackendError>;

    /// Returns an output buffer for reuse. `rendered` tells the codec
    /// whether the picture actually reached the display, which some
    /// implementations use for their own drop accounting.
    fn recycle_output(&mut self, buffer_index: usize, rendered: bool);

    /// Discards all queued input and undelivered output.
    fn flush(&mut self) -> Result<(), BackendError>;
}

/// One probe-able decoder the platform offers. Candidates are held in a
/// ranked list; the session instantiates the first that matches.
pub trait CodecCandidate: Send + Sync {
    fn name(&self) -> &str;

    /// Compressed formats this decoder accepts.
    fn codecs(&self) -> &[crate::CodecKind];

    /// Whether this decoder can run a protected (DRM) session.
    fn secure(&self) -> bool;

    /// Output layouts this decoder can produce.
    fn layouts(&self) -> &[PixelLayout];

    /// Whether this candidate can decode `params`. The default check
    /// covers codec, secure path and pixel layout; implementations with
    /// resolution or level limits override it.
    fn matches(&self, params: &StreamParams) -> bool {
        self.codecs().contains(&params.codec)
            && (!params.secure || self.secure())
            && self.layouts().contains(&params.layout)
    }

    /// Builds a fresh instance. May fail even after `matches` returned
    /// true, in which case the session falls through to the next
    /// candidate.
    fn instantiate(&self) -> Result<Box<dyn CodecInstance>, BackendError>;
}
