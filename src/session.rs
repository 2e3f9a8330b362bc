// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decoder session state machine.
//!
//! A [`DecoderSession`] owns one running platform codec instance, picked
//! by probing a ranked candidate list, plus the picture pool its output
//! flows through. Every wait against the codec is bounded; input the
//! codec cannot accept right now is parked in a single-item pending
//! queue so the caller's ordering is preserved without blocking.
//!
//! Platform decoders are exclusive hardware: a process-wide guard keeps
//! a second session from opening while one is alive, and is released on
//! every failed open path as well as on dispose.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use log::debug;
use log::error;
use log::warn;
use thiserror::Error;

use crate::backend::BackendError;
use crate::backend::CodecCandidate;
use crate::backend::CodecInstance;
use crate::backend::DecodedPictureDesc;
use crate::backend::OutputEvent;
use crate::backend::StreamInfo;
use crate::buffer_pool::BufferPool;
use crate::buffer_pool::OutputPicture;
use crate::EncodedAccessUnit;
use crate::StreamParams;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no platform codec accepts this stream")]
    Configuration,
    #[error("stream requires secure decode but no secure-capable codec exists")]
    SecureDecodeUnavailable,
    #[error("another decoder session already holds the platform codec")]
    InstanceBusy,
    #[error("operation not valid in state {0:?}")]
    BadState(SessionState),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Flushed,
    Running,
    EndOfStream,
    Stopped,
    Error,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Wait for a free input slot before parking the unit.
    pub submit_timeout: Duration,
    /// Wait for output per drain call.
    pub drain_timeout: Duration,
    /// Attempts at injecting the end-of-stream marker before giving up.
    pub eos_retry_budget: u32,
    /// Consecutive output faults tolerated before an internal flush.
    pub fault_ceiling: u32,
    /// Internal flush-recoveries before the session goes to `Error`.
    pub recovery_ceiling: u32,
    /// Most pictures allowed in flight at once.
    pub pool_soft_cap: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            submit_timeout: Duration::from_millis(5),
            drain_timeout: Duration::from_millis(2),
            eos_retry_budget: 16,
            fault_ceiling: 3,
            recovery_ceiling: 3,
            pool_soft_cap: 16,
        }
    }
}

/// What happened to a submitted access unit.
#[derive(Debug)]
pub enum SubmitOutcome {
    Queued,
    /// No input slot freed up in time; the unit is parked and will go
    /// out on a later `retry_pending` or `submit` call.
    Pending,
    /// The pending queue is already occupied; the unit is handed back
    /// untouched.
    Rejected(EncodedAccessUnit),
}

/// One result of polling the session's output side.
#[derive(Debug)]
pub enum Drained {
    NoOutput,
    FormatChanged(StreamInfo),
    Picture(OutputPicture),
    EndOfStream,
}

static CODEC_IN_USE: AtomicBool = AtomicBool::new(false);

struct InstanceGuard;

impl InstanceGuard {
    fn acquire() -> Option<Self> {
        CODEC_IN_USE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            .then_some(InstanceGuard)
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        CODEC_IN_USE.store(false, Ordering::Release);
    }
}

pub struct DecoderSession {
    state: SessionState,
    config: SessionConfig,
    params: StreamParams,
    instance: Box<dyn CodecInstance>,
    guard: Option<InstanceGuard>,
    pool: BufferPool,
    stream_info: Option<StreamInfo>,
    pending: Option<EncodedAccessUnit>,
    /// A decoded picture the pool had no free slot for, delivered ahead
    /// of any new output once a handle is released.
    pending_output: Option<DecodedPictureDesc>,
    /// Learned once, from the first timestamp seen: how far the whole
    /// stream has to be shifted to become non-negative.
    ts_shift_us: Option<i64>,
    last_ts_us: i64,
    consecutive_faults: u32,
    recoveries: u32,
    transient_faults: u64,
}

impl DecoderSession {
    /// Probes `candidates` in order and opens a session on the first
    /// that matches `params` and comes up. Candidates that match but
    /// fail to instantiate or start are skipped with a log line, so a
    /// broken preferred decoder degrades instead of failing playback.
    pub fn open(
        candidates: &[Box<dyn CodecCandidate>],
        params: StreamParams,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let guard = InstanceGuard::acquire().ok_or(SessionError::InstanceBusy)?;

        let mut secure_gap = false;
        for candidate in candidates {
            if !candidate.matches(&params) {
                if params.secure && !candidate.secure() {
                    let mut relaxed = params.clone();
                    relaxed.secure = false;
                    if candidate.matches(&relaxed) {
                        secure_gap = true;
                    }
                }
                continue;
            }
            let mut instance = match candidate.instantiate() {
                Ok(instance) => instance,
                Err(err) => {
                    warn!("codec {} failed to instantiate: {}", candidate.name(), err);
                    continue;
                }
            };
            if let Err(err) = instance.start() {
                warn!("codec {} failed to start: {}", candidate.name(), err);
                instance.stop();
                continue;
            }
            if let Err(err) = instance.prime_config(&params.extradata) {
                warn!("codec {} rejected stream config: {}", candidate.name(), err);
                instance.stop();
                continue;
            }
            debug!("opened decoder {} for {:?}", instance.name(), params.codec);
            return Ok(Self {
                state: SessionState::Flushed,
                pool: BufferPool::new(config.pool_soft_cap),
                config,
                params,
                instance,
                guard: Some(guard),
                stream_info: None,
                pending: None,
                pending_output: None,
                ts_shift_us: None,
                last_ts_us: 0,
                consecutive_faults: 0,
                recoveries: 0,
                transient_faults: 0,
            });
        }
        // `guard` drops here, releasing the codec for other callers.
        Err(if secure_gap {
            SessionError::SecureDecodeUnavailable
        } else {
            SessionError::Configuration
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn codec_name(&self) -> &str {
        self.instance.name()
    }

    pub fn stream_info(&self) -> Option<&StreamInfo> {
        self.stream_info.as_ref()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Output faults absorbed so far, for diagnostics.
    pub fn transient_faults(&self) -> u64 {
        self.transient_faults
    }

    fn check_accepts_input(&self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Flushed | SessionState::Running => Ok(()),
            state => Err(SessionError::BadState(state)),
        }
    }

    /// Maps a unit's container timestamp onto the decoder timeline:
    /// shifted by a one-time learned offset, clamped monotonic and
    /// non-negative. Units without any timestamp reuse the last value.
    fn effective_timestamp(&mut self, unit: &EncodedAccessUnit) -> i64 {
        match unit.pts.or(unit.dts) {
            Some(raw) => {
                let shift = *self
                    .ts_shift_us
                    .get_or_insert_with(|| if raw < 0 { -raw } else { 0 });
                let ts = (raw + shift).max(self.last_ts_us).max(0);
                self.last_ts_us = ts;
                ts
            }
            None => self.last_ts_us,
        }
    }

    /// Queues one access unit, waiting at most the configured submit
    /// timeout for an input slot. A parked unit always goes out before
    /// a new one.
    pub fn submit(&mut self, unit: EncodedAccessUnit) -> Result<SubmitOutcome, SessionError> {
        self.check_accepts_input()?;
        if self.pending.is_some() {
            if matches!(self.retry_pending()?, SubmitOutcome::Pending) {
                return Ok(SubmitOutcome::Rejected(unit));
            }
        }
        self.submit_inner(unit)
    }

    /// Retries the parked unit, if any.
    pub fn retry_pending(&mut self) -> Result<SubmitOutcome, SessionError> {
        self.check_accepts_input()?;
        match self.pending.take() {
            Some(unit) => self.submit_inner(unit),
            None => Ok(SubmitOutcome::Queued),
        }
    }

    fn submit_inner(&mut self, unit: EncodedAccessUnit) -> Result<SubmitOutcome, SessionError> {
        let slot = match self.instance.dequeue_input(self.config.submit_timeout) {
            Ok(slot) => slot,
            Err(BackendError::Timeout) => {
                self.pending = Some(unit);
                return Ok(SubmitOutcome::Pending);
            }
            Err(err) => return Err(err.into()),
        };
        let ts = self.effective_timestamp(&unit);
        let len = unit.data.len().min(slot.capacity);
        if len < unit.data.len() {
            warn!("access unit of {} bytes truncated to slot capacity {}", unit.data.len(), len);
        }
        self.instance.queue_input(slot, &unit.data[..len], ts, unit.eos)?;
        self.state = SessionState::Running;
        Ok(SubmitOutcome::Queued)
    }

    /// Hands buffers whose last picture handle was released back to the
    /// codec. Runs at the head of every drain so releases from the
    /// render side free decode resources promptly.
    fn recycle_returned(&mut self) {
        for (index, rendered) in self.pool.take_recycled() {
            self.instance.recycle_output(index, rendered);
        }
    }

    /// Polls the output side once, waiting at most the configured drain
    /// timeout. `NoOutput` is the ordinary idle result; it also covers
    /// the pool being at capacity, in which case decoded pictures stay
    /// queued in the codec until a handle is released.
    pub fn drain(&mut self) -> Result<Drained, SessionError> {
        match self.state {
            SessionState::Flushed | SessionState::Running | SessionState::EndOfStream => (),
            state => return Err(SessionError::BadState(state)),
        }
        self.recycle_returned();
        if let Some(desc) = self.pending_output.take() {
            return Ok(self.deliver_picture(desc));
        }
        if self.pool.is_full() {
            return Ok(Drained::NoOutput);
        }
        match self.instance.dequeue_output(self.config.drain_timeout) {
            Err(BackendError::Timeout) => Ok(Drained::NoOutput),
            Err(err) => self.output_fault(err),
            Ok(OutputEvent::FormatChanged(info)) => {
                debug!(
                    "stream format: {}x{} ({} buffers)",
                    info.display_size.width, info.display_size.height, info.min_num_buffers
                );
                self.consecutive_faults = 0;
                self.stream_info = Some(info.clone());
                Ok(Drained::FormatChanged(info))
            }
            Ok(OutputEvent::EndOfStream) => {
                self.state = SessionState::EndOfStream;
                Ok(Drained::EndOfStream)
            }
            Ok(OutputEvent::Picture(desc)) => {
                self.consecutive_faults = 0;
                self.state = SessionState::Running;
                Ok(self.deliver_picture(desc))
            }
        }
    }

    /// Hands a decoded picture to the pool. If every slot is taken the
    /// descriptor is parked, not lost, and goes out on a later drain.
    fn deliver_picture(&mut self, desc: DecodedPictureDesc) -> Drained {
        let size = self
            .stream_info
            .as_ref()
            .map(|info| info.display_size)
            .unwrap_or(self.params.size);
        match self.pool.wrap(desc.buffer_index, Some(desc.timestamp), size, desc.flags) {
            Some(picture) => Drained::Picture(picture),
            None => {
                debug!("picture pool full, holding buffer {}", desc.buffer_index);
                self.pending_output = Some(desc);
                Drained::NoOutput
            }
        }
    }

    /// Absorbs isolated output faults, flushes to recover from a run of
    /// them, and gives up once recovery itself stops working.
    fn output_fault(&mut self, err: BackendError) -> Result<Drained, SessionError> {
        self.transient_faults += 1;
        self.consecutive_faults += 1;
        if self.consecutive_faults <= self.config.fault_ceiling {
            debug!("transient decoder fault ({}): {}", self.consecutive_faults, err);
            return Ok(Drained::NoOutput);
        }
        self.recoveries += 1;
        if self.recoveries > self.config.recovery_ceiling {
            error!("decoder not recovering, giving up: {}", err);
            self.state = SessionState::Error;
            return Err(err.into());
        }
        warn!("flushing decoder to recover from repeated faults: {}", err);
        self.consecutive_faults = 0;
        self.flush()?;
        Ok(Drained::NoOutput)
    }

    /// Discards all queued input and in-flight output. Out-of-band
    /// configuration is re-primed since codecs lose it across a flush.
    pub fn flush(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Flushed
            | SessionState::Running
            | SessionState::EndOfStream => (),
            state => return Err(SessionError::BadState(state)),
        }
        self.pending = None;
        // The codec's flush reclaims the parked buffer along with the
        // rest of its rotation.
        self.pending_output = None;
        self.pool.invalidate_all();
        self.instance.flush()?;
        self.instance.prime_config(&self.params.extradata)?;
        self.last_ts_us = 0;
        self.consecutive_faults = 0;
        self.state = SessionState::Flushed;
        Ok(())
    }

    /// Injects the end-of-stream marker, retrying within a bounded
    /// budget while releasing freed buffers to make room. Best effort:
    /// failure to inject is logged, not fatal.
    pub fn signal_end_of_stream(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::EndOfStream {
            return Ok(());
        }
        self.check_accepts_input()?;
        for _ in 0..self.config.eos_retry_budget {
            self.recycle_returned();
            match self.instance.dequeue_input(self.config.submit_timeout) {
                Ok(slot) => {
                    self.instance.queue_input(slot, &[], self.last_ts_us, true)?;
                    return Ok(());
                }
                Err(BackendError::Timeout) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        warn!("no room to inject the end-of-stream marker, giving up");
        Ok(())
    }

    /// Shuts the codec down. Safe to call more than once; also runs on
    /// drop.
    pub fn dispose(&mut self) {
        if self.state == SessionState::Stopped {
            return;
        }
        self.pending_output = None;
        self.pool.invalidate_all();
        self.recycle_returned();
        self.instance.stop();
        self.guard = None;
        self.state = SessionState::Stopped;
    }
}

impl Drop for DecoderSession {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Sessions contend for the process-wide codec guard; tests that open
/// one serialize on this lock.
#[cfg(test)]
pub(crate) fn exclusive_codec() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
