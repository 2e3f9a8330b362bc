// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The presentation loop: one worker thread per stream that pumps
//! access units into the decoder session, runs every decoded picture
//! through the timing engine, and schedules it into the render sink.
//!
//! The public handle feeds two queues under one lock. Control messages
//! (seek, speed, stream change) always pre-empt data, so a backlogged
//! stream cannot delay a seek. A semaphore eventfd wakes the worker the
//! moment either queue gains an entry; otherwise it polls on a bounded
//! cycle so codec output and still frames keep moving with no work
//! queued.

use std::collections::VecDeque;
use std::os::fd::AsFd;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use log::debug;
use log::error;
use log::warn;
use nix::sys::epoll::Epoll;
use nix::sys::epoll::EpollCreateFlags;
use nix::sys::epoll::EpollEvent;
use nix::sys::epoll::EpollFlags;
use nix::sys::epoll::EpollTimeout;
use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;

use crate::backend::CodecCandidate;
use crate::buffer_pool::OutputPicture;
use crate::clock::MediaClock;
use crate::renderer::RenderSink;
use crate::session::DecoderSession;
use crate::session::Drained;
use crate::session::SessionConfig;
use crate::session::SessionError;
use crate::session::SessionState;
use crate::session::SubmitOutcome;
use crate::timing::cadence::CadenceCorrector;
use crate::timing::droppolicy::CycleInputs;
use crate::timing::droppolicy::DropPolicy;
use crate::timing::droppolicy::DropPolicyConfig;
use crate::timing::droppolicy::DropSignals;
use crate::timing::framerate::RateEstimator;
use crate::timing::interval_from_mhz;
use crate::EncodedAccessUnit;
use crate::StreamParams;
use crate::TIME_BASE_US;

/// Fallback frame interval while no rate is known yet.
const DEFAULT_INTERVAL_US: i64 = 40_000;
/// Most drain results handled per cycle, so a fast decoder cannot
/// starve control processing.
const MAX_DRAINS_PER_CYCLE: usize = 8;

#[derive(Clone, Debug)]
pub struct CadenceSpec {
    pub pattern: Vec<u32>,
    pub cycle_duration_us: i64,
}

#[derive(Debug)]
pub enum ControlMessage {
    /// Seek: discard everything queued and in flight, keep the session.
    Flush,
    /// 1.0 is normal playback, 0.0 pauses, other values are trick play
    /// (drops disabled).
    SetSpeed(f64),
    /// Hot-swap to a new stream mid-playback.
    StreamChange(StreamParams),
    /// Re-anchor the shared clock, e.g. after an audio discontinuity.
    SynchronizeClock(i64),
    /// While paused, advance exactly one picture.
    StepFrame,
    /// Engage or clear pulldown correction.
    SetCadence(Option<CadenceSpec>),
    /// Policy override: allow drops even without a confirmed rate.
    AllowDrops(bool),
}

#[derive(Clone, Debug)]
pub struct PresentationConfig {
    pub session: SessionConfig,
    pub drop_policy: DropPolicyConfig,
    /// User-set audio/video delay applied to every target time.
    pub user_delay_us: i64,
    /// Fixed latency of the output path, added to every target time.
    pub output_latency_us: i64,
    /// Data units held in the loop's queue before `queue_unit` declines.
    pub max_queued_units: usize,
    /// Poll period while no wake event arrives.
    pub idle_cycle: Duration,
    /// A still frame is re-presented after this many nominal intervals
    /// without new output.
    pub still_repeat_factor: i64,
}

impl Default for PresentationConfig {
    fn default() -> Self {
        Self {
            session: Default::default(),
            drop_policy: Default::default(),
            user_delay_us: 0,
            output_latency_us: 0,
            max_queued_units: 32,
            idle_cycle: Duration::from_millis(10),
            still_repeat_factor: 4,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum LoopState {
    Running,
    Stopped,
    Error,
}

#[derive(Default)]
struct Queues {
    control: VecDeque<ControlMessage>,
    data: VecDeque<EncodedAccessUnit>,
}

#[derive(Default)]
struct SharedDiagnostics {
    framerate_mhz: AtomicU32,
    dropped_frames: AtomicU64,
    transient_faults: AtomicU64,
    bitrate_bps: AtomicU64,
    codec_name: Mutex<String>,
}

/// Point-in-time view of playback health.
#[derive(Clone, Debug)]
pub struct DiagnosticsSnapshot {
    pub codec_name: String,
    /// Measured frame rate, once detection has one.
    pub detected_fps: Option<f64>,
    pub dropped_frames: u64,
    pub transient_faults: u64,
    /// Input bitrate estimated from submitted bytes over their
    /// timestamp span.
    pub bitrate_bps: u64,
    pub queued_units: usize,
}

pub struct PresentationLoop {
    queues: Arc<Mutex<Queues>>,
    wake: Arc<EventFd>,
    state: Arc<Mutex<LoopState>>,
    diagnostics: Arc<SharedDiagnostics>,
    worker: Option<JoinHandle<()>>,
    max_queued_units: usize,
}

impl PresentationLoop {
    /// Opens a decoder session for `params` and starts the worker.
    /// Session open failures surface here, synchronously.
    pub fn start(
        candidates: Vec<Box<dyn CodecCandidate>>,
        params: StreamParams,
        sink: Arc<dyn RenderSink>,
        clock: Arc<dyn MediaClock>,
        config: PresentationConfig,
    ) -> Result<Self, SessionError> {
        let session = DecoderSession::open(&candidates, params.clone(), config.session.clone())?;

        let queues: Arc<Mutex<Queues>> = Default::default();
        let wake = Arc::new(
            EventFd::from_flags(EfdFlags::EFD_SEMAPHORE)
                .map_err(|err| SessionError::Backend(anyhow::Error::from(err).into()))?,
        );
        let state = Arc::new(Mutex::new(LoopState::Running));
        let diagnostics: Arc<SharedDiagnostics> = Default::default();
        *diagnostics.codec_name.lock().unwrap() = session.codec_name().to_owned();

        let max_queued_units = config.max_queued_units;
        let worker = {
            let queues = Arc::clone(&queues);
            let wake = Arc::clone(&wake);
            let state = Arc::clone(&state);
            let diagnostics = Arc::clone(&diagnostics);
            thread::spawn(move || {
                let mut worker = PresentationWorker {
                    session,
                    candidates,
                    params,
                    sink,
                    clock,
                    config,
                    queues,
                    wake,
                    state,
                    diagnostics,
                    estimator: RateEstimator::new(),
                    cadence: None,
                    policy: DropPolicy::default(),
                    speed: 1.0,
                    drops_override: false,
                    staged: None,
                    last_picture: None,
                    last_still_us: 0,
                    must_show_next: true,
                    step_pending: false,
                    eos_seen: false,
                    deinterlace_skipped: false,
                    bytes_submitted: 0,
                    first_unit_ts: None,
                    last_unit_ts: 0,
                };
                worker.run();
            })
        };

        Ok(Self {
            queues,
            wake,
            state,
            diagnostics,
            worker: Some(worker),
            max_queued_units,
        })
    }

    /// Queues one access unit. Returns false when the loop is stopped
    /// or backlogged; the caller keeps the unit and retries later.
    pub fn queue_unit(&self, unit: EncodedAccessUnit) -> bool {
        if *self.state.lock().unwrap() != LoopState::Running {
            return false;
        }
        {
            let mut queues = self.queues.lock().unwrap();
            if queues.data.len() >= self.max_queued_units {
                return false;
            }
            queues.data.push_back(unit);
        }
        let _ = self.wake.write(1);
        true
    }

    /// Queues a control message. Control is never declined and is
    /// processed before any queued data.
    pub fn control(&self, message: ControlMessage) {
        self.queues.lock().unwrap().control.push_back(message);
        let _ = self.wake.write(1);
    }

    pub fn is_alive(&self) -> bool {
        match &self.worker {
            Some(worker) => !worker.is_finished(),
            None => false,
        }
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        let fps = match self.diagnostics.framerate_mhz.load(Ordering::Relaxed) {
            0 => None,
            mhz => Some(mhz as f64 / 1000.0),
        };
        DiagnosticsSnapshot {
            codec_name: self.diagnostics.codec_name.lock().unwrap().clone(),
            detected_fps: fps,
            dropped_frames: self.diagnostics.dropped_frames.load(Ordering::Relaxed),
            transient_faults: self.diagnostics.transient_faults.load(Ordering::Relaxed),
            bitrate_bps: self.diagnostics.bitrate_bps.load(Ordering::Relaxed),
            queued_units: self.queues.lock().unwrap().data.len(),
        }
    }

    /// Stops the worker and joins it. Also runs on drop.
    pub fn stop(&mut self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == LoopState::Running {
                *state = LoopState::Stopped;
            }
        }
        let _ = self.wake.write(1);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.queues.lock().unwrap().data.clear();
    }
}

impl Drop for PresentationLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

struct PresentationWorker {
    session: DecoderSession,
    candidates: Vec<Box<dyn CodecCandidate>>,
    params: StreamParams,
    sink: Arc<dyn RenderSink>,
    clock: Arc<dyn MediaClock>,
    config: PresentationConfig,
    queues: Arc<Mutex<Queues>>,
    wake: Arc<EventFd>,
    state: Arc<Mutex<LoopState>>,
    diagnostics: Arc<SharedDiagnostics>,
    estimator: RateEstimator,
    cadence: Option<CadenceCorrector>,
    policy: DropPolicy,
    speed: f64,
    drops_override: bool,
    /// A picture the sink had no slot for; submitted before any new
    /// output is drained.
    staged: Option<(OutputPicture, i64)>,
    /// Clone of the newest presented picture, for still re-present.
    last_picture: Option<OutputPicture>,
    last_still_us: i64,
    /// The next picture must reach the screen (first after open, flush
    /// or stream change).
    must_show_next: bool,
    /// A StepFrame is waiting for its one picture.
    step_pending: bool,
    eos_seen: bool,
    deinterlace_skipped: bool,
    bytes_submitted: u64,
    first_unit_ts: Option<i64>,
    last_unit_ts: i64,
}

impl PresentationWorker {
    fn run(&mut self) {
        let epoll = match Epoll::new(EpollCreateFlags::empty()) {
            Ok(epoll) => epoll,
            Err(err) => {
                error!("failed to create epoll: {}", err);
                *self.state.lock().unwrap() = LoopState::Error;
                return;
            }
        };
        if let Err(err) = epoll.add(self.wake.as_fd(), EpollEvent::new(EpollFlags::EPOLLIN, 1)) {
            error!("failed to add wake event to epoll: {}", err);
            *self.state.lock().unwrap() = LoopState::Error;
            return;
        }

        while *self.state.lock().unwrap() == LoopState::Running {
            let mut events = [EpollEvent::empty()];
            let timeout = EpollTimeout::try_from(self.config.idle_cycle)
                .unwrap_or(EpollTimeout::NONE);
            match epoll.wait(&mut events, timeout) {
                Ok(_) => {
                    if events == [EpollEvent::new(EpollFlags::EPOLLIN, 1)] {
                        let _ = self.wake.read();
                    }
                }
                Err(err) => {
                    error!("epoll wait failed: {}", err);
                    *self.state.lock().unwrap() = LoopState::Error;
                    break;
                }
            }

            self.process_controls();
            if *self.state.lock().unwrap() != LoopState::Running {
                break;
            }
            // Paused: keep servicing control and the still frame, but
            // neither feed nor drain the decoder, unless a single-frame
            // step was requested.
            if self.speed != 0.0 || self.step_pending {
                self.pump_input();
                self.pump_output();
            }
            self.re_present_still();
            self.publish_diagnostics();
        }
        self.session.dispose();
    }

    fn process_controls(&mut self) {
        loop {
            let message = self.queues.lock().unwrap().control.pop_front();
            let Some(message) = message else { break };
            debug!("control: {:?}", message);
            match message {
                ControlMessage::Flush => self.flush(),
                ControlMessage::SetSpeed(speed) => self.speed = speed,
                ControlMessage::StreamChange(params) => self.stream_change(params),
                ControlMessage::StepFrame => self.step_pending = true,
                ControlMessage::SynchronizeClock(value) => self.clock.discontinuity(value),
                ControlMessage::SetCadence(spec) => {
                    self.cadence = spec.and_then(|spec| {
                        CadenceCorrector::new(&spec.pattern, spec.cycle_duration_us)
                    });
                }
                ControlMessage::AllowDrops(allow) => self.drops_override = allow,
            }
        }
    }

    /// Clears queued data and all decode and timing state; the session
    /// and its codec survive.
    fn flush(&mut self) {
        self.queues.lock().unwrap().data.clear();
        if let Err(err) = self.session.flush() {
            error!("flush failed: {}", err);
            *self.state.lock().unwrap() = LoopState::Error;
            return;
        }
        self.reset_timing();
    }

    fn reset_timing(&mut self) {
        self.estimator.reset();
        if let Some(cadence) = &mut self.cadence {
            cadence.reset();
        }
        self.policy.reset();
        self.staged = None;
        self.last_picture = None;
        self.must_show_next = true;
        self.step_pending = false;
        self.eos_seen = false;
        self.deinterlace_skipped = false;
        self.bytes_submitted = 0;
        self.first_unit_ts = None;
    }

    /// Swaps the decoder underneath the running loop. The old session
    /// must release the platform codec before the new one can claim it.
    fn stream_change(&mut self, params: StreamParams) {
        self.session.dispose();
        match DecoderSession::open(&self.candidates, params.clone(), self.config.session.clone())
        {
            Ok(session) => {
                *self.diagnostics.codec_name.lock().unwrap() = session.codec_name().to_owned();
                self.session = session;
                self.params = params;
                self.queues.lock().unwrap().data.clear();
                self.reset_timing();
            }
            Err(err) => {
                error!("stream change failed: {}", err);
                *self.state.lock().unwrap() = LoopState::Error;
            }
        }
    }

    /// Feeds the session: the parked unit first, then queued data until
    /// the decoder pushes back.
    fn pump_input(&mut self) {
        if self.session.state() == SessionState::EndOfStream {
            return;
        }
        if self.session.has_pending() {
            match self.session.retry_pending() {
                Ok(SubmitOutcome::Pending) => return,
                Ok(_) => (),
                Err(err) => {
                    self.input_error(err);
                    return;
                }
            }
        }
        loop {
            let unit = self.queues.lock().unwrap().data.pop_front();
            let Some(unit) = unit else { break };
            let bytes = unit.data.len() as u64;
            let ts = unit.pts.or(unit.dts);
            match self.session.submit(unit) {
                // Only units the session accepted count towards the
                // bitrate; a parked unit is accepted, it decodes later.
                Ok(SubmitOutcome::Queued) => self.account_unit(bytes, ts),
                Ok(SubmitOutcome::Pending) => {
                    self.account_unit(bytes, ts);
                    break;
                }
                Ok(SubmitOutcome::Rejected(unit)) => {
                    // Unreachable while we stop at Pending, but keep the
                    // unit either way; it will be popped again.
                    self.queues.lock().unwrap().data.push_front(unit);
                    break;
                }
                Err(err) => {
                    self.input_error(err);
                    break;
                }
            }
        }
    }

    fn input_error(&mut self, err: SessionError) {
        error!("decoder rejected input: {}", err);
        *self.state.lock().unwrap() = LoopState::Error;
    }

    fn account_unit(&mut self, bytes: u64, ts: Option<i64>) {
        self.bytes_submitted += bytes;
        if let Some(ts) = ts {
            if self.first_unit_ts.is_none() {
                self.first_unit_ts = Some(ts);
            }
            self.last_unit_ts = ts;
        }
        if let Some(first) = self.first_unit_ts {
            let span = self.last_unit_ts - first;
            if span > 0 {
                let bps = self.bytes_submitted * 8 * TIME_BASE_US as u64 / span as u64;
                self.diagnostics.bitrate_bps.store(bps, Ordering::Relaxed);
            }
        }
    }

    fn pump_output(&mut self) {
        // An earlier picture is still waiting for a render slot; it
        // goes first and gates further draining.
        if let Some((picture, target)) = self.staged.take() {
            if !self.try_submit(picture, target) {
                return;
            }
        }
        for _ in 0..MAX_DRAINS_PER_CYCLE {
            if self.staged.is_some() {
                break;
            }
            // A paused step ends as soon as its one picture is out.
            if self.speed == 0.0 && !self.step_pending {
                break;
            }
            match self.session.drain() {
                Ok(Drained::NoOutput) => break,
                Ok(Drained::FormatChanged(info)) => {
                    debug!(
                        "format changed: {}x{}",
                        info.display_size.width, info.display_size.height
                    );
                }
                Ok(Drained::EndOfStream) => {
                    self.eos_seen = true;
                    break;
                }
                Ok(Drained::Picture(picture)) => self.handle_picture(picture),
                Err(err) => {
                    error!("decoder failed: {}", err);
                    *self.state.lock().unwrap() = LoopState::Error;
                    break;
                }
            }
        }
    }

    /// The nominal frame interval: a confirmed measurement beats
    /// declared metadata, declared metadata beats an unconfirmed
    /// candidate.
    fn nominal_interval_us(&self) -> i64 {
        let measured = self.estimator.rate_mhz().and_then(interval_from_mhz);
        if self.estimator.is_confirmed() {
            if let Some(interval) = measured {
                return interval;
            }
        }
        self.params
            .declared_interval_us()
            .or(measured)
            .unwrap_or(DEFAULT_INTERVAL_US)
    }

    fn drops_permitted(&self) -> bool {
        if self.drops_override {
            return true;
        }
        if self.speed != 1.0 {
            return false;
        }
        self.estimator.is_confirmed() || self.params.declared_interval_us().is_some()
    }

    fn handle_picture(&mut self, mut picture: OutputPicture) {
        self.deinterlace_skipped =
            picture.flags.contains(crate::PictureFlags::DEINTERLACE_SKIPPED);

        // Cadence correction first, so every consumer downstream of it
        // sees smoothed timestamps.
        if let (Some(cadence), Some(pts)) = (self.cadence.as_mut(), picture.pts) {
            let corrected = cadence.correct(pts);
            picture.pts = Some(corrected.pts);
            picture.duration_us = corrected.duration_us;
        } else {
            picture.duration_us = self.nominal_interval_us();
        }
        if let Some(pts) = picture.pts {
            self.estimator.add(pts);
        }

        let interval = self.nominal_interval_us();
        let stats = self.sink.stats();
        let signals = self.policy.update(&CycleInputs {
            decoder_pts: picture.pts,
            rendered_pts: stats.rendered_pts,
            sleep_budget_us: stats.sleep_budget_us,
            free_render_slots: stats.free_slots,
            deinterlace_skipped: self.deinterlace_skipped,
            interval_us: interval,
            drops_permitted: self.drops_permitted(),
            must_not_skip: self.must_show_next,
            eos: self.eos_seen,
        });

        if signals.contains(DropSignals::VERYLATE) && !self.must_show_next {
            if let Some(pts) = picture.pts {
                self.policy.register_drop(pts, picture.duration_us.max(interval));
            }
            self.diagnostics.dropped_frames.store(self.policy.dropped_frames(), Ordering::Relaxed);
            picture.release(false);
            return;
        }

        let target = self.target_time(picture.pts);
        if !self.try_submit(picture, target) {
            warn!("render sink backlogged, staging picture");
        }
    }

    fn target_time(&self, pts: Option<i64>) -> i64 {
        let base = pts.unwrap_or_else(|| self.clock.now_us());
        base + self.config.user_delay_us + self.config.output_latency_us
    }

    /// Submits to the sink, staging the picture on backpressure.
    /// Returns whether it went through.
    fn try_submit(&mut self, picture: OutputPicture, target: i64) -> bool {
        if !self.sink.wait_for_slot(self.config.session.drain_timeout) {
            self.staged = Some((picture, target));
            return false;
        }
        self.last_picture = Some(picture.clone());
        self.last_still_us = self.clock.now_us();
        self.must_show_next = false;
        match self.sink.submit(picture, target) {
            Ok(()) => {
                self.step_pending = false;
                true
            }
            Err(err) => {
                // Slot vanished between the wait and the submit; the
                // clone we kept doubles as the retry copy.
                debug!("sink refused picture: {}", err);
                let retry = self.last_picture.clone();
                if let Some(picture) = retry {
                    self.staged = Some((picture, target));
                }
                false
            }
        }
    }

    /// With no new output flowing (pause, still menus, EOS), the last
    /// picture is re-presented periodically so the display holds it.
    fn re_present_still(&mut self) {
        let Some(last) = &self.last_picture else { return };
        let idle_gap = self.config.still_repeat_factor * self.nominal_interval_us();
        let now = self.clock.now_us();
        if now - self.last_still_us < idle_gap {
            return;
        }
        let showing_still = self.speed == 0.0
            || self.eos_seen
            || (!self.session.has_pending() && self.queues.lock().unwrap().data.is_empty());
        if !showing_still {
            return;
        }
        let mut again = last.clone();
        again.duration_us = idle_gap;
        self.last_still_us = now;
        let target = now + self.config.output_latency_us;
        if self.sink.wait_for_slot(Duration::ZERO) {
            if let Err(err) = self.sink.submit(again, target) {
                debug!("still re-present refused: {}", err);
            }
        }
    }

    fn publish_diagnostics(&self) {
        self.diagnostics
            .framerate_mhz
            .store(self.estimator.rate_mhz().unwrap_or(0), Ordering::Relaxed);
        self.diagnostics
            .transient_faults
            .store(self.session.transient_faults(), Ordering::Relaxed);
        self.diagnostics
            .dropped_frames
            .store(self.policy.dropped_frames(), Ordering::Relaxed);
    }
}
