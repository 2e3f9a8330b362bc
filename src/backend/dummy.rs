// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the
//! session and presentation loop run so we can test them in isolation.
//!
//! It models an indexed-buffer hardware queue: a fixed set of input
//! slots, a decode pipeline with configurable latency, and a fixed set
//! of output buffers that must be recycled before they can be reused.
//! Timestamps pass through decode untouched, so tests drive the timing
//! engine entirely from the input side.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use crate::backend::BackendError;
use crate::backend::CodecCandidate;
use crate::backend::CodecInstance;
use crate::backend::DecodedPictureDesc;
use crate::backend::InputSlot;
use crate::backend::OutputEvent;
use crate::backend::StreamInfo;
use crate::buffer_pool::OutputPicture;
use crate::renderer::RenderError;
use crate::renderer::RenderSink;
use crate::renderer::RenderStats;
use crate::CodecKind;
use crate::PictureFlags;
use crate::PixelLayout;

#[derive(Clone, Debug)]
pub struct DummyCodecConfig {
    pub input_slots: usize,
    pub slot_capacity: usize,
    pub num_output_buffers: usize,
    /// Number of units that must be queued behind a unit before it
    /// becomes ready on the output side. Zero means instant decode.
    pub decode_delay: usize,
    pub stream_info: StreamInfo,
}

impl Default for DummyCodecConfig {
    fn default() -> Self {
        Self {
            input_slots: 4,
            slot_capacity: 1 << 20,
            num_output_buffers: 8,
            decode_delay: 0,
            stream_info: StreamInfo {
                coded_size: (1920, 1088).into(),
                display_size: (1920, 1080).into(),
                interlaced: false,
                min_num_buffers: 4,
            },
        }
    }
}

/// Shared failure-injection knobs and call counters. Tests keep a clone
/// of the `Arc` and assert on it after driving the pipeline.
#[derive(Default)]
pub struct DummyScript {
    pub fail_instantiate: bool,
    pub fail_start: bool,
    /// Errors returned from `dequeue_output`, ahead of any real output.
    pub output_faults: VecDeque<BackendError>,
    pub started: u32,
    pub stopped: u32,
    pub flushed: u32,
    /// Every extradata blob passed to `prime_config`, in order.
    pub primed: Vec<Vec<u8>>,
    pub recycled_rendered: usize,
    pub recycled_discarded: usize,
}

pub struct DummyCandidate {
    name: String,
    codecs: Vec<CodecKind>,
    secure: bool,
    layouts: Vec<PixelLayout>,
    config: DummyCodecConfig,
    script: Arc<Mutex<DummyScript>>,
}

impl DummyCandidate {
    pub fn new(name: &str, codecs: &[CodecKind]) -> Self {
        Self {
            name: name.to_owned(),
            codecs: codecs.to_vec(),
            secure: false,
            layouts: vec![PixelLayout::NV12, PixelLayout::I420],
            config: Default::default(),
            script: Default::default(),
        }
    }

    pub fn secure(mut self) -> Self {
        self.secure = true;
        self
    }

    pub fn with_config(mut self, config: DummyCodecConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_layouts(mut self, layouts: &[PixelLayout]) -> Self {
        self.layouts = layouts.to_vec();
        self
    }

    pub fn script(&self) -> Arc<Mutex<DummyScript>> {
        Arc::clone(&self.script)
    }
}

impl CodecCandidate for DummyCandidate {
    fn name(&self) -> &str {
        &self.name
    }

    fn codecs(&self) -> &[CodecKind] {
        &self.codecs
    }

    fn secure(&self) -> bool {
        self.secure
    }

    fn layouts(&self) -> &[PixelLayout] {
        &self.layouts
    }

    fn instantiate(&self) -> Result<Box<dyn CodecInstance>, BackendError> {
        if self.script.lock().unwrap().fail_instantiate {
            return Err(BackendError::Unsupported);
        }
        Ok(Box::new(DummyInstance::new(
            self.name.clone(),
            self.config.clone(),
            Arc::clone(&self.script),
        )))
    }
}

struct QueuedUnit {
    input_index: usize,
    timestamp: i64,
    eos: bool,
}

pub struct DummyInstance {
    name: String,
    config: DummyCodecConfig,
    script: Arc<Mutex<DummyScript>>,
    running: bool,
    free_inputs: VecDeque<usize>,
    pipeline: VecDeque<QueuedUnit>,
    free_outputs: VecDeque<usize>,
    sent_format: bool,
}

impl DummyInstance {
    fn new(name: String, config: DummyCodecConfig, script: Arc<Mutex<DummyScript>>) -> Self {
        let free_inputs = (0..config.input_slots).collect();
        let free_outputs = (0..config.num_output_buffers).collect();
        Self {
            name,
            config,
            script,
            running: false,
            free_inputs,
            pipeline: VecDeque::new(),
            free_outputs,
            sent_format: false,
        }
    }

    /// A unit at the pipeline head is ready once enough units sit
    /// behind it, or once an EOS marker forces everything out.
    fn head_ready(&self) -> bool {
        if self.pipeline.is_empty() {
            return false;
        }
        self.pipeline.len() > self.config.decode_delay
            || self.pipeline.iter().any(|unit| unit.eos)
    }
}

impl CodecInstance for DummyInstance {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> Result<(), BackendError> {
        if self.script.lock().unwrap().fail_start {
            return Err(BackendError::Unsupported);
        }
        self.running = true;
        self.script.lock().unwrap().started += 1;
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
        self.script.lock().unwrap().stopped += 1;
    }

    fn prime_config(&mut self, extradata: &[u8]) -> Result<(), BackendError> {
        self.script.lock().unwrap().primed.push(extradata.to_vec());
        Ok(())
    }

    fn dequeue_input(&mut self, _timeout: Duration) -> Result<InputSlot, BackendError> {
        if !self.running {
            return Err(anyhow::anyhow!("dequeue_input on a stopped codec").into());
        }
        match self.free_inputs.pop_front() {
            Some(index) => Ok(InputSlot { index, capacity: self.config.slot_capacity }),
            None => Err(BackendError::Timeout),
        }
    }

    fn queue_input(
        &mut self,
        slot: InputSlot,
        payload: &[u8],
        timestamp: i64,
        eos: bool,
    ) -> Result<(), BackendError> {
        if payload.len() > slot.capacity {
            return Err(anyhow::anyhow!("payload exceeds slot capacity").into());
        }
        self.pipeline.push_back(QueuedUnit { input_index: slot.index, timestamp, eos });
        Ok(())
    }

    fn dequeue_output(&mut self, _timeout: Duration) -> Result<OutputEvent, BackendError> {
        if let Some(fault) = self.script.lock().unwrap().output_faults.pop_front() {
            return Err(fault);
        }
        if !self.head_ready() {
            return Err(BackendError::Timeout);
        }
        if self.pipeline.front().is_some_and(|unit| unit.eos) {
            let unit = self.pipeline.pop_front().unwrap();
            self.free_inputs.push_back(unit.input_index);
            return Ok(OutputEvent::EndOfStream);
        }
        if !self.sent_format {
            self.sent_format = true;
            return Ok(OutputEvent::FormatChanged(self.config.stream_info.clone()));
        }
        // An output buffer must be free before the head can leave the
        // pipeline. Starvation here is the consumer's backpressure.
        let Some(buffer_index) = self.free_outputs.pop_front() else {
            return Err(BackendError::Timeout);
        };
        let unit = self.pipeline.pop_front().unwrap();
        self.free_inputs.push_back(unit.input_index);
        let mut flags = PictureFlags::default();
        if self.config.stream_info.interlaced {
            flags |= PictureFlags::INTERLACED;
        }
        Ok(OutputEvent::Picture(DecodedPictureDesc { buffer_index, timestamp: unit.timestamp, flags }))
    }

    fn recycle_output(&mut self, buffer_index: usize, rendered: bool) {
        self.free_outputs.push_back(buffer_index);
        let mut script = self.script.lock().unwrap();
        if rendered {
            script.recycled_rendered += 1;
        } else {
            script.recycled_discarded += 1;
        }
    }

    fn flush(&mut self) -> Result<(), BackendError> {
        for unit in self.pipeline.drain(..) {
            self.free_inputs.push_back(unit.input_index);
        }
        self.free_outputs = (0..self.config.num_output_buffers).collect();
        self.script.lock().unwrap().flushed += 1;
        Ok(())
    }
}

struct SinkInner {
    capacity: usize,
    queue: VecDeque<(OutputPicture, i64)>,
    sleep_budget_us: i64,
    rendered_pts: Option<i64>,
    submitted: usize,
    targets: Vec<i64>,
}

/// Scripted render sink: holds submitted pictures in a bounded queue
/// until the test "displays" them, and reports whatever timing feedback
/// the test sets.
pub struct DummySink {
    inner: Mutex<SinkInner>,
}

impl DummySink {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(SinkInner {
                capacity,
                queue: VecDeque::new(),
                sleep_budget_us: 0,
                rendered_pts: None,
                submitted: 0,
                targets: Vec::new(),
            }),
        }
    }

    pub fn set_sleep_budget(&self, budget_us: i64) {
        self.inner.lock().unwrap().sleep_budget_us = budget_us;
    }

    /// Puts the oldest queued picture "on screen", releasing its handle
    /// as rendered. Returns its timestamp.
    pub fn render_next(&self) -> Option<i64> {
        let mut inner = self.inner.lock().unwrap();
        let (picture, _) = inner.queue.pop_front()?;
        let pts = picture.pts;
        picture.release(true);
        inner.rendered_pts = pts.or(inner.rendered_pts);
        pts
    }

    /// Total pictures ever submitted.
    pub fn submitted(&self) -> usize {
        self.inner.lock().unwrap().submitted
    }

    /// Target times of every submission, in order.
    pub fn targets(&self) -> Vec<i64> {
        self.inner.lock().unwrap().targets.clone()
    }

    pub fn queued(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }
}

impl RenderSink for DummySink {
    fn wait_for_slot(&self, _timeout: Duration) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.queue.len() < inner.capacity
    }

    fn submit(&self, picture: OutputPicture, target_time_us: i64) -> Result<(), RenderError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.queue.len() >= inner.capacity {
            return Err(RenderError::Busy);
        }
        inner.submitted += 1;
        inner.targets.push(target_time_us);
        inner.queue.push_back((picture, target_time_us));
        Ok(())
    }

    fn stats(&self) -> RenderStats {
        let inner = self.inner.lock().unwrap();
        RenderStats {
            sleep_budget_us: inner.sleep_budget_us,
            rendered_pts: inner.rendered_pts,
            free_slots: inner.capacity - inner.queue.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StreamParams;

    #[test]
    fn candidate_matching() {
        let candidate = DummyCandidate::new("dummy-h264", &[CodecKind::H264]);
        let mut params = StreamParams::new(CodecKind::H264, (1280, 720).into());
        assert!(candidate.matches(&params));

        params.secure = true;
        assert!(!candidate.matches(&params));

        let secure = DummyCandidate::new("dummy-h264-secure", &[CodecKind::H264]).secure();
        assert!(secure.matches(&params));

        params.codec = CodecKind::VP9;
        assert!(!secure.matches(&params));
    }

    #[test]
    fn decode_order_and_backpressure() {
        let candidate = DummyCandidate::new("dummy", &[CodecKind::H264]).with_config(
            DummyCodecConfig { input_slots: 2, decode_delay: 1, ..Default::default() },
        );
        let mut instance = candidate.instantiate().unwrap();
        instance.start().unwrap();

        let timeout = Duration::from_millis(1);

        // Nothing decoded yet.
        assert!(matches!(instance.dequeue_output(timeout), Err(BackendError::Timeout)));

        let slot = instance.dequeue_input(timeout).unwrap();
        instance.queue_input(slot, b"a", 0, false).unwrap();
        // decode_delay of one: the first unit is not ready on its own.
        assert!(matches!(instance.dequeue_output(timeout), Err(BackendError::Timeout)));

        let slot = instance.dequeue_input(timeout).unwrap();
        instance.queue_input(slot, b"b", 40_000, false).unwrap();
        // Both input slots are in flight now.
        assert!(matches!(instance.dequeue_input(timeout), Err(BackendError::Timeout)));

        assert!(matches!(instance.dequeue_output(timeout), Ok(OutputEvent::FormatChanged(_))));
        match instance.dequeue_output(timeout) {
            Ok(OutputEvent::Picture(desc)) => assert_eq!(desc.timestamp, 0),
            other => panic!("expected a picture, got {:?}", other),
        }
        // Popping the head returned its input slot.
        assert!(instance.dequeue_input(timeout).is_ok());
    }

    #[test]
    fn eos_flushes_pipeline() {
        let candidate = DummyCandidate::new("dummy", &[CodecKind::H264]).with_config(
            DummyCodecConfig { decode_delay: 2, ..Default::default() },
        );
        let mut instance = candidate.instantiate().unwrap();
        instance.start().unwrap();

        let timeout = Duration::from_millis(1);
        let slot = instance.dequeue_input(timeout).unwrap();
        instance.queue_input(slot, b"a", 0, false).unwrap();
        let slot = instance.dequeue_input(timeout).unwrap();
        instance.queue_input(slot, &[], 0, true).unwrap();

        assert!(matches!(instance.dequeue_output(timeout), Ok(OutputEvent::FormatChanged(_))));
        assert!(matches!(instance.dequeue_output(timeout), Ok(OutputEvent::Picture(_))));
        assert!(matches!(instance.dequeue_output(timeout), Ok(OutputEvent::EndOfStream)));
    }
}
