// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End-to-end decode-and-present runs over the dummy codec: a full
//! [`PresentationLoop`] with a scripted render sink and a manual clock.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use bytes::Bytes;

use cros_playback::backend::dummy::DummyCandidate;
use cros_playback::backend::dummy::DummySink;
use cros_playback::backend::CodecCandidate;
use cros_playback::clock::ManualClock;
use cros_playback::presentation::CadenceSpec;
use cros_playback::presentation::ControlMessage;
use cros_playback::presentation::PresentationLoop;
use cros_playback::renderer::RenderSink;
use cros_playback::CodecKind;
use cros_playback::EncodedAccessUnit;
use cros_playback::StreamParams;

/// The platform codec is process-wide exclusive, so tests that open a
/// session take this lock.
fn exclusive_codec() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn candidates() -> Vec<Box<dyn CodecCandidate>> {
    vec![Box::new(DummyCandidate::new("dummy-h264", &[CodecKind::H264]))]
}

fn unit(pts: i64) -> EncodedAccessUnit {
    EncodedAccessUnit::new(Bytes::from_static(b"access unit payload"), Some(pts))
}

fn params_25fps() -> StreamParams {
    let mut params = StreamParams::new(CodecKind::H264, (1920, 1080).into());
    params.declared_fps = Some(25.0);
    params
}

/// Queues with retry so queue backpressure does not fail the test.
fn feed(pipeline: &PresentationLoop, unit: EncodedAccessUnit) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !pipeline.queue_unit(unit.clone()) {
        assert!(Instant::now() < deadline, "pipeline never accepted the unit");
        thread::sleep(Duration::from_millis(1));
    }
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

#[test]
fn smooth_stream_plays_without_drops() {
    let _lock = exclusive_codec();
    let _ = env_logger::builder().is_test(true).try_init();

    let sink = Arc::new(DummySink::new(8));
    let clock = Arc::new(ManualClock::new(0));
    let pipeline = PresentationLoop::start(
        candidates(),
        params_25fps(),
        Arc::clone(&sink) as Arc<dyn RenderSink>,
        clock,
        Default::default(),
    )
    .unwrap();

    let total = 70;
    for i in 0..total {
        feed(&pipeline, unit(i as i64 * 40_000));
        // Keep the display consuming while we feed.
        sink.render_next();
    }
    assert!(wait_until(Duration::from_secs(10), || {
        sink.render_next();
        sink.submitted() >= total
    }));

    assert_eq!(sink.submitted(), total);
    assert_eq!(sink.targets()[..3], [0, 40_000, 80_000]);

    let diagnostics = pipeline.diagnostics();
    assert_eq!(diagnostics.dropped_frames, 0);
    // 70 samples crossed the detection window: the measured rate is up.
    assert_eq!(diagnostics.detected_fps, Some(25.0));
    assert_eq!(diagnostics.codec_name, "dummy-h264");
    assert!(diagnostics.bitrate_bps > 0);
}

#[test]
fn late_playback_drops_but_does_not_cascade() {
    let _lock = exclusive_codec();

    let sink = Arc::new(DummySink::new(8));
    let clock = Arc::new(ManualClock::new(0));
    let pipeline = PresentationLoop::start(
        candidates(),
        params_25fps(),
        Arc::clone(&sink) as Arc<dyn RenderSink>,
        clock,
        Default::default(),
    )
    .unwrap();

    // Ten frames of smooth playback first.
    for i in 0..10 {
        feed(&pipeline, unit(i * 40_000));
        sink.render_next();
    }
    assert!(wait_until(Duration::from_secs(10), || {
        sink.render_next();
        sink.submitted() >= 10
    }));

    // Then the renderer falls five frames behind schedule.
    sink.set_sleep_budget(-200_000);
    let total: usize = 40;
    for i in 10..total {
        feed(&pipeline, unit(i as i64 * 40_000));
        sink.render_next();
    }
    assert!(wait_until(Duration::from_secs(10), || {
        sink.render_next();
        sink.submitted() as u64 + pipeline.diagnostics().dropped_frames >= total as u64
    }));

    let diagnostics = pipeline.diagnostics();
    assert!(diagnostics.dropped_frames > 0, "a late stream must shed frames");
    // The gain ledger credits every drop until the renderer catches up,
    // so lateness must not turn into dropping everything.
    assert!(sink.submitted() > 10, "drops cascaded: only {} shown", sink.submitted());
}

#[test]
fn end_of_stream_shows_every_picture() {
    let _lock = exclusive_codec();

    let sink = Arc::new(DummySink::new(8));
    let clock = Arc::new(ManualClock::new(0));
    let pipeline = PresentationLoop::start(
        candidates(),
        params_25fps(),
        Arc::clone(&sink) as Arc<dyn RenderSink>,
        clock,
        Default::default(),
    )
    .unwrap();

    for i in 0..5 {
        feed(&pipeline, unit(i * 40_000));
    }
    feed(&pipeline, EncodedAccessUnit::end_of_stream());

    assert!(wait_until(Duration::from_secs(10), || {
        sink.render_next();
        sink.submitted() >= 5
    }));
    assert_eq!(sink.submitted(), 5);
    // The loop holds the last picture rather than tearing down.
    assert!(pipeline.is_alive());
}

#[test]
fn render_backpressure_stages_pictures() {
    let _lock = exclusive_codec();

    // A single render slot: every second picture must wait for the
    // display to move on.
    let sink = Arc::new(DummySink::new(1));
    let clock = Arc::new(ManualClock::new(0));
    let pipeline = PresentationLoop::start(
        candidates(),
        params_25fps(),
        Arc::clone(&sink) as Arc<dyn RenderSink>,
        clock,
        Default::default(),
    )
    .unwrap();

    let total = 6;
    for i in 0..total {
        feed(&pipeline, unit(i as i64 * 40_000));
    }
    assert!(wait_until(Duration::from_secs(10), || {
        if sink.queued() > 0 {
            sink.render_next();
        }
        sink.submitted() >= total
    }));
    assert_eq!(sink.submitted(), total);
}

#[test]
fn pause_re_presents_the_still_frame() {
    let _lock = exclusive_codec();

    let sink = Arc::new(DummySink::new(4));
    // The clock handle shares state with its clones, so the test keeps
    // one side to advance time with.
    let clock = ManualClock::new(0);
    let pipeline = PresentationLoop::start(
        candidates(),
        params_25fps(),
        Arc::clone(&sink) as Arc<dyn RenderSink>,
        Arc::new(clock.clone()),
        Default::default(),
    )
    .unwrap();

    feed(&pipeline, unit(0));
    assert!(wait_until(Duration::from_secs(5), || sink.submitted() >= 1));
    pipeline.control(ControlMessage::SetSpeed(0.0));
    sink.render_next();

    // Past the still-repeat horizon (4 nominal intervals at 25fps).
    clock.advance(400_000);
    assert!(
        wait_until(Duration::from_secs(5), || sink.submitted() >= 2),
        "paused playback must keep re-presenting the held frame"
    );
}

#[test]
fn step_frame_advances_one_picture_while_paused() {
    let _lock = exclusive_codec();

    let sink = Arc::new(DummySink::new(4));
    let clock = Arc::new(ManualClock::new(0));
    let pipeline = PresentationLoop::start(
        candidates(),
        params_25fps(),
        Arc::clone(&sink) as Arc<dyn RenderSink>,
        clock,
        Default::default(),
    )
    .unwrap();

    pipeline.control(ControlMessage::SetSpeed(0.0));
    thread::sleep(Duration::from_millis(50));
    for i in 0..3 {
        feed(&pipeline, unit(i * 40_000));
    }
    thread::sleep(Duration::from_millis(50));
    assert_eq!(sink.submitted(), 0);

    pipeline.control(ControlMessage::StepFrame);
    assert!(wait_until(Duration::from_secs(5), || sink.submitted() == 1));
    // Exactly one: the next decoded picture stays put until asked for.
    thread::sleep(Duration::from_millis(50));
    assert_eq!(sink.submitted(), 1);

    pipeline.control(ControlMessage::StepFrame);
    assert!(wait_until(Duration::from_secs(5), || sink.submitted() == 2));
}

#[test]
fn pulldown_cadence_smooths_targets() {
    let _lock = exclusive_codec();

    let sink = Arc::new(DummySink::new(8));
    let clock = Arc::new(ManualClock::new(0));
    let pipeline = PresentationLoop::start(
        candidates(),
        params_25fps(),
        Arc::clone(&sink) as Arc<dyn RenderSink>,
        clock,
        Default::default(),
    )
    .unwrap();

    // 2:3 pulldown over a 59.94Hz field clock.
    let field = 16_683;
    let cycle = 5 * field;
    pipeline.control(ControlMessage::SetCadence(Some(CadenceSpec {
        pattern: vec![2, 3],
        cycle_duration_us: cycle,
    })));
    thread::sleep(Duration::from_millis(50));

    // Raw timestamps with field-snapping jitter.
    feed(&pipeline, unit(0));
    feed(&pipeline, unit(2 * field + 1));
    feed(&pipeline, unit(cycle));
    feed(&pipeline, unit(cycle + 2 * field - 1));

    assert!(wait_until(Duration::from_secs(10), || {
        sink.render_next();
        sink.submitted() >= 4
    }));
    let short = cycle * 2 / 5;
    assert_eq!(sink.targets(), vec![0, short, cycle, cycle + short]);
}
