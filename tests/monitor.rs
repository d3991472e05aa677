//! Behavioral tests for the identity monitor, driven by a scripted stub
//! engine under paused tokio time so every timer assertion is exact.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use image::DynamicImage;
use invigil::config::MonitorConfig;
use invigil::engine::{EngineError, FaceEngine, FrameSource};
use invigil::state::{MonitorPhase, MonitorSnapshot};
use invigil::{Embedding, IdentityMonitor, ReferenceSource};
use tokio::time::{sleep, Instant};

#[derive(Clone)]
enum Script {
    /// Return a face whose embedding sits at the given distance from the
    /// all-zero reference embedding.
    Face(Vec<f32>),
    NoFace,
    Fail,
}

fn reference_face() -> Script {
    Script::Face(vec![0.0, 0.0])
}

fn face_at(distance: f32) -> Script {
    Script::Face(vec![distance, 0.0])
}

struct StubEngine {
    script: Mutex<VecDeque<Script>>,
    delays: Mutex<VecDeque<Duration>>,
    default_delay: Duration,
    fail_load: bool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: Mutex<Vec<Instant>>,
}

impl StubEngine {
    fn new(script: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            delays: Mutex::new(VecDeque::new()),
            default_delay: Duration::ZERO,
            fail_load: false,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn failing_load() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            delays: Mutex::new(VecDeque::new()),
            default_delay: Duration::ZERO,
            fail_load: true,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn slow(script: Vec<Script>, default_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            delays: Mutex::new(VecDeque::new()),
            default_delay,
            fail_load: false,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Per-call delays consumed in order; later calls fall back to the
    /// default delay.
    fn set_delays(&self, delays: Vec<Duration>) {
        *self.delays.lock().unwrap() = delays.into();
    }

    fn detect_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn call_offsets(&self, start: Instant) -> Vec<Duration> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.duration_since(start))
            .collect()
    }

    fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FaceEngine for StubEngine {
    async fn load_models(&self) -> Result<(), EngineError> {
        if self.fail_load {
            Err(EngineError::ModelLoad("stub load failure".to_string()))
        } else {
            Ok(())
        }
    }

    async fn detect_single_face(
        &self,
        _image: DynamicImage,
    ) -> Result<Option<Embedding>, EngineError> {
        let n = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(n, Ordering::SeqCst);
        self.calls.lock().unwrap().push(Instant::now());

        let delay = self
            .delays
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.default_delay);
        if !delay.is_zero() {
            sleep(delay).await;
        }

        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(reference_face);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            Script::Face(vector) => Ok(Some(Embedding { vector })),
            Script::NoFace => Ok(None),
            Script::Fail => Err(EngineError::Detection("stub detection failure".to_string())),
        }
    }

    fn distance(&self, a: &Embedding, b: &Embedding) -> f32 {
        a.vector
            .iter()
            .zip(b.vector.iter())
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt()
    }
}

struct Frames(Mutex<Option<DynamicImage>>);

impl Frames {
    fn present() -> Arc<Self> {
        Arc::new(Self(Mutex::new(Some(DynamicImage::new_rgb8(8, 8)))))
    }

    fn absent() -> Arc<Self> {
        Arc::new(Self(Mutex::new(None)))
    }

    fn set_present(&self) {
        *self.0.lock().unwrap() = Some(DynamicImage::new_rgb8(8, 8));
    }
}

impl FrameSource for Frames {
    fn current_frame(&self) -> Option<DynamicImage> {
        self.0.lock().unwrap().clone()
    }
}

fn test_config(interval_ms: u64) -> MonitorConfig {
    MonitorConfig {
        enabled: true,
        check_interval: Duration::from_millis(interval_ms),
        initial_delay: Duration::from_millis(3000),
        match_threshold: 0.6,
        reference: Some(ReferenceSource::Image(DynamicImage::new_rgb8(8, 8))),
    }
}

#[tokio::test(start_paused = true)]
async fn disabled_monitor_never_checks() {
    let engine = StubEngine::new(vec![]);
    let mut cfg = test_config(1000);
    cfg.enabled = false;

    let monitor = IdentityMonitor::start(cfg, engine.clone(), Frames::present());
    sleep(Duration::from_secs(60)).await;

    assert_eq!(engine.detect_calls(), 0);
    assert_eq!(monitor.snapshot(), MonitorSnapshot::initial());
}

#[tokio::test(start_paused = true)]
async fn model_load_failure_is_terminal() {
    let engine = StubEngine::failing_load();
    let monitor = IdentityMonitor::start(test_config(1000), engine.clone(), Frames::present());
    sleep(Duration::from_secs(60)).await;

    let snapshot = monitor.snapshot();
    assert_eq!(snapshot.phase, MonitorPhase::ModelsFailed);
    assert!(!snapshot.models_loaded);
    assert!(snapshot.result.error.as_deref().unwrap().contains("model load failed"));
    assert_eq!(engine.detect_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn faceless_reference_disables_verification() {
    let engine = StubEngine::new(vec![Script::NoFace]);
    let monitor = IdentityMonitor::start(test_config(1000), engine.clone(), Frames::present());
    sleep(Duration::from_secs(60)).await;

    let snapshot = monitor.snapshot();
    assert_eq!(snapshot.phase, MonitorPhase::ReferenceFailed);
    assert!(!snapshot.has_reference);
    assert!(snapshot
        .result
        .error
        .as_deref()
        .unwrap()
        .contains("no face in reference image"));
    // Only the reference attempt ever touched the engine.
    assert_eq!(engine.detect_calls(), 1);
    assert_eq!(monitor.mismatch_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn checks_fire_at_initial_delay_then_every_interval() {
    let start = Instant::now();
    let engine = StubEngine::new(vec![reference_face()]);
    let monitor = IdentityMonitor::start(test_config(1000), engine.clone(), Frames::present());

    sleep(Duration::from_millis(5500)).await;
    monitor.shutdown().await;

    let offsets = engine.call_offsets(start);
    // Reference acquisition at t=0, then checks at 3000, 4000, 5000.
    assert_eq!(offsets.len(), 4);
    assert_eq!(offsets[0], Duration::from_millis(0));
    assert_eq!(offsets[1], Duration::from_millis(3000));
    assert_eq!(offsets[2], Duration::from_millis(4000));
    assert_eq!(offsets[3], Duration::from_millis(5000));
}

#[tokio::test(start_paused = true)]
async fn mismatch_counter_increments_exactly_once_per_failing_cycle() {
    let engine = StubEngine::new(vec![
        reference_face(),
        face_at(0.2),  // match
        Script::NoFace, // +1
        face_at(0.9),  // +1
        Script::Fail,  // error cycle, no increment
        face_at(0.1),  // match
    ]);
    let monitor = IdentityMonitor::start(test_config(1000), engine.clone(), Frames::present());

    sleep(Duration::from_millis(3500)).await;
    let s = monitor.snapshot();
    assert!(s.result.is_match);
    assert!((s.result.confidence - 0.8).abs() < 1e-5);
    assert_eq!(s.mismatch_count, 0);

    sleep(Duration::from_millis(1000)).await;
    let s = monitor.snapshot();
    assert!(!s.result.is_match);
    assert!(!s.result.face_detected);
    assert_eq!(s.mismatch_count, 1);

    sleep(Duration::from_millis(1000)).await;
    let s = monitor.snapshot();
    assert!(!s.result.is_match);
    assert!((s.result.confidence - 0.1).abs() < 1e-5);
    assert_eq!(s.mismatch_count, 2);

    // Detection exception: error recorded, previous match state stays
    // visible as stale, counter untouched.
    sleep(Duration::from_millis(1000)).await;
    let s = monitor.snapshot();
    assert!(s.result.error.as_deref().unwrap().contains("stub detection failure"));
    assert!(!s.result.is_match);
    assert_eq!(s.mismatch_count, 2);

    sleep(Duration::from_millis(1000)).await;
    let s = monitor.snapshot();
    assert!(s.result.is_match);
    assert_eq!(s.mismatch_count, 2);

    monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn match_threshold_is_strict() {
    let engine = StubEngine::new(vec![reference_face(), face_at(0.3), face_at(0.6)]);
    let monitor = IdentityMonitor::start(test_config(1000), engine.clone(), Frames::present());

    sleep(Duration::from_millis(3500)).await;
    let s = monitor.snapshot();
    assert!(s.result.is_match);
    assert!((s.result.confidence - 0.7).abs() < 1e-5);

    // Distance exactly at the threshold is not a match.
    sleep(Duration::from_millis(1000)).await;
    let s = monitor.snapshot();
    assert!(!s.result.is_match);
    assert!((s.result.confidence - 0.4).abs() < 1e-5);
    assert_eq!(s.mismatch_count, 1);

    monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn checks_never_overlap() {
    // Every detection takes 2.5 intervals; the in-flight counter must
    // still never exceed one.
    let engine = StubEngine::slow(vec![], Duration::from_millis(2500));
    let monitor = IdentityMonitor::start(test_config(1000), engine.clone(), Frames::present());

    sleep(Duration::from_secs(20)).await;
    monitor.shutdown().await;

    assert!(engine.detect_calls() > 3);
    assert_eq!(engine.max_concurrency(), 1);
}

#[tokio::test(start_paused = true)]
async fn overrunning_check_skips_ticks_until_the_next_aligned_one() {
    let start = Instant::now();
    let engine = StubEngine::new(vec![reference_face(), face_at(0.1), face_at(0.1)]);
    // Reference resolves instantly; the first live check takes 2.5 s.
    engine.set_delays(vec![
        Duration::ZERO,
        Duration::from_millis(2500),
        Duration::ZERO,
    ]);
    let monitor = IdentityMonitor::start(test_config(1000), engine.clone(), Frames::present());

    sleep(Duration::from_millis(6500)).await;
    monitor.shutdown().await;

    let offsets = engine.call_offsets(start);
    // Check one runs 3000..5500; the 4000 and 5000 ticks are skipped and
    // the next check lands on the aligned 6000 tick.
    assert_eq!(offsets[0], Duration::from_millis(0));
    assert_eq!(offsets[1], Duration::from_millis(3000));
    assert_eq!(offsets[2], Duration::from_millis(6000));
}

#[tokio::test(start_paused = true)]
async fn no_checks_until_a_frame_exists_then_schedule_resumes() {
    let engine = StubEngine::new(vec![reference_face()]);
    let frames = Frames::absent();
    let monitor = IdentityMonitor::start(test_config(1000), engine.clone(), frames.clone());

    sleep(Duration::from_secs(10)).await;
    // Reference was acquired, but no live check could run.
    assert_eq!(engine.detect_calls(), 1);
    assert!(monitor.snapshot().result.last_checked.is_none());

    frames.set_present();
    sleep(Duration::from_millis(1500)).await;
    assert!(engine.detect_calls() >= 2);
    assert!(monitor.snapshot().result.last_checked.is_some());

    monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn teardown_discards_a_check_that_resolves_late() {
    let engine = StubEngine::slow(vec![reference_face(), Script::NoFace], Duration::ZERO);
    engine.set_delays(vec![Duration::ZERO, Duration::from_millis(5000)]);
    let monitor = IdentityMonitor::start(test_config(1000), engine.clone(), Frames::present());

    // First check starts at 3000 and will not resolve before 8000.
    sleep(Duration::from_millis(4000)).await;
    assert_eq!(engine.detect_calls(), 2);
    let before = monitor.snapshot();
    assert_eq!(before.phase, MonitorPhase::Checking);

    monitor.shutdown().await;

    // The no-face outcome resolved after teardown and must change nothing.
    let after = monitor.snapshot();
    assert_eq!(after.phase, MonitorPhase::Disposed);
    assert_eq!(after.result, before.result);
    assert_eq!(after.mismatch_count, 0);
    assert!(after.result.last_checked.is_none());
    // The accessor reports the frozen published count, never a counter the
    // late check may have touched.
    assert_eq!(monitor.mismatch_count(), after.mismatch_count);
}

#[tokio::test(start_paused = true)]
async fn reference_change_during_slow_acquisition_never_leaves_a_stale_profile() {
    // The initial acquisition is still in flight when the source changes;
    // the replacement photo has no detectable face. Outcomes resolve in
    // completion order: the new source first, the superseded one later.
    let engine = StubEngine::new(vec![Script::NoFace, reference_face()]);
    engine.set_delays(vec![Duration::from_millis(2000), Duration::ZERO]);
    let monitor = IdentityMonitor::start(test_config(1000), engine.clone(), Frames::present());

    sleep(Duration::from_millis(500)).await;
    monitor
        .set_reference_source(ReferenceSource::Image(DynamicImage::new_rgb8(4, 4)))
        .await;

    let s = monitor.snapshot();
    assert_eq!(s.phase, MonitorPhase::ReferenceFailed);
    assert!(!s.has_reference);

    // The first acquisition succeeds at t=2000 against a source that no
    // longer owns the slot; it must be discarded, so no embedding exists
    // and no check ever runs.
    sleep(Duration::from_secs(10)).await;
    let s = monitor.snapshot();
    assert_eq!(s.phase, MonitorPhase::ReferenceFailed);
    assert!(!s.has_reference);
    assert!(s.result.last_checked.is_none());
    assert_eq!(engine.detect_calls(), 2);
    assert_eq!(monitor.mismatch_count(), 0);

    monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn changing_the_reference_source_reacquires_and_arms_the_schedule() {
    let engine = StubEngine::new(vec![reference_face()]);
    let mut cfg = test_config(1000);
    cfg.reference = None;
    let monitor = IdentityMonitor::start(cfg, engine.clone(), Frames::present());

    sleep(Duration::from_secs(10)).await;
    // No reference configured: verification never started.
    assert_eq!(engine.detect_calls(), 0);
    assert_eq!(monitor.snapshot().phase, MonitorPhase::AwaitingReference);

    monitor
        .set_reference_source(ReferenceSource::Image(DynamicImage::new_rgb8(8, 8)))
        .await;
    assert!(monitor.snapshot().has_reference);

    sleep(Duration::from_millis(1500)).await;
    assert!(engine.detect_calls() >= 2);
    assert!(monitor.snapshot().result.last_checked.is_some());

    monitor.shutdown().await;
}
