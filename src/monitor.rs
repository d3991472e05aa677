//! The identity monitor: owns the reference profile for one interview
//! session and periodically compares the live frame against it.
//!
//! One instance per session; create at call start, shut down at call end.
//! All output is published through a watch channel snapshot — the monitor
//! never returns errors across its public boundary.
//!
//! Scheduling: once models, reference and frames are all available, the
//! first check fires after `initial_delay`, then every `check_interval`.
//! A tick that fires while a check is still running is skipped, never
//! queued; after an overrunning check the next one lands on the next
//! aligned tick.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::MonitorConfig;
use crate::engine::{FaceEngine, FrameSource};
use crate::reference::{self, ReferenceSource};
use crate::state::{MonitorPhase, MonitorSnapshot, VerificationResult};
use invigil_vision::Embedding;

pub struct IdentityMonitor {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    rx: watch::Receiver<MonitorSnapshot>,
}

struct Shared {
    session_id: String,
    cfg: MonitorConfig,
    engine: Arc<dyn FaceEngine>,
    frames: Arc<dyn FrameSource>,
    tx: watch::Sender<MonitorSnapshot>,
    /// Mutual-exclusion flag: at most one check in flight.
    checking: AtomicBool,
    /// Set on teardown; checked before every state mutation.
    disposed: AtomicBool,
    mismatches: AtomicU32,
    reference: Mutex<ReferenceSlot>,
}

struct ReferenceSlot {
    source: Option<ReferenceSource>,
    embedding: Option<Embedding>,
    /// Bumped on every source change; an acquisition only lands if the
    /// generation it started under is still current.
    generation: u64,
}

/// Releases the mutual-exclusion flag on every exit path.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl IdentityMonitor {
    /// Create a monitor for one session and spawn its scheduler. When the
    /// config is disabled no task is spawned and the snapshot never leaves
    /// its initial value.
    pub fn start(
        cfg: MonitorConfig,
        engine: Arc<dyn FaceEngine>,
        frames: Arc<dyn FrameSource>,
    ) -> Self {
        let session_id = Uuid::new_v4().to_string();
        let (tx, rx) = watch::channel(MonitorSnapshot::initial());
        let shared = Arc::new(Shared {
            session_id,
            reference: Mutex::new(ReferenceSlot {
                source: cfg.reference.clone(),
                embedding: None,
                generation: 0,
            }),
            cfg,
            engine,
            frames,
            tx,
            checking: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            mismatches: AtomicU32::new(0),
        });
        let cancel = CancellationToken::new();

        let task = if shared.cfg.enabled {
            info!("identity monitor {} starting", shared.session_id);
            let shared = Arc::clone(&shared);
            let token = cancel.clone();
            Some(tokio::spawn(async move { run(shared, token).await }))
        } else {
            info!(
                "identity monitor {} disabled, no checks will run",
                shared.session_id
            );
            None
        };

        Self {
            shared,
            cancel,
            task: Mutex::new(task),
            rx,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    /// Subscribe to snapshot updates.
    pub fn subscribe(&self) -> watch::Receiver<MonitorSnapshot> {
        self.rx.clone()
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        self.rx.borrow().clone()
    }

    /// Mismatch count as published. Read from the snapshot rather than the
    /// internal counter so the value stays frozen after teardown even if a
    /// late-resolving check bumps the counter.
    pub fn mismatch_count(&self) -> u32 {
        self.rx.borrow().mismatch_count
    }

    /// Point the monitor at a different registered photo. A no-op when the
    /// source is unchanged; otherwise the reference is re-acquired (which
    /// also recovers from an earlier `ReferenceFailed`).
    pub async fn set_reference_source(&self, source: ReferenceSource) {
        if self.shared.disposed.load(Ordering::SeqCst) {
            return;
        }

        let generation = {
            let mut slot = self.shared.reference.lock().await;
            match &slot.source {
                Some(current) if same_source(current, &source) => None,
                _ => {
                    slot.source = Some(source.clone());
                    slot.embedding = None;
                    slot.generation += 1;
                    Some(slot.generation)
                }
            }
        };
        let Some(generation) = generation else {
            debug!(
                "monitor {}: reference source unchanged, keeping profile",
                self.shared.session_id
            );
            return;
        };

        let models_loaded = self.rx.borrow().models_loaded;
        self.shared.publish(|s| {
            s.has_reference = false;
            if s.models_loaded {
                s.phase = MonitorPhase::AwaitingReference;
            }
        });
        if models_loaded {
            self.shared.acquire_reference(&source, generation).await;
        }
    }

    /// Tear the monitor down: cancel the timers and wait for the scheduler
    /// to exit. An in-flight check may still resolve but publishes nothing.
    pub async fn shutdown(&self) {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.shared
            .tx
            .send_modify(|s| s.phase = MonitorPhase::Disposed);
        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(
                    "monitor {}: scheduler task join failed: {e}",
                    self.shared.session_id
                );
            }
        }
        info!("identity monitor {} stopped", self.shared.session_id);
    }
}

impl Drop for IdentityMonitor {
    fn drop(&mut self) {
        self.shared.disposed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

fn same_source(a: &ReferenceSource, b: &ReferenceSource) -> bool {
    match (a, b) {
        (ReferenceSource::Url(x), ReferenceSource::Url(y)) => x == y,
        (ReferenceSource::Path(x), ReferenceSource::Path(y)) => x == y,
        // In-memory images are always treated as new material.
        _ => false,
    }
}

impl Shared {
    fn publish(&self, f: impl FnOnce(&mut MonitorSnapshot)) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        self.tx.send_modify(f);
    }

    /// Acquire the reference embedding for `source`. The outcome is dropped
    /// when the slot generation moved on while the acquisition was in
    /// flight: a newer source owns the slot by then.
    async fn acquire_reference(&self, source: &ReferenceSource, generation: u64) {
        let outcome = reference::acquire(self.engine.as_ref(), source).await;

        let mut slot = self.reference.lock().await;
        if slot.generation != generation {
            debug!(
                "monitor {}: discarding superseded reference acquisition",
                self.session_id
            );
            return;
        }
        match outcome {
            Ok(embedding) => {
                slot.embedding = Some(embedding);
                drop(slot);
                self.publish(|s| {
                    s.has_reference = true;
                    s.phase = MonitorPhase::Ready;
                });
            }
            Err(e) => {
                drop(slot);
                warn!(
                    "monitor {}: reference acquisition failed: {e}",
                    self.session_id
                );
                let msg = e.to_string();
                self.publish(|s| {
                    s.phase = MonitorPhase::ReferenceFailed;
                    s.result.error = Some(msg);
                });
            }
        }
    }

    /// One verification cycle. Unmet preconditions make this a silent
    /// no-op, not an error.
    async fn run_check(&self) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        let Some(reference) = self.reference.lock().await.embedding.clone() else {
            debug!(
                "monitor {}: skipping check, reference not loaded",
                self.session_id
            );
            return;
        };
        let Some(frame) = self.frames.current_frame() else {
            debug!(
                "monitor {}: skipping check, no video frame yet",
                self.session_id
            );
            return;
        };
        if self
            .checking
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(
                "monitor {}: skipping check, previous check still running",
                self.session_id
            );
            return;
        }
        let _in_flight = InFlight(&self.checking);

        self.publish(|s| s.phase = MonitorPhase::Checking);
        let outcome = self.engine.detect_single_face(frame).await;
        let now = Utc::now();

        // The check may resolve after teardown; discard its result.
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }

        match outcome {
            Ok(Some(live)) => {
                let distance = self.engine.distance(&reference, &live);
                let result =
                    VerificationResult::compared(distance, self.cfg.match_threshold, now);
                let count = if result.is_match {
                    self.mismatches.load(Ordering::SeqCst)
                } else {
                    self.mismatches.fetch_add(1, Ordering::SeqCst) + 1
                };
                debug!(
                    "monitor {}: distance={distance:.3} match={} mismatches={count}",
                    self.session_id, result.is_match
                );
                self.publish(|s| {
                    s.result = result;
                    s.mismatch_count = count;
                    s.phase = MonitorPhase::Ready;
                });
            }
            Ok(None) => {
                let count = self.mismatches.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(
                    "monitor {}: no face in live frame, mismatches={count}",
                    self.session_id
                );
                self.publish(|s| {
                    s.result = VerificationResult::no_face(now);
                    s.mismatch_count = count;
                    s.phase = MonitorPhase::Ready;
                });
            }
            Err(e) => {
                // Per-cycle failure: record it and keep the previous match
                // state visible as stale; the schedule continues.
                warn!("monitor {}: check failed: {e}", self.session_id);
                let msg = e.to_string();
                self.publish(|s| {
                    s.result.error = Some(msg);
                    s.result.last_checked = Some(now);
                    s.phase = MonitorPhase::Ready;
                });
            }
        }
    }
}

async fn run(shared: Arc<Shared>, cancel: CancellationToken) {
    shared.publish(|s| s.phase = MonitorPhase::LoadingModels);
    let loaded = tokio::select! {
        _ = cancel.cancelled() => return,
        r = shared.engine.load_models() => r,
    };
    match loaded {
        Ok(()) => shared.publish(|s| {
            s.models_loaded = true;
            s.phase = MonitorPhase::AwaitingReference;
        }),
        Err(e) => {
            warn!("monitor {}: model load failed: {e}", shared.session_id);
            let msg = e.to_string();
            shared.publish(|s| {
                s.phase = MonitorPhase::ModelsFailed;
                s.result.error = Some(msg);
            });
            return;
        }
    }

    let (source, generation) = {
        let slot = shared.reference.lock().await;
        (slot.source.clone(), slot.generation)
    };
    match source {
        Some(source) => {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = shared.acquire_reference(&source, generation) => {}
            }
        }
        None => info!(
            "monitor {}: no reference image configured, verification disabled",
            shared.session_id
        ),
    }

    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = time::sleep(shared.cfg.initial_delay) => {}
    }

    // First tick fires immediately, i.e. at t = initial_delay; missed ticks
    // (timer fired mid-check) are skipped, not queued. `Skip` only realigns
    // deadlines that are still in the future, so a tick that became due
    // while the check overran would still be delivered immediately; reset
    // the ticker past it so the next check lands on an aligned deadline.
    let period = shared.cfg.check_interval;
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("monitor {}: scheduler stopped", shared.session_id);
                return;
            }
            started = ticker.tick() => {
                shared.run_check().await;
                let elapsed = started.elapsed();
                if elapsed > period {
                    let ticks = elapsed.as_nanos().div_ceil(period.as_nanos()) as u32;
                    ticker.reset_at(started + period * ticks);
                }
            }
        }
    }
}
