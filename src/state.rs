//! Published monitor state: the per-cycle verification result and the
//! snapshot the UI subscribes to.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Outcome of one verification cycle. Overwritten on every check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationResult {
    pub is_match: bool,
    /// `clamp(1 - distance, 0, 1)`; 0 when no face was found.
    pub confidence: f32,
    pub face_detected: bool,
    /// `None` until the first check completes.
    pub last_checked: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Default for VerificationResult {
    fn default() -> Self {
        Self {
            is_match: false,
            confidence: 0.0,
            face_detected: false,
            last_checked: None,
            error: None,
        }
    }
}

impl VerificationResult {
    /// Cycle where detection ran but found no face in the live frame.
    pub fn no_face(now: DateTime<Utc>) -> Self {
        Self {
            is_match: false,
            confidence: 0.0,
            face_detected: false,
            last_checked: Some(now),
            error: Some("no face detected".to_string()),
        }
    }

    /// Cycle where a live embedding was compared against the reference.
    /// A match requires the distance to be strictly below the threshold.
    pub fn compared(distance: f32, threshold: f32, now: DateTime<Utc>) -> Self {
        Self {
            is_match: distance < threshold,
            confidence: (1.0 - distance).clamp(0.0, 1.0),
            face_detected: true,
            last_checked: Some(now),
            error: None,
        }
    }
}

/// Lifecycle phase of one monitor instance.
///
/// `ModelsFailed`, `ReferenceFailed` and `Disposed` are terminal;
/// `Checking` always returns to `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MonitorPhase {
    Uninitialized,
    LoadingModels,
    ModelsFailed,
    AwaitingReference,
    ReferenceFailed,
    Ready,
    Checking,
    Disposed,
}

/// Everything the consuming UI needs, published through a watch channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorSnapshot {
    pub phase: MonitorPhase,
    pub models_loaded: bool,
    pub has_reference: bool,
    pub result: VerificationResult,
    pub mismatch_count: u32,
}

impl MonitorSnapshot {
    pub fn initial() -> Self {
        Self {
            phase: MonitorPhase::Uninitialized,
            models_loaded: false,
            has_reference: false,
            result: VerificationResult::default(),
            mismatch_count: 0,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.phase == MonitorPhase::LoadingModels
    }
}
