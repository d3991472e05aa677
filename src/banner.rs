//! Presentational policy over the monitor snapshot: when to show the
//! proctoring warning banner and how severe it is. The monitor itself
//! never decides severity; this layer does.

use std::time::Duration;

use crate::state::MonitorSnapshot;

/// How long a raised warning stays visible, independent of the check cycle.
pub const DISPLAY_DURATION: Duration = Duration::from_secs(8);

/// Mismatch count at which the "may be reported" messaging kicks in.
pub const REPEAT_REPORT_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// No face visible in the frame (amber).
    NoFace,
    /// The visible face does not match the reference (red).
    Mismatch,
    /// Repeated mismatches (dark red, "may be reported").
    RepeatedMismatch,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Warning {
    pub severity: Severity,
    pub message: String,
    pub mismatch_count: u32,
}

/// Decide whether the current snapshot warrants a warning. Warnings only
/// apply once a reference exists and at least one check has completed.
pub fn warning_for(snapshot: &MonitorSnapshot) -> Option<Warning> {
    if !snapshot.has_reference {
        return None;
    }
    let result = &snapshot.result;
    result.last_checked?;
    if result.is_match {
        return None;
    }

    let warning = if !result.face_detected {
        Warning {
            severity: Severity::NoFace,
            message: "No face detected. Please stay visible to the camera.".to_string(),
            mismatch_count: snapshot.mismatch_count,
        }
    } else if snapshot.mismatch_count >= REPEAT_REPORT_THRESHOLD {
        Warning {
            severity: Severity::RepeatedMismatch,
            message: format!(
                "Identity mismatch detected {} times. This interview may be reported.",
                snapshot.mismatch_count
            ),
            mismatch_count: snapshot.mismatch_count,
        }
    } else {
        Warning {
            severity: Severity::Mismatch,
            message: "Face does not match the registered candidate photo.".to_string(),
            mismatch_count: snapshot.mismatch_count,
        }
    };
    Some(warning)
}

/// Whether a warning raised at `elapsed` ago should still be displayed.
pub fn still_visible(elapsed: Duration) -> bool {
    elapsed < DISPLAY_DURATION
}
