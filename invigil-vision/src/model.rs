use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ort::{
    ep::{self, ExecutionProvider},
    session::{
        builder::{GraphOptimizationLevel, SessionBuilder},
        Session,
    },
};

/// Default file names for the detector and encoder models inside a model
/// directory (OpenCV zoo naming).
pub const DETECTOR_MODEL_FILE: &str = "face_detection_yunet_2023mar.onnx";
pub const ENCODER_MODEL_FILE: &str = "face_recognition_sface_2021dec.onnx";

/// Filesystem locations of the two ONNX models the pipeline needs.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub detector: PathBuf,
    pub encoder: PathBuf,
}

impl ModelPaths {
    pub fn from_dir(dir: &Path) -> Self {
        Self {
            detector: dir.join(DETECTOR_MODEL_FILE),
            encoder: dir.join(ENCODER_MODEL_FILE),
        }
    }
}

pub fn session_builder() -> Result<SessionBuilder> {
    let mut builder =
        Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    #[cfg(feature = "openvino")]
    {
        let ep = ep::OpenVINO::default();
        if ep.is_available()? {
            ep.register(&mut builder)?;
        } else {
            log::warn!("openvino feature is enabled, onnx runtime not compiled with openvino")
        }
    }

    #[cfg(feature = "cuda")]
    {
        let ep = ep::CUDA::default();
        if ep.is_available()? {
            ep.register(&mut builder)?;
        } else {
            log::warn!("cuda feature is enabled, onnx runtime not compiled with cuda")
        }
    }

    Ok(builder)
}

pub fn detector_session(path: &Path) -> Result<Session> {
    session_builder()?
        .commit_from_file(path)
        .with_context(|| format!("loading detector model from {}", path.display()))
}

pub fn encoder_session(path: &Path) -> Result<Session> {
    session_builder()?
        .commit_from_file(path)
        .with_context(|| format!("loading encoder model from {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_paths_join_default_file_names() {
        let paths = ModelPaths::from_dir(Path::new("/opt/models"));
        assert!(paths.detector.ends_with(DETECTOR_MODEL_FILE));
        assert!(paths.encoder.ends_with(ENCODER_MODEL_FILE));
    }
}
