//! Capability seams around the monitor: the face engine and the live
//! video frame source, plus the ONNX-runtime backed engine adapter.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use image::DynamicImage;
use thiserror::Error;

use invigil_vision::{embed, Embedding, ModelPaths, Pipeline};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("model load failed: {0}")]
    ModelLoad(String),
    #[error("face detection failed: {0}")]
    Detection(String),
}

/// Face detection and embedding primitive consumed by the monitor.
///
/// `detect_single_face` returns at most one detection: `Ok(None)` means no
/// face cleared the detector's threshold, `Err` is an inference failure.
#[async_trait]
pub trait FaceEngine: Send + Sync {
    /// Load the detection/embedding models. Must complete before any
    /// detection is attempted; implementations should be idempotent so a
    /// shared engine loads once per process.
    async fn load_models(&self) -> Result<(), EngineError>;

    async fn detect_single_face(
        &self,
        image: DynamicImage,
    ) -> Result<Option<Embedding>, EngineError>;

    /// Distance between two embeddings; lower is more similar.
    fn distance(&self, a: &Embedding, b: &Embedding) -> f32;
}

/// Provider of the current live camera frame. `None` while the camera is
/// still coming up.
pub trait FrameSource: Send + Sync {
    fn current_frame(&self) -> Option<DynamicImage>;
}

/// `FaceEngine` adapter over the `invigil-vision` ONNX pipeline. Inference
/// is blocking, so calls are moved onto the blocking thread pool.
pub struct OrtFaceEngine {
    paths: ModelPaths,
    pipeline: Arc<Mutex<Option<Pipeline>>>,
}

impl OrtFaceEngine {
    pub fn new(paths: ModelPaths) -> Self {
        Self {
            paths,
            pipeline: Arc::new(Mutex::new(None)),
        }
    }
}

fn lock_pipeline(pipeline: &Mutex<Option<Pipeline>>) -> std::sync::MutexGuard<'_, Option<Pipeline>> {
    pipeline.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl FaceEngine for OrtFaceEngine {
    async fn load_models(&self) -> Result<(), EngineError> {
        if lock_pipeline(&self.pipeline).is_some() {
            return Ok(());
        }

        let paths = self.paths.clone();
        let pipeline = Arc::clone(&self.pipeline);
        tokio::task::spawn_blocking(move || {
            let built = Pipeline::open(&paths)?;
            *lock_pipeline(&pipeline) = Some(built);
            Ok::<_, anyhow::Error>(())
        })
        .await
        .map_err(|e| EngineError::ModelLoad(format!("model load task failed: {e}")))?
        .map_err(|e| EngineError::ModelLoad(e.to_string()))
    }

    async fn detect_single_face(
        &self,
        image: DynamicImage,
    ) -> Result<Option<Embedding>, EngineError> {
        let pipeline = Arc::clone(&self.pipeline);
        tokio::task::spawn_blocking(move || {
            let mut guard = lock_pipeline(&pipeline);
            let pipeline = guard
                .as_mut()
                .ok_or_else(|| EngineError::Detection("models not loaded".to_string()))?;
            pipeline
                .extract_embedding(&image)
                .map_err(|e| EngineError::Detection(e.to_string()))
        })
        .await
        .map_err(|e| EngineError::Detection(format!("detection task failed: {e}")))?
    }

    fn distance(&self, a: &Embedding, b: &Embedding) -> f32 {
        embed::euclidean_distance(a, b)
    }
}
