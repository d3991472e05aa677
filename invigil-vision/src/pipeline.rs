use anyhow::{Context, Result};
use image::DynamicImage;
use ort::session::Session;

use crate::detect;
use crate::embed::{self, Embedding};
use crate::model::{self, ModelPaths};

const DEFAULT_SCORE_THRESHOLD: f32 = 0.6;
const DEFAULT_CROP_MARGIN: f32 = 0.2;

/// Detector and encoder sessions composed into a single-face embedding
/// extractor: detect best face, crop, encode.
pub struct Pipeline {
    detector: Session,
    encoder: Session,
    score_threshold: f32,
    crop_margin: f32,
}

impl Pipeline {
    pub fn open(paths: &ModelPaths) -> Result<Self> {
        Ok(Self {
            detector: model::detector_session(&paths.detector)?,
            encoder: model::encoder_session(&paths.encoder)?,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            crop_margin: DEFAULT_CROP_MARGIN,
        })
    }

    pub fn with_score_threshold(mut self, threshold: f32) -> Self {
        self.score_threshold = threshold;
        self
    }

    /// Extract the embedding of the best face in `img`. `Ok(None)` means no
    /// face cleared the detection threshold; errors are inference failures.
    pub fn extract_embedding(&mut self, img: &DynamicImage) -> Result<Option<Embedding>> {
        let Some(detection) =
            detect::detect_best_face(&mut self.detector, img, self.score_threshold)
                .context("detecting face")?
        else {
            return Ok(None);
        };

        log::debug!(
            "face detected: score={:.3} bbox={:?}",
            detection.score,
            detection.bbox
        );

        let face = embed::crop_face(img, &detection, self.crop_margin);
        let embedding =
            embed::encode_face(&mut self.encoder, &face).context("encoding face")?;
        Ok(Some(embedding))
    }
}
