//! Reference profile acquisition: resolve the candidate's registered photo
//! to an image and extract the one expected face embedding from it.

use std::path::PathBuf;

use image::DynamicImage;
use log::{info, warn};
use thiserror::Error;

use crate::engine::{EngineError, FaceEngine};
use invigil_vision::Embedding;

/// Where the candidate's registered photo comes from.
#[derive(Debug, Clone)]
pub enum ReferenceSource {
    Url(String),
    Path(PathBuf),
    /// Already-decoded image, mainly for embedding in tests and callers
    /// that fetch the photo themselves.
    Image(DynamicImage),
}

impl ReferenceSource {
    /// Classify a config string: anything with an http(s) scheme is a URL,
    /// everything else is a local path.
    pub fn parse(raw: &str) -> Self {
        if raw.starts_with("http://") || raw.starts_with("https://") {
            Self::Url(raw.to_string())
        } else {
            Self::Path(PathBuf::from(raw))
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Url(url) => url.clone(),
            Self::Path(path) => path.display().to_string(),
            Self::Image(_) => "<in-memory image>".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReferenceError {
    #[error("reference image fetch failed: {0}")]
    Fetch(String),
    #[error("reference image decode failed: {0}")]
    Decode(String),
    #[error("no face in reference image")]
    NoFace,
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Resolve a reference source to a decoded image.
pub async fn load_reference_image(
    source: &ReferenceSource,
) -> Result<DynamicImage, ReferenceError> {
    match source {
        ReferenceSource::Url(url) => {
            let response = reqwest::get(url)
                .await
                .map_err(|e| ReferenceError::Fetch(e.to_string()))?
                .error_for_status()
                .map_err(|e| ReferenceError::Fetch(e.to_string()))?;
            let bytes = response
                .bytes()
                .await
                .map_err(|e| ReferenceError::Fetch(e.to_string()))?;
            image::load_from_memory(&bytes).map_err(|e| ReferenceError::Decode(e.to_string()))
        }
        ReferenceSource::Path(path) => {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| ReferenceError::Fetch(format!("{}: {e}", path.display())))?;
            image::load_from_memory(&bytes).map_err(|e| ReferenceError::Decode(e.to_string()))
        }
        ReferenceSource::Image(img) => Ok(img.clone()),
    }
}

/// Fetch the reference image and extract its face embedding. Exactly zero
/// or one face is expected; zero faces is a terminal failure for this
/// source and leaves verification disabled.
pub async fn acquire(
    engine: &dyn FaceEngine,
    source: &ReferenceSource,
) -> Result<Embedding, ReferenceError> {
    let img = load_reference_image(source).await?;
    match engine.detect_single_face(img).await? {
        Some(embedding) => {
            info!(
                "reference profile acquired from {} ({}-D embedding)",
                source.describe(),
                embedding.dim()
            );
            Ok(embedding)
        }
        None => {
            warn!("no face found in reference image {}", source.describe());
            Err(ReferenceError::NoFace)
        }
    }
}
