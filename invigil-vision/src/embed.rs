//! Face embedding extraction and distance functions.
//!
//! The encoder is an SFace-style model taking a 112x112 BGR face crop and
//! producing a fixed-length descriptor (128-D for SFace). Embeddings are
//! L2-normalized on extraction so that Euclidean distance and cosine
//! similarity are interchangeable measures of the same geometry.

use anyhow::{bail, Result};
use image::{DynamicImage, GenericImageView};
use ndarray::Array4;
use ort::{session::Session, value::Value};

use crate::detect::Detection;

/// Encoder input resolution.
const FACE_SIZE: u32 = 112;

/// L2-normalized face descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub vector: Vec<f32>,
}

impl Embedding {
    pub fn dim(&self) -> usize {
        self.vector.len()
    }
}

/// Cut the detected face out of `img`, widening the box by `margin`
/// (fraction of box size per side) and clamping to the image bounds.
pub fn crop_face(img: &DynamicImage, detection: &Detection, margin: f32) -> DynamicImage {
    let (img_w, img_h) = img.dimensions();
    let [x, y, w, h] = detection.bbox;

    let pad_x = w * margin;
    let pad_y = h * margin;
    let x0 = (x - pad_x).max(0.0) as u32;
    let y0 = (y - pad_y).max(0.0) as u32;
    let x1 = ((x + w + pad_x).max(0.0) as u32).min(img_w);
    let y1 = ((y + h + pad_y).max(0.0) as u32).min(img_h);

    let crop_w = x1.saturating_sub(x0).max(1);
    let crop_h = y1.saturating_sub(y0).max(1);
    img.crop_imm(x0.min(img_w - 1), y0.min(img_h - 1), crop_w, crop_h)
}

/// Encode a face crop into an L2-normalized embedding.
pub fn encode_face(session: &mut Session, face: &DynamicImage) -> Result<Embedding> {
    let face = face.resize_exact(FACE_SIZE, FACE_SIZE, image::imageops::FilterType::Triangle);
    let rgb = face.to_rgb8();

    // BGR CHW planes, values in [0, 255].
    let pixel_count = (FACE_SIZE * FACE_SIZE) as usize;
    let mut planes = vec![0.0f32; 3 * pixel_count];
    let pixels = rgb.as_raw();
    for i in 0..pixel_count {
        let idx = i * 3;
        planes[i] = pixels[idx + 2] as f32;
        planes[pixel_count + i] = pixels[idx + 1] as f32;
        planes[2 * pixel_count + i] = pixels[idx] as f32;
    }

    let input = Array4::from_shape_vec(
        (1, 3, FACE_SIZE as usize, FACE_SIZE as usize),
        planes,
    )?;
    let input = Value::from_array(input)?;

    let outputs = session.run(ort::inputs![input])?;
    let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;

    // Expecting [1, D].
    let dim = if shape.len() == 2 {
        shape[1] as usize
    } else {
        data.len()
    };
    if dim == 0 || data.len() < dim {
        bail!("encoder produced an empty embedding");
    }

    Ok(Embedding {
        vector: l2_normalize(&data[..dim]),
    })
}

fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}

/// Euclidean distance between two descriptors. Trailing elements of the
/// longer vector are ignored when dimensions disagree.
pub fn euclidean_distance(a: &Embedding, b: &Embedding) -> f32 {
    a.vector
        .iter()
        .zip(b.vector.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Cosine similarity; for normalized embeddings this is the plain dot
/// product, clamped into [-1, 1].
pub fn cosine_similarity(a: &Embedding, b: &Embedding) -> f32 {
    let dot: f32 = a
        .vector
        .iter()
        .zip(b.vector.iter())
        .map(|(x, y)| x * y)
        .sum();
    dot.clamp(-1.0, 1.0)
}
