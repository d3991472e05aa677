//! Single-face detection for a YuNet-style anchor-free detector.
//!
//! The detector predicts directly from grid locations at strides 8, 16 and
//! 32. For each stride it outputs classification scores, objectness scores
//! and bbox deltas; the combined score is `sigmoid(cls * obj)` and boxes
//! decode as:
//!
//! ```text
//! cx = (grid_x + dx) * stride
//! cy = (grid_y + dy) * stride
//! w  = dw * stride
//! h  = dh * stride
//! ```
//!
//! This module only ever reports the single best-scoring face, which is all
//! the verification pipeline needs; there is no NMS pass and no detection
//! list.

use anyhow::{bail, Result};
use image::{DynamicImage, GenericImageView};
use ndarray::Array4;
use ort::{session::Session, value::Value};

/// Detector input resolution. The model has a fixed [1, 3, 640, 640] input.
const INPUT_SIZE: u32 = 640;

const STRIDES: [usize; 3] = [8, 16, 32];

/// Best face found in an image, in original image pixel coordinates.
#[derive(Debug, Clone)]
pub struct Detection {
    /// x, y, width, height of the face box.
    pub bbox: [f32; 4],
    pub score: f32,
}

/// Best face candidate in detector-canvas pixels (before letterbox removal).
#[derive(Debug, Clone, Copy)]
struct RawFace {
    cx: f32,
    cy: f32,
    w: f32,
    h: f32,
    score: f32,
}

/// Run the detector over `img` and return the highest-scoring face, or
/// `None` when nothing clears `score_threshold`.
pub fn detect_best_face(
    session: &mut Session,
    img: &DynamicImage,
    score_threshold: f32,
) -> Result<Option<Detection>> {
    let (orig_w, orig_h) = img.dimensions();
    if orig_w == 0 || orig_h == 0 {
        bail!("empty input image");
    }

    // Letterbox onto a square canvas so aspect ratio is preserved.
    let scale = INPUT_SIZE as f32 / orig_w.max(orig_h) as f32;
    let new_w = (orig_w as f32 * scale) as u32;
    let new_h = (orig_h as f32 * scale) as u32;
    let resized = img.resize_exact(new_w, new_h, image::imageops::FilterType::Triangle);
    let mut canvas = DynamicImage::new_rgb8(INPUT_SIZE, INPUT_SIZE);
    let offset_x = (INPUT_SIZE - new_w) / 2;
    let offset_y = (INPUT_SIZE - new_h) / 2;
    image::imageops::overlay(&mut canvas, &resized, offset_x as i64, offset_y as i64);

    let input = bgr_planes(&canvas.to_rgb8(), INPUT_SIZE as usize);
    let input = Array4::from_shape_vec(
        (1, 3, INPUT_SIZE as usize, INPUT_SIZE as usize),
        input,
    )?;
    let input = Value::from_array(input)?;

    let outputs = session.run(ort::inputs![input])?;
    let mut raw: Vec<(Vec<i64>, Vec<f32>)> = Vec::new();
    for (_name, output) in outputs.iter() {
        let (shape, data) = output.try_extract_tensor::<f32>()?;
        raw.push((shape.iter().copied().collect(), data.to_vec()));
    }
    let refs: Vec<(&[i64], &[f32])> = raw
        .iter()
        .map(|(s, d)| (s.as_slice(), d.as_slice()))
        .collect();

    let Some(best) = decode_best(&refs, score_threshold)? else {
        return Ok(None);
    };

    // Undo the letterbox: back to original image pixels.
    let x = (best.cx - best.w / 2.0 - offset_x as f32) / scale;
    let y = (best.cy - best.h / 2.0 - offset_y as f32) / scale;
    Ok(Some(Detection {
        bbox: [x, y, best.w / scale, best.h / scale],
        score: best.score,
    }))
}

/// Flatten an RGB image into CHW planes in BGR channel order, values in
/// [0, 255] as the model expects.
fn bgr_planes(img: &image::RgbImage, size: usize) -> Vec<f32> {
    let pixel_count = size * size;
    let mut planes = vec![0.0f32; 3 * pixel_count];
    let pixels = img.as_raw();
    for i in 0..pixel_count {
        let idx = i * 3;
        planes[i] = pixels[idx + 2] as f32; // B
        planes[pixel_count + i] = pixels[idx + 1] as f32; // G
        planes[2 * pixel_count + i] = pixels[idx] as f32; // R
    }
    planes
}

/// Scan all grid locations across the three strides and keep the single
/// highest combined score above `score_threshold`.
///
/// Output tensor order is cls_8, cls_16, cls_32, obj_8, obj_16, obj_32,
/// bbox_8, bbox_16, bbox_32, kps_8, kps_16, kps_32; landmarks are ignored.
fn decode_best(
    outputs: &[(&[i64], &[f32])],
    score_threshold: f32,
) -> Result<Option<RawFace>> {
    if outputs.len() < 9 {
        bail!("detector produced {} outputs, expected at least 9", outputs.len());
    }

    let mut best: Option<RawFace> = None;

    for (scale_idx, &stride) in STRIDES.iter().enumerate() {
        let grid = INPUT_SIZE as usize / stride;
        let locations = grid * grid;

        let (_, cls) = outputs[scale_idx];
        let (_, obj) = outputs[scale_idx + 3];
        let (_, boxes) = outputs[scale_idx + 6];

        if cls.len() != locations || obj.len() != locations {
            bail!(
                "stride {} score tensors hold {}/{} values, expected {}",
                stride,
                cls.len(),
                obj.len(),
                locations
            );
        }
        if boxes.len() != locations * 4 {
            bail!(
                "stride {} bbox tensor holds {} values, expected {}",
                stride,
                boxes.len(),
                locations * 4
            );
        }

        for i in 0..grid {
            for j in 0..grid {
                let idx = i * grid + j;
                let score = sigmoid(cls[idx] * obj[idx]);
                if score < score_threshold {
                    continue;
                }
                if best.map_or(false, |b| b.score >= score) {
                    continue;
                }

                let dx = boxes[idx * 4];
                let dy = boxes[idx * 4 + 1];
                let dw = boxes[idx * 4 + 2];
                let dh = boxes[idx * 4 + 3];

                best = Some(RawFace {
                    cx: (j as f32 + dx) * stride as f32,
                    cy: (i as f32 + dy) * stride as f32,
                    w: dw * stride as f32,
                    h: dh * stride as f32,
                    score,
                });
            }
        }
    }

    Ok(best)
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
