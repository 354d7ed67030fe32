//! Face presence detection with an SCRFD model on ONNX Runtime.
//!
//! The mirror only has to know whether somebody is standing in front of it,
//! so decoding keeps boxes and scores and ignores the landmark heads. Models
//! exported with or without keypoint outputs both load.

use crate::config::DetectionSettings;
use crate::types::Detection;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const INPUT_SIZE: u32 = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("frame buffer too short for {width}x{height} RGB: got {actual} bytes")]
    InvalidFrame {
        width: u32,
        height: u32,
        actual: usize,
    },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Anything that can tell whether a frame shows a person.
pub trait HumanDetector {
    /// Faces found in a packed RGB8 frame, highest score first.
    fn detect(&mut self, rgb: &[u8], width: u32, height: u32)
        -> Result<Vec<Detection>, DetectorError>;

    fn human_present(&mut self, rgb: &[u8], width: u32, height: u32) -> Result<bool, DetectorError> {
        Ok(!self.detect(rgb, width, height)?.is_empty())
    }
}

/// Thresholds applied after inference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorSettings {
    pub score_threshold: f32,
    pub nms_threshold: f32,
    pub min_face_size: f32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            score_threshold: 0.5,
            nms_threshold: 0.4,
            min_face_size: 30.0,
        }
    }
}

impl From<&DetectionSettings> for DetectorSettings {
    fn from(settings: &DetectionSettings) -> Self {
        Self {
            score_threshold: settings.score_threshold,
            nms_threshold: settings.nms_threshold,
            min_face_size: settings.min_face_size,
        }
    }
}

/// Output tensor positions for one stride level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideHead {
    stride: usize,
    score: usize,
    bbox: usize,
}

/// Square letterbox placement of a frame inside the model input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: u32,
    pad_y: u32,
    scaled_width: u32,
    scaled_height: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, side: u32) -> Self {
        let scale = (side as f32 / width as f32).min(side as f32 / height as f32);
        let scaled_width = ((width as f32 * scale).round() as u32).clamp(1, side);
        let scaled_height = ((height as f32 * scale).round() as u32).clamp(1, side);
        Self {
            scale,
            pad_x: (side - scaled_width) / 2,
            pad_y: (side - scaled_height) / 2,
            scaled_width,
            scaled_height,
        }
    }

    /// Model input coordinates to source frame coordinates.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

/// SCRFD face detector.
pub struct ScrfdDetector {
    session: Session,
    settings: DetectorSettings,
    heads: [StrideHead; 3],
}

impl ScrfdDetector {
    /// Load an SCRFD ONNX model.
    pub fn load(model_path: &Path, settings: DetectorSettings) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model needs score and bbox outputs for 3 strides, got {} outputs",
                output_names.len()
            )));
        }

        let heads = locate_heads(&output_names);
        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            ?heads,
            "loaded SCRFD model"
        );

        Ok(Self {
            session,
            settings,
            heads,
        })
    }

    pub fn settings(&self) -> DetectorSettings {
        self.settings
    }

    /// Letterbox an RGB frame into a normalized 1x3x640x640 tensor.
    fn preprocess(
        &self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<(Array4<f32>, Letterbox), DetectorError> {
        let invalid = || DetectorError::InvalidFrame {
            width,
            height,
            actual: rgb.len(),
        };
        let expected = (width as usize) * (height as usize) * 3;
        if width == 0 || height == 0 || rgb.len() < expected {
            return Err(invalid());
        }
        let source = RgbImage::from_raw(width, height, rgb[..expected].to_vec()).ok_or_else(invalid)?;

        let letterbox = Letterbox::fit(width, height, INPUT_SIZE);
        let resized = imageops::resize(
            &source,
            letterbox.scaled_width,
            letterbox.scaled_height,
            FilterType::Triangle,
        );

        // Zero is the normalized value of the mean, so padding stays zero.
        let side = INPUT_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
        let (ox, oy) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
        for (x, y, pixel) in resized.enumerate_pixels() {
            for channel in 0..3 {
                tensor[[0, channel, y as usize + oy, x as usize + ox]] =
                    (f32::from(pixel[channel]) - PIXEL_MEAN) / PIXEL_STD;
            }
        }

        Ok((tensor, letterbox))
    }
}

impl HumanDetector for ScrfdDetector {
    fn detect(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<Detection>, DetectorError> {
        let (input, letterbox) = self.preprocess(rgb, width, height)?;
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for head in self.heads {
            let (_, scores) = outputs[head.score].try_extract_tensor::<f32>().map_err(|e| {
                DetectorError::InferenceFailed(format!("scores stride {}: {e}", head.stride))
            })?;
            let (_, boxes) = outputs[head.bbox].try_extract_tensor::<f32>().map_err(|e| {
                DetectorError::InferenceFailed(format!("boxes stride {}: {e}", head.stride))
            })?;
            candidates.extend(decode_head(
                scores,
                boxes,
                head.stride,
                &letterbox,
                self.settings.score_threshold,
            ));
        }

        let min_side = self.settings.min_face_size;
        candidates.retain(|d| d.width >= min_side && d.height >= min_side);

        Ok(suppress(candidates, self.settings.nms_threshold))
    }
}

/// Find score/bbox tensors by name (`score_8`, `bbox_16`, ...).
///
/// Exports with numeric output names fall back to the standard ordering:
/// scores for strides 8/16/32 first, then boxes.
fn locate_heads(names: &[String]) -> [StrideHead; 3] {
    let position = |prefix: &str, stride: usize| {
        let wanted = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == wanted)
    };
    let named = |i: usize| {
        let stride = STRIDES[i];
        Some(StrideHead {
            stride,
            score: position("score", stride)?,
            bbox: position("bbox", stride)?,
        })
    };

    match (named(0), named(1), named(2)) {
        (Some(a), Some(b), Some(c)) => [a, b, c],
        _ => {
            tracing::debug!(?names, "SCRFD output names not recognized, using positional layout");
            std::array::from_fn(|i| StrideHead {
                stride: STRIDES[i],
                score: i,
                bbox: i + 3,
            })
        }
    }
}

/// Turn one stride's anchor grid into boxes above `threshold`.
///
/// Box offsets are distances from the anchor point to each edge, in stride units.
fn decode_head(
    scores: &[f32],
    boxes: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<Detection> {
    let cells_per_row = INPUT_SIZE as usize / stride;
    let anchors = cells_per_row * cells_per_row * ANCHORS_PER_CELL;
    let step = stride as f32;

    scores
        .iter()
        .take(anchors)
        .enumerate()
        .filter(|(_, &score)| score > threshold)
        .filter_map(|(idx, &score)| {
            let offsets = boxes.get(idx * 4..idx * 4 + 4)?;
            let cell = idx / ANCHORS_PER_CELL;
            let ax = ((cell % cells_per_row) * stride) as f32;
            let ay = ((cell / cells_per_row) * stride) as f32;

            let (x1, y1) = letterbox.unmap(ax - offsets[0] * step, ay - offsets[1] * step);
            let (x2, y2) = letterbox.unmap(ax + offsets[2] * step, ay + offsets[3] * step);
            Some(Detection {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                score,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression; output is sorted by score, best first.
fn suppress(mut candidates: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Detection> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f32, y: f32, w: f32, h: f32, score: f32) -> Detection {
        Detection { x, y, width: w, height: h, score }
    }

    fn identity() -> Letterbox {
        Letterbox::fit(INPUT_SIZE, INPUT_SIZE, INPUT_SIZE)
    }

    #[test]
    fn test_letterbox_landscape() {
        let lb = Letterbox::fit(640, 480, 640);
        assert_eq!(lb.scale, 1.0);
        assert_eq!((lb.scaled_width, lb.scaled_height), (640, 480));
        assert_eq!((lb.pad_x, lb.pad_y), (0, 80));
        assert_eq!(lb.unmap(100.0, 180.0), (100.0, 100.0));
    }

    #[test]
    fn test_letterbox_upscales_small_frames() {
        let lb = Letterbox::fit(320, 240, 640);
        assert_eq!(lb.scale, 2.0);
        assert_eq!((lb.pad_x, lb.pad_y), (0, 80));
        let (x, y) = lb.unmap(200.0, 80.0 + 100.0);
        assert!((x - 100.0).abs() < 1e-4 && (y - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_decode_single_anchor() {
        let stride = 32;
        let cells = INPUT_SIZE as usize / stride;
        let anchors = cells * cells * ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        let mut boxes = vec![0.0f32; anchors * 4];

        // Second anchor of the cell at column 3, row 2
        let idx = (2 * cells + 3) * ANCHORS_PER_CELL + 1;
        scores[idx] = 0.9;
        boxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 2.0, 3.0]);

        let found = decode_head(&scores, &boxes, stride, &identity(), 0.5);
        assert_eq!(found.len(), 1);
        let face = found[0];
        assert_eq!((face.x, face.y), (96.0 - 32.0, 64.0 - 32.0));
        assert_eq!((face.width, face.height), (96.0, 128.0));
        assert!((face.score - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_decode_respects_threshold() {
        let scores = vec![0.5, 0.49, 0.51];
        let boxes = vec![1.0; 12];
        let found = decode_head(&scores, &boxes, 8, &identity(), 0.5);
        assert_eq!(found.len(), 1);
        assert!((found[0].score - 0.51).abs() < 1e-6);
    }

    #[test]
    fn test_decode_skips_truncated_boxes() {
        let scores = vec![0.9, 0.9];
        let boxes = vec![1.0; 4];
        assert_eq!(decode_head(&scores, &boxes, 8, &identity(), 0.5).len(), 1);
    }

    #[test]
    fn test_suppress_overlapping() {
        let kept = suppress(
            vec![
                det(5.0, 5.0, 100.0, 100.0, 0.8),
                det(200.0, 200.0, 50.0, 50.0, 0.7),
                det(0.0, 0.0, 100.0, 100.0, 0.9),
            ],
            0.4,
        );
        let scores: Vec<f32> = kept.iter().map(|d| d.score).collect();
        assert_eq!(scores, vec![0.9, 0.7]);
    }

    #[test]
    fn test_suppress_empty() {
        assert!(suppress(Vec::new(), 0.4).is_empty());
    }

    #[test]
    fn test_locate_heads_named() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32",
            "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let heads = locate_heads(&names);
        assert_eq!(heads[0], StrideHead { stride: 8, score: 2, bbox: 0 });
        assert_eq!(heads[1], StrideHead { stride: 16, score: 5, bbox: 3 });
        assert_eq!(heads[2], StrideHead { stride: 32, score: 8, bbox: 6 });
    }

    #[test]
    fn test_locate_heads_positional_fallback() {
        let names: Vec<String> = (440..446).map(|i: usize| i.to_string()).collect();
        let heads = locate_heads(&names);
        assert_eq!(
            heads.map(|h| (h.stride, h.score, h.bbox)),
            [(8, 0, 3), (16, 1, 4), (32, 2, 5)]
        );
    }

    struct Scripted(Vec<Detection>);

    impl HumanDetector for Scripted {
        fn detect(&mut self, _: &[u8], _: u32, _: u32) -> Result<Vec<Detection>, DetectorError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_human_present_follows_detections() {
        assert!(!Scripted(vec![]).human_present(&[], 0, 0).unwrap());
        assert!(Scripted(vec![det(0.0, 0.0, 40.0, 40.0, 0.9)])
            .human_present(&[], 0, 0)
            .unwrap());
    }

    #[test]
    fn test_settings_from_config() {
        let config = DetectionSettings {
            score_threshold: 0.6,
            min_face_size: 48.0,
            ..Default::default()
        };
        let settings = DetectorSettings::from(&config);
        assert_eq!(settings.score_threshold, 0.6);
        assert_eq!(settings.nms_threshold, 0.4);
        assert_eq!(settings.min_face_size, 48.0);
    }
}
