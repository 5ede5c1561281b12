//! Model Manager
//!
//! Process-wide owner of the three heavy models: the person detector, the
//! pose estimator and the pose-sequence anomaly classifier. Loaded once at
//! startup and handed to every stream processor as an `Arc`; processors never
//! construct model state of their own.
//!
//! Thread safety: the ONNX runtime supports concurrent forward passes, but
//! the `ort` binding takes `&mut self` on `run`, so each session sits behind
//! a `Mutex`. Preprocessing and postprocessing run outside the lock.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use image::{imageops, RgbImage};
use ndarray::Array4;
use ort::{session::Session, value::Value};
use thiserror::Error;
use tracing::info;

use crate::buffer::{PoseSequence, SEQUENCE_LENGTH};
use crate::detect::{nms, parse_detections, BBox, Detection, PoseFrame, NUM_KEYPOINTS};

/// Detector input is square
pub const DETECT_INPUT: u32 = 640;

/// Pose estimator crop input, width x height
pub const POSE_INPUT_W: u32 = 192;
pub const POSE_INPUT_H: u32 = 256;

/// IoU threshold for detector NMS
const NMS_IOU: f32 = 0.45;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to load model at {path}: {message}")]
    Load { path: PathBuf, message: String },
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("model manager has been cleaned up")]
    NotLoaded,
}

/// Pose estimation configuration shared with the processors
#[derive(Debug, Clone)]
pub struct PoseConfig {
    pub model_path: PathBuf,
    pub sequence_length: usize,
    pub device: String,
}

/// Model artifact locations and the inference device tag
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub detector_path: PathBuf,
    pub pose_path: PathBuf,
    pub classifier_path: PathBuf,
    pub device: String,
    pub sequence_length: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            detector_path: PathBuf::from("models/yolo_person.onnx"),
            pose_path: PathBuf::from("models/pose.onnx"),
            classifier_path: PathBuf::from("models/anomaly_flow.onnx"),
            device: "cpu".to_string(),
            sequence_length: SEQUENCE_LENGTH,
        }
    }
}

static SHARED: OnceLock<Arc<ModelManager>> = OnceLock::new();

/// Owner of the loaded sessions. Sessions are `Option` so `cleanup` can
/// release them while outstanding `Arc`s still exist.
pub struct ModelManager {
    detector: Mutex<Option<Session>>,
    pose: Mutex<Option<Session>>,
    classifier: Mutex<Option<Session>>,
    pose_cfg: PoseConfig,
    loaded: AtomicBool,
}

impl ModelManager {
    /// Load all three artifacts. Fails fast on a missing or unreadable file.
    pub fn load(cfg: &ModelConfig) -> Result<Self, ModelError> {
        let detector = load_session(&cfg.detector_path)?;
        let pose = load_session(&cfg.pose_path)?;
        let classifier = load_session(&cfg.classifier_path)?;

        info!(
            detector = %cfg.detector_path.display(),
            pose = %cfg.pose_path.display(),
            classifier = %cfg.classifier_path.display(),
            device = %cfg.device,
            "models loaded"
        );

        Ok(Self {
            detector: Mutex::new(Some(detector)),
            pose: Mutex::new(Some(pose)),
            classifier: Mutex::new(Some(classifier)),
            pose_cfg: PoseConfig {
                model_path: cfg.pose_path.clone(),
                sequence_length: cfg.sequence_length,
                device: cfg.device.clone(),
            },
            loaded: AtomicBool::new(true),
        })
    }

    /// Process-wide load latch: the first call loads, every later call
    /// returns the already-loaded instance.
    pub fn load_once(cfg: &ModelConfig) -> Result<Arc<ModelManager>, ModelError> {
        if let Some(existing) = SHARED.get() {
            return Ok(existing.clone());
        }
        let manager = Arc::new(Self::load(cfg)?);
        Ok(SHARED.get_or_init(|| manager).clone())
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    pub fn pose_config(&self) -> &PoseConfig {
        &self.pose_cfg
    }

    /// Detect persons in a frame. Confidence filter and NMS applied; boxes
    /// returned in frame coordinates.
    pub fn detect_persons(
        &self,
        frame: &RgbImage,
        min_confidence: f32,
    ) -> Result<Vec<Detection>, ModelError> {
        let resized = imageops::resize(
            frame,
            DETECT_INPUT,
            DETECT_INPUT,
            imageops::FilterType::Triangle,
        );
        let input = image_to_tensor(&resized);
        let input_value =
            Value::from_array(input).map_err(|e| ModelError::Inference(e.to_string()))?;

        let (dims, data) = {
            let mut guard = self.detector.lock().expect("detector lock poisoned");
            let session = guard.as_mut().ok_or(ModelError::NotLoaded)?;
            let outputs = session
                .run(ort::inputs![input_value])
                .map_err(|e| ModelError::Inference(e.to_string()))?;
            let (shape, data) = outputs["output0"]
                .try_extract_tensor::<f32>()
                .map_err(|e| ModelError::Inference(e.to_string()))?;
            if shape.len() != 3 {
                return Err(ModelError::Inference(format!(
                    "unexpected detector output rank {}",
                    shape.len()
                )));
            }
            let dims = [shape[0] as usize, shape[1] as usize, shape[2] as usize];
            (dims, data.to_vec())
        };

        let scale_x = frame.width() as f32 / DETECT_INPUT as f32;
        let scale_y = frame.height() as f32 / DETECT_INPUT as f32;

        let detections = parse_detections(&dims, &data, min_confidence)
            .into_iter()
            .map(|d| Detection {
                bbox: BBox::new(
                    d.bbox.x * scale_x,
                    d.bbox.y * scale_y,
                    d.bbox.w * scale_x,
                    d.bbox.h * scale_y,
                ),
                confidence: d.confidence,
            })
            .collect();

        Ok(nms(detections, NMS_IOU))
    }

    /// Estimate the 17-keypoint pose for one detection. The crop is resized
    /// to the pose input and keypoints are mapped back to frame coordinates.
    pub fn estimate_pose(&self, frame: &RgbImage, bbox: &BBox) -> Result<PoseFrame, ModelError> {
        let crop_box = clamp_bbox(bbox, frame.width(), frame.height());
        if crop_box.w < 1.0 || crop_box.h < 1.0 {
            return Ok([[0.0; 3]; NUM_KEYPOINTS]);
        }

        let crop = imageops::crop_imm(
            frame,
            crop_box.x as u32,
            crop_box.y as u32,
            crop_box.w as u32,
            crop_box.h as u32,
        )
        .to_image();
        let resized = imageops::resize(
            &crop,
            POSE_INPUT_W,
            POSE_INPUT_H,
            imageops::FilterType::Triangle,
        );
        let input = image_to_tensor(&resized);
        let input_value =
            Value::from_array(input).map_err(|e| ModelError::Inference(e.to_string()))?;

        let raw = {
            let mut guard = self.pose.lock().expect("pose lock poisoned");
            let session = guard.as_mut().ok_or(ModelError::NotLoaded)?;
            let outputs = session
                .run(ort::inputs![input_value])
                .map_err(|e| ModelError::Inference(e.to_string()))?;
            let (_, data) = outputs["output0"]
                .try_extract_tensor::<f32>()
                .map_err(|e| ModelError::Inference(e.to_string()))?;
            if data.len() < NUM_KEYPOINTS * 3 {
                return Err(ModelError::Inference(format!(
                    "pose output too small: {} values",
                    data.len()
                )));
            }
            data.to_vec()
        };

        Ok(map_keypoints_to_frame(&raw, &crop_box))
    }

    /// Score a full pose sequence. The classifier is a normalizing flow over
    /// normal behavior; the output is a log-likelihood, lower means more
    /// anomalous.
    pub fn classify_sequence(&self, sequence: &PoseSequence) -> Result<f32, ModelError> {
        let input = sequence.to_tensor();
        let input_value =
            Value::from_array(input).map_err(|e| ModelError::Inference(e.to_string()))?;

        let mut guard = self.classifier.lock().expect("classifier lock poisoned");
        let session = guard.as_mut().ok_or(ModelError::NotLoaded)?;
        let outputs = session
            .run(ort::inputs![input_value])
            .map_err(|e| ModelError::Inference(e.to_string()))?;
        let (_, data) = outputs["output0"]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::Inference(e.to_string()))?;
        data.first()
            .copied()
            .ok_or_else(|| ModelError::Inference("empty classifier output".to_string()))
    }

    /// Release the loaded sessions. Idempotent; later inference calls fail
    /// with `NotLoaded`.
    pub fn cleanup(&self) {
        *self.detector.lock().expect("detector lock poisoned") = None;
        *self.pose.lock().expect("pose lock poisoned") = None;
        *self.classifier.lock().expect("classifier lock poisoned") = None;
        if self.loaded.swap(false, Ordering::AcqRel) {
            info!("model resources released");
        }
    }
}

fn load_session(path: &Path) -> Result<Session, ModelError> {
    if !path.exists() {
        return Err(ModelError::Load {
            path: path.to_path_buf(),
            message: "file not found".to_string(),
        });
    }
    Session::builder()
        .map_err(|e| ModelError::Load {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?
        .commit_from_file(path)
        .map_err(|e| ModelError::Load {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// NCHW float tensor normalized to [0, 1]
fn image_to_tensor(img: &RgbImage) -> Array4<f32> {
    let (w, h) = (img.width() as usize, img.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, pixel) in img.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        tensor[[0, 0, y, x]] = pixel[0] as f32 / 255.0;
        tensor[[0, 1, y, x]] = pixel[1] as f32 / 255.0;
        tensor[[0, 2, y, x]] = pixel[2] as f32 / 255.0;
    }
    tensor
}

/// Clamp a box to image bounds, flooring origin and keeping at least the
/// in-bounds remainder.
fn clamp_bbox(bbox: &BBox, width: u32, height: u32) -> BBox {
    let x = bbox.x.max(0.0).min(width.saturating_sub(1) as f32).floor();
    let y = bbox.y.max(0.0).min(height.saturating_sub(1) as f32).floor();
    let w = bbox.w.min(width as f32 - x).max(0.0).floor();
    let h = bbox.h.min(height as f32 - y).max(0.0).floor();
    BBox::new(x, y, w, h)
}

/// Pose output is keypoints in crop-local pixel coordinates; map them back
/// into the frame through the crop box.
fn map_keypoints_to_frame(raw: &[f32], crop_box: &BBox) -> PoseFrame {
    let sx = crop_box.w / POSE_INPUT_W as f32;
    let sy = crop_box.h / POSE_INPUT_H as f32;
    let mut pose = [[0.0f32; 3]; NUM_KEYPOINTS];
    for (k, kp) in pose.iter_mut().enumerate() {
        let base = k * 3;
        kp[0] = crop_box.x + raw[base] * sx;
        kp[1] = crop_box.y + raw[base + 1] * sy;
        kp[2] = raw[base + 2];
    }
    pose
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_to_tensor_layout() {
        let mut img = RgbImage::new(2, 2);
        img.put_pixel(0, 0, image::Rgb([255, 0, 0]));
        img.put_pixel(1, 1, image::Rgb([0, 0, 128]));
        let t = image_to_tensor(&img);
        assert_eq!(t.shape(), &[1, 3, 2, 2]);
        assert!((t[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!((t[[0, 2, 1, 1]] - 128.0 / 255.0).abs() < 1e-3);
        assert_eq!(t[[0, 1, 0, 1]], 0.0);
    }

    #[test]
    fn test_clamp_bbox_inside_bounds() {
        let clamped = clamp_bbox(&BBox::new(-10.0, -5.0, 50.0, 50.0), 32, 32);
        assert_eq!(clamped.x, 0.0);
        assert_eq!(clamped.y, 0.0);
        assert_eq!(clamped.w, 32.0);
        assert_eq!(clamped.h, 32.0);

        let clamped = clamp_bbox(&BBox::new(20.0, 20.0, 50.0, 50.0), 32, 32);
        assert_eq!(clamped.w, 12.0);
        assert_eq!(clamped.h, 12.0);
    }

    #[test]
    fn test_map_keypoints_scales_into_frame() {
        let crop = BBox::new(100.0, 50.0, 96.0, 128.0);
        let mut raw = vec![0.0f32; NUM_KEYPOINTS * 3];
        // one keypoint at the crop input center with confidence 0.8
        raw[0] = POSE_INPUT_W as f32 / 2.0;
        raw[1] = POSE_INPUT_H as f32 / 2.0;
        raw[2] = 0.8;
        let pose = map_keypoints_to_frame(&raw, &crop);
        assert!((pose[0][0] - 148.0).abs() < 1e-3);
        assert!((pose[0][1] - 114.0).abs() < 1e-3);
        assert!((pose[0][2] - 0.8).abs() < 1e-6);
    }
}
