//! Detection and Verdict Types
//!
//! Shared vocabulary of the pipeline: bounding boxes, person detections,
//! pose frames, confidence buckets and the per-person verdict emitted by the
//! stream processor. Also hosts the pure YOLO postprocessing (person class
//! filter plus greedy NMS) so it can be tested without a loaded model.

use serde::{Deserialize, Serialize};

/// Number of COCO keypoints per pose frame
pub const NUM_KEYPOINTS: usize = 17;

/// Values per keypoint: x, y, confidence
pub const KEYPOINT_DIMS: usize = 3;

/// One pose frame: 17 keypoints, each (x, y, confidence) in frame coordinates
pub type PoseFrame = [[f32; KEYPOINT_DIMS]; NUM_KEYPOINTS];

/// Axis-aligned bounding box in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    /// Intersection-over-union with another box. 0.0 for disjoint boxes,
    /// 1.0 for identical ones.
    pub fn iou(&self, other: &BBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.w).min(other.x + other.w);
        let y2 = (self.y + self.h).min(other.y + other.h);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            return 0.0;
        }
        inter / union
    }
}

/// A single person detection from the detector
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub bbox: BBox,
    /// Detector confidence in [0, 1]
    pub confidence: f32,
}

/// Discretized confidence of an anomaly decision, from the absolute
/// classifier score against the configured cuts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConfidenceBucket {
    Low,
    Medium,
    High,
}

impl ConfidenceBucket {
    pub fn from_score(score: f32, high_cut: f32, medium_cut: f32) -> Self {
        let magnitude = score.abs();
        if magnitude >= high_cut {
            Self::High
        } else if magnitude >= medium_cut {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }
}

/// Severity of a persisted anomaly event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Bucket-to-severity mapping. Escalation to `Critical` happens only on
    /// an explicit request carried in the event extras.
    pub fn from_bucket(bucket: ConfidenceBucket, escalate: bool) -> Self {
        if escalate {
            return Self::Critical;
        }
        match bucket {
            ConfidenceBucket::Low => Self::Low,
            ConfidenceBucket::Medium => Self::Medium,
            ConfidenceBucket::High => Self::High,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

/// Classification outcome for one tracked person on one frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonVerdict {
    pub person_id: u32,
    pub frame_number: u64,
    pub bbox: BBox,
    /// Raw classifier score: log-likelihood under normal behavior,
    /// lower means more anomalous
    pub score: f32,
    pub is_abnormal: bool,
    pub confidence: ConfidenceBucket,
}

impl PersonVerdict {
    pub fn classification(&self) -> &'static str {
        if self.is_abnormal {
            "Abnormal"
        } else {
            "Normal"
        }
    }

    /// Compact human-readable summary used for alerts and event rows
    pub fn reason(&self) -> String {
        format!(
            "{} behavior for person {} (score {:.2}, confidence {})",
            self.classification(),
            self.person_id,
            self.score,
            self.confidence.as_str()
        )
    }
}

/// Raw detector output layout: `[1, 4 + classes, anchors]`, xywh rows first.
/// Person is class index 0. Returns boxes in model input coordinates.
pub fn parse_detections(
    shape: &[usize],
    data: &[f32],
    min_confidence: f32,
) -> Vec<Detection> {
    if shape.len() != 3 || shape[1] < 5 {
        return Vec::new();
    }
    let channels = shape[1];
    let anchors = shape[2];
    if data.len() < channels * anchors {
        return Vec::new();
    }

    let row = |c: usize, a: usize| data[c * anchors + a];

    let mut detections = Vec::new();
    for a in 0..anchors {
        let confidence = row(4, a);
        if confidence < min_confidence {
            continue;
        }
        let cx = row(0, a);
        let cy = row(1, a);
        let w = row(2, a);
        let h = row(3, a);
        detections.push(Detection {
            bbox: BBox::new(cx - w / 2.0, cy - h / 2.0, w, h),
            confidence,
        });
    }
    detections
}

/// Greedy non-maximum suppression by descending confidence
pub fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for det in detections {
        if kept.iter().all(|k| k.bbox.iou(&det.bbox) < iou_threshold) {
            kept.push(det);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou_disjoint_and_identical() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(20.0, 20.0, 10.0, 10.0);
        assert_eq!(a.iou(&b), 0.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_half_overlap() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(5.0, 0.0, 10.0, 10.0);
        // intersection 50, union 150
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_bucket_boundaries() {
        assert_eq!(
            ConfidenceBucket::from_score(-3.2, 3.0, 1.5),
            ConfidenceBucket::High
        );
        assert_eq!(
            ConfidenceBucket::from_score(-2.0, 3.0, 1.5),
            ConfidenceBucket::Medium
        );
        assert_eq!(
            ConfidenceBucket::from_score(-0.5, 3.0, 1.5),
            ConfidenceBucket::Low
        );
        // exact cut lands in the higher bucket
        assert_eq!(
            ConfidenceBucket::from_score(3.0, 3.0, 1.5),
            ConfidenceBucket::High
        );
    }

    #[test]
    fn test_severity_mapping() {
        assert_eq!(
            Severity::from_bucket(ConfidenceBucket::High, false),
            Severity::High
        );
        assert_eq!(
            Severity::from_bucket(ConfidenceBucket::Medium, false),
            Severity::Medium
        );
        assert_eq!(
            Severity::from_bucket(ConfidenceBucket::Low, false),
            Severity::Low
        );
        assert_eq!(
            Severity::from_bucket(ConfidenceBucket::Low, true),
            Severity::Critical
        );
    }

    #[test]
    fn test_parse_detections_filters_confidence() {
        // 1 batch, 5 channels (xywh + person), 3 anchors
        let shape = [1usize, 5, 3];
        #[rustfmt::skip]
        let data = [
            // cx      cy      w       h       conf
            100.0,  200.0,  300.0,
            100.0,  200.0,  300.0,
             50.0,   50.0,   50.0,
             80.0,   80.0,   80.0,
              0.9,    0.3,    0.6,
        ];
        let dets = parse_detections(&shape, &data, 0.45);
        assert_eq!(dets.len(), 2);
        assert!((dets[0].confidence - 0.9).abs() < 1e-6);
        // center 100,100 with 50x80 box
        assert!((dets[0].bbox.x - 75.0).abs() < 1e-6);
        assert!((dets[0].bbox.y - 60.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_suppresses_overlaps() {
        let dets = vec![
            Detection {
                bbox: BBox::new(0.0, 0.0, 10.0, 10.0),
                confidence: 0.9,
            },
            Detection {
                bbox: BBox::new(1.0, 1.0, 10.0, 10.0),
                confidence: 0.8,
            },
            Detection {
                bbox: BBox::new(50.0, 50.0, 10.0, 10.0),
                confidence: 0.7,
            },
        ];
        let kept = nms(dets, 0.45);
        assert_eq!(kept.len(), 2);
        assert!((kept[0].confidence - 0.9).abs() < 1e-6);
        assert!((kept[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_verdict_reason() {
        let verdict = PersonVerdict {
            person_id: 1,
            frame_number: 24,
            bbox: BBox::new(0.0, 0.0, 10.0, 10.0),
            score: -3.2,
            is_abnormal: true,
            confidence: ConfidenceBucket::High,
        };
        assert_eq!(verdict.classification(), "Abnormal");
        assert!(verdict.reason().contains("person 1"));
        assert!(verdict.reason().contains("HIGH"));
    }
}
