//! Stream Processor
//!
//! Per-stream orchestration of the frame pipeline: detect, track, buffer
//! poses, classify full sequences, annotate and fan the positives out to the
//! alert sink and the evidence recorder. One processor owns one stream's
//! tracker and buffers; nothing outside it mutates them.
//!
//! Every error below startup is local to the frame that raised it. A failed
//! detection or classification drops that work and the stream keeps going.

use std::collections::HashMap;
use std::sync::Arc;

use ab_glyph::FontArc;
use image::RgbImage;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::annotate::{annotate_frame, encode_jpeg, JPEG_QUALITY};
use crate::buffer::{FrameBufferManager, SEQUENCE_LENGTH};
use crate::detect::{ConfidenceBucket, PersonVerdict, PoseFrame};
use crate::infer::{Inference, InferenceError};
use crate::tracker::{PersonTracker, TrackerConfig};

/// Per-stream pipeline thresholds
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Minimum detector confidence for a person detection
    pub person_confidence: f32,
    /// Decision cut on the classifier score; scores below it are abnormal
    /// (the classifier emits log-likelihood under normal behavior)
    pub anomaly_threshold: f32,
    /// Absolute-score cut for the HIGH confidence bucket
    pub high_cut: f32,
    /// Absolute-score cut for the MEDIUM confidence bucket
    pub medium_cut: f32,
    pub sequence_length: usize,
    pub tracker: TrackerConfig,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            person_confidence: 0.45,
            anomaly_threshold: -2.0,
            high_cut: 3.0,
            medium_cut: 1.5,
            sequence_length: SEQUENCE_LENGTH,
            tracker: TrackerConfig::default(),
        }
    }
}

/// An anomaly headed for the per-user alert channel
#[derive(Debug, Clone)]
pub struct AnomalyAlert {
    pub user_id: Uuid,
    pub shop_id: Uuid,
    pub stream_id: Uuid,
    pub location: String,
    pub verdict: PersonVerdict,
    pub annotated_jpeg: Arc<Vec<u8>>,
}

/// An anomaly headed for persistence: evidence image, event row and the pose
/// tensor kept for later supervised re-training
#[derive(Debug, Clone)]
pub struct RecordRequest {
    pub shop_id: Uuid,
    pub stream_id: Uuid,
    pub location: String,
    pub description: String,
    pub anomaly_type: String,
    pub annotated_jpeg: Arc<Vec<u8>>,
    pub verdict: PersonVerdict,
    pub pose_dict: HashMap<u32, Vec<PoseFrame>>,
    /// Forward-compatible payload stored on the event row
    pub extra: serde_json::Value,
}

/// Consumer of anomaly alerts, implemented by the per-user channel hub
#[async_trait::async_trait]
pub trait AlertSink: Send + Sync {
    async fn push_anomaly(&self, alert: AnomalyAlert);
}

/// Consumer of anomaly evidence, implemented by the persistence layer
#[async_trait::async_trait]
pub trait EvidenceRecorder: Send + Sync {
    async fn record(&self, request: RecordRequest);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// What one frame produced, mostly for observability and tests
#[derive(Debug, Default)]
pub struct FrameReport {
    pub frame_number: u64,
    pub persons: usize,
    pub classified: usize,
    pub anomalies: usize,
}

struct PipelineState {
    state: ProcessorState,
    frame_number: u64,
    tracker: PersonTracker,
    buffers: FrameBufferManager,
}

pub struct StreamProcessor {
    stream_id: Uuid,
    user_id: Uuid,
    shop_id: Uuid,
    location: String,
    cfg: ProcessorConfig,
    inference: Arc<dyn Inference>,
    alerts: Arc<dyn AlertSink>,
    recorder: Arc<dyn EvidenceRecorder>,
    font: Option<FontArc>,
    pipeline: Mutex<PipelineState>,
}

impl StreamProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream_id: Uuid,
        user_id: Uuid,
        shop_id: Uuid,
        location: String,
        cfg: ProcessorConfig,
        inference: Arc<dyn Inference>,
        alerts: Arc<dyn AlertSink>,
        recorder: Arc<dyn EvidenceRecorder>,
        font: Option<FontArc>,
    ) -> Self {
        let tracker = PersonTracker::new(cfg.tracker.clone());
        let buffers = FrameBufferManager::new(cfg.sequence_length);
        Self {
            stream_id,
            user_id,
            shop_id,
            location,
            cfg,
            inference,
            alerts,
            recorder,
            font,
            pipeline: Mutex::new(PipelineState {
                state: ProcessorState::Idle,
                frame_number: 0,
                tracker,
                buffers,
            }),
        }
    }

    pub fn stream_id(&self) -> Uuid {
        self.stream_id
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub async fn state(&self) -> ProcessorState {
        self.pipeline.lock().await.state
    }

    /// Run one decoded frame through the pipeline
    pub async fn process_frame(&self, frame: RgbImage) -> FrameReport {
        let mut pipeline = self.pipeline.lock().await;
        match pipeline.state {
            ProcessorState::Idle => pipeline.state = ProcessorState::Running,
            ProcessorState::Running => {}
            ProcessorState::Stopping | ProcessorState::Stopped => {
                return FrameReport::default();
            }
        }

        let frame_number = pipeline.frame_number;
        pipeline.frame_number += 1;

        let mut report = FrameReport {
            frame_number,
            ..Default::default()
        };

        let frame = Arc::new(frame);

        let detections = match self
            .inference
            .detect(frame.clone(), self.cfg.person_confidence)
            .await
        {
            Ok(detections) => detections,
            Err(InferenceError::Saturated) => {
                debug!(stream = %self.stream_id, frame_number, "inference saturated, frame dropped");
                return report;
            }
            Err(e) => {
                warn!(stream = %self.stream_id, frame_number, error = %e, "detection failed, frame dropped");
                return report;
            }
        };

        let tracked = pipeline.tracker.update(&detections, frame_number);
        report.persons = tracked.len();

        for person_id in pipeline.tracker.take_removed() {
            pipeline.buffers.drop_person(person_id);
        }

        for person in &tracked {
            match self.inference.pose(frame.clone(), person.bbox).await {
                Ok(pose) => pipeline.buffers.push(person.person_id, pose),
                Err(e) => {
                    warn!(
                        stream = %self.stream_id,
                        person = person.person_id,
                        error = %e,
                        "pose estimation failed, keypoints skipped"
                    );
                }
            }
        }

        // One classification per visible person per frame, full buffers only
        let mut verdicts: Vec<PersonVerdict> = Vec::new();
        for person in &tracked {
            let Some(sequence) = pipeline.buffers.sequence(person.person_id) else {
                continue;
            };
            let score = match self.inference.classify(sequence).await {
                Ok(score) => score,
                Err(e) => {
                    warn!(
                        stream = %self.stream_id,
                        person = person.person_id,
                        error = %e,
                        "classification failed"
                    );
                    continue;
                }
            };
            report.classified += 1;
            let is_abnormal = score < self.cfg.anomaly_threshold;
            verdicts.push(PersonVerdict {
                person_id: person.person_id,
                frame_number,
                bbox: person.bbox,
                score,
                is_abnormal,
                confidence: ConfidenceBucket::from_score(
                    score,
                    self.cfg.high_cut,
                    self.cfg.medium_cut,
                ),
            });
        }

        let abnormal: Vec<&PersonVerdict> = verdicts.iter().filter(|v| v.is_abnormal).collect();
        report.anomalies = abnormal.len();
        if abnormal.is_empty() {
            return report;
        }

        let annotated = annotate_frame(&frame, &tracked, &verdicts, self.font.as_ref());
        let jpeg = match encode_jpeg(&annotated, JPEG_QUALITY) {
            Ok(bytes) => Arc::new(bytes),
            Err(e) => {
                warn!(stream = %self.stream_id, error = %e, "evidence encode failed");
                return report;
            }
        };

        let pose_dict = pipeline.buffers.snapshot_all();
        drop(pipeline);

        for verdict in abnormal {
            let alert = AnomalyAlert {
                user_id: self.user_id,
                shop_id: self.shop_id,
                stream_id: self.stream_id,
                location: self.location.clone(),
                verdict: verdict.clone(),
                annotated_jpeg: jpeg.clone(),
            };
            self.alerts.push_anomaly(alert).await;

            let extra = json!({
                "person_id": verdict.person_id,
                "bbox": verdict.bbox,
                "frame_number": verdict.frame_number,
                "raw_score": verdict.score,
            });
            self.recorder
                .record(RecordRequest {
                    shop_id: self.shop_id,
                    stream_id: self.stream_id,
                    location: self.location.clone(),
                    description: verdict.reason(),
                    anomaly_type: "abnormal_behavior".to_string(),
                    annotated_jpeg: jpeg.clone(),
                    verdict: verdict.clone(),
                    pose_dict: pose_dict.clone(),
                    extra,
                })
                .await;
        }

        report
    }

    /// Drop all per-stream state. Idempotent; called on peer-connection
    /// teardown.
    pub async fn stop(&self) {
        let mut pipeline = self.pipeline.lock().await;
        if pipeline.state == ProcessorState::Stopped {
            return;
        }
        pipeline.state = ProcessorState::Stopping;
        pipeline.tracker = PersonTracker::new(self.cfg.tracker.clone());
        pipeline.buffers = FrameBufferManager::new(self.cfg.sequence_length);
        pipeline.state = ProcessorState::Stopped;
        debug!(stream = %self.stream_id, "processor stopped");
    }
}
