//! Vigil Core: Real-Time Video Anomaly Detection Pipeline
//!
//! The per-stream AI pipeline behind the Vigil service:
//! - Person detection (YOLO-family ONNX model)
//! - IoU tracking with stable per-stream person ids
//! - Per-person pose buffering into fixed-length sequences
//! - Normalizing-flow sequence classification (log-likelihood scoring)
//! - Frame annotation and JPEG evidence encoding
//!
//! Heavy model state lives in one [`models::ModelManager`] loaded at startup;
//! stream processors are cheap per-stream values that borrow it through the
//! bounded [`infer::InferencePool`]. Alerting and persistence are reached
//! only through the [`processor::AlertSink`] and
//! [`processor::EvidenceRecorder`] seams, so this crate never depends on the
//! service's transport or storage.

pub mod annotate;
pub mod buffer;
pub mod detect;
pub mod infer;
pub mod models;
pub mod processor;
pub mod tracker;

pub use buffer::{FrameBufferManager, PoseSequence, SEQUENCE_LENGTH};
pub use detect::{BBox, ConfidenceBucket, Detection, PersonVerdict, PoseFrame, Severity};
pub use infer::{Inference, InferenceError, InferencePool};
pub use models::{ModelConfig, ModelError, ModelManager, PoseConfig};
pub use processor::{
    AlertSink, AnomalyAlert, EvidenceRecorder, FrameReport, ProcessorConfig, ProcessorState,
    RecordRequest, StreamProcessor,
};
pub use tracker::{PersonTracker, TrackedPerson, TrackerConfig};
