//! Anomaly Recorder
//!
//! Persistence path for positive classifications: evidence JPEG to the
//! object store, then the event row and its training sample in a single
//! transaction. The WebSocket alert has already shipped by the time this
//! runs, so nothing here propagates; failures degrade to logs and a metric.
//!
//! A database failure after the JPEG exists leaves the file in place. An
//! orphan image is recoverable evidence, a deleted one is not.

use serde_json::json;
use sqlx::SqlitePool;
use tracing::{error, info, warn};
use uuid::Uuid;
use vigil_core::detect::Severity;
use vigil_core::processor::{EvidenceRecorder, RecordRequest};

use crate::db::{self, NewAnomalyEvent, NewTrainingSample};
use crate::metrics::RECORDER_FAILURES;
use crate::storage::EvidenceStore;

pub struct Recorder {
    pool: SqlitePool,
    store: EvidenceStore,
}

impl Recorder {
    pub fn new(pool: SqlitePool, store: EvidenceStore) -> Self {
        Self { pool, store }
    }

    async fn record_inner(&self, request: &RecordRequest) -> Result<(), RecordFailure> {
        let image_ref = self
            .store
            .save_jpeg(request.shop_id, &request.annotated_jpeg)
            .await
            .map_err(|e| RecordFailure::Storage(e.to_string()))?;

        let escalate = request
            .extra
            .get("escalate")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let severity = Severity::from_bucket(request.verdict.confidence, escalate);

        let event = NewAnomalyEvent {
            id: Uuid::new_v4(),
            shop_id: request.shop_id,
            timestamp: chrono::Utc::now(),
            location: request.location.clone(),
            severity: severity.as_str().to_string(),
            description: request.description.clone(),
            image_ref: image_ref.clone(),
            anomaly_type: request.anomaly_type.clone(),
            confidence_score: score_to_unit(request.verdict.score),
            extra: request.extra.clone(),
        };
        let sample = NewTrainingSample {
            id: Uuid::new_v4(),
            pose_dict: pose_dict_json(request),
            stream_id: request.stream_id,
            frame_number: request.verdict.frame_number,
            predicted_score: request.verdict.score,
            predicted_confidence_bucket: request.verdict.confidence.as_str().to_string(),
        };

        // one retry on transaction failure, then give up
        let mut attempt = 0;
        loop {
            match db::insert_event_with_sample(&self.pool, &event, &sample).await {
                Ok(()) => {
                    info!(
                        event = %event.id,
                        shop = %request.shop_id,
                        severity = %event.severity,
                        image = %image_ref,
                        "anomaly recorded"
                    );
                    return Ok(());
                }
                Err(e) if attempt == 0 => {
                    warn!(error = %e, "anomaly insert failed, retrying once");
                    attempt += 1;
                }
                Err(e) => {
                    return Err(RecordFailure::Database {
                        message: e.to_string(),
                        orphan: image_ref,
                    });
                }
            }
        }
    }
}

enum RecordFailure {
    Storage(String),
    Database { message: String, orphan: String },
}

#[async_trait::async_trait]
impl EvidenceRecorder for Recorder {
    async fn record(&self, request: RecordRequest) {
        match self.record_inner(&request).await {
            Ok(()) => {}
            Err(RecordFailure::Storage(message)) => {
                RECORDER_FAILURES.inc();
                error!(shop = %request.shop_id, error = %message, "evidence write failed, recording aborted");
            }
            Err(RecordFailure::Database { message, orphan }) => {
                RECORDER_FAILURES.inc();
                error!(shop = %request.shop_id, error = %message, "anomaly insert failed after retry");
                warn!(path = %orphan, "evidence JPEG left in place without an event row");
            }
        }
    }
}

/// Pose dict persisted as `{person_id: [frames][17][3]}`
fn pose_dict_json(request: &RecordRequest) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = request
        .pose_dict
        .iter()
        .map(|(person_id, frames)| {
            let frames: Vec<Vec<Vec<f32>>> = frames
                .iter()
                .map(|frame| frame.iter().map(|kp| kp.to_vec()).collect())
                .collect();
            (person_id.to_string(), json!(frames))
        })
        .collect();
    serde_json::Value::Object(map)
}

/// Fold the unbounded log-likelihood into the [0, 1] confidence column
fn score_to_unit(score: f32) -> f32 {
    (score.abs() / (1.0 + score.abs())).clamp(0.0, 1.0)
}
