//! Bounded Inference Pool
//!
//! CPU-bound model calls run on dedicated OS worker threads fed by a bounded
//! queue, so forward passes never block the async scheduler. A full queue
//! rejects the job immediately and the caller drops that frame; the pipeline
//! sheds load instead of queueing unbounded work.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use image::RgbImage;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::info;

use crate::buffer::PoseSequence;
use crate::detect::{BBox, Detection, PoseFrame};
use crate::models::{ModelError, ModelManager};

/// Seam between the stream processors and the model runtime. Production uses
/// [`InferencePool`]; tests script the outputs.
#[async_trait::async_trait]
pub trait Inference: Send + Sync {
    async fn detect(
        &self,
        frame: Arc<RgbImage>,
        min_confidence: f32,
    ) -> Result<Vec<Detection>, InferenceError>;

    async fn pose(&self, frame: Arc<RgbImage>, bbox: BBox) -> Result<PoseFrame, InferenceError>;

    async fn classify(&self, sequence: PoseSequence) -> Result<f32, InferenceError>;
}

#[derive(Debug, Error)]
pub enum InferenceError {
    /// Queue full: the frame should be dropped, not retried
    #[error("inference queue saturated")]
    Saturated,
    #[error("inference workers stopped")]
    WorkerGone,
    #[error(transparent)]
    Model(#[from] ModelError),
}

enum Job {
    Detect {
        frame: Arc<RgbImage>,
        min_confidence: f32,
        reply: oneshot::Sender<Result<Vec<Detection>, ModelError>>,
    },
    Pose {
        frame: Arc<RgbImage>,
        bbox: BBox,
        reply: oneshot::Sender<Result<PoseFrame, ModelError>>,
    },
    Classify {
        sequence: PoseSequence,
        reply: oneshot::Sender<Result<f32, ModelError>>,
    },
}

pub struct InferencePool {
    tx: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl InferencePool {
    pub fn new(models: Arc<ModelManager>, worker_count: usize, queue_capacity: usize) -> Self {
        let (tx, rx) = bounded::<Job>(queue_capacity);

        let mut workers = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let rx = rx.clone();
            let models = models.clone();
            let handle = thread::Builder::new()
                .name(format!("vigil-infer-{id}"))
                .spawn(move || worker_loop(id, rx, models))
                .expect("failed to spawn inference worker");
            workers.push(handle);
        }

        Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    fn submit(&self, job: Job) -> Result<(), InferenceError> {
        let guard = self.tx.lock().expect("pool sender lock poisoned");
        let tx = guard.as_ref().ok_or(InferenceError::WorkerGone)?;
        tx.try_send(job).map_err(|e| match e {
            TrySendError::Full(_) => InferenceError::Saturated,
            TrySendError::Disconnected(_) => InferenceError::WorkerGone,
        })
    }

    /// Close the queue and join the workers. Jobs already queued are drained
    /// before the threads exit.
    pub fn shutdown(&self) {
        self.tx.lock().expect("pool sender lock poisoned").take();
        let mut workers = self.workers.lock().expect("pool worker lock poisoned");
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[async_trait::async_trait]
impl Inference for InferencePool {
    async fn detect(
        &self,
        frame: Arc<RgbImage>,
        min_confidence: f32,
    ) -> Result<Vec<Detection>, InferenceError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Job::Detect {
            frame,
            min_confidence,
            reply,
        })?;
        rx.await
            .map_err(|_| InferenceError::WorkerGone)?
            .map_err(Into::into)
    }

    async fn pose(&self, frame: Arc<RgbImage>, bbox: BBox) -> Result<PoseFrame, InferenceError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Job::Pose { frame, bbox, reply })?;
        rx.await
            .map_err(|_| InferenceError::WorkerGone)?
            .map_err(Into::into)
    }

    async fn classify(&self, sequence: PoseSequence) -> Result<f32, InferenceError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Job::Classify { sequence, reply })?;
        rx.await
            .map_err(|_| InferenceError::WorkerGone)?
            .map_err(Into::into)
    }
}

fn worker_loop(id: usize, rx: Receiver<Job>, models: Arc<ModelManager>) {
    info!(worker = id, "inference worker active");
    while let Ok(job) = rx.recv() {
        match job {
            Job::Detect {
                frame,
                min_confidence,
                reply,
            } => {
                let _ = reply.send(models.detect_persons(&frame, min_confidence));
            }
            Job::Pose { frame, bbox, reply } => {
                let _ = reply.send(models.estimate_pose(&frame, &bbox));
            }
            Job::Classify { sequence, reply } => {
                let _ = reply.send(models.classify_sequence(&sequence));
            }
        }
    }
    info!(worker = id, "inference worker stopped");
}
