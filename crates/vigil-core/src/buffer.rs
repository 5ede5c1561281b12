//! Frame Buffer Manager
//!
//! Per-stream store of the last N pose frames for every tracked person. The
//! classifier only ever sees complete N-length sequences; `PoseSequence` can
//! only be produced by `sequence()` once a buffer is full, which makes a
//! partial classification unrepresentable.

use std::collections::{HashMap, VecDeque};

use ndarray::Array4;

use crate::detect::{PoseFrame, KEYPOINT_DIMS, NUM_KEYPOINTS};

/// Pose sequence length fed to the anomaly classifier
pub const SEQUENCE_LENGTH: usize = 24;

/// A complete fixed-length pose sequence for one person
#[derive(Debug, Clone)]
pub struct PoseSequence {
    pub person_id: u32,
    frames: Vec<PoseFrame>,
}

impl PoseSequence {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[PoseFrame] {
        &self.frames
    }

    /// Flatten into the `[1, N, 17, 3]` classifier input
    pub fn to_tensor(&self) -> Array4<f32> {
        let n = self.frames.len();
        let mut tensor = Array4::<f32>::zeros((1, n, NUM_KEYPOINTS, KEYPOINT_DIMS));
        for (f, frame) in self.frames.iter().enumerate() {
            for (k, kp) in frame.iter().enumerate() {
                for (d, v) in kp.iter().enumerate() {
                    tensor[[0, f, k, d]] = *v;
                }
            }
        }
        tensor
    }

    /// Nested list form persisted with training samples
    pub fn to_nested(&self) -> Vec<Vec<Vec<f32>>> {
        self.frames
            .iter()
            .map(|frame| frame.iter().map(|kp| kp.to_vec()).collect())
            .collect()
    }
}

/// Bounded per-person FIFO of pose frames
pub struct FrameBufferManager {
    capacity: usize,
    buffers: HashMap<u32, VecDeque<PoseFrame>>,
}

impl FrameBufferManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buffers: HashMap::new(),
        }
    }

    /// Append a pose frame, evicting the oldest when at capacity
    pub fn push(&mut self, person_id: u32, frame: PoseFrame) {
        let buffer = self
            .buffers
            .entry(person_id)
            .or_insert_with(|| VecDeque::with_capacity(self.capacity));
        if buffer.len() == self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(frame);
    }

    /// The full sequence for a person, only once the buffer holds exactly
    /// `capacity` frames
    pub fn sequence(&self, person_id: u32) -> Option<PoseSequence> {
        let buffer = self.buffers.get(&person_id)?;
        if buffer.len() != self.capacity {
            return None;
        }
        Some(PoseSequence {
            person_id,
            frames: buffer.iter().copied().collect(),
        })
    }

    /// Remove a person's buffer when their track dies
    pub fn drop_person(&mut self, person_id: u32) {
        self.buffers.remove(&person_id);
    }

    /// Current buffered state of every person, for evidence preservation
    pub fn snapshot_all(&self) -> HashMap<u32, Vec<PoseFrame>> {
        self.buffers
            .iter()
            .map(|(id, frames)| (*id, frames.iter().copied().collect()))
            .collect()
    }

    pub fn len(&self, person_id: u32) -> usize {
        self.buffers.get(&person_id).map_or(0, |b| b.len())
    }

    pub fn tracked_persons(&self) -> usize {
        self.buffers.len()
    }
}
