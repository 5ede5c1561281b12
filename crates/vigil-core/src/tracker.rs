//! Person Tracker
//!
//! Per-stream assignment of stable integer ids to detections across frames.
//! Association is greedy IoU against each live track's last box, processed in
//! descending detection confidence. Tracks that go unmatched for more than
//! `max_age` frames are destroyed; destroyed ids are drained by the caller so
//! the frame buffers can be dropped with them.

use crate::detect::{BBox, Detection};

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Minimum IoU for a detection to claim an existing track
    pub iou_threshold: f32,
    /// Frames a track may go unmatched before it is destroyed
    pub max_age: u32,
    /// Minimum confidence for an unmatched detection to open a new track
    pub min_confidence: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.3,
            max_age: 30,
            min_confidence: 0.45,
        }
    }
}

#[derive(Debug, Clone)]
struct Track {
    person_id: u32,
    bbox: BBox,
    last_seen_frame: u64,
    missed_frames: u32,
}

/// A person matched on the current frame
#[derive(Debug, Clone, Copy)]
pub struct TrackedPerson {
    pub person_id: u32,
    pub bbox: BBox,
}

pub struct PersonTracker {
    cfg: TrackerConfig,
    tracks: Vec<Track>,
    next_id: u32,
    removed: Vec<u32>,
}

impl PersonTracker {
    pub fn new(cfg: TrackerConfig) -> Self {
        Self {
            cfg,
            tracks: Vec::new(),
            next_id: 1,
            removed: Vec::new(),
        }
    }

    /// Associate the frame's detections with live tracks. Returns every
    /// person visible on this frame, sorted by id.
    pub fn update(&mut self, detections: &[Detection], frame_number: u64) -> Vec<TrackedPerson> {
        // Confidence-descending processing order implements the greedy
        // conflict resolution; ties keep input order.
        let mut order: Vec<usize> = (0..detections.len()).collect();
        order.sort_by(|&a, &b| {
            detections[b]
                .confidence
                .partial_cmp(&detections[a].confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut matched_tracks = vec![false; self.tracks.len()];
        let mut assignments: Vec<(usize, usize)> = Vec::new();
        let mut unmatched: Vec<usize> = Vec::new();

        for &det_idx in &order {
            let det = &detections[det_idx];
            let mut best: Option<(usize, f32)> = None;
            for (t_idx, track) in self.tracks.iter().enumerate() {
                if matched_tracks[t_idx] {
                    continue;
                }
                let iou = track.bbox.iou(&det.bbox);
                if iou < self.cfg.iou_threshold {
                    continue;
                }
                let better = match best {
                    None => true,
                    // equal IoU resolves to the lower existing id, which is
                    // the earlier entry in the id-ordered track list
                    Some((best_idx, best_iou)) => {
                        iou > best_iou
                            || (iou == best_iou
                                && self.tracks[t_idx].person_id
                                    < self.tracks[best_idx].person_id)
                    }
                };
                if better {
                    best = Some((t_idx, iou));
                }
            }
            match best {
                Some((t_idx, _)) => {
                    matched_tracks[t_idx] = true;
                    assignments.push((t_idx, det_idx));
                }
                None => unmatched.push(det_idx),
            }
        }

        for (t_idx, det_idx) in &assignments {
            let track = &mut self.tracks[*t_idx];
            track.bbox = detections[*det_idx].bbox;
            track.last_seen_frame = frame_number;
            track.missed_frames = 0;
        }

        for det_idx in unmatched {
            let det = &detections[det_idx];
            if det.confidence < self.cfg.min_confidence {
                continue;
            }
            let person_id = self.next_id;
            self.next_id += 1;
            self.tracks.push(Track {
                person_id,
                bbox: det.bbox,
                last_seen_frame: frame_number,
                missed_frames: 0,
            });
        }

        // Age out tracks that went unmatched this frame
        let max_age = self.cfg.max_age;
        let removed = &mut self.removed;
        self.tracks.retain_mut(|track| {
            if track.last_seen_frame == frame_number {
                return true;
            }
            track.missed_frames += 1;
            if track.missed_frames > max_age {
                removed.push(track.person_id);
                false
            } else {
                true
            }
        });

        let mut visible: Vec<TrackedPerson> = self
            .tracks
            .iter()
            .filter(|t| t.last_seen_frame == frame_number)
            .map(|t| TrackedPerson {
                person_id: t.person_id,
                bbox: t.bbox,
            })
            .collect();
        visible.sort_by_key(|p| p.person_id);
        visible
    }

    /// Ids destroyed since the last call
    pub fn take_removed(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.removed)
    }

    pub fn live_tracks(&self) -> usize {
        self.tracks.len()
    }
}
