//! Per-session multi-object tracker, §4.10 step 3.
//!
//! BoT-SORT and similar trackers fuse appearance embeddings with motion
//! prediction; that is a different algorithmic domain than anything the
//! corpus shows. The corpus's own multi-object association
//! (`flydra2`'s `tracking_core`) matches 3-D points across cameras via a
//! Kalman filter and the Hungarian algorithm over reprojection error — not
//! 2-D boxes within one camera's frame stream. This tracker keeps just the
//! invariant the pipeline actually needs: identity survives across frames
//! by best-IoU match, and is wiped at session boundaries so no track_id
//! leaks between sessions (P6).

use crate::postprocess::RawDetection;

const MIN_TRACK_IOU: f32 = 0.3;
const MAX_MISSED_FRAMES: u32 = 5;

fn iou(a: [f32; 4], b: [f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = a[2].min(b[2]);
    let y2 = a[3].min(b[3]);
    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

struct Track {
    id: u64,
    class_id: usize,
    bbox: [f32; 4],
    missed: u32,
}

/// Per-session tracker state. A new instance (or [`Tracker::reset`]) is
/// required at every session boundary, per P6.
pub struct Tracker {
    tracks: Vec<Track>,
    next_id: u64,
}

impl Tracker {
    pub fn new() -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    /// Clears all track state. Called when a connection's `session_id`
    /// changes, including into and out of the empty (no session) state.
    pub fn reset(&mut self) {
        self.tracks.clear();
        self.next_id = 1;
    }

    /// Matches `detections` against existing tracks by greedy best-IoU
    /// within the same class, ages out unmatched tracks, and assigns
    /// fresh ids to unmatched detections. Returns one track_id per input
    /// detection, same order.
    pub fn update(&mut self, detections: &[RawDetection]) -> Vec<u64> {
        let mut assigned: Vec<Option<u64>> = vec![None; detections.len()];
        let mut used_tracks = vec![false; self.tracks.len()];

        let mut candidates: Vec<(usize, usize, f32)> = Vec::new();
        for (di, det) in detections.iter().enumerate() {
            for (ti, track) in self.tracks.iter().enumerate() {
                if track.class_id != det.class_id {
                    continue;
                }
                let score = iou(det.bbox_xyxy, track.bbox);
                if score >= MIN_TRACK_IOU {
                    candidates.push((di, ti, score));
                }
            }
        }
        candidates.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

        for (di, ti, _) in candidates {
            if assigned[di].is_some() || used_tracks[ti] {
                continue;
            }
            assigned[di] = Some(self.tracks[ti].id);
            used_tracks[ti] = true;
            self.tracks[ti].bbox = detections[di].bbox_xyxy;
            self.tracks[ti].missed = 0;
        }

        for (ti, track) in self.tracks.iter_mut().enumerate() {
            if !used_tracks[ti] {
                track.missed += 1;
            }
        }
        self.tracks.retain(|t| t.missed <= MAX_MISSED_FRAMES);

        for (di, det) in detections.iter().enumerate() {
            if assigned[di].is_none() {
                let id = self.next_id;
                self.next_id += 1;
                self.tracks.push(Track {
                    id,
                    class_id: det.class_id,
                    bbox: det.bbox_xyxy,
                    missed: 0,
                });
                assigned[di] = Some(id);
            }
        }

        assigned.into_iter().map(|id| id.expect("every detection is assigned a track_id above")).collect()
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(bbox: [f32; 4], class_id: usize) -> RawDetection {
        RawDetection {
            bbox_xyxy: bbox,
            confidence: 0.9,
            class_id,
        }
    }

    #[test]
    fn same_object_keeps_track_id_across_frames() {
        let mut tracker = Tracker::new();
        let ids1 = tracker.update(&[det([0.0, 0.0, 10.0, 10.0], 0)]);
        let ids2 = tracker.update(&[det([1.0, 1.0, 11.0, 11.0], 0)]);
        assert_eq!(ids1, ids2);
    }

    #[test]
    fn distinct_objects_get_distinct_ids() {
        let mut tracker = Tracker::new();
        let ids = tracker.update(&[
            det([0.0, 0.0, 10.0, 10.0], 0),
            det([100.0, 100.0, 110.0, 110.0], 0),
        ]);
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn different_classes_never_share_a_track_even_with_identical_boxes() {
        let mut tracker = Tracker::new();
        let ids1 = tracker.update(&[det([0.0, 0.0, 10.0, 10.0], 0)]);
        let ids2 = tracker.update(&[det([0.0, 0.0, 10.0, 10.0], 1)]);
        assert_ne!(ids1[0], ids2[0]);
    }

    #[test]
    fn reset_restarts_id_allocation() {
        let mut tracker = Tracker::new();
        let ids1 = tracker.update(&[det([0.0, 0.0, 10.0, 10.0], 0)]);
        tracker.reset();
        let ids2 = tracker.update(&[det([200.0, 200.0, 210.0, 210.0], 0)]);
        assert_eq!(ids1, ids2);
    }

    #[test]
    fn a_missing_object_is_dropped_after_max_missed_frames() {
        let mut tracker = Tracker::new();
        tracker.update(&[det([0.0, 0.0, 10.0, 10.0], 0)]);
        for _ in 0..MAX_MISSED_FRAMES {
            tracker.update(&[]);
        }
        assert!(tracker.tracks.is_empty());
    }
}
