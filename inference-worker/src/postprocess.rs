//! Converts raw model output into named, filtered detections, §4.10 step 2.
//!
//! Auto-detection: a last dimension of 6 means the backend already ran
//! NMS (`[x1,y1,x2,y2,conf,cls]` rows, [`ModelOutput::NmsIntegrated`]);
//! anything else is treated as a dense `[4+C, N]` grid needing IoU
//! suppression here ([`ModelOutput::Dense`]).

use crate::model::ModelOutput;

#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub bbox_xyxy: [f32; 4],
    pub confidence: f32,
    pub class_id: usize,
}

const DEFAULT_IOU_THRESHOLD: f32 = 0.45;

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

/// Greedy highest-confidence-first NMS, suppressing only within the same
/// class.
fn nms(mut rows: Vec<(usize, [f32; 4], f32)>, iou_threshold: f32) -> Vec<(usize, [f32; 4], f32)> {
    rows.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
    let mut kept: Vec<(usize, [f32; 4], f32)> = Vec::new();
    'outer: for row in rows {
        for k in &kept {
            if k.0 == row.0 && iou(k.1, row.1) > iou_threshold {
                continue 'outer;
            }
        }
        kept.push(row);
    }
    kept
}

fn dense_to_rows(boxes: &[[f32; 4]], class_scores: &[Vec<f32>]) -> Vec<(usize, [f32; 4], f32)> {
    boxes
        .iter()
        .zip(class_scores.iter())
        .filter_map(|(bbox, scores)| {
            scores
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(cls, &conf)| (cls, *bbox, conf))
        })
        .collect()
}

/// Applies confidence thresholding, class-id→name mapping, and the
/// `classes_filter` carried on Init (§3.2), per §4.10 step 2. Returns each
/// surviving detection paired with its resolved class name.
pub fn postprocess(
    output: ModelOutput,
    class_names: &[String],
    classes_filter: Option<&[String]>,
    confidence_threshold: Option<f32>,
) -> Vec<(RawDetection, String)> {
    let rows: Vec<(usize, [f32; 4], f32)> = match output {
        ModelOutput::NmsIntegrated(rows) => rows
            .into_iter()
            .map(|r| (r[5] as usize, [r[0], r[1], r[2], r[3]], r[4]))
            .collect(),
        ModelOutput::Dense {
            boxes,
            class_scores,
        } => nms(dense_to_rows(&boxes, &class_scores), DEFAULT_IOU_THRESHOLD),
    };

    let threshold = confidence_threshold.unwrap_or(0.0);
    rows.into_iter()
        .filter(|(_, _, conf)| *conf >= threshold)
        .filter_map(|(class_id, bbox, conf)| {
            let name = class_names.get(class_id)?.clone();
            if let Some(filter) = classes_filter {
                if !filter.iter().any(|c| c == &name) {
                    return None;
                }
            }
            Some((
                RawDetection {
                    bbox_xyxy: bbox,
                    confidence: conf,
                    class_id,
                },
                name,
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nms_integrated_rows_pass_through_with_names() {
        let output = ModelOutput::NmsIntegrated(vec![[0.0, 0.0, 10.0, 10.0, 0.9, 0.0]]);
        let names = vec!["person".to_string()];
        let out = postprocess(output, &names, None, None);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1, "person");
    }

    #[test]
    fn confidence_threshold_filters_low_score_detections() {
        let output = ModelOutput::NmsIntegrated(vec![[0.0, 0.0, 10.0, 10.0, 0.2, 0.0]]);
        let names = vec!["person".to_string()];
        let out = postprocess(output, &names, None, Some(0.5));
        assert!(out.is_empty());
    }

    #[test]
    fn classes_filter_drops_unwanted_classes() {
        let output = ModelOutput::NmsIntegrated(vec![
            [0.0, 0.0, 10.0, 10.0, 0.9, 0.0],
            [0.0, 0.0, 5.0, 5.0, 0.9, 1.0],
        ]);
        let names = vec!["person".to_string(), "car".to_string()];
        let out = postprocess(output, &names, Some(&["car".to_string()]), None);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1, "car");
    }

    #[test]
    fn dense_output_suppresses_overlapping_boxes_of_same_class() {
        let output = ModelOutput::Dense {
            boxes: vec![
                [0.0, 0.0, 10.0, 10.0],
                [1.0, 1.0, 11.0, 11.0],
                [50.0, 50.0, 60.0, 60.0],
            ],
            class_scores: vec![vec![0.9], vec![0.8], vec![0.7]],
        };
        let names = vec!["person".to_string()];
        let out = postprocess(output, &names, None, None);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn unknown_class_id_is_dropped_rather_than_panicking() {
        let output = ModelOutput::NmsIntegrated(vec![[0.0, 0.0, 10.0, 10.0, 0.9, 7.0]]);
        let names = vec!["person".to_string()];
        let out = postprocess(output, &names, None, None);
        assert!(out.is_empty());
    }
}
