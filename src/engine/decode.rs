//! Raw output decoding, one decoder per model category
//!
//! Layouts expected from the exported networks:
//! - classification: one logit per label
//! - ocr: `[T, C]` logits, `C == charset.len()`, blank symbol at index 0
//! - detection: rows of `[x1, y1, x2, y2, score]` in network pixels
//! - pose: rows of `[x, y, score]` in network pixels
//! - depth: one value per pixel

use anyhow::{bail, Result};

use super::model::{Keypoint, ModelOutput, Region};
use super::preprocess::ScaleInfo;
use crate::utils::math::{argmax, softmax};

/// Minimum score for a detection row to be kept
pub const REGION_THRESHOLD: f32 = 0.5;

pub fn classification(logits: &[f32], labels: &[String]) -> Result<ModelOutput> {
    if labels.is_empty() {
        bail!("Classifier has no labels configured");
    }
    if logits.len() != labels.len() {
        bail!(
            "Classifier produced {} logits for {} labels",
            logits.len(),
            labels.len()
        );
    }

    let probs = softmax(logits);
    let best = argmax(&probs);
    Ok(ModelOutput::Classification {
        label: labels[best].clone(),
        confidence: probs[best],
    })
}

/// Greedy CTC decoding: best symbol per step, repeats collapsed, blanks dropped.
pub fn ctc_greedy(logits: &[f32], charset: &[String]) -> Result<ModelOutput> {
    let classes = charset.len();
    if classes < 2 {
        bail!("OCR charset needs a blank plus at least one symbol");
    }
    if logits.len() % classes != 0 {
        bail!(
            "OCR output length {} is not a multiple of charset size {}",
            logits.len(),
            classes
        );
    }

    let mut text = String::new();
    let mut confidences = Vec::new();
    let mut previous = 0usize;

    for step in logits.chunks_exact(classes) {
        let probs = softmax(step);
        let best = argmax(&probs);
        if best != 0 && best != previous {
            text.push_str(&charset[best]);
            confidences.push(probs[best]);
        }
        previous = best;
    }

    let confidence = if confidences.is_empty() {
        0.0
    } else {
        confidences.iter().sum::<f32>() / confidences.len() as f32
    };

    Ok(ModelOutput::Text { text, confidence })
}

/// Rows above [`REGION_THRESHOLD`], best first, mapped back to crop space.
pub fn regions(rows: &[f32], scale: ScaleInfo) -> Result<ModelOutput> {
    if rows.len() % 5 != 0 {
        bail!("Detection output length {} is not a multiple of 5", rows.len());
    }

    let mut regions: Vec<Region> = rows
        .chunks_exact(5)
        .filter(|r| r[4] >= REGION_THRESHOLD && r[2] > r[0] && r[3] > r[1])
        .map(|r| {
            let (x1, y1) = scale.to_original(r[0], r[1]);
            let (x2, y2) = scale.to_original(r[2], r[3]);
            Region { x1, y1, x2, y2, confidence: r[4] }
        })
        .collect();

    regions.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    Ok(ModelOutput::Regions { regions })
}

pub fn keypoints(rows: &[f32], scale: ScaleInfo) -> Result<ModelOutput> {
    if rows.len() % 3 != 0 {
        bail!("Pose output length {} is not a multiple of 3", rows.len());
    }

    let keypoints = rows
        .chunks_exact(3)
        .enumerate()
        .map(|(index, r)| {
            let (x, y) = scale.to_original(r[0], r[1]);
            Keypoint { index, x, y, confidence: r[2] }
        })
        .collect();

    Ok(ModelOutput::Keypoints { keypoints })
}

pub fn depth(values: &[f32]) -> Result<ModelOutput> {
    if values.is_empty() {
        bail!("Depth output is empty");
    }
    let min = values.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = values.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mean = values.iter().sum::<f32>() / values.len() as f32;
    Ok(ModelOutput::Depth { mean, min, max })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_classification_picks_highest_logit() {
        let out = classification(&[0.1, 3.0, 0.2], &labels(&["cat", "dog", "other"])).unwrap();
        match out {
            ModelOutput::Classification { label, confidence } => {
                assert_eq!(label, "dog");
                assert!(confidence > 0.8);
            }
            other => panic!("unexpected output {:?}", other),
        }
    }

    #[test]
    fn test_classification_rejects_label_mismatch() {
        assert!(classification(&[0.1, 0.2], &labels(&["a", "b", "c"])).is_err());
        assert!(classification(&[0.1], &[]).is_err());
    }

    #[test]
    fn test_ctc_collapses_repeats_and_blanks() {
        let charset = labels(&["-", "A", "B"]);
        // Steps: A, A, blank, A, B
        let logits = [
            0.0, 5.0, 0.0, //
            0.0, 5.0, 0.0, //
            5.0, 0.0, 0.0, //
            0.0, 5.0, 0.0, //
            0.0, 0.0, 5.0,
        ];
        match ctc_greedy(&logits, &charset).unwrap() {
            ModelOutput::Text { text, confidence } => {
                assert_eq!(text, "AAB");
                assert!(confidence > 0.9);
            }
            other => panic!("unexpected output {:?}", other),
        }
    }

    #[test]
    fn test_regions_filters_and_scales() {
        let rows = [
            10.0, 10.0, 20.0, 20.0, 0.6, //
            0.0, 0.0, 5.0, 5.0, 0.9, //
            1.0, 1.0, 2.0, 2.0, 0.1,
        ];
        let scale = ScaleInfo::new((200, 200), (100, 100));
        match regions(&rows, scale).unwrap() {
            ModelOutput::Regions { regions } => {
                assert_eq!(regions.len(), 2);
                assert_eq!(regions[0].confidence, 0.9);
                assert_eq!(regions[1].x2, 40.0);
            }
            other => panic!("unexpected output {:?}", other),
        }
    }

    #[test]
    fn test_keypoints_are_indexed() {
        let scale = ScaleInfo::new((100, 100), (100, 100));
        match keypoints(&[1.0, 2.0, 0.5, 3.0, 4.0, 0.7], scale).unwrap() {
            ModelOutput::Keypoints { keypoints } => {
                assert_eq!(keypoints.len(), 2);
                assert_eq!(keypoints[1].index, 1);
                assert_eq!(keypoints[1].x, 3.0);
            }
            other => panic!("unexpected output {:?}", other),
        }
    }

    #[test]
    fn test_depth_stats() {
        assert_eq!(
            depth(&[1.0, 2.0, 3.0]).unwrap(),
            ModelOutput::Depth { mean: 2.0, min: 1.0, max: 3.0 }
        );
        assert!(depth(&[]).is_err());
    }
}
