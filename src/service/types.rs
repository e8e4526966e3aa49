//! Service layer types

use std::collections::{BTreeMap, HashMap};

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::routing::{Category, EnrichmentTask};
use crate::engine::{Keypoint, Region};

/// Source images keyed by the reference detections carry.
pub type ImageMap = HashMap<String, DynamicImage>;

/// Axis-aligned box in source-image pixels. Valid when `x1 < x2` and `y1 < y2`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn is_valid(&self) -> bool {
        self.x1 < self.x2 && self.y1 < self.y2
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
}

/// Object found by the upstream detector. Read-only input to enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub id: String,
    pub class_name: String,
    pub confidence: f32,
    pub bounding_box: BoundingBox,
    #[serde(default)]
    pub source_image_ref: Option<String>,
}

impl Detection {
    pub fn new(
        id: impl Into<String>,
        class_name: impl Into<String>,
        confidence: f32,
        bounding_box: BoundingBox,
    ) -> Self {
        Self {
            id: id.into(),
            class_name: class_name.into(),
            confidence,
            bounding_box,
            source_image_ref: None,
        }
    }

    pub fn with_image_ref(mut self, image_ref: impl Into<String>) -> Self {
        self.source_image_ref = Some(image_ref.into());
        self
    }

    /// Check the value invariants; the message describes the first violation.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("empty id".to_string());
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!("confidence {} outside 0..=1", self.confidence));
        }
        if !self.bounding_box.is_valid() {
            let b = &self.bounding_box;
            return Err(format!(
                "bounding box ({}, {}, {}, {}) requires x1 < x2 and y1 < y2",
                b.x1, b.y1, b.x2, b.y2
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateReading {
    pub detection_id: String,
    pub text: String,
    pub confidence: f32,
    /// Plate location in source-image pixels
    pub plate: Region,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceResult {
    pub detection_id: String,
    pub faces: Vec<Region>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseResult {
    pub detection_id: String,
    pub keypoints: Vec<Keypoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub detection_id: String,
    pub task: EnrichmentTask,
    pub label: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentErrorKind {
    DetectionTimeout,
    DetectionInferenceFailure,
    MissingImageReference,
    /// A model the category needs could not be loaded for this batch
    ModelLoadFailure,
}

/// A failure recorded in the result instead of aborting the batch.
///
/// `detection_id` is `None` for category-level errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentError {
    pub detection_id: Option<String>,
    pub category: Category,
    pub task: Option<EnrichmentTask>,
    pub kind: EnrichmentErrorKind,
    pub message: String,
}

/// Aggregated output of one enrichment batch.
///
/// Every list is ordered by category (vehicle, person, pet), then by input
/// detection order, then by task order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentResult {
    pub batch_id: Uuid,
    pub license_plates: Vec<PlateReading>,
    pub faces: Vec<FaceResult>,
    pub poses: Vec<PoseResult>,
    pub classifications: Vec<ClassificationResult>,
    pub errors: Vec<EnrichmentError>,
    pub processing_time_ms: u64,
}

impl EnrichmentResult {
    /// Error count per category name
    pub fn error_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for error in &self.errors {
            *counts.entry(error.category.as_str().to_string()).or_insert(0) += 1;
        }
        counts
    }

    pub fn errors_of(&self, kind: EnrichmentErrorKind) -> Vec<&EnrichmentError> {
        self.errors.iter().filter(|e| e.kind == kind).collect()
    }

    /// No sub-results and no errors
    pub fn is_empty(&self) -> bool {
        self.license_plates.is_empty()
            && self.faces.is_empty()
            && self.poses.is_empty()
            && self.classifications.is_empty()
            && self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_validation() {
        let ok = Detection::new("d1", "car", 0.9, BoundingBox::new(0.0, 0.0, 10.0, 10.0));
        assert!(ok.validate().is_ok());

        let flipped = Detection::new("d2", "car", 0.9, BoundingBox::new(10.0, 0.0, 5.0, 10.0));
        assert!(flipped.validate().unwrap_err().contains("x1 < x2"));

        let conf = Detection::new("d3", "car", 1.2, BoundingBox::new(0.0, 0.0, 1.0, 1.0));
        assert!(conf.validate().is_err());
    }

    #[test]
    fn test_detection_deserializes_without_image_ref() {
        let json = r#"{
            "id": "d1",
            "class_name": "dog",
            "confidence": 0.8,
            "bounding_box": {"x1": 1, "y1": 2, "x2": 3, "y2": 4}
        }"#;
        let detection: Detection = serde_json::from_str(json).unwrap();
        assert_eq!(detection.class_name, "dog");
        assert!(detection.source_image_ref.is_none());
    }

    #[test]
    fn test_error_counts_group_by_category() {
        let error = |category| EnrichmentError {
            detection_id: None,
            category,
            task: None,
            kind: EnrichmentErrorKind::ModelLoadFailure,
            message: String::new(),
        };
        let result = EnrichmentResult {
            errors: vec![error(Category::Vehicle), error(Category::Vehicle), error(Category::Pet)],
            ..Default::default()
        };

        let counts = result.error_counts();
        assert_eq!(counts.get("vehicle"), Some(&2));
        assert_eq!(counts.get("pet"), Some(&1));
        assert!(!result.is_empty());
        assert!(EnrichmentResult::default().is_empty());
    }
}
