//! Opaque inference seam
//!
//! The pool only knows how to turn a descriptor into a handle
//! (`ModelLoader`) and the orchestrator only knows how to run a handle on a
//! crop (`InferenceModel`). Everything numerical lives behind these traits.

use std::sync::Arc;

use async_trait::async_trait;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use super::registry::ModelDescriptor;

/// Shared handle to a loaded model.
pub type ModelHandle = Arc<dyn InferenceModel>;

/// Turns a registered descriptor into a live model. May fail.
#[async_trait]
pub trait ModelLoader: Send + Sync + 'static {
    async fn load(&self, descriptor: &ModelDescriptor) -> anyhow::Result<ModelHandle>;
}

/// A loaded model. Shared read-only across concurrent callers.
#[async_trait]
pub trait InferenceModel: Send + Sync + 'static {
    async fn infer(&self, input: ModelInput) -> anyhow::Result<ModelOutput>;
}

/// Input to one inference call: the image region to analyse.
#[derive(Debug, Clone)]
pub struct ModelInput {
    pub image: DynamicImage,
}

impl ModelInput {
    pub fn new(image: DynamicImage) -> Self {
        Self { image }
    }
}

/// Axis-aligned region in the coordinate space of the input image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

impl Region {
    /// Shift the region by an offset, e.g. from crop space back to the
    /// source image.
    pub fn translate(&self, dx: f32, dy: f32) -> Self {
        Self {
            x1: self.x1 + dx,
            y1: self.y1 + dy,
            x2: self.x2 + dx,
            y2: self.y2 + dy,
            confidence: self.confidence,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub index: usize,
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
}

/// Decoded model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelOutput {
    Classification { label: String, confidence: f32 },
    Text { text: String, confidence: f32 },
    Regions { regions: Vec<Region> },
    Keypoints { keypoints: Vec<Keypoint> },
    Depth { mean: f32, min: f32, max: f32 },
}

impl ModelOutput {
    pub fn kind(&self) -> &'static str {
        match self {
            ModelOutput::Classification { .. } => "classification",
            ModelOutput::Text { .. } => "text",
            ModelOutput::Regions { .. } => "regions",
            ModelOutput::Keypoints { .. } => "keypoints",
            ModelOutput::Depth { .. } => "depth",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_translate() {
        let region = Region { x1: 1.0, y1: 2.0, x2: 3.0, y2: 4.0, confidence: 0.9 };
        let moved = region.translate(10.0, 20.0);
        assert_eq!(moved.x1, 11.0);
        assert_eq!(moved.y2, 24.0);
        assert_eq!(moved.confidence, 0.9);
    }

    #[test]
    fn test_output_serializes_with_type_tag() {
        let output = ModelOutput::Text { text: "AB123".into(), confidence: 0.8 };
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(output.kind(), "text");
    }
}
