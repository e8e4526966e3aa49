//! Model Registry
//!
//! Static catalog of model descriptors. Built once at startup and never
//! mutated afterwards, so it can be shared freely behind an `Arc`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::model::ModelLoader;
use crate::config::ModelConfig;
use crate::error::RegistryError;

/// What kind of output a model produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelCategory {
    Detection,
    Classification,
    Ocr,
    Pose,
    Depth,
}

impl ModelCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelCategory::Detection => "detection",
            ModelCategory::Classification => "classification",
            ModelCategory::Ocr => "ocr",
            ModelCategory::Pose => "pose",
            ModelCategory::Depth => "depth",
        }
    }
}

/// Immutable description of a loadable model.
#[derive(Clone)]
pub struct ModelDescriptor {
    pub name: String,
    pub category: ModelCategory,
    /// Memory units the model occupies while resident.
    pub memory_cost: u64,
    pub enabled: bool,
    pub path: PathBuf,
    /// Class labels (classifiers) or charset (OCR).
    pub labels: Vec<String>,
    /// Network input size as (width, height).
    pub input_size: (u32, u32),
    pub loader: Arc<dyn ModelLoader>,
}

impl ModelDescriptor {
    pub fn from_config(config: &ModelConfig, loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            name: config.name.clone(),
            category: config.category,
            memory_cost: config.memory_cost,
            enabled: config.enabled,
            path: config.path.clone(),
            labels: config.labels.clone(),
            input_size: config.input_size,
            loader,
        }
    }
}

impl std::fmt::Debug for ModelDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelDescriptor")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("memory_cost", &self.memory_cost)
            .field("enabled", &self.enabled)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Read-only catalog of registered models, in registration order.
#[derive(Debug)]
pub struct ModelRegistry {
    descriptors: Vec<ModelDescriptor>,
    index: HashMap<String, usize>,
}

impl ModelRegistry {
    pub fn new(descriptors: Vec<ModelDescriptor>) -> Result<Self, RegistryError> {
        let mut index = HashMap::with_capacity(descriptors.len());
        for (i, descriptor) in descriptors.iter().enumerate() {
            if descriptor.memory_cost == 0 {
                return Err(RegistryError::InvalidMemoryCost {
                    name: descriptor.name.clone(),
                });
            }
            if index.insert(descriptor.name.clone(), i).is_some() {
                return Err(RegistryError::DuplicateModel {
                    name: descriptor.name.clone(),
                });
            }
        }
        Ok(Self { descriptors, index })
    }

    /// Build a registry where every model shares one loader.
    pub fn from_config(
        models: &[ModelConfig],
        loader: Arc<dyn ModelLoader>,
    ) -> Result<Self, RegistryError> {
        let descriptors = models
            .iter()
            .map(|m| ModelDescriptor::from_config(m, loader.clone()))
            .collect();
        Self::new(descriptors)
    }

    pub fn get(&self, name: &str) -> Option<&ModelDescriptor> {
        self.index.get(name).map(|&i| &self.descriptors[i])
    }

    pub fn list_enabled(&self) -> Vec<&ModelDescriptor> {
        self.descriptors.iter().filter(|d| d.enabled).collect()
    }

    /// All descriptors, enabled or not.
    pub fn iter(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.descriptors.iter()
    }

    /// Sum of memory costs for the given names. Unknown names are skipped.
    pub fn total_cost<S: AsRef<str>>(&self, names: &[S]) -> u64 {
        names
            .iter()
            .filter_map(|n| self.get(n.as_ref()))
            .map(|d| d.memory_cost)
            .sum()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::model::{ModelHandle, ModelLoader};
    use async_trait::async_trait;

    struct NeverLoader;

    #[async_trait]
    impl ModelLoader for NeverLoader {
        async fn load(&self, descriptor: &ModelDescriptor) -> anyhow::Result<ModelHandle> {
            anyhow::bail!("{} is not loadable in tests", descriptor.name)
        }
    }

    fn descriptor(name: &str, cost: u64, enabled: bool) -> ModelDescriptor {
        ModelDescriptor {
            name: name.to_string(),
            category: ModelCategory::Classification,
            memory_cost: cost,
            enabled,
            path: PathBuf::from(format!("models/{}.onnx", name)),
            labels: Vec::new(),
            input_size: (224, 224),
            loader: Arc::new(NeverLoader),
        }
    }

    #[test]
    fn test_get_and_list_enabled() {
        let registry = ModelRegistry::new(vec![
            descriptor("pet_classifier", 250, true),
            descriptor("depth_estimator", 900, false),
        ])
        .unwrap();

        assert!(registry.get("pet_classifier").is_some());
        // Disabled models stay queryable
        assert!(!registry.get("depth_estimator").unwrap().enabled);
        assert!(registry.get("missing").is_none());

        let enabled: Vec<&str> = registry.list_enabled().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(enabled, vec!["pet_classifier"]);
    }

    #[test]
    fn test_total_cost_skips_unknown_names() {
        let registry = ModelRegistry::new(vec![
            descriptor("a", 100, true),
            descriptor("b", 50, false),
        ])
        .unwrap();

        assert_eq!(registry.total_cost(&["a", "b", "nope"]), 150);
        assert_eq!(registry.total_cost::<&str>(&[]), 0);
    }

    #[test]
    fn test_rejects_duplicates_and_zero_cost() {
        let dup = ModelRegistry::new(vec![descriptor("a", 1, true), descriptor("a", 2, true)]);
        assert!(matches!(dup, Err(RegistryError::DuplicateModel { .. })));

        let zero = ModelRegistry::new(vec![descriptor("a", 0, true)]);
        assert!(matches!(zero, Err(RegistryError::InvalidMemoryCost { .. })));
    }

    #[test]
    fn test_from_default_config() {
        let config = crate::config::Config::default();
        let registry = ModelRegistry::from_config(&config.models, Arc::new(NeverLoader)).unwrap();
        assert_eq!(registry.len(), config.models.len());
        assert_eq!(registry.get("plate_ocr").unwrap().category, ModelCategory::Ocr);
    }
}
