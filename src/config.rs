//! Enrichment service configuration

use serde::Deserialize;
use std::path::PathBuf;

use crate::engine::ModelCategory;
use crate::service::Category;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub inference: InferenceConfig,
    #[serde(default)]
    pub pipelines: PipelinesConfig,
    #[serde(default = "default_models")]
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub rest_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    pub device: String,
    pub num_threads: u32,
    /// Total memory units the deployment expects to keep resident.
    /// Only reported, never enforced.
    pub memory_budget: u64,
    /// Seconds an unused model may stay resident before the idle sweep
    /// unloads it. No sweep runs when unset.
    #[serde(default)]
    pub model_idle_timeout: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelinesConfig {
    #[serde(default)]
    pub vehicle: PipelineConfig,
    #[serde(default)]
    pub person: PipelineConfig,
    #[serde(default)]
    pub pet: PipelineConfig,
}

impl PipelinesConfig {
    pub fn for_category(&self, category: Category) -> &PipelineConfig {
        match category {
            Category::Vehicle => &self.vehicle,
            Category::Person => &self.person,
            Category::Pet => &self.pet,
        }
    }
}

impl Default for PipelinesConfig {
    fn default() -> Self {
        Self {
            vehicle: PipelineConfig::default(),
            person: PipelineConfig::default(),
            pet: PipelineConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub enabled: bool,
    pub min_confidence: f32,
    pub timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_confidence: 0.5,
            timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub category: ModelCategory,
    pub memory_cost: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub path: PathBuf,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default = "default_input_size")]
    pub input_size: (u32, u32),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    pub audit_path: Option<PathBuf>,
}

fn default_enabled() -> bool {
    true
}

fn default_input_size() -> (u32, u32) {
    (224, 224)
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, falling back to the built-in config only when the file
    /// does not exist. Unparseable or invalid files are errors.
    pub fn load_or_default(path: &str) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e)
                if e.downcast_ref::<std::io::Error>()
                    .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound) =>
            {
                Ok(Self::default())
            }
            Err(e) => Err(e.context(format!("Invalid configuration in {}", path))),
        }
    }

    pub fn default_path() -> String {
        std::env::var("VIGIL_CONFIG").unwrap_or_else(|_| "config.toml".to_string())
    }

    fn validate(&self) -> anyhow::Result<()> {
        for category in Category::ALL {
            let pipeline = self.pipelines.for_category(category);
            if !(0.0..=1.0).contains(&pipeline.min_confidence) {
                anyhow::bail!(
                    "pipelines.{}.min_confidence must be within 0..=1, got {}",
                    category.as_str(),
                    pipeline.min_confidence
                );
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig { rest_port: 3000 },
            inference: InferenceConfig {
                device: "CPU".to_string(),
                num_threads: 4,
                memory_budget: 4096,
                model_idle_timeout: None,
            },
            pipelines: PipelinesConfig::default(),
            models: default_models(),
            storage: StorageConfig {
                audit_path: Some(PathBuf::from("data/audit.db")),
            },
        }
    }
}

fn model(
    name: &str,
    category: ModelCategory,
    memory_cost: u64,
    input_size: (u32, u32),
    labels: &[&str],
) -> ModelConfig {
    ModelConfig {
        name: name.to_string(),
        category,
        memory_cost,
        enabled: true,
        path: PathBuf::from(format!("models/{}.onnx", name)),
        labels: labels.iter().map(|l| l.to_string()).collect(),
        input_size,
    }
}

/// Greedy CTC charset for the plate reader, blank symbol first.
fn plate_charset() -> Vec<String> {
    std::iter::once('-')
        .chain('0'..='9')
        .chain('A'..='Z')
        .map(String::from)
        .collect()
}

fn default_models() -> Vec<ModelConfig> {
    let mut plate_ocr = model("plate_ocr", ModelCategory::Ocr, 300, (94, 24), &[]);
    plate_ocr.labels = plate_charset();

    let mut depth = model("depth_estimator", ModelCategory::Depth, 900, (384, 384), &[]);
    depth.enabled = false;

    vec![
        model("face_detector", ModelCategory::Detection, 600, (640, 640), &[]),
        model("plate_detector", ModelCategory::Detection, 512, (640, 640), &[]),
        plate_ocr,
        model("pose_estimator", ModelCategory::Pose, 800, (192, 256), &[]),
        model(
            "damage_classifier",
            ModelCategory::Classification,
            400,
            (224, 224),
            &["none", "scratch", "dent", "broken_glass", "crushed"],
        ),
        model(
            "violence_classifier",
            ModelCategory::Classification,
            700,
            (224, 224),
            &["non_violent", "violent"],
        ),
        model(
            "pet_classifier",
            ModelCategory::Classification,
            250,
            (224, 224),
            &["cat", "dog", "other"],
        ),
        model(
            "weather_classifier",
            ModelCategory::Classification,
            200,
            (224, 224),
            &["clear", "cloudy", "rain", "snow", "fog"],
        ),
        depth,
    ]
}
