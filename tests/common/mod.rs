//! Scriptable loader and models shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use image::{DynamicImage, GenericImageView};
use parking_lot::Mutex;

use vigil::config::{Config, PipelinesConfig};
use vigil::engine::{
    InferenceModel, Keypoint, ModelDescriptor, ModelHandle, ModelInput, ModelLoader, ModelOutput,
    ModelPool, ModelRegistry, Region,
};
use vigil::service::{BoundingBox, Detection, EnrichmentService, ImageMap};
use vigil::storage::MemorySink;

/// What a model does with one crop
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Step {
    Reply,
    Fail,
    Hang,
    Panic,
}

/// Picks a step and a delay from the width and height of the crop a model
/// receives.
pub type Script = Arc<dyn Fn(u32, u32) -> (Step, Duration) + Send + Sync>;

pub fn reply() -> Script {
    Arc::new(|_, _| (Step::Reply, Duration::ZERO))
}

pub struct MockLoader {
    loads: Mutex<HashMap<String, usize>>,
    /// (in flight, peak) loads per name
    overlap: Mutex<HashMap<String, (usize, usize)>>,
    load_delay: Mutex<Duration>,
    failing: Mutex<HashSet<String>>,
    hanging: Mutex<HashSet<String>>,
    scripts: Mutex<HashMap<String, Script>>,
    pub infer_calls: Arc<AtomicUsize>,
}

impl MockLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            loads: Mutex::new(HashMap::new()),
            overlap: Mutex::new(HashMap::new()),
            load_delay: Mutex::new(Duration::ZERO),
            failing: Mutex::new(HashSet::new()),
            hanging: Mutex::new(HashSet::new()),
            scripts: Mutex::new(HashMap::new()),
            infer_calls: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn set_load_delay(&self, delay: Duration) {
        *self.load_delay.lock() = delay;
    }

    pub fn fail(&self, name: &str) {
        self.failing.lock().insert(name.to_string());
    }

    pub fn heal(&self, name: &str) {
        self.failing.lock().remove(name);
    }

    /// Loads of `name` never finish
    pub fn hang(&self, name: &str) {
        self.hanging.lock().insert(name.to_string());
    }

    pub fn script(&self, name: &str, script: Script) {
        self.scripts.lock().insert(name.to_string(), script);
    }

    pub fn loads(&self, name: &str) -> usize {
        self.loads.lock().get(name).copied().unwrap_or(0)
    }

    /// Most loads of `name` ever running at the same time
    pub fn peak_concurrent_loads(&self, name: &str) -> usize {
        self.overlap.lock().get(name).map(|(_, peak)| *peak).unwrap_or(0)
    }

    pub fn total_loads(&self) -> usize {
        self.loads.lock().values().sum()
    }

    pub fn infer_calls(&self) -> usize {
        self.infer_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelLoader for MockLoader {
    async fn load(&self, descriptor: &ModelDescriptor) -> anyhow::Result<ModelHandle> {
        let name = descriptor.name.clone();
        *self.loads.lock().entry(name.clone()).or_insert(0) += 1;
        {
            let mut overlap = self.overlap.lock();
            let (running, peak) = overlap.entry(name.clone()).or_insert((0, 0));
            *running += 1;
            *peak = (*peak).max(*running);
        }

        let hangs = self.hanging.lock().contains(&name);
        if hangs {
            std::future::pending::<()>().await;
        }
        let delay = *self.load_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some((running, _)) = self.overlap.lock().get_mut(&name) {
            *running -= 1;
        }
        let fails = self.failing.lock().contains(&name);
        if fails {
            bail!("weights for {} are corrupt", name);
        }

        let script = self.scripts.lock().get(&name).cloned().unwrap_or_else(reply);
        Ok(Arc::new(MockModel {
            name,
            script,
            calls: self.infer_calls.clone(),
        }))
    }
}

pub struct MockModel {
    name: String,
    script: Script,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl InferenceModel for MockModel {
    async fn infer(&self, input: ModelInput) -> anyhow::Result<ModelOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (w, h) = input.image.dimensions();
        let (step, delay) = (self.script)(w, h);

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match step {
            Step::Reply => Ok(output_for(&self.name, w, h)),
            Step::Fail => bail!("{} failed on a {}x{} crop", self.name, w, h),
            Step::Hang => std::future::pending().await,
            Step::Panic => panic!("{} crashed", self.name),
        }
    }
}

/// Canned output per model. Classification labels carry the crop width so
/// results can be traced back to their detection.
pub fn output_for(name: &str, w: u32, h: u32) -> ModelOutput {
    match name {
        "plate_detector" | "face_detector" => ModelOutput::Regions {
            regions: vec![Region {
                x1: 0.0,
                y1: 0.0,
                x2: (w as f32 / 2.0).max(1.0),
                y2: (h as f32 / 2.0).max(1.0),
                confidence: 0.9,
            }],
        },
        "plate_ocr" => ModelOutput::Text {
            text: format!("PLATE{}", w),
            confidence: 0.8,
        },
        "pose_estimator" => ModelOutput::Keypoints {
            keypoints: vec![Keypoint {
                index: 0,
                x: 1.0,
                y: 2.0,
                confidence: 0.7,
            }],
        },
        _ => ModelOutput::Classification {
            label: format!("w{}", w),
            confidence: 0.75,
        },
    }
}

pub fn pool_with(loader: Arc<MockLoader>, memory_budget: u64) -> (Arc<ModelPool>, Arc<MemorySink>) {
    let mut config = Config::default();
    config.inference.memory_budget = memory_budget;

    let registry = Arc::new(
        ModelRegistry::from_config(&config.models, loader).expect("default catalog is valid"),
    );
    let sink = Arc::new(MemorySink::new());
    let pool = Arc::new(ModelPool::new(registry, &config.inference, sink.clone()));
    (pool, sink)
}

pub fn service_with(
    loader: Arc<MockLoader>,
    pipelines: PipelinesConfig,
) -> (EnrichmentService, Arc<ModelPool>, Arc<MemorySink>) {
    let (pool, sink) = pool_with(loader, 4096);
    let service = EnrichmentService::new(pool.clone(), pipelines, sink.clone());
    (service, pool, sink)
}

/// Same as [`service_with`] with some catalog entries disabled
pub fn service_without(
    loader: Arc<MockLoader>,
    disabled: &[&str],
) -> (EnrichmentService, Arc<ModelPool>, Arc<MemorySink>) {
    let mut config = Config::default();
    for model in &mut config.models {
        if disabled.contains(&model.name.as_str()) {
            model.enabled = false;
        }
    }

    let registry = Arc::new(
        ModelRegistry::from_config(&config.models, loader).expect("default catalog is valid"),
    );
    let sink = Arc::new(MemorySink::new());
    let pool = Arc::new(ModelPool::new(registry, &config.inference, sink.clone()));
    let service = EnrichmentService::new(pool.clone(), config.pipelines, sink.clone());
    (service, pool, sink)
}

pub fn frame(w: u32, h: u32) -> DynamicImage {
    DynamicImage::new_rgb8(w, h)
}

pub fn images(entries: &[(&str, u32, u32)]) -> ImageMap {
    entries
        .iter()
        .map(|(name, w, h)| (name.to_string(), frame(*w, *h)))
        .collect()
}

/// Detection whose crop is `width` pixels wide at the left edge of `image`
pub fn detection(id: &str, class_name: &str, width: f32, image: &str) -> Detection {
    Detection::new(id, class_name, 0.9, BoundingBox::new(0.0, 0.0, width, 20.0))
        .with_image_ref(image)
}
