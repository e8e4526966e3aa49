//! OpenVINO model backend
//!
//! Compiles models on load and runs them on the blocking thread pool.
//! Output decoding is chosen by the descriptor's category.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use image::{DynamicImage, GenericImageView};
use openvino::{CompiledModel, Core, ElementType, InferRequest, Shape, Tensor};
use parking_lot::Mutex;
use tracing::debug;

use super::decode;
use super::model::{InferenceModel, ModelHandle, ModelInput, ModelLoader, ModelOutput};
use super::preprocess::{to_input_tensor, ScaleInfo};
use super::registry::{ModelCategory, ModelDescriptor};
use crate::config::InferenceConfig;

/// Wrapper for OpenVINO Core that implements Send + Sync
pub struct SafeCore(Core);
unsafe impl Send for SafeCore {}
unsafe impl Sync for SafeCore {}

/// Wrapper for OpenVINO CompiledModel that implements Send + Sync
#[derive(Clone)]
pub struct SafeCompiledModel(Arc<CompiledModel>);
unsafe impl Send for SafeCompiledModel {}
unsafe impl Sync for SafeCompiledModel {}

impl SafeCompiledModel {
    /// Create an inference request
    /// OpenVINO CompiledModel methods are thread-safe in C++, but Rust bindings
    /// require &mut self.
    fn create_infer_request(&self) -> Result<InferRequest> {
        unsafe {
            let ptr = Arc::as_ptr(&self.0) as *mut CompiledModel;
            (*ptr).create_infer_request().map_err(|e| e.into())
        }
    }
}

/// Loads `.onnx`/`.xml` models through a shared OpenVINO core
pub struct OpenVinoLoader {
    core: Arc<Mutex<SafeCore>>,
    device: String,
}

impl OpenVinoLoader {
    pub fn new(config: &InferenceConfig) -> Result<Self> {
        let core = Core::new().context("Failed to initialise OpenVINO core")?;
        Ok(Self {
            core: Arc::new(Mutex::new(SafeCore(core))),
            device: config.device.clone(),
        })
    }
}

#[async_trait]
impl ModelLoader for OpenVinoLoader {
    async fn load(&self, descriptor: &ModelDescriptor) -> Result<ModelHandle> {
        let core = self.core.clone();
        let device = self.device.clone();
        let path = descriptor
            .path
            .to_str()
            .with_context(|| format!("Non UTF-8 model path for {}", descriptor.name))?
            .to_string();

        let compiled = tokio::task::spawn_blocking(move || -> Result<SafeCompiledModel> {
            // Core methods like read_model require &mut self in the Rust bindings
            let mut core = core.lock();
            let model = core.0.read_model_from_file(&path, "")?;
            let compiled = core.0.compile_model(&model, device.as_str().into())?;
            Ok(SafeCompiledModel(Arc::new(compiled)))
        })
        .await
        .context("Model compile task panicked")??;

        Ok(Arc::new(OpenVinoModel {
            inner: Arc::new(CompiledInner {
                name: descriptor.name.clone(),
                compiled,
                category: descriptor.category,
                labels: descriptor.labels.clone(),
                input_size: descriptor.input_size,
            }),
        }))
    }
}

struct CompiledInner {
    name: String,
    compiled: SafeCompiledModel,
    category: ModelCategory,
    labels: Vec<String>,
    input_size: (u32, u32),
}

impl CompiledInner {
    fn run(&self, image: &DynamicImage) -> Result<ModelOutput> {
        let (target_w, target_h) = self.input_size;
        let input_tensor = to_input_tensor(image, self.input_size);

        let mut request = self.compiled.create_infer_request()?;

        let input_shape = Shape::new(&[1, 3, target_h as i64, target_w as i64])?;
        let mut input = Tensor::new(ElementType::F32, &input_shape)?;

        let input_data = input_tensor
            .as_slice()
            .context("Input tensor is not contiguous")?;
        unsafe {
            let tensor_data = input.get_raw_data_mut()?.as_mut_ptr() as *mut f32;
            std::ptr::copy_nonoverlapping(input_data.as_ptr(), tensor_data, input_data.len());
        }

        request.set_input_tensor(&input)?;
        request.infer()?;

        let output = request.get_output_tensor_by_index(0)?;
        let data = read_tensor_f32(&output)?;
        debug!("{} produced {} output values", self.name, data.len());

        let scale = ScaleInfo::new(image.dimensions(), self.input_size);
        match self.category {
            ModelCategory::Classification => decode::classification(&data, &self.labels),
            ModelCategory::Ocr => decode::ctc_greedy(&data, &self.labels),
            ModelCategory::Detection => decode::regions(&data, scale),
            ModelCategory::Pose => decode::keypoints(&data, scale),
            ModelCategory::Depth => decode::depth(&data),
        }
    }
}

/// Read tensor data as f32 vector
fn read_tensor_f32(tensor: &Tensor) -> Result<Vec<f32>> {
    let shape = tensor.get_shape()?;
    let total_elements: i64 = shape.get_dimensions().iter().product();

    let data: Vec<f32> = unsafe {
        let ptr = tensor.get_raw_data()?.as_ptr() as *const f32;
        std::slice::from_raw_parts(ptr, total_elements as usize).to_vec()
    };

    Ok(data)
}

/// A compiled OpenVINO model
pub struct OpenVinoModel {
    inner: Arc<CompiledInner>,
}

#[async_trait]
impl InferenceModel for OpenVinoModel {
    /// Runs on the blocking pool. A caller that times out stops waiting
    /// but cannot stop the request, which keeps its own reference to the
    /// compiled model until it finishes, even past an unload.
    async fn infer(&self, input: ModelInput) -> Result<ModelOutput> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.run(&input.image))
            .await
            .context("Inference task panicked")?
    }
}
