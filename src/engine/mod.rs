//! Model engine module
//!
//! Provides:
//! - A static registry of model descriptors
//! - On-demand loading with shared, reference-counted handles
//! - The OpenVINO inference backend

pub mod decode;
pub mod model;
pub mod openvino;
pub mod pool;
pub mod preprocess;
pub mod registry;

pub use model::{InferenceModel, Keypoint, ModelHandle, ModelInput, ModelLoader, ModelOutput, Region};
pub use openvino::OpenVinoLoader;
pub use pool::{ModelPool, ModelStatus, PoolStatus, ReloadReason, ScopedHandle, UnloadReport};
pub use registry::{ModelCategory, ModelDescriptor, ModelRegistry};
