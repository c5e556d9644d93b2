use std::sync::Arc;

use async_trait::async_trait;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

/// Fully validated parameters handed to a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub prompt: String,
    pub height: u32,
    pub width: u32,
    pub guidance_scale: f64,
    pub num_inference_steps: u32,
    pub seed: Option<u64>,
}

/// Descriptive metadata reported by a loaded model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_id: String,
    pub model_type: String,
    pub device: String,
    pub dtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,
}

/// An initialized generation pipeline.
///
/// `generate` is blocking and may run for tens of seconds; callers are
/// expected to run it off the async executor.
pub trait ImageModel: Send + Sync {
    fn generate(&self, params: &GenerationParams) -> anyhow::Result<DynamicImage>;

    fn info(&self) -> ModelInfo;

    /// Drops transient accelerator allocations after a failed generation.
    fn release_memory(&self) {}
}

pub type ModelHandle = Arc<dyn ImageModel>;

/// Builds model instances by catalog name.
#[async_trait]
pub trait ModelFactory: Send + Sync {
    async fn create(&self, name: &str) -> anyhow::Result<ModelHandle>;
}
