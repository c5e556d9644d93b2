use std::{collections::BTreeMap, io::Cursor, time::Instant};

use anyhow::anyhow;
use image::DynamicImage;
use imagine_core::{
    api::{
        HealthReport, HealthStatus, LoadState, ModelDetail, ModelStatusReport, ReloadOutcome,
        ReloadReport, ServerInfo,
    },
    validator::validate_request,
    GenerationRequest, ModelHandle, ModelRegistry, ServeError,
};
use tokio::sync::Semaphore;
use tracing::{error, info};

use crate::system::SystemMonitor;

pub const DEFAULT_MAX_CONCURRENT_GENERATIONS: usize = 2;

/// Request handling on top of a [`ModelRegistry`], independent of HTTP.
pub struct GenerationServer {
    registry: ModelRegistry,
    permits: Semaphore,
    monitor: SystemMonitor,
}

impl GenerationServer {
    pub fn new(registry: ModelRegistry, max_concurrent_generations: usize) -> Self {
        Self {
            registry,
            permits: Semaphore::new(max_concurrent_generations.max(1)),
            monitor: SystemMonitor::new(),
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Only loaded models are listed as available; `model_status` covers the
    /// whole catalog.
    pub async fn info(&self) -> ServerInfo {
        let model_status = self
            .registry
            .statuses()
            .await
            .into_iter()
            .map(|(name, config, status)| {
                let report = ModelStatusReport {
                    is_loaded: status.is_loaded,
                    error: status.error,
                    last_error_time: status.last_error_time,
                    config,
                };
                (name, report)
            })
            .collect::<BTreeMap<_, _>>();

        ServerInfo {
            available_models: self.registry.loaded_models().await,
            default_model: self.registry.default_model().to_string(),
            model_status,
            system_info: self.monitor.snapshot(),
        }
    }

    /// Healthy while at least one model is loaded.
    pub async fn health(&self) -> HealthReport {
        let loaded_models = self.registry.loaded_models().await;
        let status = if loaded_models.is_empty() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        HealthReport {
            status,
            loaded_models,
            system_info: self.monitor.snapshot(),
        }
    }

    pub async fn model_info(&self, name: &str) -> Result<ModelDetail, ServeError> {
        let config = self.registry.config(name)?;
        if let Some(model) = self.registry.handle(name).await? {
            return Ok(ModelDetail {
                model: name.to_string(),
                status: LoadState::Loaded,
                info: Some(model.info()),
                error: None,
                config,
            });
        }
        let status = self.registry.status(name).await?;
        Ok(ModelDetail {
            model: name.to_string(),
            status: LoadState::NotLoaded,
            info: None,
            error: status.error,
            config,
        })
    }

    pub async fn reload_model(&self, name: &str) -> Result<ReloadReport, ServeError> {
        let status = self.registry.reload(name).await?;
        Ok(ReloadReport {
            model: name.to_string(),
            status: if status.is_loaded {
                ReloadOutcome::Loaded
            } else {
                ReloadOutcome::Failed
            },
            error: status.error,
        })
    }

    /// The requested model, or the catalog default when none is named.
    pub fn resolve_model(&self, name: Option<&str>) -> Result<String, ServeError> {
        match name {
            Some(name) if self.registry.contains(name) => Ok(name.to_string()),
            Some(name) => Err(ServeError::NotFound(name.to_string())),
            None => Ok(self.registry.default_model().to_string()),
        }
    }

    /// Validates, runs the model and returns PNG bytes.
    pub async fn generate(
        &self,
        name: Option<&str>,
        request: &GenerationRequest,
    ) -> Result<Vec<u8>, ServeError> {
        let name = self.resolve_model(name)?;
        let config = self.registry.config(&name)?;
        let params = validate_request(&config, request)?;
        let model = self.registry.ensure_loaded(&name).await?;

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ServeError::Internal("generation pool is closed".to_string()))?;

        info!(
            model = %name,
            size = params.width,
            steps = params.num_inference_steps,
            guidance = params.guidance_scale,
            "Generating image"
        );
        let started = Instant::now();
        let worker = model.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let image = worker.generate(&params)?;
            encode_png(&image)
        })
        .await
        .unwrap_or_else(|err| Err(anyhow!("generation task failed: {err}")));

        match outcome {
            Ok(png) => {
                info!(model = %name, elapsed = ?started.elapsed(), bytes = png.len(), "Generated image");
                Ok(png)
            }
            Err(err) => Err(self.fail_generation(&name, &model, err).await),
        }
    }

    async fn fail_generation(
        &self,
        name: &str,
        model: &ModelHandle,
        err: anyhow::Error,
    ) -> ServeError {
        let message = format!("Error generating image with model {name}: {err:#}");
        error!(model = name, "{message}");
        if let Err(err) = self.registry.mark_failed(name, model, message.clone()).await {
            error!(model = name, "Failed to record generation failure: {err}");
        }
        model.release_memory();
        ServeError::Internal(message)
    }
}

pub fn encode_png(image: &DynamicImage) -> anyhow::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(bytes)
}
