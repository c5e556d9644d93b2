//! Per-model load state.
//!
//! Each catalog entry owns a [`ModelStatus`] behind its own lock plus a load
//! gate. Construction, reload and failure marking for one model never
//! interleave, while different models load and serve independently.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::{
    catalog::{ModelCatalog, ModelConfig},
    error::ServeError,
    model::{ModelFactory, ModelHandle},
};

/// Mutable load record for one model.
#[derive(Default)]
pub struct ModelStatus {
    pub is_loaded: bool,
    pub error: Option<String>,
    pub model: Option<ModelHandle>,
    pub last_error_time: Option<DateTime<Utc>>,
}

impl ModelStatus {
    fn loaded(model: ModelHandle) -> Self {
        Self {
            is_loaded: true,
            error: None,
            model: Some(model),
            last_error_time: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            is_loaded: false,
            error: Some(error),
            model: None,
            last_error_time: Some(Utc::now()),
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            is_loaded: self.is_loaded,
            error: self.error.clone(),
            last_error_time: self.last_error_time,
        }
    }
}

impl std::fmt::Debug for ModelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelStatus")
            .field("is_loaded", &self.is_loaded)
            .field("error", &self.error)
            .field("last_error_time", &self.last_error_time)
            .finish_non_exhaustive()
    }
}

/// Copy of a [`ModelStatus`] without the model handle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub is_loaded: bool,
    pub error: Option<String>,
    pub last_error_time: Option<DateTime<Utc>>,
}

struct ModelSlot {
    config: ModelConfig,
    load_gate: Mutex<()>,
    status: RwLock<ModelStatus>,
}

impl ModelSlot {
    fn new(config: ModelConfig) -> Self {
        Self {
            config,
            load_gate: Mutex::new(()),
            status: RwLock::new(ModelStatus::default()),
        }
    }

    async fn handle(&self) -> Option<ModelHandle> {
        let status = self.status.read().await;
        status.model.clone().filter(|_| status.is_loaded)
    }
}

pub struct ModelRegistry {
    catalog: ModelCatalog,
    slots: HashMap<String, ModelSlot>,
    factory: Arc<dyn ModelFactory>,
}

impl ModelRegistry {
    pub fn new(catalog: ModelCatalog, factory: Arc<dyn ModelFactory>) -> Self {
        let slots = catalog
            .iter()
            .map(|entry| (entry.name.clone(), ModelSlot::new(entry.config)))
            .collect();
        Self {
            catalog,
            slots,
            factory,
        }
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.catalog.names()
    }

    pub fn default_model(&self) -> &str {
        self.catalog.default_model()
    }

    fn slot(&self, name: &str) -> Result<&ModelSlot, ServeError> {
        self.slots
            .get(name)
            .ok_or_else(|| ServeError::NotFound(name.to_string()))
    }

    pub fn config(&self, name: &str) -> Result<ModelConfig, ServeError> {
        self.slot(name).map(|slot| slot.config)
    }

    pub async fn status(&self, name: &str) -> Result<StatusSnapshot, ServeError> {
        Ok(self.slot(name)?.status.read().await.snapshot())
    }

    /// The installed handle, if the model is currently loaded.
    pub async fn handle(&self, name: &str) -> Result<Option<ModelHandle>, ServeError> {
        Ok(self.slot(name)?.handle().await)
    }

    /// Constructs the model and records the outcome. Construction failures
    /// are stored on the status rather than returned.
    pub async fn load(&self, name: &str) -> Result<StatusSnapshot, ServeError> {
        let slot = self.slot(name)?;
        let _gate = slot.load_gate.lock().await;
        Ok(self.construct(name, slot).await)
    }

    /// Same as [`load`](Self::load), regardless of the current state.
    pub async fn reload(&self, name: &str) -> Result<StatusSnapshot, ServeError> {
        info!(model = name, "Reload requested");
        self.load(name).await
    }

    /// Returns a loaded handle, constructing the model first if needed.
    ///
    /// Fails with [`ServeError::ServiceUnavailable`] carrying the last
    /// recorded error when construction does not succeed.
    pub async fn ensure_loaded(&self, name: &str) -> Result<ModelHandle, ServeError> {
        let slot = self.slot(name)?;
        if let Some(handle) = slot.handle().await {
            return Ok(handle);
        }

        let _gate = slot.load_gate.lock().await;
        // Another caller may have finished loading while we waited on the gate.
        if let Some(handle) = slot.handle().await {
            return Ok(handle);
        }

        let snapshot = self.construct(name, slot).await;
        slot.handle().await.ok_or_else(|| {
            ServeError::ServiceUnavailable(format!(
                "Model {name} is not available. Error: {}",
                snapshot.error.unwrap_or_default()
            ))
        })
    }

    /// Records an inference failure against `handle`.
    ///
    /// Returns `false` without touching the status when a reload has already
    /// replaced `handle`.
    pub async fn mark_failed(
        &self,
        name: &str,
        handle: &ModelHandle,
        error: impl Into<String>,
    ) -> Result<bool, ServeError> {
        let slot = self.slot(name)?;
        let mut status = slot.status.write().await;
        match &status.model {
            Some(current) if Arc::ptr_eq(current, handle) => {
                *status = ModelStatus::failed(error.into());
                Ok(true)
            }
            _ => {
                warn!(model = name, "Ignoring failure from a replaced model instance");
                Ok(false)
            }
        }
    }

    /// Loads every catalog model in order. A failure in one model does not
    /// stop the others.
    pub async fn load_all(&self) -> Vec<(String, StatusSnapshot)> {
        let mut results = Vec::with_capacity(self.catalog.len());
        for name in self.catalog.names() {
            if let Ok(snapshot) = self.load(name).await {
                results.push((name.to_string(), snapshot));
            }
        }
        results
    }

    /// Names of loaded models in catalog order.
    pub async fn loaded_models(&self) -> Vec<String> {
        let mut loaded = Vec::new();
        for name in self.catalog.names() {
            if let Some(slot) = self.slots.get(name) {
                if slot.status.read().await.is_loaded {
                    loaded.push(name.to_string());
                }
            }
        }
        loaded
    }

    /// Config and status of every model in catalog order.
    pub async fn statuses(&self) -> Vec<(String, ModelConfig, StatusSnapshot)> {
        let mut statuses = Vec::with_capacity(self.slots.len());
        for name in self.catalog.names() {
            if let Some(slot) = self.slots.get(name) {
                let snapshot = slot.status.read().await.snapshot();
                statuses.push((name.to_string(), slot.config, snapshot));
            }
        }
        statuses
    }

    async fn construct(&self, name: &str, slot: &ModelSlot) -> StatusSnapshot {
        info!(model = name, "Loading model");
        let outcome = self.factory.create(name).await;

        let mut status = slot.status.write().await;
        match outcome {
            Ok(model) => {
                *status = ModelStatus::loaded(model);
                info!(model = name, "Successfully loaded model");
            }
            Err(err) => {
                let message = format!("Failed to load model {name}: {err:#}");
                error!(model = name, "{message}");
                *status = ModelStatus::failed(message);
            }
        }
        status.snapshot()
    }
}
