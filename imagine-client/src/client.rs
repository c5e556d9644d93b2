use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{Local, Utc};
use imagine_core::api::{HealthReport, ModelDetail, ReloadReport, ServerInfo};
use reqwest::{RequestBuilder, Response, Url};
use serde::{de::DeserializeOwned, Serialize};
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, error, info, warn};

use crate::{
    filename::{create_filename, write_new},
    history::{GenerationParameters, HistoryEntry, HistoryStore},
    ClientError,
};

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);
pub const DEFAULT_OUTPUT_DIR: &str = "generated_images";
/// At most ten generation calls per second.
pub const DEFAULT_MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub output_dir: PathBuf,
    pub timeout: Duration,
    /// Minimum spacing between generation calls.
    pub min_request_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            token: None,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            timeout: DEFAULT_TIMEOUT,
            min_request_interval: DEFAULT_MIN_REQUEST_INTERVAL,
        }
    }
}

/// A generation call with its fallback chain.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub prompt: String,
    pub model: String,
    pub img_size: u32,
    pub guidance_scale: Option<f64>,
    pub num_inference_steps: Option<u32>,
    pub seed: Option<u64>,
    /// Tried in order when `model` is unavailable or fails.
    pub fallback_models: Vec<String>,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            img_size: 512,
            guidance_scale: None,
            num_inference_steps: None,
            seed: None,
            fallback_models: Vec::new(),
        }
    }

    pub fn with_fallbacks<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fallback_models = models.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedImage {
    pub path: PathBuf,
    pub model: String,
}

#[derive(Serialize)]
struct ImagineQuery<'a> {
    prompt: &'a str,
    img_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    guidance_scale: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_inference_steps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

impl<'a> From<&'a GenerateRequest> for ImagineQuery<'a> {
    fn from(request: &'a GenerateRequest) -> Self {
        Self {
            prompt: &request.prompt,
            img_size: request.img_size,
            guidance_scale: request.guidance_scale,
            num_inference_steps: request.num_inference_steps,
            seed: request.seed,
        }
    }
}

/// Picks the first model to try: `primary` when the server lists it,
/// otherwise the first listed fallback.
pub fn select_model(
    primary: &str,
    fallbacks: &[String],
    available: &[String],
) -> Result<String, ClientError> {
    if available.iter().any(|m| m == primary) {
        return Ok(primary.to_string());
    }
    if fallbacks.is_empty() {
        return Err(ClientError::ModelUnavailable(primary.to_string()));
    }
    warn!(model = primary, "Primary model not available, trying fallbacks");
    fallbacks
        .iter()
        .find(|m| available.contains(m))
        .cloned()
        .ok_or(ClientError::NoAvailableModels)
}

/// Spaces calls at least `interval` apart; waiters queue in arrival order.
struct RequestGate {
    interval: Duration,
    next: Mutex<Option<Instant>>,
}

impl RequestGate {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Mutex::new(None),
        }
    }

    async fn wait(&self) {
        let mut next = self.next.lock().await;
        let now = Instant::now();
        let start = match *next {
            Some(at) if at > now => {
                debug!(delay = ?(at - now), "Throttling generation request");
                tokio::time::sleep_until(at).await;
                at
            }
            _ => now,
        };
        *next = Some(start + self.interval);
    }
}

pub struct ImagineClient {
    http: reqwest::Client,
    base_url: Url,
    config: ClientConfig,
    history: HistoryStore,
    gate: RequestGate,
}

impl ImagineClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let invalid = |reason: String| ClientError::InvalidBaseUrl {
            url: config.base_url.clone(),
            reason,
        };
        let base_url = Url::parse(&config.base_url).map_err(|err| invalid(err.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(invalid("not a base url".to_string()));
        }
        std::fs::create_dir_all(&config.output_dir)?;
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(ClientError::Build)?;
        let history = HistoryStore::new(&config.output_dir);
        let gate = RequestGate::new(config.min_request_interval);
        Ok(Self {
            http,
            base_url,
            config,
            history,
            gate,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn output_dir(&self) -> &Path {
        &self.config.output_dir
    }

    /// The base url with `segments` appended, each percent-encoded.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.config.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder, model: &str) -> Result<Response, ClientError> {
        let response = self
            .authorize(builder)
            .send()
            .await
            .map_err(|source| ClientError::Request {
                model: model.to_string(),
                source,
            })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ClientError::Status {
            model: model.to_string(),
            status,
            body,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &[&str], model: &str) -> Result<T, ClientError> {
        let response = self.send(self.http.get(self.url(path)), model).await?;
        response.json().await.map_err(|source| ClientError::Request {
            model: model.to_string(),
            source,
        })
    }

    pub async fn check_health(&self) -> Result<HealthReport, ClientError> {
        self.get_json(&["health"], "health").await.inspect_err(|err| {
            error!("Health check failed: {err}");
        })
    }

    pub async fn server_info(&self) -> Result<ServerInfo, ClientError> {
        self.get_json(&["info"], "info").await
    }

    pub async fn model_info(&self, model: &str) -> Result<ModelDetail, ClientError> {
        self.get_json(&["model_info", model], model).await
    }

    pub async fn reload_model(&self, model: &str) -> Result<ReloadReport, ClientError> {
        let response = self
            .send(self.http.post(self.url(&["reload_model", model])), model)
            .await?;
        response.json().await.map_err(|source| ClientError::Request {
            model: model.to_string(),
            source,
        })
    }

    /// Models the server lists. Empty when the server cannot be reached.
    pub async fn available_models(&self) -> Vec<String> {
        match self.server_info().await {
            Ok(info) => info.available_models,
            Err(err) => {
                error!("Failed to get available models: {err}");
                Vec::new()
            }
        }
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.load()
    }

    pub fn history_store(&self) -> &HistoryStore {
        &self.history
    }

    async fn request_image(&self, model: &str, request: &GenerateRequest) -> Result<Vec<u8>, ClientError> {
        let builder = self
            .http
            .post(self.url(&["imagine", model]))
            .query(&ImagineQuery::from(request));
        let response = self.send(builder, model).await?;
        let bytes = response.bytes().await.map_err(|source| ClientError::Request {
            model: model.to_string(),
            source,
        })?;
        Ok(bytes.to_vec())
    }

    /// Generates an image, walking the fallback chain on failure, and saves
    /// it under the output directory.
    pub async fn generate_image(&self, request: &GenerateRequest) -> Result<GeneratedImage, ClientError> {
        if request.prompt.trim().is_empty() {
            return Err(ClientError::InvalidPrompt("Prompt cannot be empty".to_string()));
        }

        let available = self.available_models().await;
        let mut model = select_model(&request.model, &request.fallback_models, &available)?;
        let mut visited = HashSet::new();

        loop {
            visited.insert(model.clone());
            self.gate.wait().await;
            info!(model = %model, "Requesting image");
            match self.request_image(&model, request).await {
                Ok(png) => return self.save(model, request, &png),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => {
                    warn!(model = %model, "Generation failed: {err}");
                    let next = request
                        .fallback_models
                        .iter()
                        .find(|m| !visited.contains(*m) && available.contains(m));
                    match next {
                        Some(next) => {
                            info!(model = %next, "Trying fallback model");
                            model = next.clone();
                        }
                        None => return Err(err),
                    }
                }
            }
        }
    }

    fn save(&self, model: String, request: &GenerateRequest, png: &[u8]) -> Result<GeneratedImage, ClientError> {
        let filename = create_filename(&model, &request.prompt, Local::now());
        let path = write_new(&self.config.output_dir, &filename, png)?;
        info!(path = %path.display(), "Image saved");

        self.history.append(HistoryEntry {
            prompt: request.prompt.clone(),
            timestamp: Utc::now(),
            path: path.clone(),
            parameters: GenerationParameters {
                model: model.clone(),
                img_size: request.img_size,
                guidance_scale: request.guidance_scale,
                num_inference_steps: request.num_inference_steps,
            },
        })?;
        Ok(GeneratedImage { path, model })
    }
}
