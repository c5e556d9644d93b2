use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0}")]
    InvalidPrompt(String),
    #[error("Model {0} is not available and no fallbacks specified")]
    ModelUnavailable(String),
    #[error("No available models to generate image")]
    NoAvailableModels,
    #[error("invalid server url {url}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("failed to build http client: {0}")]
    Build(#[source] reqwest::Error),
    #[error("request for {model} failed: {source}")]
    Request {
        model: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request for {model} returned {status}: {body}")]
    Status {
        model: String,
        status: reqwest::StatusCode,
        body: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// The model (or endpoint, for non-generation calls) a failed request
    /// was sent to.
    pub fn model(&self) -> Option<&str> {
        match self {
            Self::Request { model, .. } | Self::Status { model, .. } => Some(model),
            Self::ModelUnavailable(model) => Some(model),
            _ => None,
        }
    }

    /// True for failures that a different model might not hit.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Request { .. } | Self::Status { .. })
    }
}
