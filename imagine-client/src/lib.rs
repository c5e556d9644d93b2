//! Client for the imagine generation server with model fallback and local
//! image history.

mod client;
mod error;
pub mod filename;
pub mod history;
mod prompt;

pub use client::{
    select_model, ClientConfig, GenerateRequest, GeneratedImage, ImagineClient, DEFAULT_BASE_URL,
    DEFAULT_MIN_REQUEST_INTERVAL, DEFAULT_OUTPUT_DIR, DEFAULT_TIMEOUT,
};
pub use error::ClientError;
pub use history::{GenerationParameters, HistoryEntry, HistoryStore};
pub use prompt::sanitize_prompt;
