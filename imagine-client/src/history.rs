//! Bounded record of generated images.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{filename::write_atomic, ClientError};

pub const HISTORY_FILE: &str = "generation_history.json";
pub const MAX_HISTORY: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParameters {
    pub model: String,
    pub img_size: u32,
    #[serde(default)]
    pub guidance_scale: Option<f64>,
    #[serde(default)]
    pub num_inference_steps: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub prompt: String,
    pub timestamp: DateTime<Utc>,
    pub path: PathBuf,
    pub parameters: GenerationParameters,
}

/// `generation_history.json` inside an output directory, oldest entry first.
/// Clones share one write lock.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl HistoryStore {
    pub fn new(output_dir: impl AsRef<Path>) -> Self {
        Self {
            path: output_dir.as_ref().join(HISTORY_FILE),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The most recent entries. A missing or unreadable file is empty.
    pub fn load(&self) -> Vec<HistoryEntry> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                warn!(path = %self.path.display(), "Failed to read history: {err}");
                return Vec::new();
            }
        };
        match serde_json::from_slice::<Vec<HistoryEntry>>(&data) {
            Ok(mut entries) => {
                let excess = entries.len().saturating_sub(MAX_HISTORY);
                entries.drain(..excess);
                entries
            }
            Err(err) => {
                warn!(path = %self.path.display(), "Ignoring corrupt history: {err}");
                Vec::new()
            }
        }
    }

    pub fn append(&self, entry: HistoryEntry) -> Result<(), ClientError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries = self.load();
        entries.push(entry);
        self.write(&entries)
    }

    /// Keeps only the last [`MAX_HISTORY`] entries.
    pub fn save(&self, entries: &[HistoryEntry]) -> Result<(), ClientError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.write(entries)
    }

    fn write(&self, entries: &[HistoryEntry]) -> Result<(), ClientError> {
        let start = entries.len().saturating_sub(MAX_HISTORY);
        let json = serde_json::to_vec_pretty(&entries[start..])?;
        write_atomic(&self.path, &json)?;
        Ok(())
    }

    /// Entries whose prompt contains `term`, ignoring case.
    pub fn search(&self, term: &str) -> Vec<HistoryEntry> {
        let term = term.to_lowercase();
        self.load()
            .into_iter()
            .filter(|entry| entry.prompt.to_lowercase().contains(&term))
            .collect()
    }
}
