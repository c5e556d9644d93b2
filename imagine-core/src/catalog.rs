use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CatalogError;

/// Static generation limits and defaults for one model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub default_steps: u32,
    pub default_guidance: f64,
    pub min_img_size: u32,
    pub max_img_size: u32,
    /// Marks the model used when a request does not name one.
    #[serde(default)]
    pub default: bool,
}

impl ModelConfig {
    pub const fn new(
        default_steps: u32,
        default_guidance: f64,
        min_img_size: u32,
        max_img_size: u32,
    ) -> Self {
        Self {
            default_steps,
            default_guidance,
            min_img_size,
            max_img_size,
            default: false,
        }
    }

    const fn as_default(mut self) -> Self {
        self.default = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    #[serde(flatten)]
    pub config: ModelConfig,
}

/// Ordered, immutable mapping of model name to [`ModelConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct ModelCatalog {
    entries: Vec<CatalogEntry>,
    default_index: usize,
}

impl ModelCatalog {
    /// The models the diffusion backend knows how to build.
    pub fn builtin() -> Self {
        let entries = [
            ("sd2", ModelConfig::new(50, 7.5, 512, 768)),
            ("sdxl", ModelConfig::new(25, 7.5, 512, 1024)),
            ("flux", ModelConfig::new(4, 0.0, 256, 1024)),
            ("sdxl-turbo", ModelConfig::new(1, 0.0, 512, 1024)),
            ("sdxl-lightning", ModelConfig::new(4, 0.0, 512, 1024).as_default()),
        ]
        .into_iter()
        .map(|(name, config)| CatalogEntry {
            name: name.to_string(),
            config,
        })
        .collect::<Vec<_>>();

        let default_index = entries.iter().position(|e| e.config.default).unwrap_or(0);
        Self {
            entries,
            default_index,
        }
    }

    pub fn from_entries(entries: Vec<CatalogEntry>) -> Result<Self, CatalogError> {
        if entries.is_empty() {
            return Err(CatalogError::Empty);
        }
        for (i, entry) in entries.iter().enumerate() {
            if entries[..i].iter().any(|e| e.name == entry.name) {
                return Err(CatalogError::DuplicateModel(entry.name.clone()));
            }
            if entry.config.min_img_size > entry.config.max_img_size {
                return Err(CatalogError::InvalidBounds {
                    name: entry.name.clone(),
                    min: entry.config.min_img_size,
                    max: entry.config.max_img_size,
                });
            }
        }
        let default_index = entries.iter().position(|e| e.config.default).unwrap_or(0);
        Ok(Self {
            entries,
            default_index,
        })
    }

    /// Parses a JSON array of `{"name": ..., "default_steps": ..., ...}` objects.
    pub fn from_json_str(json: &str) -> Result<Self, CatalogError> {
        let entries: Vec<CatalogEntry> = serde_json::from_str(json)?;
        Self::from_entries(entries)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Restricts the catalog to a single model, which becomes the default.
    pub fn only(&self, name: &str) -> Result<Self, CatalogError> {
        let mut entry = self
            .entries
            .iter()
            .find(|e| e.name == name)
            .cloned()
            .ok_or_else(|| CatalogError::UnknownModel(name.to_string()))?;
        entry.config.default = true;
        Ok(Self {
            entries: vec![entry],
            default_index: 0,
        })
    }

    pub fn get(&self, name: &str) -> Option<&ModelConfig> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| &e.config)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.iter()
    }

    pub fn default_model(&self) -> &str {
        &self.entries[self.default_index].name
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn builtin_defaults_to_lightning() {
        let catalog = ModelCatalog::builtin();
        assert_eq!(catalog.len(), 5);
        assert_eq!(catalog.default_model(), "sdxl-lightning");
        let flux = catalog.get("flux").unwrap();
        assert_eq!(flux.default_steps, 4);
        assert_eq!(flux.min_img_size, 256);
        assert_eq!(
            catalog.names().collect::<Vec<_>>(),
            ["sd2", "sdxl", "flux", "sdxl-turbo", "sdxl-lightning"]
        );
    }

    #[test]
    fn only_keeps_one_entry_as_default() {
        let catalog = ModelCatalog::builtin().only("sdxl").unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.default_model(), "sdxl");
        assert!(catalog.get("sdxl").unwrap().default);
        assert!(!catalog.contains("flux"));
    }

    #[test]
    fn only_rejects_unknown_model() {
        let err = ModelCatalog::builtin().only("dalle").unwrap_err();
        assert!(matches!(err, CatalogError::UnknownModel(name) if name == "dalle"));
    }

    #[test]
    fn json_catalog_without_default_uses_first_entry() {
        let catalog = ModelCatalog::from_json_str(
            r#"[
                {"name": "flux", "default_steps": 4, "default_guidance": 0.0, "min_img_size": 256, "max_img_size": 1024},
                {"name": "sd2", "default_steps": 50, "default_guidance": 7.5, "min_img_size": 512, "max_img_size": 768}
            ]"#,
        )
        .unwrap();
        assert_eq!(catalog.default_model(), "flux");
        assert_eq!(catalog.get("sd2").unwrap().max_img_size, 768);
    }

    #[test]
    fn rejects_malformed_catalogs() {
        assert!(matches!(
            ModelCatalog::from_json_str("[]"),
            Err(CatalogError::Empty)
        ));
        assert!(matches!(
            ModelCatalog::from_json_str(
                r#"[{"name": "a", "default_steps": 1, "default_guidance": 0.0, "min_img_size": 512, "max_img_size": 256}]"#
            ),
            Err(CatalogError::InvalidBounds { .. })
        ));
        let entry = CatalogEntry {
            name: "a".into(),
            config: ModelConfig::new(1, 0.0, 1, 2),
        };
        assert!(matches!(
            ModelCatalog::from_entries(vec![entry.clone(), entry]),
            Err(CatalogError::DuplicateModel(name)) if name == "a"
        ));
    }

    #[test]
    fn loads_catalog_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"name": "sdxl-turbo", "default_steps": 1, "default_guidance": 0.0, "min_img_size": 512, "max_img_size": 1024, "default": true}}]"#
        )
        .unwrap();
        let catalog = ModelCatalog::from_file(file.path()).unwrap();
        assert_eq!(catalog.default_model(), "sdxl-turbo");
    }
}
