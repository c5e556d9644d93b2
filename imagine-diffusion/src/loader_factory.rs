use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use hf_hub::api::tokio::Api;
use imagine_core::{ModelFactory, ModelHandle};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{DeviceMap, FluxLoader, Loader, SdVariant, StableDiffusionLoader};

/// Model families this crate can build, named as in the built-in catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelKind {
    Sd2,
    Sdxl,
    Flux,
    SdxlTurbo,
    SdxlLightning,
}

serde_plain::derive_display_from_serialize!(ModelKind);
serde_plain::derive_fromstr_from_deserialize!(ModelKind);

impl ModelKind {
    pub const ALL: [ModelKind; 5] = [
        ModelKind::Sd2,
        ModelKind::Sdxl,
        ModelKind::Flux,
        ModelKind::SdxlTurbo,
        ModelKind::SdxlLightning,
    ];

    fn sd_variant(self) -> Option<SdVariant> {
        match self {
            Self::Sd2 => Some(SdVariant::V2_1),
            Self::Sdxl => Some(SdVariant::Xl),
            Self::SdxlTurbo => Some(SdVariant::Turbo),
            Self::SdxlLightning => Some(SdVariant::Lightning),
            Self::Flux => None,
        }
    }
}

/// Creates candle pipelines by catalog name.
#[derive(Clone)]
pub struct DiffusionFactory {
    api: Api,
    device_map: DeviceMap,
}

impl DiffusionFactory {
    pub fn new(device_map: DeviceMap) -> Result<Self> {
        let api = Api::new().context("failed to initialize the Hugging Face hub client")?;
        Ok(Self { api, device_map })
    }

    pub fn with_api(api: Api, device_map: DeviceMap) -> Self {
        Self { api, device_map }
    }
}

#[async_trait]
impl ModelFactory for DiffusionFactory {
    async fn create(&self, name: &str) -> Result<ModelHandle> {
        let kind: ModelKind = name
            .parse()
            .with_context(|| format!("unsupported model type: {name}"))?;
        info!(model = name, ?kind, device_map = ?self.device_map, "Building pipeline");

        let api = self.api.clone();
        let model: ModelHandle = match kind.sd_variant() {
            Some(variant) => Arc::new(
                StableDiffusionLoader::new(variant)
                    .load(api, self.device_map)
                    .await?,
            ),
            None => Arc::new(FluxLoader.load(api, self.device_map).await?),
        };
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_match_catalog_names() {
        let catalog = imagine_core::ModelCatalog::builtin();
        let names: Vec<String> = ModelKind::ALL.iter().map(ToString::to_string).collect();
        assert_eq!(names, catalog.names().collect::<Vec<_>>());
        for name in catalog.names() {
            let kind: ModelKind = name.parse().unwrap();
            assert_eq!(kind.to_string(), name);
        }
    }

    #[test]
    fn rejects_unknown_names() {
        assert!("dalle".parse::<ModelKind>().is_err());
        assert!("SDXL".parse::<ModelKind>().is_err());
    }

    #[test]
    fn flux_has_no_sd_variant() {
        assert_eq!(ModelKind::Flux.sd_variant(), None);
        assert_eq!(ModelKind::SdxlLightning.sd_variant(), Some(SdVariant::Lightning));
    }
}
