use std::future::Future;

use anyhow::{Context, Result};
use hf_hub::api::tokio::Api;
use imagine_core::ImageModel;

use crate::DeviceMap;

/// Builds one model family from hub weights.
pub trait Loader {
    type Model: ImageModel + 'static;

    fn load(self, api: Api, device_map: DeviceMap) -> impl Future<Output = Result<Self::Model>> + Send
    where
        Self: Sized;
}

/// Runs CPU-bound weight construction off the async executor.
pub(crate) async fn build_blocking<T, F>(what: &'static str, build: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(build)
        .await
        .with_context(|| format!("{what} construction task panicked"))?
}
