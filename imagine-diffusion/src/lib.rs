//! Candle-backed implementations of [`imagine_core::ImageModel`].

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod device_map;
pub mod loader;
mod loader_factory;
mod util;

mod flux;
mod stable_diffusion;

pub use device_map::*;
pub use flux::{FluxLoader, FluxModel};
pub use loader::*;
pub use loader_factory::*;
pub use stable_diffusion::{SdVariant, StableDiffusionLoader, StableDiffusionModel};
pub(crate) use util::*;
