use anyhow::{Context, Result};
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Tensor};
use hf_hub::api::tokio::ApiRepo;
use image::DynamicImage;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::DeviceMap;

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            warn!("Running on CPU, to run on GPU(metal), build with `--features metal`");
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            warn!("Running on CPU, to run on GPU, build with `--features cuda`");
            Ok(Device::Cpu)
        }
    }
}

/// Half precision on accelerators, full precision on CPU.
pub fn half_dtype(device: &Device) -> DType {
    if device.is_cpu() {
        DType::F32
    } else {
        DType::F16
    }
}

pub fn describe_device(device: &Device) -> String {
    format!("{:?}", device.location())
}

/// Seeds the device RNG. The CPU backend cannot be reseeded, so seeds are
/// ignored there.
pub fn seed_device(device: &Device, seed: Option<u64>) -> Result<()> {
    match seed {
        Some(seed) if !device.is_cpu() => Ok(device.set_seed(seed)?),
        Some(seed) => {
            debug!(seed, "Ignoring seed on CPU device");
            Ok(())
        }
        None => Ok(()),
    }
}

/// Rounds `size` down to a multiple of `multiple`, never below `multiple`.
pub fn align_down(size: u32, multiple: u32) -> usize {
    ((size / multiple).max(1) * multiple) as usize
}

/// Fetches `{stem}.fp16.safetensors` when `half` is set, falling back to the
/// full precision file.
pub async fn fetch_weights(repo: &ApiRepo, stem: &str, half: bool) -> Result<PathBuf> {
    let full = format!("{stem}.safetensors");
    if half {
        let fp16 = format!("{stem}.fp16.safetensors");
        match repo.get(&fp16).await {
            Ok(path) => return Ok(path),
            Err(err) => info!(file = %fp16, "fp16 weights unavailable, using {full}: {err}"),
        }
    }
    repo.get(&full)
        .await
        .with_context(|| format!("failed to fetch {full}"))
}

/// Converts a u8 tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels, got {channels}");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_down_keeps_multiples() {
        assert_eq!(align_down(512, 8), 512);
        assert_eq!(align_down(1000, 16), 992);
        assert_eq!(align_down(7, 8), 8);
    }

    #[test]
    fn converts_chw_tensor() {
        let data: Vec<u8> = (0..12).collect();
        let tensor = Tensor::from_vec(data, (3, 2, 2), &Device::Cpu).unwrap();
        let image = tensor_to_image(&tensor).unwrap().to_rgb8();
        assert_eq!(image.dimensions(), (2, 2));
        assert_eq!(image.get_pixel(0, 0).0, [0, 4, 8]);
        assert_eq!(image.get_pixel(1, 1).0, [3, 7, 11]);
    }

    #[test]
    fn rejects_non_rgb_tensor() {
        let tensor = Tensor::zeros((1, 2, 2), DType::U8, &Device::Cpu).unwrap();
        assert!(tensor_to_image(&tensor).is_err());
    }

    #[test]
    fn cpu_ignores_seed() {
        assert!(seed_device(&Device::Cpu, Some(42)).is_ok());
    }
}
