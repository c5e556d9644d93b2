//! Stable Diffusion 2.1 and SDXL family pipelines.

use std::path::PathBuf;

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_transformers::models::stable_diffusion::{
    build_clip_transformer, clip::ClipTextTransformer, schedulers::Scheduler,
    unet_2d::UNet2DConditionModel, vae::AutoEncoderKL, StableDiffusionConfig,
};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use imagine_core::{GenerationParams, ImageModel, ModelInfo};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::{
    align_down, build_blocking, describe_device, fetch_weights, half_dtype, seed_device,
    select_best_device, tensor_to_image, DeviceMap, Loader,
};

const FP16_VAE_REPO: &str = "madebyollin/sdxl-vae-fp16-fix";
const LIGHTNING_REPO: &str = "ByteDance/SDXL-Lightning";
const LIGHTNING_UNET: &str = "sdxl_lightning_4step_unet.safetensors";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdVariant {
    V2_1,
    Xl,
    Turbo,
    Lightning,
}

impl SdVariant {
    fn repo(self) -> &'static str {
        match self {
            Self::V2_1 => "stabilityai/stable-diffusion-2-1",
            Self::Xl | Self::Lightning => "stabilityai/stable-diffusion-xl-base-1.0",
            Self::Turbo => "stabilityai/sdxl-turbo",
        }
    }

    fn tokenizer_repo(self) -> &'static str {
        match self {
            Self::V2_1 => "openai/clip-vit-base-patch32",
            Self::Xl | Self::Turbo | Self::Lightning => "openai/clip-vit-large-patch14",
        }
    }

    fn is_xl(self) -> bool {
        !matches!(self, Self::V2_1)
    }

    fn config(self) -> StableDiffusionConfig {
        match self {
            Self::V2_1 => StableDiffusionConfig::v2_1(None, None, None),
            Self::Xl => StableDiffusionConfig::sdxl(None, None, None),
            // Lightning checkpoints are distilled for a trailing Euler schedule.
            Self::Turbo | Self::Lightning => StableDiffusionConfig::sdxl_turbo(None, None, None),
        }
    }

    fn vae_scale(self) -> f64 {
        if self.is_xl() {
            0.13025
        } else {
            0.18215
        }
    }

    fn pipeline_name(self) -> &'static str {
        if self.is_xl() {
            "StableDiffusionXLPipeline"
        } else {
            "StableDiffusionPipeline"
        }
    }
}

struct TextEncoder {
    tokenizer: Tokenizer,
    model: ClipTextTransformer,
    max_len: usize,
    pad_id: u32,
}

impl TextEncoder {
    fn new(
        tokenizer: Tokenizer,
        model: ClipTextTransformer,
        max_len: usize,
        pad_with: Option<&str>,
    ) -> Result<Self> {
        let pad_token = pad_with.unwrap_or("<|endoftext|>");
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad_token)
            .with_context(|| format!("tokenizer has no {pad_token} token"))?;
        Ok(Self {
            tokenizer,
            model,
            max_len,
            pad_id,
        })
    }

    fn embed(&self, prompt: &str, device: &Device) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        tokens.truncate(self.max_len);
        tokens.resize(self.max_len, self.pad_id);
        let tokens = Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)?;
        Ok(self.model.forward(&tokens)?)
    }
}

pub struct StableDiffusionModel {
    variant: SdVariant,
    device: Device,
    dtype: DType,
    config: StableDiffusionConfig,
    encoders: Vec<TextEncoder>,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
}

impl StableDiffusionModel {
    /// Embeddings of shape (batch, tokens, hidden). With guidance the
    /// unconditional embedding is stacked first.
    fn text_embeddings(&self, prompt: &str, guided: bool) -> Result<Tensor> {
        let per_encoder = self
            .encoders
            .iter()
            .map(|encoder| {
                let cond = encoder.embed(prompt, &self.device)?;
                if guided {
                    let uncond = encoder.embed("", &self.device)?;
                    Ok(Tensor::cat(&[uncond, cond], 0)?)
                } else {
                    Ok(cond)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&per_encoder, D::Minus1)?.to_dtype(self.dtype)?)
    }
}

impl ImageModel for StableDiffusionModel {
    fn generate(&self, params: &GenerationParams) -> Result<DynamicImage> {
        let height = align_down(params.height, 8);
        let width = align_down(params.width, 8);
        let guidance = params.guidance_scale;
        let guided = guidance > 1.0;
        seed_device(&self.device, params.seed)?;

        let text_embeddings = self.text_embeddings(&params.prompt, guided)?;
        let mut scheduler = self
            .config
            .build_scheduler(params.num_inference_steps as usize)?;
        let timesteps = scheduler.timesteps().to_vec();

        let latents = Tensor::randn(0f32, 1f32, (1, 4, height / 8, width / 8), &self.device)?;
        let mut latents = (latents * scheduler.init_noise_sigma())?.to_dtype(self.dtype)?;

        for (step, &timestep) in timesteps.iter().enumerate() {
            let model_input = if guided {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let model_input = scheduler.scale_model_input(model_input, timestep)?;
            let noise_pred = self
                .unet
                .forward(&model_input, timestep as f64, &text_embeddings)?;
            let noise_pred = if guided {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, cond) = (&chunks[0], &chunks[1]);
                (uncond + ((cond - uncond)? * guidance)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            debug!(step = step + 1, total = timesteps.len(), "Denoising step done");
        }

        let image = self.vae.decode(&(latents / self.variant.vae_scale())?)?;
        let image = ((image.to_dtype(DType::F32)? / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let image = (image.clamp(0f32, 1f32)? * 255.)?.to_dtype(DType::U8)?;
        tensor_to_image(&image.i(0)?)
    }

    fn info(&self) -> ModelInfo {
        let (model_id, base_model, checkpoint) = match self.variant {
            SdVariant::Lightning => (
                LIGHTNING_REPO.to_string(),
                Some(self.variant.repo().to_string()),
                Some(LIGHTNING_UNET.to_string()),
            ),
            variant => (variant.repo().to_string(), None, None),
        };
        ModelInfo {
            model_id,
            model_type: self.variant.pipeline_name().to_string(),
            device: describe_device(&self.device),
            dtype: format!("{:?}", self.dtype),
            base_model,
            checkpoint,
        }
    }

    fn release_memory(&self) {
        if let Err(err) = self.device.synchronize() {
            debug!("Device synchronize failed: {err}");
        }
    }
}

struct SdFiles {
    tokenizers: Vec<PathBuf>,
    clips: Vec<PathBuf>,
    unet: PathBuf,
    vae: PathBuf,
}

impl SdFiles {
    async fn fetch(api: &Api, variant: SdVariant, half: bool) -> Result<Self> {
        let repo = api.model(variant.repo().to_string());

        let mut tokenizers = vec![api
            .model(variant.tokenizer_repo().to_string())
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?];
        let mut clips = vec![fetch_weights(&repo, "text_encoder/model", half).await?];
        if variant.is_xl() {
            tokenizers.push(
                api.model("laion/CLIP-ViT-bigG-14-laion2B-39B-b160k".to_string())
                    .get("tokenizer.json")
                    .await
                    .context("failed to get second CLIP tokenizer")?,
            );
            clips.push(fetch_weights(&repo, "text_encoder_2/model", half).await?);
        }

        let unet = match variant {
            SdVariant::Lightning => api
                .model(LIGHTNING_REPO.to_string())
                .get(LIGHTNING_UNET)
                .await
                .context("failed to get lightning unet")?,
            _ => fetch_weights(&repo, "unet/diffusion_pytorch_model", half).await?,
        };

        // The stock SDXL VAE overflows in half precision.
        let vae = if variant.is_xl() && half {
            api.model(FP16_VAE_REPO.to_string())
                .get("diffusion_pytorch_model.safetensors")
                .await
                .context("failed to get fp16 VAE")?
        } else {
            fetch_weights(&repo, "vae/diffusion_pytorch_model", half).await?
        };

        Ok(Self {
            tokenizers,
            clips,
            unet,
            vae,
        })
    }
}

fn build(
    variant: SdVariant,
    files: SdFiles,
    device: Device,
    dtype: DType,
) -> Result<StableDiffusionModel> {
    let config = variant.config();
    let clip_configs = std::iter::once(&config.clip).chain(config.clip2.as_ref());

    let encoders = clip_configs
        .zip(files.tokenizers.iter().zip(&files.clips))
        .map(|(clip_config, (tokenizer, weights))| {
            let tokenizer = Tokenizer::from_file(tokenizer)
                .map_err(Error::msg)
                .context("failed to load CLIP tokenizer")?;
            // Text encoders stay in F32; half precision CLIP is unstable.
            let model = build_clip_transformer(clip_config, weights, &device, DType::F32)
                .context("failed to load CLIP model")?;
            TextEncoder::new(
                tokenizer,
                model,
                clip_config.max_position_embeddings,
                clip_config.pad_with.as_deref(),
            )
        })
        .collect::<Result<Vec<_>>>()?;

    let vae = config
        .build_vae(&files.vae, &device, dtype)
        .context("failed to load VAE")?;
    let unet = config
        .build_unet(&files.unet, &device, 4, cfg!(feature = "flash-attn"), dtype)
        .context("failed to load UNet")?;

    Ok(StableDiffusionModel {
        variant,
        device,
        dtype,
        config,
        encoders,
        unet,
        vae,
    })
}

pub struct StableDiffusionLoader {
    variant: SdVariant,
}

impl StableDiffusionLoader {
    pub fn new(variant: SdVariant) -> Self {
        Self { variant }
    }
}

impl Loader for StableDiffusionLoader {
    type Model = StableDiffusionModel;

    async fn load(self, api: Api, device_map: DeviceMap) -> Result<Self::Model> {
        let variant = self.variant;
        let device = select_best_device(device_map).context("failed to set up device")?;
        let dtype = half_dtype(&device);
        let files = SdFiles::fetch(&api, variant, dtype == DType::F16).await?;
        info!(repo = variant.repo(), ?dtype, "Fetched stable diffusion weights");
        build_blocking("stable diffusion", move || build(variant, files, device, dtype)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xl_variants_use_two_encoders() {
        for variant in [SdVariant::Xl, SdVariant::Turbo, SdVariant::Lightning] {
            assert!(variant.config().clip2.is_some(), "{variant:?}");
            assert_eq!(variant.vae_scale(), 0.13025);
        }
        assert!(SdVariant::V2_1.config().clip2.is_none());
        assert_eq!(SdVariant::V2_1.vae_scale(), 0.18215);
    }

    #[test]
    fn lightning_builds_on_sdxl_base() {
        assert_eq!(SdVariant::Lightning.repo(), SdVariant::Xl.repo());
    }
}
