//! FLUX.1-schnell text-to-image pipeline.

use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{anyhow, Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{Module, VarBuilder};
use candle_transformers::models::{
    clip::text_model::{Activation, ClipTextConfig, ClipTextTransformer},
    flux::{autoencoder, model, sampling},
    t5::{self, T5EncoderModel},
};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use imagine_core::{GenerationParams, ImageModel, ModelInfo};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::{
    align_down, build_blocking, describe_device, seed_device, select_best_device, tensor_to_image,
    DeviceMap, Loader,
};

const FLUX_REPO: &str = "black-forest-labs/FLUX.1-schnell";
const T5_REPO: &str = "google/t5-v1_1-xxl";
const T5_TOKENIZER_REPO: &str = "lmz/mt5-tokenizers";
const CLIP_REPO: &str = "openai/clip-vit-large-patch14";
const T5_MAX_TOKENS: usize = 256;
const CLIP_MAX_TOKENS: usize = 77;

pub struct FluxModel {
    device: Device,
    dtype: DType,
    // The T5 encoder caches attention state and needs `&mut self`.
    t5_model: Mutex<T5EncoderModel>,
    t5_tokenizer: Tokenizer,
    clip_model: ClipTextTransformer,
    clip_tokenizer: Tokenizer,
    autoencoder: autoencoder::AutoEncoder,
    flux_model: model::Flux,
}

impl FluxModel {
    fn encode(&self, tokenizer: &Tokenizer, prompt: &str, len: usize, pad: bool) -> Result<Tensor> {
        let mut tokens = tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        if pad {
            tokens.resize(len, 0);
        } else {
            tokens.truncate(len);
        }
        Ok(Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?)
    }
}

impl ImageModel for FluxModel {
    fn generate(&self, params: &GenerationParams) -> Result<DynamicImage> {
        let height = align_down(params.height, 16);
        let width = align_down(params.width, 16);
        seed_device(&self.device, params.seed)?;

        let noise_img = sampling::get_noise(1, height, width, &self.device)?.to_dtype(self.dtype)?;

        let t5_tokens = self.encode(&self.t5_tokenizer, &params.prompt, T5_MAX_TOKENS, true)?;
        let t5_emb = self
            .t5_model
            .lock()
            .map_err(|_| anyhow!("T5 encoder lock poisoned"))?
            .forward(&t5_tokens)?;

        let clip_tokens = self.encode(&self.clip_tokenizer, &params.prompt, CLIP_MAX_TOKENS, false)?;
        let clip_emb = self.clip_model.forward(&clip_tokens)?;

        let state = sampling::State::new(&t5_emb, &clip_emb, &noise_img)?;
        let timesteps = sampling::get_schedule(params.num_inference_steps as usize, None);

        let latent_img = sampling::denoise(
            &self.flux_model,
            &state.img,
            &state.img_ids,
            &state.txt,
            &state.txt_ids,
            &state.vec,
            &timesteps,
            params.guidance_scale,
        )?;
        let unpacked = sampling::unpack(&latent_img, height, width)?;
        debug!(height, width, "Generated latent image");

        let decoded = self.autoencoder.decode(&unpacked)?;
        let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        tensor_to_image(&img.i(0)?)
    }

    fn info(&self) -> ModelInfo {
        ModelInfo {
            model_id: FLUX_REPO.to_string(),
            model_type: "FluxPipeline".to_string(),
            device: describe_device(&self.device),
            dtype: format!("{:?}", self.dtype),
            base_model: None,
            checkpoint: None,
        }
    }

    fn release_memory(&self) {
        if let Err(err) = self.device.synchronize() {
            debug!("Device synchronize failed: {err}");
        }
    }
}

struct FluxFiles {
    t5_model: PathBuf,
    t5_config: PathBuf,
    t5_tokenizer: PathBuf,
    clip_model: PathBuf,
    clip_tokenizer: PathBuf,
    autoencoder: PathBuf,
    flux_model: PathBuf,
}

impl FluxFiles {
    async fn fetch(api: &Api) -> Result<Self> {
        let t5_repo = api.repo(hf_hub::Repo::with_revision(
            T5_REPO.to_string(),
            hf_hub::RepoType::Model,
            "refs/pr/2".to_string(),
        ));
        let clip_repo = api.model(CLIP_REPO.to_string());
        let bf_repo = api.model(FLUX_REPO.to_string());

        Ok(Self {
            t5_model: t5_repo
                .get("model.safetensors")
                .await
                .context("failed to load T5 model file")?,
            t5_config: t5_repo
                .get("config.json")
                .await
                .context("failed to get T5 config")?,
            t5_tokenizer: api
                .model(T5_TOKENIZER_REPO.to_string())
                .get("t5-v1_1-xxl.tokenizer.json")
                .await
                .context("failed to get T5 tokenizer")?,
            clip_model: clip_repo
                .get("model.safetensors")
                .await
                .context("failed to get CLIP model file")?,
            clip_tokenizer: clip_repo
                .get("tokenizer.json")
                .await
                .context("failed to get CLIP tokenizer")?,
            autoencoder: bf_repo
                .get("ae.safetensors")
                .await
                .context("failed to get autoencoder model file")?,
            flux_model: bf_repo
                .get("flux1-schnell.safetensors")
                .await
                .context("failed to get flux model file")?,
        })
    }
}

fn mmap(path: &Path, dtype: DType, device: &Device, what: &str) -> Result<VarBuilder<'static>> {
    // SAFETY: the hub cache files are not modified while mapped.
    unsafe {
        VarBuilder::from_mmaped_safetensors(&[path], dtype, device)
            .with_context(|| format!("failed to build {what} var builder"))
    }
}

fn build(files: FluxFiles, device: Device) -> Result<FluxModel> {
    let dtype = device.bf16_default_to_f32();

    let t5_config: t5::Config = serde_json::from_str(
        &std::fs::read_to_string(&files.t5_config).context("failed to read T5 config")?,
    )
    .context("failed to parse T5 config")?;
    let t5_model = T5EncoderModel::load(mmap(&files.t5_model, dtype, &device, "T5")?, &t5_config)
        .context("failed to load T5 model")?;
    let t5_tokenizer = Tokenizer::from_file(&files.t5_tokenizer)
        .map_err(Error::msg)
        .context("failed to load T5 tokenizer")?;

    let clip_config = ClipTextConfig {
        vocab_size: 49408,
        projection_dim: 768,
        activation: Activation::QuickGelu,
        intermediate_size: 3072,
        embed_dim: 768,
        max_position_embeddings: CLIP_MAX_TOKENS,
        pad_with: None,
        num_hidden_layers: 12,
        num_attention_heads: 12,
    };
    let clip_model = ClipTextTransformer::new(
        mmap(&files.clip_model, dtype, &device, "CLIP")?.pp("text_model"),
        &clip_config,
    )
    .context("failed to load CLIP model")?;
    let clip_tokenizer = Tokenizer::from_file(&files.clip_tokenizer)
        .map_err(Error::msg)
        .context("failed to load CLIP tokenizer")?;

    let autoencoder = autoencoder::AutoEncoder::new(
        &autoencoder::Config::schnell(),
        mmap(&files.autoencoder, dtype, &device, "autoencoder")?,
    )
    .context("failed to load autoencoder")?;

    let flux_model = model::Flux::new(
        &model::Config::schnell(),
        mmap(&files.flux_model, dtype, &device, "flux")?,
    )
    .context("failed to load flux model")?;

    Ok(FluxModel {
        device,
        dtype,
        t5_model: Mutex::new(t5_model),
        t5_tokenizer,
        clip_model,
        clip_tokenizer,
        autoencoder,
        flux_model,
    })
}

pub struct FluxLoader;

impl Loader for FluxLoader {
    type Model = FluxModel;

    async fn load(self, api: Api, device_map: DeviceMap) -> Result<Self::Model> {
        let device = select_best_device(device_map).context("failed to set up device")?;
        let files = FluxFiles::fetch(&api).await?;
        info!(repo = FLUX_REPO, "Fetched flux weights");
        build_blocking("flux", move || build(files, device)).await
    }
}
