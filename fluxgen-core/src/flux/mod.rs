use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::Module;
use candle_transformers::models::{
    clip::text_model::{Activation, ClipTextConfig, ClipTextTransformer},
    flux::{autoencoder, autoencoder::AutoEncoder, model, model::Flux, sampling, WithForward},
    t5::{self, T5EncoderModel},
};
use hf_hub::api::sync::Api;
use image::DynamicImage;
use rand_chacha::ChaCha8Rng;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::{
    latent_noise, progress_bar, tensor_to_image, DiffusionPipeline, GenerationRequest, Loader,
    ModelDType, ModelVariant, PipelineFeatures, SelectedDevice,
};

/// Width and height must be multiples of this: the autoencoder downsamples by
/// 8 and latents are packed in 2x2 patches.
pub const LATENT_ALIGNMENT: usize = 16;
const LATENT_CHANNELS: usize = 16;
const T5_MAX_TOKENS: usize = 256;
const CLIP_MAX_TOKENS: usize = 77;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluxVariant {
    Schnell,
    Dev,
}

impl FluxVariant {
    fn transformer_file(&self) -> &'static str {
        match self {
            Self::Schnell => "flux1-schnell.safetensors",
            Self::Dev => "flux1-dev.safetensors",
        }
    }

    fn model_config(&self) -> model::Config {
        match self {
            Self::Schnell => model::Config::schnell(),
            Self::Dev => model::Config::dev(),
        }
    }

    fn autoencoder_config(&self) -> autoencoder::Config {
        match self {
            Self::Schnell => autoencoder::Config::schnell(),
            Self::Dev => autoencoder::Config::dev(),
        }
    }

    /// Dev shifts the schedule towards high noise levels for larger images.
    fn schedule(&self, steps: usize, image_seq_len: usize) -> Vec<f64> {
        match self {
            Self::Schnell => sampling::get_schedule(steps, None),
            Self::Dev => sampling::get_schedule(steps, Some((image_seq_len, 0.5, 1.15))),
        }
    }
}

/// T5-v1.1-XXL overflows in f16, so the encoder is kept in bf16 on
/// accelerators and f32 on the CPU when half precision is requested.
fn t5_dtype(requested: DType, device: &Device) -> DType {
    match requested {
        DType::F16 if device.is_cpu() => DType::F32,
        DType::F16 => DType::BF16,
        other => other,
    }
}

/// Shape of the initial latent noise for `request`, rejecting sizes the
/// latent packing cannot represent.
fn latent_shape(request: &GenerationRequest) -> Result<(usize, usize, usize, usize)> {
    request.check_alignment(LATENT_ALIGNMENT)?;
    Ok((1, LATENT_CHANNELS, request.height / 8, request.width / 8))
}

/// Decodes `latents`, one sample at a time when `slicing` is set.
fn decode_latents(autoencoder: &AutoEncoder, latents: &Tensor, slicing: bool) -> Result<Tensor> {
    if !slicing {
        return Ok(autoencoder.decode(latents)?);
    }
    let decoded = latents
        .chunk(latents.dim(0)?, 0)?
        .iter()
        .map(|latent| autoencoder.decode(latent))
        .collect::<candle_core::Result<Vec<_>>>()?;
    Ok(Tensor::cat(&decoded, 0)?)
}

pub struct FluxPipeline {
    variant: FluxVariant,
    device: Device,
    dtype: DType,
    t5_model: T5EncoderModel,
    t5_tokenizer: Tokenizer,
    clip_model: ClipTextTransformer,
    clip_tokenizer: Tokenizer,
    autoencoder: AutoEncoder,
    flux_model: Flux,
    vae_slicing: bool,
}

impl FluxPipeline {
    fn encode_t5(&mut self, prompt: &str) -> Result<Tensor> {
        let mut t5_tokens = self
            .t5_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        t5_tokens.resize(T5_MAX_TOKENS, 0);
        let input_token_ids = Tensor::new(&*t5_tokens, &self.device)?.unsqueeze(0)?;
        Ok(self.t5_model.forward(&input_token_ids)?.to_dtype(self.dtype)?)
    }

    fn encode_clip(&self, prompt: &str) -> Result<Tensor> {
        let mut clip_tokens = self
            .clip_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        clip_tokens.truncate(CLIP_MAX_TOKENS);
        let input_token_ids = Tensor::new(&*clip_tokens, &self.device)?.unsqueeze(0)?;
        Ok(self.clip_model.forward(&input_token_ids)?)
    }

    /// Euler integration of the rectified flow over `timesteps`.
    fn denoise(&self, state: &sampling::State, timesteps: &[f64], guidance: f64) -> Result<Tensor> {
        let b_sz = state.img.dim(0)?;
        let dev = state.img.device();
        let guidance = Tensor::full(guidance as f32, b_sz, dev)?;
        let mut img = state.img.clone();

        let bar = progress_bar(timesteps.len().saturating_sub(1), "Denoising");
        for window in timesteps.windows(2) {
            let (t_curr, t_prev) = match window {
                [a, b] => (*a, *b),
                _ => continue,
            };
            let t_vec = Tensor::full(t_curr as f32, b_sz, dev)?;
            let pred = self.flux_model.forward(
                &img,
                &state.img_ids,
                &state.txt,
                &state.txt_ids,
                &t_vec,
                &state.vec,
                Some(&guidance),
            )?;
            img = (img + pred * (t_prev - t_curr))?;
            bar.inc(1);
        }
        bar.finish_and_clear();

        Ok(img)
    }

}

impl DiffusionPipeline for FluxPipeline {
    fn features(&self) -> PipelineFeatures {
        // The candle transformer fuses attention inside its blocks.
        PipelineFeatures {
            attention_slicing: false,
            vae_slicing: true,
        }
    }

    fn enable_vae_slicing(&mut self) {
        self.vae_slicing = true;
    }

    fn run(
        &mut self,
        request: &GenerationRequest,
        rng: &mut ChaCha8Rng,
    ) -> Result<Vec<DynamicImage>> {
        let shape = latent_shape(request)?;
        let (width, height) = (request.width, request.height);

        let t5_emb = self.encode_t5(&request.prompt)?;
        let clip_emb = self.encode_clip(&request.prompt)?;
        debug!(t5 = ?t5_emb.shape(), clip = ?clip_emb.shape(), "Encoded prompt");

        let noise = latent_noise(rng, shape, &self.device, self.dtype)?;
        let state = sampling::State::new(&t5_emb, &clip_emb, &noise)?;
        let timesteps = self.variant.schedule(request.steps, state.img.dim(1)?);
        debug!(?timesteps, "Sampling schedule");

        let latent_img = self.denoise(&state, &timesteps, request.guidance)?;
        let unpacked = sampling::unpack(&latent_img, height, width)?;
        info!("Generated latent image");

        let decoded = decode_latents(&self.autoencoder, &unpacked, self.vae_slicing)?;
        info!("Decoded image");

        let img = ((decoded.to_dtype(DType::F32)?.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?
            .to_dtype(DType::U8)?;
        (0..img.dim(0)?)
            .map(|i| tensor_to_image(&img.i(i)?))
            .collect()
    }
}

pub struct FluxLoader;

impl Loader for FluxLoader {
    type Model = FluxPipeline;

    fn load(
        variant: ModelVariant,
        model_id: &str,
        api: &Api,
        device: &SelectedDevice,
        dtype: ModelDType,
    ) -> Result<Self::Model> {
        let ModelVariant::Flux(variant) = variant;
        let device = device.device.clone();
        let dtype = dtype.as_dtype();

        // --- Load T5 Model and Tokenizer ---
        let t5_repo = api.repo(hf_hub::Repo::with_revision(
            "google/t5-v1_1-xxl".to_string(),
            hf_hub::RepoType::Model,
            "refs/pr/2".to_string(),
        ));
        let t5_model_file = t5_repo
            .get("model.safetensors")
            .context("failed to load T5 model file")?;
        let t5_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(
                &[t5_model_file],
                t5_dtype(dtype, &device),
                &device,
            )
                .context("failed to build T5 var builder")?
        };
        let config_filename = t5_repo
            .get("config.json")
            .context("failed to get T5 config")?;
        let config_str =
            std::fs::read_to_string(&config_filename).context("failed to read T5 config")?;
        let t5_config: t5::Config =
            serde_json::from_str(&config_str).context("failed to parse T5 config")?;
        let t5_model =
            T5EncoderModel::load(t5_vb, &t5_config).context("failed to load T5 model")?;
        let t5_tokenizer_filename = api
            .model("lmz/mt5-tokenizers".to_string())
            .get("t5-v1_1-xxl.tokenizer.json")
            .context("failed to get T5 tokenizer")?;
        let t5_tokenizer = Tokenizer::from_file(t5_tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load T5 tokenizer")?;
        info!("Loaded T5 text encoder");

        // --- Load CLIP Model and Tokenizer ---
        let clip_repo = api.repo(hf_hub::Repo::model(
            "openai/clip-vit-large-patch14".to_string(),
        ));
        let clip_model_file = clip_repo
            .get("model.safetensors")
            .context("failed to get CLIP model file")?;
        let clip_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[clip_model_file], dtype, &device)
                .context("failed to build CLIP var builder")?
        };
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
        let clip_model = ClipTextTransformer::new(clip_vb.pp("text_model"), &clip_config)
            .context("failed to load CLIP model")?;
        let clip_tokenizer_filename = clip_repo
            .get("tokenizer.json")
            .context("failed to get CLIP tokenizer")?;
        let clip_tokenizer = Tokenizer::from_file(clip_tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;
        info!("Loaded CLIP text encoder");

        // --- Load Autoencoder ---
        let bf_repo = api.repo(hf_hub::Repo::model(model_id.to_string()));
        let autoencoder_model_file = bf_repo
            .get("ae.safetensors")
            .with_context(|| format!("failed to get autoencoder model file from {model_id}"))?;
        let autoencoder_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(
                &[autoencoder_model_file],
                dtype,
                &device,
            )
            .context("failed to build autoencoder var builder")?
        };
        let autoencoder = AutoEncoder::new(&variant.autoencoder_config(), autoencoder_vb)
            .context("failed to load autoencoder")?;
        info!("Loaded autoencoder");

        // --- Load Flux Model (non-quantized) ---
        let flux_model_file = bf_repo
            .get(variant.transformer_file())
            .with_context(|| {
                format!(
                    "failed to get flux model file {} from {model_id}",
                    variant.transformer_file()
                )
            })?;
        let flux_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[flux_model_file], dtype, &device)
                .context("failed to build flux var builder")?
        };
        let flux_model =
            Flux::new(&variant.model_config(), flux_vb).context("failed to load flux model")?;
        info!("Loaded FLUX transformer");

        Ok(FluxPipeline {
            variant,
            device,
            dtype,
            t5_model,
            t5_tokenizer,
            clip_model,
            clip_tokenizer,
            autoencoder,
            flux_model,
            vae_slicing: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_files_and_configs() {
        assert_eq!(FluxVariant::Schnell.transformer_file(), "flux1-schnell.safetensors");
        assert_eq!(FluxVariant::Dev.transformer_file(), "flux1-dev.safetensors");
        assert!(!FluxVariant::Schnell.model_config().guidance_embed);
        assert!(FluxVariant::Dev.model_config().guidance_embed);
    }

    #[test]
    fn t5_avoids_f16() {
        assert_eq!(t5_dtype(DType::F16, &Device::Cpu), DType::F32);
        assert_eq!(t5_dtype(DType::BF16, &Device::Cpu), DType::BF16);
        assert_eq!(t5_dtype(DType::F32, &Device::Cpu), DType::F32);
    }

    #[test]
    fn latent_shape_requires_alignment() {
        let mut request = GenerationRequest::new("cat");
        assert_eq!(latent_shape(&request).unwrap(), (1, LATENT_CHANNELS, 64, 64));

        request.width = 1024;
        request.height = 768;
        assert_eq!(latent_shape(&request).unwrap(), (1, LATENT_CHANNELS, 96, 128));

        request.width = 500;
        let err = latent_shape(&request).unwrap_err();
        assert!(err.to_string().contains("not a multiple of 16"));
    }

    fn tiny_autoencoder() -> AutoEncoder {
        let config = autoencoder::Config {
            resolution: 16,
            in_channels: 3,
            ch: 32,
            out_ch: 3,
            ch_mult: vec![1, 1],
            num_res_blocks: 1,
            z_channels: 4,
            scale_factor: 1.0,
            shift_factor: 0.0,
        };
        let vb = candle_nn::VarBuilder::zeros(DType::F32, &Device::Cpu);
        AutoEncoder::new(&config, vb).unwrap()
    }

    #[test]
    fn sliced_decode_matches_batched_decode() {
        let autoencoder = tiny_autoencoder();
        let latents = Tensor::ones((2, 4, 4, 4), DType::F32, &Device::Cpu).unwrap();

        let batched = decode_latents(&autoencoder, &latents, false).unwrap();
        let sliced = decode_latents(&autoencoder, &latents, true).unwrap();

        // One upsampling stage per extra `ch_mult` level.
        assert_eq!(batched.dims4().unwrap(), (2, 3, 8, 8));
        assert_eq!(sliced.dims4().unwrap(), batched.dims4().unwrap());
        assert_eq!(
            sliced.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            batched.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn schedule_spans_steps() {
        for variant in [FluxVariant::Schnell, FluxVariant::Dev] {
            let timesteps = variant.schedule(4, 1024);
            assert_eq!(timesteps.len(), 5);
            assert_eq!(timesteps[0], 1.0);
            assert_eq!(timesteps[4], 0.0);
            assert!(timesteps.windows(2).all(|w| w[0] > w[1]));
        }
    }

    #[test]
    fn packed_latents_round_trip_through_unpack() {
        // 512x512 → 64x64 latents → 32*32 packed tokens.
        let noise = Tensor::zeros((1, LATENT_CHANNELS, 64, 64), DType::F32, &Device::Cpu).unwrap();
        let t5 = Tensor::zeros((1, T5_MAX_TOKENS, 8), DType::F32, &Device::Cpu).unwrap();
        let clip = Tensor::zeros((1, 8), DType::F32, &Device::Cpu).unwrap();
        let state = sampling::State::new(&t5, &clip, &noise).unwrap();
        assert_eq!(state.img.dims3().unwrap(), (1, 32 * 32, LATENT_CHANNELS * 4));
        let unpacked = sampling::unpack(&state.img, 512, 512).unwrap();
        assert_eq!(unpacked.dims4().unwrap(), (1, LATENT_CHANNELS, 64, 64));
    }
}
