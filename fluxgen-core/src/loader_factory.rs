use anyhow::{anyhow, Result};
use hf_hub::api::sync::Api;
use tracing::{info, warn};

use crate::{
    flux, DiffusionPipeline, FluxLoader, Loader, ModelDType, PipelineFeatures, SelectedDevice,
};

/// Enum of supported model types
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModelType {
    Flux,
}

impl ModelType {
    /// Detect model type from model name
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("FLUX") {
            Some(ModelType::Flux)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModelVariant {
    Flux(flux::FluxVariant),
}

impl ModelVariant {
    /// Detect model variant from model name
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("FLUX") {
            Some(ModelVariant::Flux(if name_upper.contains("SCHNELL") {
                flux::FluxVariant::Schnell
            } else if name_upper.contains("DEV") {
                flux::FluxVariant::Dev
            } else {
                flux::FluxVariant::Schnell // Default to Schnell if no specific variant is found
            }))
        } else {
            None
        }
    }
}

/// Turns on every memory-saving feature the pipeline supports and returns the
/// features that were enabled.
pub fn enable_memory_savings(pipeline: &mut dyn DiffusionPipeline) -> PipelineFeatures {
    let supported = pipeline.features();

    if supported.attention_slicing {
        pipeline.enable_attention_slicing();
    } else {
        warn!("Attention slicing is not supported by this pipeline, skipping");
    }

    if supported.vae_slicing {
        pipeline.enable_vae_slicing();
    } else {
        warn!("VAE slicing is not supported by this pipeline, skipping");
    }

    supported
}

/// Load a pipeline based on its name, automatically detecting the appropriate loader
pub fn load_pipeline(
    model_name: &str,
    api: &Api,
    device: &SelectedDevice,
    dtype: ModelDType,
) -> Result<Box<dyn DiffusionPipeline>> {
    // Get model type and variant or return error if unsupported
    let model_type = ModelType::from_name(model_name)
        .ok_or_else(|| anyhow!("Unsupported model type: {}", model_name))?;
    let model_variant = ModelVariant::from_name(model_name)
        .ok_or_else(|| anyhow!("Unsupported model variant: {}", model_name))?;

    info!(
        "Loading model: {} (detected type: {:?}/variant: {:?}, dtype: {})",
        model_name, model_type, model_variant, dtype
    );
    info!("This may take a while on first run (downloading model)...");

    let mut pipeline: Box<dyn DiffusionPipeline> = match model_type {
        ModelType::Flux => Box::new(FluxLoader::load(
            model_variant,
            model_name,
            api,
            device,
            dtype,
        )?),
    };

    let enabled = enable_memory_savings(pipeline.as_mut());
    info!(
        "Model loaded successfully on {} (attention slicing: {}, vae slicing: {})",
        device.backend, enabled.attention_slicing, enabled.vae_slicing
    );

    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FluxVariant, GenerationRequest};
    use image::DynamicImage;
    use rand_chacha::ChaCha8Rng;

    #[derive(Default)]
    struct Recorder {
        features: PipelineFeatures,
        attention: bool,
        vae: bool,
    }

    impl DiffusionPipeline for Recorder {
        fn features(&self) -> PipelineFeatures {
            self.features
        }

        fn enable_attention_slicing(&mut self) {
            self.attention = true;
        }

        fn enable_vae_slicing(&mut self) {
            self.vae = true;
        }

        fn run(
            &mut self,
            _request: &GenerationRequest,
            _rng: &mut ChaCha8Rng,
        ) -> anyhow::Result<Vec<DynamicImage>> {
            Ok(vec![])
        }
    }

    #[test]
    fn detects_flux_variants() {
        assert_eq!(
            ModelVariant::from_name("black-forest-labs/FLUX.1-schnell"),
            Some(ModelVariant::Flux(FluxVariant::Schnell))
        );
        assert_eq!(
            ModelVariant::from_name("black-forest-labs/FLUX.1-dev"),
            Some(ModelVariant::Flux(FluxVariant::Dev))
        );
        assert_eq!(
            ModelVariant::from_name("someone/flux-finetune"),
            Some(ModelVariant::Flux(FluxVariant::Schnell))
        );
        assert_eq!(ModelType::from_name("black-forest-labs/FLUX.1-schnell"), Some(ModelType::Flux));
    }

    #[test]
    fn rejects_unknown_families() {
        assert_eq!(ModelType::from_name("stabilityai/stable-diffusion-2-1"), None);
        assert_eq!(ModelVariant::from_name("openai/clip-vit-large-patch14"), None);
    }

    #[test]
    fn enables_only_supported_features() {
        let mut pipeline = Recorder {
            features: PipelineFeatures {
                attention_slicing: false,
                vae_slicing: true,
            },
            ..Default::default()
        };
        let enabled = enable_memory_savings(&mut pipeline);
        assert!(!pipeline.attention);
        assert!(pipeline.vae);
        assert_eq!(enabled, pipeline.features);
    }

    #[test]
    fn enables_both_when_supported() {
        let mut pipeline = Recorder {
            features: PipelineFeatures {
                attention_slicing: true,
                vae_slicing: true,
            },
            ..Default::default()
        };
        enable_memory_savings(&mut pipeline);
        assert!(pipeline.attention && pipeline.vae);
    }
}
