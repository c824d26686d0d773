#[cfg(feature = "accelerate")]
extern crate accelerate_src;

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod device_map;
pub mod dtype;
mod generate;
pub mod loader;
mod loader_factory;
pub mod request;
mod util;

mod flux;

pub use device_map::*;
pub use dtype::ModelDType;
pub use flux::{FluxLoader, FluxPipeline, FluxVariant};
pub use generate::*;
pub use loader::*;
pub use loader_factory::*;
pub use request::{GenerationRequest, RequestError};
pub use util::{latent_noise, select_best_device, tensor_to_image};
pub(crate) use util::progress_bar;

use image::DynamicImage;
use rand_chacha::ChaCha8Rng;

/// Memory-saving features a pipeline can honour.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineFeatures {
    pub attention_slicing: bool,
    pub vae_slicing: bool,
}

pub trait DiffusionPipeline {
    fn features(&self) -> PipelineFeatures;

    /// Only called when `features().attention_slicing` is set.
    fn enable_attention_slicing(&mut self) {}

    /// Only called when `features().vae_slicing` is set.
    fn enable_vae_slicing(&mut self) {}

    /// Samples images for `request`, drawing the initial noise from `rng`.
    fn run(
        &mut self,
        request: &GenerationRequest,
        rng: &mut ChaCha8Rng,
    ) -> anyhow::Result<Vec<DynamicImage>>;
}
