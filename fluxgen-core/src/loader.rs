use anyhow::Result;
use hf_hub::api::sync::Api;

use crate::{DiffusionPipeline, ModelDType, ModelVariant, SelectedDevice};

pub trait Loader {
    type Model: DiffusionPipeline;

    /// Fetches (or reuses cached) weights for `model_id` and instantiates them
    /// on `device` in `dtype`.
    fn load(
        variant: ModelVariant,
        model_id: &str,
        api: &Api,
        device: &SelectedDevice,
        dtype: ModelDType,
    ) -> Result<Self::Model>
    where
        Self: Sized;
}
