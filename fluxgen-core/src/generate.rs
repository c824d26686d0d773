use std::{path::Path, time::Instant};

use anyhow::{anyhow, Context, Result};
use image::DynamicImage;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::info;

use crate::{DiffusionPipeline, GenerationRequest};

/// Seeded requests are reproducible; unseeded ones draw from OS entropy.
pub fn noise_source(seed: Option<u64>) -> ChaCha8Rng {
    match seed {
        Some(seed) => {
            info!("Using seed: {seed}");
            ChaCha8Rng::seed_from_u64(seed)
        }
        None => ChaCha8Rng::from_entropy(),
    }
}

/// Runs `f` with no gradient bookkeeping. Candle only records gradients for
/// `Var`s, which are never created here. On Metal the call is additionally
/// wrapped in an autorelease pool so command buffers are freed per call.
fn inference_scope<T>(f: impl FnOnce() -> T) -> T {
    #[cfg(feature = "metal")]
    let out = objc::rc::autoreleasepool(f);
    #[cfg(not(feature = "metal"))]
    let out = f();
    out
}

/// Generate one image for `request` and write it to `output`.
///
/// The format is inferred from the extension of `output`. The in-memory image
/// is returned as well.
pub fn generate_image(
    pipeline: &mut dyn DiffusionPipeline,
    request: &GenerationRequest,
    output: &Path,
) -> Result<DynamicImage> {
    request.validate()?;

    info!("Generating image for prompt: '{}'", request.prompt);
    info!(
        "Size: {}x{}, Steps: {}, Guidance: {}",
        request.width, request.height, request.steps, request.guidance
    );

    let mut rng = noise_source(request.seed);

    let start = Instant::now();
    let images = inference_scope(|| pipeline.run(request, &mut rng))?;
    info!(
        "Image generation took: {:.2}s",
        start.elapsed().as_secs_f32()
    );

    let image = images
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("pipeline returned no images"))?;
    image
        .save(output)
        .with_context(|| format!("failed to save image to {}", output.display()))?;

    Ok(image)
}
