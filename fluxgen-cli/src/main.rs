use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use fluxgen_core::{
    generate_image, load_pipeline, select_best_device, DeviceMap, GenerationRequest, ModelDType,
};
use hf_hub::api::sync::Api;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Generate images from a text prompt with FLUX")]
struct Args {
    /// Text prompt describing the image to generate
    prompt: String,

    /// Output file path; the image format follows the extension
    #[arg(short, long, default_value = "output.png")]
    output: PathBuf,

    /// Model ID on the Hugging Face hub
    #[arg(short, long, default_value = "black-forest-labs/FLUX.1-schnell")]
    model: String,

    /// Image width in pixels
    #[arg(long, default_value_t = 512)]
    width: usize,

    /// Image height in pixels
    #[arg(long, default_value_t = 512)]
    height: usize,

    /// Number of denoising steps (4 is enough for schnell)
    #[arg(long, default_value_t = 4)]
    steps: usize,

    /// Guidance scale (0.0 for schnell, around 3.5 for dev)
    #[arg(long, default_value_t = 0.0)]
    guidance: f64,

    /// Random seed for reproducibility; negative values wrap around
    #[arg(long, allow_negative_numbers = true)]
    seed: Option<i64>,

    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Precision to load the weights in: f16, bf16 or f32
    #[arg(long, default_value_t = ModelDType::F16)]
    dtype: ModelDType,
}

impl Args {
    fn request(&self) -> GenerationRequest {
        GenerationRequest {
            prompt: self.prompt.clone(),
            width: self.width,
            height: self.height,
            steps: self.steps,
            guidance: self.guidance,
            seed: self.seed.map(|seed| seed as u64),
        }
    }

    fn device_map(&self) -> DeviceMap {
        if self.cpu {
            DeviceMap::ForceCpu
        } else {
            DeviceMap::default()
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let request = args.request();
    request.validate()?;

    let device = select_best_device(args.device_map());
    let mut pipeline = load_pipeline(&args.model, &Api::new()?, &device, args.dtype)?;

    generate_image(pipeline.as_mut(), &request, &args.output)?;

    println!("Image saved to: {}", args.output.display());
    println!("Done!");

    Ok(())
}
