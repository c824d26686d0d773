use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Tensor};
use image::DynamicImage;
use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use tracing::{info, warn};

use crate::{Backend, DeviceMap, SelectedDevice};

/// Picks Metal, then CUDA, then the CPU. Never fails: an accelerator that
/// cannot be opened is reported and skipped.
pub fn select_best_device(device_map: DeviceMap) -> SelectedDevice {
    let ordinal = match device_map {
        DeviceMap::ForceCpu => {
            info!("Using CPU backend (forced)");
            return SelectedDevice::cpu();
        }
        DeviceMap::Ordinal(ordinal) => ordinal,
    };

    if metal_is_available() {
        match Device::new_metal(ordinal) {
            Ok(device) => {
                info!("Using Metal backend");
                return SelectedDevice {
                    backend: Backend::Metal,
                    device,
                };
            }
            Err(e) => warn!("Metal is available but device {ordinal} could not be opened: {e}"),
        }
    }

    if cuda_is_available() {
        match Device::new_cuda(ordinal) {
            Ok(device) => {
                info!("Using CUDA backend");
                return SelectedDevice {
                    backend: Backend::Cuda,
                    device,
                };
            }
            Err(e) => warn!("CUDA is available but device {ordinal} could not be opened: {e}"),
        }
    }

    #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
    {
        warn!("No GPU acceleration available, using CPU (this will be slow). Build with `--features metal` to run on the GPU");
    }
    #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
    {
        warn!("No GPU acceleration available, using CPU (this will be slow). Build with `--features cuda` to run on the GPU");
    }

    SelectedDevice::cpu()
}

/// Draws standard normal noise on the host and moves it to `device`.
///
/// Sampling on the host keeps a seeded run identical across backends.
pub fn latent_noise<R: Rng + ?Sized>(
    rng: &mut R,
    shape: (usize, usize, usize, usize),
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let (b, c, h, w) = shape;
    let data: Vec<f32> = (0..b * c * h * w)
        .map(|_| StandardNormal.sample(&mut *rng))
        .collect();
    let noise = Tensor::from_vec(data, shape, &Device::Cpu)?
        .to_device(device)?
        .to_dtype(dtype)?;
    Ok(noise)
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

pub(crate) fn progress_bar(len: usize, message: &'static str) -> ProgressBar {
    let bar = ProgressBar::new(len as u64);
    if let Ok(style) =
        ProgressStyle::with_template("{msg}: [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
    {
        bar.set_style(style.progress_chars("#>-"));
    }
    bar.set_message(message);
    bar
}
