//! Iterative masked refinement around an [`InpaintModel`].
//!
//! Images are processed at a fixed `IMAGE_SIZE` square. Every round feeds the
//! previous composite back in as the new ground truth, and known pixels are
//! copied through untouched, so the network can only ever change the hole.

use super::generator::InpaintModel;
use candle_core::{DType, Device, Tensor};
use image::{
    imageops::FilterType, DynamicImage, GrayImage, ImageBuffer, ImageFormat, Luma, Pixel, RgbImage,
};
use std::io::Cursor;
use thiserror::Error;

pub const IMAGE_SIZE: u32 = 256;
pub const MIN_ITERATIONS: u32 = 1;
pub const MAX_ITERATIONS: u32 = 5;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("failed to decode {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: image::ImageError,
    },

    #[error("tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("unexpected tensor shape: {0}")]
    Shape(String),

    #[error("failed to encode result image: {0}")]
    Encode(#[source] image::ImageError),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("iterations must be a number, got '{0}'")]
pub struct InvalidIterations(pub String);

/// Refinement round count, always within `MIN_ITERATIONS..=MAX_ITERATIONS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iterations(u32);

impl Iterations {
    pub fn clamped(requested: i64) -> Self {
        Self(requested.clamp(MIN_ITERATIONS as i64, MAX_ITERATIONS as i64) as u32)
    }

    /// Accepts integers and decimals (truncated toward zero). Blank input
    /// means the default of one round.
    pub fn parse(raw: &str) -> Result<Self, InvalidIterations> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(Self::default());
        }
        if let Ok(value) = trimmed.parse::<i64>() {
            return Ok(Self::clamped(value));
        }
        match trimmed.parse::<f64>() {
            Ok(value) if value.is_finite() => Ok(Self::clamped(value.trunc() as i64)),
            _ => Err(InvalidIterations(raw.to_string())),
        }
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl Default for Iterations {
    fn default() -> Self {
        Self(MIN_ITERATIONS)
    }
}

/// The mask in both shapes the loop needs. `single` (`[1, S, S]`) is the
/// fourth network input channel and the compositing weight; `broadcast`
/// (`[3, S, S]`) zeroes hole pixels of the RGB image. 1 = known, 0 = hole.
#[derive(Debug, Clone)]
pub struct PreparedMask {
    pub single: Tensor,
    pub broadcast: Tensor,
}

#[derive(Debug, Clone)]
pub struct InpaintOutput {
    pub image: RgbImage,
    pub png: Vec<u8>,
    pub iterations: Iterations,
}

pub fn decode_image(bytes: &[u8], what: &'static str) -> Result<DynamicImage, InferenceError> {
    image::load_from_memory(bytes).map_err(|source| InferenceError::Decode { what, source })
}

fn fit<P>(image: ImageBuffer<P, Vec<u8>>) -> ImageBuffer<P, Vec<u8>>
where
    P: Pixel<Subpixel = u8> + 'static,
{
    if image.dimensions() == (IMAGE_SIZE, IMAGE_SIZE) {
        image
    } else {
        image::imageops::resize(&image, IMAGE_SIZE, IMAGE_SIZE, FilterType::Triangle)
    }
}

/// `[C, H, W]` f32 in `[0, 1]` from interleaved 8-bit samples.
fn to_unit_tensor(
    samples: Vec<u8>,
    channels: usize,
    device: &Device,
) -> Result<Tensor, InferenceError> {
    let side = IMAGE_SIZE as usize;
    let tensor = Tensor::from_vec(samples, (side, side, channels), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?;
    Ok((tensor / 255.0)?.to_device(device)?)
}

/// RGB image as a `[3, S, S]` tensor in `[0, 1]`.
pub fn prepare_image(image: &DynamicImage, device: &Device) -> Result<Tensor, InferenceError> {
    let rgb = fit(image.to_rgb8());
    to_unit_tensor(rgb.into_raw(), 3, device)
}

/// ITU-R 601 luma in 16-bit fixed point, rounded. The weights sum to 2^16 so
/// white stays 255.
fn mask_luma(mask: &DynamicImage) -> GrayImage {
    if !mask.color().has_color() {
        return mask.to_luma8();
    }
    let rgb = mask.to_rgb8();
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        let weighted = r as u32 * 19_595 + g as u32 * 38_470 + b as u32 * 7_471 + 0x8000;
        Luma([(weighted >> 16) as u8])
    })
}

/// Converts any mask to luminance and inverts it: uploads mark the region to
/// remove in white, the network wants 1 for known pixels.
pub fn prepare_mask(mask: &DynamicImage, device: &Device) -> Result<PreparedMask, InferenceError> {
    let luma = fit(mask_luma(mask));
    let removal = to_unit_tensor(luma.into_raw(), 1, device)?;
    let single = removal.affine(-1.0, 1.0)?;
    let broadcast = single.repeat((3, 1, 1))?;
    Ok(PreparedMask { single, broadcast })
}

/// Runs `iterations` refinement rounds and returns the final `[3, S, S]`
/// composite in `[0, 1]`.
pub fn run(
    model: &dyn InpaintModel,
    image: &Tensor,
    mask: &PreparedMask,
    iterations: Iterations,
) -> Result<Tensor, InferenceError> {
    let hole = mask.single.affine(-1.0, 1.0)?;
    let mut current = image.clone();

    for round in 1..=iterations.get() {
        let masked = current.mul(&mask.broadcast)?;

        let ground_truth = current.affine(2.0, -1.0)?;
        let masked = masked.affine(2.0, -1.0)?;

        let input = Tensor::cat(&[&masked, &mask.single], 0)?.unsqueeze(0)?;
        let prediction = model.predict(&input)?.squeeze(0)?;
        if prediction.dims() != ground_truth.dims() {
            return Err(InferenceError::Shape(format!(
                "model returned {:?}, expected {:?}",
                prediction.dims(),
                ground_truth.dims()
            )));
        }

        let known = mask.single.broadcast_mul(&ground_truth)?;
        let generated = hole.broadcast_mul(&prediction)?;
        let composite = (known + generated)?;

        current = composite.affine(0.5, 0.5)?.clamp(0f32, 1f32)?;
        tracing::debug!(round, total = iterations.get(), "Refinement round complete");
    }

    Ok(current)
}

/// `[3, H, W]` tensor in `[0, 1]` to an 8-bit RGB image. Rounds to nearest
/// so pass-through pixels survive the scale round trip unchanged.
pub fn tensor_to_image(tensor: &Tensor) -> Result<RgbImage, InferenceError> {
    let (channels, height, width) = tensor.dims3()?;
    if channels != 3 {
        return Err(InferenceError::Shape(format!(
            "expected 3 channels, got {channels}"
        )));
    }

    let samples = tensor
        .to_device(&Device::Cpu)?
        .clamp(0f32, 1f32)?
        .affine(255.0, 0.0)?
        .round()?
        .to_dtype(DType::U8)?
        .permute((1, 2, 0))?
        .contiguous()?
        .flatten_all()?
        .to_vec1::<u8>()?;

    RgbImage::from_raw(width as u32, height as u32, samples)
        .ok_or_else(|| InferenceError::Shape(format!("buffer does not fit {width}x{height}")))
}

pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>, InferenceError> {
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, ImageFormat::Png)
        .map_err(InferenceError::Encode)?;
    Ok(buffer.into_inner())
}

/// Decode, refine and encode in one go. Blocking; call from a worker thread.
pub fn inpaint(
    model: &dyn InpaintModel,
    image_bytes: &[u8],
    mask_bytes: &[u8],
    iterations: Iterations,
) -> Result<InpaintOutput, InferenceError> {
    let image = decode_image(image_bytes, "image")?;
    let mask = decode_image(mask_bytes, "mask")?;

    let device = model.device();
    let image = prepare_image(&image, device)?;
    let mask = prepare_mask(&mask, device)?;

    let completed = run(model, &image, &mask, iterations)?;
    let image = tensor_to_image(&completed)?;
    let png = encode_png(&image)?;

    Ok(InpaintOutput {
        image,
        png,
        iterations,
    })
}
