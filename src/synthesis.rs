//! Physically-inspired compositing of a transmission and a reflection image.
//!
//! The reflection is blurred in linear light, attenuated where the blend would
//! over-expose, and faded by a randomly cropped vignette before it is added to
//! the transmission.

use crate::{common::*, params};

lazy_static::lazy_static! {
    static ref VIGNETTE_MASK: Array2<f32> = vignette_kernel(params::VIGNETTE_SIZE, params::VIGNETTE_NSIG);
    static ref SIGMA_TABLE: Vec<f64> = linspace(params::SIGMA_MIN, params::SIGMA_MAX, params::SIGMA_STEPS);
}

/// The fixed vignette mask, built on first use.
pub fn vignette_mask() -> &'static Array2<f32> {
    &VIGNETTE_MASK
}

/// Blur sigmas to draw from for synthetic samples.
pub fn sigma_table() -> &'static [f64] {
    &SIGMA_TABLE
}

/// The random draws of one synthesis call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SynthesisParams {
    /// Multiplier of the over-exposure correction, in `[1.08, 1.18)`.
    pub attenuation: f64,
    pub offset_h: usize,
    pub offset_w: usize,
    /// Scale of the transmission inside the blend, in `(0.8, 1.0]`.
    pub transmission_scale: f64,
}

impl SynthesisParams {
    pub fn sample<R>(rng: &mut R, height: usize, width: usize) -> Fallible<Self>
    where
        R: Rng,
    {
        let size = params::VIGNETTE_SIZE;
        let margin = params::VIGNETTE_MARGIN;
        ensure!(
            width + margin < size && height + margin < size,
            "image of size {}x{} does not fit in the {}x{} vignette mask",
            width,
            height,
            size,
            size
        );

        let attenuation = params::ATTENUATION_BASE + rng.gen::<f64>() / 10.0;
        let offset_w = rng.gen_range(0..(size - width - margin));
        let offset_h = rng.gen_range(0..(size - height - margin));
        let transmission_scale = 1.0 - rng.gen::<f64>() / 5.0;

        Ok(Self {
            attenuation,
            offset_h,
            offset_w,
            transmission_scale,
        })
    }
}

#[derive(Debug)]
pub struct Synthesized {
    pub transmission: Tensor,
    pub reflection: Tensor,
    pub blended: Tensor,
}

/// Draws the random parameters and composes a blended image.
///
/// Inputs are `[1, 3, H, W]` tensors in `[0, 1]` with identical shapes.
pub fn synthesize<R>(
    transmission: &Tensor,
    reflection: &Tensor,
    sigma: f64,
    rng: &mut R,
) -> Fallible<Synthesized>
where
    R: Rng,
{
    let (_b, _c, height, width) = transmission.size4()?;
    let params = SynthesisParams::sample(rng, height as usize, width as usize)?;
    compose(transmission, reflection, sigma, &params)
}

pub fn compose(
    transmission: &Tensor,
    reflection: &Tensor,
    sigma: f64,
    draw: &SynthesisParams,
) -> Fallible<Synthesized> {
    ensure!(
        transmission.size() == reflection.size(),
        "transmission {:?} and reflection {:?} differ in shape",
        transmission.size(),
        reflection.size()
    );
    let (_b, channels, height, width) = transmission.size4()?;
    ensure!(channels == 3, "expect 3 channels, but get {}", channels);

    let SynthesisParams {
        attenuation,
        offset_h,
        offset_w,
        transmission_scale,
    } = *draw;

    // linear light
    let transmission = transmission.to_kind(Kind::Float).pow_tensor_scalar(params::GAMMA);
    let reflection = reflection.to_kind(Kind::Float).pow_tensor_scalar(params::GAMMA);

    let reflection_blur = gaussian_blur(&reflection, sigma);

    // per-channel over-exposure correction
    let blend = &reflection_blur + &transmission;
    let overexposed = blend.gt(1.0).to_kind(Kind::Float);
    let overexposed_sum = (&blend * &overexposed).sum_dim_intlist(&[0, 2, 3], true, Kind::Float);
    let overexposed_count = overexposed.sum_dim_intlist(&[0, 2, 3], true, Kind::Float);
    let overexposed_mean = (overexposed_sum / (overexposed_count + 1e-6)).clamp_min(1.0);
    let reflection_blur =
        (reflection_blur - (overexposed_mean - 1.0) * attenuation).clamp(0.0, 1.0);

    // spatial falloff
    let alpha = vignette_crop(
        offset_h,
        offset_w,
        height as usize,
        width as usize,
        transmission.device(),
    )?;
    let reflection_masked = reflection_blur * alpha;
    let blended = &reflection_masked + &transmission * transmission_scale;

    let encode = |tensor: &Tensor| {
        tensor
            .clamp_min(0.0)
            .pow_tensor_scalar(1.0 / params::GAMMA)
            .clamp(0.0, 1.0)
    };

    Ok(Synthesized {
        transmission: encode(&transmission),
        reflection: encode(&reflection_masked),
        blended: encode(&blended),
    })
}

/// Odd Gaussian kernel size for a blur sigma.
pub fn kernel_size(sigma: f64) -> i64 {
    (2.0 * (2.0 * sigma).ceil() + 1.0) as i64
}

/// Separable Gaussian blur with reflect-101 borders.
pub fn gaussian_blur(image: &Tensor, sigma: f64) -> Tensor {
    let size = kernel_size(sigma);
    let radius = size / 2;
    let center = (size - 1) as f64 / 2.0;

    let weights = (0..size)
        .map(|index| {
            let x = index as f64 - center;
            (-(x * x) / (2.0 * sigma * sigma)).exp()
        })
        .collect::<Vec<_>>();
    let total: f64 = weights.iter().sum();
    let weights = weights
        .into_iter()
        .map(|weight| (weight / total) as f32)
        .collect::<Vec<_>>();

    let channels = image.size()[1];
    let kernel = Tensor::of_slice(&weights).to_device(image.device());
    let kernel_v = kernel.view([1, 1, size, 1]).repeat(&[channels, 1, 1, 1]);
    let kernel_h = kernel.view([1, 1, 1, size]).repeat(&[channels, 1, 1, 1]);

    reflect_pad(image, radius)
        .conv2d(&kernel_v, None::<Tensor>, &[1, 1], &[0, 0], &[1, 1], channels)
        .conv2d(&kernel_h, None::<Tensor>, &[1, 1], &[0, 0], &[1, 1], channels)
}

/// Reflect-101 padding by `radius` on every side, for any image size.
///
/// A single reflection may only pad by less than the side length, so wide
/// radii are reached by reflecting repeatedly. Sides of one pixel are
/// replicated.
fn reflect_pad(image: &Tensor, radius: i64) -> Tensor {
    let (mut remain_h, mut remain_w) = (radius, radius);
    let mut padded = image.shallow_clone();

    while remain_h > 0 || remain_w > 0 {
        let size = padded.size();
        let (height, width) = (size[2], size[3]);
        if height < 2 || width < 2 {
            return padded.replication_pad2d(&[remain_w, remain_w, remain_h, remain_h]);
        }

        let pad_h = remain_h.min(height - 1);
        let pad_w = remain_w.min(width - 1);
        padded = padded.reflection_pad2d(&[pad_w, pad_w, pad_h, pad_h]);
        remain_h -= pad_h;
        remain_w -= pad_w;
    }
    padded
}

fn vignette_crop(
    offset_h: usize,
    offset_w: usize,
    height: usize,
    width: usize,
    device: Device,
) -> Fallible<Tensor> {
    let mask = vignette_mask();
    let (mask_h, mask_w) = mask.dim();
    ensure!(
        offset_h + height <= mask_h && offset_w + width <= mask_w,
        "vignette crop at ({}, {}) of size {}x{} exceeds the {}x{} mask",
        offset_h,
        offset_w,
        width,
        height,
        mask_w,
        mask_h
    );

    let values = mask
        .slice(s![offset_h..(offset_h + height), offset_w..(offset_w + width)])
        .iter()
        .copied()
        .collect::<Vec<f32>>();
    let crop = Tensor::of_slice(&values)
        .view([1, 1, height as i64, width as i64])
        .to_device(device);
    Ok(crop)
}

/// 2D Gaussian-derived kernel normalised to a peak value of one.
fn vignette_kernel(size: usize, nsig: f64) -> Array2<f32> {
    let interval = (2.0 * nsig + 1.0) / size as f64;
    let grid = linspace(-nsig - interval / 2.0, nsig + interval / 2.0, size + 1);
    let cdf = Vec::<f64>::from(&ndtr(&Tensor::of_slice(&grid)));
    let kern1d = cdf.windows(2).map(|pair| pair[1] - pair[0]).collect::<Vec<_>>();

    let raw = Array2::from_shape_fn((size, size), |(row, col)| (kern1d[row] * kern1d[col]).sqrt());
    let total = raw.sum();
    let normalized = raw / total;
    let peak = normalized.fold(f64::MIN, |max, &value| max.max(value));
    normalized.mapv(|value| (value / peak) as f32)
}

/// Standard normal CDF.
fn ndtr(x: &Tensor) -> Tensor {
    ((x / 2_f64.sqrt()).erf() + 1.0) * 0.5
}

fn linspace(start: f64, end: f64, steps: usize) -> Vec<f64> {
    match steps {
        0 => vec![],
        1 => vec![start],
        _ => {
            let step = (end - start) / (steps - 1) as f64;
            (0..steps).map(|index| start + step * index as f64).collect()
        }
    }
}
