use crate::{
    common::*,
    dataset::Sample,
    model::{vgg::avg_pool_same, FeatureExtractor, GeneratorOutput, VggFeatures},
    params,
};

#[derive(Debug, TensorLike)]
pub struct ReconstructionLosses {
    pub total: Tensor,
    pub perceptual: Tensor,
    pub perceptual_transmission: Tensor,
    pub l1_reflection: Tensor,
    pub exclusion: Tensor,
}

/// Selects which gradient map of the exclusion loss gets rescaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RatioSide {
    First,
    Second,
}

pub fn l1_loss(lhs: &Tensor, rhs: &Tensor) -> Tensor {
    (lhs - rhs).abs().mean(Kind::Float)
}

pub fn perceptual_loss(vgg: &FeatureExtractor, candidate: &Tensor, target: &Tensor) -> Tensor {
    let candidate_features = vgg.forward(candidate);
    let target_features = vgg.forward(target);
    perceptual_distance(&candidate_features, &target_features)
}

fn perceptual_distance(lhs: &VggFeatures, rhs: &VggFeatures) -> Tensor {
    lhs.levels()
        .iter()
        .zip(rhs.levels().iter())
        .zip(params::PERCEPTUAL_SCALES.iter())
        .fold(l1_loss(&lhs.input, &rhs.input), |sum, ((lhs, rhs), scale)| {
            sum + l1_loss(lhs, rhs) * *scale
        })
}

pub fn discriminator_loss(real_probability: &Tensor, fake_probability: &Tensor) -> Tensor {
    let real_term = (real_probability + params::EPS).log();
    let fake_term = (fake_probability.neg() + 1.0 + params::EPS).log();
    (real_term + fake_term).neg().mean(Kind::Float) * 0.5
}

pub fn generator_adversarial_loss(fake_probability: &Tensor) -> Tensor {
    (fake_probability + params::EPS).log().neg().mean(Kind::Float)
}

/// Penalizes edges that appear at the same place in both layers.
pub fn exclusion_loss(first: &Tensor, second: &Tensor, levels: usize, side: RatioSide) -> Tensor {
    let mut first = first.shallow_clone();
    let mut second = second.shallow_clone();
    let mut vertical_terms = vec![];
    let mut horizontal_terms = vec![];

    for level in 0..levels {
        if level > 0 {
            first = avg_pool_same(&first);
            second = avg_pool_same(&second);
        }
        let (first_v, first_h) = gradients(&first);
        let (second_v, second_h) = gradients(&second);
        vertical_terms.push(exclusion_term(&first_v, &second_v, side));
        horizontal_terms.push(exclusion_term(&first_h, &second_h, side));
    }

    let reduce = |terms: Vec<Tensor>| {
        (Tensor::stack(&terms, 0).sum_dim_intlist(&[0], false, Kind::Float) / levels as f64)
            .sum(Kind::Float)
    };
    (reduce(vertical_terms) + reduce(horizontal_terms)) / 2.0
}

/// Per-sample `mean(s1² s2²)^(1/4)` of two gradient maps.
fn exclusion_term(first: &Tensor, second: &Tensor, side: RatioSide) -> Tensor {
    let (scaled, fixed) = match side {
        RatioSide::First => (first, second),
        RatioSide::Second => (second, first),
    };
    let alpha = fixed.abs().mean(Kind::Float) * 2.0 / (scaled.abs().mean(Kind::Float) + params::EPS);

    let squash = |grad: &Tensor| (grad.sigmoid() * 2.0 - 1.0).square();
    let fixed_s = squash(fixed);
    let scaled_s = squash(&(scaled * &alpha));

    (fixed_s * scaled_s)
        .mean_dim(&[1, 2, 3], false, Kind::Float)
        .pow_tensor_scalar(0.25)
}

/// Vertical and horizontal forward differences.
fn gradients(image: &Tensor) -> (Tensor, Tensor) {
    let size = image.size();
    let (height, width) = (size[2], size[3]);
    let vertical = image.narrow(2, 1, height - 1) - image.narrow(2, 0, height - 1);
    let horizontal = image.narrow(3, 1, width - 1) - image.narrow(3, 0, width - 1);
    (vertical, horizontal)
}

/// Reconstruction terms of the generator objective.
///
/// Every branch is evaluated and the synthetic flag picks values, so real samples
/// never see the reflection prediction in their total.
pub fn reconstruction_losses(
    vgg: &FeatureExtractor,
    prediction: &GeneratorOutput,
    sample: &Sample,
) -> ReconstructionLosses {
    let GeneratorOutput {
        transmission,
        reflection,
    } = prediction;

    let perceptual_transmission = perceptual_loss(vgg, transmission, &sample.transmission);
    let perceptual_reflection = perceptual_loss(vgg, reflection, &sample.reflection);
    let l1 = l1_loss(reflection, &sample.reflection);
    let exclusion = exclusion_loss(
        transmission,
        reflection,
        params::EXCLUSION_LEVELS,
        RatioSide::Second,
    );

    let is_synthetic = Tensor::of_slice(&[sample.is_synthetic])
        .squeeze()
        .to_device(transmission.device());
    let select = |synthetic: &Tensor, real: &Tensor| synthetic.where_self(&is_synthetic, real);

    let perceptual = select(
        &(&perceptual_transmission + &perceptual_reflection),
        &perceptual_transmission,
    );
    let l1_reflection = select(&l1, &l1.zeros_like());
    let exclusion = select(&exclusion, &exclusion.zeros_like());
    let total = &l1_reflection + &perceptual * params::PERCEPTUAL_WEIGHT + &exclusion;

    ReconstructionLosses {
        total,
        perceptual,
        perceptual_transmission,
        l1_reflection,
        exclusion,
    }
}

/// `100 · reconstruction + adversarial`
pub fn generator_objective(reconstruction: &Tensor, adversarial: &Tensor) -> Tensor {
    reconstruction * params::RECONSTRUCTION_WEIGHT + adversarial * params::ADVERSARIAL_WEIGHT
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn scalar(tensor: &Tensor) -> f64 {
        tensor.double_value(&[])
    }

    #[test]
    fn adversarial_losses_at_chance() {
        let half = Tensor::full(&[1, 1, 4, 4], 0.5, (Kind::Float, Device::Cpu));
        let ln2 = 2f64.ln();
        assert_abs_diff_eq!(scalar(&generator_adversarial_loss(&half)), ln2, epsilon = 1e-6);
        assert_abs_diff_eq!(scalar(&discriminator_loss(&half, &half)), ln2, epsilon = 1e-6);
    }

    #[test]
    fn confident_discriminator_has_small_loss() {
        let real = Tensor::full(&[1, 1, 2, 2], 0.999, (Kind::Float, Device::Cpu));
        let fake = Tensor::full(&[1, 1, 2, 2], 0.001, (Kind::Float, Device::Cpu));
        assert!(scalar(&discriminator_loss(&real, &fake)) < 0.01);
        assert!(scalar(&generator_adversarial_loss(&fake)) > 6.0);
    }

    #[test]
    fn l1_is_mean_absolute_difference() {
        let lhs = Tensor::of_slice(&[0.0f32, 1.0, 2.0, 3.0]);
        let rhs = Tensor::of_slice(&[1.0f32, 1.0, 0.0, 3.0]);
        assert_abs_diff_eq!(scalar(&l1_loss(&lhs, &rhs)), 0.75, epsilon = 1e-6);
    }

    #[test]
    fn exclusion_swaps_with_ratio_side() {
        tch::manual_seed(1);
        let first = Tensor::rand(&[2, 3, 20, 24], (Kind::Float, Device::Cpu));
        let second = Tensor::rand(&[2, 3, 20, 24], (Kind::Float, Device::Cpu)) * 0.3;

        let forward = exclusion_loss(&first, &second, 3, RatioSide::Second);
        let swapped = exclusion_loss(&second, &first, 3, RatioSide::First);

        assert!(scalar(&forward) > 0.0);
        assert_abs_diff_eq!(scalar(&forward), scalar(&swapped), epsilon = 1e-5);
    }

    #[test]
    fn exclusion_vanishes_without_shared_edges() {
        // edges only along rows in one layer, only along columns in the other
        let ramp = Tensor::arange(16, (Kind::Float, Device::Cpu)) / 16.0;
        let rows = ramp.view([1, 1, 16, 1]).expand(&[1, 3, 16, 16], false);
        let cols = ramp.view([1, 1, 1, 16]).expand(&[1, 3, 16, 16], false);

        let loss = exclusion_loss(&rows, &cols, 1, RatioSide::Second);
        assert_abs_diff_eq!(scalar(&loss), 0.0, epsilon = 1e-6);
    }

    fn sample(is_synthetic: bool) -> Sample {
        let transmission = Tensor::rand(&[1, 3, 16, 20], (Kind::Float, Device::Cpu));
        let reflection = if is_synthetic {
            Tensor::rand(&[1, 3, 16, 20], (Kind::Float, Device::Cpu)) * 0.5
        } else {
            transmission.shallow_clone()
        };
        Sample {
            name: "sample".into(),
            blended: (&transmission + &reflection).clamp(0.0, 1.0),
            transmission,
            reflection,
            is_synthetic,
        }
    }

    #[test]
    fn real_samples_ignore_reflection_prediction() {
        tch::manual_seed(2);
        let vgg = FeatureExtractor::new(Device::Cpu);
        let sample = sample(false);
        let transmission = Tensor::rand(&[1, 3, 16, 20], (Kind::Float, Device::Cpu));

        let totals = (0..2)
            .map(|_| {
                let prediction = GeneratorOutput {
                    transmission: transmission.shallow_clone(),
                    reflection: Tensor::rand(&[1, 3, 16, 20], (Kind::Float, Device::Cpu)) * 10.0,
                };
                let losses = reconstruction_losses(&vgg, &prediction, &sample);
                assert_eq!(
                    scalar(&losses.total),
                    scalar(&(&losses.perceptual_transmission * params::PERCEPTUAL_WEIGHT))
                );
                assert_eq!(scalar(&losses.l1_reflection), 0.0);
                assert_eq!(scalar(&losses.exclusion), 0.0);
                scalar(&losses.total)
            })
            .collect::<Vec<_>>();

        assert_eq!(totals[0], totals[1]);
    }

    #[test]
    fn synthetic_samples_use_every_term() {
        tch::manual_seed(3);
        let vgg = FeatureExtractor::new(Device::Cpu);
        let sample = sample(true);
        let prediction = GeneratorOutput {
            transmission: Tensor::rand(&[1, 3, 16, 20], (Kind::Float, Device::Cpu)),
            reflection: Tensor::rand(&[1, 3, 16, 20], (Kind::Float, Device::Cpu)),
        };
        let losses = reconstruction_losses(&vgg, &prediction, &sample);

        assert!(scalar(&losses.l1_reflection) > 0.0);
        assert!(scalar(&losses.exclusion) > 0.0);
        assert!(scalar(&losses.perceptual) > scalar(&losses.perceptual_transmission));
        let expected = scalar(&losses.l1_reflection)
            + scalar(&losses.perceptual) * params::PERCEPTUAL_WEIGHT
            + scalar(&losses.exclusion);
        assert_relative_eq!(scalar(&losses.total), expected, max_relative = 1e-5);
    }
}
