use super::generator::leaky_relu;
use crate::{common::*, params};

#[derive(Debug, TensorLike)]
pub struct DiscriminatorOutput {
    /// Per-patch probability that the candidate is a real transmission layer.
    pub probability: Tensor,
    pub features: Vec<Tensor>,
}

#[derive(Debug, Clone)]
pub struct DiscriminatorInit {
    pub base_channels: i64,
    pub num_layers: usize,
    pub init_std: f64,
}

impl Default for DiscriminatorInit {
    fn default() -> Self {
        Self {
            base_channels: params::DISCRIMINATOR_BASE_CHANNELS,
            num_layers: params::DISCRIMINATOR_LAYERS,
            init_std: params::DISCRIMINATOR_INIT_STD,
        }
    }
}

impl DiscriminatorInit {
    pub fn build<'p, P>(self, path: P) -> Discriminator
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self {
            base_channels,
            num_layers,
            init_std,
        } = self;

        let conv_config = |stride| ConvConfig {
            stride,
            padding: 1,
            ws_init: Init::Randn {
                mean: 0.0,
                stdev: init_std,
            },
            ..Default::default()
        };

        let input_conv = nn::conv2d(path / "layer_1", 6, base_channels, 4, conv_config(2));

        let (hidden, out_channels) = (1..=num_layers).fold(
            (vec![], base_channels),
            |(mut hidden, in_channels), index| {
                let out_channels = base_channels * 2_i64.pow(index.min(3) as u32);
                let stride = if index == num_layers { 1 } else { 2 };
                let layer_path = path / format!("layer_{}", index + 1);
                let conv = nn::conv2d(
                    &layer_path / "conv",
                    in_channels,
                    out_channels,
                    4,
                    conv_config(stride),
                );
                let norm = nn::batch_norm2d(&layer_path / "norm", out_channels, Default::default());
                hidden.push((conv, norm));
                (hidden, out_channels)
            },
        );

        let output_conv = nn::conv2d(
            path / format!("layer_{}", num_layers + 2),
            out_channels,
            1,
            4,
            conv_config(1),
        );

        Discriminator {
            input_conv,
            hidden,
            output_conv,
        }
    }
}

/// Conditional patch discriminator over `(blended, transmission)` pairs.
///
/// The real and the fake path share the same weights by borrowing one instance twice.
#[derive(Debug)]
pub struct Discriminator {
    input_conv: Conv2D,
    hidden: Vec<(Conv2D, nn::BatchNorm)>,
    output_conv: Conv2D,
}

impl Discriminator {
    pub fn forward_t(&self, blended: &Tensor, candidate: &Tensor, train: bool) -> DiscriminatorOutput {
        let input = Tensor::cat(&[blended, candidate], 1);

        let mut features = vec![];
        let mut net = leaky_relu(&input.apply(&self.input_conv));
        features.push(net.shallow_clone());

        for (conv, norm) in self.hidden.iter() {
            net = leaky_relu(&net.apply(conv).apply_t(norm, train));
            features.push(net.shallow_clone());
        }

        let probability = net.apply(&self.output_conv).sigmoid();

        DiscriminatorOutput {
            probability,
            features,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_output_shape() {
        tch::manual_seed(0);
        let vs = VarStore::new(Device::Cpu);
        let discriminator = DiscriminatorInit::default().build(&vs.root());

        let blended = Tensor::rand(&[1, 3, 64, 80], (Kind::Float, Device::Cpu));
        let candidate = Tensor::rand(&[1, 3, 64, 80], (Kind::Float, Device::Cpu));
        let output = discriminator.forward_t(&blended, &candidate, true);

        // three stride-2 layers, then two stride-1 4x4 layers each trimming one pixel
        assert_eq!(output.probability.size(), vec![1, 1, 6, 8]);
        assert_eq!(output.features.len(), 4);
        assert_eq!(output.features[3].size()[1], 512);

        let min = output.probability.min().double_value(&[]);
        let max = output.probability.max().double_value(&[]);
        assert!(min >= 0.0 && max <= 1.0);
    }
}
