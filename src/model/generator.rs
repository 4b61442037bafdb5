use super::vgg::{FeatureExtractor, VggFeatures};
use crate::{common::*, params};

#[derive(Debug, TensorLike)]
pub struct GeneratorOutput {
    pub transmission: Tensor,
    pub reflection: Tensor,
}

#[derive(Debug, Clone)]
pub struct GeneratorInit {
    pub hypercolumn: bool,
    pub channels: i64,
    pub dilations: Vec<i64>,
    pub output_channels: i64,
}

impl GeneratorInit {
    pub fn new(hypercolumn: bool) -> Self {
        Self {
            hypercolumn,
            channels: params::GENERATOR_CHANNELS,
            dilations: params::GENERATOR_DILATIONS.to_vec(),
            output_channels: params::GENERATOR_OUTPUT_CHANNELS,
        }
    }

    pub fn build<'p, P>(self, path: P) -> Generator
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self {
            hypercolumn,
            channels,
            dilations,
            output_channels,
        } = self;

        let input_channels = 3 + params::HYPERCOLUMN_CHANNELS.iter().sum::<i64>();
        let layers = dilations
            .iter()
            .enumerate()
            .map(|(index, &dilation)| {
                // the first layer mixes the hypercolumn pointwise
                let (in_channels, kernel_size) = if index == 0 {
                    (input_channels, 1)
                } else {
                    (channels, 3)
                };
                DilatedLayerInit {
                    in_channels,
                    out_channels: channels,
                    kernel_size,
                    dilation,
                }
                .build(path / format!("g_conv{}", index))
            })
            .collect::<Vec<_>>();

        let output_conv = nn::conv2d(
            path / "g_conv_last",
            channels,
            output_channels,
            1,
            Default::default(),
        );

        Generator {
            hypercolumn,
            input_channels,
            layers,
            output_conv,
        }
    }
}

/// Context aggregation network over a VGG hypercolumn.
#[derive(Debug)]
pub struct Generator {
    hypercolumn: bool,
    input_channels: i64,
    layers: Vec<DilatedLayer>,
    output_conv: Conv2D,
}

impl Generator {
    pub fn forward(&self, vgg: &FeatureExtractor, blended: &Tensor) -> GeneratorOutput {
        let features = vgg.forward(blended);
        let input = self.hypercolumn(&features, blended);
        debug_assert_eq!(input.size()[1], self.input_channels);

        let net = self
            .layers
            .iter()
            .fold(input, |net, layer| layer.forward(&net));
        let output = net.apply(&self.output_conv);

        let mut halves = output.chunk(2, 1).into_iter();
        match (halves.next(), halves.next()) {
            (Some(transmission), Some(reflection)) => GeneratorOutput {
                transmission,
                reflection,
            },
            _ => unreachable!("the output layer has an even number of channels"),
        }
    }

    /// Stacks the resized feature maps, deepest first, in front of the input.
    fn hypercolumn(&self, features: &VggFeatures, blended: &Tensor) -> Tensor {
        let size = blended.size();
        let (height, width) = (size[2], size[3]);

        let mut columns = features
            .levels()
            .iter()
            .rev()
            .map(|feature| {
                if self.hypercolumn {
                    feature.upsample_bilinear2d(&[height, width], false, None::<f64>, None::<f64>)
                        / 255.0
                } else {
                    let size = feature.size();
                    Tensor::zeros(&[size[0], size[1], height, width], (Kind::Float, blended.device()))
                }
            })
            .collect::<Vec<_>>();
        columns.push(blended.shallow_clone());

        Tensor::cat(&columns, 1)
    }
}

#[derive(Debug, Clone)]
struct DilatedLayerInit {
    in_channels: i64,
    out_channels: i64,
    kernel_size: i64,
    dilation: i64,
}

impl DilatedLayerInit {
    fn build<'p, P>(self, path: P) -> DilatedLayer
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self {
            in_channels,
            out_channels,
            kernel_size,
            dilation,
        } = self;

        let mut conv = nn::conv2d(
            path / "conv",
            in_channels,
            out_channels,
            kernel_size,
            ConvConfig {
                padding: dilation * (kernel_size - 1) / 2,
                dilation,
                bias: false,
                ws_init: Init::Const(0.0),
                ..Default::default()
            },
        );
        tch::no_grad(|| {
            conv.ws
                .copy_(&identity_kernel(in_channels, out_channels, kernel_size, path.device()));
        });

        let identity_weight = path.var("w0", &[], Init::Const(1.0));
        let norm_weight = path.var("w1", &[], Init::Const(0.0));
        let norm_shift = path.zeros("beta", &[out_channels]);

        DilatedLayer {
            conv,
            identity_weight,
            norm_weight,
            norm_shift,
        }
    }
}

/// Dilated convolution followed by adaptive normalization and leaky ReLU.
#[derive(Debug)]
struct DilatedLayer {
    conv: Conv2D,
    identity_weight: Tensor,
    norm_weight: Tensor,
    norm_shift: Tensor,
}

impl DilatedLayer {
    fn forward(&self, input: &Tensor) -> Tensor {
        let net = input.apply(&self.conv);
        // batch statistics are always used, no running averages are kept
        let normalized = Tensor::batch_norm(
            &net,
            None::<&Tensor>,
            Some(&self.norm_shift),
            None,
            None,
            true,
            0.1,
            params::NORM_EPS,
            false,
        );
        let net = &self.identity_weight * &net + &self.norm_weight * normalized;
        leaky_relu(&net)
    }
}

/// `max(0.2 x, x)`
pub fn leaky_relu(input: &Tensor) -> Tensor {
    input.where_self(&input.gt(0.0), &(input * params::LEAKY_SLOPE))
}

/// Kernel that maps input channel `i` to output channel `i` through its centre tap.
fn identity_kernel(in_channels: i64, out_channels: i64, kernel_size: i64, device: Device) -> Tensor {
    let diag_len = in_channels.min(out_channels);
    let center = (kernel_size - 1) / 2;
    Tensor::ones(&[diag_len], (Kind::Float, device))
        .diag(0)
        .constant_pad_nd(&[0, in_channels - diag_len, 0, out_channels - diag_len])
        .view([out_channels, in_channels, 1, 1])
        .constant_pad_nd(&[center, center, center, center])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_kernel_has_centre_taps() {
        let kernel = identity_kernel(5, 3, 3, Device::Cpu);
        assert_eq!(kernel.size(), vec![3, 5, 3, 3]);
        assert_eq!(kernel.sum(Kind::Float).double_value(&[]), 3.0);
        for index in 0..3 {
            assert_eq!(kernel.double_value(&[index, index, 1, 1]), 1.0);
        }
        assert_eq!(kernel.double_value(&[0, 1, 1, 1]), 0.0);
    }

    #[test]
    fn leaky_relu_scales_negatives() {
        let input = Tensor::of_slice(&[-1.0f32, 0.0, 2.0]);
        let output = leaky_relu(&input);
        assert!(output.allclose(&Tensor::of_slice(&[-0.2f32, 0.0, 2.0]), 1e-6, 1e-6, false));
    }

    #[test]
    fn output_layers_match_input_size() {
        tch::manual_seed(0);
        let vs = VarStore::new(Device::Cpu);
        let vgg = FeatureExtractor::new(Device::Cpu);
        let generator = GeneratorInit::new(true).build(&vs.root());

        let blended = Tensor::rand(&[1, 3, 24, 40], (Kind::Float, Device::Cpu));
        let GeneratorOutput {
            transmission,
            reflection,
        } = generator.forward(&vgg, &blended);

        assert_eq!(transmission.size(), vec![1, 3, 24, 40]);
        assert_eq!(reflection.size(), vec![1, 3, 24, 40]);
    }

    #[test]
    fn hypercolumn_can_be_disabled() {
        let vs = VarStore::new(Device::Cpu);
        let vgg = FeatureExtractor::new(Device::Cpu);
        let generator = GeneratorInit::new(false).build(&vs.root());

        let blended = Tensor::rand(&[1, 3, 16, 16], (Kind::Float, Device::Cpu));
        let features = vgg.forward(&blended);
        let column = generator.hypercolumn(&features, &blended);

        assert_eq!(column.size(), vec![1, 1475, 16, 16]);
        assert_eq!(column.narrow(1, 0, 1472).abs().sum(Kind::Float).double_value(&[]), 0.0);
        assert!(column.narrow(1, 1472, 3).equal(&blended));
    }
}
