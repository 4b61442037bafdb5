use crate::{common::*, params};

/// Activations exposed by the feature extractor.
#[derive(Debug, TensorLike)]
pub struct VggFeatures {
    /// The mean-centered input in `[0, 255]` scale.
    pub input: Tensor,
    pub conv1_2: Tensor,
    pub conv2_2: Tensor,
    pub conv3_2: Tensor,
    pub conv4_2: Tensor,
    pub conv5_2: Tensor,
}

impl VggFeatures {
    /// The five convolutional levels, shallow first.
    pub fn levels(&self) -> [&Tensor; 5] {
        [
            &self.conv1_2,
            &self.conv2_2,
            &self.conv3_2,
            &self.conv4_2,
            &self.conv5_2,
        ]
    }
}

/// Frozen VGG-19 truncated after `conv5_2`.
///
/// Serves both as hypercolumn source for the generator and as the backbone of
/// the perceptual loss.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct FeatureExtractor {
    #[derivative(Debug = "ignore")]
    vs: VarStore,
    blocks: Vec<Vec<Conv2D>>,
    mean: Tensor,
}

const BLOCKS: [&[(&str, i64, i64)]; 5] = [
    &[("conv1_1", 3, 64), ("conv1_2", 64, 64)],
    &[("conv2_1", 64, 128), ("conv2_2", 128, 128)],
    &[
        ("conv3_1", 128, 256),
        ("conv3_2", 256, 256),
        ("conv3_3", 256, 256),
        ("conv3_4", 256, 256),
    ],
    &[
        ("conv4_1", 256, 512),
        ("conv4_2", 512, 512),
        ("conv4_3", 512, 512),
        ("conv4_4", 512, 512),
    ],
    &[("conv5_1", 512, 512), ("conv5_2", 512, 512)],
];

impl FeatureExtractor {
    /// Builds a randomly initialized extractor.
    pub fn new(device: Device) -> Self {
        let mut vs = VarStore::new(device);
        let conv_config = ConvConfig {
            padding: 1,
            ..Default::default()
        };
        let blocks = {
            let root = vs.root();
            BLOCKS
                .iter()
                .map(|block| {
                    block
                        .iter()
                        .map(|&(name, in_c, out_c)| {
                            nn::conv2d(&root / name, in_c, out_c, 3, conv_config)
                        })
                        .collect::<Vec<_>>()
                })
                .collect::<Vec<_>>()
        };
        let mean = Tensor::of_slice(&params::IMAGENET_MEAN)
            .to_kind(Kind::Float)
            .view([1, 3, 1, 1])
            .to_device(device);

        vs.freeze();
        Self { vs, blocks, mean }
    }

    /// Loads pretrained weights from a file written by `VarStore::save`.
    pub fn load<P>(path: P, device: Device) -> Fallible<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let mut extractor = Self::new(device);
        extractor
            .vs
            .load(path)
            .with_context(|| format!("failed to load VGG weights from {}", path.display()))?;
        extractor.vs.freeze();
        info!("loaded pretrained VGG-19 weights from {}", path.display());
        Ok(extractor)
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    /// Runs the extractor on images in `[0, 1]`.
    pub fn forward(&self, image: &Tensor) -> VggFeatures {
        let input = image * 255.0 - &self.mean;

        let (conv1_2, net) = self.run_block(0, &input);
        let (conv2_2, net) = self.run_block(1, &avg_pool_same(&net));
        let (conv3_2, net) = self.run_block(2, &avg_pool_same(&net));
        let (conv4_2, net) = self.run_block(3, &avg_pool_same(&net));
        let (conv5_2, _) = self.run_block(4, &avg_pool_same(&net));

        VggFeatures {
            input,
            conv1_2,
            conv2_2,
            conv3_2,
            conv4_2,
            conv5_2,
        }
    }

    /// Returns the activation of the second convolution and the block output.
    fn run_block(&self, index: usize, input: &Tensor) -> (Tensor, Tensor) {
        let mut tap = None;
        let mut net = input.shallow_clone();
        for (depth, conv) in self.blocks[index].iter().enumerate() {
            net = net.apply(conv).relu();
            if depth == 1 {
                tap = Some(net.shallow_clone());
            }
        }
        let tap = tap.unwrap_or_else(|| net.shallow_clone());
        (tap, net)
    }
}

/// 2x2 average pooling with TensorFlow "SAME" semantics.
pub fn avg_pool_same(input: &Tensor) -> Tensor {
    input.avg_pool2d(&[2, 2], &[2, 2], &[0, 0], true, false, None::<i64>)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taps_have_expected_shapes() {
        tch::manual_seed(0);
        let vgg = FeatureExtractor::new(Device::Cpu);
        let image = Tensor::rand(&[1, 3, 36, 50], (Kind::Float, Device::Cpu));
        let features = vgg.forward(&image);

        assert_eq!(features.input.size(), vec![1, 3, 36, 50]);
        assert_eq!(features.conv1_2.size(), vec![1, 64, 36, 50]);
        assert_eq!(features.conv2_2.size(), vec![1, 128, 18, 25]);
        assert_eq!(features.conv3_2.size(), vec![1, 256, 9, 13]);
        assert_eq!(features.conv4_2.size(), vec![1, 512, 5, 7]);
        assert_eq!(features.conv5_2.size(), vec![1, 512, 3, 4]);
    }

    #[test]
    fn weights_are_frozen() {
        let vgg = FeatureExtractor::new(Device::Cpu);
        assert!(vgg.vs.trainable_variables().iter().all(|var| !var.requires_grad()));
    }

    #[test]
    fn same_pooling_keeps_odd_borders() {
        let input = Tensor::ones(&[1, 1, 3, 5], (Kind::Float, Device::Cpu));
        let pooled = avg_pool_same(&input);
        assert_eq!(pooled.size(), vec![1, 1, 2, 3]);
        // padded cells are not counted
        assert!(pooled.equal(&Tensor::ones(&[1, 1, 2, 3], (Kind::Float, Device::Cpu))));
    }
}
