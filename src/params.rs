use static_assertions::const_assert_eq;

// numerical guard for log-probabilities
pub const EPS: f64 = 1e-12;

// generator
pub const GENERATOR_CHANNELS: i64 = 64; // feature width of every dilated layer
pub const GENERATOR_DILATIONS: [i64; 9] = [1, 1, 2, 4, 8, 16, 32, 64, 1];
pub const GENERATOR_OUTPUT_CHANNELS: i64 = 6; // transmission (3) + reflection (3)
pub const LEAKY_SLOPE: f64 = 0.2;
pub const NORM_EPS: f64 = 1e-3;

// discriminator
pub const DISCRIMINATOR_BASE_CHANNELS: i64 = 64;
pub const DISCRIMINATOR_LAYERS: usize = 3;
pub const DISCRIMINATOR_INIT_STD: f64 = 0.02;

// feature extractor
pub const IMAGENET_MEAN: [f64; 3] = [123.68, 116.779, 103.939];
pub const HYPERCOLUMN_CHANNELS: [i64; 5] = [64, 128, 256, 512, 512];

// losses
pub const PERCEPTUAL_SCALES: [f64; 5] = [1.0 / 2.6, 1.0 / 4.8, 1.0 / 3.7, 1.0 / 5.6, 10.0 / 1.5];
pub const PERCEPTUAL_WEIGHT: f64 = 0.2;
pub const ADVERSARIAL_WEIGHT: f64 = 1.0;
pub const RECONSTRUCTION_WEIGHT: f64 = 100.0;
pub const EXCLUSION_LEVELS: usize = 3;

// synthesis
pub const GAMMA: f64 = 2.2;
pub const VIGNETTE_SIZE: usize = 560;
pub const VIGNETTE_NSIG: f64 = 3.0;
pub const VIGNETTE_MARGIN: usize = 10;
pub const ATTENUATION_BASE: f64 = 1.08;
pub const SIGMA_MIN: f64 = 1.0;
pub const SIGMA_MAX: f64 = 5.0;
pub const SIGMA_STEPS: usize = 80;

// sampling
pub const MIN_LAYER_INTENSITY: f64 = 0.15;
pub const MIN_INPUT_INTENSITY: f64 = 0.1;
/// The discriminator trims a side below 24 pixels to nothing.
pub const MIN_SAMPLE_SIDE: i64 = 24;

const_assert_eq!(GENERATOR_DILATIONS.len(), 9);
const_assert_eq!(PERCEPTUAL_SCALES.len(), HYPERCOLUMN_CHANNELS.len());
