pub mod discriminator;
pub mod generator;
pub mod vgg;

pub use discriminator::{Discriminator, DiscriminatorInit, DiscriminatorOutput};
pub use generator::{Generator, GeneratorInit, GeneratorOutput};
pub use vgg::{FeatureExtractor, VggFeatures};
