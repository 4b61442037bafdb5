use crate::{
    common::*,
    config::TrainingConfig,
    params,
    synthesis::{self, Synthesized},
    utils,
};
use std::ops::Range;

/// One training example. Tensors are `[1, 3, H, W]` in `[0, 1]`.
#[derive(Debug, TensorLike)]
pub struct Sample {
    #[tensor_like(clone)]
    pub name: String,
    pub blended: Tensor,
    pub transmission: Tensor,
    /// Equals `transmission` for real samples.
    pub reflection: Tensor,
    #[tensor_like(copy)]
    pub is_synthetic: bool,
}

impl Sample {
    /// Returns the reason to drop a tiny or near-black sample, if any.
    pub fn degeneracy(&self) -> Option<SkipReason> {
        let size = self.blended.size();
        if size[2] < params::MIN_SAMPLE_SIDE || size[3] < params::MIN_SAMPLE_SIDE {
            return Some(SkipReason::TooSmall);
        }
        if utils::max_value(&self.reflection) < params::MIN_LAYER_INTENSITY
            || utils::max_value(&self.transmission) < params::MIN_LAYER_INTENSITY
        {
            return Some(SkipReason::DegenerateChannel);
        }
        if utils::max_value(&self.blended) < params::MIN_INPUT_INTENSITY {
            return Some(SkipReason::DegenerateImage);
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// The transmission outshines the reflection too much for a believable blend.
    Implausible,
    /// A ground truth layer is nearly black.
    DegenerateChannel,
    /// The blended input is nearly black.
    DegenerateImage,
    /// A side got shorter than the discriminator can reduce.
    TooSmall,
}

#[derive(Debug)]
pub enum Draw {
    Sample(Sample),
    Skipped { name: String, reason: SkipReason },
}

/// Unpaired transmission and reflection images for synthesis.
#[derive(Debug, Clone)]
pub struct SyntheticPool {
    pub transmission: Vec<PathBuf>,
    pub reflection: Vec<PathBuf>,
}

impl SyntheticPool {
    pub fn open<P>(root: P) -> Fallible<Self>
    where
        P: AsRef<Path>,
    {
        let root = root.as_ref();
        let transmission = utils::glob_images(&root.join("transmission_layer").join("*"))?;
        let reflection = utils::glob_images(&root.join("reflection_layer").join("*"))?;

        ensure!(
            !transmission.is_empty(),
            "no transmission images found in {}",
            root.display()
        );
        ensure!(
            !reflection.is_empty(),
            "no reflection images found in {}",
            root.display()
        );

        Ok(Self {
            transmission,
            reflection,
        })
    }
}

/// A photograph through glass paired with its transmission ground truth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealPair {
    pub blended: PathBuf,
    pub transmission: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RealPool {
    pub pairs: Vec<RealPair>,
}

impl RealPool {
    pub fn open<P>(root: P) -> Fallible<Self>
    where
        P: AsRef<Path>,
    {
        let root = root.as_ref();
        let blended_dir = root.join("blended");
        let transmission_files =
            utils::glob_images(&root.join("transmission_layer").join("**").join("*"))?;

        let pairs = transmission_files
            .into_par_iter()
            .map(|transmission| {
                let file_name = transmission
                    .file_name()
                    .ok_or_else(|| format_err!("invalid file name {}", transmission.display()))?;
                let blended = blended_dir.join(file_name);
                ensure!(
                    blended.is_file(),
                    "the blended image {} for {} does not exist",
                    blended.display(),
                    transmission.display()
                );
                Ok(RealPair {
                    blended,
                    transmission,
                })
            })
            .collect::<Fallible<Vec<_>>>()?;

        ensure!(!pairs.is_empty(), "no real image pairs found in {}", root.display());
        Ok(Self { pairs })
    }
}

/// Mixes synthetic composites and real pairs into a stream of samples.
#[derive(Debug, Clone)]
pub struct Sampler {
    synthetic: SyntheticPool,
    real: RealPool,
    synthetic_ratio: f64,
    widths: Range<u32>,
}

impl Sampler {
    pub fn new(
        synthetic: SyntheticPool,
        real: RealPool,
        synthetic_ratio: f64,
        widths: Range<u32>,
    ) -> Fallible<Self> {
        ensure!(!widths.is_empty(), "empty resize width range {:?}", widths);
        Ok(Self {
            synthetic,
            real,
            synthetic_ratio,
            widths,
        })
    }

    pub fn open(config: &TrainingConfig) -> Fallible<Self> {
        let synthetic = SyntheticPool::open(&config.synthetic_dir)?;
        let real = RealPool::open(&config.real_dir)?;
        info!(
            "found {} transmission and {} reflection images for synthesis, {} real pairs",
            synthetic.transmission.len(),
            synthetic.reflection.len(),
            real.pairs.len()
        );
        Self::new(
            synthetic,
            real,
            config.synthetic_ratio,
            config.min_width..config.max_width,
        )
    }

    /// Number of sample slots in one epoch.
    pub fn num_slots(&self, configured: Option<NonZeroUsize>) -> usize {
        configured
            .map(NonZeroUsize::get)
            .unwrap_or_else(|| self.synthetic.transmission.len() + self.real.pairs.len())
    }

    pub fn draw<R>(&self, rng: &mut R) -> Fallible<Draw>
    where
        R: Rng,
    {
        let draw = if rng.gen::<f64>() < self.synthetic_ratio {
            self.draw_synthetic(rng)?
        } else {
            self.draw_real(rng)?
        };

        let draw = match draw {
            Draw::Sample(sample) => match sample.degeneracy() {
                Some(reason) => Draw::Skipped {
                    name: sample.name,
                    reason,
                },
                None => Draw::Sample(sample),
            },
            skipped => skipped,
        };
        Ok(draw)
    }

    fn draw_synthetic<R>(&self, rng: &mut R) -> Fallible<Draw>
    where
        R: Rng,
    {
        let transmission_path = &self.synthetic.transmission
            [rng.gen_range(0..self.synthetic.transmission.len())];
        let transmission_image = utils::load_image(transmission_path)?;
        let reference = transmission_image.dimensions();
        let width = rng.gen_range(self.widths.clone());

        let reflection_path = self
            .synthetic
            .reflection
            .choose(rng)
            .ok_or_else(|| format_err!("empty reflection pool"))?;
        let reflection_image = utils::load_image(reflection_path)?;

        let transmission = utils::float_image_to_tensor(&utils::resize_to_width(
            &transmission_image,
            reference,
            width,
        ));
        let reflection = utils::float_image_to_tensor(&utils::resize_to_width(
            &reflection_image,
            reference,
            width,
        ));

        let name = file_stem(transmission_path);
        let sigma = *synthesis::sigma_table()
            .choose(rng)
            .ok_or_else(|| format_err!("empty sigma table"))?;

        if utils::mean_value(&transmission) / 2.0 > utils::mean_value(&reflection) {
            return Ok(Draw::Skipped {
                name,
                reason: SkipReason::Implausible,
            });
        }

        let Synthesized {
            reflection,
            blended,
            ..
        } = synthesis::synthesize(&transmission, &reflection, sigma, rng)
            .with_context(|| format!("failed to synthesize from {}", transmission_path.display()))?;

        Ok(Draw::Sample(Sample {
            name,
            blended,
            transmission,
            reflection,
            is_synthetic: true,
        }))
    }

    fn draw_real<R>(&self, rng: &mut R) -> Fallible<Draw>
    where
        R: Rng,
    {
        let RealPair {
            blended: blended_path,
            transmission: transmission_path,
        } = &self.real.pairs[rng.gen_range(0..self.real.pairs.len())];

        let blended_image = utils::load_image(blended_path)?;
        let reference = blended_image.dimensions();
        let width = rng.gen_range(self.widths.clone());
        let transmission_image = utils::load_image(transmission_path)?;

        let blended = utils::float_image_to_tensor(&utils::resize_to_width(
            &blended_image,
            reference,
            width,
        ));
        let transmission = utils::float_image_to_tensor(&utils::resize_to_width(
            &transmission_image,
            reference,
            width,
        ));

        Ok(Draw::Sample(Sample {
            name: file_stem(blended_path),
            blended,
            reflection: transmission.shallow_clone(),
            transmission,
            is_synthetic: false,
        }))
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".into())
}
