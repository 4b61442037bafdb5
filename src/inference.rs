use crate::{
    common::*,
    config::Config,
    model::{FeatureExtractor, Generator, GeneratorInit, GeneratorOutput},
    train, utils,
};

/// Lists image files under `dir` recursively, sorted by path.
pub fn discover_images<P>(dir: P) -> Fallible<Vec<PathBuf>>
where
    P: AsRef<Path>,
{
    utils::glob_images(&dir.as_ref().join("**").join("*"))
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct InferenceRunner<'a> {
    vgg: &'a FeatureExtractor,
    #[derivative(Debug = "ignore")]
    vs: VarStore,
    generator: Generator,
}

impl<'a> InferenceRunner<'a> {
    pub fn new(config: &Config, vgg: &'a FeatureExtractor) -> Fallible<Self> {
        let mut vs = VarStore::new(config.device);
        let generator = GeneratorInit::new(config.hypercolumn).build(&vs.root() / "generator");
        train::load_if_exists(&mut vs, train::generator_checkpoint(&config.task))?;
        vs.freeze();

        Ok(Self { vgg, vs, generator })
    }

    /// Separates one image into transmission and reflection layers.
    pub fn predict(&self, image: &RgbImage) -> Fallible<(RgbImage, RgbImage)> {
        let input = utils::image_to_tensor(image).to_device(self.vs.device());
        let GeneratorOutput {
            transmission,
            reflection,
        } = tch::no_grad(|| self.generator.forward(self.vgg, &input));

        let transmission = utils::tensor_to_image(&transmission)?;
        let reflection = utils::tensor_to_image(&reflection)?;
        Ok((transmission, reflection))
    }

    /// Writes `input.png`, `t_output.png` and `r_output.png` per image into
    /// `<output_dir>/<file stem>/`. Returns the number of processed images.
    pub fn run<P, Q>(&self, input_dir: P, output_dir: Q) -> Fallible<usize>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
    {
        let input_dir = input_dir.as_ref();
        let output_dir = output_dir.as_ref();
        let paths = discover_images(input_dir)?;
        if paths.is_empty() {
            warn!("no test image found in {}", input_dir.display());
        }

        for path in paths.iter() {
            let stem = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .ok_or_else(|| format_err!("invalid file name {}", path.display()))?;
            let image = utils::load_image(path)?.to_rgb8();

            let instant = Instant::now();
            let (transmission, reflection) = self.predict(&image)?;
            info!(
                "test time {:.3} for image {}",
                instant.elapsed().as_secs_f64(),
                path.display()
            );

            let dir = output_dir.join(&stem);
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            image.save(dir.join("input.png"))?;
            transmission.save(dir.join("t_output.png"))?;
            reflection.save(dir.join("r_output.png"))?;
        }

        Ok(paths.len())
    }
}
