use reflection_removal::{
    common::*,
    config::{Config, Mode},
    dataset::Sampler,
    inference::InferenceRunner,
    model::FeatureExtractor,
    train::Trainer,
};

lazy_static::lazy_static! {
    static ref SHUTDOWN_FLAG: AtomicBool = AtomicBool::new(false);
}

/// Single image reflection removal with perceptual losses.
#[derive(FromArgs)]
struct Args {
    /// the config file.
    #[argh(option, default = "PathBuf::from(\"config.json5\")")]
    config: PathBuf,
}

fn main() -> Fallible<()> {
    pretty_env_logger::init();

    // Set signal handler
    ctrlc::set_handler(|| {
        warn!("Interrupted by user");
        SHUTDOWN_FLAG.store(true, Ordering::SeqCst);
    })?;

    // Parse arguments
    let args: Args = argh::from_env();

    // load config
    let config = Config::open(&args.config)?;
    if let Some(seed) = config.seed {
        tch::manual_seed(seed as i64);
    }

    // load pretrained features
    let vgg = FeatureExtractor::load(&config.vgg_weights, config.device)?;

    match config.mode {
        Mode::Train => {
            info!("Loading dataset");
            let sampler = Sampler::open(&config.training)?;
            let mut trainer = Trainer::new(&config, &vgg, &SHUTDOWN_FLAG)?;
            trainer.train(&sampler)?;
        }
        Mode::Test => {
            let runner = InferenceRunner::new(&config, &vgg)?;
            let output_dir = config.testing.result_dir();
            let count = runner.run(&config.testing.input_dir, &output_dir)?;
            info!("wrote {} results to {}", count, output_dir.display());
        }
    }

    Ok(())
}
