use crate::{
    common::*,
    config::{Config, TrainingConfig},
    dataset::{Draw, Sample, Sampler, SkipReason},
    model::{
        Discriminator, DiscriminatorInit, FeatureExtractor, Generator, GeneratorInit,
        GeneratorOutput,
    },
    objective::{self, ReconstructionLosses},
    utils,
};

pub const CHECKPOINT_PREFIX: &str = "model.ckpt";
pub const EVOLUTION_FILE: &str = "train_evolution.csv";
const EVOLUTION_HEADER: &str = "epoch\titeration\tperceptual_loss\tall_loss\n";

pub fn generator_checkpoint<P>(dir: P) -> PathBuf
where
    P: AsRef<Path>,
{
    dir.as_ref()
        .join(format!("{}.generator.ot", CHECKPOINT_PREFIX))
}

pub fn discriminator_checkpoint<P>(dir: P) -> PathBuf
where
    P: AsRef<Path>,
{
    dir.as_ref()
        .join(format!("{}.discriminator.ot", CHECKPOINT_PREFIX))
}

pub fn epoch_folder<P>(task: P, epoch: usize) -> PathBuf
where
    P: AsRef<Path>,
{
    task.as_ref().join(format!("{:05}", epoch))
}

/// Scalars reported by one generator update.
#[derive(Debug)]
pub struct GeneratorStep {
    pub prediction: GeneratorOutput,
    pub discriminator_loss: f64,
    pub adversarial_loss: f64,
    pub total_loss: f64,
    pub perceptual_loss: f64,
    pub exclusion_loss: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EpochOutcome {
    /// The epoch folder already exists.
    Skipped,
    /// The shutdown flag was raised before the epoch ended.
    Interrupted,
    /// Per-epoch counts. `iterations + skipped` equals the number of slots.
    Finished {
        iterations: usize,
        skipped: usize,
        discriminator_updates: usize,
    },
}

/// Per-slot loss history. Means ignore slots that were never filled.
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    total: Vec<f64>,
    perceptual: Vec<f64>,
    gradient: Vec<f64>,
    adversarial: Vec<f64>,
}

impl RunningStats {
    pub fn resize(&mut self, num_slots: usize) {
        self.total.resize(num_slots, 0.0);
        self.perceptual.resize(num_slots, 0.0);
        self.gradient.resize(num_slots, 0.0);
        self.adversarial.resize(num_slots, 0.0);
    }

    pub fn record(&mut self, slot: usize, step: &GeneratorStep) {
        self.total[slot] = step.total_loss;
        self.perceptual[slot] = step.perceptual_loss;
        self.gradient[slot] = step.exclusion_loss * 255.0;
        self.adversarial[slot] = step.adversarial_loss;
    }

    pub fn mean_total(&self) -> f64 {
        mean_nonzero(&self.total)
    }

    pub fn mean_perceptual(&self) -> f64 {
        mean_nonzero(&self.perceptual)
    }

    pub fn mean_gradient(&self) -> f64 {
        mean_nonzero(&self.gradient)
    }

    pub fn mean_adversarial(&self) -> f64 {
        mean_nonzero(&self.adversarial)
    }
}

/// Mean of the non-zero entries, NaN if there is none.
pub fn mean_nonzero(values: &[f64]) -> f64 {
    let (sum, count) = values
        .iter()
        .filter(|value| **value != 0.0)
        .fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    sum / count as f64
}

/// The last sample that reached a generator update, kept for the epoch image dump.
#[derive(Debug)]
struct LastTrained {
    sample: Sample,
    prediction: GeneratorOutput,
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct Trainer<'a> {
    config: Config,
    vgg: &'a FeatureExtractor,
    shutdown: &'a AtomicBool,
    #[derivative(Debug = "ignore")]
    generator_vs: VarStore,
    #[derivative(Debug = "ignore")]
    discriminator_vs: VarStore,
    generator: Generator,
    discriminator: Discriminator,
    #[derivative(Debug = "ignore")]
    generator_opt: nn::Optimizer,
    #[derivative(Debug = "ignore")]
    discriminator_opt: nn::Optimizer,
    rng: StdRng,
    stats: RunningStats,
}

impl<'a> Trainer<'a> {
    pub fn new(config: &Config, vgg: &'a FeatureExtractor, shutdown: &'a AtomicBool) -> Fallible<Self> {
        let Config {
            ref task,
            device,
            seed,
            hypercolumn,
            training:
                TrainingConfig {
                    continue_training,
                    generator_lr,
                    discriminator_lr,
                    ..
                },
            ..
        } = *config;

        fs::create_dir_all(task)
            .with_context(|| format!("failed to create task directory {}", task.display()))?;
        fs::write(task.join("config.json"), serde_json::to_string_pretty(config)?)?;

        let mut generator_vs = VarStore::new(device);
        let generator = GeneratorInit::new(hypercolumn).build(&generator_vs.root() / "generator");
        let mut discriminator_vs = VarStore::new(device);
        let discriminator =
            DiscriminatorInit::default().build(&discriminator_vs.root() / "discriminator");

        load_if_exists(&mut generator_vs, generator_checkpoint(task))?;
        if continue_training {
            load_if_exists(&mut discriminator_vs, discriminator_checkpoint(task))?;
        }

        let generator_opt = Adam::default().build(&generator_vs, generator_lr)?;
        let discriminator_opt = Adam::default().build(&discriminator_vs, discriminator_lr)?;

        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            config: config.clone(),
            vgg,
            shutdown,
            generator_vs,
            discriminator_vs,
            generator,
            discriminator,
            generator_opt,
            discriminator_opt,
            rng,
            stats: RunningStats::default(),
        })
    }

    pub fn generator_vs(&self) -> &VarStore {
        &self.generator_vs
    }

    pub fn discriminator_vs(&self) -> &VarStore {
        &self.discriminator_vs
    }

    pub fn stats(&self) -> &RunningStats {
        &self.stats
    }

    /// Updates the discriminator on one real/fake pair. Returns its loss.
    pub fn discriminator_step(&mut self, sample: &Sample) -> f64 {
        let fake = tch::no_grad(|| self.generator.forward(self.vgg, &sample.blended)).transmission;

        let real_output = self
            .discriminator
            .forward_t(&sample.blended, &sample.transmission, true);
        let fake_output = self.discriminator.forward_t(&sample.blended, &fake, true);
        let loss = objective::discriminator_loss(&real_output.probability, &fake_output.probability);

        self.discriminator_opt.backward_step(&loss);
        loss.double_value(&[])
    }

    /// Updates the generator on one sample.
    pub fn generator_step(&mut self, sample: &Sample) -> GeneratorStep {
        let prediction = self.generator.forward(self.vgg, &sample.blended);
        let ReconstructionLosses {
            total,
            perceptual,
            exclusion,
            ..
        } = objective::reconstruction_losses(self.vgg, &prediction, sample);

        let fake_output =
            self.discriminator
                .forward_t(&sample.blended, &prediction.transmission, true);
        let adversarial = objective::generator_adversarial_loss(&fake_output.probability);
        let loss = objective::generator_objective(&total, &adversarial);
        self.generator_opt.backward_step(&loss);

        let discriminator_loss = tch::no_grad(|| {
            let real_output =
                self.discriminator
                    .forward_t(&sample.blended, &sample.transmission, true);
            objective::discriminator_loss(&real_output.probability, &fake_output.probability)
        });

        GeneratorStep {
            prediction: GeneratorOutput {
                transmission: prediction.transmission.detach(),
                reflection: prediction.reflection.detach(),
            },
            discriminator_loss: discriminator_loss.double_value(&[]),
            adversarial_loss: adversarial.double_value(&[]),
            total_loss: total.double_value(&[]),
            perceptual_loss: perceptual.double_value(&[]),
            exclusion_loss: exclusion.double_value(&[]),
        }
    }

    pub fn run_epoch(&mut self, epoch: usize, sampler: &Sampler) -> Fallible<EpochOutcome> {
        let folder = epoch_folder(&self.config.task, epoch);
        if folder.is_dir() {
            info!("epoch {} is already done, skip", epoch);
            return Ok(EpochOutcome::Skipped);
        }

        let num_slots = sampler.num_slots(self.config.training.images_per_epoch);
        self.stats.resize(num_slots);
        let mut slots = (0..num_slots).collect::<Vec<_>>();
        slots.shuffle(&mut self.rng);

        let device = self.config.device;
        let update_freq = self.config.training.discriminator_update_freq.get();
        let mut count = 0;
        let mut skipped = 0;
        let mut discriminator_updates = 0;
        let mut last_trained = None;

        for slot in slots {
            if self.shutdown.load(Ordering::SeqCst) {
                warn!("training interrupted in epoch {}", epoch);
                return Ok(EpochOutcome::Interrupted);
            }
            let instant = Instant::now();

            let sample = match sampler.draw(&mut self.rng)? {
                Draw::Sample(sample) => sample.to_device(device),
                Draw::Skipped { name, reason } => {
                    match reason {
                        SkipReason::Implausible => {}
                        SkipReason::DegenerateChannel => {
                            warn!("invalid reflection file {} (degenerate channel)", name)
                        }
                        SkipReason::DegenerateImage => {
                            warn!("invalid file {} (degenerate image)", name)
                        }
                        SkipReason::TooSmall => warn!("invalid file {} (too small)", name),
                    }
                    skipped += 1;
                    continue;
                }
            };

            // skipped slots do not advance the schedule
            if count % update_freq == 0 {
                self.discriminator_step(&sample);
                discriminator_updates += 1;
            }
            let step = self.generator_step(&sample);
            self.stats.record(slot, &step);

            info!(
                "iter: {} {} || D: {:.2} || G: {:.2} {:.2} || all: {:.2} || loss: {:.2} {:.2} || mean: {:.2} {:.2} || time: {:.2}",
                epoch,
                count,
                step.discriminator_loss,
                step.adversarial_loss,
                self.stats.mean_adversarial(),
                self.stats.mean_total(),
                step.perceptual_loss,
                step.exclusion_loss * 255.0,
                self.stats.mean_perceptual(),
                self.stats.mean_gradient(),
                instant.elapsed().as_secs_f64()
            );

            count += 1;
            last_trained = Some(LastTrained {
                sample,
                prediction: step.prediction,
            });
        }

        self.finish_epoch(epoch, count, last_trained.as_ref())?;
        Ok(EpochOutcome::Finished {
            iterations: count,
            skipped,
            discriminator_updates,
        })
    }

    fn finish_epoch(
        &self,
        epoch: usize,
        iterations: usize,
        last_trained: Option<&LastTrained>,
    ) -> Fallible<()> {
        let TrainingConfig {
            save_model_freq,
            save_model_freq_epoch,
            save_images_freq,
            ..
        } = self.config.training;
        let task = &self.config.task;
        let folder = epoch_folder(task, epoch);
        let save_model = epoch % save_model_freq.get() == 0;
        let save_images = epoch % save_images_freq.get() == 0;

        if save_model || save_images {
            fs::create_dir_all(&folder)?;
        }

        self.log_evolution(epoch, iterations)?;

        if save_model {
            info!("saving the model");
            self.save_checkpoint(task)?;
        }
        if epoch % save_model_freq_epoch.get() == 0 {
            info!("saving the epoch model");
            self.save_checkpoint(&folder)?;
        }
        if save_images {
            match last_trained {
                Some(LastTrained { sample, prediction }) => {
                    let dir = folder.join(&sample.name);
                    fs::create_dir_all(&dir)?;
                    utils::save_tensor_image(&sample.blended, dir.join("int_t.png"))?;
                    utils::save_tensor_image(&prediction.transmission, dir.join("out_t.png"))?;
                    utils::save_tensor_image(&prediction.reflection, dir.join("out_r.png"))?;
                }
                None => warn!("no sample was trained in epoch {}, skip saving images", epoch),
            }
        }

        Ok(())
    }

    fn log_evolution(&self, epoch: usize, iterations: usize) -> Fallible<()> {
        let path = self.config.task.join(EVOLUTION_FILE);
        let exists = path.is_file();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        if !exists {
            file.write_all(EVOLUTION_HEADER.as_bytes())?;
        }
        writeln!(
            file,
            "{}\t{}\t{:.2}\t{:.2}",
            epoch,
            iterations,
            self.stats.mean_perceptual(),
            self.stats.mean_gradient()
        )?;
        Ok(())
    }

    /// Saves both networks into `dir`. Files are written aside and renamed into place.
    pub fn save_checkpoint<P>(&self, dir: P) -> Fallible<()>
    where
        P: AsRef<Path>,
    {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        save_atomic(&self.generator_vs, generator_checkpoint(dir))?;
        save_atomic(&self.discriminator_vs, discriminator_checkpoint(dir))?;
        Ok(())
    }

    /// Runs epochs `1..max_epochs` until done or interrupted.
    pub fn train(&mut self, sampler: &Sampler) -> Fallible<()> {
        for epoch in 1..self.config.training.max_epochs {
            match self.run_epoch(epoch, sampler)? {
                EpochOutcome::Interrupted => break,
                EpochOutcome::Skipped | EpochOutcome::Finished { .. } => {}
            }
        }
        Ok(())
    }
}

/// Loads a checkpoint into `vs` if the file exists.
pub fn load_if_exists<P>(vs: &mut VarStore, path: P) -> Fallible<bool>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    if !path.is_file() {
        warn!("checkpoint {} not found, start from scratch", path.display());
        return Ok(false);
    }
    vs.load(path)
        .with_context(|| format!("failed to load checkpoint {}", path.display()))?;
    info!("loaded checkpoint {}", path.display());
    Ok(true)
}

fn save_atomic(vs: &VarStore, path: PathBuf) -> Fallible<()> {
    let tmp_path = path.with_extension("ot.tmp");
    vs.save(&tmp_path)
        .with_context(|| format!("failed to save checkpoint {}", tmp_path.display()))?;
    fs::rename(&tmp_path, &path)?;
    Ok(())
}
