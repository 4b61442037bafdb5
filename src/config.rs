use crate::common::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Output directory holding checkpoints, logs and per-epoch folders.
    #[serde(default = "default_task")]
    pub task: PathBuf,
    #[serde(default)]
    pub mode: Mode,
    #[serde(
        serialize_with = "serialize_device",
        deserialize_with = "deserialize_device",
        default = "default_device"
    )]
    pub device: Device,
    pub seed: Option<u64>,
    #[serde(default = "default_vgg_weights")]
    pub vgg_weights: PathBuf,
    #[serde(default = "default_true")]
    pub hypercolumn: bool,
    pub training: TrainingConfig,
    #[serde(default)]
    pub testing: TestingConfig,
}

impl Config {
    pub fn open<P>(path: P) -> Fallible<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = json5::from_str(&text)?;
        config.training.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    #[serde(rename = "train")]
    Train,
    #[serde(rename = "test")]
    Test,
}

impl Default for Mode {
    fn default() -> Self {
        Self::Train
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub synthetic_dir: PathBuf,
    pub real_dir: PathBuf,
    #[serde(default)]
    pub continue_training: bool,
    #[serde(default = "default_synthetic_ratio")]
    pub synthetic_ratio: f64,
    /// Number of sample slots per epoch. Defaults to the size of both pools.
    pub images_per_epoch: Option<NonZeroUsize>,
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,
    #[serde(default = "default_generator_lr")]
    pub generator_lr: f64,
    #[serde(default = "default_discriminator_lr")]
    pub discriminator_lr: f64,
    #[serde(default = "default_one")]
    pub save_model_freq: NonZeroUsize,
    #[serde(default = "default_save_model_freq_epoch")]
    pub save_model_freq_epoch: NonZeroUsize,
    #[serde(default = "default_one")]
    pub save_images_freq: NonZeroUsize,
    #[serde(default = "default_discriminator_update_freq")]
    pub discriminator_update_freq: NonZeroUsize,
    #[serde(default = "default_min_width")]
    pub min_width: u32,
    #[serde(default = "default_max_width")]
    pub max_width: u32,
}

impl TrainingConfig {
    pub fn validate(&self) -> Fallible<()> {
        ensure!(
            (0.0..=1.0).contains(&self.synthetic_ratio),
            "synthetic_ratio must be in [0, 1], but get {}",
            self.synthetic_ratio
        );
        ensure!(
            self.min_width > 0 && self.min_width < self.max_width,
            "the resize width range [{}, {}) is empty",
            self.min_width,
            self.max_width
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestingConfig {
    #[serde(default = "default_test_input_dir")]
    pub input_dir: PathBuf,
    #[serde(default = "default_test_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_output_folder_name")]
    pub output_folder_name: String,
}

impl TestingConfig {
    pub fn result_dir(&self) -> PathBuf {
        self.output_dir.join(&self.output_folder_name)
    }
}

impl Default for TestingConfig {
    fn default() -> Self {
        Self {
            input_dir: default_test_input_dir(),
            output_dir: default_test_output_dir(),
            output_folder_name: default_output_folder_name(),
        }
    }
}

fn default_task() -> PathBuf {
    PathBuf::from("pre-trained")
}

fn default_vgg_weights() -> PathBuf {
    PathBuf::from("VGG_Model/vgg19.ot")
}

fn default_true() -> bool {
    true
}

fn default_synthetic_ratio() -> f64 {
    0.7
}

fn default_max_epochs() -> usize {
    100
}

fn default_generator_lr() -> f64 {
    0.0002
}

fn default_discriminator_lr() -> f64 {
    0.0001
}

fn default_one() -> NonZeroUsize {
    NonZeroUsize::new(1).unwrap()
}

fn default_save_model_freq_epoch() -> NonZeroUsize {
    NonZeroUsize::new(10).unwrap()
}

fn default_discriminator_update_freq() -> NonZeroUsize {
    NonZeroUsize::new(2).unwrap()
}

fn default_min_width() -> u32 {
    256
}

fn default_max_width() -> u32 {
    480
}

fn default_test_input_dir() -> PathBuf {
    PathBuf::from("./test_images/real/")
}

fn default_test_output_dir() -> PathBuf {
    PathBuf::from("./test_results")
}

fn default_output_folder_name() -> String {
    "CEILNet".into()
}

fn default_device() -> Device {
    Device::cuda_if_available()
}

fn serialize_device<S>(device: &Device, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let text = match device {
        Device::Cpu => "cpu".into(),
        Device::Cuda(n) => format!("cuda({})", n),
    };
    text.serialize(serializer)
}

fn deserialize_device<'de, D>(deserializer: D) -> Result<Device, D::Error>
where
    D: Deserializer<'de>,
{
    let name = String::deserialize(deserializer)?;
    parse_device(&name).ok_or_else(|| D::Error::custom(format!("invalid device name {}", name)))
}

fn parse_device(name: &str) -> Option<Device> {
    if name == "cpu" {
        return Some(Device::Cpu);
    }

    let prefix = "cuda(";
    let suffix = ")";
    if name.starts_with(prefix) && name.ends_with(suffix) {
        let number: usize = name[(prefix.len())..(name.len() - suffix.len())]
            .parse()
            .ok()?;
        Some(Device::Cuda(number))
    } else {
        None
    }
}
