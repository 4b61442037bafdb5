pub use anyhow::{bail, ensure, format_err, Context, Error};
pub use argh::FromArgs;
pub use derivative::Derivative;
pub use image::{
    imageops::{self, FilterType},
    DynamicImage, GenericImageView, ImageBuffer, Rgb, Rgb32FImage, RgbImage,
};
pub use itertools::Itertools;
pub use log::{debug, error, info, warn};
pub use ndarray::{s, Array2};
pub use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
pub use rayon::prelude::*;
pub use serde::{
    de::Error as DeserializeError, Deserialize, Deserializer, Serialize, Serializer,
};
pub use std::{
    borrow::Borrow,
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::prelude::*,
    iter,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    time::Instant,
};
pub use tch::{
    nn::{self, Adam, Conv2D, ConvConfig, Init, OptimizerConfig, VarStore},
    Device, Kind, Tensor,
};
pub use tch_tensor_like::TensorLike;

pub type Fallible<T> = anyhow::Result<T>;
