#![allow(dead_code)]

use reflection_removal::{common::*, config::Config};
use tempfile::TempDir;

pub fn write_image(path: &Path, width: u32, height: u32, base: u8) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    RgbImage::from_fn(width, height, |x, y| {
        Rgb([
            base.saturating_add((x * 3 % 40) as u8),
            base.saturating_add((y * 5 % 30) as u8),
            base.saturating_sub(((x + y) % 25) as u8),
        ])
    })
    .save(path)
    .unwrap();
}

/// A workspace with a tiny synthetic pool, three real pairs and a task directory.
pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path();

        write_image(&root.join("synthetic/transmission_layer/t0.png"), 64, 48, 150);
        write_image(&root.join("synthetic/reflection_layer/r0.png"), 64, 48, 180);
        for (index, base) in [120u8, 160, 200].iter().enumerate() {
            let name = format!("pair{}.png", index);
            write_image(&root.join("real/transmission_layer").join(&name), 64, 48, *base);
            write_image(&root.join("real/blended").join(&name), 64, 48, base / 2 + 90);
        }
        write_image(&root.join("test/first.png"), 40, 32, 140);
        write_image(&root.join("test/nested/second.png"), 36, 28, 90);

        Self { dir }
    }

    /// Adds real pairs whose images are all black, so every draw of them is skipped.
    pub fn add_black_pairs(&self, count: usize) {
        for index in 0..count {
            let name = format!("black{}.png", index);
            for dir in ["real/transmission_layer", "real/blended"] {
                let path = self.path().join(dir).join(&name);
                RgbImage::new(64, 48).save(path).unwrap();
            }
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn task(&self) -> PathBuf {
        self.path().join("task")
    }

    pub fn config(&self) -> Config {
        let text = format!(
            r#"{{
                task: "{root}/task",
                mode: "train",
                device: "cpu",
                seed: 17,
                training: {{
                    synthetic_dir: "{root}/synthetic",
                    real_dir: "{root}/real",
                    synthetic_ratio: 0.0,
                    images_per_epoch: 3,
                    max_epochs: 2,
                    save_model_freq_epoch: 1,
                    min_width: 48,
                    max_width: 56,
                }},
                testing: {{
                    input_dir: "{root}/test",
                    output_dir: "{root}/results",
                }},
            }}"#,
            root = self.path().display()
        );
        let config: Config = json5::from_str(&text).unwrap();
        config.training.validate().unwrap();
        config
    }
}

pub fn trainable(vs: &VarStore) -> HashMap<String, Tensor> {
    vs.variables()
        .into_iter()
        .filter(|(_, var)| var.requires_grad())
        .map(|(name, var)| (name, var.detach().copy()))
        .collect()
}

pub fn same_parameters(before: &HashMap<String, Tensor>, vs: &VarStore) -> bool {
    let after = trainable(vs);
    before.len() == after.len()
        && before
            .iter()
            .all(|(name, var)| after.get(name).map(|other| var.equal(other)) == Some(true))
}
