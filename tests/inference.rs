mod common;

use common::Workspace;
use reflection_removal::{
    common::*, inference::InferenceRunner, model::FeatureExtractor, train::Trainer,
};

#[test]
fn inference_is_reproducible() -> Fallible<()> {
    tch::manual_seed(3);
    let workspace = Workspace::new();
    let config = workspace.config();
    let vgg = FeatureExtractor::new(Device::Cpu);
    let shutdown = AtomicBool::new(false);

    Trainer::new(&config, &vgg, &shutdown)?.save_checkpoint(workspace.task())?;

    let outputs = ["run_a", "run_b"]
        .iter()
        .map(|name| {
            let output_dir = workspace.path().join(name);
            let runner = InferenceRunner::new(&config, &vgg)?;
            let count = runner.run(&config.testing.input_dir, &output_dir)?;
            assert_eq!(count, 2);
            Ok(output_dir)
        })
        .collect::<Fallible<Vec<_>>>()?;

    for stem in ["first", "second"] {
        for file in ["input.png", "t_output.png", "r_output.png"] {
            let lhs = fs::read(outputs[0].join(stem).join(file))?;
            let rhs = fs::read(outputs[1].join(stem).join(file))?;
            assert_eq!(lhs, rhs, "{}/{} differs", stem, file);
        }
    }

    let transmission = image::open(outputs[0].join("first/t_output.png"))?;
    assert_eq!(transmission.dimensions(), (40, 32));
    Ok(())
}

#[test]
fn prediction_keeps_image_size() -> Fallible<()> {
    tch::manual_seed(4);
    let workspace = Workspace::new();
    let config = workspace.config();
    let vgg = FeatureExtractor::new(Device::Cpu);

    let runner = InferenceRunner::new(&config, &vgg)?;
    let image = RgbImage::from_fn(30, 22, |x, y| Rgb([(x * 8) as u8, (y * 11) as u8, 128]));
    let (transmission, reflection) = runner.predict(&image)?;

    assert_eq!(transmission.dimensions(), (30, 22));
    assert_eq!(reflection.dimensions(), (30, 22));
    Ok(())
}
