use crate::common::*;

pub const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "ppm", "bmp"];

pub fn is_image_file<P>(path: P) -> bool
where
    P: AsRef<Path>,
{
    path.as_ref()
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| *known == ext || known.to_uppercase() == ext)
        })
        .unwrap_or(false)
}

/// Lists image files matching a glob pattern, sorted by path.
pub fn glob_images(pattern: &Path) -> Fallible<Vec<PathBuf>> {
    let pattern = pattern
        .to_str()
        .ok_or_else(|| format_err!("non UTF-8 path {}", pattern.display()))?;
    let paths = glob::glob(pattern)?
        .map(|entry| Ok(entry?))
        .filter(|path: &Fallible<PathBuf>| match path {
            Ok(path) => path.is_file() && is_image_file(path),
            Err(_) => true,
        })
        .collect::<Fallible<Vec<_>>>()?
        .into_iter()
        .sorted()
        .collect();
    Ok(paths)
}

pub fn load_image<P>(path: P) -> Fallible<DynamicImage>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let image =
        image::open(path).with_context(|| format!("failed to load image {}", path.display()))?;
    Ok(image)
}

/// Resizes to `width` pixels wide, keeping the aspect ratio of `reference`.
///
/// Interpolation runs on `[0, 1]` floats, so the result is not quantized to
/// 8 bits.
pub fn resize_to_width(image: &DynamicImage, reference: (u32, u32), width: u32) -> Rgb32FImage {
    let (ref_width, ref_height) = reference;
    let height = ((width as f64 / ref_width as f64) * ref_height as f64).round() as u32;
    imageops::resize(
        &image.to_rgb32f(),
        width,
        height.max(1),
        FilterType::CatmullRom,
    )
}

/// Converts an RGB8 image into a `[1, 3, H, W]` float tensor in `[0, 1]`.
pub fn image_to_tensor(image: &RgbImage) -> Tensor {
    let (width, height) = image.dimensions();
    let pixels = image
        .as_raw()
        .iter()
        .map(|&value| value as f32 / 255.0)
        .collect::<Vec<_>>();
    Tensor::of_slice(&pixels)
        .view([height as i64, width as i64, 3])
        .permute(&[2, 0, 1])
        .unsqueeze(0)
}

/// Converts a float RGB image into a `[1, 3, H, W]` tensor.
pub fn float_image_to_tensor(image: &Rgb32FImage) -> Tensor {
    let (width, height) = image.dimensions();
    Tensor::of_slice(image.as_raw())
        .view([height as i64, width as i64, 3])
        .permute(&[2, 0, 1])
        .unsqueeze(0)
}

/// Converts a `[1, 3, H, W]` or `[3, H, W]` tensor into an RGB8 image.
///
/// Values are clamped to `[0, 1]`, scaled by 255 and truncated.
pub fn tensor_to_image(tensor: &Tensor) -> Fallible<RgbImage> {
    let tensor = match tensor.dim() {
        4 => tensor.select(0, 0),
        3 => tensor.shallow_clone(),
        dim => bail!("expect a 3 or 4 dimensional image tensor, but get {} dims", dim),
    };
    let (channels, height, width) = tensor.size3()?;
    ensure!(channels == 3, "expect 3 channels, but get {}", channels);

    let bytes = (tensor.to_device(Device::Cpu).clamp(0.0, 1.0) * 255.0)
        .to_kind(Kind::Uint8)
        .permute(&[1, 2, 0])
        .contiguous()
        .view([-1]);
    let buf = Vec::<u8>::from(&bytes);

    let image = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_vec(width as u32, height as u32, buf)
        .ok_or_else(|| format_err!("image buffer size mismatch"))?;
    Ok(image)
}

pub fn save_tensor_image<P>(tensor: &Tensor, path: P) -> Fallible<()>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    tensor_to_image(tensor)?
        .save(path)
        .with_context(|| format!("failed to save image {}", path.display()))?;
    Ok(())
}

pub fn max_value(tensor: &Tensor) -> f64 {
    tensor.max().double_value(&[])
}

pub fn mean_value(tensor: &Tensor) -> f64 {
    tensor.mean(Kind::Float).double_value(&[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_extensions() {
        assert!(is_image_file("a/b/photo.jpg"));
        assert!(is_image_file("photo.PNG"));
        assert!(is_image_file("photo.bmp"));
        assert!(!is_image_file("photo.Png"));
        assert!(!is_image_file("notes.txt"));
        assert!(!is_image_file("no_extension"));
    }

    #[test]
    fn image_tensor_conversion_keeps_pixels() -> Fallible<()> {
        let image = RgbImage::from_fn(5, 3, |x, y| Rgb([(x * 40) as u8, (y * 60) as u8, 7]));
        let tensor = image_to_tensor(&image);
        assert_eq!(tensor.size(), vec![1, 3, 3, 5]);

        let restored = tensor_to_image(&tensor)?;
        assert_eq!(restored.dimensions(), (5, 3));
        // float round trip may truncate one level
        for (lhs, rhs) in image.pixels().zip(restored.pixels()) {
            for (a, b) in lhs.0.iter().zip(rhs.0.iter()) {
                assert!((*a as i32 - *b as i32).abs() <= 1);
            }
        }
        Ok(())
    }

    #[test]
    fn resize_keeps_aspect_ratio() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(200, 100));
        let resized = resize_to_width(&image, image.dimensions(), 300);
        assert_eq!(resized.dimensions(), (300, 150));
    }

    #[test]
    fn resize_keeps_fractional_levels() {
        // alternating black and white columns interpolate between 8-bit levels
        let image = DynamicImage::ImageRgb8(RgbImage::from_fn(10, 4, |x, _| {
            let value = if x % 2 == 0 { 0 } else { 255 };
            Rgb([value, value, value])
        }));
        let resized = resize_to_width(&image, image.dimensions(), 7);
        assert_eq!(resized.dimensions(), (7, 3));

        let values = resized.as_raw();
        assert!(values.iter().all(|&value| (0.0..=1.0).contains(&value)));
        assert!(values.iter().any(|&value| {
            let level = value * 255.0;
            (level - level.round()).abs() > 1e-3
        }));

        let tensor = float_image_to_tensor(&resized);
        assert_eq!(tensor.size(), vec![1, 3, 3, 7]);
        assert_eq!(tensor.double_value(&[0, 1, 2, 4]), resized.get_pixel(4, 2).0[1] as f64);
    }
}
