use image::{imageops::FilterType, GenericImageView, ImageReader};
use ndarray::{Array, Ix4};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Spatial size expected by the backbone.
pub const INPUT_SIZE: u32 = 224;

// ImageNet statistics the pretrained backbone was trained with.
pub const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("Failed to open image {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
}

#[derive(Debug)]
pub struct PreprocessedImage {
    /// Normalized NCHW tensor with a batch dimension of one.
    pub tensor: Array<f32, Ix4>,
    /// `(width, height)` of the decoded file.
    pub original_size: (u32, u32),
    pub processed_size: (u32, u32),
}

pub fn preprocess_image(path: &Path) -> Result<PreprocessedImage, PreprocessError> {
    let open_error = |source| PreprocessError::Open {
        path: path.to_path_buf(),
        source,
    };

    let original_img = ImageReader::open(path)
        .map_err(open_error)?
        .with_guessed_format()
        .map_err(open_error)?
        .decode()?;

    let original_size = original_img.dimensions();
    let rgb = original_img.to_rgb8();
    let img = image::imageops::resize(&rgb, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);

    let side = INPUT_SIZE as usize;
    let mut input = Array::zeros((1, 3, side, side));
    for (x, y, pixel) in img.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for (channel, value) in pixel.0.into_iter().enumerate() {
            input[[0, channel, y, x]] = ((value as f32) / 255. - MEAN[channel]) / STD[channel];
        }
    }

    Ok(PreprocessedImage {
        tensor: input,
        original_size,
        processed_size: (INPUT_SIZE, INPUT_SIZE),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use uuid::Uuid;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tumor-preprocess-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_png(dir: &Path, width: u32, height: u32, color: [u8; 3]) -> PathBuf {
        let path = dir.join("scan.png");
        ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(width, height, Rgb(color))
            .save(&path)
            .unwrap();
        path
    }

    #[test]
    fn test_preprocess_image() {
        let dir = temp_dir();
        let path = write_png(&dir, 100, 100, [255, 0, 0]);

        let preprocessed = preprocess_image(&path).unwrap();

        assert_eq!(preprocessed.tensor.shape(), &[1, 3, 224, 224]);
        assert_eq!(preprocessed.original_size, (100, 100));
        assert_eq!(preprocessed.processed_size, (224, 224));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_preprocess_keeps_original_dimensions() {
        let dir = temp_dir();
        let path = write_png(&dir, 317, 45, [10, 20, 30]);

        let preprocessed = preprocess_image(&path).unwrap();

        assert_eq!(preprocessed.original_size, (317, 45));
        assert_eq!(preprocessed.tensor.shape(), &[1, 3, 224, 224]);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_preprocess_normalizes_channels() {
        let dir = temp_dir();
        let path = write_png(&dir, 64, 64, [255, 0, 128]);

        let tensor = preprocess_image(&path).unwrap().tensor;

        let expected = [
            (1.0 - MEAN[0]) / STD[0],
            (0.0 - MEAN[1]) / STD[1],
            (128.0 / 255.0 - MEAN[2]) / STD[2],
        ];
        for (channel, expected) in expected.iter().enumerate() {
            for (y, x) in [(0, 0), (111, 57), (223, 223)] {
                let value = tensor[[0, channel, y, x]];
                assert!(
                    (value - expected).abs() < 1e-5,
                    "channel {channel} at ({x}, {y}): {value} != {expected}"
                );
            }
        }

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_preprocess_converts_grayscale_to_rgb() {
        let dir = temp_dir();
        let path = dir.join("gray.png");
        image::GrayImage::from_pixel(30, 40, image::Luma([200]))
            .save(&path)
            .unwrap();

        let preprocessed = preprocess_image(&path).unwrap();

        assert_eq!(preprocessed.original_size, (30, 40));
        let value = 200.0 / 255.0;
        for channel in 0..3 {
            let expected = (value - MEAN[channel]) / STD[channel];
            assert!((preprocessed.tensor[[0, channel, 10, 10]] - expected).abs() < 1e-5);
        }

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_preprocess_rejects_non_image_bytes() {
        let dir = temp_dir();
        let path = dir.join("scan.png");
        std::fs::write(&path, b"definitely not a png, just some bytes").unwrap();

        let result = preprocess_image(&path);

        assert!(matches!(result, Err(PreprocessError::Decode(_))));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_preprocess_reports_missing_file() {
        let dir = temp_dir();

        let result = preprocess_image(&dir.join("missing.jpg"));

        assert!(matches!(result, Err(PreprocessError::Open { .. })));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
