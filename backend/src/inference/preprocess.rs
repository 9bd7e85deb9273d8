use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use tch::Tensor;

pub const INPUT_SIZE: u32 = 224;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    #[error("Failed to read image: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("Image tensor is not contiguous")]
    Layout,
}

/// Per-channel normalization applied after scaling to [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Normalization {
    #[default]
    None,
    /// ImageNet mean/std. Not used by the deployed model.
    ImageNet,
}

impl FromStr for Normalization {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Normalization::None),
            "imagenet" => Ok(Normalization::ImageNet),
            _ => Err(()),
        }
    }
}

impl Normalization {
    fn apply(self, channel: usize, value: f32) -> f32 {
        match self {
            Normalization::None => value,
            Normalization::ImageNet => (value - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel],
        }
    }
}

pub fn decode(image: &[u8]) -> Result<DynamicImage, PreprocessError> {
    Ok(image::load_from_memory(image)?)
}

pub fn open(path: &Path) -> Result<DynamicImage, PreprocessError> {
    Ok(ImageReader::open(path)?.with_guessed_format()?.decode()?)
}

/// RGB, bilinear resize to 224x224, NCHW with a batch of one.
pub fn to_array(image: &DynamicImage, normalization: Normalization) -> Array4<f32> {
    let rgb = image.to_rgb8();
    let resized = image::imageops::resize(&rgb, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);
    let side = INPUT_SIZE as usize;
    Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
        let pixel = resized.get_pixel(x as u32, y as u32);
        normalization.apply(c, f32::from(pixel[c]) / 255.0)
    })
}

pub fn to_tensor(array: &Array4<f32>) -> Result<Tensor, PreprocessError> {
    let shape: Vec<i64> = array.shape().iter().map(|&d| d as i64).collect();
    let data = array.as_slice().ok_or(PreprocessError::Layout)?;
    Ok(Tensor::from_slice(data).view(shape.as_slice()))
}

#[cfg_attr(not(test), allow(dead_code))]
pub fn preprocess(image: &[u8], normalization: Normalization) -> Result<Tensor, PreprocessError> {
    let image = decode(image)?;
    to_tensor(&to_array(&image, normalization))
}

pub fn preprocess_path(path: &Path, normalization: Normalization) -> Result<Tensor, PreprocessError> {
    let image = open(path)?;
    to_tensor(&to_array(&image, normalization))
}
