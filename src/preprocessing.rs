/// Tensor preparation: converts a standardized image into the input expected by the
/// classifier. Do not use these functions for any other purpose (for example,
/// to produce images for display); they apply the training-time ImageNet statistics.

use image::{imageops, imageops::FilterType, DynamicImage, GrayImage};
use ndarray::Array4;

use crate::error::Error;
use crate::models::{ModelInputTensor, StandardizedImage};
use crate::standardize::{gray_to_array, normalize_to_u8};

pub const IMAGE_INPUT_SIZE: usize = 224;
pub const CHANNELS: usize = 3;

/// ImageNet normalization mean values (RGB)
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet normalization std values (RGB)
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

pub fn prepare_tensor(image: &StandardizedImage) -> Result<ModelInputTensor, Error>
{
    image_to_model_format(image.image())
}

// Convert the image to the 4D (1, 3, 224, 224) array expected by the classifier
pub fn image_to_model_format(image: &GrayImage) -> Result<ModelInputTensor, Error>
{
    let (width, height) = image.dimensions();
    if width == 0 || height == 0
    {
        return Err(Error::TensorPreparation(format!("image of {}x{} has no pixels", width, height)));
    }

    // Already normalized images pass through unchanged.
    let normalized = normalize_to_u8(&gray_to_array(image));
    let resized = imageops::resize(
        &normalized,
        IMAGE_INPUT_SIZE as u32,
        IMAGE_INPUT_SIZE as u32,
        FilterType::Triangle);

    // The classifier was trained on 3 channel inputs even though radiographs are greyscale,
    // so the single channel is replicated.
    let rgb = DynamicImage::ImageLuma8(resized).to_rgb8();

    let mut image_input = Array4::<f32>::zeros((1, CHANNELS, IMAGE_INPUT_SIZE, IMAGE_INPUT_SIZE));
    for (x, y, pixel) in rgb.enumerate_pixels()
    {
        let x = x as usize;
        let y = y as usize;
        for (channel, value) in pixel.0.iter().enumerate()
        {
            image_input[[0, channel, y, x]] = ((*value as f32) / 255. - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel];
        }
    }

    if image_input.iter().any(|v| !v.is_finite())
    {
        return Err(Error::TensorPreparation("normalized tensor contains non-finite values".to_string()));
    }

    Ok(ModelInputTensor(image_input))
}
