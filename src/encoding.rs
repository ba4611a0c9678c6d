use std::io::Cursor;

use base64::{engine::general_purpose, Engine as _};
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};

use crate::error::Error;

pub const DATA_URL_PREFIX: &str = "data:image/png;base64,";

#[derive(Debug, thiserror::Error)]
pub enum EncodingError
{
    #[error("could not encode PNG: {0}")]
    Png(#[from] image::ImageError),
    #[error("payload is not a PNG data URL")]
    NotAPngDataUrl,
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl From<EncodingError> for Error
{
    fn from(error: EncodingError) -> Self
    {
        Error::Visualization(error.to_string())
    }
}

/// Encodes the image losslessly as a PNG data URL, usable directly as an `<img>` source.
pub fn image_to_data_url(image: &DynamicImage) -> Result<String, EncodingError>
{
    let mut image_data: Vec<u8> = Vec::new();
    image.write_to(&mut Cursor::new(&mut image_data), ImageFormat::Png)?;
    let res_base64 = general_purpose::STANDARD.encode(image_data);
    Ok(format!("{}{}", DATA_URL_PREFIX, res_base64))
}

pub fn gray_to_data_url(image: &GrayImage) -> Result<String, EncodingError>
{
    image_to_data_url(&DynamicImage::ImageLuma8(image.clone()))
}

pub fn rgb_to_data_url(image: &RgbImage) -> Result<String, EncodingError>
{
    image_to_data_url(&DynamicImage::ImageRgb8(image.clone()))
}

/// Inverse of [`image_to_data_url`].
pub fn decode_data_url(data_url: &str) -> Result<DynamicImage, EncodingError>
{
    let payload = data_url
        .strip_prefix(DATA_URL_PREFIX)
        .ok_or(EncodingError::NotAPngDataUrl)?;
    let bytes = general_purpose::STANDARD.decode(payload)?;
    Ok(image::load_from_memory_with_format(&bytes, ImageFormat::Png)?)
}
