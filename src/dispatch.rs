/// Format dispatch: recognizes the declared type of an upload and picks the
/// decoder and standardization strategy for it.
/// Recognition only looks at the filename, so an unsupported upload is rejected
/// before a single byte of it is decoded.

use log::debug;
use serde::Serialize;

use crate::error::Error;
use crate::models::{DecodedImage, RawInput};
use crate::{dicom, metaimage, raster};

pub const SUPPORTED_EXTENSIONS: [&str; 10] = [
    ".mha", ".mhd",
    ".dcm", ".dicom",
    ".jpg", ".jpeg", ".png", ".bmp", ".tif", ".tiff",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InputFormat
{
    /// Volumetric MetaImage (.mha/.mhd). These come from the training set pipeline
    /// and are already cropped and resampled.
    MetaImage,
    Dicom,
    Raster,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy
{
    /// Decode and fix orientation only.
    PreStandardized,
    /// Run the standardization algorithm; its failure fails the request.
    FullStandardization,
    /// Run the standardization algorithm, falling back to a plain resize if it fails.
    FullStandardizationWithFallback,
}

impl InputFormat
{
    /// `extension` is expected lowercased with its leading dot, as `RawInput::extension` returns it.
    pub fn from_extension(extension: &str) -> Option<InputFormat>
    {
        match extension
        {
            ".mha" | ".mhd" => Some(InputFormat::MetaImage),
            ".dcm" | ".dicom" => Some(InputFormat::Dicom),
            ".jpg" | ".jpeg" | ".png" | ".bmp" | ".tif" | ".tiff" => Some(InputFormat::Raster),
            _ => None,
        }
    }

    pub fn strategy(&self) -> Strategy
    {
        match self
        {
            InputFormat::MetaImage => Strategy::PreStandardized,
            InputFormat::Dicom => Strategy::FullStandardization,
            InputFormat::Raster => Strategy::FullStandardizationWithFallback,
        }
    }
}

/// Determines the input format from the declared filename.
pub fn recognize(input: &RawInput) -> Result<InputFormat, Error>
{
    let extension = input.extension();
    let format = extension.as_deref().and_then(InputFormat::from_extension);
    match format
    {
        Some(format) => {
            debug!("[{}] {} recognized as {:?} ({:?})", input.request_id, input.filename, format, format.strategy());
            Ok(format)
        },
        None => Err(Error::UnsupportedFormat {
            extension: extension.unwrap_or_else(|| input.filename.clone()),
        }),
    }
}

/// Decodes the upload with the decoder for its format.
/// Any decoder failure (corrupt bytes, unsupported encodings) is a preprocessing error.
pub fn decode(input: &RawInput, format: InputFormat, default_spacing: (f64, f64)) -> Result<DecodedImage, Error>
{
    match format
    {
        InputFormat::MetaImage => {
            metaimage::read(&input.bytes, input.origin.as_deref(), default_spacing)
                .map_err(|e| Error::Preprocessing(format!("{} could not be read: {}", input.filename, e)))
        },
        InputFormat::Dicom => {
            dicom::decode(&input.bytes, default_spacing)
                .map_err(|e| Error::Preprocessing(format!("{} could not be read: {}", input.filename, e)))
        },
        InputFormat::Raster => {
            raster::decode(&input.bytes, default_spacing)
                .map_err(|e| Error::Preprocessing(format!("{} could not be read: {}", input.filename, e)))
        },
    }
}
