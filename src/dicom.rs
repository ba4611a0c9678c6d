/// DICOM decoding. The dicom-rs reader works on files, so the upload is staged to a
/// temporary file first; the file is removed as soon as decoding returns.

use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_object::{open_file, DefaultDicomObject};
use dicom_pixeldata::PixelDecoder;
use log::debug;
use ndarray::Array2;

use crate::junk_drawer;
use crate::models::DecodedImage;

#[derive(Debug, thiserror::Error)]
pub enum DicomError
{
    #[error("could not stage upload: {0}")]
    Staging(#[from] std::io::Error),
    #[error("could not parse DICOM file: {0}")]
    Read(String),
    #[error("could not decode pixel data: {0}")]
    PixelData(String),
    #[error("unexpected pixel layout: {0}")]
    Layout(String),
}

pub fn decode(bytes: &[u8], default_spacing: (f64, f64)) -> Result<DecodedImage, DicomError>
{
    let staged = junk_drawer::stage_to_temp_file(bytes, ".dcm")?;
    let object = open_file(staged.path()).map_err(|e| DicomError::Read(e.to_string()))?;
    decode_object(&object, default_spacing)
}

pub fn decode_object(object: &DefaultDicomObject, default_spacing: (f64, f64)) -> Result<DecodedImage, DicomError>
{
    let pixel_data = object
        .decode_pixel_data()
        .map_err(|e| DicomError::PixelData(e.to_string()))?;

    let rows = pixel_data.rows() as usize;
    let columns = pixel_data.columns() as usize;
    let samples = pixel_data.samples_per_pixel() as usize;
    if rows == 0 || columns == 0 || samples == 0
    {
        return Err(DicomError::Layout(format!("{}x{} with {} samples per pixel", rows, columns, samples)));
    }

    // Modality LUT (rescale slope/intercept) is applied by the conversion.
    let values: Vec<f32> = pixel_data
        .to_vec::<f32>()
        .map_err(|e| DicomError::PixelData(e.to_string()))?;

    // Multi-frame objects: only the first frame is used.
    let frame_len = rows * columns * samples;
    if values.len() < frame_len
    {
        return Err(DicomError::Layout(format!("expected at least {} samples, found {}", frame_len, values.len())));
    }
    let frame = &values[..frame_len];

    let planar = string_value(object, tags::PLANAR_CONFIGURATION).as_deref() == Some("1");
    let intensities: Vec<f32> = if samples == 1 {
        frame.to_vec()
    } else if planar {
        let plane = rows * columns;
        (0..plane)
            .map(|i| (0..samples).map(|s| frame[s * plane + i]).sum::<f32>() / samples as f32)
            .collect()
    } else {
        frame
            .chunks_exact(samples)
            .map(|pixel| pixel.iter().sum::<f32>() / samples as f32)
            .collect()
    };

    let mut pixels = Array2::from_shape_vec((rows, columns), intensities)
        .map_err(|e| DicomError::Layout(e.to_string()))?;

    // MONOCHROME1 stores bright bone as low values.
    let photometric = string_value(object, tags::PHOTOMETRIC_INTERPRETATION);
    if photometric.as_deref() == Some("MONOCHROME1")
    {
        let (min, max) = pixels.fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
        pixels.mapv_inplace(|v| max + min - v);
    }

    let spacing = pixel_spacing(object).unwrap_or(default_spacing);
    debug!("DICOM {}x{} ({:?}), spacing {:?}", rows, columns, photometric, spacing);

    Ok(DecodedImage { pixels, spacing })
}

/// (row, column) spacing from PixelSpacing, falling back to ImagerPixelSpacing.
fn pixel_spacing(object: &DefaultDicomObject) -> Option<(f64, f64)>
{
    [tags::PIXEL_SPACING, tags::IMAGER_PIXEL_SPACING]
        .iter()
        .find_map(|tag| {
            let values = object.element(*tag).ok()?.to_multi_float64().ok()?;
            match values.as_slice()
            {
                [row, column, ..] if *row > 0.0 && *column > 0.0 => Some((*row, *column)),
                _ => None,
            }
        })
}

fn string_value(object: &DefaultDicomObject, tag: Tag) -> Option<String>
{
    object
        .element(tag)
        .ok()?
        .to_str()
        .ok()
        .map(|value| value.trim().trim_end_matches('\0').to_string())
}
