/// Decoding of generic raster uploads (JPEG, PNG, BMP, TIFF).
/// Photos of radiographs are often taken with phones, so the EXIF orientation
/// is applied before the image is reduced to a single 8-bit luminance channel.

use std::io::Cursor;

use image::{DynamicImage, GenericImageView};
use log::warn;
use ndarray::Array2;

use crate::models::DecodedImage;

pub fn decode(bytes: &[u8], default_spacing: (f64, f64)) -> Result<DecodedImage, image::ImageError>
{
    let image = image::load_from_memory(bytes)?;
    let image = fix_orientation(image, exif_orientation(bytes));

    // Raster formats carry no physical spacing, so every raster gets the default.
    let luma = image.to_luma8();
    let (width, height) = luma.dimensions();
    let pixels = Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
        luma.get_pixel(x as u32, y as u32).0[0] as f32
    });

    Ok(DecodedImage { pixels, spacing: default_spacing })
}

/// Reads the EXIF orientation tag (1-8).
/// If there is no rotation data available or EXIF loading fails,
/// we assume that the image is in the correct orientation.
fn exif_orientation(bytes: &[u8]) -> u32
{
    let mut cursor = Cursor::new(bytes);
    let exif = match exif::Reader::new().read_from_container(&mut cursor)
    {
        Ok(exif) => exif,
        Err(_) => return 1,
    };

    // Orientation is stored as a SHORT, but readers should accept BYTE, SHORT, or LONG
    // for any unsigned integer field. `Value::get_uint` is provided for that purpose.
    exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|field| field.value.get_uint(0))
        .unwrap_or(1)
}

// EXIF Rotation data is stored as a value 1-8, where:
// 1 = 0 degrees: the correct orientation, no adjustment is required.
// 2 = 0 degrees, mirrored: image has been flipped back-to-front.
// 3 = 180 degrees: image is upside down.
// 4 = 180 degrees, mirrored: image has been flipped back-to-front and is upside down.
// 5 = 90 degrees: image has been flipped back-to-front and is on its side.
// 6 = 90 degrees, mirrored: image is on its side.
// 7 = 270 degrees: image has been flipped back-to-front and is on its far side.
// 8 = 270 degrees, mirrored: image is on its far side.
fn fix_orientation(image: DynamicImage, orientation: u32) -> DynamicImage
{
    match orientation
    {
        1 => image,
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => {
            let (width, height) = image.dimensions();
            warn!("Unsupported EXIF orientation {} on {}x{} image, leaving as is", orientation, width, height);
            image
        }
    }
}
