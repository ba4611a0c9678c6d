use std::time::Instant;

use image::{GrayImage, RgbImage};
use log::debug;
use ndarray::Array2;
use rayon::prelude::*;

use crate::error::Error;
use crate::models::{AttentionMap, StandardizedImage};

/// Weight of the standardized image in the overlay.
pub const IMAGE_WEIGHT: f32 = 0.6;
/// Weight of the colorized attention map in the overlay.
pub const HEATMAP_WEIGHT: f32 = 0.4;

/// Blends the attention map over the standardized image.
/// The overlay always has the standardized image's dimensions, whatever the resolution of the map.
pub fn composite(standardized: &StandardizedImage, attention: &AttentionMap) -> Result<RgbImage, Error>
{
    let start = Instant::now();
    let (width, height) = standardized.dimensions();
    if width == 0 || height == 0
    {
        return Err(Error::Visualization(format!("cannot overlay a {}x{} image", width, height)));
    }
    let (map_height, map_width) = attention.dim();
    if map_height == 0 || map_width == 0
    {
        return Err(Error::Visualization("attention map is empty".to_string()));
    }

    let heat = resize_linear(attention.values(), height as usize, width as usize)
        .mapv(|v| (v * 255.0) as u8);
    let overlay = blend(standardized.image(), &heat);

    debug!("Composited {}x{} overlay from {}x{} map in {:?}", width, height, map_width, map_height, start.elapsed());
    Ok(overlay)
}

fn blend(gray: &GrayImage, heat: &Array2<u8>) -> RgbImage
{
    let (width, height) = gray.dimensions();
    let intensities = gray.as_raw();
    let heat = heat.as_standard_layout();
    let heat = heat.as_slice().unwrap_or(&[]);

    let mut overlay = RgbImage::new(width, height);
    let buffer: &mut [u8] = &mut overlay;
    buffer
        .par_chunks_exact_mut(3)
        .zip(intensities.par_iter().zip(heat.par_iter()))
        .for_each(|(pixel, (intensity, value))| {
            let color = jet(*value);
            for (channel, heat_channel) in pixel.iter_mut().zip(color)
            {
                let mixed = IMAGE_WEIGHT * (*intensity as f32) + HEATMAP_WEIGHT * (heat_channel as f32);
                *channel = mixed.round().clamp(0.0, 255.0) as u8;
            }
        });

    overlay
}

/// The jet colormap: dark blue for 0, through cyan, yellow and red, to dark red for 255.
pub fn jet(value: u8) -> [u8; 3]
{
    let t = value as f32 / 255.0;
    let ramp = |offset: f32| ((1.5 - (4.0 * t - offset).abs()).clamp(0.0, 1.0) * 255.0).round() as u8;
    [ramp(3.0), ramp(2.0), ramp(1.0)]
}

/// Bilinear resize with pixel centres aligned, clamping at the borders.
pub fn resize_linear(map: &Array2<f32>, height: usize, width: usize) -> Array2<f32>
{
    let (src_height, src_width) = map.dim();
    let rows: Vec<(usize, usize, f32)> = (0..height).map(|y| sample_position(y, src_height, height)).collect();
    let cols: Vec<(usize, usize, f32)> = (0..width).map(|x| sample_position(x, src_width, width)).collect();

    Array2::from_shape_fn((height, width), |(y, x)| {
        let (y0, y1, fy) = rows[y];
        let (x0, x1, fx) = cols[x];
        let top = map[[y0, x0]] * (1.0 - fx) + map[[y0, x1]] * fx;
        let bottom = map[[y1, x0]] * (1.0 - fx) + map[[y1, x1]] * fx;
        top * (1.0 - fy) + bottom * fy
    })
}

/// The two source indices and the interpolation weight for destination index `dst`.
fn sample_position(dst: usize, src_len: usize, dst_len: usize) -> (usize, usize, f32)
{
    let scale = src_len as f32 / dst_len as f32;
    let position = ((dst as f32 + 0.5) * scale - 0.5).max(0.0);
    let lower = (position.floor() as usize).min(src_len - 1);
    let upper = (lower + 1).min(src_len - 1);
    let fraction = if upper == lower { 0.0 } else { position - lower as f32 };
    (lower, upper, fraction)
}
