/// The standardization engine: turns a decoded upload into the canonical 8-bit image
/// the classifier was trained on.
///
/// Training images arrive already cropped, resampled to 1024x1024 and normalized.
/// Deployment images arrive in whatever resolution and intensity range the modality
/// produced, so everything that is not already in the training layout is run through
/// a `StandardizationAlgorithm` first.

use std::sync::Arc;

use image::{imageops, imageops::FilterType, GrayImage, ImageBuffer, Luma};
use log::{debug, warn};
use ndarray::{s, Array2, Axis};

use crate::dispatch::{self, Strategy};
use crate::error::Error;
use crate::models::{DecodedImage, RawInput, StandardizedImage};

/// Side length of every image that goes through full standardization.
pub const STANDARDIZED_SIZE: u32 = 1024;

/// Spacing assumed when the source carries none (mm per pixel, typical for chest radiographs).
pub const DEFAULT_PIXEL_SPACING: (f64, f64) = (0.143, 0.143);

#[derive(Debug, thiserror::Error)]
pub enum StandardizationError
{
    #[error("invalid pixel spacing {0:?}")]
    InvalidSpacing((f64, f64)),
    #[error("image of {height}x{width} is smaller than the minimum of {minimum} pixels per side")]
    TooSmall { height: usize, width: usize, minimum: usize },
    #[error("image contains non-finite intensities")]
    NonFinite,
    #[error("image has no contrast between the {lower} and {upper} percentiles")]
    NoContrast { lower: f32, upper: f32 },
    #[error("no foreground found above the intensity threshold")]
    NoForeground,
}

/// Output of a standardization algorithm: resampled pixels and their new spacing.
#[derive(Debug, Clone, PartialEq)]
pub struct Standardized
{
    pub pixels: Array2<f32>,
    pub spacing: (f64, f64),
}

/// A deterministic transform from a raw intensity plane to the training-time layout.
/// Implementations are constructed once and shared read-only between requests.
pub trait StandardizationAlgorithm: Send + Sync
{
    fn run(&self, pixels: &Array2<f32>, spacing: (f64, f64)) -> Result<Standardized, StandardizationError>;
}

/// Chest radiograph standardization: window intensities, crop to the exposed field,
/// resample to isotropic spacing so the long side fills `target_size`, and pad to a square.
#[derive(Debug, Clone)]
pub struct CxrStandardizer
{
    pub target_size: u32,
    /// Percentiles (as fractions) the intensities are windowed to.
    pub lower_percentile: f32,
    pub upper_percentile: f32,
    /// Windowed intensity above which a pixel counts as exposed field.
    pub foreground_threshold: f32,
    pub min_dimension: usize,
}

impl Default for CxrStandardizer
{
    fn default() -> Self
    {
        CxrStandardizer {
            target_size: STANDARDIZED_SIZE,
            lower_percentile: 0.005,
            upper_percentile: 0.995,
            foreground_threshold: 0.05,
            min_dimension: 32,
        }
    }
}

impl StandardizationAlgorithm for CxrStandardizer
{
    fn run(&self, pixels: &Array2<f32>, spacing: (f64, f64)) -> Result<Standardized, StandardizationError>
    {
        let (row_spacing, column_spacing) = spacing;
        if !(row_spacing.is_finite() && column_spacing.is_finite() && row_spacing > 0.0 && column_spacing > 0.0)
        {
            return Err(StandardizationError::InvalidSpacing(spacing));
        }
        self.check_size(pixels.nrows(), pixels.ncols())?;
        if pixels.iter().any(|v| !v.is_finite())
        {
            return Err(StandardizationError::NonFinite);
        }

        let (lower, upper) = percentiles(pixels, self.lower_percentile, self.upper_percentile);
        if upper - lower <= f32::EPSILON * upper.abs().max(1.0)
        {
            return Err(StandardizationError::NoContrast { lower, upper });
        }
        let windowed = pixels.mapv(|v| (v.clamp(lower, upper) - lower) / (upper - lower));

        let (top, bottom, left, right) = foreground_bounds(&windowed, self.foreground_threshold)
            .ok_or(StandardizationError::NoForeground)?;
        let cropped = windowed.slice(s![top..=bottom, left..=right]).to_owned();
        self.check_size(cropped.nrows(), cropped.ncols())?;

        // Resample to isotropic spacing with the longer physical side spanning the target.
        let height_mm = cropped.nrows() as f64 * row_spacing;
        let width_mm = cropped.ncols() as f64 * column_spacing;
        let target = self.target_size as f64;
        let new_spacing = height_mm.max(width_mm) / target;
        let new_height = ((height_mm / new_spacing).round() as u32).clamp(1, self.target_size);
        let new_width = ((width_mm / new_spacing).round() as u32).clamp(1, self.target_size);

        let buffer: ImageBuffer<Luma<f32>, Vec<f32>> = ImageBuffer::from_fn(
            cropped.ncols() as u32,
            cropped.nrows() as u32,
            |x, y| Luma([cropped[[y as usize, x as usize]]]),
        );
        let resized = imageops::resize(&buffer, new_width, new_height, FilterType::Lanczos3);

        // Center on a square canvas filled with the windowed minimum.
        let size = self.target_size as usize;
        let offset_y = (size - new_height as usize) / 2;
        let offset_x = (size - new_width as usize) / 2;
        let mut canvas = Array2::<f32>::zeros((size, size));
        for (x, y, pixel) in resized.enumerate_pixels()
        {
            // Lanczos rings slightly outside the input range.
            canvas[[offset_y + y as usize, offset_x + x as usize]] = pixel.0[0].clamp(0.0, 1.0);
        }

        debug!(
            "Standardized {}x{} (cropped to {}x{}) to {}x{} at {:.4} mm/px",
            pixels.nrows(), pixels.ncols(), cropped.nrows(), cropped.ncols(), new_height, new_width, new_spacing
        );

        Ok(Standardized { pixels: canvas, spacing: (new_spacing, new_spacing) })
    }
}

impl CxrStandardizer
{
    fn check_size(&self, height: usize, width: usize) -> Result<(), StandardizationError>
    {
        if height < self.min_dimension || width < self.min_dimension
        {
            return Err(StandardizationError::TooSmall { height, width, minimum: self.min_dimension });
        }
        Ok(())
    }
}

/// Returns the values at the two given percentiles (fractions in [0, 1]).
fn percentiles(pixels: &Array2<f32>, lower: f32, upper: f32) -> (f32, f32)
{
    let mut values: Vec<f32> = pixels.iter().copied().collect();
    let last = values.len() - 1;
    let lower_index = ((last as f32) * lower).round() as usize;
    let upper_index = ((last as f32) * upper).round() as usize;
    let (_, upper_value, _) = values.select_nth_unstable_by(upper_index, |a, b| a.total_cmp(b));
    let upper_value = *upper_value;
    let (_, lower_value, _) = values.select_nth_unstable_by(lower_index, |a, b| a.total_cmp(b));
    (*lower_value, upper_value)
}

/// Inclusive (top, bottom, left, right) bounds of the pixels above `threshold`.
fn foreground_bounds(pixels: &Array2<f32>, threshold: f32) -> Option<(usize, usize, usize, usize)>
{
    let rows: Vec<usize> = pixels
        .axis_iter(Axis(0))
        .enumerate()
        .filter(|(_, row)| row.iter().any(|v| *v > threshold))
        .map(|(i, _)| i)
        .collect();
    let columns: Vec<usize> = pixels
        .axis_iter(Axis(1))
        .enumerate()
        .filter(|(_, column)| column.iter().any(|v| *v > threshold))
        .map(|(i, _)| i)
        .collect();
    Some((*rows.first()?, *rows.last()?, *columns.first()?, *columns.last()?))
}

/// Min-max rescales to the full 8-bit range.
/// A constant plane (max == min) has no range to stretch and becomes all zero.
/// Rounds to nearest, so normalizing an already normalized image changes nothing.
pub fn normalize_to_u8(pixels: &Array2<f32>) -> GrayImage
{
    let (min, max) = pixels
        .iter()
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    let range = max - min;
    // Also true for an empty or all-NaN plane, where the fold leaves an infinite or NaN range.
    let constant = !(range > 0.0);

    GrayImage::from_fn(pixels.ncols() as u32, pixels.nrows() as u32, |x, y| {
        if constant
        {
            return Luma([0]);
        }
        let value = pixels[[y as usize, x as usize]];
        let scaled = ((value - min) as f64 / range as f64 * 255.0).round().clamp(0.0, 255.0);
        // NaN saturates to 0.
        Luma([scaled as u8])
    })
}

pub fn gray_to_array(image: &GrayImage) -> Array2<f32>
{
    Array2::from_shape_fn((image.height() as usize, image.width() as usize), |(y, x)| {
        image.get_pixel(x as u32, y as u32).0[0] as f32
    })
}

/// Rotates a plane 90 degrees clockwise.
pub fn rotate_clockwise(pixels: &Array2<f32>) -> Array2<f32>
{
    let mut rotated = pixels.view().reversed_axes();
    rotated.invert_axis(Axis(1));
    rotated.to_owned()
}

/// Plain resize used when the standardization algorithm gives up on an image.
fn fallback_resize(decoded: &DecodedImage, size: u32) -> GrayImage
{
    let normalized = normalize_to_u8(&decoded.pixels);
    imageops::resize(&normalized, size, size, FilterType::Lanczos3)
}

pub struct StandardizationEngine
{
    algorithm: Arc<dyn StandardizationAlgorithm>,
    target_size: u32,
    default_spacing: (f64, f64),
}

impl StandardizationEngine
{
    pub fn new(algorithm: Arc<dyn StandardizationAlgorithm>, target_size: u32, default_spacing: (f64, f64)) -> Self
    {
        StandardizationEngine { algorithm, target_size, default_spacing }
    }

    pub fn default_spacing(&self) -> (f64, f64)
    {
        self.default_spacing
    }

    /// Recognizes, decodes and standardizes an upload.
    pub fn standardize(&self, input: &RawInput) -> Result<StandardizedImage, Error>
    {
        let format = dispatch::recognize(input)?;
        let decoded = dispatch::decode(input, format, self.default_spacing)?;
        debug!(
            "[{}] Decoded {} as {}x{} {:?}, spacing {:?}",
            input.request_id, input.filename, decoded.height(), decoded.width(), format, decoded.spacing
        );
        self.standardize_decoded(&decoded, format.strategy())
    }

    pub fn standardize_decoded(&self, decoded: &DecodedImage, strategy: Strategy) -> Result<StandardizedImage, Error>
    {
        match strategy
        {
            Strategy::PreStandardized => {
                // The volumetric writer and our reader disagree on axis order by a quarter turn.
                let rotated = rotate_clockwise(&decoded.pixels);
                Ok(StandardizedImage::new(normalize_to_u8(&rotated), strategy, false))
            },
            Strategy::FullStandardization => {
                let standardized = self.algorithm
                    .run(&decoded.pixels, decoded.spacing)
                    .map_err(|e| Error::Preprocessing(format!("standardization failed: {}", e)))?;
                Ok(StandardizedImage::new(normalize_to_u8(&standardized.pixels), strategy, false))
            },
            Strategy::FullStandardizationWithFallback => {
                match self.algorithm.run(&decoded.pixels, decoded.spacing)
                {
                    Ok(standardized) => Ok(StandardizedImage::new(normalize_to_u8(&standardized.pixels), strategy, false)),
                    Err(e) => {
                        warn!(
                            "Standardization failed ({}), using fallback: simple resize to {}x{}",
                            e, self.target_size, self.target_size
                        );
                        // Resampling can leave the range short of 0..255 again.
                        let resized = normalize_to_u8(&gray_to_array(&fallback_resize(decoded, self.target_size)));
                        Ok(StandardizedImage::new(resized, strategy, true))
                    }
                }
            },
        }
    }
}
