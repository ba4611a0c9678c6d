use std::path::{Path, PathBuf};

use image::GrayImage;
use ndarray::{Array2, Array4};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::PredictorKind;
use crate::dispatch::Strategy;
use crate::error::{Error, ErrorRecord};
use crate::junk_drawer;

/// An uploaded file as the transport layer hands it to us.
/// Created per request and dropped once standardization has finished with it.
#[derive(Debug, Clone)]
pub struct RawInput
{
    /// Used to correlate log lines of a single request.
    pub request_id: Uuid,
    pub filename: String,
    pub bytes: Vec<u8>,
    /// Where the bytes were read from, if they came from disk.
    /// Detached MetaImage data files are resolved relative to this path.
    pub origin: Option<PathBuf>,
}

impl RawInput
{
    pub fn from_bytes(filename: impl Into<String>, bytes: Vec<u8>) -> Self
    {
        RawInput {
            request_id: Uuid::new_v4(),
            filename: filename.into(),
            bytes,
            origin: None,
        }
    }

    pub fn from_path(path: &Path) -> std::io::Result<Self>
    {
        let bytes = std::fs::read(path)?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(RawInput {
            request_id: Uuid::new_v4(),
            filename,
            bytes,
            origin: Some(path.to_path_buf()),
        })
    }

    /// The lowercased extension of the declared filename, including the leading dot.
    pub fn extension(&self) -> Option<String>
    {
        junk_drawer::lowercase_extension(&self.filename)
    }
}

/// A single greyscale intensity plane pulled out of whatever container the upload used.
/// Rows are the first axis.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedImage
{
    pub pixels: Array2<f32>,
    /// Physical (row, column) pixel spacing in millimetres.
    pub spacing: (f64, f64),
}

impl DecodedImage
{
    pub fn height(&self) -> usize
    {
        self.pixels.nrows()
    }

    pub fn width(&self) -> usize
    {
        self.pixels.ncols()
    }
}

/// The canonical image the classifier sees (after tensor preparation) and the user sees.
/// Always min-max normalized to the full 8-bit range, or all zero for constant inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct StandardizedImage
{
    image: GrayImage,
    strategy: Strategy,
    used_fallback: bool,
}

impl StandardizedImage
{
    pub(crate) fn new(image: GrayImage, strategy: Strategy, used_fallback: bool) -> Self
    {
        StandardizedImage { image, strategy, used_fallback }
    }

    pub fn image(&self) -> &GrayImage
    {
        &self.image
    }

    pub fn strategy(&self) -> Strategy
    {
        self.strategy
    }

    /// True if the standardization algorithm failed and the plain resize was used instead.
    pub fn used_fallback(&self) -> bool
    {
        self.used_fallback
    }

    pub fn dimensions(&self) -> (u32, u32)
    {
        self.image.dimensions()
    }
}

/// Normalized classifier input of shape (1, 3, 224, 224).
/// The leading axis is a batch of one; we never batch requests.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInputTensor(pub(crate) Array4<f32>);

impl ModelInputTensor
{
    pub fn as_array(&self) -> &Array4<f32>
    {
        &self.0
    }

    pub fn into_array(self) -> Array4<f32>
    {
        self.0
    }
}

/// Coarse relevance scores in [0, 1] at the resolution of the classifier's last spatial block.
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionMap(pub(crate) Array2<f32>);

impl AttentionMap
{
    pub fn values(&self) -> &Array2<f32>
    {
        &self.0
    }

    pub fn dim(&self) -> (usize, usize)
    {
        self.0.dim()
    }
}

pub const CLASS_NAMES: [&str; 2] = ["No Nodule", "Nodule Detected"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassLabel
{
    #[serde(rename = "No Nodule")]
    NoNodule,
    #[serde(rename = "Nodule Detected")]
    NoduleDetected,
}

impl ClassLabel
{
    pub fn from_index(index: usize) -> Option<ClassLabel>
    {
        match index
        {
            0 => Some(ClassLabel::NoNodule),
            1 => Some(ClassLabel::NoduleDetected),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str
    {
        match self
        {
            ClassLabel::NoNodule => CLASS_NAMES[0],
            ClassLabel::NoduleDetected => CLASS_NAMES[1],
        }
    }
}

/// A successful classification, with whatever images could be produced for it.
/// `preview_image` is the heatmap overlay when one exists, otherwise the standardized image.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Classification
{
    pub prediction: ClassLabel,
    /// Probability of `prediction`, rounded to 4 decimal places.
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_image: Option<String>,
    pub has_heatmap: bool,
    /// Set when the label is reported but the overlay could not be produced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visualization_error: Option<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum PredictionResult
{
    Classified(Classification),
    Failed(ErrorRecord),
}

impl PredictionResult
{
    pub fn classification(&self) -> Option<&Classification>
    {
        match self
        {
            PredictionResult::Classified(classification) => Some(classification),
            PredictionResult::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorRecord>
    {
        match self
        {
            PredictionResult::Classified(_) => None,
            PredictionResult::Failed(record) => Some(record),
        }
    }
}

impl From<Error> for PredictionResult
{
    fn from(error: Error) -> Self
    {
        PredictionResult::Failed(error.to_record())
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum PreviewResult
{
    Ready { preview_image: String },
    Failed(ErrorRecord),
}

impl From<Error> for PreviewResult
{
    fn from(error: Error) -> Self
    {
        PreviewResult::Failed(error.to_record())
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ServiceStatus
{
    pub message: String,
    pub active_predictor: PredictorKind,
}
