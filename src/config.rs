use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::classifier::{OutputNames, LAST_SPATIAL_BLOCK};
use crate::standardize::{DEFAULT_PIXEL_SPACING, STANDARDIZED_SIZE};

/// The predictor implementation serving requests. Chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum PredictorKind
{
    /// Decode, normalize and classify; no standardization and no heatmap.
    #[serde(alias = "predict_nodule")]
    #[value(alias = "predict_nodule")]
    Baseline,
    /// The full standardization, classification and attention overlay pipeline.
    #[serde(alias = "predict_nodule_spatial")]
    #[value(alias = "predict_nodule_spatial")]
    Spatial,
}

impl PredictorKind
{
    pub fn name(&self) -> &'static str
    {
        match self
        {
            PredictorKind::Baseline => "baseline",
            PredictorKind::Spatial => "spatial",
        }
    }
}

impl fmt::Display for PredictorKind
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(self.name())
    }
}

impl FromStr for PredictorKind
{
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        <PredictorKind as ValueEnum>::from_str(s.trim(), true)
            .map_err(|_| ConfigError::UnknownPredictor(s.to_string()))
    }
}

/// What to report when the classification succeeded but the overlay could not be produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum VisualizationFailurePolicy
{
    /// Report the label and confidence, without a heatmap, plus the visualization error.
    #[default]
    PartialSuccess,
    /// Fail the whole request with a visualization-stage error.
    FailRequest,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError
{
    #[error("unknown predictor {0:?}; expected one of: baseline, spatial, predict_nodule, predict_nodule_spatial")]
    UnknownPredictor(String),
    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings
{
    pub predictor: PredictorKind,
    pub model_path: PathBuf,
    pub logits_output: String,
    /// Output exposing the last spatial block's activations; `None` if the export dropped it.
    pub spatial_output: Option<String>,
    /// Output of a dedicated attention head; selects the WSOD classifier when set.
    pub attention_output: Option<String>,
    pub intra_threads: usize,
    /// (row, column) spacing in millimetres for inputs without spacing metadata.
    pub default_spacing: (f64, f64),
    pub standardized_size: u32,
    pub visualization_failure: VisualizationFailurePolicy,
}

impl Default for Settings
{
    fn default() -> Self
    {
        Settings {
            predictor: PredictorKind::Spatial,
            model_path: PathBuf::from("models").join("nodule_resnet50.onnx"),
            logits_output: "logits".to_string(),
            spatial_output: Some(LAST_SPATIAL_BLOCK.to_string()),
            attention_output: None,
            intra_threads: 4,
            default_spacing: DEFAULT_PIXEL_SPACING,
            standardized_size: STANDARDIZED_SIZE,
            visualization_failure: VisualizationFailurePolicy::default(),
        }
    }
}

impl Settings
{
    /// Checked once before any shared state is built; invalid settings abort startup.
    pub fn validate(&self) -> Result<(), ConfigError>
    {
        if self.model_path.as_os_str().is_empty()
        {
            return Err(invalid("model_path", "must not be empty"));
        }
        if self.logits_output.trim().is_empty()
        {
            return Err(invalid("logits_output", "must not be empty"));
        }
        if self.intra_threads == 0
        {
            return Err(invalid("intra_threads", "must be at least 1"));
        }
        let (row, column) = self.default_spacing;
        if !(row.is_finite() && column.is_finite() && row > 0.0 && column > 0.0)
        {
            return Err(invalid("default_spacing", &format!("{:?} is not a positive spacing", self.default_spacing)));
        }
        if self.standardized_size < 224
        {
            return Err(invalid("standardized_size", "must be at least the 224 px model input"));
        }
        if self.predictor == PredictorKind::Spatial && self.spatial_output.is_none() && self.attention_output.is_none()
        {
            return Err(invalid("spatial_output", "the spatial predictor needs a spatial or attention output"));
        }
        Ok(())
    }

    pub fn output_names(&self) -> OutputNames
    {
        OutputNames {
            logits: self.logits_output.clone(),
            spatial: self.spatial_output.clone(),
            attention: self.attention_output.clone(),
        }
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError
{
    ConfigError::Invalid { field, reason: reason.to_string() }
}
