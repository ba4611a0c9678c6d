use std::path::Path;

use log::{error, info};

use crate::error::Error;
use crate::models::{PredictionResult, PreviewResult, RawInput, ServiceStatus};
use crate::state::InferenceState;

pub const STATUS_MESSAGE: &str = "Nodule detection API running";

pub fn status(state: &InferenceState) -> ServiceStatus
{
    ServiceStatus {
        message: STATUS_MESSAGE.to_string(),
        active_predictor: state.predictor().kind(),
    }
}

/// The image the user will be shown for this upload, without classifying it.
pub fn preview(state: &InferenceState, filename: &str, bytes: Vec<u8>) -> PreviewResult
{
    run_preview(state, RawInput::from_bytes(filename, bytes))
}

pub fn preview_file(state: &InferenceState, path: &Path) -> PreviewResult
{
    match RawInput::from_path(path)
    {
        Ok(input) => run_preview(state, input),
        Err(e) => {
            error!("Could not read {:?}: {}", path, e);
            Error::from(e).into()
        }
    }
}

fn run_preview(state: &InferenceState, input: RawInput) -> PreviewResult
{
    info!("[{}] Preview requested for {:?} ({} bytes)", input.request_id, input.filename, input.bytes.len());

    let now = std::time::Instant::now();
    let result = state.predictor().preview(&input);
    if let PreviewResult::Failed(record) = &result
    {
        error!("[{}] Preview failed at {:?}: {}", input.request_id, record.stage, record.error);
    }
    info!("[{}] Preview took {:?}", input.request_id, now.elapsed());
    result
}

/// Classifies an upload and, for the spatial predictor, overlays its attention heatmap.
/// Never panics on bad input; every failure comes back as an error record.
pub fn predict(state: &InferenceState, filename: &str, bytes: Vec<u8>) -> PredictionResult
{
    run_prediction(state, RawInput::from_bytes(filename, bytes))
}

/// Like [`predict`], for a file on disk. Detached MetaImage data files are resolved next to `path`.
pub fn predict_file(state: &InferenceState, path: &Path) -> PredictionResult
{
    match RawInput::from_path(path)
    {
        Ok(input) => run_prediction(state, input),
        Err(e) => {
            error!("Could not read {:?}: {}", path, e);
            Error::from(e).into()
        }
    }
}

fn run_prediction(state: &InferenceState, input: RawInput) -> PredictionResult
{
    info!(
        "[{}] Prediction requested for {:?} ({} bytes) with the {} predictor",
        input.request_id, input.filename, input.bytes.len(), state.predictor().kind()
    );

    let now = std::time::Instant::now();
    let result = state.predictor().predict(&input);
    let elapsed = now.elapsed();

    match &result
    {
        PredictionResult::Classified(classification) => info!(
            "[{}] {:?} with confidence {} (heatmap: {}) in {:?}",
            input.request_id, classification.prediction, classification.confidence, classification.has_heatmap, elapsed
        ),
        PredictionResult::Failed(record) => error!(
            "[{}] Prediction failed at {:?} after {:?}: {}",
            input.request_id, record.stage, elapsed, record.error
        ),
    }
    result
}
