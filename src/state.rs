use std::sync::Arc;

use log::info;

use crate::classifier::{Classifier, ResNetClassifier, WsodClassifier};
use crate::config::Settings;
use crate::predictor::{self, Predictor};
use crate::standardize::{CxrStandardizer, StandardizationAlgorithm};

/// Everything a request needs that outlives the request: the loaded classifier and the
/// standardization algorithm, wrapped in the predictor selected at startup.
/// Constructed once, shared read-only (it is `Sync`, so no lock is needed), dropped at shutdown.
pub struct InferenceState
{
    settings: Settings,
    predictor: Box<dyn Predictor>,
}

impl InferenceState
{
    /// Validates the settings and loads the ONNX model they point to.
    pub fn new(settings: Settings) -> anyhow::Result<Self>
    {
        settings.validate()?;

        let now = std::time::Instant::now();
        let outputs = settings.output_names();
        let classifier: Arc<dyn Classifier> = if outputs.attention.is_some() {
            Arc::new(WsodClassifier::new(&settings.model_path, outputs, settings.intra_threads)?)
        } else {
            Arc::new(ResNetClassifier::new(&settings.model_path, outputs, settings.intra_threads)?)
        };
        info!("Loaded classifier {:?} in {:?}", settings.model_path, now.elapsed());

        let algorithm = Arc::new(CxrStandardizer { target_size: settings.standardized_size, ..CxrStandardizer::default() });
        Self::with_components(settings, classifier, algorithm)
    }

    /// Builds the state around an already constructed classifier and algorithm.
    pub fn with_components(
        settings: Settings,
        classifier: Arc<dyn Classifier>,
        algorithm: Arc<dyn StandardizationAlgorithm>,
    ) -> anyhow::Result<Self>
    {
        settings.validate()?;
        let predictor = predictor::build_predictor(&settings, classifier, algorithm);
        info!("Active predictor: {}", predictor.kind());
        Ok(InferenceState { settings, predictor })
    }

    pub fn settings(&self) -> &Settings
    {
        &self.settings
    }

    pub fn predictor(&self) -> &dyn Predictor
    {
        self.predictor.as_ref()
    }
}
