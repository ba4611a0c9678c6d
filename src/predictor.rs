use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};

use crate::attention;
use crate::classifier::{self, CapturedFeatures, Classifier};
use crate::config::{PredictorKind, Settings, VisualizationFailurePolicy};
use crate::dispatch;
use crate::encoding;
use crate::error::Error;
use crate::heatmap;
use crate::models::{ClassLabel, Classification, ModelInputTensor, PredictionResult, PreviewResult, RawInput, StandardizedImage};
use crate::preprocessing;
use crate::standardize::{normalize_to_u8, StandardizationAlgorithm, StandardizationEngine};

/// One way of turning an upload into a prediction.
/// A single implementation is selected at startup and shared by every request.
pub trait Predictor: Send + Sync
{
    fn kind(&self) -> PredictorKind;

    /// The image the user would be shown, without running the classifier.
    fn preview(&self, input: &RawInput) -> PreviewResult;

    fn predict(&self, input: &RawInput) -> PredictionResult;
}

pub fn build_predictor(
    settings: &Settings,
    classifier: Arc<dyn Classifier>,
    algorithm: Arc<dyn StandardizationAlgorithm>,
) -> Box<dyn Predictor>
{
    match settings.predictor
    {
        PredictorKind::Baseline => Box::new(BaselinePredictor::new(classifier, settings.default_spacing)),
        PredictorKind::Spatial => Box::new(SpatialPredictor::new(
            StandardizationEngine::new(algorithm, settings.standardized_size, settings.default_spacing),
            classifier,
            settings.visualization_failure,
        )),
    }
}

/// Classifies the decoded image as is: no standardization, no heatmap.
pub struct BaselinePredictor
{
    classifier: Arc<dyn Classifier>,
    default_spacing: (f64, f64),
}

impl BaselinePredictor
{
    pub fn new(classifier: Arc<dyn Classifier>, default_spacing: (f64, f64)) -> Self
    {
        BaselinePredictor { classifier, default_spacing }
    }

    fn normalized(&self, input: &RawInput) -> Result<StandardizedImage, Error>
    {
        let format = dispatch::recognize(input)?;
        let decoded = dispatch::decode(input, format, self.default_spacing)?;
        Ok(StandardizedImage::new(normalize_to_u8(&decoded.pixels), format.strategy(), false))
    }

    fn try_predict(&self, input: &RawInput) -> Result<Classification, Error>
    {
        let image = self.normalized(input)?;
        let tensor = preprocessing::prepare_tensor(&image)?;
        let (prediction, confidence) = classifier::classify(self.classifier.as_ref(), &tensor)?;
        let preview = encoding::gray_to_data_url(image.image())?;

        Ok(Classification {
            prediction,
            confidence,
            preview_image: Some(preview),
            original_image: None,
            has_heatmap: false,
            visualization_error: None,
        })
    }
}

impl Predictor for BaselinePredictor
{
    fn kind(&self) -> PredictorKind
    {
        PredictorKind::Baseline
    }

    fn preview(&self, input: &RawInput) -> PreviewResult
    {
        match self.normalized(input).and_then(|image| Ok(encoding::gray_to_data_url(image.image())?))
        {
            Ok(preview_image) => PreviewResult::Ready { preview_image },
            Err(e) => e.into(),
        }
    }

    fn predict(&self, input: &RawInput) -> PredictionResult
    {
        match self.try_predict(input)
        {
            Ok(classification) => PredictionResult::Classified(classification),
            Err(e) => e.into(),
        }
    }
}

/// The full pipeline: standardize, classify, then overlay the attention map on the standardized image.
pub struct SpatialPredictor
{
    engine: StandardizationEngine,
    classifier: Arc<dyn Classifier>,
    policy: VisualizationFailurePolicy,
}

impl SpatialPredictor
{
    pub fn new(engine: StandardizationEngine, classifier: Arc<dyn Classifier>, policy: VisualizationFailurePolicy) -> Self
    {
        SpatialPredictor { engine, classifier, policy }
    }

    fn try_predict(&self, input: &RawInput) -> Result<Classification, Error>
    {
        let start = Instant::now();
        // The overlay is drawn on this image, never on the raw upload.
        let standardized = self.engine.standardize(input)?;
        info!(
            "[{}] Standardized to {:?} ({:?}, fallback: {}) in {:?}",
            input.request_id, standardized.dimensions(), standardized.strategy(), standardized.used_fallback(), start.elapsed()
        );

        let start = Instant::now();
        let tensor = preprocessing::prepare_tensor(&standardized)?;
        let (prediction, confidence, captured) = classifier::classify_pass(self.classifier.as_ref(), &tensor)?;
        info!("[{}] Classified as {:?} ({}) in {:?}", input.request_id, prediction, confidence, start.elapsed());

        let start = Instant::now();
        let original = encoding::gray_to_data_url(standardized.image()).map_err(Error::from);
        let classification = self.report(input, prediction, confidence, original, || {
            self.visualize(&standardized, &tensor, captured)
        })?;
        if classification.has_heatmap
        {
            debug!("[{}] Heatmap ready in {:?}", input.request_id, start.elapsed());
        }
        Ok(classification)
    }

    /// Applies the failure policy to everything rendered after classification succeeded.
    /// The overlay is only drawn once the original image has been encoded.
    fn report(
        &self,
        input: &RawInput,
        prediction: ClassLabel,
        confidence: f64,
        original: Result<String, Error>,
        overlay: impl FnOnce() -> Result<String, Error>,
    ) -> Result<Classification, Error>
    {
        let (original, overlay) = match original
        {
            Ok(original) => {
                let overlay = overlay();
                (Some(original), overlay)
            },
            Err(e) => (None, Err(e)),
        };

        match overlay
        {
            Ok(overlay) => Ok(Classification {
                prediction,
                confidence,
                preview_image: Some(overlay),
                original_image: original,
                has_heatmap: true,
                visualization_error: None,
            }),
            Err(e) => match self.policy
            {
                VisualizationFailurePolicy::PartialSuccess => {
                    warn!("[{}] Reporting classification without heatmap: {}", input.request_id, e);
                    Ok(Classification {
                        prediction,
                        confidence,
                        preview_image: original.clone(),
                        original_image: original,
                        has_heatmap: false,
                        visualization_error: Some(e.to_string()),
                    })
                },
                VisualizationFailurePolicy::FailRequest => Err(e),
            },
        }
    }

    fn visualize(&self, standardized: &StandardizedImage, tensor: &ModelInputTensor, captured: CapturedFeatures) -> Result<String, Error>
    {
        let attention = attention::extract_with(self.classifier.as_ref(), tensor, captured)?;
        let overlay = heatmap::composite(standardized, &attention)?;
        Ok(encoding::rgb_to_data_url(&overlay)?)
    }
}

impl Predictor for SpatialPredictor
{
    fn kind(&self) -> PredictorKind
    {
        PredictorKind::Spatial
    }

    fn preview(&self, input: &RawInput) -> PreviewResult
    {
        let result = self.engine
            .standardize(input)
            .and_then(|standardized| Ok(encoding::gray_to_data_url(standardized.image())?));
        match result
        {
            Ok(preview_image) => PreviewResult::Ready { preview_image },
            Err(e) => e.into(),
        }
    }

    fn predict(&self, input: &RawInput) -> PredictionResult
    {
        match self.try_predict(input)
        {
            Ok(classification) => PredictionResult::Classified(classification),
            Err(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests
{
    use std::sync::atomic::{AtomicUsize, Ordering};

    use image::{DynamicImage, GrayImage, ImageFormat, Luma};
    use ndarray::{Array2, Array3};

    use super::*;
    use crate::classifier::tests::{PoolingClassifier, GRID};
    use crate::classifier::{ForwardPass, SpatialFeatureTap, LAST_SPATIAL_BLOCK};
    use crate::dicom::tests::dicom_u8;
    use crate::error::PipelineStage;
    use crate::metaimage::tests::mha_u8;
    use crate::raster::tests::encode;
    use crate::standardize::tests::{engine_with, FailingAlgorithm};
    use crate::standardize::{CxrStandardizer, STANDARDIZED_SIZE};

    fn spatial(classifier: PoolingClassifier, policy: VisualizationFailurePolicy) -> SpatialPredictor
    {
        SpatialPredictor::new(engine_with(Arc::new(CxrStandardizer::default())), Arc::new(classifier), policy)
    }

    /// Bright square field with a horizontal ramp, on a black border.
    fn chest_pixels(side: usize) -> Vec<u8>
    {
        (0..side * side)
            .map(|i| {
                let (y, x) = (i / side, i % side);
                let inside = (side / 8..side - side / 8).contains(&y) && (side / 8..side - side / 8).contains(&x);
                if inside { 64 + (x * 2) as u8 } else { 0 }
            })
            .collect()
    }

    fn decoded_dimensions(data_url: &str) -> (u32, u32)
    {
        let image = encoding::decode_data_url(data_url).unwrap();
        (image.width(), image.height())
    }

    #[test]
    fn uniform_jpeg_gives_an_all_blue_overlay()
    {
        let flat = GrayImage::from_pixel(512, 512, Luma([128]));
        let input = RawInput::from_bytes("flat.jpg", encode(DynamicImage::ImageLuma8(flat), ImageFormat::Jpeg));

        let result = spatial(PoolingClassifier::spatial(), VisualizationFailurePolicy::PartialSuccess).predict(&input);
        let classification = result.classification().unwrap();
        assert!((0.0..=1.0).contains(&classification.confidence));
        assert!(classification.has_heatmap);

        let overlay = encoding::decode_data_url(classification.preview_image.as_deref().unwrap()).unwrap().to_rgb8();
        assert_eq!(overlay.dimensions(), (STANDARDIZED_SIZE, STANDARDIZED_SIZE));
        assert!(overlay.pixels().all(|p| p.0 == [0, 0, 51]));
    }

    #[test]
    fn overlay_is_aligned_to_the_standardized_image_for_every_format()
    {
        let side = 64;
        let png = encode(
            DynamicImage::ImageLuma8(GrayImage::from_raw(side as u32, side as u32, chest_pixels(side)).unwrap()),
            ImageFormat::Png);
        let inputs = vec![
            RawInput::from_bytes("volume.mha", mha_u8(48, 32, &chest_pixels(48)[..48 * 32])),
            RawInput::from_bytes("study.dcm", dicom_u8(side as u16, side as u16, chest_pixels(side), "MONOCHROME2", Some(["0.5", "0.5"]))),
            RawInput::from_bytes("photo.png", png),
        ];

        let predictor = spatial(PoolingClassifier::spatial(), VisualizationFailurePolicy::FailRequest);
        for input in inputs
        {
            let result = predictor.predict(&input);
            let classification = result
                .classification()
                .unwrap_or_else(|| panic!("{} failed: {:?}", input.filename, result.error()));
            assert!(classification.has_heatmap, "{}", input.filename);
            assert_eq!(
                decoded_dimensions(classification.preview_image.as_deref().unwrap()),
                decoded_dimensions(classification.original_image.as_deref().unwrap()),
                "{}", input.filename);
        }
    }

    #[test]
    fn pre_standardized_volume_keeps_its_rotated_resolution()
    {
        let input = RawInput::from_bytes("volume.mhd", mha_u8(48, 32, &chest_pixels(48)[..48 * 32]));
        let result = spatial(PoolingClassifier::spatial(), VisualizationFailurePolicy::FailRequest).predict(&input);
        let classification = result.classification().unwrap();
        assert_eq!(decoded_dimensions(classification.preview_image.as_deref().unwrap()), (32, 48));
    }

    #[test]
    fn standardization_fallback_still_produces_an_overlay()
    {
        let png = encode(
            DynamicImage::ImageLuma8(GrayImage::from_raw(64, 64, chest_pixels(64)).unwrap()),
            ImageFormat::Png);
        let predictor = SpatialPredictor::new(
            engine_with(Arc::new(FailingAlgorithm)),
            Arc::new(PoolingClassifier::spatial()),
            VisualizationFailurePolicy::FailRequest);

        let result = predictor.predict(&RawInput::from_bytes("photo.PNG", png));
        let classification = result.classification().unwrap();
        assert!(classification.has_heatmap);
        assert_eq!(
            decoded_dimensions(classification.preview_image.as_deref().unwrap()),
            (STANDARDIZED_SIZE, STANDARDIZED_SIZE));
    }

    #[test]
    fn visualization_failure_is_partial_success_by_default()
    {
        let input = RawInput::from_bytes("flat.png", encode(DynamicImage::ImageLuma8(GrayImage::new(64, 64)), ImageFormat::Png));
        let result = spatial(PoolingClassifier::default(), VisualizationFailurePolicy::default()).predict(&input);

        let classification = result.classification().unwrap();
        assert!(!classification.has_heatmap);
        assert!(classification.visualization_error.as_deref().unwrap().starts_with("Visualization failed"));
        assert_eq!(classification.preview_image, classification.original_image);
        assert!(classification.preview_image.is_some());
    }

    #[test]
    fn visualization_failure_can_fail_the_request()
    {
        let input = RawInput::from_bytes("flat.png", encode(DynamicImage::ImageLuma8(GrayImage::new(64, 64)), ImageFormat::Png));
        let classifier = PoolingClassifier { with_tap: true, fail_attention: true, ..Default::default() };
        let result = spatial(classifier, VisualizationFailurePolicy::FailRequest).predict(&input);
        assert_eq!(result.error().unwrap().stage, PipelineStage::Visualization);
    }

    /// Captures its spatial block in the forward pass and counts how often the model runs.
    #[derive(Default)]
    struct CountingClassifier
    {
        runs: AtomicUsize,
    }

    impl Classifier for CountingClassifier
    {
        fn forward(&self, input: &ModelInputTensor) -> anyhow::Result<Array2<f32>>
        {
            Ok(self.forward_pass(input)?.logits)
        }

        fn forward_pass(&self, input: &ModelInputTensor) -> anyhow::Result<ForwardPass>
        {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(ForwardPass {
                logits: PoolingClassifier::default().forward(input)?,
                features: CapturedFeatures { spatial: Some(PoolingClassifier::pool(input, GRID)), ..Default::default() },
            })
        }

        fn spatial_tap(&self) -> Option<&dyn SpatialFeatureTap>
        {
            Some(self)
        }
    }

    impl SpatialFeatureTap for CountingClassifier
    {
        fn block_name(&self) -> &str
        {
            LAST_SPATIAL_BLOCK
        }

        fn last_spatial_block(&self, input: &ModelInputTensor) -> anyhow::Result<Array3<f32>>
        {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(PoolingClassifier::pool(input, GRID))
        }
    }

    #[test]
    fn heatmap_reuses_the_classification_pass()
    {
        let classifier = Arc::new(CountingClassifier::default());
        let predictor = SpatialPredictor::new(
            engine_with(Arc::new(CxrStandardizer::default())),
            classifier.clone(),
            VisualizationFailurePolicy::FailRequest);
        let png = encode(
            DynamicImage::ImageLuma8(GrayImage::from_raw(64, 64, chest_pixels(64)).unwrap()),
            ImageFormat::Png);

        let result = predictor.predict(&RawInput::from_bytes("photo.png", png));
        assert!(result.classification().unwrap().has_heatmap);
        assert_eq!(classifier.runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unencodable_original_follows_the_failure_policy()
    {
        let input = RawInput::from_bytes("photo.png", vec![]);
        let encoding_failure = || Err(Error::Visualization("PNG encoding failed".to_string()));

        let predictor = spatial(PoolingClassifier::spatial(), VisualizationFailurePolicy::PartialSuccess);
        let classification = predictor
            .report(&input, ClassLabel::NoduleDetected, 0.9, encoding_failure(), || unreachable!())
            .unwrap();
        assert_eq!(classification.prediction, ClassLabel::NoduleDetected);
        assert!(!classification.has_heatmap);
        assert!(classification.preview_image.is_none());
        assert!(classification.visualization_error.unwrap().contains("PNG encoding failed"));

        let predictor = spatial(PoolingClassifier::spatial(), VisualizationFailurePolicy::FailRequest);
        let result = predictor.report(&input, ClassLabel::NoduleDetected, 0.9, encoding_failure(), || unreachable!());
        assert!(matches!(result, Err(Error::Visualization(_))));
    }

    #[test]
    fn failures_are_reported_with_their_stage()
    {
        let predictor = spatial(PoolingClassifier::spatial(), VisualizationFailurePolicy::PartialSuccess);

        let result = predictor.predict(&RawInput::from_bytes("notes.txt", b"hello".to_vec()));
        assert_eq!(result.error().unwrap().stage, PipelineStage::Dispatch);

        let result = predictor.predict(&RawInput::from_bytes("broken.png", b"not a png".to_vec()));
        assert_eq!(result.error().unwrap().stage, PipelineStage::Preprocessing);

        let failing = spatial(PoolingClassifier { fail_forward: true, with_tap: true, ..Default::default() }, VisualizationFailurePolicy::PartialSuccess);
        let input = RawInput::from_bytes("flat.png", encode(DynamicImage::ImageLuma8(GrayImage::new(64, 64)), ImageFormat::Png));
        assert_eq!(failing.predict(&input).error().unwrap().stage, PipelineStage::Inference);
    }

    #[test]
    fn baseline_classifies_the_decoded_image_without_heatmap()
    {
        let predictor = BaselinePredictor::new(Arc::new(PoolingClassifier::spatial()), (0.143, 0.143));
        let png = encode(
            DynamicImage::ImageLuma8(GrayImage::from_raw(64, 64, chest_pixels(64)).unwrap()),
            ImageFormat::Png);
        let input = RawInput::from_bytes("photo.png", png);

        let result = predictor.predict(&input);
        let classification = result.classification().unwrap();
        assert!(!classification.has_heatmap);
        assert!(classification.original_image.is_none());
        assert_eq!(decoded_dimensions(classification.preview_image.as_deref().unwrap()), (64, 64));

        match predictor.preview(&input)
        {
            PreviewResult::Ready { preview_image } => assert_eq!(decoded_dimensions(&preview_image), (64, 64)),
            PreviewResult::Failed(record) => panic!("preview failed: {:?}", record),
        }
    }

    #[test]
    fn spatial_preview_is_the_standardized_image()
    {
        let predictor = spatial(PoolingClassifier::default(), VisualizationFailurePolicy::PartialSuccess);
        let png = encode(
            DynamicImage::ImageLuma8(GrayImage::from_raw(64, 64, chest_pixels(64)).unwrap()),
            ImageFormat::Png);
        match predictor.preview(&RawInput::from_bytes("photo.png", png))
        {
            PreviewResult::Ready { preview_image } => {
                assert_eq!(decoded_dimensions(&preview_image), (STANDARDIZED_SIZE, STANDARDIZED_SIZE));
            },
            PreviewResult::Failed(record) => panic!("preview failed: {:?}", record),
        }

        let failed = predictor.preview(&RawInput::from_bytes("scan.gif", vec![]));
        assert!(matches!(failed, PreviewResult::Failed(ref record) if record.stage == PipelineStage::Dispatch));
    }

    #[test]
    fn build_predictor_follows_settings()
    {
        let classifier: Arc<dyn Classifier> = Arc::new(PoolingClassifier::spatial());
        let algorithm: Arc<dyn StandardizationAlgorithm> = Arc::new(CxrStandardizer::default());
        let baseline = Settings { predictor: PredictorKind::Baseline, ..Settings::default() };
        assert_eq!(build_predictor(&baseline, classifier.clone(), algorithm.clone()).kind(), PredictorKind::Baseline);
        assert_eq!(build_predictor(&Settings::default(), classifier, algorithm).kind(), PredictorKind::Spatial);
    }
}
