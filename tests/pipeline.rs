use std::io::Cursor;
use std::sync::Arc;

use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use ndarray::{s, Array2, Array3};

use nodule_viz::classifier::{Classifier, SpatialFeatureTap, LAST_SPATIAL_BLOCK};
use nodule_viz::commands;
use nodule_viz::config::{PredictorKind, Settings};
use nodule_viz::encoding::decode_data_url;
use nodule_viz::error::PipelineStage;
use nodule_viz::models::{ModelInputTensor, PredictionResult, PreviewResult};
use nodule_viz::standardize::CxrStandardizer;
use nodule_viz::state::InferenceState;

/// Scores the mean of the top half against the bottom half and exposes a 7x7 pooled block.
struct HalvesClassifier;

impl Classifier for HalvesClassifier
{
    fn forward(&self, input: &ModelInputTensor) -> anyhow::Result<Array2<f32>>
    {
        let array = input.as_array();
        let top = array.slice(s![0, .., ..112, ..]).mean().unwrap_or(0.0);
        let bottom = array.slice(s![0, .., 112.., ..]).mean().unwrap_or(0.0);
        Ok(Array2::from_shape_vec((1, 2), vec![top, bottom])?)
    }

    fn spatial_tap(&self) -> Option<&dyn SpatialFeatureTap>
    {
        Some(self)
    }
}

impl SpatialFeatureTap for HalvesClassifier
{
    fn block_name(&self) -> &str
    {
        LAST_SPATIAL_BLOCK
    }

    fn last_spatial_block(&self, input: &ModelInputTensor) -> anyhow::Result<Array3<f32>>
    {
        let array = input.as_array();
        Ok(Array3::from_shape_fn((2, 7, 7), |(c, y, x)| {
            array.slice(s![0, c, y * 32..(y + 1) * 32, x * 32..(x + 1) * 32]).mean().unwrap_or(0.0)
        }))
    }
}

fn state(predictor: PredictorKind) -> InferenceState
{
    InferenceState::with_components(
        Settings { predictor, ..Settings::default() },
        Arc::new(HalvesClassifier),
        Arc::new(CxrStandardizer::default()),
    ).unwrap()
}

fn chest(width: u32, height: u32) -> GrayImage
{
    GrayImage::from_fn(width, height, |x, y| {
        let inside = x >= width / 8 && x < width - width / 8 && y >= height / 8 && y < height - height / 8;
        if inside { Luma([(40 + (x + y) % 200) as u8]) } else { Luma([0]) }
    })
}

fn encode(image: GrayImage, format: ImageFormat) -> Vec<u8>
{
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(image).write_to(&mut buffer, format).unwrap();
    buffer.into_inner()
}

#[test]
fn raster_upload_produces_an_aligned_overlay()
{
    let state = state(PredictorKind::Spatial);
    for (name, format) in [("chest.png", ImageFormat::Png), ("chest.JPEG", ImageFormat::Jpeg), ("chest.tif", ImageFormat::Tiff)]
    {
        let result = commands::predict(&state, name, encode(chest(200, 160), format));
        let PredictionResult::Classified(classification) = result else {
            panic!("{} failed: {:?}", name, result);
        };
        assert!((0.0..=1.0).contains(&classification.confidence));
        assert!(classification.has_heatmap);

        let overlay = decode_data_url(classification.preview_image.as_deref().unwrap()).unwrap();
        let original = decode_data_url(classification.original_image.as_deref().unwrap()).unwrap();
        assert_eq!((overlay.width(), overlay.height()), (1024, 1024));
        assert_eq!((original.width(), original.height()), (1024, 1024));
    }
}

#[test]
fn detached_metaimage_is_read_next_to_its_header()
{
    let dir = tempfile::tempdir().unwrap();
    let pixels: Vec<u8> = (0..40 * 24).map(|i| (i % 251) as u8).collect();
    std::fs::write(dir.path().join("scan.raw"), &pixels).unwrap();
    std::fs::write(
        dir.path().join("scan.mhd"),
        "ObjectType = Image\nNDims = 2\nDimSize = 40 24\nElementType = MET_UCHAR\nElementDataFile = scan.raw\n",
    ).unwrap();

    let state = state(PredictorKind::Spatial);
    let result = commands::predict_file(&state, &dir.path().join("scan.mhd"));
    let classification = result.classification().unwrap();
    let overlay = decode_data_url(classification.preview_image.as_deref().unwrap()).unwrap();
    // Quarter turn: 40 wide by 24 high becomes 24 wide by 40 high.
    assert_eq!((overlay.width(), overlay.height()), (24, 40));

    match commands::preview_file(&state, &dir.path().join("scan.mhd"))
    {
        PreviewResult::Ready { preview_image } => {
            let preview = decode_data_url(&preview_image).unwrap();
            assert_eq!((preview.width(), preview.height()), (24, 40));
        },
        PreviewResult::Failed(record) => panic!("preview failed: {:?}", record),
    }
}

#[test]
fn baseline_predictor_skips_the_heatmap()
{
    let state = state(PredictorKind::Baseline);
    let status = serde_json::to_value(commands::status(&state)).unwrap();
    assert_eq!(status["active_predictor"], "baseline");

    let result = commands::predict(&state, "chest.bmp", encode(chest(96, 80), ImageFormat::Bmp));
    let value = serde_json::to_value(&result).unwrap();
    assert_eq!(value["has_heatmap"], false);
    assert!(value.get("original_image").is_none());
    let preview = decode_data_url(value["preview_image"].as_str().unwrap()).unwrap();
    assert_eq!((preview.width(), preview.height()), (96, 80));
}

#[test]
fn bad_uploads_fail_with_a_stage_and_message()
{
    let state = state(PredictorKind::Spatial);

    let result = commands::predict(&state, "scan.nii", vec![0; 16]);
    assert_eq!(result.error().unwrap().stage, PipelineStage::Dispatch);

    let result = commands::predict(&state, "scan.dcm", b"not a dicom".to_vec());
    let value = serde_json::to_value(&result).unwrap();
    assert_eq!(value["stage"], "preprocessing");
    assert!(value["error"].as_str().unwrap().starts_with("Preprocessing failed"));
}
