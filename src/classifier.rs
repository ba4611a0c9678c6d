use std::path::Path;

use log::{debug, warn};
use ndarray::{Array2, Array3, ArrayD, Axis, Ix2, Ix3};
use ort::{self, inputs, CPUExecutionProvider, GraphOptimizationLevel};
use rustc_hash::FxHashMap;

use crate::error::Error;
use crate::junk_drawer;
use crate::models::{ClassLabel, ModelInputTensor, CLASS_NAMES};

/// Name of the last high-level spatial block of the ResNet backbone.
/// The spatial fallback of the attention extractor reads this block's output,
/// so it is tied to the architecture of the exported model, not a generic property.
pub const LAST_SPATIAL_BLOCK: &str = "layer4";

/// The trained classifier, as the pipeline sees it.
/// Implementations are loaded once and shared read-only between requests.
pub trait Classifier: Send + Sync
{
    /// Raw class scores of shape (batch, classes).
    fn forward(&self, input: &ModelInputTensor) -> anyhow::Result<Array2<f32>>;

    /// Class scores plus any intermediate outputs the same run produced.
    /// Classifiers that compute their attention inputs alongside the scores override this
    /// so the attention extractor does not have to run the model again.
    fn forward_pass(&self, input: &ModelInputTensor) -> anyhow::Result<ForwardPass>
    {
        Ok(ForwardPass { logits: self.forward(input)?, features: CapturedFeatures::default() })
    }

    /// The dedicated attention capability, if this classifier has one.
    fn attention_hook(&self) -> Option<&dyn HasAttentionHook>
    {
        None
    }

    /// The named extraction point for the last spatial block, if exposed.
    fn spatial_tap(&self) -> Option<&dyn SpatialFeatureTap>
    {
        None
    }
}

/// Classifiers trained with a built-in attention head (e.g. weakly supervised detectors).
pub trait HasAttentionHook
{
    /// A single-channel relevance map at the resolution of the attention head.
    fn attention(&self, input: &ModelInputTensor) -> anyhow::Result<Array2<f32>>;
}

/// Instrumentation boundary exposing the activations of the last spatial feature block.
pub trait SpatialFeatureTap
{
    fn block_name(&self) -> &str;

    /// Activations of shape (channels, height, width) for the single input in the batch.
    fn last_spatial_block(&self, input: &ModelInputTensor) -> anyhow::Result<Array3<f32>>;
}

/// Outputs of a single forward pass.
#[derive(Debug, Clone)]
pub struct ForwardPass
{
    pub logits: Array2<f32>,
    pub features: CapturedFeatures,
}

/// Attention inputs captured during a forward pass; `None` when the run did not produce them.
#[derive(Debug, Clone, Default)]
pub struct CapturedFeatures
{
    pub attention: Option<Array2<f32>>,
    /// (C, H, W) activations of [`LAST_SPATIAL_BLOCK`].
    pub spatial: Option<Array3<f32>>,
}

/// Runs the classifier and reduces its scores to a label and a confidence.
/// Confidence is the softmax probability of the winning class, rounded to 4 decimals.
pub fn classify(classifier: &dyn Classifier, input: &ModelInputTensor) -> Result<(ClassLabel, f64), Error>
{
    let logits = classifier
        .forward(input)
        .map_err(|e| Error::Inference(format!("{:#}", e)))?;
    label_scores(&logits)
}

/// Like [`classify`], keeping whatever attention inputs the forward pass captured.
pub fn classify_pass(classifier: &dyn Classifier, input: &ModelInputTensor) -> Result<(ClassLabel, f64, CapturedFeatures), Error>
{
    let pass = classifier
        .forward_pass(input)
        .map_err(|e| Error::Inference(format!("{:#}", e)))?;
    let (label, confidence) = label_scores(&pass.logits)?;
    Ok((label, confidence, pass.features))
}

fn label_scores(logits: &Array2<f32>) -> Result<(ClassLabel, f64), Error>
{
    if logits.nrows() != 1 || logits.ncols() != CLASS_NAMES.len()
    {
        return Err(Error::Inference(format!(
            "expected scores of shape [1, {}], got {:?}", CLASS_NAMES.len(), logits.shape())));
    }

    let probabilities = softmax(logits.row(0).iter().copied());
    let (index, probability) = probabilities
        .iter()
        .copied()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (i, p)| if p > best.1 { (i, p) } else { best });

    if !probability.is_finite()
    {
        return Err(Error::Inference(format!("non-finite class scores {:?}", logits.row(0))));
    }

    let label = ClassLabel::from_index(index)
        .ok_or_else(|| Error::Inference(format!("class index {} has no label", index)))?;

    Ok((label, junk_drawer::round_to(probability, 4)))
}

fn softmax(scores: impl Iterator<Item = f32>) -> Vec<f64>
{
    let scores: Vec<f64> = scores.map(f64::from).collect();
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Names of the graph outputs the exported model provides.
#[derive(Debug, Clone)]
pub struct OutputNames
{
    pub logits: String,
    /// Output carrying the activations of [`LAST_SPATIAL_BLOCK`], if the export kept it.
    pub spatial: Option<String>,
    /// Output of a dedicated attention head, if the model has one.
    pub attention: Option<String>,
}

impl OutputNames
{
    fn names(&self) -> impl Iterator<Item = &str>
    {
        std::iter::once(self.logits.as_str())
            .chain(self.spatial.as_deref())
            .chain(self.attention.as_deref())
    }
}

/// A loaded ONNX graph plus the names of its outputs.
struct OnnxModel
{
    session: ort::Session,
    outputs: OutputNames,
}

impl OnnxModel
{
    fn load(model_path: &Path, outputs: OutputNames, intra_threads: usize) -> Result<Self, ort::Error>
    {
        let session = ort::Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(intra_threads)?
            .with_execution_providers([CPUExecutionProvider::default().build()])?
            .commit_from_file(model_path)?;

        debug!("Loaded classifier from {:?} with outputs {:?}", model_path, outputs);
        Ok(OnnxModel { session, outputs })
    }

    /// Runs the graph once and copies out every configured output it produced.
    fn run(&self, input: &ModelInputTensor) -> anyhow::Result<FxHashMap<String, ArrayD<f32>>>
    {
        let outputs = self.session.run(inputs![input.as_array().clone()]?)?;
        let mut tensors = FxHashMap::default();
        for name in self.outputs.names()
        {
            match outputs.get(name).map(|output| output.try_extract_tensor::<f32>())
            {
                Some(Ok(tensor)) => {
                    tensors.insert(name.to_string(), tensor.to_owned());
                },
                Some(Err(e)) => warn!("Could not read model output {}: {}", name, e),
                None => warn!("Model has no output named {}", name),
            }
        }
        Ok(tensors)
    }

    fn forward_pass(&self, input: &ModelInputTensor) -> anyhow::Result<ForwardPass>
    {
        let mut tensors = self.run(input)?;
        let logits = take(&mut tensors, &self.outputs.logits)?.into_dimensionality::<Ix2>()?;

        // A missing or malformed feature output is reported by the extractor, not here.
        let mut features = CapturedFeatures::default();
        if let Some(name) = &self.outputs.spatial
        {
            features.spatial = take(&mut tensors, name).and_then(to_channels_first).ok();
        }
        if let Some(name) = &self.outputs.attention
        {
            features.attention = take(&mut tensors, name).and_then(squeeze_to_2d).ok();
        }
        Ok(ForwardPass { logits, features })
    }

    fn spatial(&self, input: &ModelInputTensor) -> anyhow::Result<Array3<f32>>
    {
        let name = self.outputs.spatial.as_deref()
            .ok_or_else(|| anyhow::anyhow!("model does not export {}", LAST_SPATIAL_BLOCK))?;
        to_channels_first(take(&mut self.run(input)?, name)?)
    }

    fn attention(&self, input: &ModelInputTensor) -> anyhow::Result<Array2<f32>>
    {
        let name = self.outputs.attention.as_deref()
            .ok_or_else(|| anyhow::anyhow!("model has no attention output"))?;
        squeeze_to_2d(take(&mut self.run(input)?, name)?)
    }
}

fn take(tensors: &mut FxHashMap<String, ArrayD<f32>>, name: &str) -> anyhow::Result<ArrayD<f32>>
{
    tensors
        .remove(name)
        .ok_or_else(|| anyhow::anyhow!("model has no output named {}", name))
}

/// (1, C, H, W) -> (C, H, W)
fn to_channels_first(features: ArrayD<f32>) -> anyhow::Result<Array3<f32>>
{
    let features = match features.ndim()
    {
        4 if features.len_of(Axis(0)) == 1 => features.index_axis_move(Axis(0), 0),
        _ => features,
    };
    Ok(features.into_dimensionality::<Ix3>()?)
}

/// The ResNet-50 nodule classifier exported to ONNX.
/// Has no attention head; the extractor falls back to its last spatial block.
pub struct ResNetClassifier
{
    model: OnnxModel,
}

impl ResNetClassifier
{
    pub fn new(model_path: &Path, outputs: OutputNames, intra_threads: usize) -> Result<Self, ort::Error>
    {
        Ok(ResNetClassifier { model: OnnxModel::load(model_path, outputs, intra_threads)? })
    }
}

impl Classifier for ResNetClassifier
{
    fn forward(&self, input: &ModelInputTensor) -> anyhow::Result<Array2<f32>>
    {
        Ok(self.model.forward_pass(input)?.logits)
    }

    fn forward_pass(&self, input: &ModelInputTensor) -> anyhow::Result<ForwardPass>
    {
        self.model.forward_pass(input)
    }

    fn spatial_tap(&self) -> Option<&dyn SpatialFeatureTap>
    {
        self.model.outputs.spatial.as_ref().map(|_| self as &dyn SpatialFeatureTap)
    }
}

impl SpatialFeatureTap for ResNetClassifier
{
    fn block_name(&self) -> &str
    {
        LAST_SPATIAL_BLOCK
    }

    fn last_spatial_block(&self, input: &ModelInputTensor) -> anyhow::Result<Array3<f32>>
    {
        self.model.spatial(input)
    }
}

/// A weakly supervised variant whose export carries an attention head output.
pub struct WsodClassifier
{
    model: OnnxModel,
}

impl WsodClassifier
{
    pub fn new(model_path: &Path, outputs: OutputNames, intra_threads: usize) -> anyhow::Result<Self>
    {
        if outputs.attention.is_none()
        {
            anyhow::bail!("a WSOD classifier needs the name of its attention output");
        }
        Ok(WsodClassifier { model: OnnxModel::load(model_path, outputs, intra_threads)? })
    }
}

impl Classifier for WsodClassifier
{
    fn forward(&self, input: &ModelInputTensor) -> anyhow::Result<Array2<f32>>
    {
        Ok(self.model.forward_pass(input)?.logits)
    }

    fn forward_pass(&self, input: &ModelInputTensor) -> anyhow::Result<ForwardPass>
    {
        self.model.forward_pass(input)
    }

    fn attention_hook(&self) -> Option<&dyn HasAttentionHook>
    {
        Some(self)
    }

    fn spatial_tap(&self) -> Option<&dyn SpatialFeatureTap>
    {
        self.model.outputs.spatial.as_ref().map(|_| self as &dyn SpatialFeatureTap)
    }
}

impl HasAttentionHook for WsodClassifier
{
    fn attention(&self, input: &ModelInputTensor) -> anyhow::Result<Array2<f32>>
    {
        self.model.attention(input)
    }
}

impl SpatialFeatureTap for WsodClassifier
{
    fn block_name(&self) -> &str
    {
        LAST_SPATIAL_BLOCK
    }

    fn last_spatial_block(&self, input: &ModelInputTensor) -> anyhow::Result<Array3<f32>>
    {
        self.model.spatial(input)
    }
}

/// Drops leading unit axes, e.g. (1, 1, 14, 14) -> (14, 14).
fn squeeze_to_2d(mut array: ArrayD<f32>) -> anyhow::Result<Array2<f32>>
{
    while array.ndim() > 2 && array.len_of(Axis(0)) == 1
    {
        array = array.index_axis_move(Axis(0), 0);
    }
    let shape = array.shape().to_vec();
    array
        .into_dimensionality::<Ix2>()
        .map_err(|_| anyhow::anyhow!("attention output of shape {:?} is not a single map", shape))
}
