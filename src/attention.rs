//! Attention extraction: a coarse relevance map derived from the classifier's internals.
//!
//! If the classifier has a dedicated attention head it is used as is. Otherwise the
//! activations of its last spatial block ([`crate::classifier::LAST_SPATIAL_BLOCK`])
//! are averaged over channels and rectified. Both paths are rescaled to [0, 1].
//! Features captured by the classification pass are used in place of a second run.

use std::time::Instant;

use log::debug;
use ndarray::{Array2, Array3, Axis};

use crate::classifier::{CapturedFeatures, Classifier};
use crate::error::Error;
use crate::models::{AttentionMap, ModelInputTensor};

/// Ranges at or below this are treated as a constant map.
const DEGENERATE_RANGE: f32 = 1e-12;

pub fn extract(classifier: &dyn Classifier, input: &ModelInputTensor) -> Result<AttentionMap, Error>
{
    extract_with(classifier, input, CapturedFeatures::default())
}

pub fn extract_with(classifier: &dyn Classifier, input: &ModelInputTensor, captured: CapturedFeatures) -> Result<AttentionMap, Error>
{
    let start = Instant::now();

    let map = if let Some(hook) = classifier.attention_hook()
    {
        let raw = match captured.attention
        {
            Some(raw) => raw,
            None => hook
                .attention(input)
                .map_err(|e| Error::Visualization(format!("attention hook failed: {:#}", e)))?,
        };
        AttentionMap::from_scores(raw)?
    }
    else if let Some(tap) = classifier.spatial_tap()
    {
        let features = match captured.spatial
        {
            Some(features) => features,
            None => tap
                .last_spatial_block(input)
                .map_err(|e| Error::Visualization(format!("could not read {}: {:#}", tap.block_name(), e)))?,
        };
        AttentionMap::from_activations(&features)?
    }
    else
    {
        return Err(Error::Visualization(
            "classifier exposes neither an attention hook nor its last spatial block".to_string()));
    };

    debug!("Extracted {:?} attention map in {:?}", map.dim(), start.elapsed());
    Ok(map)
}

impl AttentionMap
{
    /// Rescales an arbitrary relevance map to [0, 1].
    pub fn from_scores(mut scores: Array2<f32>) -> Result<AttentionMap, Error>
    {
        if scores.is_empty()
        {
            return Err(Error::Visualization("attention map is empty".to_string()));
        }
        if scores.iter().any(|v| !v.is_finite())
        {
            return Err(Error::Visualization("attention map contains non-finite values".to_string()));
        }

        normalize_unit_interval(&mut scores);
        Ok(AttentionMap(scores))
    }

    /// Channel mean of (C, H, W) activations, negative evidence clamped to zero, rescaled to [0, 1].
    pub fn from_activations(features: &Array3<f32>) -> Result<AttentionMap, Error>
    {
        let reduced = features
            .mean_axis(Axis(0))
            .ok_or_else(|| Error::Visualization("spatial block has no channels".to_string()))?;
        AttentionMap::from_scores(reduced.mapv(|v| v.max(0.0)))
    }
}

fn normalize_unit_interval(values: &mut Array2<f32>)
{
    let (min, max) = values.fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    let range = max - min;
    if range <= DEGENERATE_RANGE
    {
        values.fill(0.0);
        return;
    }
    values.mapv_inplace(|v| (v - min) / range);
}
