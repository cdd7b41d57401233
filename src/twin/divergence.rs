//! Divergence metric between a twin's desired and confirmed state
//!
//! `score = Σ w_a·d_a / Σ w_a` over every attribute with a desired value, where
//! `d_a ∈ [0, 1]` is:
//! - numbers: `min(|desired − actual| / scale_a, 1)`
//! - booleans / text: `0` when equal, `1` otherwise
//! - missing actual value: `1`
//!
//! The denominator depends only on which attributes are desired, so raising a
//! single attribute's deviation with the others fixed can never lower the score.

use std::collections::BTreeMap;

use super::models::DigitalTwin;
use crate::models::AttrValue;

const DEFAULT_WEIGHT: f64 = 1.0;
const DEFAULT_SCALE: f64 = 1.0;

/// Normalized distance of a single attribute in `[0, 1]`
pub fn attribute_distance(desired: &AttrValue, actual: Option<&AttrValue>, scale: f64) -> f64 {
    let actual = match actual {
        Some(a) => a,
        None => return 1.0,
    };

    match (desired, actual) {
        (AttrValue::Number(d), AttrValue::Number(a)) => {
            let scale = if scale > 0.0 { scale } else { DEFAULT_SCALE };
            let dist = (d - a).abs() / scale;
            if dist.is_finite() {
                dist.min(1.0)
            } else {
                1.0
            }
        }
        (d, a) => {
            if d == a {
                0.0
            } else {
                1.0
            }
        }
    }
}

/// Weighted, normalized divergence for arbitrary state maps
pub fn divergence(
    desired: &BTreeMap<String, AttrValue>,
    actual: &BTreeMap<String, AttrValue>,
    weights: &BTreeMap<String, f64>,
    scales: &BTreeMap<String, f64>,
) -> f64 {
    let mut weighted = 0.0;
    let mut total_weight = 0.0;

    for (attribute, want) in desired {
        let w = weights
            .get(attribute)
            .copied()
            .filter(|w| *w > 0.0)
            .unwrap_or(DEFAULT_WEIGHT);
        let scale = scales.get(attribute).copied().unwrap_or(DEFAULT_SCALE);
        weighted += w * attribute_distance(want, actual.get(attribute), scale);
        total_weight += w;
    }

    if total_weight > 0.0 {
        (weighted / total_weight).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Divergence of a twin's desired state from its last confirmed state
pub fn twin_divergence(twin: &DigitalTwin) -> f64 {
    divergence(
        &twin.desired_state,
        &twin.last_known_state,
        &twin.attribute_weights,
        &twin.attribute_scales,
    )
}
