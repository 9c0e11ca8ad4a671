//! Match decision between a stored and a live face descriptor.

use crate::types::Descriptor;
use serde::{Deserialize, Serialize};

/// Maximum Euclidean distance still accepted as the same face.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.45;

/// Outcome of comparing two descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub is_match: bool,
    /// L2 distance between the two descriptors. Lower = more similar.
    pub distance: f32,
}

/// L2 norm of the element-wise difference.
///
/// Accumulates in `f64` so the result is independent of argument order.
pub fn euclidean_distance(a: &Descriptor, b: &Descriptor) -> f32 {
    a.as_slice()
        .iter()
        .zip(b.as_slice())
        .map(|(&x, &y)| {
            let d = f64::from(x) - f64::from(y);
            d * d
        })
        .sum::<f64>()
        .sqrt() as f32
}

/// Compare a stored descriptor against a live one.
///
/// `is_match` holds iff `distance <= threshold`.
pub fn compare_descriptors(stored: &Descriptor, live: &Descriptor, threshold: f32) -> MatchResult {
    let distance = euclidean_distance(stored, live);
    MatchResult {
        is_match: distance <= threshold,
        distance,
    }
}

/// Strategy for deciding whether two descriptors belong to the same face.
pub trait Matcher {
    fn compare(&self, stored: &Descriptor, live: &Descriptor) -> MatchResult;
}

/// Euclidean-distance matcher with a fixed acceptance threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EuclideanMatcher {
    pub threshold: f32,
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

impl Matcher for EuclideanMatcher {
    fn compare(&self, stored: &Descriptor, live: &Descriptor) -> MatchResult {
        compare_descriptors(stored, live, self.threshold)
    }
}
