//! Similarity metrics over binary fingerprints

use crate::bits::BitVector;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Set-similarity metric used by the exact index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityMetric {
    /// `c / (a + b - c)`
    #[default]
    Tanimoto,
    /// `2c / (a + b)`
    Dice,
}

impl SimilarityMetric {
    /// Score from popcounts `a`, `b` and intersection `c`
    #[inline]
    pub fn from_counts(&self, a: u32, b: u32, c: u32) -> f64 {
        match self {
            SimilarityMetric::Tanimoto => tanimoto_from_counts(a, b, c),
            SimilarityMetric::Dice => dice_from_counts(a, b, c),
        }
    }

    /// Score two bit vectors
    #[inline]
    pub fn score(&self, a: &BitVector, b: &BitVector) -> f64 {
        self.from_counts(a.count_ones(), b.count_ones(), a.intersection_count(b))
    }
}

/// Tanimoto from popcounts; zero when both vectors are empty
#[inline]
pub fn tanimoto_from_counts(a: u32, b: u32, c: u32) -> f64 {
    let union = a + b - c;
    if union == 0 {
        return 0.0;
    }
    c as f64 / union as f64
}

/// Dice from popcounts; zero when both vectors are empty
#[inline]
pub fn dice_from_counts(a: u32, b: u32, c: u32) -> f64 {
    let total = a + b;
    if total == 0 {
        return 0.0;
    }
    2.0 * c as f64 / total as f64
}

/// Tanimoto similarity of two equal-width bit vectors
#[inline]
pub fn tanimoto(a: &BitVector, b: &BitVector) -> f64 {
    debug_assert_eq!(a.num_bits(), b.num_bits());
    SimilarityMetric::Tanimoto.score(a, b)
}

/// Dice similarity of two equal-width bit vectors
#[inline]
pub fn dice(a: &BitVector, b: &BitVector) -> f64 {
    debug_assert_eq!(a.num_bits(), b.num_bits());
    SimilarityMetric::Dice.score(a, b)
}

/// Dot product of two float vectors
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Tanimoto estimate from the cosine of two normalized binary vectors
///
/// With popcounts `a` and `b`, the intersection is `cos * sqrt(a * b)`. The
/// result is clamped to `[0, 1]` and is only an estimate: rounding in the
/// float index means it must never be treated as exact.
pub fn cosine_to_tanimoto(cosine: f32, a: u32, b: u32) -> f64 {
    if a == 0 || b == 0 {
        return 0.0;
    }
    let c = (cosine.max(0.0) as f64) * ((a as f64) * (b as f64)).sqrt();
    let denom = a as f64 + b as f64 - c;
    if denom <= 0.0 {
        return 1.0;
    }
    (c / denom).clamp(0.0, 1.0)
}

/// Score one query against many fingerprints, in input order
pub fn bulk_similarity(
    query: &BitVector,
    targets: &[BitVector],
    metric: SimilarityMetric,
) -> Vec<f64> {
    let q_ones = query.count_ones();
    targets
        .par_iter()
        .map(|t| metric.from_counts(q_ones, t.count_ones(), query.intersection_count(t)))
        .collect()
}

/// Pairwise similarity matrix
///
/// Symmetric; the diagonal is 1.0 for every non-empty fingerprint and 0.0 for
/// empty ones.
pub fn similarity_matrix(fingerprints: &[BitVector], metric: SimilarityMetric) -> Vec<Vec<f64>> {
    let n = fingerprints.len();
    let counts: Vec<u32> = fingerprints.iter().map(|f| f.count_ones()).collect();

    let upper: Vec<Vec<f64>> = (0..n)
        .into_par_iter()
        .map(|i| {
            (i..n)
                .map(|j| {
                    let c = fingerprints[i].intersection_count(&fingerprints[j]);
                    metric.from_counts(counts[i], counts[j], c)
                })
                .collect()
        })
        .collect();

    let mut matrix = vec![vec![0.0; n]; n];
    for (i, row) in upper.into_iter().enumerate() {
        for (offset, value) in row.into_iter().enumerate() {
            let j = i + offset;
            matrix[i][j] = value;
            matrix[j][i] = value;
        }
    }
    matrix
}
