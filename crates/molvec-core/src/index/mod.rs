//! Similarity indexes
//!
//! - [`exact::ExactSimilarityIndex`]: word-parallel brute force, the correctness oracle
//! - [`approximate::ApproximateVectorIndex`]: IVF or HNSW over float vectors,
//!   rebuilt as immutable generations

pub mod approximate;
pub mod exact;
pub(crate) mod hnsw;
pub(crate) mod ivf;

use crate::bits::BitVector;
use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::types::{Fingerprint, MoleculeId, SimilarityResult};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

pub use approximate::{ApproximateMatch, ApproximateVectorIndex, IndexHandle};
pub use exact::ExactSimilarityIndex;

/// Per-query search knobs shared by every backend
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Minimum similarity
    pub threshold: f64,
    /// Maximum number of results
    pub limit: usize,
    /// Molecules left out of the results
    pub exclude: HashSet<MoleculeId>,
    /// HNSW search breadth override
    pub ef_search: Option<usize>,
}

impl SearchOptions {
    /// Options with a threshold and limit
    pub fn new(threshold: f64, limit: usize) -> Self {
        Self {
            threshold,
            limit,
            ..Default::default()
        }
    }

    /// Exclude molecules
    pub fn with_exclude(mut self, ids: impl IntoIterator<Item = MoleculeId>) -> Self {
        self.exclude.extend(ids);
        self
    }

    /// Set the HNSW search breadth
    pub fn with_ef_search(mut self, ef_search: Option<usize>) -> Self {
        self.ef_search = ef_search;
        self
    }

    /// Whether a molecule is excluded
    #[inline]
    pub fn excludes(&self, molecule_id: &str) -> bool {
        !self.exclude.is_empty() && self.exclude.contains(molecule_id)
    }
}

/// In-process similarity backend the router can dispatch to
pub trait SimilarityBackend: Send + Sync {
    /// Short name for logs and responses
    fn name(&self) -> &'static str;

    /// Whether scores are exact set similarities
    fn is_exact(&self) -> bool;

    /// Ranked search
    fn search(
        &self,
        query: &BitVector,
        options: &SearchOptions,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<SimilarityResult>>;

    /// Add or replace a fingerprint
    fn insert(&self, fingerprint: &Fingerprint) -> Result<()>;

    /// Remove a molecule; `false` when it was not indexed
    fn remove(&self, molecule_id: &str) -> Result<bool>;

    /// Number of live molecules
    fn len(&self) -> usize;

    /// Whether the backend holds nothing
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Heap element ordered so that better candidates compare as `Less`
///
/// Better means higher similarity, then smaller molecule id. A `BinaryHeap` of
/// these therefore keeps the worst retained candidate on top.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    /// Molecule id
    pub molecule_id: MoleculeId,
    /// Score
    pub similarity: f64,
}

impl PartialEq for ScoredCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScoredCandidate {}

impl PartialOrd for ScoredCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoredCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .similarity
            .total_cmp(&self.similarity)
            .then_with(|| self.molecule_id.cmp(&other.molecule_id))
    }
}

/// Bounded heap keeping the best `limit` candidates
#[derive(Debug, Clone)]
pub struct TopK {
    heap: BinaryHeap<ScoredCandidate>,
    limit: usize,
}

impl TopK {
    /// Empty heap
    pub fn new(limit: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(limit.saturating_add(1).min(4096)),
            limit,
        }
    }

    /// Offer a candidate; the id is only cloned when it is kept
    #[inline]
    pub fn offer(&mut self, molecule_id: &str, similarity: f64) {
        if self.limit == 0 {
            return;
        }
        if self.heap.len() >= self.limit {
            if let Some(worst) = self.heap.peek() {
                let better = similarity > worst.similarity
                    || (similarity == worst.similarity && molecule_id < worst.molecule_id.as_str());
                if !better {
                    return;
                }
            }
        }
        self.push(ScoredCandidate {
            molecule_id: molecule_id.to_string(),
            similarity,
        });
    }

    /// Push an owned candidate
    pub fn push(&mut self, candidate: ScoredCandidate) {
        if self.limit == 0 {
            return;
        }
        self.heap.push(candidate);
        if self.heap.len() > self.limit {
            self.heap.pop();
        }
    }

    /// Fold another heap into this one
    pub fn merge(mut self, other: TopK) -> TopK {
        let (mut big, small) = if self.heap.len() >= other.heap.len() {
            (std::mem::take(&mut self.heap), other.heap)
        } else {
            (other.heap, std::mem::take(&mut self.heap))
        };
        for c in small {
            big.push(c);
            if big.len() > self.limit {
                big.pop();
            }
        }
        TopK {
            heap: big,
            limit: self.limit,
        }
    }

    /// Retained candidates
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether nothing was retained
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Best first
    pub fn into_sorted(self) -> Vec<ScoredCandidate> {
        self.heap.into_sorted_vec()
    }

    /// Best first, with ranks assigned
    pub fn into_results(self) -> Vec<SimilarityResult> {
        assign_ranks(self.into_sorted())
    }
}

/// Turn best-first candidates into ranked results
pub fn assign_ranks(candidates: Vec<ScoredCandidate>) -> Vec<SimilarityResult> {
    candidates
        .into_iter()
        .enumerate()
        .map(|(rank, c)| SimilarityResult {
            molecule_id: c.molecule_id,
            similarity: c.similarity,
            rank,
        })
        .collect()
}

/// Threshold, exclusion, order, truncate and re-rank a result list
pub fn normalize_results(
    results: Vec<SimilarityResult>,
    options: &SearchOptions,
) -> Vec<SimilarityResult> {
    let mut top = TopK::new(options.limit);
    for r in results {
        if r.similarity >= options.threshold && !options.excludes(&r.molecule_id) {
            top.push(ScoredCandidate {
                molecule_id: r.molecule_id,
                similarity: r.similarity.clamp(0.0, 1.0),
            });
        }
    }
    top.into_results()
}
