//! Exact set-similarity search
//!
//! Brute force over the resident corpus, word-parallel within a fingerprint and
//! rayon-parallel across DashMap shards. Each rayon split keeps its own bounded
//! heap; the heaps are merged at the end.

use super::{SearchOptions, SimilarityBackend, TopK};
use crate::bits::BitVector;
use crate::cancel::{CancellationToken, CANCEL_CHECK_INTERVAL};
use crate::error::{MolvecError, Result};
use crate::similarity::SimilarityMetric;
use crate::types::{Fingerprint, FingerprintType, MoleculeId, SimilarityResult};
use dashmap::DashMap;
use rayon::prelude::*;

/// Resident copy of a fingerprint's bits
#[derive(Debug, Clone)]
struct Resident {
    bits: BitVector,
    ones: u32,
}

/// Split-local scan state
struct ScanAcc {
    top: TopK,
    scanned: usize,
}

impl ScanAcc {
    fn new(limit: usize) -> Self {
        Self {
            top: TopK::new(limit),
            scanned: 0,
        }
    }

    fn tick(&mut self, cancel: Option<&CancellationToken>) -> Result<()> {
        self.scanned += 1;
        if self.scanned % CANCEL_CHECK_INTERVAL == 0 {
            crate::cancel::check(cancel, "exact scan")?;
        }
        Ok(())
    }

    fn merge(self, other: ScanAcc) -> ScanAcc {
        ScanAcc {
            top: self.top.merge(other.top),
            scanned: self.scanned + other.scanned,
        }
    }
}

/// Exact Tanimoto (or Dice) index for one fingerprint family
pub struct ExactSimilarityIndex {
    fingerprint_type: FingerprintType,
    num_bits: usize,
    metric: SimilarityMetric,
    residents: DashMap<MoleculeId, Resident>,
}

impl ExactSimilarityIndex {
    /// Empty index for fingerprints of `num_bits` bits
    pub fn new(fingerprint_type: FingerprintType, num_bits: usize) -> Self {
        Self::with_metric(fingerprint_type, num_bits, SimilarityMetric::Tanimoto)
    }

    /// Empty index using a specific metric
    pub fn with_metric(
        fingerprint_type: FingerprintType,
        num_bits: usize,
        metric: SimilarityMetric,
    ) -> Self {
        Self {
            fingerprint_type,
            num_bits,
            metric,
            residents: DashMap::new(),
        }
    }

    /// Fingerprint family
    pub fn fingerprint_type(&self) -> FingerprintType {
        self.fingerprint_type
    }

    /// Metric in use
    pub fn metric(&self) -> SimilarityMetric {
        self.metric
    }

    /// Whether a molecule is resident
    pub fn contains(&self, molecule_id: &str) -> bool {
        self.residents.contains_key(molecule_id)
    }

    fn check_query(&self, query: &BitVector) -> Result<()> {
        if query.num_bits() != self.num_bits {
            return Err(MolvecError::MalformedFingerprint(format!(
                "query has {} bits, {} index expects {}",
                query.num_bits(),
                self.fingerprint_type,
                self.num_bits
            )));
        }
        Ok(())
    }

    #[inline]
    fn score(&self, q_ones: u32, query: &BitVector, resident: &Resident) -> f64 {
        self.metric
            .from_counts(q_ones, resident.ones, query.intersection_count(&resident.bits))
    }

    /// Scan the whole corpus
    pub fn search(
        &self,
        query: &BitVector,
        threshold: f64,
        limit: usize,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<SimilarityResult>> {
        self.search_with(query, &SearchOptions::new(threshold, limit), cancel)
    }

    /// Scan the whole corpus with full options
    pub fn search_with(
        &self,
        query: &BitVector,
        options: &SearchOptions,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<SimilarityResult>> {
        self.check_query(query)?;
        crate::cancel::check(cancel, "exact scan")?;
        let q_ones = query.count_ones();

        let acc = self
            .residents
            .par_iter()
            .try_fold(
                || ScanAcc::new(options.limit),
                |mut acc, item| {
                    acc.tick(cancel)?;
                    let id = item.key();
                    if options.excludes(id) {
                        return Ok::<_, MolvecError>(acc);
                    }
                    let sim = self.score(q_ones, query, item.value());
                    if sim >= options.threshold {
                        acc.top.offer(id, sim);
                    }
                    Ok(acc)
                },
            )
            .try_reduce(|| ScanAcc::new(options.limit), |a, b| Ok(a.merge(b)))?;

        tracing::debug!(
            fingerprint_type = %self.fingerprint_type,
            scanned = acc.scanned,
            hits = acc.top.len(),
            "exact search"
        );
        Ok(acc.top.into_results())
    }

    /// Scan only the given candidates; ids that are not resident are skipped
    pub fn search_subset(
        &self,
        query: &BitVector,
        candidate_ids: &[MoleculeId],
        options: &SearchOptions,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<SimilarityResult>> {
        self.check_query(query)?;
        crate::cancel::check(cancel, "exact subset scan")?;
        let q_ones = query.count_ones();

        let acc = candidate_ids
            .par_iter()
            .try_fold(
                || ScanAcc::new(options.limit),
                |mut acc, id| {
                    acc.tick(cancel)?;
                    if options.excludes(id) {
                        return Ok::<_, MolvecError>(acc);
                    }
                    if let Some(resident) = self.residents.get(id) {
                        let sim = self.score(q_ones, query, resident.value());
                        if sim >= options.threshold {
                            acc.top.offer(id, sim);
                        }
                    }
                    Ok(acc)
                },
            )
            .try_reduce(|| ScanAcc::new(options.limit), |a, b| Ok(a.merge(b)))?;

        Ok(acc.top.into_results())
    }

    /// Score fingerprints fetched from the store, e.g. reranking candidates
    ///
    /// `None` slots are skipped. Duplicates count once.
    pub fn score_batch(
        &self,
        query: &BitVector,
        fingerprints: &[Option<Fingerprint>],
        options: &SearchOptions,
    ) -> Result<Vec<SimilarityResult>> {
        self.check_query(query)?;
        let q_ones = query.count_ones();
        let mut top = TopK::new(options.limit);
        let mut seen = std::collections::HashSet::new();

        for fp in fingerprints.iter().flatten() {
            if fp.num_bits() != self.num_bits {
                return Err(MolvecError::MalformedFingerprint(format!(
                    "candidate {} has {} bits, expected {}",
                    fp.molecule_id(),
                    fp.num_bits(),
                    self.num_bits
                )));
            }
            if options.excludes(fp.molecule_id()) || !seen.insert(fp.molecule_id()) {
                continue;
            }
            let c = query.intersection_count(fp.bits());
            let sim = self.metric.from_counts(q_ones, fp.num_on_bits(), c);
            if sim >= options.threshold {
                top.offer(fp.molecule_id(), sim);
            }
        }
        Ok(top.into_results())
    }

    /// Add or replace a fingerprint
    pub fn insert(&self, fingerprint: &Fingerprint) -> Result<()> {
        if fingerprint.fingerprint_type() != self.fingerprint_type {
            return Err(MolvecError::InvalidParameter(format!(
                "{} fingerprint offered to {} index",
                fingerprint.fingerprint_type(),
                self.fingerprint_type
            )));
        }
        self.check_query(fingerprint.bits())?;
        self.residents.insert(
            fingerprint.molecule_id().to_string(),
            Resident {
                bits: fingerprint.bits().clone(),
                ones: fingerprint.num_on_bits(),
            },
        );
        Ok(())
    }

    /// Remove a molecule; `false` when it was not resident
    pub fn remove(&self, molecule_id: &str) -> bool {
        self.residents.remove(molecule_id).is_some()
    }

    /// Resident corpus size
    pub fn len(&self) -> usize {
        self.residents.len()
    }

    /// Whether the corpus is empty
    pub fn is_empty(&self) -> bool {
        self.residents.is_empty()
    }

    /// Drop every resident fingerprint
    pub fn clear(&self) {
        self.residents.clear();
    }
}

impl SimilarityBackend for ExactSimilarityIndex {
    fn name(&self) -> &'static str {
        "exact"
    }

    fn is_exact(&self) -> bool {
        true
    }

    fn search(
        &self,
        query: &BitVector,
        options: &SearchOptions,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<SimilarityResult>> {
        self.search_with(query, options, cancel)
    }

    fn insert(&self, fingerprint: &Fingerprint) -> Result<()> {
        ExactSimilarityIndex::insert(self, fingerprint)
    }

    fn remove(&self, molecule_id: &str) -> Result<bool> {
        Ok(ExactSimilarityIndex::remove(self, molecule_id))
    }

    fn len(&self) -> usize {
        ExactSimilarityIndex::len(self)
    }
}
