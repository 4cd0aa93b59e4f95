//! Approximate nearest-neighbor index with build-then-swap generations
//!
//! A generation is one IVF or HNSW structure built from a snapshot of the
//! corpus. Rebuilding constructs the next generation off to the side while
//! searches keep running on the current one, then swaps the `Arc`. The build
//! lock is held exclusively for the whole rebuild, so `insert` and `remove`
//! wait for the swap and land in the new generation. Compaction takes the
//! same lock; an HNSW graph is compacted into a copy and swapped in.
//!
//! Incremental inserts are placed with the current centroids or graph and may
//! lower recall until the next rebuild; [`ApproximateVectorIndex::drift`]
//! reports how far the index has moved since it was built.

use super::hnsw::{HnswGraph, HnswParams};
use super::ivf::{IvfIndex, IvfParams};
use super::{normalize_results, SearchOptions, SimilarityBackend};
use crate::bits::BitVector;
use crate::cancel::CancellationToken;
use crate::codec::FingerprintCodec;
use crate::config::AnnParams;
use crate::error::{MolvecError, Result};
use crate::similarity::cosine_to_tanimoto;
use crate::types::{Fingerprint, FingerprintType, MoleculeId, SimilarityResult, VectorRef};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Float-converted fingerprint held by an ANN structure
#[derive(Debug, Clone)]
pub(crate) struct AnnVector {
    pub(crate) molecule_id: MoleculeId,
    pub(crate) vector: Vec<f32>,
    pub(crate) ones: u32,
}

impl AnnVector {
    pub(crate) fn from_fingerprint(fingerprint: &Fingerprint) -> Self {
        Self {
            molecule_id: fingerprint.molecule_id().to_string(),
            vector: FingerprintCodec::to_float_vector(fingerprint.bits()),
            ones: fingerprint.num_on_bits(),
        }
    }
}

/// Raw ANN hit
#[derive(Debug, Clone)]
pub(crate) struct AnnHit {
    pub(crate) molecule_id: MoleculeId,
    pub(crate) cosine: f32,
    pub(crate) ones: u32,
}

/// Cosine descending, then molecule id ascending
pub(crate) fn sort_hits(hits: &mut [AnnHit]) {
    hits.sort_by(|a, b| {
        b.cosine
            .total_cmp(&a.cosine)
            .then_with(|| a.molecule_id.cmp(&b.molecule_id))
    });
}

/// One approximate match
///
/// `estimated_tanimoto` is derived from the cosine and both popcounts. It is a
/// presentation value only and must not be treated as exact.
#[derive(Debug, Clone, PartialEq)]
pub struct ApproximateMatch {
    /// Matched molecule
    pub molecule_id: MoleculeId,
    /// Cosine similarity of the normalized float vectors
    pub cosine: f32,
    /// Tanimoto estimate from the cosine
    pub estimated_tanimoto: f64,
}

/// Description of a built generation
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHandle {
    /// Generation number, increasing per index
    pub generation: u64,
    /// `"ivf"` or `"hnsw"`
    pub kind: &'static str,
    /// Vectors in the generation when it was built
    pub size: usize,
    /// Build completion time
    pub built_at: DateTime<Utc>,
}

enum Structure {
    Ivf(IvfIndex),
    Hnsw(RwLock<HnswGraph>),
}

struct Generation {
    handle: IndexHandle,
    structure: Structure,
}

impl Generation {
    fn search(&self, query: &[f32], top_k: usize, ef_search: Option<usize>) -> Vec<AnnHit> {
        match &self.structure {
            Structure::Ivf(ivf) => ivf.search(query, top_k),
            Structure::Hnsw(graph) => graph.read().search(query, top_k, ef_search),
        }
    }

    fn insert(&self, vector: AnnVector) {
        match &self.structure {
            Structure::Ivf(ivf) => ivf.insert(vector),
            Structure::Hnsw(graph) => graph.write().insert(vector),
        }
    }

    fn remove(&self, molecule_id: &str) -> bool {
        match &self.structure {
            Structure::Ivf(ivf) => ivf.remove(molecule_id),
            Structure::Hnsw(graph) => graph.write().remove(molecule_id),
        }
    }

    fn len(&self) -> usize {
        match &self.structure {
            Structure::Ivf(ivf) => ivf.len(),
            Structure::Hnsw(graph) => graph.read().len(),
        }
    }

    fn tombstones(&self) -> usize {
        match &self.structure {
            Structure::Ivf(ivf) => ivf.tombstones(),
            Structure::Hnsw(graph) => graph.read().tombstones(),
        }
    }

    fn compact(&self) -> usize {
        match &self.structure {
            Structure::Ivf(ivf) => ivf.compact(),
            Structure::Hnsw(graph) => {
                // Callers hold the build lock, so nothing mutates the graph
                // while the copy is built under the shared lock
                let (removed, fresh) = {
                    let current = graph.read();
                    let removed = current.tombstones();
                    (removed, (removed > 0).then(|| current.compacted()))
                };
                if let Some(fresh) = fresh {
                    *graph.write() = fresh;
                }
                removed
            }
        }
    }
}

/// Approximate index for one fingerprint family
pub struct ApproximateVectorIndex {
    fingerprint_type: FingerprintType,
    num_bits: usize,
    params: AnnParams,
    current: RwLock<Option<Arc<Generation>>>,
    build_lock: RwLock<()>,
    next_generation: AtomicU64,
    inserts_since_build: AtomicUsize,
}

impl ApproximateVectorIndex {
    /// Index with no generation yet
    pub fn new(fingerprint_type: FingerprintType, num_bits: usize, params: AnnParams) -> Self {
        Self {
            fingerprint_type,
            num_bits,
            params,
            current: RwLock::new(None),
            build_lock: RwLock::new(()),
            next_generation: AtomicU64::new(1),
            inserts_since_build: AtomicUsize::new(0),
        }
    }

    /// Default build parameters
    pub fn params(&self) -> &AnnParams {
        &self.params
    }

    fn current(&self) -> Option<Arc<Generation>> {
        self.current.read().clone()
    }

    /// Handle of the generation searches currently use
    pub fn handle(&self) -> Option<IndexHandle> {
        self.current().map(|g| g.handle.clone())
    }

    /// Build a new generation from `fingerprints` and swap it in
    pub fn build(
        &self,
        fingerprints: impl IntoIterator<Item = Fingerprint>,
        params: &AnnParams,
        cancel: Option<&CancellationToken>,
    ) -> Result<IndexHandle> {
        let fingerprints: Vec<Fingerprint> = fingerprints.into_iter().collect();
        self.rebuild_with(|| Ok(fingerprints), params, cancel)
    }

    /// Build a new generation from a snapshot taken after the build lock is held
    ///
    /// Taking the snapshot under the lock means no insert can slip in between
    /// the snapshot and the swap.
    pub fn rebuild_with<F>(
        &self,
        source: F,
        params: &AnnParams,
        cancel: Option<&CancellationToken>,
    ) -> Result<IndexHandle>
    where
        F: FnOnce() -> Result<Vec<Fingerprint>>,
    {
        params.validate()?;
        let _build = self.build_lock.write();
        let fingerprints = source()?;

        // Last write wins for duplicate molecule ids
        let mut dedup: HashMap<MoleculeId, Fingerprint> = HashMap::with_capacity(fingerprints.len());
        for fp in fingerprints {
            self.check(&fp)?;
            dedup.insert(fp.molecule_id().to_string(), fp);
        }
        let mut fingerprints: Vec<Fingerprint> = dedup.into_values().collect();
        fingerprints.sort_by(|a, b| a.molecule_id().cmp(b.molecule_id()));

        let vectors: Vec<AnnVector> = fingerprints
            .par_iter()
            .map(AnnVector::from_fingerprint)
            .collect();
        let size = vectors.len();

        let structure = match *params {
            AnnParams::Ivf {
                num_partitions,
                n_probe,
                kmeans_iterations,
                max_training_samples,
                seed,
            } => Structure::Ivf(IvfIndex::build(
                self.num_bits,
                vectors,
                &IvfParams {
                    num_partitions,
                    n_probe,
                    kmeans_iterations,
                    max_training_samples,
                    seed,
                },
                cancel,
            )?),
            AnnParams::Hnsw {
                m,
                m0,
                ef_construction,
                ef_search,
                seed,
            } => Structure::Hnsw(RwLock::new(HnswGraph::build(
                HnswParams {
                    m,
                    m0,
                    ef_construction,
                    ef_search,
                    seed,
                },
                vectors,
                cancel,
            )?)),
        };

        let handle = IndexHandle {
            generation: self.next_generation.fetch_add(1, Ordering::SeqCst),
            kind: params.kind(),
            size,
            built_at: Utc::now(),
        };
        *self.current.write() = Some(Arc::new(Generation {
            handle: handle.clone(),
            structure,
        }));
        self.inserts_since_build.store(0, Ordering::SeqCst);

        info!(
            fingerprint_type = %self.fingerprint_type,
            generation = handle.generation,
            kind = handle.kind,
            size,
            "approximate index generation swapped in"
        );
        Ok(handle)
    }

    fn check(&self, fingerprint: &Fingerprint) -> Result<()> {
        if fingerprint.fingerprint_type() != self.fingerprint_type
            || fingerprint.num_bits() != self.num_bits
        {
            return Err(MolvecError::MalformedFingerprint(format!(
                "{} fingerprint of {} bits offered to {} index of {} bits",
                fingerprint.fingerprint_type(),
                fingerprint.num_bits(),
                self.fingerprint_type,
                self.num_bits
            )));
        }
        Ok(())
    }

    /// Add or replace a fingerprint in the current generation
    ///
    /// Blocks while a build is running. Returns `None` when no generation has
    /// been built yet; the next build picks the fingerprint up from the store.
    pub fn insert(&self, fingerprint: &Fingerprint) -> Result<Option<VectorRef>> {
        self.check(fingerprint)?;
        let _build = self.build_lock.read();
        let Some(generation) = self.current() else {
            return Ok(None);
        };
        generation.insert(AnnVector::from_fingerprint(fingerprint));
        self.inserts_since_build.fetch_add(1, Ordering::Relaxed);
        Ok(Some(VectorRef {
            generation: generation.handle.generation,
        }))
    }

    /// Tombstone a molecule; waits for a running build
    pub fn remove(&self, molecule_id: &str) -> bool {
        let _build = self.build_lock.read();
        match self.current() {
            Some(generation) => generation.remove(molecule_id),
            None => false,
        }
    }

    /// Approximate top-k by cosine
    ///
    /// Never blocks on a build: it runs against whichever generation is current
    /// when the call starts.
    pub fn search(
        &self,
        query: &BitVector,
        top_k: usize,
        ef_search: Option<usize>,
    ) -> Result<Vec<ApproximateMatch>> {
        if query.num_bits() != self.num_bits {
            return Err(MolvecError::MalformedFingerprint(format!(
                "query has {} bits, {} index expects {}",
                query.num_bits(),
                self.fingerprint_type,
                self.num_bits
            )));
        }
        let generation = self.current().ok_or_else(|| {
            MolvecError::NotFound(format!(
                "no approximate generation built for {}",
                self.fingerprint_type
            ))
        })?;

        let q_ones = query.count_ones();
        let q_vec = FingerprintCodec::to_float_vector(query);
        let hits = generation.search(&q_vec, top_k, ef_search);
        debug!(
            fingerprint_type = %self.fingerprint_type,
            generation = generation.handle.generation,
            hits = hits.len(),
            "approximate search"
        );

        Ok(hits
            .into_iter()
            .map(|h| ApproximateMatch {
                estimated_tanimoto: cosine_to_tanimoto(h.cosine, q_ones, h.ones),
                molecule_id: h.molecule_id,
                cosine: h.cosine.clamp(-1.0, 1.0),
            })
            .collect())
    }

    /// Physically drop tombstoned vectors from the current generation
    ///
    /// Holds the build lock like a rebuild: inserts and removals wait, searches
    /// keep running until the compacted structure is swapped in.
    pub fn compact(&self) -> usize {
        let _build = self.build_lock.write();
        let removed = self.current().map(|g| g.compact()).unwrap_or(0);
        if removed > 0 {
            info!(fingerprint_type = %self.fingerprint_type, removed, "approximate index compacted");
        }
        removed
    }

    /// Live vectors in the current generation
    pub fn len(&self) -> usize {
        self.current().map(|g| g.len()).unwrap_or(0)
    }

    /// Whether there is nothing to search
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tombstones awaiting compaction
    pub fn tombstones(&self) -> usize {
        self.current().map(|g| g.tombstones()).unwrap_or(0)
    }

    /// Inserts since the last build
    pub fn inserts_since_build(&self) -> usize {
        self.inserts_since_build.load(Ordering::Relaxed)
    }

    /// Inserts since the last build relative to the built size
    pub fn drift(&self) -> f64 {
        let built = self.current().map(|g| g.handle.size).unwrap_or(0);
        self.inserts_since_build() as f64 / built.max(1) as f64
    }

    /// Tombstones relative to live vectors plus tombstones
    pub fn tombstone_ratio(&self) -> f64 {
        let dead = self.tombstones();
        let total = self.len() + dead;
        if total == 0 {
            0.0
        } else {
            dead as f64 / total as f64
        }
    }
}

impl SimilarityBackend for ApproximateVectorIndex {
    fn name(&self) -> &'static str {
        "approximate"
    }

    fn is_exact(&self) -> bool {
        false
    }

    fn search(
        &self,
        query: &BitVector,
        options: &SearchOptions,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<SimilarityResult>> {
        crate::cancel::check(cancel, "approximate search")?;
        let fetch = options.limit.saturating_add(options.exclude.len());
        let matches = ApproximateVectorIndex::search(self, query, fetch, options.ef_search)?;
        let results = matches
            .into_iter()
            .map(|m| SimilarityResult {
                molecule_id: m.molecule_id,
                similarity: m.estimated_tanimoto,
                rank: 0,
            })
            .collect();
        Ok(normalize_results(results, options))
    }

    fn insert(&self, fingerprint: &Fingerprint) -> Result<()> {
        ApproximateVectorIndex::insert(self, fingerprint).map(|_| ())
    }

    fn remove(&self, molecule_id: &str) -> Result<bool> {
        Ok(ApproximateVectorIndex::remove(self, molecule_id))
    }

    fn len(&self) -> usize {
        ApproximateVectorIndex::len(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn fp(id: &str, bits: &[usize]) -> Fingerprint {
        Fingerprint::new(
            id,
            FingerprintType::Custom,
            BitVector::from_on_bits(64, bits).unwrap(),
            None,
            false,
            Utc::now(),
        )
    }

    fn corpus() -> Vec<Fingerprint> {
        vec![
            fp("a", &[0, 1, 2, 3]),
            fp("b", &[0, 1, 2, 4]),
            fp("c", &[20, 21, 22]),
            fp("d", &[20, 21, 23]),
        ]
    }

    fn ivf() -> AnnParams {
        AnnParams::Ivf {
            num_partitions: 2,
            n_probe: 2,
            kmeans_iterations: 5,
            max_training_samples: 100,
            seed: 1,
        }
    }

    fn hnsw() -> AnnParams {
        AnnParams::Hnsw {
            m: 4,
            m0: 8,
            ef_construction: 16,
            ef_search: 16,
            seed: 1,
        }
    }

    #[test]
    fn test_search_before_build_errors() {
        let index = ApproximateVectorIndex::new(FingerprintType::Custom, 64, ivf());
        let q = BitVector::from_on_bits(64, &[0]).unwrap();
        assert!(matches!(
            index.search(&q, 3, None),
            Err(MolvecError::NotFound(_))
        ));
        assert_eq!(index.insert(&fp("x", &[1])).unwrap(), None);
    }

    #[test]
    fn test_build_and_search_both_structures() {
        for params in [ivf(), hnsw()] {
            let index = ApproximateVectorIndex::new(FingerprintType::Custom, 64, params.clone());
            let handle = index.build(corpus(), &params, None).unwrap();
            assert_eq!(handle.size, 4);
            assert_eq!(handle.kind, params.kind());

            let q = BitVector::from_on_bits(64, &[0, 1, 2, 3]).unwrap();
            let matches = index.search(&q, 2, None).unwrap();
            assert_eq!(matches[0].molecule_id, "a");
            assert!((matches[0].estimated_tanimoto - 1.0).abs() < 1e-4);
            assert_eq!(matches[1].molecule_id, "b");
            // c = 3, a = b = 4 -> exact Tanimoto 3/5
            assert!((matches[1].estimated_tanimoto - 0.6).abs() < 1e-3);
        }
    }

    #[test]
    fn test_insert_remove_drift_and_compact() {
        let index = ApproximateVectorIndex::new(FingerprintType::Custom, 64, hnsw());
        index.build(corpus(), &hnsw(), None).unwrap();

        let vref = index.insert(&fp("e", &[20, 21, 22, 23])).unwrap().unwrap();
        assert_eq!(vref.generation, index.handle().unwrap().generation);
        assert_eq!(index.len(), 5);
        assert!((index.drift() - 0.25).abs() < 1e-12);

        assert!(index.remove("c"));
        let q = BitVector::from_on_bits(64, &[20, 21, 22]).unwrap();
        let matches = index.search(&q, 5, None).unwrap();
        assert!(matches.iter().all(|m| m.molecule_id != "c"));
        assert_eq!(index.tombstones(), 1);
        assert_eq!(index.compact(), 1);
        assert_eq!(index.tombstones(), 0);
        assert_eq!(index.len(), 4);
    }

    #[test]
    fn test_hnsw_compaction_runs_alongside_searches() {
        let corpus: Vec<Fingerprint> = (1..400usize)
            .map(|i| {
                let mut on: Vec<usize> = (0..9).filter(|b| i & (1 << b) != 0).collect();
                on.push(50 + i % 10);
                fp(&format!("m{i}"), &on)
            })
            .collect();
        let index = ApproximateVectorIndex::new(FingerprintType::Custom, 64, hnsw());
        index.build(corpus.clone(), &hnsw(), None).unwrap();
        for i in (2..400usize).step_by(2) {
            assert!(index.remove(&format!("m{i}")));
        }
        let dead = index.tombstones();
        assert_eq!(dead, 199);

        let q = BitVector::from_on_bits(64, &corpus[2].bits().on_bits()).unwrap();
        let late_bits = [0, 1, 2, 3, 4, 5, 6, 7, 8, 59];
        let removed = thread::scope(|scope| {
            let compaction = scope.spawn(|| index.compact());
            let searches: Vec<_> = (0..2)
                .map(|_| {
                    scope.spawn(|| {
                        for _ in 0..50 {
                            let hits = index.search(&q, 5, Some(64)).unwrap();
                            assert!(!hits.is_empty());
                            for hit in hits.iter().filter(|h| h.molecule_id != "late") {
                                let n: usize = hit.molecule_id[1..].parse().unwrap();
                                assert_eq!(n % 2, 1, "tombstoned {} returned", hit.molecule_id);
                            }
                        }
                    })
                })
                .collect();
            let late = scope.spawn(|| index.insert(&fp("late", &late_bits)).unwrap());
            for s in searches {
                s.join().unwrap();
            }
            assert!(late.join().unwrap().is_some());
            compaction.join().unwrap()
        });

        assert_eq!(removed, dead);
        assert_eq!(index.tombstones(), 0);
        assert_eq!(index.len(), 201);
        let late = BitVector::from_on_bits(64, &late_bits).unwrap();
        let hits = index.search(&late, 5, Some(256)).unwrap();
        assert!(hits.iter().any(|h| h.molecule_id == "late"));
    }

    #[test]
    fn test_rebuild_swaps_generation() {
        let index = ApproximateVectorIndex::new(FingerprintType::Custom, 64, ivf());
        let first = index.build(corpus(), &ivf(), None).unwrap();
        let second = index.build(corpus().into_iter().take(2), &ivf(), None).unwrap();
        assert!(second.generation > first.generation);
        assert_eq!(index.len(), 2);
        assert_eq!(index.inserts_since_build(), 0);
    }

    #[test]
    fn test_search_uses_previous_generation_during_build() {
        let index = Arc::new(ApproximateVectorIndex::new(FingerprintType::Custom, 64, ivf()));
        let first = index.build(corpus(), &ivf(), None).unwrap();

        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let builder = {
            let index = Arc::clone(&index);
            thread::spawn(move || {
                index.rebuild_with(
                    || {
                        started_tx.send(()).ok();
                        release_rx.recv_timeout(Duration::from_secs(5)).ok();
                        Ok(vec![fp("z", &[40, 41])])
                    },
                    &ivf(),
                    None,
                )
            })
        };

        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let q = BitVector::from_on_bits(64, &[0, 1, 2, 3]).unwrap();
        let during = index.search(&q, 1, None).unwrap();
        assert_eq!(during[0].molecule_id, "a");
        assert_eq!(index.handle().unwrap().generation, first.generation);

        release_tx.send(()).unwrap();
        let second = builder.join().unwrap().unwrap();
        assert!(second.generation > first.generation);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_wrong_width_rejected() {
        let index = ApproximateVectorIndex::new(FingerprintType::Custom, 64, ivf());
        let bad = Fingerprint::new(
            "x",
            FingerprintType::Custom,
            BitVector::from_on_bits(128, &[1]).unwrap(),
            None,
            false,
            Utc::now(),
        );
        assert!(index.build(vec![bad], &ivf(), None).is_err());
    }
}
