//! Query routing across exact, approximate and external backends
//!
//! Small corpora are scanned exactly; medium ones go through the approximate
//! index; large ones through the external service. A failing or unconfigured
//! tier degrades one step down (external, approximate, exact). Approximate and
//! external candidates can be reranked with exact scores.

use crate::bits::BitVector;
use crate::cancel::CancellationToken;
use crate::config::{QueryStrategy, RouterConfig};
use crate::error::{MolvecError, Result};
use crate::external::ExternalIndexAdapter;
use crate::index::{normalize_results, ApproximateVectorIndex, ExactSimilarityIndex, SearchOptions};
use crate::storage::EngineStore;
use crate::types::{MoleculeId, SimilarityResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Corpus size class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorpusTier {
    /// Below `exact_max_corpus`
    Small,
    /// Up to `approximate_max_corpus`
    Medium,
    /// Beyond `approximate_max_corpus`
    Large,
}

impl CorpusTier {
    /// Classify a corpus size
    pub fn classify(corpus_size: usize, config: &RouterConfig) -> Self {
        if corpus_size < config.exact_max_corpus {
            CorpusTier::Small
        } else if corpus_size <= config.approximate_max_corpus {
            CorpusTier::Medium
        } else {
            CorpusTier::Large
        }
    }

    /// Backend serving this class
    pub fn backend(self) -> Backend {
        match self {
            CorpusTier::Small => Backend::Exact,
            CorpusTier::Medium => Backend::Approximate,
            CorpusTier::Large => Backend::External,
        }
    }
}

/// Backend that answered a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Word-parallel brute force
    Exact,
    /// In-process IVF or HNSW
    Approximate,
    /// Out-of-process vector service
    External,
}

impl Backend {
    /// Name used in logs and responses
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Exact => "exact",
            Backend::Approximate => "approximate",
            Backend::External => "external",
        }
    }

    /// Next tier down
    pub fn fallback(self) -> Option<Backend> {
        match self {
            Backend::External => Some(Backend::Approximate),
            Backend::Approximate => Some(Backend::Exact),
            Backend::Exact => None,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ranked answer plus where it came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Best first, ranks 0-based
    pub results: Vec<SimilarityResult>,
    /// Backend that produced the candidates
    pub backend: Backend,
    /// Whether the similarities are exact
    pub exact: bool,
    /// Whether a preferred backend failed and a lower tier answered
    pub degraded: bool,
}

/// Indexes of one fingerprint family
#[derive(Clone)]
pub struct IndexSet {
    /// Exact index, always present
    pub exact: Arc<ExactSimilarityIndex>,
    /// Approximate index, when enabled
    pub approximate: Option<Arc<ApproximateVectorIndex>>,
}

/// Chooses and calls a backend for each query
pub struct SimilarityQueryRouter {
    config: RouterConfig,
    store: Arc<dyn EngineStore>,
    external: Option<Arc<dyn ExternalIndexAdapter>>,
}

impl SimilarityQueryRouter {
    /// Router over a store and an optional external index
    pub fn new(
        config: RouterConfig,
        store: Arc<dyn EngineStore>,
        external: Option<Arc<dyn ExternalIndexAdapter>>,
    ) -> Self {
        Self {
            config,
            store,
            external,
        }
    }

    /// Settings in use
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Backend a query would start at
    pub fn preferred_backend(&self, corpus_size: usize) -> Backend {
        match self.config.strategy {
            QueryStrategy::Auto => CorpusTier::classify(corpus_size, &self.config).backend(),
            QueryStrategy::Exact => Backend::Exact,
            QueryStrategy::Approximate => Backend::Approximate,
            QueryStrategy::External => Backend::External,
        }
    }

    /// Route a query, degrading on failure
    ///
    /// Cancellation is returned as-is. Any other backend error moves the query
    /// one tier down; if the exact tier fails too the query fails.
    pub async fn route(
        &self,
        indexes: &IndexSet,
        query: &BitVector,
        options: &SearchOptions,
        cancel: Option<&CancellationToken>,
    ) -> Result<QueryResponse> {
        let corpus_size = indexes.exact.len();
        let mut next = Some(self.preferred_backend(corpus_size));
        let mut degraded = false;
        let mut failures = Vec::new();

        while let Some(backend) = next {
            crate::cancel::check(cancel, "query routing")?;
            let attempt = match backend {
                Backend::Exact => indexes
                    .exact
                    .search_with(query, options, cancel)
                    .map(|results| (results, true)),
                Backend::Approximate => self.search_approximate(indexes, query, options, cancel),
                Backend::External => self.search_external(indexes, query, options, cancel).await,
            };

            match attempt {
                Ok((results, exact)) => {
                    debug!(
                        backend = %backend,
                        corpus_size,
                        hits = results.len(),
                        degraded,
                        "query served"
                    );
                    return Ok(QueryResponse {
                        results,
                        backend,
                        exact,
                        degraded,
                    });
                }
                Err(e @ MolvecError::Cancelled(_)) => return Err(e),
                Err(e) => {
                    next = backend.fallback();
                    warn!(
                        backend = %backend,
                        fallback = next.map(|b| b.as_str()).unwrap_or("none"),
                        error = %e,
                        "similarity backend failed, serving degraded"
                    );
                    failures.push(format!("{}: {}", backend, e));
                    degraded = true;
                }
            }
        }

        Err(MolvecError::AllBackendsFailed(failures.join("; ")))
    }

    fn candidate_limit(&self, options: &SearchOptions) -> usize {
        let factor = if self.config.rerank {
            self.config.rerank_factor.max(1)
        } else {
            1
        };
        options
            .limit
            .saturating_mul(factor)
            .saturating_add(options.exclude.len())
    }

    fn search_approximate(
        &self,
        indexes: &IndexSet,
        query: &BitVector,
        options: &SearchOptions,
        cancel: Option<&CancellationToken>,
    ) -> Result<(Vec<SimilarityResult>, bool)> {
        let ann = indexes.approximate.as_ref().ok_or_else(|| {
            MolvecError::NotFound("no approximate index configured".into())
        })?;
        let matches = ann.search(query, self.candidate_limit(options), options.ef_search)?;
        crate::cancel::check(cancel, "approximate search")?;

        if self.config.rerank {
            let ids: Vec<MoleculeId> = matches.into_iter().map(|m| m.molecule_id).collect();
            let results = self.rerank(indexes, query, &ids, options, Backend::Approximate)?;
            return Ok((results, true));
        }

        let estimated = matches
            .into_iter()
            .map(|m| SimilarityResult {
                molecule_id: m.molecule_id,
                similarity: m.estimated_tanimoto,
                rank: 0,
            })
            .collect();
        Ok((normalize_results(estimated, options), false))
    }

    async fn search_external(
        &self,
        indexes: &IndexSet,
        query: &BitVector,
        options: &SearchOptions,
        cancel: Option<&CancellationToken>,
    ) -> Result<(Vec<SimilarityResult>, bool)> {
        let external = self
            .external
            .as_ref()
            .ok_or_else(|| MolvecError::NotFound("no external index configured".into()))?;
        let fingerprint_type = indexes.exact.fingerprint_type();

        // Estimates can undershoot; filter on exact scores when reranking
        let candidate_threshold = if self.config.rerank {
            0.0
        } else {
            options.threshold
        };
        let raw = external
            .query(
                fingerprint_type,
                query,
                candidate_threshold,
                self.candidate_limit(options),
            )
            .await?;
        crate::cancel::check(cancel, "external search")?;

        if self.config.rerank {
            let ids: Vec<MoleculeId> = raw.into_iter().map(|r| r.molecule_id).collect();
            let results = self.rerank(indexes, query, &ids, options, Backend::External)?;
            return Ok((results, true));
        }
        Ok((normalize_results(raw, options), false))
    }

    /// Rescore candidates exactly from the store
    ///
    /// Candidates missing from the store are dropped; stale approximate
    /// entries are also removed from the approximate index.
    fn rerank(
        &self,
        indexes: &IndexSet,
        query: &BitVector,
        candidate_ids: &[MoleculeId],
        options: &SearchOptions,
        source: Backend,
    ) -> Result<Vec<SimilarityResult>> {
        let fingerprint_type = indexes.exact.fingerprint_type();
        let fetched = self.store.get_batch(candidate_ids, fingerprint_type)?;

        for (id, slot) in candidate_ids.iter().zip(&fetched) {
            if slot.is_some() {
                continue;
            }
            let err = MolvecError::IndexInconsistency(format!(
                "{} candidate {} ({}) missing from the store",
                source, id, fingerprint_type
            ));
            warn!(error = %err, "dropping candidate");
            if source == Backend::Approximate {
                if let Some(ann) = &indexes.approximate {
                    ann.remove(id);
                }
            }
        }

        indexes.exact.score_batch(query, &fetched, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnnParams;
    use crate::error::AdapterError;
    use crate::external::InMemoryExternalIndex;
    use crate::storage::FingerprintStore;
    use crate::storage_memory::MemoryStore;
    use crate::types::{Fingerprint, FingerprintType};
    use chrono::Utc;

    const BITS: usize = 256;

    fn fp(id: &str, bits: &[usize]) -> Fingerprint {
        Fingerprint::new(
            id,
            FingerprintType::Custom,
            BitVector::from_on_bits(BITS, bits).unwrap(),
            None,
            false,
            Utc::now(),
        )
    }

    fn corpus() -> Vec<Fingerprint> {
        (0..40)
            .map(|i| {
                let on: Vec<usize> = (0..12).map(|j| (i * 5 + j * 3) % BITS).collect();
                fp(&format!("M{i:03}"), &on)
            })
            .collect()
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        indexes: IndexSet,
        corpus: Vec<Fingerprint>,
    }

    fn fixture(build_ann: bool) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let exact = Arc::new(ExactSimilarityIndex::new(FingerprintType::Custom, BITS));
        let corpus = corpus();
        for f in &corpus {
            store.put(f).unwrap();
            exact.insert(f).unwrap();
        }
        let ann = Arc::new(ApproximateVectorIndex::new(
            FingerprintType::Custom,
            BITS,
            AnnParams::hnsw(),
        ));
        if build_ann {
            ann.build(corpus.clone(), &AnnParams::hnsw(), None).unwrap();
        }
        Fixture {
            store,
            indexes: IndexSet {
                exact,
                approximate: Some(ann),
            },
            corpus,
        }
    }

    fn router(
        strategy: QueryStrategy,
        store: Arc<MemoryStore>,
        external: Option<Arc<dyn ExternalIndexAdapter>>,
    ) -> SimilarityQueryRouter {
        SimilarityQueryRouter::new(
            RouterConfig {
                strategy,
                ..Default::default()
            },
            store,
            external,
        )
    }

    #[test]
    fn test_corpus_tiers() {
        let config = RouterConfig {
            exact_max_corpus: 10,
            approximate_max_corpus: 100,
            ..Default::default()
        };
        assert_eq!(CorpusTier::classify(9, &config), CorpusTier::Small);
        assert_eq!(CorpusTier::classify(10, &config), CorpusTier::Medium);
        assert_eq!(CorpusTier::classify(100, &config), CorpusTier::Medium);
        assert_eq!(CorpusTier::classify(101, &config), CorpusTier::Large);
        assert_eq!(CorpusTier::Large.backend(), Backend::External);
    }

    #[tokio::test]
    async fn test_auto_small_corpus_is_exact() {
        let f = fixture(true);
        let r = router(QueryStrategy::Auto, f.store.clone(), None);
        let q = f.corpus[7].bits().clone();
        let resp = r
            .route(&f.indexes, &q, &SearchOptions::new(0.0, 5), None)
            .await
            .unwrap();
        assert_eq!(resp.backend, Backend::Exact);
        assert!(resp.exact);
        assert!(!resp.degraded);
        assert_eq!(resp.results[0].molecule_id, "M007");
        assert_eq!(resp.results[0].similarity, 1.0);
    }

    #[tokio::test]
    async fn test_approximate_rerank_matches_exact() {
        let f = fixture(true);
        let r = router(QueryStrategy::Approximate, f.store.clone(), None);
        let q = f.corpus[12].bits().clone();
        let opts = SearchOptions::new(0.0, 3);
        let resp = r.route(&f.indexes, &q, &opts, None).await.unwrap();
        assert_eq!(resp.backend, Backend::Approximate);
        assert!(resp.exact);
        let truth = f.indexes.exact.search_with(&q, &opts, None).unwrap();
        assert_eq!(resp.results[0], truth[0]);
    }

    #[tokio::test]
    async fn test_fallback_chain_reports_degraded() {
        let f = fixture(false);
        let external = Arc::new(InMemoryExternalIndex::new());
        external.set_available(false);
        let r = router(QueryStrategy::External, f.store.clone(), Some(external));
        let q = f.corpus[3].bits().clone();
        let resp = r
            .route(&f.indexes, &q, &SearchOptions::new(0.5, 5), None)
            .await
            .unwrap();
        // External down, approximate never built
        assert_eq!(resp.backend, Backend::Exact);
        assert!(resp.degraded);
        assert_eq!(resp.results[0].molecule_id, "M003");
    }

    #[tokio::test]
    async fn test_external_rate_limit_falls_back_to_approximate() {
        let f = fixture(true);
        let external = Arc::new(InMemoryExternalIndex::new());
        external.fail_next(1, AdapterError::RateLimited { retry_after: None });
        let r = router(QueryStrategy::External, f.store.clone(), Some(external));
        let q = f.corpus[3].bits().clone();
        let resp = r
            .route(&f.indexes, &q, &SearchOptions::new(0.0, 5), None)
            .await
            .unwrap();
        assert_eq!(resp.backend, Backend::Approximate);
        assert!(resp.degraded);
    }

    #[tokio::test]
    async fn test_all_backends_failed() {
        let f = fixture(false);
        // Query width mismatch makes the exact tier fail as well
        let q = BitVector::from_on_bits(BITS * 2, &[1]).unwrap();
        let r = router(QueryStrategy::Approximate, f.store.clone(), None);
        let err = r
            .route(&f.indexes, &q, &SearchOptions::new(0.0, 5), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MolvecError::AllBackendsFailed(_)));
    }

    #[tokio::test]
    async fn test_cancellation_is_not_degraded() {
        let f = fixture(true);
        let r = router(QueryStrategy::External, f.store.clone(), None);
        let token = CancellationToken::new();
        token.cancel();
        let q = f.corpus[0].bits().clone();
        let err = r
            .route(&f.indexes, &q, &SearchOptions::new(0.0, 5), Some(&token))
            .await
            .unwrap_err();
        assert!(matches!(err, MolvecError::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_missing_candidates_are_purged_from_ann() {
        let f = fixture(true);
        f.store.delete("M012", FingerprintType::Custom).unwrap();
        let r = router(QueryStrategy::Approximate, f.store.clone(), None);
        let q = f.corpus[12].bits().clone();
        let resp = r
            .route(&f.indexes, &q, &SearchOptions::new(0.0, 5), None)
            .await
            .unwrap();
        assert!(resp.results.iter().all(|r| r.molecule_id != "M012"));
        let ann = f.indexes.approximate.as_ref().unwrap();
        assert_eq!(ann.tombstones(), 1);
    }
}
