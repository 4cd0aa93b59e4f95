//! External vector index boundary
//!
//! The engine never awaits these calls on the ingestion path. Pushes happen
//! from the reconciliation loop; queries come from the router's top tier. Every
//! call made by the engine goes through [`TimeoutAdapter`].

use crate::bits::BitVector;
use crate::codec::FingerprintCodec;
use crate::error::AdapterError;
use crate::similarity::{cosine_to_tanimoto, dot};
use crate::types::{ExternalId, Fingerprint, FingerprintType, SimilarityResult, SyncKey};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Result type for adapter calls
pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Out-of-process vector index
#[async_trait]
pub trait ExternalIndexAdapter: Send + Sync {
    /// Upload (or overwrite) a molecule's fingerprint
    async fn push(&self, molecule_id: &str, fingerprint: &Fingerprint) -> AdapterResult<ExternalId>;

    /// Similarity query; results carry the service's similarity estimate
    async fn query(
        &self,
        fingerprint_type: FingerprintType,
        bits: &BitVector,
        threshold: f64,
        limit: usize,
    ) -> AdapterResult<Vec<SimilarityResult>>;

    /// Drop a molecule; `false` when the service did not hold it
    async fn remove(&self, molecule_id: &str, fingerprint_type: FingerprintType)
        -> AdapterResult<bool>;
}

#[async_trait]
impl<A: ExternalIndexAdapter + ?Sized> ExternalIndexAdapter for Arc<A> {
    async fn push(&self, molecule_id: &str, fingerprint: &Fingerprint) -> AdapterResult<ExternalId> {
        (**self).push(molecule_id, fingerprint).await
    }

    async fn query(
        &self,
        fingerprint_type: FingerprintType,
        bits: &BitVector,
        threshold: f64,
        limit: usize,
    ) -> AdapterResult<Vec<SimilarityResult>> {
        (**self).query(fingerprint_type, bits, threshold, limit).await
    }

    async fn remove(
        &self,
        molecule_id: &str,
        fingerprint_type: FingerprintType,
    ) -> AdapterResult<bool> {
        (**self).remove(molecule_id, fingerprint_type).await
    }
}

/// Bounds every call of the wrapped adapter; an elapsed bound is a failure
pub struct TimeoutAdapter<A> {
    inner: A,
    push_timeout: Duration,
    query_timeout: Duration,
}

impl<A: ExternalIndexAdapter> TimeoutAdapter<A> {
    /// Wrap `inner` with per-call bounds
    pub fn new(inner: A, push_timeout: Duration, query_timeout: Duration) -> Self {
        Self {
            inner,
            push_timeout,
            query_timeout,
        }
    }

    /// Wrapped adapter
    pub fn inner(&self) -> &A {
        &self.inner
    }
}

#[async_trait]
impl<A: ExternalIndexAdapter> ExternalIndexAdapter for TimeoutAdapter<A> {
    async fn push(&self, molecule_id: &str, fingerprint: &Fingerprint) -> AdapterResult<ExternalId> {
        tokio::time::timeout(self.push_timeout, self.inner.push(molecule_id, fingerprint))
            .await
            .map_err(|_| AdapterError::Timeout(self.push_timeout))?
    }

    async fn query(
        &self,
        fingerprint_type: FingerprintType,
        bits: &BitVector,
        threshold: f64,
        limit: usize,
    ) -> AdapterResult<Vec<SimilarityResult>> {
        tokio::time::timeout(
            self.query_timeout,
            self.inner.query(fingerprint_type, bits, threshold, limit),
        )
        .await
        .map_err(|_| AdapterError::Timeout(self.query_timeout))?
    }

    async fn remove(
        &self,
        molecule_id: &str,
        fingerprint_type: FingerprintType,
    ) -> AdapterResult<bool> {
        tokio::time::timeout(self.push_timeout, self.inner.remove(molecule_id, fingerprint_type))
            .await
            .map_err(|_| AdapterError::Timeout(self.push_timeout))?
    }
}

struct ExternalRecord {
    external_id: ExternalId,
    vector: Vec<f32>,
    ones: u32,
}

/// In-process stand-in for an external vector service
///
/// Scores by cosine over normalized float vectors, like a pgvector-style
/// service would, and reports the Tanimoto estimate. Failures and latency can
/// be injected.
#[derive(Default)]
pub struct InMemoryExternalIndex {
    records: DashMap<SyncKey, ExternalRecord>,
    next_id: AtomicU64,
    unavailable: AtomicBool,
    failures: Mutex<VecDeque<AdapterError>>,
    latency: Mutex<Option<Duration>>,
    push_calls: AtomicUsize,
    query_calls: AtomicUsize,
}

impl InMemoryExternalIndex {
    /// Empty, available service
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls with `error`
    pub fn fail_next(&self, n: usize, error: AdapterError) {
        let mut failures = self.failures.lock();
        for _ in 0..n {
            failures.push_back(error.clone());
        }
    }

    /// Toggle availability; unavailable services fail every call
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Push attempts seen, including failed ones
    pub fn push_calls(&self) -> usize {
        self.push_calls.load(Ordering::SeqCst)
    }

    /// Query attempts seen, including failed ones
    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    /// Whether a molecule is held
    pub fn contains(&self, molecule_id: &str, fingerprint_type: FingerprintType) -> bool {
        self.records
            .contains_key(&SyncKey::new(molecule_id, fingerprint_type))
    }

    /// Molecules held for a family
    pub fn len(&self, fingerprint_type: FingerprintType) -> usize {
        self.records
            .iter()
            .filter(|r| r.key().fingerprint_type == fingerprint_type)
            .count()
    }

    async fn gate(&self) -> AdapterResult<()> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AdapterError::Unavailable("service marked unavailable".into()));
        }
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl ExternalIndexAdapter for InMemoryExternalIndex {
    async fn push(&self, molecule_id: &str, fingerprint: &Fingerprint) -> AdapterResult<ExternalId> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        self.gate().await?;

        let key = SyncKey::new(molecule_id, fingerprint.fingerprint_type());
        let vector = FingerprintCodec::to_float_vector(fingerprint.bits());
        let ones = fingerprint.num_on_bits();
        let mut record = self.records.entry(key).or_insert_with(|| ExternalRecord {
            external_id: format!("ext-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
            vector: Vec::new(),
            ones: 0,
        });
        record.vector = vector;
        record.ones = ones;
        Ok(record.external_id.clone())
    }

    async fn query(
        &self,
        fingerprint_type: FingerprintType,
        bits: &BitVector,
        threshold: f64,
        limit: usize,
    ) -> AdapterResult<Vec<SimilarityResult>> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        self.gate().await?;

        let q_vec = FingerprintCodec::to_float_vector(bits);
        let q_ones = bits.count_ones();
        let mut scored: Vec<(f64, String)> = self
            .records
            .iter()
            .filter(|r| r.key().fingerprint_type == fingerprint_type)
            .filter(|r| r.value().vector.len() == q_vec.len())
            .map(|r| {
                let cos = dot(&q_vec, &r.value().vector);
                (
                    cosine_to_tanimoto(cos, q_ones, r.value().ones),
                    r.key().molecule_id.clone(),
                )
            })
            .filter(|(sim, _)| *sim >= threshold)
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        scored.truncate(limit);

        Ok(scored
            .into_iter()
            .enumerate()
            .map(|(rank, (similarity, molecule_id))| SimilarityResult {
                molecule_id,
                similarity,
                rank,
            })
            .collect())
    }

    async fn remove(
        &self,
        molecule_id: &str,
        fingerprint_type: FingerprintType,
    ) -> AdapterResult<bool> {
        self.gate().await?;
        Ok(self
            .records
            .remove(&SyncKey::new(molecule_id, fingerprint_type))
            .is_some())
    }
}
