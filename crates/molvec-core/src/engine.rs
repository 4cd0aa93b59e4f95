//! Main FingerprintEngine interface
//!
//! Wires ingestion and queries through the store, the per-family indexes,
//! the router and the external sync queue.

use crate::cancel::CancellationToken;
use crate::codec::FingerprintCodec;
use crate::config::{EngineConfig, IndexEntryMode, RetentionPolicy};
use crate::error::{MolvecError, Result};
use crate::external::{ExternalIndexAdapter, TimeoutAdapter};
use crate::index::{ApproximateVectorIndex, ExactSimilarityIndex, IndexHandle, SearchOptions};
use crate::locks::KeyLocks;
use crate::maintenance::MaintenanceTask;
use crate::reconcile::Reconciler;
use crate::router::{IndexSet, QueryResponse, SimilarityQueryRouter};
use crate::storage::{EngineStore, FingerprintStore, SyncLedger};
use crate::storage_memory::MemoryStore;
use crate::types::{
    Fingerprint, FingerprintType, IndexEntry, IndexStats, IngestionEvent, QueryRequest,
    SyncEvent, SyncKey, SyncState, VectorRef,
};
use chrono::Utc;
use parking_lot::MutexGuard;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[cfg(feature = "storage")]
use crate::storage::RedbStore;

/// What an ingestion did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// First fingerprint for this molecule and family
    Inserted,
    /// Replaced a different fingerprint
    Updated,
    /// Identical to the stored fingerprint; nothing written
    Unchanged,
}

/// Molecular fingerprint similarity engine
pub struct FingerprintEngine {
    config: EngineConfig,
    store: Arc<dyn EngineStore>,
    external: Option<Arc<dyn ExternalIndexAdapter>>,
    families: BTreeMap<FingerprintType, IndexSet>,
    router: SimilarityQueryRouter,
    key_locks: Arc<KeyLocks>,
}

impl FingerprintEngine {
    /// Open the engine over an existing store
    ///
    /// Exact indexes are reloaded from the store; approximate generations are
    /// rebuilt for every family with at least `min_build_size` fingerprints.
    /// The external adapter, if any, is wrapped with the configured timeouts.
    pub fn open(
        config: EngineConfig,
        store: Arc<dyn EngineStore>,
        external: Option<Arc<dyn ExternalIndexAdapter>>,
    ) -> Result<Self> {
        config.validate()?;

        let external: Option<Arc<dyn ExternalIndexAdapter>> = external.map(|adapter| {
            Arc::new(TimeoutAdapter::new(
                adapter,
                config.reconciler.push_timeout(),
                config.reconciler.query_timeout(),
            )) as Arc<dyn ExternalIndexAdapter>
        });

        let mut families = BTreeMap::new();
        for ty in config.fingerprint_types.types() {
            let num_bits = config.fingerprint_types.num_bits(ty)?;
            let exact = Arc::new(ExactSimilarityIndex::new(ty, num_bits));
            let approximate = config.approximate.enabled.then(|| {
                Arc::new(ApproximateVectorIndex::new(
                    ty,
                    num_bits,
                    config.approximate.params.clone(),
                ))
            });

            let stored = store.scan(ty)?;
            let mut loaded = Vec::with_capacity(stored.len());
            for fp in stored {
                match exact.insert(&fp) {
                    Ok(()) => loaded.push(fp),
                    Err(e) => tracing::warn!(
                        molecule_id = fp.molecule_id(),
                        fingerprint_type = %ty,
                        error = %e,
                        "skipping stored fingerprint that no longer matches the type table"
                    ),
                }
            }

            if let Some(ann) = &approximate {
                if loaded.len() >= config.approximate.min_build_size {
                    ann.build(loaded.iter().cloned(), &config.approximate.params, None)?;
                }
            }
            if !loaded.is_empty() {
                tracing::info!(
                    fingerprint_type = %ty,
                    fingerprints = loaded.len(),
                    "rebuilt indexes from store"
                );
            }

            families.insert(ty, IndexSet { exact, approximate });
        }

        let router =
            SimilarityQueryRouter::new(config.router.clone(), Arc::clone(&store), external.clone());

        Ok(Self {
            config,
            store,
            external,
            families,
            router,
            key_locks: Arc::new(KeyLocks::default()),
        })
    }

    /// Open with the store named by `config.storage`
    ///
    /// A configured path opens (or creates) a redb file; otherwise the engine
    /// runs in memory.
    pub fn from_config(
        config: EngineConfig,
        external: Option<Arc<dyn ExternalIndexAdapter>>,
    ) -> Result<Self> {
        let store: Arc<dyn EngineStore> = match &config.storage.path {
            #[cfg(feature = "storage")]
            Some(path) => Arc::new(RedbStore::open(path)?),
            #[cfg(not(feature = "storage"))]
            Some(_) => {
                return Err(MolvecError::InvalidConfig(
                    "storage.path requires the \"storage\" feature".into(),
                ))
            }
            None => Arc::new(MemoryStore::new()),
        };
        Self::open(config, store, external)
    }

    /// Configuration in use
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Backing store
    pub fn store(&self) -> &Arc<dyn EngineStore> {
        &self.store
    }

    /// Exact index of a family
    pub fn exact_index(&self, fingerprint_type: FingerprintType) -> Result<Arc<ExactSimilarityIndex>> {
        Ok(Arc::clone(&self.family(fingerprint_type)?.exact))
    }

    /// Approximate index of a family, when enabled
    pub fn approximate_index(
        &self,
        fingerprint_type: FingerprintType,
    ) -> Result<Option<Arc<ApproximateVectorIndex>>> {
        Ok(self.family(fingerprint_type)?.approximate.clone())
    }

    fn family(&self, fingerprint_type: FingerprintType) -> Result<&IndexSet> {
        self.families.get(&fingerprint_type).ok_or_else(|| {
            MolvecError::InvalidParameter(format!(
                "fingerprint type {} is not configured",
                fingerprint_type
            ))
        })
    }

    fn lock_key(&self, key: &SyncKey) -> MutexGuard<'_, ()> {
        self.key_locks.lock(key)
    }

    /// Validate an ingestion event into a fingerprint
    fn fingerprint_from_event(&self, event: &IngestionEvent) -> Result<Fingerprint> {
        let spec = self.config.fingerprint_types.get(event.fingerprint_type)?;
        if event.generation_params.num_bits != spec.num_bits {
            return Err(MolvecError::MalformedFingerprint(format!(
                "{} fingerprints are {} bits, event for {} declares {}",
                event.fingerprint_type,
                spec.num_bits,
                event.molecule_id,
                event.generation_params.num_bits
            )));
        }
        if event.molecule_id.is_empty() {
            return Err(MolvecError::InvalidParameter("molecule_id is empty".into()));
        }
        let bits = FingerprintCodec::decode(&event.bits, spec.num_bits)?;
        Ok(Fingerprint::new(
            event.molecule_id.clone(),
            event.fingerprint_type,
            bits,
            event.generation_params.radius.or(spec.default_radius),
            event.generation_params.use_features,
            event.generated_at.unwrap_or_else(Utc::now),
        ))
    }

    /// Store a fingerprint and project it into the indexes
    ///
    /// Never calls the external index; sync is queued for the reconciler.
    pub fn ingest(&self, event: &IngestionEvent) -> Result<IngestOutcome> {
        let fingerprint = self.fingerprint_from_event(event)?;
        let family = self.family(fingerprint.fingerprint_type())?;
        let key = fingerprint.key();
        let _guard = self.lock_key(&key);

        let current = self
            .store
            .get(fingerprint.molecule_id(), fingerprint.fingerprint_type())?;
        if current
            .as_ref()
            .is_some_and(|c| c.same_content(&fingerprint))
        {
            tracing::debug!(key = %key, "identical fingerprint, ingest skipped");
            return Ok(IngestOutcome::Unchanged);
        }

        let superseded = self.store.replace(&fingerprint)?;
        if let (Some(old), RetentionPolicy::Archive { max_versions }) =
            (&superseded, self.config.retention)
        {
            self.store.archive(old, max_versions)?;
        }

        family.exact.insert(&fingerprint)?;
        let vector_ref = match &family.approximate {
            Some(ann) => ann.insert(&fingerprint)?,
            None => None,
        };
        self.project_entry(&fingerprint, vector_ref)?;

        let outcome = if superseded.is_some() {
            IngestOutcome::Updated
        } else {
            IngestOutcome::Inserted
        };
        tracing::debug!(key = %key, ?outcome, on_bits = fingerprint.num_on_bits(), "ingested");
        Ok(outcome)
    }

    /// Ingest many events; each gets its own outcome
    pub fn ingest_batch(&self, events: &[IngestionEvent]) -> Vec<Result<IngestOutcome>> {
        let outcomes: Vec<Result<IngestOutcome>> = events.iter().map(|e| self.ingest(e)).collect();
        let failed = outcomes.iter().filter(|o| o.is_err()).count();
        tracing::info!(events = events.len(), failed, "batch ingested");
        outcomes
    }

    fn project_entry(&self, fingerprint: &Fingerprint, vector_ref: Option<VectorRef>) -> Result<()> {
        let key = fingerprint.key();
        let entry = match self.store.get_entry(&key)? {
            Some(mut entry) => {
                entry.transition(SyncEvent::FingerprintChanged, Utc::now())?;
                entry.fingerprint_generated_at = fingerprint.generated_at();
                if vector_ref.is_some() {
                    entry.vector_ref = vector_ref;
                }
                entry
            }
            None if self.config.index_entries == IndexEntryMode::Eager => {
                IndexEntry::new(fingerprint, vector_ref)
            }
            None => return Ok(()),
        };
        self.store.put_entry(&entry)?;
        if self.external.is_some() {
            self.store.enqueue(&key)?;
        }
        Ok(())
    }

    /// Delete a molecule's fingerprint of one family
    ///
    /// With an external index the key is queued so the reconciler removes it
    /// there too; the index entry goes once that has happened.
    pub fn remove(&self, molecule_id: &str, fingerprint_type: FingerprintType) -> Result<bool> {
        let family = self.family(fingerprint_type)?;
        let key = SyncKey::new(molecule_id, fingerprint_type);
        let _guard = self.lock_key(&key);

        let deleted = self.store.delete(molecule_id, fingerprint_type)?;
        family.exact.remove(molecule_id);
        if let Some(ann) = &family.approximate {
            ann.remove(molecule_id);
        }

        let had_entry = self.store.get_entry(&key)?.is_some();
        if self.external.is_some() && had_entry {
            self.store.enqueue(&key)?;
        } else {
            self.store.delete_entry(&key)?;
        }
        tracing::debug!(key = %key, deleted, "removed");
        Ok(deleted)
    }

    /// Build a new approximate generation from the store and swap it in
    ///
    /// Also points every index entry at the new generation and creates the
    /// missing ones when entries are created lazily.
    pub fn rebuild_approximate(
        &self,
        fingerprint_type: FingerprintType,
        cancel: Option<&CancellationToken>,
    ) -> Result<IndexHandle> {
        let ann = self
            .family(fingerprint_type)?
            .approximate
            .clone()
            .ok_or_else(|| {
                MolvecError::InvalidParameter("approximate index is disabled".into())
            })?;

        let mut snapshot_ids = Vec::new();
        let handle = ann.rebuild_with(
            || {
                let fingerprints = self.store.scan(fingerprint_type)?;
                snapshot_ids = fingerprints
                    .iter()
                    .map(|fp| fp.molecule_id().to_string())
                    .collect();
                Ok(fingerprints)
            },
            &self.config.approximate.params,
            cancel,
        )?;

        let vector_ref = VectorRef {
            generation: handle.generation,
        };
        let mut with_entry = HashSet::new();
        for mut entry in self.store.entries(fingerprint_type)? {
            with_entry.insert(entry.molecule_id.clone());
            if entry.vector_ref != Some(vector_ref) {
                entry.vector_ref = Some(vector_ref);
                self.store.put_entry(&entry)?;
            }
        }

        let mut created = 0usize;
        for molecule_id in snapshot_ids.iter().filter(|id| !with_entry.contains(*id)) {
            let key = SyncKey::new(molecule_id.as_str(), fingerprint_type);
            let _guard = self.lock_key(&key);
            let Some(fp) = self.store.get(molecule_id, fingerprint_type)? else {
                continue;
            };
            if self.store.get_entry(&key)?.is_some() {
                continue;
            }
            self.store.put_entry(&IndexEntry::new(&fp, Some(vector_ref)))?;
            if self.external.is_some() {
                self.store.enqueue(&key)?;
            }
            created += 1;
        }

        tracing::info!(
            fingerprint_type = %fingerprint_type,
            generation = handle.generation,
            size = handle.size,
            entries_created = created,
            "approximate index rebuilt"
        );
        Ok(handle)
    }

    /// Ranked similarity search
    pub async fn query(&self, request: &QueryRequest) -> Result<QueryResponse> {
        self.query_with_cancel(request, None).await
    }

    /// Ranked similarity search with cooperative cancellation
    pub async fn query_with_cancel(
        &self,
        request: &QueryRequest,
        cancel: Option<&CancellationToken>,
    ) -> Result<QueryResponse> {
        let threshold = request.threshold.unwrap_or(0.0);
        if !(0.0..=1.0).contains(&threshold) {
            return Err(MolvecError::InvalidParameter(format!(
                "threshold {} is outside [0, 1]",
                threshold
            )));
        }
        let num_bits = self.config.fingerprint_types.num_bits(request.fingerprint_type)?;
        let bits = FingerprintCodec::decode_payload(&request.bits, num_bits)?;
        let family = self.family(request.fingerprint_type)?;

        let options = SearchOptions::new(threshold, request.top_k as usize)
            .with_exclude(request.exclude_ids.iter().cloned())
            .with_ef_search(request.ef_search);
        self.router.route(family, &bits, &options, cancel).await
    }

    /// Counters for one family
    pub fn stats(&self, fingerprint_type: FingerprintType) -> Result<IndexStats> {
        let family = self.family(fingerprint_type)?;
        let entries = self.store.entries(fingerprint_type)?;
        let queued_for_sync = self.store.queue_len_for(fingerprint_type)?;
        let failed_sync = entries
            .iter()
            .filter(|e| matches!(e.sync_state, SyncState::Failed { .. }))
            .count();
        let last_updated = entries.iter().map(|e| e.fingerprint_generated_at).max();
        let ann = family.approximate.as_deref();

        Ok(IndexStats {
            fingerprint_type,
            total_fingerprints: self.store.count(fingerprint_type)?,
            exact_indexed: family.exact.len(),
            approximate_indexed: ann.map(|a| a.len()).unwrap_or(0),
            approximate_tombstones: ann.map(|a| a.tombstones()).unwrap_or(0),
            approximate_generation: ann.and_then(|a| a.handle()).map(|h| h.generation),
            queued_for_sync,
            failed_sync,
            last_updated,
        })
    }

    /// Reconciler draining this engine's sync queue, when an external index is configured
    pub fn reconciler(&self) -> Option<Reconciler> {
        self.external.as_ref().map(|external| {
            Reconciler::new(
                Arc::clone(&self.store),
                Arc::clone(external),
                self.config.reconciler.clone(),
            )
            .with_key_locks(Arc::clone(&self.key_locks))
        })
    }

    /// Start the reconciler and one maintenance task per approximate index
    ///
    /// Every task stops once `shutdown` carries `true`.
    pub fn spawn_background(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        if let Some(reconciler) = self.reconciler() {
            handles.push(Arc::new(reconciler).spawn(shutdown.clone()));
        }
        for (ty, family) in &self.families {
            if family.approximate.is_some() {
                let task = MaintenanceTask::new(Arc::clone(self), *ty);
                handles.push(Arc::new(task).spawn(shutdown.clone()));
            }
        }
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::BitVector;
    use crate::external::InMemoryExternalIndex;
    use crate::router::Backend;
    use crate::types::{FingerprintPayload, GenerationParams};

    fn event(id: &str, bits: &[usize]) -> IngestionEvent {
        let bv = BitVector::from_on_bits(2048, bits).unwrap();
        IngestionEvent {
            molecule_id: id.to_string(),
            fingerprint_type: FingerprintType::Morgan,
            bits: FingerprintCodec::encode(&bv),
            generation_params: GenerationParams {
                num_bits: 2048,
                radius: Some(2),
                use_features: false,
            },
            generated_at: None,
        }
    }

    fn engine(external: Option<Arc<dyn ExternalIndexAdapter>>) -> FingerprintEngine {
        FingerprintEngine::open(
            EngineConfig::default(),
            Arc::new(MemoryStore::new()),
            external,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_ingest_then_query() {
        let engine = engine(None);
        assert_eq!(
            engine.ingest(&event("M1", &[0, 5, 10])).unwrap(),
            IngestOutcome::Inserted
        );
        engine.ingest(&event("M2", &[0, 5, 20])).unwrap();

        let q = BitVector::from_on_bits(2048, &[0, 5, 10]).unwrap();
        let request = QueryRequest::new(
            FingerprintType::Morgan,
            FingerprintPayload::Hex(FingerprintCodec::to_hex(&q)),
            10,
        );
        let resp = engine.query(&request).await.unwrap();
        assert_eq!(resp.backend, Backend::Exact);
        assert_eq!(resp.results.len(), 2);
        assert_eq!(resp.results[0].molecule_id, "M1");
        assert_eq!(resp.results[1].similarity, 0.5);
    }

    #[test]
    fn test_identical_reingest_is_unchanged() {
        let engine = engine(None);
        engine.ingest(&event("M1", &[1, 2])).unwrap();
        assert_eq!(
            engine.ingest(&event("M1", &[1, 2])).unwrap(),
            IngestOutcome::Unchanged
        );
        assert_eq!(
            engine.ingest(&event("M1", &[1, 3])).unwrap(),
            IngestOutcome::Updated
        );
        assert_eq!(engine.stats(FingerprintType::Morgan).unwrap().total_fingerprints, 1);
    }

    #[test]
    fn test_malformed_events_rejected() {
        let engine = engine(None);
        let mut short = event("M1", &[1]);
        short.bits.pop();
        assert!(matches!(
            engine.ingest(&short),
            Err(MolvecError::MalformedFingerprint(_))
        ));

        let mut wrong_width = event("M1", &[1]);
        wrong_width.generation_params.num_bits = 1024;
        assert!(matches!(
            engine.ingest(&wrong_width),
            Err(MolvecError::MalformedFingerprint(_))
        ));
        assert_eq!(engine.stats(FingerprintType::Morgan).unwrap().total_fingerprints, 0);
    }

    #[test]
    fn test_sync_queue_only_with_external() {
        let plain = engine(None);
        plain.ingest(&event("M1", &[1])).unwrap();
        assert_eq!(plain.stats(FingerprintType::Morgan).unwrap().queued_for_sync, 0);

        let synced = engine(Some(Arc::new(InMemoryExternalIndex::new())));
        synced.ingest(&event("M1", &[1])).unwrap();
        let stats = synced.stats(FingerprintType::Morgan).unwrap();
        assert_eq!(stats.queued_for_sync, 1);
        let entry = synced
            .store()
            .get_entry(&SyncKey::new("M1", FingerprintType::Morgan))
            .unwrap()
            .unwrap();
        assert_eq!(entry.sync_state, SyncState::Pending);
    }

    #[test]
    fn test_remove_clears_indexes() {
        let engine = engine(None);
        engine.ingest(&event("M1", &[1])).unwrap();
        assert!(engine.remove("M1", FingerprintType::Morgan).unwrap());
        assert!(!engine.remove("M1", FingerprintType::Morgan).unwrap());
        let stats = engine.stats(FingerprintType::Morgan).unwrap();
        assert_eq!(stats.total_fingerprints, 0);
        assert_eq!(stats.exact_indexed, 0);
    }

    #[test]
    fn test_lazy_entries_created_on_rebuild() {
        let config = EngineConfig {
            index_entries: IndexEntryMode::Lazy,
            ..Default::default()
        };
        let engine = FingerprintEngine::open(config, Arc::new(MemoryStore::new()), None).unwrap();
        for i in 0..20 {
            engine.ingest(&event(&format!("M{i}"), &[i, i + 100])).unwrap();
        }
        assert!(engine.store().entries(FingerprintType::Morgan).unwrap().is_empty());

        let handle = engine
            .rebuild_approximate(FingerprintType::Morgan, None)
            .unwrap();
        let entries = engine.store().entries(FingerprintType::Morgan).unwrap();
        assert_eq!(entries.len(), 20);
        assert!(entries.iter().all(|e| e.vector_ref
            == Some(VectorRef {
                generation: handle.generation
            })));
    }
}
