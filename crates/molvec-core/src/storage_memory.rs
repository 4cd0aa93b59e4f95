//! In-memory storage backend
//!
//! DashMap shards give per-shard write locking; readers of other shards are
//! never blocked. Nothing survives the process.

use crate::error::StoreError;
use crate::storage::{FingerprintStore, StoreResult, SyncLedger};
use crate::types::{Fingerprint, FingerprintType, IndexEntry, MoleculeId, SyncKey};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// In-memory fingerprint store and sync ledger
#[derive(Default)]
pub struct MemoryStore {
    fingerprints: DashMap<SyncKey, Fingerprint>,
    archive: DashMap<SyncKey, Vec<Fingerprint>>,
    entries: DashMap<SyncKey, IndexEntry>,
    queue: DashMap<SyncKey, u64>,
    queue_seq: AtomicU64,
    batch_lock: Mutex<()>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail with `IoFailure` (for exercising error paths)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(StoreError::IoFailure("injected write failure".into()))
        } else {
            Ok(())
        }
    }
}

impl FingerprintStore for MemoryStore {
    fn replace(&self, fingerprint: &Fingerprint) -> StoreResult<Option<Fingerprint>> {
        self.check_writable()?;
        Ok(self
            .fingerprints
            .insert(fingerprint.key(), fingerprint.clone()))
    }

    fn put_batch(&self, fingerprints: &[Fingerprint]) -> StoreResult<()> {
        self.check_writable()?;
        let _guard = self.batch_lock.lock();
        for fp in fingerprints {
            self.fingerprints.insert(fp.key(), fp.clone());
        }
        Ok(())
    }

    fn get(
        &self,
        molecule_id: &str,
        fingerprint_type: FingerprintType,
    ) -> StoreResult<Option<Fingerprint>> {
        Ok(self
            .fingerprints
            .get(&SyncKey::new(molecule_id, fingerprint_type))
            .map(|r| r.value().clone()))
    }

    fn get_batch(
        &self,
        molecule_ids: &[MoleculeId],
        fingerprint_type: FingerprintType,
    ) -> StoreResult<Vec<Option<Fingerprint>>> {
        molecule_ids
            .iter()
            .map(|id| self.get(id, fingerprint_type))
            .collect()
    }

    fn delete(&self, molecule_id: &str, fingerprint_type: FingerprintType) -> StoreResult<bool> {
        self.check_writable()?;
        Ok(self
            .fingerprints
            .remove(&SyncKey::new(molecule_id, fingerprint_type))
            .is_some())
    }

    fn count(&self, fingerprint_type: FingerprintType) -> StoreResult<usize> {
        Ok(self
            .fingerprints
            .iter()
            .filter(|r| r.key().fingerprint_type == fingerprint_type)
            .count())
    }

    fn scan(&self, fingerprint_type: FingerprintType) -> StoreResult<Vec<Fingerprint>> {
        let mut out: Vec<Fingerprint> = self
            .fingerprints
            .iter()
            .filter(|r| r.key().fingerprint_type == fingerprint_type)
            .map(|r| r.value().clone())
            .collect();
        out.sort_by(|a, b| a.molecule_id().cmp(b.molecule_id()));
        Ok(out)
    }

    fn archive(&self, fingerprint: &Fingerprint, max_versions: usize) -> StoreResult<()> {
        self.check_writable()?;
        let mut versions = self.archive.entry(fingerprint.key()).or_default();
        versions.push(fingerprint.clone());
        versions.sort_by_key(|f| f.generated_at());
        if versions.len() > max_versions {
            let excess = versions.len() - max_versions;
            versions.drain(..excess);
        }
        Ok(())
    }

    fn archived_versions(
        &self,
        molecule_id: &str,
        fingerprint_type: FingerprintType,
    ) -> StoreResult<Vec<Fingerprint>> {
        Ok(self
            .archive
            .get(&SyncKey::new(molecule_id, fingerprint_type))
            .map(|r| r.value().clone())
            .unwrap_or_default())
    }
}

impl SyncLedger for MemoryStore {
    fn put_entry(&self, entry: &IndexEntry) -> StoreResult<()> {
        self.check_writable()?;
        self.entries.insert(entry.key(), entry.clone());
        Ok(())
    }

    fn get_entry(&self, key: &SyncKey) -> StoreResult<Option<IndexEntry>> {
        Ok(self.entries.get(key).map(|r| r.value().clone()))
    }

    fn delete_entry(&self, key: &SyncKey) -> StoreResult<bool> {
        self.check_writable()?;
        Ok(self.entries.remove(key).is_some())
    }

    fn entries(&self, fingerprint_type: FingerprintType) -> StoreResult<Vec<IndexEntry>> {
        let mut out: Vec<IndexEntry> = self
            .entries
            .iter()
            .filter(|r| r.key().fingerprint_type == fingerprint_type)
            .map(|r| r.value().clone())
            .collect();
        out.sort_by(|a, b| a.molecule_id.cmp(&b.molecule_id));
        Ok(out)
    }

    fn enqueue(&self, key: &SyncKey) -> StoreResult<()> {
        self.check_writable()?;
        self.queue
            .entry(key.clone())
            .or_insert_with(|| self.queue_seq.fetch_add(1, Ordering::SeqCst));
        Ok(())
    }

    fn queued(&self, limit: usize) -> StoreResult<Vec<SyncKey>> {
        let mut items: Vec<(u64, SyncKey)> = self
            .queue
            .iter()
            .map(|r| (*r.value(), r.key().clone()))
            .collect();
        items.sort();
        Ok(items.into_iter().take(limit).map(|(_, k)| k).collect())
    }

    fn dequeue(&self, key: &SyncKey) -> StoreResult<bool> {
        self.check_writable()?;
        Ok(self.queue.remove(key).is_some())
    }

    fn queue_len(&self) -> StoreResult<usize> {
        Ok(self.queue.len())
    }

    fn queue_len_for(&self, fingerprint_type: FingerprintType) -> StoreResult<usize> {
        Ok(self
            .queue
            .iter()
            .filter(|r| r.key().fingerprint_type == fingerprint_type)
            .count())
    }
}
