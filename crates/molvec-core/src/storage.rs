//! Fingerprint storage
//!
//! Two traits cover the durable state: [`FingerprintStore`] for the fingerprints
//! themselves and [`SyncLedger`] for index entries plus the external-sync work
//! queue. The redb backend is only available when the "storage" feature is
//! enabled; [`MemoryStore`](crate::storage_memory::MemoryStore) works everywhere.

use crate::error::StoreError;
use crate::types::{Fingerprint, FingerprintType, IndexEntry, MoleculeId, SyncKey};

#[cfg(feature = "storage")]
use crate::codec::FingerprintCodec;
#[cfg(feature = "storage")]
use bincode::config;
#[cfg(feature = "storage")]
use chrono::{TimeZone, Utc};
#[cfg(feature = "storage")]
use once_cell::sync::Lazy;
#[cfg(feature = "storage")]
use parking_lot::Mutex;
#[cfg(feature = "storage")]
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
#[cfg(feature = "storage")]
use std::collections::HashMap;
#[cfg(feature = "storage")]
use std::path::{Path, PathBuf};
#[cfg(feature = "storage")]
use std::sync::Arc;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Durable keyed storage of fingerprints, one record per `(molecule_id, type)`
///
/// Writes are atomic per call: a concurrent reader sees either the old record
/// or the new one. I/O failures are returned as-is; retries are up to the caller.
pub trait FingerprintStore: Send + Sync {
    /// Upsert a fingerprint
    fn put(&self, fingerprint: &Fingerprint) -> StoreResult<()> {
        self.replace(fingerprint).map(|_| ())
    }

    /// Upsert a fingerprint, returning the record it superseded
    fn replace(&self, fingerprint: &Fingerprint) -> StoreResult<Option<Fingerprint>>;

    /// Upsert many fingerprints in one atomic write
    fn put_batch(&self, fingerprints: &[Fingerprint]) -> StoreResult<()>;

    /// Fetch one fingerprint
    fn get(
        &self,
        molecule_id: &str,
        fingerprint_type: FingerprintType,
    ) -> StoreResult<Option<Fingerprint>>;

    /// Fetch many fingerprints, preserving input order
    fn get_batch(
        &self,
        molecule_ids: &[MoleculeId],
        fingerprint_type: FingerprintType,
    ) -> StoreResult<Vec<Option<Fingerprint>>>;

    /// Delete a fingerprint; `false` when there was nothing to delete
    fn delete(&self, molecule_id: &str, fingerprint_type: FingerprintType) -> StoreResult<bool>;

    /// Number of fingerprints of a family
    fn count(&self, fingerprint_type: FingerprintType) -> StoreResult<usize>;

    /// Every fingerprint of a family
    fn scan(&self, fingerprint_type: FingerprintType) -> StoreResult<Vec<Fingerprint>>;

    /// Keep a superseded version, dropping the oldest beyond `max_versions`
    fn archive(&self, fingerprint: &Fingerprint, max_versions: usize) -> StoreResult<()>;

    /// Archived versions, oldest first
    fn archived_versions(
        &self,
        molecule_id: &str,
        fingerprint_type: FingerprintType,
    ) -> StoreResult<Vec<Fingerprint>>;
}

/// Index entries and the durable external-sync queue
pub trait SyncLedger: Send + Sync {
    /// Upsert an index entry
    fn put_entry(&self, entry: &IndexEntry) -> StoreResult<()>;

    /// Fetch an index entry
    fn get_entry(&self, key: &SyncKey) -> StoreResult<Option<IndexEntry>>;

    /// Delete an index entry
    fn delete_entry(&self, key: &SyncKey) -> StoreResult<bool>;

    /// Every index entry of a family
    fn entries(&self, fingerprint_type: FingerprintType) -> StoreResult<Vec<IndexEntry>>;

    /// Add a key to the sync queue; already-queued keys keep their position
    fn enqueue(&self, key: &SyncKey) -> StoreResult<()>;

    /// Up to `limit` queued keys, oldest first
    fn queued(&self, limit: usize) -> StoreResult<Vec<SyncKey>>;

    /// Remove a key from the sync queue
    fn dequeue(&self, key: &SyncKey) -> StoreResult<bool>;

    /// Number of queued keys
    fn queue_len(&self) -> StoreResult<usize>;

    /// Number of queued keys of one family
    fn queue_len_for(&self, fingerprint_type: FingerprintType) -> StoreResult<usize>;
}

/// Everything the engine needs from a backend
pub trait EngineStore: FingerprintStore + SyncLedger {}

impl<T: FingerprintStore + SyncLedger> EngineStore for T {}

#[cfg(feature = "storage")]
const FINGERPRINTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("fingerprints");
#[cfg(feature = "storage")]
const ARCHIVE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("archive");
#[cfg(feature = "storage")]
const INDEX_ENTRIES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("index_entries");
#[cfg(feature = "storage")]
const SYNC_QUEUE_TABLE: TableDefinition<&str, u64> = TableDefinition::new("sync_queue");
// Same queue keyed by sequence number, for oldest-first range reads
#[cfg(feature = "storage")]
const SYNC_ORDER_TABLE: TableDefinition<u64, &str> = TableDefinition::new("sync_queue_order");

// Shared connection pool so several stores can open the same database file
#[cfg(feature = "storage")]
static DB_POOL: Lazy<Mutex<HashMap<PathBuf, Arc<Database>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// On-disk fingerprint record
#[cfg(feature = "storage")]
#[derive(bincode::Encode, bincode::Decode)]
struct FingerprintRecord {
    molecule_id: String,
    fingerprint_type: String,
    bits: Vec<u8>,
    num_bits: u64,
    radius: Option<u32>,
    use_features: bool,
    generated_at_secs: i64,
    generated_at_nanos: u32,
}

#[cfg(feature = "storage")]
fn encode_fingerprint(fp: &Fingerprint) -> StoreResult<Vec<u8>> {
    let record = FingerprintRecord {
        molecule_id: fp.molecule_id().to_string(),
        fingerprint_type: fp.fingerprint_type().as_str().to_string(),
        bits: FingerprintCodec::encode(fp.bits()),
        num_bits: fp.num_bits() as u64,
        radius: fp.radius(),
        use_features: fp.use_features(),
        generated_at_secs: fp.generated_at().timestamp(),
        generated_at_nanos: fp.generated_at().timestamp_subsec_nanos(),
    };
    bincode::encode_to_vec(&record, config::standard())
        .map_err(|e| StoreError::IoFailure(format!("encode fingerprint: {}", e)))
}

#[cfg(feature = "storage")]
fn decode_fingerprint(raw: &[u8]) -> StoreResult<Fingerprint> {
    let (record, _): (FingerprintRecord, usize) =
        bincode::decode_from_slice(raw, config::standard())
            .map_err(|e| StoreError::IoFailure(format!("decode fingerprint: {}", e)))?;
    let corrupt = |what: String| StoreError::IoFailure(format!("corrupt record: {}", what));

    let fingerprint_type =
        FingerprintType::parse(&record.fingerprint_type).map_err(|e| corrupt(e.to_string()))?;
    let bits = FingerprintCodec::decode(&record.bits, record.num_bits as usize)
        .map_err(|e| corrupt(e.to_string()))?;
    let generated_at = Utc
        .timestamp_opt(record.generated_at_secs, record.generated_at_nanos)
        .single()
        .ok_or_else(|| {
            corrupt(format!(
                "timestamp {}.{:09}",
                record.generated_at_secs, record.generated_at_nanos
            ))
        })?;

    Ok(Fingerprint::new(
        record.molecule_id,
        fingerprint_type,
        bits,
        record.radius,
        record.use_features,
        generated_at,
    ))
}

#[cfg(feature = "storage")]
fn encode_entry(entry: &IndexEntry) -> StoreResult<String> {
    serde_json::to_string(entry).map_err(|e| StoreError::IoFailure(e.to_string()))
}

#[cfg(feature = "storage")]
fn decode_entry(raw: &str) -> StoreResult<IndexEntry> {
    serde_json::from_str(raw).map_err(|e| StoreError::IoFailure(e.to_string()))
}

/// Key range covering every record of one family (`type:` up to `type;`)
#[cfg(feature = "storage")]
fn type_range(fingerprint_type: FingerprintType) -> (String, String) {
    let ty = fingerprint_type.as_str();
    (format!("{}:", ty), format!("{};", ty))
}

/// Archive keys sort by generation time within one molecule
#[cfg(feature = "storage")]
fn archive_key(fp: &Fingerprint) -> String {
    let at = fp.generated_at();
    let secs = (at.timestamp() as i128 - i64::MIN as i128) as u64;
    format!(
        "{}\0{:020}{:09}",
        fp.key().encode(),
        secs,
        at.timestamp_subsec_nanos()
    )
}

#[cfg(feature = "storage")]
fn archive_range(key: &SyncKey) -> (String, String) {
    let base = key.encode();
    (format!("{}\0", base), format!("{}\u{1}", base))
}

/// Durable store backed by redb
#[cfg(feature = "storage")]
pub struct RedbStore {
    db: Arc<Database>,
    path: PathBuf,
}

#[cfg(feature = "storage")]
impl RedbStore {
    /// Create or open a store at the given path
    ///
    /// Stores opened on the same path share one `Database` through a process-wide
    /// pool, since redb holds an exclusive file lock.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path_ref = path.as_ref();
        let path_buf = path_ref
            .canonicalize()
            .unwrap_or_else(|_| path_ref.to_path_buf());

        let db = {
            let mut pool = DB_POOL.lock();

            if let Some(existing_db) = pool.get(&path_buf) {
                Arc::clone(existing_db)
            } else {
                let new_db = Arc::new(Database::create(&path_buf)?);

                let write_txn = new_db.begin_write()?;
                {
                    let _ = write_txn.open_table(FINGERPRINTS_TABLE)?;
                    let _ = write_txn.open_table(ARCHIVE_TABLE)?;
                    let _ = write_txn.open_table(INDEX_ENTRIES_TABLE)?;
                    let queue = write_txn.open_table(SYNC_QUEUE_TABLE)?;
                    let mut order = write_txn.open_table(SYNC_ORDER_TABLE)?;
                    if order.is_empty()? && !queue.is_empty()? {
                        // Files written before the order table existed
                        for item in queue.iter()? {
                            let (k, v) = item?;
                            order.insert(v.value(), k.value())?;
                        }
                    }
                }
                write_txn.commit()?;

                pool.insert(path_buf.clone(), Arc::clone(&new_db));
                new_db
            }
        };

        tracing::debug!(path = %path_buf.display(), "opened fingerprint store");
        Ok(Self { db, path: path_buf })
    }

    /// Database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn trim_archive(
        table: &mut redb::Table<'_, &'static str, &'static [u8]>,
        key: &SyncKey,
        max_versions: usize,
    ) -> StoreResult<()> {
        let (start, end) = archive_range(key);
        let mut keys = Vec::new();
        for item in table.range::<&str>(start.as_str()..end.as_str())? {
            let (k, _) = item?;
            keys.push(k.value().to_string());
        }
        if keys.len() > max_versions {
            let excess = keys.len() - max_versions;
            for k in keys.iter().take(excess) {
                table.remove(k.as_str())?;
            }
        }
        Ok(())
    }
}

#[cfg(feature = "storage")]
impl FingerprintStore for RedbStore {
    fn replace(&self, fingerprint: &Fingerprint) -> StoreResult<Option<Fingerprint>> {
        let key = fingerprint.key().encode();
        let data = encode_fingerprint(fingerprint)?;

        let write_txn = self.db.begin_write()?;
        let previous = {
            let mut table = write_txn.open_table(FINGERPRINTS_TABLE)?;
            let old = table
                .insert(key.as_str(), data.as_slice())?
                .map(|guard| guard.value().to_vec());
            old
        };
        write_txn.commit()?;

        previous.map(|raw| decode_fingerprint(&raw)).transpose()
    }

    fn put_batch(&self, fingerprints: &[Fingerprint]) -> StoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(FINGERPRINTS_TABLE)?;
            for fp in fingerprints {
                let data = encode_fingerprint(fp)?;
                table.insert(fp.key().encode().as_str(), data.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get(
        &self,
        molecule_id: &str,
        fingerprint_type: FingerprintType,
    ) -> StoreResult<Option<Fingerprint>> {
        let key = SyncKey::new(molecule_id, fingerprint_type).encode();
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FINGERPRINTS_TABLE)?;

        let Some(data) = table.get(key.as_str())? else {
            return Ok(None);
        };
        decode_fingerprint(data.value()).map(Some)
    }

    fn get_batch(
        &self,
        molecule_ids: &[MoleculeId],
        fingerprint_type: FingerprintType,
    ) -> StoreResult<Vec<Option<Fingerprint>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FINGERPRINTS_TABLE)?;

        let mut out = Vec::with_capacity(molecule_ids.len());
        for id in molecule_ids {
            let key = SyncKey::new(id.as_str(), fingerprint_type).encode();
            match table.get(key.as_str())? {
                Some(data) => out.push(Some(decode_fingerprint(data.value())?)),
                None => out.push(None),
            }
        }
        Ok(out)
    }

    fn delete(&self, molecule_id: &str, fingerprint_type: FingerprintType) -> StoreResult<bool> {
        let key = SyncKey::new(molecule_id, fingerprint_type).encode();
        let write_txn = self.db.begin_write()?;
        let deleted = {
            let mut table = write_txn.open_table(FINGERPRINTS_TABLE)?;
            let removed = table.remove(key.as_str())?.is_some();
            removed
        };
        write_txn.commit()?;
        Ok(deleted)
    }

    fn count(&self, fingerprint_type: FingerprintType) -> StoreResult<usize> {
        let (start, end) = type_range(fingerprint_type);
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FINGERPRINTS_TABLE)?;
        let mut n = 0;
        for item in table.range::<&str>(start.as_str()..end.as_str())? {
            item?;
            n += 1;
        }
        Ok(n)
    }

    fn scan(&self, fingerprint_type: FingerprintType) -> StoreResult<Vec<Fingerprint>> {
        let (start, end) = type_range(fingerprint_type);
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FINGERPRINTS_TABLE)?;
        let mut out = Vec::new();
        for item in table.range::<&str>(start.as_str()..end.as_str())? {
            let (_, value) = item?;
            out.push(decode_fingerprint(value.value())?);
        }
        Ok(out)
    }

    fn archive(&self, fingerprint: &Fingerprint, max_versions: usize) -> StoreResult<()> {
        let data = encode_fingerprint(fingerprint)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(ARCHIVE_TABLE)?;
            table.insert(archive_key(fingerprint).as_str(), data.as_slice())?;
            Self::trim_archive(&mut table, &fingerprint.key(), max_versions)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn archived_versions(
        &self,
        molecule_id: &str,
        fingerprint_type: FingerprintType,
    ) -> StoreResult<Vec<Fingerprint>> {
        let (start, end) = archive_range(&SyncKey::new(molecule_id, fingerprint_type));
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ARCHIVE_TABLE)?;
        let mut out = Vec::new();
        for item in table.range::<&str>(start.as_str()..end.as_str())? {
            let (_, value) = item?;
            out.push(decode_fingerprint(value.value())?);
        }
        Ok(out)
    }
}

#[cfg(feature = "storage")]
impl SyncLedger for RedbStore {
    fn put_entry(&self, entry: &IndexEntry) -> StoreResult<()> {
        let json = encode_entry(entry)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(INDEX_ENTRIES_TABLE)?;
            table.insert(entry.key().encode().as_str(), json.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get_entry(&self, key: &SyncKey) -> StoreResult<Option<IndexEntry>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(INDEX_ENTRIES_TABLE)?;
        let Some(raw) = table.get(key.encode().as_str())? else {
            return Ok(None);
        };
        decode_entry(raw.value()).map(Some)
    }

    fn delete_entry(&self, key: &SyncKey) -> StoreResult<bool> {
        let write_txn = self.db.begin_write()?;
        let deleted = {
            let mut table = write_txn.open_table(INDEX_ENTRIES_TABLE)?;
            let removed = table.remove(key.encode().as_str())?.is_some();
            removed
        };
        write_txn.commit()?;
        Ok(deleted)
    }

    fn entries(&self, fingerprint_type: FingerprintType) -> StoreResult<Vec<IndexEntry>> {
        let (start, end) = type_range(fingerprint_type);
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(INDEX_ENTRIES_TABLE)?;
        let mut out = Vec::new();
        for item in table.range::<&str>(start.as_str()..end.as_str())? {
            let (_, value) = item?;
            out.push(decode_entry(value.value())?);
        }
        Ok(out)
    }

    fn enqueue(&self, key: &SyncKey) -> StoreResult<()> {
        let encoded = key.encode();
        let write_txn = self.db.begin_write()?;
        {
            let mut queue = write_txn.open_table(SYNC_QUEUE_TABLE)?;
            if queue.get(encoded.as_str())?.is_none() {
                let mut order = write_txn.open_table(SYNC_ORDER_TABLE)?;
                let seq = match order.last()? {
                    Some((last, _)) => last.value() + 1,
                    None => 0,
                };
                queue.insert(encoded.as_str(), seq)?;
                order.insert(seq, encoded.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn queued(&self, limit: usize) -> StoreResult<Vec<SyncKey>> {
        let read_txn = self.db.begin_read()?;
        let order = read_txn.open_table(SYNC_ORDER_TABLE)?;
        let mut out = Vec::new();
        for item in order.iter()?.take(limit) {
            let (_, raw) = item?;
            out.push(
                SyncKey::decode(raw.value()).map_err(|e| StoreError::IoFailure(e.to_string()))?,
            );
        }
        Ok(out)
    }

    fn dequeue(&self, key: &SyncKey) -> StoreResult<bool> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut queue = write_txn.open_table(SYNC_QUEUE_TABLE)?;
            let seq = queue.remove(key.encode().as_str())?.map(|v| v.value());
            if let Some(seq) = seq {
                let mut order = write_txn.open_table(SYNC_ORDER_TABLE)?;
                order.remove(seq)?;
            }
            seq.is_some()
        };
        write_txn.commit()?;
        Ok(removed)
    }

    fn queue_len(&self) -> StoreResult<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SYNC_QUEUE_TABLE)?;
        Ok(table.len()? as usize)
    }

    fn queue_len_for(&self, fingerprint_type: FingerprintType) -> StoreResult<usize> {
        let (start, end) = type_range(fingerprint_type);
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SYNC_QUEUE_TABLE)?;
        let mut count = 0;
        for item in table.range::<&str>(start.as_str()..end.as_str())? {
            item?;
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(all(test, feature = "storage"))]
mod tests {
    use super::*;
    use crate::bits::BitVector;
    use crate::types::SyncState;
    use chrono::Duration;
    use tempfile::tempdir;

    fn fp(id: &str, bits: &[usize]) -> Fingerprint {
        Fingerprint::new(
            id,
            FingerprintType::Morgan,
            BitVector::from_on_bits(2048, bits).unwrap(),
            Some(2),
            false,
            Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
        )
    }

    #[test]
    fn test_put_and_get() -> StoreResult<()> {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("fp.db"))?;

        store.put(&fp("M1", &[0, 5, 10]))?;
        let got = store.get("M1", FingerprintType::Morgan)?.unwrap();
        assert_eq!(got, fp("M1", &[0, 5, 10]));
        assert_eq!(got.num_on_bits(), 3);
        assert!(store.get("M1", FingerprintType::Maccs)?.is_none());
        Ok(())
    }

    #[test]
    fn test_replace_returns_previous() -> StoreResult<()> {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("fp.db"))?;

        assert!(store.replace(&fp("M1", &[1]))?.is_none());
        let prev = store.replace(&fp("M1", &[2]))?.unwrap();
        assert_eq!(prev.bits().on_bits(), vec![1]);
        assert_eq!(store.count(FingerprintType::Morgan)?, 1);
        Ok(())
    }

    #[test]
    fn test_get_batch_preserves_order() -> StoreResult<()> {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("fp.db"))?;
        store.put_batch(&[fp("A", &[1]), fp("B", &[2])])?;

        let ids = vec!["B".to_string(), "missing".to_string(), "A".to_string()];
        let got = store.get_batch(&ids, FingerprintType::Morgan)?;
        assert_eq!(got[0].as_ref().unwrap().molecule_id(), "B");
        assert!(got[1].is_none());
        assert_eq!(got[2].as_ref().unwrap().molecule_id(), "A");
        Ok(())
    }

    #[test]
    fn test_delete_absent_is_noop() -> StoreResult<()> {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("fp.db"))?;
        store.put(&fp("A", &[1]))?;
        assert!(store.delete("A", FingerprintType::Morgan)?);
        assert!(!store.delete("A", FingerprintType::Morgan)?);
        assert!(!store.delete("A", FingerprintType::Morgan)?);
        Ok(())
    }

    #[test]
    fn test_scan_is_per_type() -> StoreResult<()> {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("fp.db"))?;
        store.put(&fp("A", &[1]))?;
        let maccs = Fingerprint::new(
            "A",
            FingerprintType::Maccs,
            BitVector::from_on_bits(167, &[3]).unwrap(),
            None,
            false,
            Utc::now(),
        );
        store.put(&maccs)?;
        assert_eq!(store.scan(FingerprintType::Morgan)?.len(), 1);
        assert_eq!(store.scan(FingerprintType::Maccs)?.len(), 1);
        assert_eq!(store.count(FingerprintType::Rdkit)?, 0);
        Ok(())
    }

    #[test]
    fn test_archive_keeps_newest_versions() -> StoreResult<()> {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("fp.db"))?;
        let base = fp("A", &[1]);
        for i in 0..4 {
            let version = Fingerprint::new(
                "A",
                FingerprintType::Morgan,
                BitVector::from_on_bits(2048, &[i]).unwrap(),
                Some(2),
                false,
                base.generated_at() + Duration::seconds(i as i64),
            );
            store.archive(&version, 2)?;
        }
        let kept = store.archived_versions("A", FingerprintType::Morgan)?;
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].bits().on_bits(), vec![2]);
        assert_eq!(kept[1].bits().on_bits(), vec![3]);
        Ok(())
    }

    #[test]
    fn test_entries_and_queue_survive_reopen() -> StoreResult<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fp.db");
        let key = SyncKey::new("A", FingerprintType::Morgan);
        {
            let store = RedbStore::open(&path)?;
            let mut entry = IndexEntry::new(&fp("A", &[1]), None);
            entry.sync_state = SyncState::Failed {
                reason: "timeout".into(),
            };
            entry.attempts = 2;
            store.put_entry(&entry)?;
            store.enqueue(&SyncKey::new("B", FingerprintType::Morgan))?;
            store.enqueue(&key)?;
            store.enqueue(&SyncKey::new("B", FingerprintType::Morgan))?;
        }

        let store = RedbStore::open(&path)?;
        let entry = store.get_entry(&key)?.unwrap();
        assert_eq!(entry.attempts, 2);
        assert!(matches!(entry.sync_state, SyncState::Failed { .. }));
        assert_eq!(store.queue_len()?, 2);
        assert_eq!(store.queued(10)?[0].molecule_id, "B");
        assert!(store.dequeue(&key)?);
        assert!(!store.dequeue(&key)?);
        assert_eq!(store.queued(10)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_generated_at_keeps_sub_millisecond_precision() -> StoreResult<()> {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("fp.db"))?;
        let at = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let original = Fingerprint::new(
            "A",
            FingerprintType::Morgan,
            BitVector::from_on_bits(2048, &[4]).unwrap(),
            Some(2),
            false,
            at,
        );
        store.put(&original)?;
        let got = store.get("A", FingerprintType::Morgan)?.unwrap();
        assert_eq!(got.generated_at(), at);
        assert_eq!(got, original);

        // Versions a few microseconds apart stay distinct and ordered
        let later = Fingerprint::new(
            "A",
            FingerprintType::Morgan,
            BitVector::from_on_bits(2048, &[5]).unwrap(),
            Some(2),
            false,
            at + Duration::microseconds(3),
        );
        store.archive(&original, 5)?;
        store.archive(&later, 5)?;
        let kept = store.archived_versions("A", FingerprintType::Morgan)?;
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[1].generated_at(), at + Duration::microseconds(3));
        Ok(())
    }

    #[test]
    fn test_queue_is_fifo_and_bounded() -> StoreResult<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fp.db");
        let key = |id: &str| SyncKey::new(id, FingerprintType::Morgan);
        {
            let store = RedbStore::open(&path)?;
            for id in ["C", "A", "B", "D"] {
                store.enqueue(&key(id))?;
            }
            store.enqueue(&key("C"))?;
            let first_two: Vec<_> = store.queued(2)?.into_iter().map(|k| k.molecule_id).collect();
            assert_eq!(first_two, vec!["C", "A"]);

            assert!(store.dequeue(&key("A"))?);
            store.enqueue(&key("A"))?;
            store.enqueue(&SyncKey::new("A", FingerprintType::Maccs))?;
            assert_eq!(store.queue_len_for(FingerprintType::Morgan)?, 4);
            assert_eq!(store.queue_len_for(FingerprintType::Maccs)?, 1);
        }

        // Order survives a reopen and new keys go to the back
        let store = RedbStore::open(&path)?;
        store.enqueue(&key("E"))?;
        let order: Vec<_> = store
            .queued(usize::MAX)?
            .into_iter()
            .map(|k| (k.molecule_id, k.fingerprint_type))
            .collect();
        assert_eq!(
            order,
            vec![
                ("C".to_string(), FingerprintType::Morgan),
                ("B".to_string(), FingerprintType::Morgan),
                ("D".to_string(), FingerprintType::Morgan),
                ("A".to_string(), FingerprintType::Morgan),
                ("A".to_string(), FingerprintType::Maccs),
                ("E".to_string(), FingerprintType::Morgan),
            ]
        );

        for (id, ty) in order {
            assert!(store.dequeue(&SyncKey::new(id, ty))?);
        }
        assert_eq!(store.queue_len()?, 0);
        assert!(store.queued(10)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_multiple_instances_same_path() -> StoreResult<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let a = RedbStore::open(&path)?;
        let b = RedbStore::open(&path)?;
        a.put(&fp("A", &[1]))?;
        assert!(b.get("A", FingerprintType::Morgan)?.is_some());
        Ok(())
    }
}
