//! Core data model

use crate::bits::BitVector;
use crate::error::{MolvecError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Molecule identifier (opaque, owned by the ingestion collaborator)
pub type MoleculeId = String;

/// Identifier assigned by an external vector index
pub type ExternalId = String;

/// Fingerprint family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintType {
    /// ECFP-like circular fingerprint
    Morgan,
    /// MACCS structural keys
    Maccs,
    /// RDKit topological fingerprint
    Rdkit,
    /// Caller-defined fingerprint
    Custom,
}

impl FingerprintType {
    /// All known families
    pub const ALL: [FingerprintType; 4] = [
        FingerprintType::Morgan,
        FingerprintType::Maccs,
        FingerprintType::Rdkit,
        FingerprintType::Custom,
    ];

    /// Lowercase name, also used in storage keys
    pub fn as_str(&self) -> &'static str {
        match self {
            FingerprintType::Morgan => "morgan",
            FingerprintType::Maccs => "maccs",
            FingerprintType::Rdkit => "rdkit",
            FingerprintType::Custom => "custom",
        }
    }

    /// Parse a lowercase name
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "morgan" => Ok(FingerprintType::Morgan),
            "maccs" => Ok(FingerprintType::Maccs),
            "rdkit" => Ok(FingerprintType::Rdkit),
            "custom" => Ok(FingerprintType::Custom),
            other => Err(MolvecError::InvalidParameter(format!(
                "unknown fingerprint type: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for FingerprintType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters the fingerprint was generated with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Bit width
    pub num_bits: usize,
    /// Morgan radius (2 = ECFP4, 3 = ECFP6)
    #[serde(default)]
    pub radius: Option<u32>,
    /// Feature invariants (FCFP rather than ECFP)
    #[serde(default)]
    pub use_features: bool,
}

/// A stored molecular fingerprint
///
/// Immutable once built: a new generation of the same molecule and family is
/// a new `Fingerprint` with a newer `generated_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprint {
    molecule_id: MoleculeId,
    fingerprint_type: FingerprintType,
    bits: BitVector,
    radius: Option<u32>,
    use_features: bool,
    num_on_bits: u32,
    generated_at: DateTime<Utc>,
}

impl Fingerprint {
    /// Create a fingerprint; `num_on_bits` is derived from `bits`
    pub fn new(
        molecule_id: impl Into<MoleculeId>,
        fingerprint_type: FingerprintType,
        bits: BitVector,
        radius: Option<u32>,
        use_features: bool,
        generated_at: DateTime<Utc>,
    ) -> Self {
        let num_on_bits = bits.count_ones();
        Self {
            molecule_id: molecule_id.into(),
            fingerprint_type,
            bits,
            radius,
            use_features,
            num_on_bits,
            generated_at,
        }
    }

    /// Molecule this fingerprint describes
    pub fn molecule_id(&self) -> &str {
        &self.molecule_id
    }

    /// Fingerprint family
    pub fn fingerprint_type(&self) -> FingerprintType {
        self.fingerprint_type
    }

    /// The bits
    pub fn bits(&self) -> &BitVector {
        &self.bits
    }

    /// Bit width
    pub fn num_bits(&self) -> usize {
        self.bits.num_bits()
    }

    /// Morgan radius, if any
    pub fn radius(&self) -> Option<u32> {
        self.radius
    }

    /// Whether feature invariants were used
    pub fn use_features(&self) -> bool {
        self.use_features
    }

    /// Popcount of `bits`
    pub fn num_on_bits(&self) -> u32 {
        self.num_on_bits
    }

    /// Generation timestamp
    pub fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }

    /// Generation parameters
    pub fn params(&self) -> GenerationParams {
        GenerationParams {
            num_bits: self.num_bits(),
            radius: self.radius,
            use_features: self.use_features,
        }
    }

    /// Same bits and generation parameters, ignoring the timestamp
    pub fn same_content(&self, other: &Fingerprint) -> bool {
        self.fingerprint_type == other.fingerprint_type
            && self.radius == other.radius
            && self.use_features == other.use_features
            && self.bits == other.bits
    }

    /// Storage key for this fingerprint
    pub fn key(&self) -> SyncKey {
        SyncKey::new(self.molecule_id.clone(), self.fingerprint_type)
    }
}

/// `(molecule_id, fingerprint_type)` pair; the unit of storage and sync
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyncKey {
    /// Molecule id
    pub molecule_id: MoleculeId,
    /// Fingerprint family
    pub fingerprint_type: FingerprintType,
}

impl SyncKey {
    /// Create a key
    pub fn new(molecule_id: impl Into<MoleculeId>, fingerprint_type: FingerprintType) -> Self {
        Self {
            molecule_id: molecule_id.into(),
            fingerprint_type,
        }
    }

    /// Flat string form `type:molecule_id`, used as a table key
    pub fn encode(&self) -> String {
        format!("{}:{}", self.fingerprint_type.as_str(), self.molecule_id)
    }

    /// Inverse of [`SyncKey::encode`]
    pub fn decode(raw: &str) -> Result<Self> {
        let (ty, id) = raw
            .split_once(':')
            .ok_or_else(|| MolvecError::Serialization(format!("bad key: {}", raw)))?;
        Ok(Self::new(id, FingerprintType::parse(ty)?))
    }
}

impl fmt::Display for SyncKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.fingerprint_type, self.molecule_id)
    }
}

/// Opaque handle into an approximate index generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorRef {
    /// Generation the vector was written into
    pub generation: u64,
}

/// Sync state of an index entry against the external index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    /// Waiting to be pushed
    Pending,
    /// External index holds the current fingerprint
    Synced,
    /// External index holds an outdated fingerprint
    Stale,
    /// Last push failed
    Failed {
        /// Last failure message
        reason: String,
    },
}

/// Inputs to the sync state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Push accepted by the external index
    PushSucceeded,
    /// The underlying fingerprint was replaced
    FingerprintChanged,
    /// Entry put back on the work queue
    Requeued,
    /// Push rejected or timed out
    PushFailed(String),
}

impl SyncState {
    /// Apply an event; invalid transitions leave the state untouched and error
    pub fn apply(&self, event: &SyncEvent) -> Result<SyncState> {
        use SyncEvent::*;
        use SyncState::*;

        let next = match (self, event) {
            (_, PushFailed(reason)) => Failed {
                reason: reason.clone(),
            },
            (Pending, PushSucceeded) => Synced,
            (Pending, FingerprintChanged) => Pending,
            (Synced | Stale | Failed { .. }, FingerprintChanged) => Stale,
            (Stale | Failed { .. }, Requeued) => Pending,
            (from, event) => {
                return Err(MolvecError::InvalidTransition {
                    from: from.to_string(),
                    event: format!("{:?}", event),
                })
            }
        };
        Ok(next)
    }

    /// Short label
    pub fn label(&self) -> &'static str {
        match self {
            SyncState::Pending => "pending",
            SyncState::Synced => "synced",
            SyncState::Stale => "stale",
            SyncState::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Failed { reason } => write!(f, "failed({})", reason),
            other => f.write_str(other.label()),
        }
    }
}

/// Derived projection of a fingerprint into the index subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Molecule id
    pub molecule_id: MoleculeId,
    /// Fingerprint family
    pub fingerprint_type: FingerprintType,
    /// Handle into the approximate index, when one is configured
    pub vector_ref: Option<VectorRef>,
    /// Id assigned by the external index
    pub external_index_id: Option<ExternalId>,
    /// Current sync state
    pub sync_state: SyncState,
    /// Last successful push (`external_index_synced_at`)
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Consecutive failed pushes
    pub attempts: u32,
    /// Earliest time the reconciler may retry
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// `generated_at` of the fingerprint this entry projects
    pub fingerprint_generated_at: DateTime<Utc>,
}

impl IndexEntry {
    /// Fresh entry in `Pending`
    pub fn new(fingerprint: &Fingerprint, vector_ref: Option<VectorRef>) -> Self {
        Self {
            molecule_id: fingerprint.molecule_id().to_string(),
            fingerprint_type: fingerprint.fingerprint_type(),
            vector_ref,
            external_index_id: None,
            sync_state: SyncState::Pending,
            last_synced_at: None,
            attempts: 0,
            next_attempt_at: None,
            fingerprint_generated_at: fingerprint.generated_at(),
        }
    }

    /// Key of this entry
    pub fn key(&self) -> SyncKey {
        SyncKey::new(self.molecule_id.clone(), self.fingerprint_type)
    }

    /// Apply a sync event, updating bookkeeping fields
    pub fn transition(&mut self, event: SyncEvent, now: DateTime<Utc>) -> Result<()> {
        let next = self.sync_state.apply(&event)?;
        match &event {
            SyncEvent::PushSucceeded => {
                self.attempts = 0;
                self.next_attempt_at = None;
                self.last_synced_at = Some(now);
            }
            SyncEvent::PushFailed(_) => {
                self.attempts += 1;
            }
            SyncEvent::FingerprintChanged => {
                self.attempts = 0;
                self.next_attempt_at = None;
            }
            SyncEvent::Requeued => {}
        }
        self.sync_state = next;
        Ok(())
    }

    /// Whether the reconciler has given up on this entry
    pub fn is_exhausted(&self, max_attempts: u32) -> bool {
        matches!(self.sync_state, SyncState::Failed { .. }) && self.attempts >= max_attempts
    }
}

/// One ranked match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityResult {
    /// Matched molecule
    pub molecule_id: MoleculeId,
    /// Similarity in `[0, 1]`
    pub similarity: f64,
    /// 0-based position in the ranked list
    pub rank: usize,
}

/// Fingerprint bits as carried by a query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintPayload {
    /// Raw binary
    Bytes(Vec<u8>),
    /// Hex text
    Hex(String),
    /// Base64 text
    Base64(String),
}

/// Molecule insert/update event from the ingestion collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionEvent {
    /// Molecule id
    pub molecule_id: MoleculeId,
    /// Fingerprint family
    pub fingerprint_type: FingerprintType,
    /// Raw fingerprint bytes, `ceil(num_bits / 8)` long
    pub bits: Vec<u8>,
    /// How the bits were generated
    pub generation_params: GenerationParams,
    /// Generation time; ingestion time when absent
    #[serde(default)]
    pub generated_at: Option<DateTime<Utc>>,
}

/// Similarity query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Family to search
    pub fingerprint_type: FingerprintType,
    /// Query bits
    pub bits: FingerprintPayload,
    /// Minimum similarity, 0.0 when absent
    #[serde(default)]
    pub threshold: Option<f64>,
    /// Maximum number of results
    pub top_k: u32,
    /// Molecules to leave out of the results
    #[serde(default)]
    pub exclude_ids: Vec<MoleculeId>,
    /// HNSW search breadth override
    #[serde(default)]
    pub ef_search: Option<usize>,
}

impl QueryRequest {
    /// Query with default threshold and no exclusions
    pub fn new(fingerprint_type: FingerprintType, bits: FingerprintPayload, top_k: u32) -> Self {
        Self {
            fingerprint_type,
            bits,
            threshold: None,
            top_k,
            exclude_ids: Vec::new(),
            ef_search: None,
        }
    }

    /// Set the similarity threshold
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    /// Exclude molecules from the results
    pub fn excluding(mut self, ids: impl IntoIterator<Item = MoleculeId>) -> Self {
        self.exclude_ids.extend(ids);
        self
    }
}

/// Statistics about one fingerprint family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    /// Fingerprint family
    pub fingerprint_type: FingerprintType,
    /// Records in the primary store
    pub total_fingerprints: usize,
    /// Fingerprints resident in the exact index
    pub exact_indexed: usize,
    /// Live vectors in the approximate index
    pub approximate_indexed: usize,
    /// Tombstoned vectors awaiting compaction
    pub approximate_tombstones: usize,
    /// Current approximate generation
    pub approximate_generation: Option<u64>,
    /// Entries waiting in the sync queue
    pub queued_for_sync: usize,
    /// Entries in `Failed`
    pub failed_sync: usize,
    /// Newest `generated_at` seen
    pub last_updated: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(bits: &[usize]) -> Fingerprint {
        Fingerprint::new(
            "M1",
            FingerprintType::Morgan,
            BitVector::from_on_bits(2048, bits).unwrap(),
            Some(2),
            false,
            Utc::now(),
        )
    }

    #[test]
    fn test_num_on_bits_matches_popcount() {
        let f = fp(&[0, 5, 10]);
        assert_eq!(f.num_on_bits(), 3);
        assert_eq!(f.num_on_bits(), f.bits().count_ones());
    }

    #[test]
    fn test_sync_key_roundtrip() {
        let key = SyncKey::new("CHEMBL25", FingerprintType::Maccs);
        assert_eq!(key.encode(), "maccs:CHEMBL25");
        assert_eq!(SyncKey::decode(&key.encode()).unwrap(), key);
    }

    #[test]
    fn test_sync_key_allows_colons_in_molecule_id() {
        let key = SyncKey::new("urn:mol:7", FingerprintType::Morgan);
        assert_eq!(SyncKey::decode(&key.encode()).unwrap(), key);
    }

    #[test]
    fn test_sync_state_machine() {
        let pending = SyncState::Pending;
        let synced = pending.apply(&SyncEvent::PushSucceeded).unwrap();
        assert_eq!(synced, SyncState::Synced);

        let stale = synced.apply(&SyncEvent::FingerprintChanged).unwrap();
        assert_eq!(stale, SyncState::Stale);
        assert_eq!(stale.apply(&SyncEvent::Requeued).unwrap(), SyncState::Pending);

        let failed = stale.apply(&SyncEvent::PushFailed("503".into())).unwrap();
        assert!(matches!(failed, SyncState::Failed { .. }));
        assert_eq!(failed.apply(&SyncEvent::Requeued).unwrap(), SyncState::Pending);
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        assert!(SyncState::Synced.apply(&SyncEvent::Requeued).is_err());
        assert!(SyncState::Stale.apply(&SyncEvent::PushSucceeded).is_err());
        assert!(SyncState::Synced.apply(&SyncEvent::PushSucceeded).is_err());
    }

    #[test]
    fn test_entry_transition_bookkeeping() {
        let mut entry = IndexEntry::new(&fp(&[1]), None);
        let now = Utc::now();
        entry
            .transition(SyncEvent::PushFailed("timeout".into()), now)
            .unwrap();
        entry
            .transition(SyncEvent::PushFailed("timeout".into()), now)
            .unwrap();
        assert_eq!(entry.attempts, 2);
        assert!(entry.is_exhausted(2));
        assert!(!entry.is_exhausted(3));

        entry.transition(SyncEvent::Requeued, now).unwrap();
        entry.transition(SyncEvent::PushSucceeded, now).unwrap();
        assert_eq!(entry.sync_state, SyncState::Synced);
        assert_eq!(entry.attempts, 0);
        assert_eq!(entry.last_synced_at, Some(now));
    }
}
