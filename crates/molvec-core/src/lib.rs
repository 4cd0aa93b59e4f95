//! # molvec core
//!
//! Molecular fingerprint similarity search.
//!
//! ## Features
//!
//! - **Fingerprints**: fixed-width bit vectors packed into `u64` words, with a
//!   byte/hex/base64 codec and per-family bit widths (Morgan, MACCS, RDKit, custom)
//! - **Exact search**: word-parallel Tanimoto (or Dice) scans over a rayon pool,
//!   the correctness oracle for everything else
//! - **Approximate search**: IVF (spherical k-means++) or HNSW over L2-normalized
//!   float projections, rebuilt as immutable generations and swapped atomically
//! - **Routing**: corpus-size tiers with exact reranking and degraded fallback
//! - **External sync**: a durable queue drained by a reconciler with capped
//!   exponential backoff
//! - **Persistence**: redb-backed store behind the `storage` feature, sharded
//!   in-memory store otherwise
//!
//! ## Example
//!
//! ```rust,no_run
//! use molvec_core::{EngineConfig, FingerprintEngine, FingerprintPayload, FingerprintType, QueryRequest};
//!
//! # async fn run() -> molvec_core::Result<()> {
//! let engine = FingerprintEngine::from_config(EngineConfig::default(), None)?;
//! let request = QueryRequest::new(
//!     FingerprintType::Morgan,
//!     FingerprintPayload::Hex("2104".into()),
//!     10,
//! );
//! let response = engine.query(&request).await?;
//! for hit in response.results {
//!     println!("{} {:.3}", hit.molecule_id, hit.similarity);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bits;
pub mod cancel;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod external;
pub mod index;
pub mod locks;
pub mod maintenance;
pub mod reconcile;
pub mod router;
pub mod similarity;
pub mod types;

// Storage traits are always available; the redb backend needs the "storage" feature
pub mod storage;
pub mod storage_memory;

// Re-exports
pub use bits::BitVector;
pub use cancel::CancellationToken;
pub use codec::FingerprintCodec;
pub use config::{
    AnnParams, ApproximateConfig, EngineConfig, FingerprintSpec, FingerprintTypeTable,
    IndexEntryMode, QueryStrategy, ReconcilerConfig, RetentionPolicy, RouterConfig,
    StorageConfig,
};
pub use engine::{FingerprintEngine, IngestOutcome};
pub use error::{AdapterError, MolvecError, Result, StoreError};
pub use external::{ExternalIndexAdapter, InMemoryExternalIndex, TimeoutAdapter};
pub use index::{
    ApproximateMatch, ApproximateVectorIndex, ExactSimilarityIndex, IndexHandle,
    SearchOptions, SimilarityBackend,
};
pub use locks::KeyLocks;
pub use maintenance::{MaintenanceReport, MaintenanceTask};
pub use reconcile::{Backoff, LoggingObserver, ReconcileReport, Reconciler, SyncObserver};
pub use router::{Backend, CorpusTier, IndexSet, QueryResponse, SimilarityQueryRouter};
pub use similarity::{dice, tanimoto, SimilarityMetric};
pub use storage::{EngineStore, FingerprintStore, SyncLedger};
pub use storage_memory::MemoryStore;
pub use types::{
    ExternalId, Fingerprint, FingerprintPayload, FingerprintType, GenerationParams,
    IndexEntry, IndexStats, IngestionEvent, MoleculeId, QueryRequest, SimilarityResult,
    SyncEvent, SyncKey, SyncState, VectorRef,
};

#[cfg(feature = "storage")]
pub use storage::RedbStore;
