//! Engine configuration
//!
//! Everything here is immutable once the engine is opened. The fingerprint
//! type table in particular is injected, never looked up globally.

use crate::error::{MolvecError, Result};
use crate::types::FingerprintType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Generation parameters of one fingerprint family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintSpec {
    /// Bit width every fingerprint of this family must have
    pub num_bits: usize,
    /// Default Morgan radius
    #[serde(default)]
    pub default_radius: Option<u32>,
    /// Default feature-invariant flag
    #[serde(default)]
    pub use_features: bool,
}

/// Per-family parameter table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, FingerprintSpec>",
    into = "BTreeMap<String, FingerprintSpec>"
)]
pub struct FingerprintTypeTable {
    specs: BTreeMap<FingerprintType, FingerprintSpec>,
}

impl FingerprintTypeTable {
    /// Table from explicit entries
    pub fn new(specs: impl IntoIterator<Item = (FingerprintType, FingerprintSpec)>) -> Self {
        Self {
            specs: specs.into_iter().collect(),
        }
    }

    /// Spec for a family; unknown families are rejected
    pub fn get(&self, fingerprint_type: FingerprintType) -> Result<&FingerprintSpec> {
        self.specs.get(&fingerprint_type).ok_or_else(|| {
            MolvecError::InvalidParameter(format!(
                "fingerprint type {} is not configured",
                fingerprint_type
            ))
        })
    }

    /// Bit width of a family
    pub fn num_bits(&self, fingerprint_type: FingerprintType) -> Result<usize> {
        Ok(self.get(fingerprint_type)?.num_bits)
    }

    /// Configured families
    pub fn types(&self) -> impl Iterator<Item = FingerprintType> + '_ {
        self.specs.keys().copied()
    }
}

impl TryFrom<BTreeMap<String, FingerprintSpec>> for FingerprintTypeTable {
    type Error = MolvecError;

    fn try_from(raw: BTreeMap<String, FingerprintSpec>) -> Result<Self> {
        let mut specs = BTreeMap::new();
        for (name, spec) in raw {
            specs.insert(FingerprintType::parse(&name)?, spec);
        }
        Ok(Self { specs })
    }
}

impl From<FingerprintTypeTable> for BTreeMap<String, FingerprintSpec> {
    fn from(table: FingerprintTypeTable) -> Self {
        table
            .specs
            .into_iter()
            .map(|(ty, spec)| (ty.as_str().to_string(), spec))
            .collect()
    }
}

impl Default for FingerprintTypeTable {
    fn default() -> Self {
        Self::new([
            (
                FingerprintType::Morgan,
                FingerprintSpec {
                    num_bits: 2048,
                    default_radius: Some(2),
                    use_features: false,
                },
            ),
            (
                FingerprintType::Maccs,
                FingerprintSpec {
                    num_bits: 167,
                    default_radius: None,
                    use_features: false,
                },
            ),
            (
                FingerprintType::Rdkit,
                FingerprintSpec {
                    num_bits: 2048,
                    default_radius: None,
                    use_features: false,
                },
            ),
            (
                FingerprintType::Custom,
                FingerprintSpec {
                    num_bits: 1024,
                    default_radius: None,
                    use_features: false,
                },
            ),
        ])
    }
}

/// Backend selection override
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStrategy {
    /// Pick by corpus size
    #[default]
    Auto,
    /// Always start at the exact index
    Exact,
    /// Always start at the approximate index
    Approximate,
    /// Always start at the external index
    External,
}

/// Query routing thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Backend override
    pub strategy: QueryStrategy,
    /// Corpora smaller than this are searched exactly
    pub exact_max_corpus: usize,
    /// Corpora up to this size use the approximate index
    pub approximate_max_corpus: usize,
    /// Rescore approximate/external candidates exactly
    pub rerank: bool,
    /// Candidates fetched per requested result when reranking
    pub rerank_factor: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            strategy: QueryStrategy::Auto,
            exact_max_corpus: 50_000,
            approximate_max_corpus: 5_000_000,
            rerank: true,
            rerank_factor: 4,
        }
    }
}

/// Approximate index structure and its build parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AnnParams {
    /// Inverted-file partitioning over k-means centroids
    Ivf {
        /// Number of k-means partitions
        num_partitions: usize,
        /// Partitions probed per query
        n_probe: usize,
        /// Lloyd iterations
        kmeans_iterations: usize,
        /// Vectors sampled for training
        max_training_samples: usize,
        /// RNG seed
        seed: u64,
    },
    /// Hierarchical navigable small-world graph
    Hnsw {
        /// Neighbors per node on upper layers
        m: usize,
        /// Neighbors per node on layer 0
        m0: usize,
        /// Candidate list size during construction
        ef_construction: usize,
        /// Default candidate list size during search
        ef_search: usize,
        /// RNG seed
        seed: u64,
    },
}

impl AnnParams {
    /// IVF with default parameters
    pub fn ivf() -> Self {
        AnnParams::Ivf {
            num_partitions: 64,
            n_probe: 8,
            kmeans_iterations: 10,
            max_training_samples: 50_000,
            seed: 42,
        }
    }

    /// HNSW with default parameters
    pub fn hnsw() -> Self {
        AnnParams::Hnsw {
            m: 16,
            m0: 32,
            ef_construction: 200,
            ef_search: 64,
            seed: 42,
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            AnnParams::Ivf { .. } => "ivf",
            AnnParams::Hnsw { .. } => "hnsw",
        }
    }

    /// Check parameter ranges
    pub fn validate(&self) -> Result<()> {
        match *self {
            AnnParams::Ivf {
                num_partitions,
                n_probe,
                kmeans_iterations,
                max_training_samples,
                ..
            } => {
                if num_partitions == 0 {
                    return Err(MolvecError::InvalidConfig(
                        "ivf num_partitions must be greater than 0".into(),
                    ));
                }
                if n_probe == 0 || n_probe > num_partitions {
                    return Err(MolvecError::InvalidConfig(format!(
                        "ivf n_probe must be in 1..={}",
                        num_partitions
                    )));
                }
                if kmeans_iterations == 0 || max_training_samples == 0 {
                    return Err(MolvecError::InvalidConfig(
                        "ivf kmeans_iterations and max_training_samples must be positive".into(),
                    ));
                }
            }
            AnnParams::Hnsw {
                m,
                m0,
                ef_construction,
                ef_search,
                ..
            } => {
                if m < 2 {
                    return Err(MolvecError::InvalidConfig("hnsw m must be at least 2".into()));
                }
                if m0 < m {
                    return Err(MolvecError::InvalidConfig("hnsw m0 must be >= m".into()));
                }
                if ef_construction < m || ef_search == 0 {
                    return Err(MolvecError::InvalidConfig(
                        "hnsw ef_construction must be >= m and ef_search positive".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

impl Default for AnnParams {
    fn default() -> Self {
        Self::ivf()
    }
}

/// Approximate index settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApproximateConfig {
    /// Build and maintain an approximate index per family
    pub enabled: bool,
    /// Structure and build parameters
    pub params: AnnParams,
    /// Minimum corpus before a generation is built
    pub min_build_size: usize,
    /// Maintenance tick, in milliseconds
    pub maintenance_interval_ms: u64,
    /// Tombstone fraction that triggers compaction
    pub compaction_tombstone_ratio: f64,
    /// Inserts since the last build, relative to its size, that trigger a rebuild
    pub rebuild_drift_ratio: f64,
}

impl Default for ApproximateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            params: AnnParams::default(),
            min_build_size: 256,
            maintenance_interval_ms: 30_000,
            compaction_tombstone_ratio: 0.1,
            rebuild_drift_ratio: 0.2,
        }
    }
}

impl ApproximateConfig {
    /// Maintenance tick
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }
}

/// External index reconciliation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Scan period, in milliseconds
    pub interval_ms: u64,
    /// First retry delay, in milliseconds
    pub base_delay_ms: u64,
    /// Retry delay cap, in milliseconds
    pub max_delay_ms: u64,
    /// Relative jitter applied to each delay, in `[0, 1)`
    pub jitter: f64,
    /// Consecutive failures before an entry is given up on
    pub max_attempts: u32,
    /// Queue entries handled per scan
    pub batch_size: usize,
    /// Bound on a single push, in milliseconds
    pub push_timeout_ms: u64,
    /// Bound on a single external query, in milliseconds
    pub query_timeout_ms: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            base_delay_ms: 500,
            max_delay_ms: 60_000,
            jitter: 0.2,
            max_attempts: 5,
            batch_size: 256,
            push_timeout_ms: 2_000,
            query_timeout_ms: 2_000,
        }
    }
}

impl ReconcilerConfig {
    /// Scan period
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// First retry delay
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Retry delay cap
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Push bound
    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }

    /// External query bound
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

/// What happens to a fingerprint superseded by a newer generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum RetentionPolicy {
    /// Drop it
    #[default]
    Purge,
    /// Keep up to `max_versions` superseded versions, oldest dropped first
    Archive {
        /// Versions kept per molecule and family
        max_versions: usize,
    },
}

/// When index entries are created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexEntryMode {
    /// On ingestion
    #[default]
    Eager,
    /// On the first approximate build for the family
    Lazy,
}

/// Storage location
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// redb database file; in-memory when absent
    pub path: Option<String>,
}

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-family parameters
    pub fingerprint_types: FingerprintTypeTable,
    /// Routing
    pub router: RouterConfig,
    /// Approximate index
    pub approximate: ApproximateConfig,
    /// External index reconciliation
    pub reconciler: ReconcilerConfig,
    /// Superseded-version retention
    pub retention: RetentionPolicy,
    /// Index entry creation
    pub index_entries: IndexEntryMode,
    /// Storage
    pub storage: StorageConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MolvecError::InvalidConfig(format!(
                "failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate TOML
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)
            .map_err(|e| MolvecError::InvalidConfig(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        for ty in self.fingerprint_types.types() {
            if self.fingerprint_types.num_bits(ty)? == 0 {
                return Err(MolvecError::InvalidConfig(format!(
                    "fingerprint_types.{}.num_bits must be greater than 0",
                    ty
                )));
            }
        }

        if self.router.exact_max_corpus > self.router.approximate_max_corpus {
            return Err(MolvecError::InvalidConfig(
                "router.exact_max_corpus must not exceed router.approximate_max_corpus".into(),
            ));
        }
        if self.router.rerank_factor == 0 {
            return Err(MolvecError::InvalidConfig(
                "router.rerank_factor must be at least 1".into(),
            ));
        }

        self.approximate.params.validate()?;
        if !(0.0..=1.0).contains(&self.approximate.compaction_tombstone_ratio) {
            return Err(MolvecError::InvalidConfig(
                "approximate.compaction_tombstone_ratio must be within [0, 1]".into(),
            ));
        }
        if self.approximate.rebuild_drift_ratio <= 0.0 {
            return Err(MolvecError::InvalidConfig(
                "approximate.rebuild_drift_ratio must be positive".into(),
            ));
        }

        let rc = &self.reconciler;
        if rc.base_delay_ms == 0 || rc.max_delay_ms < rc.base_delay_ms {
            return Err(MolvecError::InvalidConfig(
                "reconciler delays must satisfy 0 < base_delay_ms <= max_delay_ms".into(),
            ));
        }
        if !(0.0..1.0).contains(&rc.jitter) {
            return Err(MolvecError::InvalidConfig(
                "reconciler.jitter must be within [0, 1)".into(),
            ));
        }
        if rc.max_attempts == 0 || rc.batch_size == 0 {
            return Err(MolvecError::InvalidConfig(
                "reconciler.max_attempts and batch_size must be positive".into(),
            ));
        }
        if rc.push_timeout_ms == 0 || rc.query_timeout_ms == 0 {
            return Err(MolvecError::InvalidConfig(
                "reconciler timeouts are mandatory and must be positive".into(),
            ));
        }

        if let RetentionPolicy::Archive { max_versions: 0 } = self.retention {
            return Err(MolvecError::InvalidConfig(
                "retention.max_versions must be at least 1".into(),
            ));
        }

        Ok(())
    }
}
