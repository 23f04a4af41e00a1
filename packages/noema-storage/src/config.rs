//! Engine configuration
//!
//! The deployment surface is a closed set of environment variables read once
//! at startup. There is no other configuration channel.

use std::env;
use std::path::PathBuf;

/// Configuration for a single engine instance (one shard)
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory for WAL, checkpoint, and vector index files
    pub storage_dir: PathBuf,

    /// Vector dimension; fixed per deployment
    pub vector_dimension: usize,

    /// Minimal reconcile interval, used above the high write-rate threshold
    pub reconcile_interval_ms_low: u64,

    /// Moderate reconcile interval, used between the rate thresholds
    pub reconcile_interval_ms_high: u64,

    /// Idle-ceiling reconcile interval; never exceeded regardless of rate
    pub reconcile_interval_ms_max: u64,

    /// Checkpoint the snapshot after this many applied writes
    pub checkpoint_every_n_writes: u64,

    /// Fsync the WAL on every append
    pub wal_fsync: bool,

    /// URL of the external embedding service
    pub embedding_service_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("./storage"),
            vector_dimension: 768,
            reconcile_interval_ms_low: 1,
            reconcile_interval_ms_high: 10,
            reconcile_interval_ms_max: 100,
            checkpoint_every_n_writes: 10_000,
            wal_fsync: true,
            embedding_service_url: "http://localhost:8888".to_string(),
        }
    }
}

/// Server-level configuration: listen address, sharding, engine settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// host:port to listen on
    pub listen_address: String,

    /// Number of shards (1, 2, 4, 8, or 16)
    pub num_shards: u32,

    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:50051".to_string(),
            num_shards: 1,
            engine: EngineConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

impl ServerConfig {
    /// Load configuration from the environment
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let engine_defaults = defaults.engine;

        let num_shards: u32 = env_parse("NUM_SHARDS", defaults.num_shards);
        let num_shards = if matches!(num_shards, 1 | 2 | 4 | 8 | 16) {
            num_shards
        } else {
            tracing::warn!("NUM_SHARDS must be 1/2/4/8/16, got {}, using 1", num_shards);
            1
        };

        Self {
            listen_address: env::var("STORAGE_SERVER_ADDRESS")
                .unwrap_or(defaults.listen_address),
            num_shards,
            engine: EngineConfig {
                storage_dir: env::var("STORAGE_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(engine_defaults.storage_dir),
                vector_dimension: env_parse("VECTOR_DIMENSION", engine_defaults.vector_dimension),
                reconcile_interval_ms_low: env_parse(
                    "RECONCILE_INTERVAL_MS_LOW",
                    engine_defaults.reconcile_interval_ms_low,
                ),
                reconcile_interval_ms_high: env_parse(
                    "RECONCILE_INTERVAL_MS_HIGH",
                    engine_defaults.reconcile_interval_ms_high,
                ),
                reconcile_interval_ms_max: env_parse(
                    "RECONCILE_INTERVAL_MS_MAX",
                    engine_defaults.reconcile_interval_ms_max,
                ),
                checkpoint_every_n_writes: env_parse(
                    "CHECKPOINT_EVERY_N_WRITES",
                    engine_defaults.checkpoint_every_n_writes,
                ),
                wal_fsync: env_parse("WAL_FSYNC", engine_defaults.wal_fsync),
                embedding_service_url: env::var("EMBEDDING_SERVICE_URL")
                    .unwrap_or(engine_defaults.embedding_service_url),
            },
        }
    }
}

impl EngineConfig {
    /// Validate interval ordering and basic bounds
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.reconcile_interval_ms_low == 0 {
            anyhow::bail!("reconcile_interval_ms_low must be > 0");
        }
        if self.reconcile_interval_ms_low > self.reconcile_interval_ms_high {
            anyhow::bail!(
                "reconcile_interval_ms_low ({}) must be <= reconcile_interval_ms_high ({})",
                self.reconcile_interval_ms_low,
                self.reconcile_interval_ms_high
            );
        }
        if self.reconcile_interval_ms_high > self.reconcile_interval_ms_max {
            anyhow::bail!(
                "reconcile_interval_ms_high ({}) must be <= reconcile_interval_ms_max ({})",
                self.reconcile_interval_ms_high,
                self.reconcile_interval_ms_max
            );
        }
        if self.vector_dimension == 0 {
            anyhow::bail!("vector_dimension must be > 0");
        }
        if self.checkpoint_every_n_writes == 0 {
            anyhow::bail!("checkpoint_every_n_writes must be > 0");
        }
        Ok(())
    }
}
