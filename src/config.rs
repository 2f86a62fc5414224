//! Configuration structures for the storage and replication layers.
//!
//! Mirrors the repository configuration surface: `core.dfs.*` for the pack
//! block cache, `reftree.committedRef` for the bootstrap anchor, and the
//! per-replica `ketch.*` keys.

use serde::{Deserialize, Serialize};

use crate::errors::GitError;

/// Pack block cache settings (`core.dfs.blockLimit`, `core.dfs.blockSize`,
/// `core.dfs.streamRatio`).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BlockCacheConfig {
    /// Total byte budget for cached pack blocks.
    pub block_limit: usize,
    /// Block size for paged pack reads; must be a power of two >= 512.
    pub block_size: usize,
    /// Fraction of the cache a single stream may consume during reuse [0,1].
    pub stream_ratio: f64,
}

impl Default for BlockCacheConfig {
    fn default() -> Self {
        Self {
            block_limit: 32 * 1024 * 1024,
            block_size: 64 * 1024,
            stream_ratio: 0.30,
        }
    }
}

impl BlockCacheConfig {
    /// Validate the configured values, normalizing the stream ratio into
    /// [0,1].
    pub fn validate(&self) -> Result<(), GitError> {
        if self.block_size < 512 || !self.block_size.is_power_of_two() {
            return Err(GitError::InvalidArgument(format!(
                "blockSize {} must be a power of 2 and at least 512",
                self.block_size
            )));
        }
        if !(0.0..=1.0).contains(&self.stream_ratio) {
            return Err(GitError::InvalidArgument(format!(
                "streamRatio {} must be in [0,1]",
                self.stream_ratio
            )));
        }
        Ok(())
    }

    /// Byte budget a single stream may hold at once.
    pub fn stream_limit(&self) -> usize {
        (self.block_limit as f64 * self.stream_ratio) as usize
    }
}

/// RefTree settings (`reftree.committedRef`).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RefTreeConfig {
    /// Bootstrap reference anchoring the committed RefTree.
    pub committed_ref: String,
}

impl Default for RefTreeConfig {
    fn default() -> Self {
        Self {
            committed_ref: "refs/txn/committed".to_string(),
        }
    }
}

/// Participation of a replica in the Ketch topology (`ketch.type`).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicaType {
    #[default]
    Voter,
    FollowerOnly,
    None,
}

/// How committed state reaches a replica (`ketch.commit`).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommitMethod {
    /// Push every user-visible reference, with deletes for vanished refs.
    #[default]
    AllRefs,
    /// The replica understands the RefTree model; only the committed
    /// transaction ref advances.
    TxnCommitted,
}

/// When committed state is sent relative to accept (`ketch.speed`).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommitSpeed {
    /// Send the commit as soon as accept succeeds.
    #[default]
    Fast,
    /// Piggyback the commit on the next accept push when a round is
    /// starting; otherwise still send it.
    Batched,
}

/// Per-replica replication settings (`ketch.*` in the remote's section).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReplicaConfig {
    pub replica_type: ReplicaType,
    pub commit_method: CommitMethod,
    pub commit_speed: CommitSpeed,
    /// Lower retry bound in milliseconds (`ketch.retry.min`).
    pub min_retry_millis: u64,
    /// Upper retry bound in milliseconds (`ketch.retry.max`).
    pub max_retry_millis: u64,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            replica_type: ReplicaType::Voter,
            commit_method: CommitMethod::AllRefs,
            commit_speed: CommitSpeed::Fast,
            min_retry_millis: 1000,
            max_retry_millis: 60 * 1000,
        }
    }
}

impl ReplicaConfig {
    pub fn validate(&self) -> Result<(), GitError> {
        if self.min_retry_millis == 0 || self.max_retry_millis < self.min_retry_millis {
            return Err(GitError::InvalidArgument(format!(
                "retry bounds [{}, {}] invalid",
                self.min_retry_millis, self.max_retry_millis
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Defaults validate cleanly.
    #[test]
    fn test_defaults_valid() {
        BlockCacheConfig::default().validate().unwrap();
        ReplicaConfig::default().validate().unwrap();
        assert_eq!(RefTreeConfig::default().committed_ref, "refs/txn/committed");
    }

    /// Block size must be a power of two no smaller than 512.
    #[test]
    fn test_block_size_validation() {
        let mut cfg = BlockCacheConfig::default();
        cfg.block_size = 500;
        assert!(cfg.validate().is_err());
        cfg.block_size = 1000;
        assert!(cfg.validate().is_err());
        cfg.block_size = 512;
        assert!(cfg.validate().is_ok());
    }

    /// Stream ratio outside [0,1] is rejected.
    #[test]
    fn test_stream_ratio_validation() {
        let mut cfg = BlockCacheConfig::default();
        cfg.stream_ratio = 1.5;
        assert!(cfg.validate().is_err());
        cfg.stream_ratio = 1.0;
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.stream_limit(), cfg.block_limit);
    }

    /// Enum keys use the configuration file spelling.
    #[test]
    fn test_enum_spelling() {
        let t: ReplicaType = serde_json::from_str("\"FOLLOWER_ONLY\"").unwrap();
        assert_eq!(t, ReplicaType::FollowerOnly);
        let m: CommitMethod = serde_json::from_str("\"TXN_COMMITTED\"").unwrap();
        assert_eq!(m, CommitMethod::TxnCommitted);
        let s: CommitSpeed = serde_json::from_str("\"BATCHED\"").unwrap();
        assert_eq!(s, CommitSpeed::Batched);
    }

    /// Retry bounds must be ordered and non-zero.
    #[test]
    fn test_retry_bounds() {
        let mut cfg = ReplicaConfig::default();
        cfg.min_retry_millis = 5000;
        cfg.max_retry_millis = 100;
        assert!(cfg.validate().is_err());
    }
}
