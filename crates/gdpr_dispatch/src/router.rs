#![forbid(unsafe_code)]

use sha2::{Digest, Sha256};

use crate::error::DispatchError;

/// Deterministic key to shard mapping over a fixed pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    shard_count: usize,
}

impl ShardRouter {
    pub fn new(shard_count: usize) -> Result<Self, DispatchError> {
        if shard_count == 0 {
            return Err(DispatchError::Configuration(
                "shard pool must not be empty".to_string(),
            ));
        }
        Ok(Self { shard_count })
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    pub fn shard_index(&self, key: &str) -> usize {
        (key_hash(key) % self.shard_count as u64) as usize
    }
}

/// Content hash of `key`, masked non-negative. Identical across processes.
pub fn key_hash(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head) & (i64::MAX as u64)
}
