// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use super::InvalidConfigurationError;
use crate::logs::LoggedEntry;

/// Which storage module backs the log streams of this node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "kebab-case")]
pub enum LogStorageKind {
    /// Entries are kept in memory only. Useful for tests and embedded use.
    #[display("in-memory")]
    InMemory,
    /// Entries are persisted in a local RocksDB instance.
    #[default]
    #[display("local")]
    Local,
}

/// # Log stream options
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, derive_builder::Builder)]
#[serde(rename_all = "kebab-case", default)]
#[builder(default)]
pub struct LogStreamOptions {
    /// # Storage
    ///
    /// The storage module used for the log.
    pub storage: LogStorageKind,

    /// # Maximum block size
    ///
    /// The maximum size in bytes of one appended block. A writer batch whose encoded
    /// entries exceed this size is refused.
    pub max_block_size: usize,

    /// # Writer queue length
    ///
    /// The number of appends the local storage writer accepts before callers have to
    /// wait.
    pub writer_queue_length: NonZeroUsize,

    /// # Writer batch commit count
    ///
    /// The local storage writer commits its write batch once it holds this many blocks,
    /// or earlier when its queue runs empty.
    pub writer_batch_commit_count: NonZeroUsize,

    /// # Sync writes
    ///
    /// Whether the local storage fsyncs its write-ahead log on every batch.
    pub sync_writes: bool,
}

impl LogStreamOptions {
    pub fn validate(&self) -> Result<(), InvalidConfigurationError> {
        let min = LoggedEntry::FIXED_LEN + std::mem::size_of::<u32>();
        if self.max_block_size < min {
            return Err(InvalidConfigurationError::BlockSizeTooSmall {
                min,
                actual: self.max_block_size,
            });
        }
        Ok(())
    }
}

impl Default for LogStreamOptions {
    fn default() -> Self {
        Self {
            storage: LogStorageKind::default(),
            max_block_size: 4 * 1024 * 1024,
            writer_queue_length: NonZeroUsize::new(1000).expect("non-zero"),
            writer_batch_commit_count: NonZeroUsize::new(500).expect("non-zero"),
            sync_writes: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiny_blocks_are_invalid() {
        let options = LogStreamOptionsBuilder::default()
            .max_block_size(10)
            .build()
            .unwrap();
        assert!(matches!(
            options.validate(),
            Err(InvalidConfigurationError::BlockSizeTooSmall { actual: 10, .. })
        ));
    }
}
