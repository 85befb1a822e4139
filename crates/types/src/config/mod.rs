// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

mod common;
mod distribution;
mod log_stream;
mod processor;
mod rocksdb;

pub use common::*;
pub use distribution::*;
pub use log_stream::*;
pub use processor::*;
pub use rocksdb::*;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::identifiers::PartitionId;

#[derive(Debug, thiserror::Error)]
pub enum InvalidConfigurationError {
    #[error("log-stream.max-block-size must be at least {min} bytes, got {actual}")]
    BlockSizeTooSmall { min: usize, actual: usize },
    #[error("{0} must not be zero")]
    ZeroValue(&'static str),
    #[error("distribution retry policy must not limit the number of attempts, delivery is at-least-once")]
    LimitedDistributionRetries,
}

/// # Keel configuration file
///
/// Configuration of a keel node running one or more partitions.
#[serde_as]
#[derive(Debug, Clone, Default, Serialize, Deserialize, derive_builder::Builder)]
#[builder(default)]
#[serde(rename_all = "kebab-case", default)]
pub struct Configuration {
    #[serde(flatten)]
    pub common: CommonOptions,
    pub log_stream: LogStreamOptions,
    pub processor: StreamProcessorOptions,
    pub distribution: CommandDistributionOptions,
    pub rocksdb: RocksDbOptions,
}

impl Configuration {
    /// Checks constraints across options that serde can't express.
    pub fn validate(&self) -> Result<(), InvalidConfigurationError> {
        self.log_stream.validate()?;
        self.processor.validate()?;
        self.distribution.validate()?;
        Ok(())
    }

    /// Directory holding the partition store of a partition while it is running.
    pub fn partition_runtime_dir(&self, partition_id: PartitionId) -> std::path::PathBuf {
        self.common
            .base_dir()
            .join("partitions")
            .join(partition_id.to_string())
            .join("runtime")
    }

    /// Directory holding the snapshots of a partition.
    pub fn partition_snapshot_dir(&self, partition_id: PartitionId) -> std::path::PathBuf {
        self.common
            .base_dir()
            .join("partitions")
            .join(partition_id.to_string())
            .join("snapshots")
    }

    /// Directory holding the log of a partition when using the local log storage.
    pub fn partition_log_dir(&self, partition_id: PartitionId) -> std::path::PathBuf {
        self.common
            .base_dir()
            .join("partitions")
            .join(partition_id.to_string())
            .join("log")
    }
}
