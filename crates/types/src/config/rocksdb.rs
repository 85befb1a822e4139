// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::num::NonZeroU32;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

/// Node wide rocksdb settings, applied to every database the manager opens. Field
/// names keep the `rocksdb_` prefix so they read unambiguously in a flat config file.
#[serde_as]
#[derive(Debug, Clone, Default, Serialize, Deserialize, derive_builder::Builder)]
#[serde(rename_all = "kebab-case", default)]
#[builder(default)]
pub struct RocksDbOptions {
    /// # Memtable size
    ///
    /// Bytes a memtable may hold before it is frozen and scheduled for flushing.
    /// Default 64 MiB.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(setter(strip_option))]
    rocksdb_write_buffer_size: Option<usize>,

    /// # Skip the WAL
    ///
    /// Partition store writes skip the rocksdb WAL by default: the store is rebuilt from
    /// the latest snapshot plus the log stream after a crash.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(setter(strip_option))]
    rocksdb_disable_wal: Option<bool>,

    /// # Background jobs
    ///
    /// Upper bound of concurrent flushes and compactions. Defaults to the number of
    /// available cores.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(setter(strip_option))]
    rocksdb_max_background_jobs: Option<NonZeroU32>,

    /// # Disable statistics
    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(setter(strip_option))]
    rocksdb_disable_statistics: Option<bool>,
}

impl RocksDbOptions {
    pub fn rocksdb_write_buffer_size(&self) -> usize {
        self.rocksdb_write_buffer_size.unwrap_or(64 * 1024 * 1024)
    }

    pub fn rocksdb_disable_wal(&self) -> bool {
        self.rocksdb_disable_wal.unwrap_or(true)
    }

    pub fn rocksdb_max_background_jobs(&self) -> NonZeroU32 {
        self.rocksdb_max_background_jobs.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .ok()
                .and_then(|p| NonZeroU32::new(u32::try_from(p.get()).unwrap_or(u32::MAX)))
                .unwrap_or(NonZeroU32::MIN)
        })
    }

    pub fn rocksdb_disable_statistics(&self) -> bool {
        self.rocksdb_disable_statistics.unwrap_or(false)
    }
}
