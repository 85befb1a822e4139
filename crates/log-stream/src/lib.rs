// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.


//! The log stream of a partition: an append-only, gap-free sequence of positioned entries
//! on top of a pluggable [`LogStorage`].

pub mod block;
mod commit_watch;
mod error;
mod log_stream;
mod metric_definitions;
mod reader;
pub mod storage;

use std::sync::Arc;

use keel_core::TaskCenter;
use keel_rocksdb::RocksDbManager;
use keel_types::config::{Configuration, LogStorageKind};
use keel_types::PartitionId;

pub use commit_watch::CommitPositionWatch;
pub use error::*;
pub use log_stream::{CommitListener, LogStream, LogStreamWriter};
pub use reader::LogStreamReader;
pub use storage::{AppendListener, LogStorage, LogStorageReader, StoredBlock};

/// Creates the log storage of `partition_id` as configured in `log-stream.storage`.
pub async fn create_log_storage(
    task_center: &TaskCenter,
    manager: &RocksDbManager,
    config: &Configuration,
    partition_id: PartitionId,
) -> Result<Arc<dyn LogStorage>, StorageError> {
    let log_storage: Arc<dyn LogStorage> = match config.log_stream.storage {
        LogStorageKind::InMemory => storage::MemoryLogStorage::new(),
        LogStorageKind::Local => {
            storage::LocalLogStorage::create(
                task_center,
                manager,
                partition_id,
                config.partition_log_dir(partition_id),
                &config.log_stream,
            )
            .await?
        }
    };
    Ok(log_storage)
}
