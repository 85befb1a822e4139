// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.


mod keys;
mod writer;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rocksdb::{Direction, IteratorMode, ReadOptions};
use tracing::{debug, info, warn};

use keel_core::{TaskCenter, TaskId};
use keel_rocksdb::{
    create_default_db_options, DbName, DbSpecBuilder, Owner, RocksDb, RocksDbManager,
};
use keel_types::config::LogStreamOptions;
use keel_types::logs::{Position, SequenceNumber};
use keel_types::PartitionId;

use self::keys::{decode_block_value, BlockKey};
use self::writer::{LogStoreWriter, LogStoreWriterHandle};
use super::{AppendListener, LogStorage, LogStorageReader, StoredBlock};
use crate::error::StorageError;

/// Persists blocks in a rocksdb database owned by one partition. Appends are batched by
/// a writer task.
struct LogStoreInner {
    rocksdb: Arc<RocksDb>,
}

pub struct LocalLogStorage {
    partition_id: PartitionId,
    store: Arc<LogStoreInner>,
    writer: LogStoreWriterHandle,
    task_center: TaskCenter,
    writer_task: Mutex<Option<TaskId>>,
}

impl LocalLogStorage {
    pub async fn create(
        task_center: &TaskCenter,
        manager: &RocksDbManager,
        partition_id: PartitionId,
        data_dir: PathBuf,
        options: &LogStreamOptions,
    ) -> Result<Arc<Self>, StorageError> {
        let spec = DbSpecBuilder::default()
            .name(DbName::new(format!("log-{partition_id}")))
            .owner(Owner::LogStorage)
            .path(data_dir)
            .db_options(create_default_db_options(true))
            .flush_on_shutdown(true)
            .build()
            .map_err(|e| StorageError::InvalidSetup(e.to_string()))?;
        let rocksdb = manager.open_db(spec).await?;

        let (writer, writer_task) = LogStoreWriter::new(
            Arc::clone(&rocksdb),
            options.sync_writes,
            options.writer_batch_commit_count.get(),
        )
        .start(
            task_center,
            partition_id,
            options.writer_queue_length.get(),
        )?;

        info!(%partition_id, path = %rocksdb.path.display(), "Opened local log storage");
        Ok(Arc::new(Self {
            partition_id,
            store: Arc::new(LogStoreInner { rocksdb }),
            writer,
            task_center: task_center.clone(),
            writer_task: Mutex::new(Some(writer_task)),
        }))
    }
}

impl LogStoreInner {
    fn read_opts() -> ReadOptions {
        let mut read_opts = ReadOptions::default();
        read_opts.set_iterate_lower_bound(BlockKey::lower_bound().to_vec());
        read_opts.set_iterate_upper_bound(BlockKey::upper_bound().to_vec());
        read_opts
    }

    fn read_block(
        &self,
        mode: IteratorMode<'_>,
    ) -> Result<Option<StoredBlock>, StorageError> {
        let mut iter = self.rocksdb.inner().iterator_opt(mode, Self::read_opts());
        let Some(item) = iter.next().transpose()? else {
            return Ok(None);
        };
        let (key, value) = item;
        let key = BlockKey::from_slice(&key)?;
        let (highest, data) = decode_block_value(&value)?;
        Ok(Some(StoredBlock {
            lowest: key.lowest,
            highest,
            data,
        }))
    }

    /// Block holding `position` or the closest block before it.
    fn block_at_or_before(&self, position: Position) -> Result<Option<StoredBlock>, StorageError> {
        let key = BlockKey::new(position).to_bytes();
        self.read_block(IteratorMode::From(&key, Direction::Reverse))
    }

    fn first_block_from(&self, lowest: Position) -> Result<Option<StoredBlock>, StorageError> {
        let key = BlockKey::new(lowest).to_bytes();
        self.read_block(IteratorMode::From(&key, Direction::Forward))
    }

    fn compactable_keys(&self, position: Position) -> Result<Vec<Bytes>, StorageError> {
        let mut keys = Vec::new();
        let iter = self
            .rocksdb
            .inner()
            .iterator_opt(IteratorMode::Start, Self::read_opts());
        for item in iter {
            let (key, value) = item?;
            let (highest, _) = decode_block_value(&value)?;
            if highest > position {
                break;
            }
            keys.push(Bytes::copy_from_slice(&key));
        }
        Ok(keys)
    }
}

#[async_trait]
impl LogStorage for LocalLogStorage {
    async fn append(
        &self,
        lowest: Position,
        highest: Position,
        block: Bytes,
        listener: Arc<dyn AppendListener>,
    ) {
        self.writer
            .enqueue_put_block(lowest, highest, block, listener)
            .await
    }

    fn new_reader(&self) -> Box<dyn LogStorageReader> {
        Box::new(LocalStorageReader {
            store: Arc::clone(&self.store),
            next_lowest: Position::INVALID,
        })
    }

    fn last_block(&self) -> Result<Option<StoredBlock>, StorageError> {
        self.store.read_block(IteratorMode::End)
    }

    #[tracing::instrument(skip(self), fields(partition_id = %self.partition_id))]
    async fn compact(&self, position: Position) -> Result<(), StorageError> {
        let keys = self.store.compactable_keys(position)?;
        if keys.is_empty() {
            return Ok(());
        }
        debug!("Deleting {} blocks", keys.len());
        self.writer.enqueue_delete_blocks(keys).await
    }

    async fn close(&self) {
        let Some(task_id) = self.writer_task.lock().take() else {
            return;
        };
        if let Some(handle) = self.task_center.cancel_task(task_id) {
            if handle.await.is_err() {
                warn!(partition_id = %self.partition_id, "Log storage writer did not stop cleanly");
            }
        }
        if let Err(e) = self.store.rocksdb.flush_wal(true).await {
            warn!(partition_id = %self.partition_id, "Failed to flush log storage WAL: {}", e);
        }
        info!(partition_id = %self.partition_id, "Closed local log storage");
    }
}

struct LocalStorageReader {
    store: Arc<LogStoreInner>,
    next_lowest: Position,
}

impl LogStorageReader for LocalStorageReader {
    fn seek(&mut self, position: Position) -> Result<(), StorageError> {
        self.next_lowest = match self.store.block_at_or_before(position)? {
            Some(block) if block.highest >= position => block.lowest,
            _ => position,
        };
        Ok(())
    }

    fn next_block(&mut self) -> Result<Option<StoredBlock>, StorageError> {
        let next = self.store.first_block_from(self.next_lowest)?;
        if let Some(block) = &next {
            self.next_lowest = block.highest.next();
        }
        Ok(next)
    }
}
