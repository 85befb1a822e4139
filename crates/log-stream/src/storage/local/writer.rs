// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.


use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt as FutureStreamExt;
use metrics::histogram;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt as TokioStreamExt;
use tracing::{debug, error, trace, warn};

use keel_core::{cancellation_watcher, ShutdownError, TaskCenter, TaskId, TaskKind};
use keel_rocksdb::{IoMode, Priority, RocksDb, WriteBatch};
use keel_types::logs::Position;
use keel_types::PartitionId;

use super::keys::{encode_block_value, BlockKey};
use crate::error::StorageError;
use crate::metric_definitions::{LOG_STORAGE_WRITE_BATCH_COUNT, LOG_STORAGE_WRITE_BATCH_SIZE_BYTES};
use crate::storage::AppendListener;

type Ack = oneshot::Sender<Result<(), StorageError>>;

pub struct LogStoreWriteCommand {
    data_update: DataUpdate,
    ack: Option<Ack>,
}

enum DataUpdate {
    PutBlock {
        lowest: Position,
        highest: Position,
        block: Bytes,
        listener: Arc<dyn AppendListener>,
    },
    DeleteBlocks {
        keys: Vec<Bytes>,
    },
}

pub(crate) struct LogStoreWriter {
    rocksdb: Arc<RocksDb>,
    sync_writes: bool,
    batch_size: usize,
    batch_acks_buf: Vec<Ack>,
    batch_listeners_buf: Vec<(u64, Arc<dyn AppendListener>)>,
    // set once a batch failed, every following write fails with it
    failure: Option<StorageError>,
}

impl LogStoreWriter {
    pub(crate) fn new(rocksdb: Arc<RocksDb>, sync_writes: bool, batch_size: usize) -> Self {
        Self {
            rocksdb,
            sync_writes,
            batch_size: batch_size.max(1),
            batch_acks_buf: Vec::default(),
            batch_listeners_buf: Vec::default(),
            failure: None,
        }
    }

    pub fn start(
        mut self,
        task_center: &TaskCenter,
        partition_id: PartitionId,
        queue_length: usize,
    ) -> Result<(LogStoreWriterHandle, TaskId), ShutdownError> {
        // leave room for a full batch in the backlog while the current one is committed
        let (sender, receiver) = mpsc::channel(queue_length.max(self.batch_size * 2));

        let task_id = task_center.spawn_child(
            TaskKind::LogStorageWriter,
            "log-storage-writer",
            Some(partition_id),
            async move {
                debug!("Start running LogStoreWriter");
                let receiver = ReceiverStream::new(receiver).ready_chunks(self.batch_size);
                tokio::pin!(receiver);

                loop {
                    tokio::select! {
                        biased;
                        _ = cancellation_watcher() => {
                            break;
                        }
                        cmds = TokioStreamExt::next(&mut receiver) => {
                            let Some(cmds) = cmds else {
                                break;
                            };
                            self.handle_commands(cmds).await;
                        }
                    }
                }
                debug!("Log storage writer task finished");
                Ok(())
            },
        )?;
        Ok((LogStoreWriterHandle { sender }, task_id))
    }

    async fn handle_commands(&mut self, commands: Vec<LogStoreWriteCommand>) {
        let mut write_batch = WriteBatch::default();
        self.batch_acks_buf.clear();
        self.batch_listeners_buf.clear();

        for command in commands {
            match command.data_update {
                DataUpdate::PutBlock {
                    lowest,
                    highest,
                    block,
                    listener,
                } => {
                    trace!(%lowest, %highest, "Put block");
                    write_batch.put(
                        BlockKey::new(lowest).to_bytes(),
                        encode_block_value(highest, &block),
                    );
                    let index = u64::try_from(lowest.as_i64()).unwrap_or_default();
                    self.batch_listeners_buf.push((index, listener));
                }
                DataUpdate::DeleteBlocks { keys } => {
                    trace!("Delete {} blocks", keys.len());
                    for key in keys {
                        write_batch.delete(key);
                    }
                }
            }
            if let Some(ack) = command.ack {
                self.batch_acks_buf.push(ack);
            }
        }

        if let Some(failure) = self.failure.clone() {
            self.complete(Err(failure));
            return;
        }

        histogram!(LOG_STORAGE_WRITE_BATCH_SIZE_BYTES).record(write_batch.size_in_bytes() as f64);
        histogram!(LOG_STORAGE_WRITE_BATCH_COUNT).record(write_batch.len() as f64);
        self.commit(write_batch).await;
    }

    async fn commit(&mut self, write_batch: WriteBatch) {
        let mut write_opts = rocksdb::WriteOptions::new();
        // the log is the source of truth, its writes always go through the WAL
        write_opts.disable_wal(false);
        write_opts.set_sync(self.sync_writes);

        trace!(
            "Committing log storage write batch: {} items",
            write_batch.len(),
        );
        let result = self
            .rocksdb
            .write_batch(Priority::High, IoMode::Default, write_opts, write_batch)
            .await;

        match result {
            Ok(()) => self.complete(Ok(())),
            Err(e) => {
                error!("Failed to commit log storage write batch: {}", e);
                let e = StorageError::from(e);
                self.failure = Some(e.clone());
                self.complete(Err(e));
            }
        }
    }

    fn complete(&mut self, result: Result<(), StorageError>) {
        for (index, listener) in self.batch_listeners_buf.drain(..) {
            match &result {
                Ok(()) => {
                    listener.on_write(index);
                    // a committed rocksdb write is immediately visible
                    listener.on_commit(index);
                }
                Err(e) => listener.on_write_error(e),
            }
        }
        self.batch_acks_buf.drain(..).for_each(|a| {
            let _ = a.send(result.clone());
        });
    }
}

#[derive(Clone)]
pub struct LogStoreWriterHandle {
    sender: mpsc::Sender<LogStoreWriteCommand>,
}

impl LogStoreWriterHandle {
    pub async fn enqueue_put_block(
        &self,
        lowest: Position,
        highest: Position,
        block: Bytes,
        listener: Arc<dyn AppendListener>,
    ) {
        let command = LogStoreWriteCommand {
            data_update: DataUpdate::PutBlock {
                lowest,
                highest,
                block,
                listener,
            },
            ack: None,
        };
        if let Err(mpsc::error::SendError(command)) = self.sender.send(command).await {
            warn!("Log storage writer task is gone, not accepting the block");
            if let DataUpdate::PutBlock { listener, .. } = command.data_update {
                listener.on_write_error(&StorageError::Closed);
            }
        }
    }

    pub async fn enqueue_delete_blocks(&self, keys: Vec<Bytes>) -> Result<(), StorageError> {
        let (ack, receiver) = oneshot::channel();
        self.sender
            .send(LogStoreWriteCommand {
                data_update: DataUpdate::DeleteBlocks { keys },
                ack: Some(ack),
            })
            .await
            .map_err(|_| StorageError::Closed)?;
        receiver.await.map_err(|_| StorageError::Closed)?
    }
}
