// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.


use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use metrics::{counter, histogram};
use parking_lot::Mutex;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, error, info, trace};

use keel_core::{SharedClock, ShutdownError};
use keel_types::config::LogStreamOptions;
use keel_types::logs::{LogAppendEntry, LoggedEntry, Position, SequenceNumber};
use keel_types::PartitionId;

use crate::block::{block_len, encode_block, BlockEntries};
use crate::commit_watch::CommitPositionWatch;
use crate::error::{AppendError, LogStreamError, StorageError};
use crate::metric_definitions::{
    LOG_STREAM_APPEND, LOG_STREAM_APPEND_DURATION, LOG_STREAM_APPEND_FAILED, LOG_STREAM_COMPACT,
};
use crate::reader::LogStreamReader;
use crate::storage::{AppendListener, LogStorage};

/// Observer of a log stream. Called after new entries became visible to readers, with the
/// new commit position.
pub trait CommitListener: Send + Sync + 'static {
    fn on_commit(&self, position: Position);
}

static_assertions::assert_obj_safe!(CommitListener);

/// The log of one partition.
///
/// Cloning is cheap. All clones and all writers share one sequencer, which is the only
/// place where positions are assigned.
#[derive(Clone)]
pub struct LogStream {
    inner: Arc<LogStreamInner>,
}

struct LogStreamInner {
    partition_id: PartitionId,
    storage: Arc<dyn LogStorage>,
    clock: SharedClock,
    max_block_size: usize,
    // next position to assign. Held while a block is handed to the storage so that blocks
    // reach the storage in position order.
    next_position: AsyncMutex<Position>,
    last_written_position: AtomicI64,
    commit_watch: CommitPositionWatch,
    commit_listeners: Mutex<Vec<Arc<dyn CommitListener>>>,
    // set after a failed write, the stream would otherwise have a gap
    failed: AtomicBool,
}

impl std::fmt::Debug for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStream")
            .field("partition_id", &self.inner.partition_id)
            .field("last_written_position", &self.last_written_position())
            .field("commit_position", &self.commit_position())
            .field("failed", &self.inner.failed.load(Ordering::Relaxed))
            .finish()
    }
}

impl LogStream {
    /// Opens the log stream of `partition_id` on top of `storage`, continuing after the
    /// last stored entry.
    pub async fn open(
        partition_id: PartitionId,
        storage: Arc<dyn LogStorage>,
        clock: SharedClock,
        options: &LogStreamOptions,
    ) -> Result<Self, LogStreamError> {
        crate::metric_definitions::describe_metrics();
        let last_position = match storage.last_block()? {
            Some(block) => {
                // the stored range must agree with the entries of the block
                let mut last = None;
                for entry in BlockEntries::new(block.data) {
                    last = Some(entry?.position);
                }
                if last != Some(block.highest) {
                    return Err(LogStreamError::Storage(StorageError::CorruptedBlock(
                        format!(
                            "last block claims to end at {} but holds entries up to {:?}",
                            block.highest, last
                        ),
                    )));
                }
                block.highest
            }
            None => Position::INVALID,
        };

        info!(
            %partition_id,
            last_position = %last_position,
            "Opened log stream"
        );

        Ok(Self {
            inner: Arc::new(LogStreamInner {
                partition_id,
                storage,
                clock,
                max_block_size: options.max_block_size,
                next_position: AsyncMutex::new(last_position.next()),
                last_written_position: AtomicI64::new(last_position.as_i64()),
                commit_watch: CommitPositionWatch::new(last_position),
                commit_listeners: Mutex::default(),
                failed: AtomicBool::new(false),
            }),
        })
    }

    pub fn partition_id(&self) -> PartitionId {
        self.inner.partition_id
    }

    pub fn new_writer(&self) -> LogStreamWriter {
        LogStreamWriter {
            stream: self.clone(),
        }
    }

    pub fn new_reader(&self) -> LogStreamReader {
        LogStreamReader::new(self.inner.storage.new_reader(), self.inner.commit_watch.clone())
    }

    /// Position of the last entry written to the storage, [`Position::INVALID`] if none.
    pub fn last_written_position(&self) -> Position {
        Position::new(self.inner.last_written_position.load(Ordering::Acquire))
    }

    /// Position of the last entry visible to readers, [`Position::INVALID`] if none.
    pub fn commit_position(&self) -> Position {
        self.inner.commit_watch.latest()
    }

    pub fn commit_watch(&self) -> &CommitPositionWatch {
        &self.inner.commit_watch
    }

    pub async fn wait_for_commit(&self, position: Position) -> Result<Position, ShutdownError> {
        self.inner.commit_watch.wait_for(position).await
    }

    /// Stream of commit positions, starting with the current one.
    pub fn commit_positions(&self) -> WatchStream<Position> {
        self.inner.commit_watch.to_stream()
    }

    pub fn register_commit_listener(&self, listener: Arc<dyn CommitListener>) {
        self.inner.commit_listeners.lock().push(listener);
    }

    pub fn remove_commit_listener(&self, listener: &Arc<dyn CommitListener>) {
        self.inner
            .commit_listeners
            .lock()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Whether a batch of `count` entries with `entries_len` encoded bytes fits one block.
    pub fn can_write(&self, count: usize, entries_len: usize) -> bool {
        count > 0 && crate::block::block_len_of(count, entries_len) <= self.inner.max_block_size
    }

    /// Encoded length of the largest entry that fits a block on its own.
    pub fn max_entry_len(&self) -> usize {
        crate::block::max_entry_len(self.inner.max_block_size)
    }

    pub fn is_failed(&self) -> bool {
        self.inner.failed.load(Ordering::Relaxed)
    }

    /// Deletes blocks holding only entries up to and including `position`. The block of
    /// the last committed entry is kept, the stream recovers its tail from it.
    pub async fn compact(&self, position: Position) -> Result<(), StorageError> {
        let position = position.min(self.commit_position().prev());
        counter!(LOG_STREAM_COMPACT).increment(1);
        debug!(partition_id = %self.inner.partition_id, %position, "Compacting log stream");
        self.inner.storage.compact(position).await
    }

    pub async fn close(&self) {
        self.inner.storage.close().await;
        info!(partition_id = %self.inner.partition_id, "Closed log stream");
    }

    async fn append(
        &self,
        entries: Vec<LogAppendEntry>,
        source_position: Option<Position>,
    ) -> Result<Position, AppendError> {
        if entries.is_empty() {
            return Err(AppendError::EmptyBatch);
        }
        let size = block_len(&entries);
        if size > self.inner.max_block_size {
            return Err(AppendError::BlockTooLarge {
                size,
                max: self.inner.max_block_size,
            });
        }

        let start = Instant::now();
        let count = entries.len();
        let (tx, rx) = oneshot::channel();
        let highest = {
            let mut next_position = self.inner.next_position.lock().await;
            // lock acquired
            if self.inner.failed.load(Ordering::Relaxed) {
                return Err(AppendError::Failed);
            }
            let lowest = *next_position;
            let timestamp = self.inner.clock.now();
            let positioned: Vec<_> = entries
                .into_iter()
                .enumerate()
                .map(|(i, entry)| {
                    LoggedEntry::from_append_entry(
                        entry,
                        lowest.advance_by(i as u64),
                        source_position,
                        timestamp,
                    )
                })
                .collect();
            let highest = lowest.advance_by(count as u64 - 1);

            let mut buf = BytesMut::with_capacity(size);
            encode_block(&positioned, &mut buf)?;

            let listener = Arc::new(SequencedAppend {
                stream: Arc::clone(&self.inner),
                highest,
                tx: Mutex::new(Some(tx)),
            });
            trace!(%lowest, %highest, "Appending block");
            self.inner
                .storage
                .append(lowest, highest, buf.freeze(), listener)
                .await;
            // next position points to the next available slot
            *next_position = highest.next();
            highest
            // lock dropped
        };

        match rx.await {
            Ok(Ok(())) => {
                counter!(LOG_STREAM_APPEND).increment(count as u64);
                histogram!(LOG_STREAM_APPEND_DURATION).record(start.elapsed());
                Ok(highest)
            }
            Ok(Err(e)) => Err(AppendError::Storage(e)),
            Err(_) => Err(AppendError::Shutdown(ShutdownError)),
        }
    }
}

/// Listener of one appended block, resolving the waiting writer.
struct SequencedAppend {
    stream: Arc<LogStreamInner>,
    highest: Position,
    tx: Mutex<Option<oneshot::Sender<Result<(), StorageError>>>>,
}

impl SequencedAppend {
    fn resolve(&self, result: Result<(), StorageError>) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(result);
        }
    }
}

impl AppendListener for SequencedAppend {
    fn on_write(&self, _index: u64) {
        self.stream
            .last_written_position
            .fetch_max(self.highest.as_i64(), Ordering::AcqRel);
    }

    fn on_write_error(&self, error: &StorageError) {
        counter!(LOG_STREAM_APPEND_FAILED).increment(1);
        if !self.stream.failed.swap(true, Ordering::AcqRel) {
            error!(
                partition_id = %self.stream.partition_id,
                position = %self.highest,
                "Failed writing block, log stream stops accepting appends: {}",
                error
            );
        }
        self.resolve(Err(error.clone()));
    }

    fn on_commit(&self, _index: u64) {
        if self.stream.commit_watch.notify(self.highest) {
            let listeners = self.stream.commit_listeners.lock().clone();
            for listener in listeners {
                listener.on_commit(self.highest);
            }
        }
        self.resolve(Ok(()));
    }
}

/// Appends entries to a log stream. Cheap to clone.
#[derive(Clone, Debug)]
pub struct LogStreamWriter {
    stream: LogStream,
}

impl LogStreamWriter {
    pub fn partition_id(&self) -> PartitionId {
        self.stream.partition_id()
    }

    /// Writes `entries` as one block and returns the position of the last entry once the
    /// block is committed. All entries carry `source_position` and the current time of the
    /// stream's clock.
    pub async fn try_write(
        &self,
        entries: Vec<LogAppendEntry>,
        source_position: Option<Position>,
    ) -> Result<Position, AppendError> {
        self.stream.append(entries, source_position).await
    }

    pub fn can_write(&self, count: usize, entries_len: usize) -> bool {
        self.stream.can_write(count, entries_len)
    }
}
