// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.


use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace};

use keel_types::logs::{Position, SequenceNumber};

use super::{AppendListener, LogStorage, LogStorageReader, StoredBlock};
use crate::error::StorageError;

type Blocks = Arc<RwLock<BTreeMap<Position, StoredBlock>>>;

/// Keeps blocks in memory. Useful for tests and embedded use.
#[derive(Default)]
pub struct MemoryLogStorage {
    blocks: Blocks,
    next_index: AtomicU64,
    closed: AtomicBool,
    rejection: Mutex<Option<String>>,
}

impl MemoryLogStorage {
    pub fn new() -> Arc<Self> {
        info!("Starting in-memory log storage");
        Arc::default()
    }

    /// Fails every following append with `reason` until cleared with `None`.
    pub fn reject_writes(&self, reason: Option<String>) {
        *self.rejection.lock() = reason;
    }

    pub fn block_count(&self) -> usize {
        self.blocks.read().len()
    }
}

#[async_trait]
impl LogStorage for MemoryLogStorage {
    async fn append(
        &self,
        lowest: Position,
        highest: Position,
        block: Bytes,
        listener: Arc<dyn AppendListener>,
    ) {
        if self.closed.load(Ordering::Relaxed) {
            listener.on_write_error(&StorageError::Closed);
            return;
        }
        if let Some(reason) = self.rejection.lock().clone() {
            listener.on_write_error(&StorageError::WriteRejected(reason));
            return;
        }

        let index = self.next_index.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(%lowest, %highest, index, "Appending block to in-memory log storage");
        self.blocks.write().insert(
            lowest,
            StoredBlock {
                lowest,
                highest,
                data: block,
            },
        );
        listener.on_write(index);
        listener.on_commit(index);
    }

    fn new_reader(&self) -> Box<dyn LogStorageReader> {
        Box::new(MemoryStorageReader {
            blocks: Arc::clone(&self.blocks),
            next_lowest: Position::INVALID,
        })
    }

    fn last_block(&self) -> Result<Option<StoredBlock>, StorageError> {
        Ok(self.blocks.read().values().next_back().cloned())
    }

    async fn compact(&self, position: Position) -> Result<(), StorageError> {
        let mut blocks = self.blocks.write();
        let before = blocks.len();
        blocks.retain(|_, block| block.highest > position);
        debug!(
            %position,
            "Compacted {} blocks of in-memory log storage",
            before - blocks.len()
        );
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        info!("Closed in-memory log storage");
    }
}

struct MemoryStorageReader {
    blocks: Blocks,
    // lowest position of the next block to return
    next_lowest: Position,
}

impl LogStorageReader for MemoryStorageReader {
    fn seek(&mut self, position: Position) -> Result<(), StorageError> {
        let blocks = self.blocks.read();
        self.next_lowest = match blocks.range(..=position).next_back() {
            Some((lowest, block)) if block.highest >= position => *lowest,
            _ => position,
        };
        Ok(())
    }

    fn next_block(&mut self) -> Result<Option<StoredBlock>, StorageError> {
        let blocks = self.blocks.read();
        let next = blocks.range(self.next_lowest..).next().map(|(_, b)| b.clone());
        if let Some(block) = &next {
            self.next_lowest = block.highest.next();
        }
        Ok(next)
    }
}
