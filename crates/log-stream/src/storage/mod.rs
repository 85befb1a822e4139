// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.


//! Pluggable storage modules of a log stream.
//!
//! A storage only knows about blocks and the positions they span. Position assignment,
//! encoding and visibility are the business of [`crate::LogStream`].

mod local;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use keel_types::logs::Position;

pub use local::LocalLogStorage;
pub use memory::MemoryLogStorage;

use crate::error::StorageError;

/// A stored block and the range of positions it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlock {
    pub lowest: Position,
    pub highest: Position,
    pub data: Bytes,
}

/// Receives the outcome of one [`LogStorage::append`].
///
/// `index` is the storage specific address of the block. A successful write calls
/// `on_write` and then `on_commit` once the block is visible to readers. A failed write
/// only calls `on_write_error`, nothing of the block is ever visible.
pub trait AppendListener: Send + Sync + 'static {
    fn on_write(&self, _index: u64) {}

    fn on_write_error(&self, error: &StorageError);

    fn on_commit(&self, _index: u64) {}
}

static_assertions::assert_obj_safe!(AppendListener);

#[async_trait]
pub trait LogStorage: Send + Sync + 'static {
    /// Writes one block holding the entries `lowest..=highest`. Blocks must be appended
    /// in position order. The outcome is reported to `listener`.
    async fn append(
        &self,
        lowest: Position,
        highest: Position,
        block: Bytes,
        listener: Arc<dyn AppendListener>,
    );

    fn new_reader(&self) -> Box<dyn LogStorageReader>;

    /// The block holding the highest position, if any.
    fn last_block(&self) -> Result<Option<StoredBlock>, StorageError>;

    /// Deletes every block whose highest position is at or before `position`.
    async fn compact(&self, position: Position) -> Result<(), StorageError>;

    /// Stops accepting appends. Pending appends are completed or failed.
    async fn close(&self);
}

static_assertions::assert_obj_safe!(LogStorage);

/// Forward cursor over the blocks of a storage. Sees blocks appended after its creation.
pub trait LogStorageReader: Send + 'static {
    /// Positions the reader so that the next block returned holds `position`, or is the
    /// first block after it when no block holds it.
    fn seek(&mut self, position: Position) -> Result<(), StorageError>;

    fn next_block(&mut self) -> Result<Option<StoredBlock>, StorageError>;
}
