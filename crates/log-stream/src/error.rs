// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.


use keel_core::ShutdownError;
use keel_rocksdb::RocksError;
use keel_types::logs::{LogEntryDecodeError, LogEntryEncodeError, Position};

/// Failure of a log storage. Handed to every listener of a failed write, hence `Clone`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error(transparent)]
    Rocks(#[from] RocksError),
    #[error("corrupted block: {0}")]
    CorruptedBlock(String),
    #[error("log storage is closed")]
    Closed,
    #[error("write rejected: {0}")]
    WriteRejected(String),
    #[error("invalid storage setup: {0}")]
    InvalidSetup(String),
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}

impl From<rocksdb::Error> for StorageError {
    fn from(value: rocksdb::Error) -> Self {
        Self::Rocks(RocksError::from(value))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppendError {
    #[error("cannot append an empty batch")]
    EmptyBatch,
    #[error("batch of {size} bytes exceeds the maximum block size of {max} bytes")]
    BlockTooLarge { size: usize, max: usize },
    #[error(transparent)]
    Encode(#[from] LogEntryEncodeError),
    #[error("failed writing block: {0}")]
    Storage(#[from] StorageError),
    #[error("log stream failed after an earlier write error and does not accept appends")]
    Failed,
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("no committed entry after position {0}")]
    NoNextEntry(Position),
    #[error(transparent)]
    Decode(#[from] LogEntryDecodeError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}

#[derive(Debug, thiserror::Error)]
pub enum LogStreamError {
    #[error("failed opening log storage: {0}")]
    Storage(#[from] StorageError),
    #[error("failed recovering the log tail: {0}")]
    Decode(#[from] LogEntryDecodeError),
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}
