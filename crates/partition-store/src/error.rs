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
use keel_types::errors::GenericError;
use keel_types::storage::{StorageDecodeError, StorageEncodeError};

pub type Result<T, E = StorageError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error(transparent)]
    Generic(#[from] anyhow::Error),
    #[error("integrity constraint is violated")]
    DataIntegrityError,
    #[error("precondition failed: {0}")]
    PreconditionFailed(anyhow::Error),
    #[error("foreign key violation: {column_family} has no entry for {key}")]
    ForeignKeyViolation {
        column_family: &'static str,
        key: String,
    },
    #[error("partition store schema version {found} is newer than the supported version {supported}")]
    UnsupportedSchemaVersion { found: u16, supported: u16 },
    #[error("failed encoding value: {0}")]
    Encode(#[from] StorageEncodeError),
    #[error("failed decoding value: {0}")]
    Decode(#[from] StorageDecodeError),
    #[error("failed decoding key: {0}")]
    KeyDecode(GenericError),
    #[error(transparent)]
    Rocks(#[from] RocksError),
    #[error("snapshot failed: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}

impl From<rocksdb::Error> for StorageError {
    fn from(err: rocksdb::Error) -> Self {
        StorageError::Rocks(RocksError::from(err))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid snapshot metadata in {path}: {source}")]
    InvalidMetadata {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("snapshot {0} already exists")]
    AlreadyExists(String),
    #[error("nothing was processed yet")]
    NothingProcessed,
    #[error(transparent)]
    Store(Box<StorageError>),
}
