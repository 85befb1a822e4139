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
use tracing::warn;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RocksError {
    #[error("db is locked: {0}")]
    DbLocked(rocksdb::Error),
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
    #[error("already open")]
    AlreadyOpen,
    #[error("checkpoint target {0} already exists")]
    CheckpointTargetExists(String),
    #[error(transparent)]
    Other(rocksdb::Error),
}

impl From<rocksdb::Error> for RocksError {
    fn from(err: rocksdb::Error) -> Self {
        Self::from_rocksdb_error(err)
    }
}

impl RocksError {
    pub(crate) fn from_rocksdb_error(err: rocksdb::Error) -> Self {
        let err_message = err.to_string();

        if err_message.starts_with("IO error: While lock file:")
            && err_message.ends_with("Resource temporarily unavailable")
        {
            Self::DbLocked(err)
        } else {
            if err_message.contains("Direct I/O is not supported") {
                warn!("RocksDB cannot use direct I/O on this file system, are you running on an encrypted fs?");
            }
            Self::Other(err)
        }
    }
}
