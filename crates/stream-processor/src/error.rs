// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use bytestring::ByteString;

use keel_core::ShutdownError;
use keel_log_stream::{AppendError, ReadError};
use keel_partition_store::snapshots::SnapshotError;
use keel_partition_store::StorageError;
use keel_types::logs::{Intent, Position, RejectionType, ValueType};
use keel_types::storage::{StorageDecodeError, StorageEncodeError};

use crate::StreamProcessorPhase;

/// A business level refusal of a command. The command counts as processed, its state
/// changes are discarded and a rejection entry is written instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{rejection_type}: {reason}")]
pub struct Rejection {
    pub rejection_type: RejectionType,
    pub reason: ByteString,
}

impl Rejection {
    pub fn new(rejection_type: RejectionType, reason: impl Into<ByteString>) -> Self {
        Self {
            rejection_type,
            reason: reason.into(),
        }
    }

    pub fn not_found(reason: impl Into<ByteString>) -> Self {
        Self::new(RejectionType::NotFound, reason)
    }

    pub fn already_exists(reason: impl Into<ByteString>) -> Self {
        Self::new(RejectionType::AlreadyExists, reason)
    }

    pub fn invalid_state(reason: impl Into<ByteString>) -> Self {
        Self::new(RejectionType::InvalidState, reason)
    }

    pub fn invalid_argument(reason: impl Into<ByteString>) -> Self {
        Self::new(RejectionType::InvalidArgument, reason)
    }

    pub fn resource_exhausted(reason: impl Into<ByteString>) -> Self {
        Self::new(RejectionType::ResourceExhausted, reason)
    }
}

/// Outcome of a command processor or event applier other than success. Everything but
/// [`ProcessingError::Rejected`] is unrecoverable and fails the stream processor.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("command rejected: {0}")]
    Rejected(#[from] Rejection),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("failed decoding payload: {0}")]
    Decode(#[from] StorageDecodeError),
    #[error("failed encoding payload: {0}")]
    Encode(#[from] StorageEncodeError),
    #[error("no event applier registered for {value_type}/{intent}")]
    NoApplier { value_type: ValueType, intent: Intent },
    #[error("key space of the partition is exhausted")]
    KeysExhausted,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProcessingError {
    pub fn is_rejection(&self) -> bool {
        matches!(self, ProcessingError::Rejected(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("a command processor for {value_type}/{intent} is registered already")]
    DuplicateProcessor { value_type: ValueType, intent: Intent },
    #[error("an event applier for {value_type}/{intent} is registered already")]
    DuplicateApplier { value_type: ValueType, intent: Intent },
}

#[derive(Debug, thiserror::Error)]
pub enum StreamProcessorError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Exporter(#[from] crate::exporter::ExporterStartError),
    #[error("failed reading the log stream: {0}")]
    Read(#[from] ReadError),
    #[error("failed writing follow-up entries: {0}")]
    Append(#[from] AppendError),
    #[error("log storage failed: {0}")]
    LogStorage(#[from] keel_log_stream::StorageError),
    #[error("no command processor registered for {value_type}/{intent} at position {position}")]
    NoProcessor {
        value_type: ValueType,
        intent: Intent,
        position: Position,
    },
    #[error("processing entry at position {position} failed: {source}")]
    Processing {
        position: Position,
        #[source]
        source: ProcessingError,
    },
    #[error("replaying entry at position {position} failed: {source}")]
    Replay {
        position: Position,
        #[source]
        source: ProcessingError,
    },
    #[error("cannot {operation} while {phase}")]
    InvalidPhase {
        operation: &'static str,
        phase: StreamProcessorPhase,
    },
    #[error("stream processor failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}
