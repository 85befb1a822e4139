// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Bookkeeping of commands that are distributed to other partitions.
//!
//! A distributed command is stored once in [`DISTRIBUTION_COMMANDS`]. Every target
//! partition that did not acknowledge it yet has a marker in [`RETRIABLE_DISTRIBUTIONS`].
//! Commands distributed through an ordering queue additionally hold a marker in
//! [`QUEUED_DISTRIBUTIONS`] per target partition until they were acknowledged; the oldest
//! queued marker of a queue and partition is the one in flight. Markers reference their
//! command, inserting a marker for an unknown command fails.
//!
//! [`PENDING_DISTRIBUTIONS`] is the layout used by stores of schema version 0. It is only
//! read by the distribution migration.

use bytes::Bytes;
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

use keel_types::flexbuffers_storage_encode_decode;
use keel_types::logs::{Intent, ValueType};
use keel_types::{Key, PartitionId};

use crate::column_family::ColumnFamily;
use crate::keys::{define_table_key, KeyKind};
use crate::partition_store::{PartitionStoreTransaction, StorageAccess};
use crate::{Result, StorageError};

define_table_key!(
    KeyKind::DistributionCommand,
    DistributionCommandKey(distribution_key: Key)
);
define_table_key!(
    KeyKind::DistributionPending,
    PendingDistributionKey(distribution_key: Key, partition_id: PartitionId)
);
define_table_key!(
    KeyKind::DistributionRetriable,
    RetriableDistributionKey(distribution_key: Key, partition_id: PartitionId)
);
define_table_key!(
    KeyKind::DistributionQueued,
    QueuedDistributionKey(queue: ByteString, partition_id: PartitionId, distribution_key: Key)
);

/// The command that is delivered to every target partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDistributionCommand {
    pub value_type: ValueType,
    pub intent: Intent,
    pub payload: Bytes,
    /// Ordering queue, commands of one queue reach a partition in creation order.
    pub queue: Option<ByteString>,
}
flexbuffers_storage_encode_decode!(StoredDistributionCommand);

/// Legacy value of [`PENDING_DISTRIBUTIONS`], every record carried its own copy of the
/// command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyPendingDistribution {
    pub value_type: ValueType,
    pub intent: Intent,
    pub payload: Bytes,
}
flexbuffers_storage_encode_decode!(LegacyPendingDistribution);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionMarker;
flexbuffers_storage_encode_decode!(DistributionMarker);

pub const DISTRIBUTION_COMMANDS: ColumnFamily<DistributionCommandKey, StoredDistributionCommand> =
    ColumnFamily::new("distribution-command");
pub const PENDING_DISTRIBUTIONS: ColumnFamily<PendingDistributionKey, LegacyPendingDistribution> =
    ColumnFamily::new("pending-distribution");
pub const RETRIABLE_DISTRIBUTIONS: ColumnFamily<RetriableDistributionKey, DistributionMarker> =
    ColumnFamily::new("retriable-distribution");
pub const QUEUED_DISTRIBUTIONS: ColumnFamily<QueuedDistributionKey, DistributionMarker> =
    ColumnFamily::new("queued-distribution");

fn command_key(distribution_key: Key) -> DistributionCommandKey {
    DistributionCommandKey::default().distribution_key(distribution_key)
}

fn retriable_key(distribution_key: Key, partition_id: PartitionId) -> RetriableDistributionKey {
    RetriableDistributionKey::default()
        .distribution_key(distribution_key)
        .partition_id(partition_id)
}

fn queued_key(
    queue: &ByteString,
    partition_id: PartitionId,
    distribution_key: Key,
) -> QueuedDistributionKey {
    QueuedDistributionKey::default()
        .queue(queue.clone())
        .partition_id(partition_id)
        .distribution_key(distribution_key)
}

pub trait ReadOnlyDistributionTable {
    fn get_distribution_command(&self, distribution_key: Key) -> Result<Option<StoredDistributionCommand>>;

    fn is_retriable(&self, distribution_key: Key, partition_id: PartitionId) -> Result<bool>;

    /// Whether any target partition still has to acknowledge the command.
    fn has_pending_targets(&self, distribution_key: Key, queue: Option<&ByteString>) -> Result<bool>;

    /// Visits all retriable markers ordered by distribution key, until `f` returns `false`.
    fn for_each_retriable(&self, f: impl FnMut(Key, PartitionId) -> Result<bool>) -> Result<()>;

    /// The oldest queued distribution of `queue` towards `partition_id`.
    fn peek_queued(&self, queue: &ByteString, partition_id: PartitionId) -> Result<Option<Key>>;

    /// Visits legacy pending records in key order.
    fn for_each_pending_legacy(
        &self,
        f: impl FnMut(Key, PartitionId, LegacyPendingDistribution) -> Result<()>,
    ) -> Result<()>;
}

pub trait DistributionTable: ReadOnlyDistributionTable {
    /// Stores a new command, fails if one is stored under `distribution_key` already.
    fn put_distribution_command(
        &mut self,
        distribution_key: Key,
        command: &StoredDistributionCommand,
    ) -> Result<()>;

    fn delete_distribution_command(&mut self, distribution_key: Key) -> Result<()>;

    fn add_retriable(&mut self, distribution_key: Key, partition_id: PartitionId) -> Result<()>;

    fn remove_retriable(&mut self, distribution_key: Key, partition_id: PartitionId) -> Result<()>;

    fn enqueue(&mut self, queue: &ByteString, partition_id: PartitionId, distribution_key: Key) -> Result<()>;

    fn dequeue(&mut self, queue: &ByteString, partition_id: PartitionId, distribution_key: Key) -> Result<()>;

    fn delete_pending_legacy(&mut self, distribution_key: Key, partition_id: PartitionId) -> Result<()>;
}

impl<S: StorageAccess> ReadOnlyDistributionTable for S {
    fn get_distribution_command(&self, distribution_key: Key) -> Result<Option<StoredDistributionCommand>> {
        DISTRIBUTION_COMMANDS.get(self, &command_key(distribution_key))
    }

    fn is_retriable(&self, distribution_key: Key, partition_id: PartitionId) -> Result<bool> {
        RETRIABLE_DISTRIBUTIONS.exists(self, &retriable_key(distribution_key, partition_id))
    }

    fn has_pending_targets(&self, distribution_key: Key, queue: Option<&ByteString>) -> Result<bool> {
        let mut pending = false;
        RETRIABLE_DISTRIBUTIONS.while_equal_prefix(
            self,
            &RetriableDistributionKey::default().distribution_key(distribution_key),
            |_, _| {
                pending = true;
                Ok(false)
            },
        )?;
        if pending {
            return Ok(true);
        }
        if let Some(queue) = queue {
            QUEUED_DISTRIBUTIONS.while_equal_prefix(
                self,
                &QueuedDistributionKey::default().queue(queue.clone()),
                |key, _| {
                    pending = key.distribution_key == Some(distribution_key);
                    Ok(!pending)
                },
            )?;
        }
        Ok(pending)
    }

    fn for_each_retriable(&self, mut f: impl FnMut(Key, PartitionId) -> Result<bool>) -> Result<()> {
        RETRIABLE_DISTRIBUTIONS.while_true(self, |key, _| {
            let (distribution_key, partition_id) = key.into_inner_ok_or()?;
            f(distribution_key, partition_id)
        })
    }

    fn peek_queued(&self, queue: &ByteString, partition_id: PartitionId) -> Result<Option<Key>> {
        let mut head = None;
        QUEUED_DISTRIBUTIONS.while_equal_prefix(
            self,
            &QueuedDistributionKey::default()
                .queue(queue.clone())
                .partition_id(partition_id),
            |key, _| {
                head = key.distribution_key;
                Ok(false)
            },
        )?;
        Ok(head)
    }

    fn for_each_pending_legacy(
        &self,
        mut f: impl FnMut(Key, PartitionId, LegacyPendingDistribution) -> Result<()>,
    ) -> Result<()> {
        PENDING_DISTRIBUTIONS.for_each(self, |key, value| {
            let (distribution_key, partition_id) = key.into_inner_ok_or()?;
            f(distribution_key, partition_id, value)
        })
    }
}

impl PartitionStoreTransaction<'_> {
    fn ensure_command_exists(&self, distribution_key: Key, family: &'static str) -> Result<()> {
        if DISTRIBUTION_COMMANDS.exists(self, &command_key(distribution_key))? {
            Ok(())
        } else {
            Err(StorageError::ForeignKeyViolation {
                column_family: family,
                key: distribution_key.to_string(),
            })
        }
    }
}

impl DistributionTable for PartitionStoreTransaction<'_> {
    fn put_distribution_command(
        &mut self,
        distribution_key: Key,
        command: &StoredDistributionCommand,
    ) -> Result<()> {
        DISTRIBUTION_COMMANDS.insert(self, &command_key(distribution_key), command)
    }

    fn delete_distribution_command(&mut self, distribution_key: Key) -> Result<()> {
        DISTRIBUTION_COMMANDS.delete(self, &command_key(distribution_key))
    }

    fn add_retriable(&mut self, distribution_key: Key, partition_id: PartitionId) -> Result<()> {
        self.ensure_command_exists(distribution_key, RETRIABLE_DISTRIBUTIONS.name())?;
        RETRIABLE_DISTRIBUTIONS.upsert(
            self,
            &retriable_key(distribution_key, partition_id),
            &DistributionMarker,
        )
    }

    fn remove_retriable(&mut self, distribution_key: Key, partition_id: PartitionId) -> Result<()> {
        RETRIABLE_DISTRIBUTIONS.delete_existing(self, &retriable_key(distribution_key, partition_id))
    }

    fn enqueue(&mut self, queue: &ByteString, partition_id: PartitionId, distribution_key: Key) -> Result<()> {
        self.ensure_command_exists(distribution_key, QUEUED_DISTRIBUTIONS.name())?;
        QUEUED_DISTRIBUTIONS.upsert(
            self,
            &queued_key(queue, partition_id, distribution_key),
            &DistributionMarker,
        )
    }

    fn dequeue(&mut self, queue: &ByteString, partition_id: PartitionId, distribution_key: Key) -> Result<()> {
        QUEUED_DISTRIBUTIONS.delete(self, &queued_key(queue, partition_id, distribution_key))
    }

    fn delete_pending_legacy(&mut self, distribution_key: Key, partition_id: PartitionId) -> Result<()> {
        PENDING_DISTRIBUTIONS.delete(
            self,
            &PendingDistributionKey::default()
                .distribution_key(distribution_key)
                .partition_id(partition_id),
        )
    }
}

/// Writes a record in the legacy layout, as stores of schema version 0 did.
#[cfg(any(test, feature = "test-util"))]
pub fn put_pending_legacy(
    txn: &mut PartitionStoreTransaction<'_>,
    distribution_key: Key,
    partition_id: PartitionId,
    value: &LegacyPendingDistribution,
) -> Result<()> {
    PENDING_DISTRIBUTIONS.upsert(
        txn,
        &PendingDistributionKey::default()
            .distribution_key(distribution_key)
            .partition_id(partition_id),
        value,
    )
}
