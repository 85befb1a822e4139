// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Command distribution: reliable delivery of a command from one partition to others.
//!
//! Every state change of a distribution is an event of [`ValueType::CommandDistribution`],
//! applied by [`CommandDistributionApplier`], so distributions replay like any other state.
//! A distribution starts with `STARTED`. Each target partition then either gets a
//! `DISTRIBUTING` event and the command is sent after commit, or an `ENQUEUED` event if an
//! earlier command of the same queue is still in flight towards that partition. The
//! receiving partition answers with an `ACKNOWLEDGE` command, which yields `ACKNOWLEDGED`,
//! `DEQUEUED` (queued distributions only), `DISTRIBUTING` for the next queued command and,
//! once no target is left, `FINISHED`.

mod redistributor;
mod sender;

pub use redistributor::CommandRedistributor;
pub use sender::{InterPartitionCommandSender, LocalPartitionRouter};

use bytes::{Bytes, BytesMut};
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

use keel_partition_store::distribution_table::{
    DistributionTable, ReadOnlyDistributionTable, StoredDistributionCommand,
};
use keel_partition_store::PartitionStoreTransaction;
use keel_types::flexbuffers_storage_encode_decode;
use keel_types::logs::{Intent, LogAppendEntry, RecordMetadata, ValueType};
use keel_types::storage::{StorageCodec, StorageDecodeError, StorageEncodeError};
use keel_types::{Key, PartitionId};

use crate::error::{ProcessingError, RegistryError, Rejection};
use crate::processing::{PostCommitTask, ProcessingContext};
use crate::registry::{CommandProcessor, EventApplier, EventRecord, ProcessorRegistry};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::FromRepr,
    strum::Display,
    strum::EnumIter,
)]
#[repr(u16)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandDistributionIntent {
    Started = 0,
    Distributing = 1,
    /// The only command intent, sent by a receiving partition.
    Acknowledge = 2,
    Acknowledged = 3,
    Finished = 4,
    Enqueued = 5,
    Dequeued = 6,
}

impl CommandDistributionIntent {
    pub fn from_intent(intent: Intent) -> Option<Self> {
        Self::from_repr(intent.code())
    }

    pub fn is_event(self) -> bool {
        self != CommandDistributionIntent::Acknowledge
    }
}

impl From<CommandDistributionIntent> for Intent {
    fn from(value: CommandDistributionIntent) -> Self {
        Intent::new(value as u16)
    }
}

/// The command carried by a `STARTED` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedCommand {
    pub value_type: ValueType,
    pub intent: Intent,
    pub payload: Bytes,
}

/// Payload of every [`ValueType::CommandDistribution`] record. `partition_id` is the
/// distributing partition for `STARTED` and `FINISHED`, the target partition otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDistributionRecord {
    pub partition_id: PartitionId,
    pub queue: Option<ByteString>,
    pub command: Option<DistributedCommand>,
}
flexbuffers_storage_encode_decode!(CommandDistributionRecord);

impl CommandDistributionRecord {
    pub fn new(partition_id: PartitionId, queue: Option<ByteString>) -> Self {
        Self {
            partition_id,
            queue,
            command: None,
        }
    }

    pub fn to_payload(&self) -> Result<Bytes, StorageEncodeError> {
        let mut buf = BytesMut::new();
        StorageCodec::encode(self, &mut buf)?;
        Ok(buf.freeze())
    }

    pub fn from_payload(payload: &Bytes) -> Result<Self, StorageDecodeError> {
        StorageCodec::decode(&mut payload.clone())
    }
}

/// A command to deliver to a set of partitions.
#[derive(Debug, Clone)]
pub struct DistributionRequest {
    /// Commands of the same queue reach each partition in the order they were
    /// distributed, one at a time.
    pub queue: Option<ByteString>,
    pub targets: Vec<PartitionId>,
    pub value_type: ValueType,
    pub intent: Intent,
    pub payload: Bytes,
}

/// The command a target partition receives. Its key is the distribution key, which tells
/// the target where to send the acknowledgement.
pub fn distributed_command_entry(
    distribution_key: Key,
    command: &StoredDistributionCommand,
) -> LogAppendEntry {
    LogAppendEntry::new(
        Some(distribution_key),
        RecordMetadata::command(command.value_type, command.intent).distributed(),
        command.payload.clone(),
    )
}

/// The acknowledgement `acknowledging_partition` sends for `distribution_key`.
pub fn acknowledge_entry(
    distribution_key: Key,
    acknowledging_partition: PartitionId,
) -> Result<LogAppendEntry, StorageEncodeError> {
    let record = CommandDistributionRecord::new(acknowledging_partition, None);
    Ok(LogAppendEntry::command(
        Some(distribution_key),
        ValueType::CommandDistribution,
        CommandDistributionIntent::Acknowledge.into(),
        record.to_payload()?,
    ))
}

fn append_distribution_event(
    ctx: &mut ProcessingContext<'_, '_>,
    key: Key,
    intent: CommandDistributionIntent,
    record: &CommandDistributionRecord,
) -> Result<(), ProcessingError> {
    ctx.append_event(
        key,
        ValueType::CommandDistribution,
        intent.into(),
        record.to_payload()?,
    )
}

fn send_after_commit(
    ctx: &mut ProcessingContext<'_, '_>,
    distribution_key: Key,
    target: PartitionId,
) -> Result<(), ProcessingError> {
    let command = ctx
        .state()
        .get_distribution_command(distribution_key)?
        .ok_or_else(|| {
            ProcessingError::Other(anyhow::anyhow!(
                "distribution {distribution_key:?} has no stored command"
            ))
        })?;
    ctx.add_post_commit_task(PostCommitTask::SendCommand {
        target,
        entry: distributed_command_entry(distribution_key, &command),
    });
    Ok(())
}

impl ProcessingContext<'_, '_> {
    /// Distributes a command to `request.targets` and returns the distribution key, or
    /// `None` if there is no target. The distribution is recorded in the transaction of the
    /// current command and sent once it committed.
    pub fn distribute(&mut self, request: DistributionRequest) -> Result<Option<Key>, ProcessingError> {
        let mut targets = request.targets;
        targets.sort();
        targets.dedup();
        if targets.is_empty() {
            return Ok(None);
        }

        let distribution_key = self.next_key()?;
        let started = CommandDistributionRecord {
            partition_id: self.partition_id(),
            queue: request.queue.clone(),
            command: Some(DistributedCommand {
                value_type: request.value_type,
                intent: request.intent,
                payload: request.payload,
            }),
        };
        append_distribution_event(
            self,
            distribution_key,
            CommandDistributionIntent::Started,
            &started,
        )?;

        for target in targets {
            let record = CommandDistributionRecord::new(target, request.queue.clone());
            let in_flight = match &request.queue {
                Some(queue) => self.state().peek_queued(queue, target)?.is_some(),
                None => false,
            };
            if in_flight {
                append_distribution_event(
                    self,
                    distribution_key,
                    CommandDistributionIntent::Enqueued,
                    &record,
                )?;
            } else {
                append_distribution_event(
                    self,
                    distribution_key,
                    CommandDistributionIntent::Distributing,
                    &record,
                )?;
                send_after_commit(self, distribution_key, target)?;
            }
        }
        Ok(Some(distribution_key))
    }
}

/// Applies all [`CommandDistributionIntent`] events to the distribution table.
#[derive(Debug, Default)]
pub struct CommandDistributionApplier;

impl EventApplier for CommandDistributionApplier {
    fn apply(
        &self,
        event: &EventRecord<'_>,
        txn: &mut PartitionStoreTransaction<'_>,
    ) -> Result<(), ProcessingError> {
        let key = event.key.ok_or_else(|| {
            ProcessingError::Other(anyhow::anyhow!("distribution event without key"))
        })?;
        let record = CommandDistributionRecord::from_payload(event.payload)?;
        let queue = || {
            record.queue.as_ref().ok_or_else(|| {
                ProcessingError::Other(anyhow::anyhow!(
                    "{} event of distribution {key:?} without queue",
                    event.intent
                ))
            })
        };

        match CommandDistributionIntent::from_intent(event.intent) {
            Some(CommandDistributionIntent::Started) => {
                let command = record.command.as_ref().ok_or_else(|| {
                    ProcessingError::Other(anyhow::anyhow!(
                        "started distribution {key:?} without command"
                    ))
                })?;
                txn.put_distribution_command(
                    key,
                    &StoredDistributionCommand {
                        value_type: command.value_type,
                        intent: command.intent,
                        payload: command.payload.clone(),
                        queue: record.queue.clone(),
                    },
                )?;
            }
            Some(CommandDistributionIntent::Distributing) => {
                txn.add_retriable(key, record.partition_id)?;
                // the command in flight stays the head of its queue until acknowledged
                if let Some(queue) = &record.queue {
                    txn.enqueue(queue, record.partition_id, key)?;
                }
            }
            Some(CommandDistributionIntent::Enqueued) => {
                txn.enqueue(queue()?, record.partition_id, key)?;
            }
            Some(CommandDistributionIntent::Acknowledged) => {
                txn.remove_retriable(key, record.partition_id)?;
            }
            Some(CommandDistributionIntent::Dequeued) => {
                txn.dequeue(queue()?, record.partition_id, key)?;
            }
            Some(CommandDistributionIntent::Finished) => {
                txn.delete_distribution_command(key)?;
            }
            Some(CommandDistributionIntent::Acknowledge) | None => {
                return Err(ProcessingError::Other(anyhow::anyhow!(
                    "{} is not a distribution event intent",
                    event.intent
                )));
            }
        }
        Ok(())
    }
}

/// Processes the acknowledgement of a target partition.
#[derive(Debug, Default)]
pub struct AcknowledgeProcessor;

impl CommandProcessor for AcknowledgeProcessor {
    fn process(&self, ctx: &mut ProcessingContext<'_, '_>) -> Result<(), ProcessingError> {
        let command = ctx.command();
        let distribution_key = command
            .key
            .ok_or_else(|| Rejection::invalid_argument("acknowledgement without distribution key"))?;
        let target = CommandDistributionRecord::from_payload(&command.payload)?.partition_id;

        if !ctx.state().is_retriable(distribution_key, target)? {
            return Err(Rejection::not_found(format!(
                "distribution {distribution_key} is not pending for partition {target}"
            ))
            .into());
        }
        let queue = ctx
            .state()
            .get_distribution_command(distribution_key)?
            .and_then(|command| command.queue);

        let record = CommandDistributionRecord::new(target, queue.clone());
        append_distribution_event(
            ctx,
            distribution_key,
            CommandDistributionIntent::Acknowledged,
            &record,
        )?;

        if let Some(queue) = &queue {
            append_distribution_event(
                ctx,
                distribution_key,
                CommandDistributionIntent::Dequeued,
                &record,
            )?;
            if let Some(next) = ctx.state().peek_queued(queue, target)? {
                append_distribution_event(
                    ctx,
                    next,
                    CommandDistributionIntent::Distributing,
                    &CommandDistributionRecord::new(target, Some(queue.clone())),
                )?;
                send_after_commit(ctx, next, target)?;
            }
        }

        if !ctx
            .state()
            .has_pending_targets(distribution_key, queue.as_ref())?
        {
            let finished = CommandDistributionRecord::new(ctx.partition_id(), queue);
            append_distribution_event(
                ctx,
                distribution_key,
                CommandDistributionIntent::Finished,
                &finished,
            )?;
        }

        ctx.respond(
            Some(distribution_key),
            ValueType::CommandDistribution,
            CommandDistributionIntent::Acknowledged.into(),
            command.payload.clone(),
        );
        Ok(())
    }
}

/// Registers the built-in distribution processor and applier.
pub fn register_distribution(registry: &mut ProcessorRegistry) -> Result<(), RegistryError> {
    let applier = std::sync::Arc::new(CommandDistributionApplier);
    for intent in <CommandDistributionIntent as strum::IntoEnumIterator>::iter() {
        if intent.is_event() {
            registry.register_shared_applier(
                ValueType::CommandDistribution,
                intent.into(),
                applier.clone(),
            )?;
        }
    }
    registry.register_processor(
        ValueType::CommandDistribution,
        CommandDistributionIntent::Acknowledge.into(),
        AcknowledgeProcessor,
    )?;
    Ok(())
}
