// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use bytes::Bytes;
use bytestring::ByteString;

use keel_partition_store::PartitionStoreTransaction;
use keel_types::logs::{
    Intent, LogAppendEntry, LoggedEntry, RecordMetadata, RecordType, RequestMetadata, ValueType,
};
use keel_types::{Key, PartitionId};

use crate::error::ProcessingError;
use crate::key_generator::KeyGenerator;
use crate::registry::{EventRecord, ProcessorRegistry};
use crate::response::CommandResponse;

/// Work that runs once the results of a command were committed.
pub enum PostCommitTask {
    /// Hands a command to another partition through the inter-partition sender.
    SendCommand {
        target: PartitionId,
        entry: LogAppendEntry,
    },
    Run(Box<dyn FnOnce() + Send>),
}

impl std::fmt::Debug for PostCommitTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PostCommitTask::SendCommand { target, entry } => f
                .debug_struct("SendCommand")
                .field("target", target)
                .field("metadata", &entry.metadata)
                .finish(),
            PostCommitTask::Run(_) => f.write_str("Run"),
        }
    }
}

/// Everything the processing of one command produced.
#[derive(Debug, Default)]
pub struct ProcessingResult {
    pub entries: Vec<LogAppendEntry>,
    pub response: Option<(RequestMetadata, CommandResponse)>,
    pub post_commit_tasks: Vec<PostCommitTask>,
}

impl ProcessingResult {
    /// Whether processing produced nothing at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.response.is_none() && self.post_commit_tasks.is_empty()
    }

    pub fn encoded_len(&self) -> usize {
        self.entries.iter().map(LogAppendEntry::encoded_len).sum()
    }
}

/// Handed to a [`CommandProcessor`](crate::CommandProcessor) for the duration of one
/// command. Gives read access to the state and collects the results.
pub struct ProcessingContext<'a, 'txn> {
    partition_id: PartitionId,
    command: &'a LoggedEntry,
    txn: &'a mut PartitionStoreTransaction<'txn>,
    registry: &'a ProcessorRegistry,
    key_generator: KeyGenerator,
    result: ProcessingResult,
}

impl<'a, 'txn> ProcessingContext<'a, 'txn> {
    pub(crate) fn new(
        partition_id: PartitionId,
        command: &'a LoggedEntry,
        txn: &'a mut PartitionStoreTransaction<'txn>,
        registry: &'a ProcessorRegistry,
    ) -> Self {
        Self {
            partition_id,
            command,
            txn,
            registry,
            key_generator: KeyGenerator::new(partition_id),
            result: ProcessingResult::default(),
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    /// The command being processed.
    pub fn command(&self) -> &'a LoggedEntry {
        self.command
    }

    /// Read access to the state, including the effects of events appended so far.
    pub fn state(&self) -> &PartitionStoreTransaction<'txn> {
        self.txn
    }

    pub fn next_key(&mut self) -> Result<Key, ProcessingError> {
        self.key_generator.next_key(self.txn)
    }

    /// Appends an event and applies it to the state right away.
    pub fn append_event(
        &mut self,
        key: Key,
        value_type: ValueType,
        intent: Intent,
        payload: impl Into<Bytes>,
    ) -> Result<(), ProcessingError> {
        let entry = LogAppendEntry::event(key, value_type, intent, payload);
        self.registry.apply(&EventRecord::from(&entry), self.txn)?;
        self.result.entries.push(entry);
        Ok(())
    }

    /// Appends a follow-up command. It is processed once it was read back from the log.
    pub fn append_command(
        &mut self,
        key: Option<Key>,
        value_type: ValueType,
        intent: Intent,
        payload: impl Into<Bytes>,
    ) {
        self.result
            .entries
            .push(LogAppendEntry::command(key, value_type, intent, payload));
    }

    /// Answers the requester of the command, if there is one. A later response replaces an
    /// earlier one.
    pub fn respond(
        &mut self,
        key: Option<Key>,
        value_type: ValueType,
        intent: Intent,
        payload: impl Into<Bytes>,
    ) {
        let Some(request) = self.command.metadata.request else {
            return;
        };
        let response = CommandResponse {
            partition_id: self.partition_id,
            key,
            record_type: RecordType::Event,
            value_type,
            intent,
            rejection_type: None,
            rejection_reason: Default::default(),
            payload: payload.into(),
        };
        self.result.response = Some((request, response));
    }

    pub fn add_post_commit_task(&mut self, task: PostCommitTask) {
        self.result.post_commit_tasks.push(task);
    }

    pub(crate) fn into_result(self) -> ProcessingResult {
        self.result
    }
}

/// The entry and response written for a rejected command. The entry is shrunk to
/// `max_entry_len` by dropping the command payload first and then cutting the reason, the
/// response keeps both.
pub(crate) fn rejection_result(
    partition_id: PartitionId,
    command: &LoggedEntry,
    rejection: &crate::Rejection,
    max_entry_len: usize,
) -> ProcessingResult {
    let mut payload = command.payload.clone();
    if LoggedEntry::FIXED_LEN + rejection.reason.len() + payload.len() > max_entry_len {
        payload = Bytes::new();
    }
    let reason_budget = max_entry_len
        .saturating_sub(LoggedEntry::FIXED_LEN)
        .min(usize::from(u16::MAX));
    let mut metadata = RecordMetadata::rejection(
        command.value_type(),
        command.intent(),
        rejection.rejection_type,
        truncate_reason(&rejection.reason, reason_budget),
    );
    metadata.request = command.metadata.request;

    let response = command.metadata.request.map(|request| {
        (
            request,
            CommandResponse {
                partition_id,
                key: command.key,
                record_type: RecordType::CommandRejection,
                value_type: command.value_type(),
                intent: command.intent(),
                rejection_type: Some(rejection.rejection_type),
                rejection_reason: rejection.reason.clone(),
                payload: command.payload.clone(),
            },
        )
    });

    ProcessingResult {
        entries: vec![LogAppendEntry::new(command.key, metadata, payload)],
        response,
        post_commit_tasks: Vec::new(),
    }
}

fn truncate_reason(reason: &ByteString, max_len: usize) -> ByteString {
    if reason.len() <= max_len {
        return reason.clone();
    }
    let mut end = max_len;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    ByteString::from(&reason[..end])
}
