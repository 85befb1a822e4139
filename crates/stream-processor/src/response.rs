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

use keel_types::logs::{Intent, RecordType, RejectionType, RequestMetadata, ValueType};
use keel_types::{Key, PartitionId};

/// The answer to a command, routed back to whoever is waiting for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    pub partition_id: PartitionId,
    pub key: Option<Key>,
    pub record_type: RecordType,
    pub value_type: ValueType,
    pub intent: Intent,
    pub rejection_type: Option<RejectionType>,
    pub rejection_reason: ByteString,
    pub payload: Bytes,
}

impl CommandResponse {
    pub fn is_rejection(&self) -> bool {
        self.record_type == RecordType::CommandRejection
    }
}

/// Delivers responses to requesters. Called after the results of a command were
/// committed. Delivery is best effort, a requester that went away is ignored.
pub trait ResponseSink: Send + Sync + 'static {
    fn send_response(&self, request: RequestMetadata, response: CommandResponse);
}

static_assertions::assert_obj_safe!(ResponseSink);

/// Drops every response. Used when nobody waits for answers, e.g. on replicas.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardingResponseSink;

impl ResponseSink for DiscardingResponseSink {
    fn send_response(&self, request: RequestMetadata, response: CommandResponse) {
        tracing::trace!(?request, "Discarding response {:?}/{}", response.value_type, response.intent);
    }
}
