// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Log entries and their binary layout.
//!
//! ```text
//! entry  := position:i64 source_position:i64 key:i64 timestamp:i64
//!           header reason_len:u16 reason payload_len:u32 payload
//! header := protocol_version:u16 record_type:u8 value_type:u8 intent:u16
//!           rejection_type:u8 flags:u8 requester_stream_id:i32 request_id:i64
//!           reserved:u32
//! ```
//!
//! All integers are little-endian. Absent keys, source positions and request
//! metadata are encoded as `-1`.

use std::fmt;
use std::mem;

use bytes::{Buf, BufMut, Bytes};
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

use super::Position;
use crate::identifiers::Key;
use crate::time::MillisSinceEpoch;

pub const CURRENT_PROTOCOL_VERSION: u16 = 1;

const FLAG_DISTRIBUTED: u8 = 0b0000_0001;

#[derive(Debug, thiserror::Error)]
pub enum LogEntryDecodeError {
    #[error("insufficient data: expected {expected} bytes, but only {remaining} remain")]
    InsufficientData { expected: usize, remaining: usize },
    #[error("unsupported protocol version {0}")]
    UnsupportedProtocolVersion(u16),
    #[error("unknown record type {0}")]
    UnknownRecordType(u8),
    #[error("unknown value type {0}")]
    UnknownValueType(u8),
    #[error("unknown rejection type {0}")]
    UnknownRejectionType(u8),
    #[error("rejection reason is not valid utf-8")]
    InvalidRejectionReason,
}

#[derive(Debug, thiserror::Error)]
pub enum LogEntryEncodeError {
    #[error("rejection reason of {0} bytes exceeds the maximum of {max}", max = u16::MAX)]
    RejectionReasonTooLarge(usize),
    #[error("payload of {0} bytes exceeds the maximum of {max}", max = u32::MAX)]
    PayloadTooLarge(usize),
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::FromRepr,
    strum::IntoStaticStr,
    strum::Display,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordType {
    Command = 0,
    Event = 1,
    CommandRejection = 2,
}

/// Schema tag of the payload. The processing core only interprets
/// [`ValueType::CommandDistribution`], every other type belongs to the layers
/// that register processors.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::FromRepr,
    strum::IntoStaticStr,
    strum::Display,
    strum::EnumIter,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    Job = 0,
    Deployment = 1,
    Process = 2,
    ProcessInstance = 3,
    ProcessInstanceCreation = 4,
    Incident = 5,
    Message = 6,
    MessageSubscription = 7,
    Timer = 8,
    Variable = 9,
    Signal = 10,
    Decision = 11,
    Resource = 12,
    Error = 13,
    CommandDistribution = 14,
    Checkpoint = 15,
}

/// The verb of a record. Intent codes are scoped by [`ValueType`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    derive_more::From,
    derive_more::Into,
    derive_more::Display,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct Intent(u16);

impl Intent {
    pub const fn new(code: u16) -> Self {
        Intent(code)
    }

    pub const fn code(self) -> u16 {
        self.0
    }
}

/// Business level reason of a rejection.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::FromRepr,
    strum::IntoStaticStr,
    strum::Display,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionType {
    InvalidArgument = 1,
    NotFound = 2,
    AlreadyExists = 3,
    InvalidState = 4,
    ProcessingError = 5,
    ExceededBatchRecordSize = 6,
    ResourceExhausted = 7,
    Unauthorized = 8,
}

/// Identifies who is waiting for a response to a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub requester_stream_id: i32,
    pub request_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub protocol_version: u16,
    pub record_type: RecordType,
    pub value_type: ValueType,
    pub intent: Intent,
    pub rejection_type: Option<RejectionType>,
    pub rejection_reason: ByteString,
    pub request: Option<RequestMetadata>,
    /// Set on commands delivered to this partition by command distribution.
    pub distributed: bool,
}

impl RecordMetadata {
    pub fn new(record_type: RecordType, value_type: ValueType, intent: Intent) -> Self {
        Self {
            protocol_version: CURRENT_PROTOCOL_VERSION,
            record_type,
            value_type,
            intent,
            rejection_type: None,
            rejection_reason: ByteString::default(),
            request: None,
            distributed: false,
        }
    }

    pub fn command(value_type: ValueType, intent: Intent) -> Self {
        Self::new(RecordType::Command, value_type, intent)
    }

    pub fn event(value_type: ValueType, intent: Intent) -> Self {
        Self::new(RecordType::Event, value_type, intent)
    }

    pub fn rejection(
        value_type: ValueType,
        intent: Intent,
        rejection_type: RejectionType,
        reason: impl Into<ByteString>,
    ) -> Self {
        Self {
            rejection_type: Some(rejection_type),
            rejection_reason: reason.into(),
            ..Self::new(RecordType::CommandRejection, value_type, intent)
        }
    }

    pub fn with_request(mut self, request: RequestMetadata) -> Self {
        self.request = Some(request);
        self
    }

    pub fn distributed(mut self) -> Self {
        self.distributed = true;
        self
    }

    pub const ENCODED_LEN: usize = 24;

    fn encode<B: BufMut>(&self, buf: &mut B) {
        let flags = if self.distributed { FLAG_DISTRIBUTED } else { 0 };
        let (requester_stream_id, request_id) = self
            .request
            .map(|r| (r.requester_stream_id, r.request_id))
            .unwrap_or((-1, -1));

        buf.put_u16_le(self.protocol_version);
        buf.put_u8(self.record_type as u8);
        buf.put_u8(self.value_type as u8);
        buf.put_u16_le(self.intent.code());
        buf.put_u8(self.rejection_type.map(|r| r as u8).unwrap_or(0));
        buf.put_u8(flags);
        buf.put_i32_le(requester_stream_id);
        buf.put_i64_le(request_id);
        // reserved
        buf.put_u32_le(0);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, LogEntryDecodeError> {
        ensure_remaining(buf, Self::ENCODED_LEN)?;
        let protocol_version = buf.get_u16_le();
        if protocol_version == 0 || protocol_version > CURRENT_PROTOCOL_VERSION {
            return Err(LogEntryDecodeError::UnsupportedProtocolVersion(
                protocol_version,
            ));
        }
        let record_type = buf.get_u8();
        let record_type = RecordType::from_repr(record_type)
            .ok_or(LogEntryDecodeError::UnknownRecordType(record_type))?;
        let value_type = buf.get_u8();
        let value_type = ValueType::from_repr(value_type)
            .ok_or(LogEntryDecodeError::UnknownValueType(value_type))?;
        let intent = Intent::new(buf.get_u16_le());
        let rejection_type = match buf.get_u8() {
            0 => None,
            other => Some(
                RejectionType::from_repr(other)
                    .ok_or(LogEntryDecodeError::UnknownRejectionType(other))?,
            ),
        };
        let flags = buf.get_u8();
        let requester_stream_id = buf.get_i32_le();
        let request_id = buf.get_i64_le();
        let _reserved = buf.get_u32_le();

        let request = (requester_stream_id >= 0 && request_id >= 0).then_some(RequestMetadata {
            requester_stream_id,
            request_id,
        });

        Ok(Self {
            protocol_version,
            record_type,
            value_type,
            intent,
            rejection_type,
            rejection_reason: ByteString::default(),
            request,
            distributed: flags & FLAG_DISTRIBUTED != 0,
        })
    }
}

impl fmt::Display for RecordMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{}",
            self.record_type, self.value_type, self.intent
        )?;
        if let Some(rejection_type) = self.rejection_type {
            write!(f, " ({rejection_type}: {})", self.rejection_reason)?;
        }
        Ok(())
    }
}

/// An entry handed to a log stream writer. Position and timestamp are assigned by
/// the log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogAppendEntry {
    pub key: Option<Key>,
    pub metadata: RecordMetadata,
    pub payload: Bytes,
}

impl LogAppendEntry {
    pub fn new(key: Option<Key>, metadata: RecordMetadata, payload: impl Into<Bytes>) -> Self {
        Self {
            key,
            metadata,
            payload: payload.into(),
        }
    }

    pub fn command(
        key: Option<Key>,
        value_type: ValueType,
        intent: Intent,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self::new(key, RecordMetadata::command(value_type, intent), payload)
    }

    pub fn event(key: Key, value_type: ValueType, intent: Intent, payload: impl Into<Bytes>) -> Self {
        Self::new(Some(key), RecordMetadata::event(value_type, intent), payload)
    }

    /// Number of bytes this entry occupies once positioned and encoded.
    pub fn encoded_len(&self) -> usize {
        LoggedEntry::FIXED_LEN + self.metadata.rejection_reason.len() + self.payload.len()
    }
}

/// An entry as it was written to, and is read back from, the log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedEntry {
    pub position: Position,
    pub source_position: Option<Position>,
    pub key: Option<Key>,
    pub timestamp: MillisSinceEpoch,
    pub metadata: RecordMetadata,
    pub payload: Bytes,
}

impl LoggedEntry {
    /// Size of all fixed width fields of an encoded entry.
    pub const FIXED_LEN: usize = 4 * mem::size_of::<i64>()
        + RecordMetadata::ENCODED_LEN
        + mem::size_of::<u16>()
        + mem::size_of::<u32>();

    pub fn from_append_entry(
        entry: LogAppendEntry,
        position: Position,
        source_position: Option<Position>,
        timestamp: MillisSinceEpoch,
    ) -> Self {
        Self {
            position,
            source_position,
            key: entry.key,
            timestamp,
            metadata: entry.metadata,
            payload: entry.payload,
        }
    }

    pub fn record_type(&self) -> RecordType {
        self.metadata.record_type
    }

    pub fn value_type(&self) -> ValueType {
        self.metadata.value_type
    }

    pub fn intent(&self) -> Intent {
        self.metadata.intent
    }

    pub fn is_command(&self) -> bool {
        self.metadata.record_type == RecordType::Command
    }

    pub fn is_event(&self) -> bool {
        self.metadata.record_type == RecordType::Event
    }

    pub fn is_rejection(&self) -> bool {
        self.metadata.record_type == RecordType::CommandRejection
    }

    pub fn encoded_len(&self) -> usize {
        Self::FIXED_LEN + self.metadata.rejection_reason.len() + self.payload.len()
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), LogEntryEncodeError> {
        let reason_len = u16::try_from(self.metadata.rejection_reason.len()).map_err(|_| {
            LogEntryEncodeError::RejectionReasonTooLarge(self.metadata.rejection_reason.len())
        })?;
        let payload_len = u32::try_from(self.payload.len())
            .map_err(|_| LogEntryEncodeError::PayloadTooLarge(self.payload.len()))?;

        buf.put_i64_le(self.position.as_i64());
        buf.put_i64_le(Position::to_wire(self.source_position));
        buf.put_i64_le(self.key.map(Key::as_i64).unwrap_or(-1));
        buf.put_i64_le(self.timestamp.as_i64());
        self.metadata.encode(buf);
        buf.put_u16_le(reason_len);
        buf.put_slice(self.metadata.rejection_reason.as_bytes());
        buf.put_u32_le(payload_len);
        buf.put_slice(&self.payload);
        Ok(())
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, LogEntryDecodeError> {
        ensure_remaining(buf, 4 * mem::size_of::<i64>())?;
        let position = Position::new(buf.get_i64_le());
        let source_position = Position::from_wire(buf.get_i64_le());
        let key = match buf.get_i64_le() {
            raw if raw < 0 => None,
            raw => Some(Key::from_raw(raw)),
        };
        let timestamp = MillisSinceEpoch::from_i64(buf.get_i64_le());
        let mut metadata = RecordMetadata::decode(buf)?;

        ensure_remaining(buf, mem::size_of::<u16>())?;
        let reason_len = usize::from(buf.get_u16_le());
        ensure_remaining(buf, reason_len)?;
        metadata.rejection_reason = ByteString::try_from(buf.copy_to_bytes(reason_len))
            .map_err(|_| LogEntryDecodeError::InvalidRejectionReason)?;

        ensure_remaining(buf, mem::size_of::<u32>())?;
        let payload_len = buf.get_u32_le() as usize;
        ensure_remaining(buf, payload_len)?;
        let payload = buf.copy_to_bytes(payload_len);

        Ok(Self {
            position,
            source_position,
            key,
            timestamp,
            metadata,
            payload,
        })
    }
}

impl fmt::Display for LoggedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.position, self.metadata)?;
        if let Some(key) = self.key {
            write!(f, " key={key}")?;
        }
        Ok(())
    }
}

fn ensure_remaining<B: Buf>(buf: &B, expected: usize) -> Result<(), LogEntryDecodeError> {
    if buf.remaining() < expected {
        return Err(LogEntryDecodeError::InsufficientData {
            expected,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}
