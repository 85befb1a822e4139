// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.


use std::mem::size_of;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use keel_types::logs::Position;

use crate::error::StorageError;

const BLOCK_KEY_PREFIX: u8 = b'b';

/// Blocks are keyed by their lowest position, big-endian so that key order is position
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockKey {
    pub lowest: Position,
}

impl BlockKey {
    pub fn new(lowest: Position) -> Self {
        Self { lowest }
    }

    pub const fn serialized_size() -> usize {
        size_of::<u8>() + size_of::<u64>()
    }

    /// First key of the block key space.
    pub fn lower_bound() -> Bytes {
        Bytes::from_static(&[BLOCK_KEY_PREFIX])
    }

    /// Exclusive upper bound of the block key space.
    pub fn upper_bound() -> Bytes {
        Bytes::from_static(&[BLOCK_KEY_PREFIX + 1])
    }

    pub fn to_bytes(self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::serialized_size());
        buf.put_u8(BLOCK_KEY_PREFIX);
        // positions are never negative
        buf.put_u64(u64::try_from(self.lowest.as_i64()).unwrap_or_default());
        buf.freeze()
    }

    pub fn from_slice(mut data: &[u8]) -> Result<Self, StorageError> {
        if data.len() != Self::serialized_size() || data.get_u8() != BLOCK_KEY_PREFIX {
            return Err(StorageError::CorruptedBlock(format!(
                "unexpected key of {} bytes",
                data.len()
            )));
        }
        let lowest = i64::try_from(data.get_u64())
            .map_err(|_| StorageError::CorruptedBlock("position out of range".to_owned()))?;
        Ok(Self {
            lowest: Position::new(lowest),
        })
    }
}

/// The stored value is the highest position of the block followed by the block itself.
pub fn encode_block_value(highest: Position, block: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(size_of::<i64>() + block.len());
    buf.put_i64_le(highest.as_i64());
    buf.put_slice(block);
    buf.freeze()
}

pub fn decode_block_value(value: &[u8]) -> Result<(Position, Bytes), StorageError> {
    if value.len() < size_of::<i64>() {
        return Err(StorageError::CorruptedBlock(format!(
            "block value of {} bytes is too short",
            value.len()
        )));
    }
    let mut data = value;
    let highest = Position::new(data.get_i64_le());
    Ok((highest, Bytes::copy_from_slice(data)))
}
