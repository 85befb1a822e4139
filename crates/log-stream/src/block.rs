// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.


//! A block is the unit of append: one or more consecutive entries, each prefixed with
//! its encoded length.
//!
//! ```text
//! block := (entry_len:u32 entry)+
//! ```

use std::mem;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use keel_types::logs::{LogAppendEntry, LogEntryDecodeError, LogEntryEncodeError, LoggedEntry};

const LENGTH_PREFIX: usize = mem::size_of::<u32>();

/// Size of the block that would hold `entries` once positioned.
pub fn block_len<'a>(entries: impl IntoIterator<Item = &'a LogAppendEntry>) -> usize {
    entries
        .into_iter()
        .map(|e| LENGTH_PREFIX + e.encoded_len())
        .sum()
}

/// Size of a block holding `count` entries whose encoded entries add up to `entries_len`.
/// The largest entry a block of `max_block_size` bytes can carry alone.
pub fn max_entry_len(max_block_size: usize) -> usize {
    max_block_size.saturating_sub(LENGTH_PREFIX)
}

pub fn block_len_of(count: usize, entries_len: usize) -> usize {
    count * LENGTH_PREFIX + entries_len
}

pub fn encode_block(entries: &[LoggedEntry], buf: &mut BytesMut) -> Result<(), LogEntryEncodeError> {
    buf.reserve(entries.iter().map(|e| LENGTH_PREFIX + e.encoded_len()).sum());
    for entry in entries {
        let len = entry.encoded_len();
        let len = u32::try_from(len).map_err(|_| LogEntryEncodeError::PayloadTooLarge(len))?;
        buf.put_u32_le(len);
        entry.encode(buf)?;
    }
    Ok(())
}

/// Iterates over the entries of an encoded block.
pub struct BlockEntries {
    data: Bytes,
}

impl BlockEntries {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }
}

impl Iterator for BlockEntries {
    type Item = Result<LoggedEntry, LogEntryDecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.data.has_remaining() {
            return None;
        }
        if self.data.remaining() < LENGTH_PREFIX {
            let remaining = self.data.remaining();
            self.data.clear();
            return Some(Err(LogEntryDecodeError::InsufficientData {
                expected: LENGTH_PREFIX,
                remaining,
            }));
        }
        let len = self.data.get_u32_le() as usize;
        if self.data.remaining() < len {
            let remaining = self.data.remaining();
            self.data.clear();
            return Some(Err(LogEntryDecodeError::InsufficientData {
                expected: len,
                remaining,
            }));
        }
        let mut entry = self.data.split_to(len);
        Some(LoggedEntry::decode(&mut entry))
    }
}

#[cfg(test)]
mod tests {
    use keel_types::logs::{Intent, Position, ValueType};
    use keel_types::time::MillisSinceEpoch;

    use super::*;

    fn entry(position: i64, payload: &'static [u8]) -> LoggedEntry {
        LoggedEntry::from_append_entry(
            LogAppendEntry::command(None, ValueType::Job, Intent::new(1), payload),
            Position::new(position),
            None,
            MillisSinceEpoch::new(1),
        )
    }

    #[test]
    fn block_holds_entries_in_order() {
        let entries = vec![entry(4, b"a"), entry(5, b"bc"), entry(6, b"")];
        let mut buf = BytesMut::new();
        encode_block(&entries, &mut buf).unwrap();
        assert_eq!(
            block_len_of(3, entries.iter().map(LoggedEntry::encoded_len).sum()),
            buf.len()
        );

        let decoded: Vec<_> = BlockEntries::new(buf.freeze())
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(entries, decoded);
    }

    #[test]
    fn truncated_block_yields_error_once() {
        let mut buf = BytesMut::new();
        encode_block(&[entry(1, b"payload")], &mut buf).unwrap();
        buf.truncate(buf.len() - 3);
        let mut iter = BlockEntries::new(buf.freeze());
        assert!(matches!(
            iter.next(),
            Some(Err(LogEntryDecodeError::InsufficientData { .. }))
        ));
        assert!(iter.next().is_none());
    }
}
