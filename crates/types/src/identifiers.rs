// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a partition. Every partition owns exactly one log stream and one
/// partition store.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    derive_more::Deref,
    derive_more::From,
    derive_more::Into,
    derive_more::Display,
    derive_more::Debug,
    derive_more::FromStr,
    Serialize,
    Deserialize,
)]
#[repr(transparent)]
#[serde(transparent)]
#[debug("{}", _0)]
pub struct PartitionId(u16);

impl From<PartitionId> for u32 {
    fn from(value: PartitionId) -> Self {
        u32::from(value.0)
    }
}

impl From<PartitionId> for u64 {
    fn from(value: PartitionId) -> Self {
        u64::from(value.0)
    }
}

impl PartitionId {
    pub const MIN: Self = Self(u16::MIN);
    /// Partition ids are encoded in the upper bits of every generated [`Key`], which
    /// leaves room for 4096 partitions.
    pub const MAX: Self = Self((1 << Key::PARTITION_BITS) - 1);

    /// It's your responsibility to ensure the value is within the valid range.
    pub const fn new_unchecked(v: u16) -> Self {
        Self(v)
    }

    pub fn new(v: u16) -> Option<Self> {
        (v <= Self::MAX.0).then_some(Self(v))
    }

    #[inline]
    pub fn next(self) -> Self {
        Self(std::cmp::min(Self::MAX.0, self.0.saturating_add(1)))
    }
}

/// A process wide unique key of a business entity.
///
/// Keys generated by a partition carry the partition id in their upper
/// [`Key::PARTITION_BITS`] bits (below the sign bit), followed by a
/// [`Key::COUNTER_BITS`] wide counter. This makes it possible to route any
/// generated key back to its owning partition, which is what command distribution
/// uses to send acknowledgements.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    derive_more::From,
    derive_more::Into,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct Key(i64);

impl Key {
    pub const PARTITION_BITS: u32 = 12;
    pub const COUNTER_BITS: u32 = 51;
    const COUNTER_MASK: i64 = (1 << Self::COUNTER_BITS) - 1;

    /// Encodes the partition id and a counter into a key.
    pub const fn new(partition_id: PartitionId, counter: u64) -> Self {
        let partition = (partition_id.0 as i64) & ((1 << Self::PARTITION_BITS) - 1);
        Key((partition << Self::COUNTER_BITS) | (counter as i64 & Self::COUNTER_MASK))
    }

    pub const fn from_raw(raw: i64) -> Self {
        Key(raw)
    }

    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// The partition that generated this key.
    pub const fn partition_id(self) -> PartitionId {
        PartitionId((self.0 >> Self::COUNTER_BITS) as u16)
    }

    pub const fn counter(self) -> u64 {
        (self.0 & Self::COUNTER_MASK) as u64
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({}/{})", self.partition_id(), self.counter())
    }
}
