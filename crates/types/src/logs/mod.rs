// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use serde::{Deserialize, Serialize};

mod record;

pub use record::*;

/// Position of an entry in the log stream of a partition. Positions are assigned by
/// the log stream when appending and are strictly increasing without gaps.
#[derive(
    Debug,
    Clone,
    Copy,
    Eq,
    PartialEq,
    Hash,
    Ord,
    PartialOrd,
    derive_more::Into,
    derive_more::From,
    derive_more::Display,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct Position(i64);

impl Position {
    pub const fn new(position: i64) -> Self {
        Position(position)
    }

    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// Decodes a position from its wire representation, where any value below
    /// [`Position::OLDEST`] means "no position".
    pub fn from_wire(value: i64) -> Option<Self> {
        (value >= Self::OLDEST.0).then_some(Position(value))
    }

    /// Wire representation of an optional position, `-1` for `None`.
    pub fn to_wire(position: Option<Position>) -> i64 {
        position.map(|p| p.0).unwrap_or(-1)
    }

    /// Returns the position that lies `count` entries after this one.
    pub fn advance_by(self, count: u64) -> Self {
        Position(self.0.saturating_add(i64::try_from(count).unwrap_or(i64::MAX)))
    }
}

impl SequenceNumber for Position {
    /// The maximum possible position, useful when seeking to the tail.
    const MAX: Self = Position(i64::MAX);
    /// 0 is not a valid position. It stands for "nothing was written/processed yet".
    const INVALID: Self = Position(0);
    /// The first position assigned by a log stream.
    const OLDEST: Self = Position(1);

    fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    fn prev(self) -> Self {
        Self(self.0.saturating_sub(1).max(0))
    }
}

pub trait SequenceNumber
where
    Self: Copy + std::fmt::Debug + Sized + Eq + PartialEq + Ord + PartialOrd,
{
    /// The maximum possible sequence number, this is useful when creating a read stream
    /// with an open ended tail.
    const MAX: Self;
    /// Not a valid sequence number. This sequence number represents an invalid position
    /// in the log, or that nothing has been written yet.
    const INVALID: Self;

    /// Guaranteed to be less than or equal to the oldest possible sequence
    /// number in a log. This is useful when seeking to the head of a log.
    const OLDEST: Self;

    fn next(self) -> Self;
    fn prev(self) -> Self;
}
