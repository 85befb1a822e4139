// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.


use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::info;

use keel_types::time::MillisSinceEpoch;

use super::{Clock, SharedClock, WallClock};

#[derive(Debug, Default, Clone, Copy)]
enum Modification {
    #[default]
    None,
    Pinned(MillisSinceEpoch),
    Offset(Duration),
}

/// A clock that follows an underlying clock until it is pinned to an instant or offset by
/// a duration. Used to drive time-dependent behaviour deterministically (record timestamps,
/// redistribution deadlines) in tests and operational tooling.
#[derive(Clone)]
pub struct ControllableClock {
    source: SharedClock,
    modification: Arc<RwLock<Modification>>,
}

impl Default for ControllableClock {
    fn default() -> Self {
        Self::new(Arc::new(WallClock))
    }
}

impl ControllableClock {
    pub fn new(source: SharedClock) -> Self {
        Self {
            source,
            modification: Arc::default(),
        }
    }

    /// Freezes the clock at `instant`.
    pub fn pin_at(&self, instant: MillisSinceEpoch) {
        info!(%instant, "Pinning clock");
        *self.modification.write() = Modification::Pinned(instant);
    }

    /// Freezes the clock at its current reading.
    pub fn pin_current_time(&self) -> MillisSinceEpoch {
        let now = self.now();
        self.pin_at(now);
        now
    }

    /// Lets the clock follow its source again, shifted by `offset`.
    pub fn offset_by(&self, offset: Duration) {
        info!(?offset, "Offsetting clock");
        *self.modification.write() = Modification::Offset(offset);
    }

    /// Moves the clock forward by `duration`, keeping it pinned if it is pinned.
    pub fn advance(&self, duration: Duration) {
        let mut modification = self.modification.write();
        *modification = match *modification {
            Modification::None => Modification::Offset(duration),
            Modification::Pinned(instant) => Modification::Pinned(instant.saturating_add(duration)),
            Modification::Offset(offset) => Modification::Offset(offset.saturating_add(duration)),
        };
    }

    /// Removes any pin or offset.
    pub fn reset(&self) {
        info!("Resetting clock");
        *self.modification.write() = Modification::None;
    }

    pub fn is_modified(&self) -> bool {
        !matches!(*self.modification.read(), Modification::None)
    }
}

impl Clock for ControllableClock {
    fn now(&self) -> MillisSinceEpoch {
        match *self.modification.read() {
            Modification::None => self.source.now(),
            Modification::Pinned(instant) => instant,
            Modification::Offset(offset) => self.source.now().saturating_add(offset),
        }
    }
}
