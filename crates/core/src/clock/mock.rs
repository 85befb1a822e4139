// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.


use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use keel_types::time::MillisSinceEpoch;

use super::{Clock, WallClock};

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct MockClock {
    storage: Arc<AtomicU64>,
}

impl Default for MockClock {
    fn default() -> Self {
        Self::with_timestamp(WallClock.now())
    }
}

impl MockClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timestamp(timestamp: MillisSinceEpoch) -> Self {
        Self {
            storage: Arc::new(AtomicU64::new(timestamp.as_u64())),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.advance_ms(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
    }

    pub fn advance_ms(&self, ms: u64) {
        self.storage.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn refresh_from_wall_clock(&self) {
        self.set(WallClock.now());
    }

    pub fn set(&self, timestamp: MillisSinceEpoch) {
        self.storage.store(timestamp.as_u64(), Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now(&self) -> MillisSinceEpoch {
        MillisSinceEpoch::new(self.storage.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_time() {
        let clock = MockClock::with_timestamp(MillisSinceEpoch::new(1_000));
        let other = clock.clone();
        other.advance(Duration::from_millis(250));
        assert_eq!(MillisSinceEpoch::new(1_250), clock.now());
    }
}
