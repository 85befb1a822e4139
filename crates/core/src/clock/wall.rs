// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.


use keel_types::time::MillisSinceEpoch;

use super::Clock;

/// Production implementation of [`Clock`] backed by system time.
#[derive(Debug, Default, Copy, Clone)]
pub struct WallClock;

impl Clock for WallClock {
    #[inline]
    fn now(&self) -> MillisSinceEpoch {
        MillisSinceEpoch::now()
    }
}
