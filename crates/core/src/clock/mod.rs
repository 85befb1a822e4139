// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.


//! Sources of wall-clock time. Record timestamps and redistribution deadlines read the
//! time through [`Clock`] so tests can control it.

mod controllable;
mod mock;
mod wall;

use std::sync::Arc;

pub use controllable::ControllableClock;
pub use mock::MockClock;
pub use wall::WallClock;

use keel_types::time::MillisSinceEpoch;

pub trait Clock: Send + Sync + 'static {
    /// Returns the current time as milliseconds since the unix epoch.
    fn now(&self) -> MillisSinceEpoch;
}

static_assertions::assert_obj_safe!(Clock);

pub type SharedClock = Arc<dyn Clock>;

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> MillisSinceEpoch {
        (**self).now()
    }
}
