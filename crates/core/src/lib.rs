// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.


//! Task scheduling for keel: the [`TaskCenter`] that owns every background task, the
//! cooperative [`actor`] model built on it, and the [`clock`] abstraction.

pub mod actor;
pub mod clock;
mod error;
mod logging;
mod metric_definitions;
mod task_center;
mod task_center_types;

pub use actor::{Actor, ActorContext, ActorHandle, Reply, TimerId};
pub use clock::{Clock, ControllableClock, MockClock, SharedClock, WallClock};
pub use error::*;
pub use logging::{init_logging, LoggingError};
pub use task_center::*;
pub use task_center_types::*;
