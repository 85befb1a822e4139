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

use keel_types::logs::{LoggedEntry, Position};
use keel_types::PartitionId;

/// Observes the progress of a stream processor. Callbacks run on the processor's turn and
/// must not block.
pub trait StreamProcessorListener: Send + Sync + 'static {
    /// A command was processed and its results were committed.
    fn on_processed(&self, _entry: &LoggedEntry) {}

    /// An entry was read but produced no results, e.g. an event or a command whose
    /// processor did nothing.
    fn on_skipped(&self, _entry: &LoggedEntry) {}

    /// Replay reached the log tail, `last_processed` is the position processing continues
    /// after.
    fn on_recovered(&self, _last_processed: Position) {}
}

static_assertions::assert_obj_safe!(StreamProcessorListener);

/// Fans out every notification to all registered listeners in registration order.
#[derive(Clone, Default)]
pub struct ListenerRelay {
    listeners: Vec<Arc<dyn StreamProcessorListener>>,
}

impl ListenerRelay {
    pub fn add(&mut self, listener: Arc<dyn StreamProcessorListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl StreamProcessorListener for ListenerRelay {
    fn on_processed(&self, entry: &LoggedEntry) {
        for listener in &self.listeners {
            listener.on_processed(entry);
        }
    }

    fn on_skipped(&self, entry: &LoggedEntry) {
        for listener in &self.listeners {
            listener.on_skipped(entry);
        }
    }

    fn on_recovered(&self, last_processed: Position) {
        for listener in &self.listeners {
            listener.on_recovered(last_processed);
        }
    }
}

/// Hooks for components registered with a stream processor that need to follow its
/// lifecycle, e.g. to start or stop background work.
pub trait LifecycleAware: Send + Sync + 'static {
    fn on_recovered(&self, _partition_id: PartitionId) {}

    fn on_paused(&self) {}

    fn on_resumed(&self) {}

    fn on_close(&self) {}

    fn on_failed(&self) {}
}

static_assertions::assert_obj_safe!(LifecycleAware);
