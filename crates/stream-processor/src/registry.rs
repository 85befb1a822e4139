// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use keel_partition_store::PartitionStoreTransaction;
use keel_types::logs::{Intent, LogAppendEntry, LoggedEntry, ValueType};
use keel_types::Key;

use crate::error::{ProcessingError, RegistryError};
use crate::listener::LifecycleAware;
use crate::processing::ProcessingContext;

/// An event as seen by an [`EventApplier`], either freshly appended during processing or
/// read back from the log during replay.
#[derive(Debug, Clone, Copy)]
pub struct EventRecord<'a> {
    pub key: Option<Key>,
    pub value_type: ValueType,
    pub intent: Intent,
    pub payload: &'a Bytes,
}

impl<'a> From<&'a LoggedEntry> for EventRecord<'a> {
    fn from(entry: &'a LoggedEntry) -> Self {
        Self {
            key: entry.key,
            value_type: entry.value_type(),
            intent: entry.intent(),
            payload: &entry.payload,
        }
    }
}

impl<'a> From<&'a LogAppendEntry> for EventRecord<'a> {
    fn from(entry: &'a LogAppendEntry) -> Self {
        Self {
            key: entry.key,
            value_type: entry.metadata.value_type,
            intent: entry.metadata.intent,
            payload: &entry.payload,
        }
    }
}

/// Handles the commands of one `(ValueType, Intent)`. A processor only reads state, every
/// change is expressed as an event through [`ProcessingContext::append_event`].
pub trait CommandProcessor: Send + Sync + 'static {
    fn process(&self, ctx: &mut ProcessingContext<'_, '_>) -> Result<(), ProcessingError>;
}

static_assertions::assert_obj_safe!(CommandProcessor);

/// Applies the events of one `(ValueType, Intent)` to the state. Appliers run while
/// processing and while replaying, and must be deterministic.
pub trait EventApplier: Send + Sync + 'static {
    fn apply(
        &self,
        event: &EventRecord<'_>,
        txn: &mut PartitionStoreTransaction<'_>,
    ) -> Result<(), ProcessingError>;
}

static_assertions::assert_obj_safe!(EventApplier);

/// Command processors and event appliers of a partition, keyed by `(ValueType, Intent)`.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: HashMap<(ValueType, Intent), Arc<dyn CommandProcessor>>,
    appliers: HashMap<(ValueType, Intent), Arc<dyn EventApplier>>,
    lifecycle_aware: Vec<Arc<dyn LifecycleAware>>,
}

impl ProcessorRegistry {
    pub fn register_processor(
        &mut self,
        value_type: ValueType,
        intent: Intent,
        processor: impl CommandProcessor,
    ) -> Result<&mut Self, RegistryError> {
        self.register_shared_processor(value_type, intent, Arc::new(processor))
    }

    /// Registers a processor that is shared with other registrations.
    pub fn register_shared_processor(
        &mut self,
        value_type: ValueType,
        intent: Intent,
        processor: Arc<dyn CommandProcessor>,
    ) -> Result<&mut Self, RegistryError> {
        if self.processors.contains_key(&(value_type, intent)) {
            return Err(RegistryError::DuplicateProcessor { value_type, intent });
        }
        self.processors.insert((value_type, intent), processor);
        Ok(self)
    }

    pub fn register_applier(
        &mut self,
        value_type: ValueType,
        intent: Intent,
        applier: impl EventApplier,
    ) -> Result<&mut Self, RegistryError> {
        self.register_shared_applier(value_type, intent, Arc::new(applier))
    }

    /// Registers an applier that is shared with other registrations, e.g. one applier for
    /// all intents of a value type.
    pub fn register_shared_applier(
        &mut self,
        value_type: ValueType,
        intent: Intent,
        applier: Arc<dyn EventApplier>,
    ) -> Result<&mut Self, RegistryError> {
        if self.appliers.contains_key(&(value_type, intent)) {
            return Err(RegistryError::DuplicateApplier { value_type, intent });
        }
        self.appliers.insert((value_type, intent), applier);
        Ok(self)
    }

    pub fn register_lifecycle_aware(&mut self, component: Arc<dyn LifecycleAware>) -> &mut Self {
        self.lifecycle_aware.push(component);
        self
    }

    pub fn processor(&self, value_type: ValueType, intent: Intent) -> Option<&dyn CommandProcessor> {
        self.processors
            .get(&(value_type, intent))
            .map(|processor| processor.as_ref())
    }

    pub fn applier(&self, value_type: ValueType, intent: Intent) -> Option<&dyn EventApplier> {
        self.appliers
            .get(&(value_type, intent))
            .map(|applier| applier.as_ref())
    }

    /// Applies `event` with its registered applier.
    pub fn apply(
        &self,
        event: &EventRecord<'_>,
        txn: &mut PartitionStoreTransaction<'_>,
    ) -> Result<(), ProcessingError> {
        let applier = self
            .applier(event.value_type, event.intent)
            .ok_or(ProcessingError::NoApplier {
                value_type: event.value_type,
                intent: event.intent,
            })?;
        applier.apply(event, txn)
    }

    pub(crate) fn lifecycle_aware(&self) -> &[Arc<dyn LifecycleAware>] {
        &self.lifecycle_aware
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut processors: Vec<_> = self.processors.keys().collect();
        processors.sort();
        let mut appliers: Vec<_> = self.appliers.keys().collect();
        appliers.sort();
        f.debug_struct("ProcessorRegistry")
            .field("processors", &processors)
            .field("appliers", &appliers)
            .field("lifecycle_aware", &self.lifecycle_aware.len())
            .finish()
    }
}
