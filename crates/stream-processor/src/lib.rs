// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The stream processor of a partition: replays the log stream into the partition store,
//! then processes every new command with the registered [`CommandProcessor`]s, writing
//! follow-up entries to the log and state changes to the store in lockstep.

pub mod distribution;
mod error;
pub mod exporter;
mod key_generator;
mod listener;
pub mod metric_definitions;
mod processing;
mod processor;
mod registry;
mod response;

pub use error::{ProcessingError, RegistryError, Rejection, StreamProcessorError};
pub use exporter::{Exporter, ExporterDirector, ExporterDirectorHandle};
pub use key_generator::KeyGenerator;
pub use listener::{LifecycleAware, ListenerRelay, StreamProcessorListener};
pub use processing::{PostCommitTask, ProcessingContext, ProcessingResult};
pub use processor::{
    ProcessorStatus, StreamProcessorBuilder, StreamProcessorHandle, StreamProcessorPhase,
};
pub use registry::{CommandProcessor, EventApplier, EventRecord, ProcessorRegistry};
pub use response::{CommandResponse, DiscardingResponseSink, ResponseSink};
