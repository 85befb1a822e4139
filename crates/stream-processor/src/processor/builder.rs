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

use tokio::sync::watch;
use tracing::info;

use keel_core::{SharedClock, TaskCenter, TaskKind, WallClock};
use keel_log_stream::LogStream;
use keel_rocksdb::RocksDbManager;
use keel_types::config::Configuration;
use keel_types::PartitionId;

use super::actor::{StreamProcessor, StreamProcessorConfig};
use super::{StreamProcessorHandle, StreamProcessorPhase};
use crate::distribution::{
    register_distribution, CommandRedistributor, InterPartitionCommandSender,
    LocalPartitionRouter,
};
use crate::error::StreamProcessorError;
use crate::exporter::{Exporter, ExporterDirector};
use crate::listener::{ListenerRelay, StreamProcessorListener};
use crate::registry::ProcessorRegistry;
use crate::response::{DiscardingResponseSink, ResponseSink};

/// Assembles and starts the stream processor of one partition.
///
/// Unless configured otherwise the processor uses the wall clock, discards responses and
/// sends distributed commands through a [`LocalPartitionRouter`] that only knows the
/// processor's own partition.
pub struct StreamProcessorBuilder {
    partition_id: PartitionId,
    config: Configuration,
    manager: RocksDbManager,
    log_stream: LogStream,
    clock: SharedClock,
    registry: ProcessorRegistry,
    listeners: ListenerRelay,
    response_sink: Arc<dyn ResponseSink>,
    command_sender: Option<Arc<dyn InterPartitionCommandSender>>,
    exporters: Vec<Box<dyn Exporter>>,
}

impl StreamProcessorBuilder {
    pub fn new(
        partition_id: PartitionId,
        config: &Configuration,
        manager: RocksDbManager,
        log_stream: LogStream,
    ) -> Self {
        Self {
            partition_id,
            config: config.clone(),
            manager,
            log_stream,
            clock: Arc::new(WallClock),
            registry: ProcessorRegistry::default(),
            listeners: ListenerRelay::default(),
            response_sink: Arc::new(DiscardingResponseSink),
            command_sender: None,
            exporters: Vec::new(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Processors and appliers of the partition. The command distribution ones are added
    /// on start.
    pub fn with_registry(mut self, registry: ProcessorRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry_mut(&mut self) -> &mut ProcessorRegistry {
        &mut self.registry
    }

    pub fn add_listener(mut self, listener: Arc<dyn StreamProcessorListener>) -> Self {
        self.listeners.add(listener);
        self
    }

    pub fn with_response_sink(mut self, response_sink: Arc<dyn ResponseSink>) -> Self {
        self.response_sink = response_sink;
        self
    }

    pub fn with_command_sender(mut self, command_sender: Arc<dyn InterPartitionCommandSender>) -> Self {
        self.command_sender = Some(command_sender);
        self
    }

    pub fn add_exporter(mut self, exporter: Box<dyn Exporter>) -> Self {
        self.exporters.push(exporter);
        self
    }

    /// Spawns the processor. It initializes and replays in the background, use
    /// [`StreamProcessorHandle::wait_for_phase`] to wait for it to process.
    pub fn start(self, task_center: &TaskCenter) -> Result<StreamProcessorHandle, StreamProcessorError> {
        let Self {
            partition_id,
            config,
            manager,
            log_stream,
            clock,
            mut registry,
            listeners,
            response_sink,
            command_sender,
            exporters,
        } = self;

        register_distribution(&mut registry)?;

        let command_sender: Arc<dyn InterPartitionCommandSender> = match command_sender {
            Some(command_sender) => command_sender,
            None => {
                let router = LocalPartitionRouter::new(task_center.clone());
                router.register(log_stream.new_writer());
                router
            }
        };

        let exporter = if exporters.is_empty() {
            None
        } else {
            Some(ExporterDirector::start(
                task_center,
                &log_stream,
                None,
                exporters,
                config.processor.exporter_retry_policy.clone(),
            )?)
        };
        let exported = exporter.as_ref().map(|exporter| exporter.watch_exported());

        let (phase_tx, phase_rx) = watch::channel(StreamProcessorPhase::Initializing);
        let processor = StreamProcessor::new(
            StreamProcessorConfig {
                partition_id,
                options: config.processor.clone(),
                redistribution_interval: *config.distribution.redistribution_interval,
                runtime_dir: config.partition_runtime_dir(partition_id),
                snapshot_dir: config.partition_snapshot_dir(partition_id),
                manager,
                log_stream,
                clock: clock.clone(),
                registry,
                listeners,
                response_sink,
                command_sender,
                redistributor: CommandRedistributor::new(
                    partition_id,
                    config.distribution.retry_policy.clone(),
                    clock,
                ),
                exporter,
            },
            phase_tx,
        );

        let (actor, _task_id) = task_center.spawn_actor(
            TaskKind::StreamProcessor,
            Some(partition_id),
            config.processor.internal_queue_length.get(),
            processor,
        )?;
        info!(%partition_id, "Started stream processor");

        Ok(StreamProcessorHandle {
            partition_id,
            actor,
            phase: phase_rx,
            exported,
        })
    }
}
