// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use metrics::{counter, gauge, histogram};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use keel_core::{Actor, ActorContext, ActorHandle, Reply, SharedClock, ShutdownError, TimerId};
use keel_log_stream::{CommitListener, LogStream, LogStreamReader, LogStreamWriter, ReadError};
use keel_partition_store::distribution_table::ReadOnlyDistributionTable;
use keel_partition_store::fsm_table::{FsmTable, ReadOnlyFsmTable};
use keel_partition_store::migrations::run_migrations;
use keel_partition_store::snapshots::SnapshotStore;
use keel_partition_store::{create_db, PartitionStore, StorageError};
use keel_rocksdb::RocksDbManager;
use keel_types::config::StreamProcessorOptions;
use keel_types::logs::{LoggedEntry, Position, RejectionType, SequenceNumber};
use keel_types::PartitionId;

use crate::distribution::{
    acknowledge_entry, distributed_command_entry, CommandRedistributor,
    InterPartitionCommandSender,
};
use crate::error::{ProcessingError, Rejection, StreamProcessorError};
use crate::exporter::ExporterDirectorHandle;
use crate::key_generator::KeyGenerator;
use crate::listener::{ListenerRelay, StreamProcessorListener};
use crate::metric_definitions::*;
use crate::processing::{rejection_result, PostCommitTask, ProcessingContext, ProcessingResult};
use crate::processor::{ProcessorStatus, StreamProcessorPhase};
use crate::registry::{EventRecord, ProcessorRegistry};
use crate::response::ResponseSink;

type CommitFuture = BoxFuture<'static, Result<(), StorageError>>;

pub enum Message {
    ReplayNext,
    ProcessNext,
    /// The log stream committed new entries.
    NewCommits,
    SnapshotTick,
    RedistributionTick,
    Pause(Reply<Result<(), StreamProcessorError>>),
    Resume(Reply<Result<(), StreamProcessorError>>),
    Snapshot(Reply<Result<Option<Position>, StreamProcessorError>>),
    Status(Reply<ProcessorStatus>),
    Close(Reply<()>),
}

/// Wakes the stream processor when the log stream committed entries. At most one wake-up
/// is in the mailbox at a time.
struct WakeOnCommit {
    handle: ActorHandle<StreamProcessor>,
    pending: AtomicBool,
}

impl CommitListener for WakeOnCommit {
    fn on_commit(&self, _position: Position) {
        if !self.pending.swap(true, Ordering::AcqRel)
            && self.handle.try_submit(Message::NewCommits).is_err()
        {
            // the processor checks for new entries after every message it handles
            self.pending.store(false, Ordering::Release);
        }
    }
}

struct RuntimeState {
    store: PartitionStore,
    snapshots: SnapshotStore,
    reader: LogStreamReader,
    /// Position the recovered store reflected. Replay applies events of later commands only.
    replay_base: Option<Position>,
    last_processed: Option<Position>,
    last_snapshot: Option<Position>,
}

pub(super) struct StreamProcessorConfig {
    pub partition_id: PartitionId,
    pub options: StreamProcessorOptions,
    pub redistribution_interval: Duration,
    pub runtime_dir: PathBuf,
    pub snapshot_dir: PathBuf,
    pub manager: RocksDbManager,
    pub log_stream: LogStream,
    pub clock: SharedClock,
    pub registry: ProcessorRegistry,
    pub listeners: ListenerRelay,
    pub response_sink: Arc<dyn ResponseSink>,
    pub command_sender: Arc<dyn InterPartitionCommandSender>,
    pub redistributor: CommandRedistributor,
    pub exporter: Option<ExporterDirectorHandle>,
}

/// Processes the log stream of one partition. Owns the partition store; every state change
/// happens on the actor's own turn.
pub struct StreamProcessor {
    partition_id: PartitionId,
    options: StreamProcessorOptions,
    redistribution_interval: Duration,
    runtime_dir: PathBuf,
    snapshot_dir: PathBuf,
    manager: RocksDbManager,
    log_stream: LogStream,
    writer: LogStreamWriter,
    clock: SharedClock,
    registry: Arc<ProcessorRegistry>,
    listeners: ListenerRelay,
    response_sink: Arc<dyn ResponseSink>,
    command_sender: Arc<dyn InterPartitionCommandSender>,
    redistributor: CommandRedistributor,
    exporter: Option<ExporterDirectorHandle>,
    phase: watch::Sender<StreamProcessorPhase>,
    state: Option<RuntimeState>,
    wake_on_commit: Option<Arc<WakeOnCommit>>,
    next_scheduled: bool,
    snapshot_timer: Option<TimerId>,
    redistribution_timer: Option<TimerId>,
    failure: Option<String>,
}

impl StreamProcessor {
    pub(super) fn new(
        config: StreamProcessorConfig,
        phase: watch::Sender<StreamProcessorPhase>,
    ) -> Self {
        Self {
            partition_id: config.partition_id,
            options: config.options,
            redistribution_interval: config.redistribution_interval,
            runtime_dir: config.runtime_dir,
            snapshot_dir: config.snapshot_dir,
            manager: config.manager,
            writer: config.log_stream.new_writer(),
            log_stream: config.log_stream,
            clock: config.clock,
            registry: Arc::new(config.registry),
            listeners: config.listeners,
            response_sink: config.response_sink,
            command_sender: config.command_sender,
            redistributor: config.redistributor,
            exporter: config.exporter,
            phase,
            state: None,
            wake_on_commit: None,
            next_scheduled: false,
            snapshot_timer: None,
            redistribution_timer: None,
            failure: None,
        }
    }

    fn phase(&self) -> StreamProcessorPhase {
        *self.phase.borrow()
    }

    fn set_phase(&mut self, phase: StreamProcessorPhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            debug!(partition_id = %self.partition_id, "Stream processor {previous} -> {phase}");
        }
    }

    async fn initialize(&mut self, ctx: &mut ActorContext<Self>) -> Result<(), StreamProcessorError> {
        let snapshots = SnapshotStore::open(
            self.partition_id,
            self.snapshot_dir.clone(),
            self.options.retain_snapshots,
        )
        .await?;
        let recovered = snapshots.recover_into(&self.runtime_dir).await?;
        let mut store = create_db(&self.manager, self.partition_id, self.runtime_dir.clone()).await?;
        run_migrations(&mut store).await?;

        let last_processed = store.get_last_processed_position()?;
        let mut reader = self.log_stream.new_reader();
        seek_after(&mut reader, last_processed)?;

        let handle = ctx.handle().ok_or(ShutdownError)?;
        let wake_on_commit = Arc::new(WakeOnCommit {
            handle,
            pending: AtomicBool::new(false),
        });
        self.log_stream
            .register_commit_listener(Arc::clone(&wake_on_commit) as Arc<dyn CommitListener>);
        self.wake_on_commit = Some(wake_on_commit);

        if let Some(interval) = self.options.snapshot_interval.as_deref() {
            self.snapshot_timer =
                Some(ctx.schedule_at_interval(*interval, || Message::SnapshotTick));
        }

        info!(
            partition_id = %self.partition_id,
            snapshot = ?recovered.map(|metadata| metadata.processed_position),
            last_processed = ?last_processed,
            "Stream processor initialized, replaying"
        );
        self.state = Some(RuntimeState {
            store,
            snapshots,
            reader,
            replay_base: last_processed,
            last_processed,
            last_snapshot: recovered.map(|metadata| metadata.processed_position),
        });
        Ok(())
    }

    async fn replay_next(&mut self, ctx: &mut ActorContext<Self>) -> Result<(), StreamProcessorError> {
        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };

        let batch = replay_batch(
            self.partition_id,
            &self.registry,
            state,
            self.options.replay_batch_size.get(),
        )?;
        batch.commit.await?;
        state.last_processed = batch.last_processed;
        counter!(PROCESSOR_EVENTS_REPLAYED).increment(batch.replayed as u64);
        trace!(
            partition_id = %self.partition_id,
            replayed = batch.replayed,
            "Replayed batch"
        );

        if batch.reached_tail {
            self.on_recovered(ctx)?;
        } else {
            ctx.submit(Message::ReplayNext);
        }
        Ok(())
    }

    fn on_recovered(&mut self, ctx: &mut ActorContext<Self>) -> Result<(), StreamProcessorError> {
        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };
        // replay read past unprocessed commands, processing starts right after the last
        // processed one
        seek_after(&mut state.reader, state.last_processed)?;
        let last_processed = state.last_processed;

        self.set_phase(StreamProcessorPhase::Processing);
        info!(
            partition_id = %self.partition_id,
            last_processed = ?last_processed,
            "Stream processor recovered"
        );
        self.listeners
            .on_recovered(last_processed.unwrap_or(Position::INVALID));
        for component in self.registry.lifecycle_aware() {
            component.on_recovered(self.partition_id);
        }

        self.redistribution_timer = Some(
            ctx.schedule_at_interval(self.redistribution_interval, || {
                Message::RedistributionTick
            }),
        );
        Ok(())
    }

    async fn process_next(&mut self) -> Result<(), StreamProcessorError> {
        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };
        if !state.reader.has_next()? {
            return Ok(());
        }
        let entry = state.reader.next()?;
        if !entry.is_command() {
            trace!(partition_id = %self.partition_id, position = %entry.position, "Skipping {}", entry.metadata.record_type);
            counter!(PROCESSOR_ENTRIES_SKIPPED).increment(1);
            self.listeners.on_skipped(&entry);
            return Ok(());
        }

        let start = Instant::now();
        let processed = process_command(
            self.partition_id,
            &self.registry,
            &self.log_stream,
            &mut state.store,
            &entry,
        )?;
        let ProcessingResult {
            entries,
            response,
            post_commit_tasks,
        } = processed.result;

        // the log is written first, committed state is never ahead of it
        if !entries.is_empty() {
            self.writer
                .try_write(entries, Some(entry.position))
                .await?;
        }
        processed.commit.await?;
        state.last_processed = Some(entry.position);

        if let Some((request, response)) = response {
            self.response_sink.send_response(request, response);
        }
        for task in post_commit_tasks {
            self.run_post_commit_task(task);
        }

        counter!(PROCESSOR_COMMANDS_PROCESSED).increment(1);
        if processed.rejected {
            counter!(PROCESSOR_COMMANDS_REJECTED).increment(1);
        }
        histogram!(PROCESSOR_PROCESSING_DURATION).record(start.elapsed());
        gauge!(PROCESSOR_LAST_PROCESSED_POSITION, "partition" => self.partition_id.to_string())
            .set(entry.position.as_i64() as f64);

        if processed.empty {
            self.listeners.on_skipped(&entry);
        } else {
            self.listeners.on_processed(&entry);
        }
        Ok(())
    }

    fn run_post_commit_task(&mut self, task: PostCommitTask) {
        match task {
            PostCommitTask::SendCommand { target, entry } => {
                if entry.metadata.distributed {
                    if let Some(distribution_key) = entry.key {
                        self.redistributor.track_sent(distribution_key, target);
                    }
                }
                self.command_sender.send_command(target, entry);
            }
            PostCommitTask::Run(task) => task(),
        }
    }

    fn redistribute(&mut self) -> Result<(), StreamProcessorError> {
        let Some(state) = self.state.as_ref() else {
            return Ok(());
        };
        for (distribution_key, target) in self.redistributor.due_retries(&state.store)? {
            match state.store.get_distribution_command(distribution_key)? {
                Some(command) => {
                    debug!(
                        partition_id = %self.partition_id,
                        %distribution_key,
                        %target,
                        "Redistributing command"
                    );
                    counter!(DISTRIBUTION_REDISTRIBUTED).increment(1);
                    self.command_sender
                        .send_command(target, distributed_command_entry(distribution_key, &command));
                }
                None => warn!(
                    partition_id = %self.partition_id,
                    %distribution_key,
                    "Retriable distribution without command"
                ),
            }
        }
        Ok(())
    }

    fn pause(&mut self) -> Result<(), StreamProcessorError> {
        match self.phase() {
            StreamProcessorPhase::Processing => {
                self.set_phase(StreamProcessorPhase::Paused);
                for component in self.registry.lifecycle_aware() {
                    component.on_paused();
                }
                info!(partition_id = %self.partition_id, "Stream processor paused");
                Ok(())
            }
            phase => Err(StreamProcessorError::InvalidPhase {
                operation: "pause",
                phase,
            }),
        }
    }

    fn resume(&mut self) -> Result<(), StreamProcessorError> {
        match self.phase() {
            StreamProcessorPhase::Paused => {
                self.set_phase(StreamProcessorPhase::Processing);
                for component in self.registry.lifecycle_aware() {
                    component.on_resumed();
                }
                info!(partition_id = %self.partition_id, "Stream processor resumed");
                Ok(())
            }
            phase => Err(StreamProcessorError::InvalidPhase {
                operation: "resume",
                phase,
            }),
        }
    }

    /// Snapshots the store at the last processed position. Returns that position, or
    /// `None` if nothing was processed yet.
    async fn snapshot(&mut self) -> Result<Option<Position>, StreamProcessorError> {
        match self.phase() {
            StreamProcessorPhase::Processing | StreamProcessorPhase::Paused => {}
            phase => {
                return Err(StreamProcessorError::InvalidPhase {
                    operation: "snapshot",
                    phase,
                })
            }
        }
        let Some(state) = self.state.as_mut() else {
            return Ok(None);
        };
        let Some(last_processed) = state.last_processed else {
            return Ok(None);
        };
        if state.last_snapshot == Some(last_processed) {
            trace!(partition_id = %self.partition_id, "Nothing processed since the last snapshot");
            return Ok(Some(last_processed));
        }

        let start = Instant::now();
        let snapshot = state
            .snapshots
            .take_snapshot(&state.store, self.clock.now())
            .await?;
        let position = snapshot.processed_position();
        state.last_snapshot = Some(position);
        counter!(PROCESSOR_SNAPSHOT).increment(1);
        histogram!(PROCESSOR_SNAPSHOT_DURATION).record(start.elapsed());

        let purged = state.snapshots.purge().await?;
        if purged > 0 {
            debug!(partition_id = %self.partition_id, "Purged {purged} old snapshots");
        }

        if self.options.compact_log_on_snapshot {
            // entries not seen by every exporter stay
            let compact_to = match &self.exporter {
                Some(exporter) => {
                    position.min(exporter.exported_position().unwrap_or(Position::INVALID))
                }
                None => position,
            };
            if compact_to >= Position::OLDEST {
                self.log_stream.compact(compact_to).await?;
            }
        }
        Ok(Some(position))
    }

    fn status(&self) -> ProcessorStatus {
        ProcessorStatus {
            phase: self.phase(),
            last_processed_position: self
                .state
                .as_ref()
                .and_then(|state| state.last_processed),
            last_written_position: self.log_stream.last_written_position(),
            failure: self.failure.clone(),
        }
    }

    /// Submits [`Message::ProcessNext`] if there is a committed entry to process and none
    /// is scheduled yet.
    fn schedule_next(&mut self, ctx: &mut ActorContext<Self>) -> Result<(), ReadError> {
        if self.next_scheduled || self.phase() != StreamProcessorPhase::Processing {
            return Ok(());
        }
        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };
        if state.reader.has_next()? {
            ctx.submit(Message::ProcessNext);
            self.next_scheduled = true;
        }
        Ok(())
    }

    fn cancel_timers(&mut self, ctx: &mut ActorContext<Self>) {
        for timer in [self.snapshot_timer.take(), self.redistribution_timer.take()]
            .into_iter()
            .flatten()
        {
            ctx.cancel_timer(timer);
        }
    }

    fn unregister_commit_listener(&mut self) {
        if let Some(wake_on_commit) = self.wake_on_commit.take() {
            self.log_stream
                .remove_commit_listener(&(wake_on_commit as Arc<dyn CommitListener>));
        }
    }

    fn fail(&mut self, ctx: &mut ActorContext<Self>, err: StreamProcessorError) {
        error!(
            partition_id = %self.partition_id,
            phase = %self.phase(),
            "Stream processor failed: {err}"
        );
        counter!(PROCESSOR_FAILED).increment(1);
        self.failure = Some(err.to_string());
        self.cancel_timers(ctx);
        self.unregister_commit_listener();
        self.redistributor.clear();
        self.set_phase(StreamProcessorPhase::Failed);
        for component in self.registry.lifecycle_aware() {
            component.on_failed();
        }
    }

    async fn close(&mut self, ctx: &mut ActorContext<Self>) {
        if self.phase() == StreamProcessorPhase::Closed {
            return;
        }
        self.set_phase(StreamProcessorPhase::Closing);
        self.cancel_timers(ctx);
        self.unregister_commit_listener();
        self.redistributor.clear();
        if let Some(exporter) = self.exporter.take() {
            exporter.stop().await;
        }
        for component in self.registry.lifecycle_aware() {
            component.on_close();
        }
        if let Some(state) = self.state.take() {
            state.store.close().await;
        }
        self.set_phase(StreamProcessorPhase::Closed);
        info!(partition_id = %self.partition_id, "Stream processor closed");
    }
}

#[async_trait]
impl Actor for StreamProcessor {
    type Message = Message;

    fn name(&self) -> &'static str {
        "stream-processor"
    }

    async fn on_start(&mut self, ctx: &mut ActorContext<Self>) -> anyhow::Result<()> {
        describe_metrics();
        match self.initialize(ctx).await {
            Ok(()) => {
                self.set_phase(StreamProcessorPhase::Replaying);
                ctx.submit(Message::ReplayNext);
            }
            Err(err) => self.fail(ctx, err),
        }
        Ok(())
    }

    async fn handle(&mut self, msg: Message, ctx: &mut ActorContext<Self>) -> anyhow::Result<()> {
        match msg {
            Message::ReplayNext => {
                if self.phase() == StreamProcessorPhase::Replaying {
                    if let Err(err) = self.replay_next(ctx).await {
                        self.fail(ctx, err);
                    }
                }
            }
            Message::ProcessNext => {
                self.next_scheduled = false;
                if self.phase() == StreamProcessorPhase::Processing {
                    if let Err(err) = self.process_next().await {
                        self.fail(ctx, err);
                    }
                }
            }
            Message::NewCommits => {
                if let Some(wake_on_commit) = &self.wake_on_commit {
                    wake_on_commit.pending.store(false, Ordering::Release);
                }
            }
            Message::SnapshotTick => {
                if matches!(
                    self.phase(),
                    StreamProcessorPhase::Processing | StreamProcessorPhase::Paused
                ) {
                    if let Err(err) = self.snapshot().await {
                        warn!(partition_id = %self.partition_id, "Periodic snapshot failed: {err}");
                    }
                }
            }
            Message::RedistributionTick => {
                if self.phase() == StreamProcessorPhase::Processing {
                    if let Err(err) = self.redistribute() {
                        self.fail(ctx, err);
                    }
                }
            }
            Message::Pause(reply) => reply.send(self.pause()),
            Message::Resume(reply) => reply.send(self.resume()),
            Message::Snapshot(reply) => {
                let result = self.snapshot().await;
                reply.send(result);
            }
            Message::Status(reply) => reply.send(self.status()),
            Message::Close(reply) => {
                self.close(ctx).await;
                reply.send(());
                ctx.stop();
                return Ok(());
            }
        }

        if let Err(err) = self.schedule_next(ctx) {
            self.fail(ctx, err.into());
        }
        Ok(())
    }

    async fn on_stop(&mut self, ctx: &mut ActorContext<Self>) {
        self.close(ctx).await;
    }
}

fn seek_after(reader: &mut LogStreamReader, position: Option<Position>) -> Result<(), ReadError> {
    match position {
        Some(position) => reader.seek_to_next(position).map(|_| ()),
        None => reader.seek_to_first(),
    }
}

struct ReplayBatch {
    commit: CommitFuture,
    last_processed: Option<Position>,
    replayed: usize,
    reached_tail: bool,
}

/// Reads up to `batch_size` entries and applies the events among them in one transaction.
///
/// Every entry with a source position proves that its source command was processed. Events
/// of commands the recovered store already reflects are not applied again.
fn replay_batch(
    partition_id: PartitionId,
    registry: &ProcessorRegistry,
    state: &mut RuntimeState,
    batch_size: usize,
) -> Result<ReplayBatch, StreamProcessorError> {
    let key_generator = KeyGenerator::new(partition_id);
    let mut txn = state.store.transaction();
    let mut last_processed = state.last_processed;
    let mut replayed = 0;
    let mut read = 0;

    let reached_tail = loop {
        if read >= batch_size {
            break false;
        }
        if !state.reader.has_next()? {
            break true;
        }
        let entry = state.reader.next()?;
        read += 1;

        let Some(source) = entry.source_position else {
            continue;
        };
        last_processed = last_processed.max(Some(source));
        if state.replay_base.is_some_and(|base| source <= base) {
            continue;
        }

        let replay_error = |source: ProcessingError| StreamProcessorError::Replay {
            position: entry.position,
            source,
        };
        if entry.is_event() {
            registry
                .apply(&EventRecord::from(&entry), &mut txn)
                .map_err(replay_error)?;
            replayed += 1;
        }
        if let Some(key) = entry.key {
            key_generator
                .raise_to(&mut txn, key)
                .map_err(replay_error)?;
        }
    };

    if last_processed != state.last_processed {
        if let Some(position) = last_processed {
            txn.put_last_processed_position(position)?;
        }
    }
    Ok(ReplayBatch {
        commit: txn.commit().boxed(),
        last_processed,
        replayed,
        reached_tail,
    })
}

struct ProcessedCommand {
    result: ProcessingResult,
    commit: CommitFuture,
    rejected: bool,
    /// The processor produced nothing.
    empty: bool,
}

/// Runs the processor of `command` and stages its state changes. Nothing is visible
/// before the returned commit future completed.
fn process_command(
    partition_id: PartitionId,
    registry: &ProcessorRegistry,
    log_stream: &LogStream,
    store: &mut PartitionStore,
    command: &LoggedEntry,
) -> Result<ProcessedCommand, StreamProcessorError> {
    let processing_error = |source: ProcessingError| StreamProcessorError::Processing {
        position: command.position,
        source,
    };
    let processor = registry
        .processor(command.value_type(), command.intent())
        .ok_or(StreamProcessorError::NoProcessor {
            value_type: command.value_type(),
            intent: command.intent(),
            position: command.position,
        })?;

    let mut txn = store.transaction();
    let outcome = {
        let mut ctx = ProcessingContext::new(partition_id, command, &mut txn, registry);
        processor.process(&mut ctx).map(|()| ctx.into_result())
    };

    let (mut result, rejected) = match outcome {
        Ok(result)
            if !result.entries.is_empty()
                && !log_stream.can_write(result.entries.len(), result.encoded_len()) =>
        {
            txn.rollback()?;
            let rejection = Rejection::new(
                RejectionType::ExceededBatchRecordSize,
                format!(
                    "{} follow-up entries of {} bytes exceed the maximum block size",
                    result.entries.len(),
                    result.encoded_len()
                ),
            );
            (
                rejection_result(partition_id, command, &rejection, log_stream.max_entry_len()),
                true,
            )
        }
        Ok(result) => (result, false),
        Err(ProcessingError::Rejected(rejection)) => {
            trace!(%partition_id, position = %command.position, "Command rejected: {rejection}");
            txn.rollback()?;
            (
                rejection_result(partition_id, command, &rejection, log_stream.max_entry_len()),
                true,
            )
        }
        Err(err) => return Err(processing_error(err)),
    };
    let empty = result.is_empty();

    // distributed commands are acknowledged even if rejected, the distributing partition
    // would retry them forever otherwise
    if command.metadata.distributed {
        match command.key {
            Some(distribution_key) => {
                let ack = acknowledge_entry(distribution_key, partition_id)
                    .map_err(|err| processing_error(err.into()))?;
                result.post_commit_tasks.push(PostCommitTask::SendCommand {
                    target: distribution_key.partition_id(),
                    entry: ack,
                });
            }
            None => warn!(
                %partition_id,
                position = %command.position,
                "Distributed command without distribution key"
            ),
        }
    }

    txn.put_last_processed_position(command.position)?;
    Ok(ProcessedCommand {
        result,
        commit: txn.commit().boxed(),
        rejected,
        empty,
    })
}
