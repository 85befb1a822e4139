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
use std::time::Duration;

use bytes::Bytes;
use bytestring::ByteString;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use keel_core::{TaskCenter, TaskCenterBuilder};
use keel_log_stream::storage::MemoryLogStorage;
use keel_log_stream::{LogStorage, LogStream};
use keel_partition_store::keys::KeyKind;
use keel_partition_store::{define_table_key, ColumnFamily, PartitionStoreTransaction};
use keel_rocksdb::RocksDbManager;
use keel_stream_processor::distribution::{DistributionRequest, LocalPartitionRouter};
use keel_stream_processor::{
    CommandProcessor, CommandResponse, EventApplier, EventRecord, Exporter, ProcessingContext,
    ProcessingError, ProcessorRegistry, Rejection, ResponseSink, StreamProcessorBuilder,
    StreamProcessorHandle, StreamProcessorListener, StreamProcessorPhase,
};
use keel_types::config::{
    CommandDistributionOptionsBuilder, CommonOptionsBuilder, Configuration, ConfigurationBuilder,
    LogStreamOptions, RocksDbOptions,
};
use keel_types::flexbuffers_storage_encode_decode;
use keel_types::logs::{
    Intent, LogAppendEntry, LoggedEntry, Position, RecordMetadata, RequestMetadata, ValueType,
};
use keel_types::retries::RetryPolicy;
use keel_types::{Key, PartitionId};

mod stream_processor_test;

const COUNTER: ValueType = ValueType::Variable;
const INCREMENT: Intent = Intent::new(0);
const INCREMENTED: Intent = Intent::new(1);
/// Increments, then rejects. The increment must not survive.
const INCREMENT_AND_REJECT: Intent = Intent::new(2);
/// Responds without writing anything.
const ECHO: Intent = Intent::new(3);
const OVERSIZED: Intent = Intent::new(4);

const DEPLOYMENT: ValueType = ValueType::Deployment;
const DEPLOY: Intent = Intent::new(0);
/// The distributed command a target partition receives.
const DEPLOY_LOCALLY: Intent = Intent::new(1);
const DEPLOYED: Intent = Intent::new(2);

const WAIT_TIMEOUT: Duration = Duration::from_secs(20);

define_table_key!(KeyKind::custom(*b"tc"), CounterKey(name: ByteString));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Counter {
    key: Key,
    value: u64,
}
flexbuffers_storage_encode_decode!(Counter);

const COUNTERS: ColumnFamily<CounterKey, Counter> = ColumnFamily::new("test-counters");

fn counter_key(name: &str) -> CounterKey {
    CounterKey::default().name(ByteString::from(name))
}

/// Event payload `<name>=<value>`.
fn encode_counter(name: &str, value: u64) -> Bytes {
    Bytes::from(format!("{name}={value}"))
}

fn decode_counter(payload: &[u8]) -> Result<(String, u64), ProcessingError> {
    let text = std::str::from_utf8(payload).map_err(anyhow::Error::from)?;
    let (name, value) = text
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("malformed counter event {text}"))?;
    Ok((name.to_owned(), value.parse().map_err(anyhow::Error::from)?))
}

struct IncrementProcessor {
    reject: bool,
}

impl CommandProcessor for IncrementProcessor {
    fn process(&self, ctx: &mut ProcessingContext<'_, '_>) -> Result<(), ProcessingError> {
        let name = std::str::from_utf8(&ctx.command().payload)
            .map_err(anyhow::Error::from)?
            .to_owned();
        if name.is_empty() {
            return Err(Rejection::invalid_argument("counter name must not be empty").into());
        }

        let (key, value) = match COUNTERS.get(ctx.state(), &counter_key(&name))? {
            Some(counter) => (counter.key, counter.value + 1),
            None => (ctx.next_key()?, 1),
        };
        let payload = encode_counter(&name, value);
        ctx.append_event(key, COUNTER, INCREMENTED, payload.clone())?;

        if self.reject {
            return Err(Rejection::invalid_state(format!("{name} must not change")).into());
        }
        ctx.respond(Some(key), COUNTER, INCREMENTED, payload);
        Ok(())
    }
}

struct CounterApplier;

impl EventApplier for CounterApplier {
    fn apply(
        &self,
        event: &EventRecord<'_>,
        txn: &mut PartitionStoreTransaction<'_>,
    ) -> Result<(), ProcessingError> {
        let (name, value) = decode_counter(event.payload)?;
        let key = event
            .key
            .ok_or_else(|| anyhow::anyhow!("counter event without key"))?;
        COUNTERS.upsert(txn, &counter_key(&name), &Counter { key, value })?;
        Ok(())
    }
}

struct EchoProcessor;

impl CommandProcessor for EchoProcessor {
    fn process(&self, ctx: &mut ProcessingContext<'_, '_>) -> Result<(), ProcessingError> {
        let command = ctx.command();
        ctx.respond(command.key, COUNTER, ECHO, command.payload.clone());
        Ok(())
    }
}

struct OversizedProcessor;

impl CommandProcessor for OversizedProcessor {
    fn process(&self, ctx: &mut ProcessingContext<'_, '_>) -> Result<(), ProcessingError> {
        let key = ctx.next_key()?;
        let payload = Bytes::from(vec![b'x'; LogStreamOptions::default().max_block_size]);
        ctx.append_event(key, COUNTER, INCREMENTED, encode_counter("big", 1))?;
        ctx.append_command(Some(key), COUNTER, ECHO, payload);
        Ok(())
    }
}

/// Distributes a deployment to the partitions listed in the payload `<name>:<p1>,<p2>`.
struct DeployProcessor;

impl CommandProcessor for DeployProcessor {
    fn process(&self, ctx: &mut ProcessingContext<'_, '_>) -> Result<(), ProcessingError> {
        let text = std::str::from_utf8(&ctx.command().payload)
            .map_err(anyhow::Error::from)?
            .to_owned();
        let (name, targets) = text
            .split_once(':')
            .ok_or_else(|| Rejection::invalid_argument("expected <name>:<partitions>"))?;
        let targets = targets
            .split(',')
            .map(|target| target.parse().map(PartitionId::new_unchecked))
            .collect::<Result<Vec<_>, _>>()
            .map_err(anyhow::Error::from)?;

        let distribution_key = ctx.distribute(DistributionRequest {
            queue: Some(ByteString::from_static("deployments")),
            targets,
            value_type: DEPLOYMENT,
            intent: DEPLOY_LOCALLY,
            payload: Bytes::from(name.to_owned()),
        })?;
        ctx.respond(distribution_key, DEPLOYMENT, DEPLOY, Bytes::from(name.to_owned()));
        Ok(())
    }
}

struct DeployLocallyProcessor;

impl CommandProcessor for DeployLocallyProcessor {
    fn process(&self, ctx: &mut ProcessingContext<'_, '_>) -> Result<(), ProcessingError> {
        let command = ctx.command();
        let key = ctx.next_key()?;
        ctx.append_event(key, DEPLOYMENT, DEPLOYED, command.payload.clone())?;
        Ok(())
    }
}

struct NoopApplier;

impl EventApplier for NoopApplier {
    fn apply(
        &self,
        _event: &EventRecord<'_>,
        _txn: &mut PartitionStoreTransaction<'_>,
    ) -> Result<(), ProcessingError> {
        Ok(())
    }
}

fn test_registry() -> ProcessorRegistry {
    let mut registry = ProcessorRegistry::default();
    registry
        .register_processor(COUNTER, INCREMENT, IncrementProcessor { reject: false })
        .and_then(|registry| {
            registry.register_processor(
                COUNTER,
                INCREMENT_AND_REJECT,
                IncrementProcessor { reject: true },
            )
        })
        .and_then(|registry| registry.register_processor(COUNTER, ECHO, EchoProcessor))
        .and_then(|registry| registry.register_processor(COUNTER, OVERSIZED, OversizedProcessor))
        .and_then(|registry| registry.register_applier(COUNTER, INCREMENTED, CounterApplier))
        .and_then(|registry| registry.register_processor(DEPLOYMENT, DEPLOY, DeployProcessor))
        .and_then(|registry| {
            registry.register_processor(DEPLOYMENT, DEPLOY_LOCALLY, DeployLocallyProcessor)
        })
        .and_then(|registry| registry.register_applier(DEPLOYMENT, DEPLOYED, NoopApplier))
        .expect("test processors register");
    registry
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Observed {
    Processed(Position),
    Skipped(Position),
    Recovered(Position),
}

/// Records listener callbacks and responses of one processor run.
#[derive(Default)]
struct Recorder {
    observed: Mutex<Vec<Observed>>,
    processed_entries: Mutex<Vec<LoggedEntry>>,
    responses: Mutex<Vec<(RequestMetadata, CommandResponse)>>,
}

impl Recorder {
    fn processed(&self) -> Vec<Position> {
        self.observed
            .lock()
            .iter()
            .filter_map(|observed| match observed {
                Observed::Processed(position) => Some(*position),
                _ => None,
            })
            .collect()
    }

    fn response_to(&self, request_id: i64) -> Option<CommandResponse> {
        self.responses
            .lock()
            .iter()
            .find(|(request, _)| request.request_id == request_id)
            .map(|(_, response)| response.clone())
    }

    fn processed_payloads(&self, value_type: ValueType, intent: Intent) -> Vec<Bytes> {
        self.processed_entries
            .lock()
            .iter()
            .filter(|entry| entry.value_type() == value_type && entry.intent() == intent)
            .map(|entry| entry.payload.clone())
            .collect()
    }
}

impl StreamProcessorListener for Recorder {
    fn on_processed(&self, entry: &LoggedEntry) {
        self.observed.lock().push(Observed::Processed(entry.position));
        self.processed_entries.lock().push(entry.clone());
    }

    fn on_skipped(&self, entry: &LoggedEntry) {
        self.observed.lock().push(Observed::Skipped(entry.position));
    }

    fn on_recovered(&self, last_processed: Position) {
        self.observed.lock().push(Observed::Recovered(last_processed));
    }
}

impl ResponseSink for Recorder {
    fn send_response(&self, request: RequestMetadata, response: CommandResponse) {
        self.responses.lock().push((request, response));
    }
}

fn request(request_id: i64) -> RequestMetadata {
    RequestMetadata {
        requester_stream_id: 1,
        request_id,
    }
}

fn command(value_type: ValueType, intent: Intent, payload: &str, request_id: i64) -> LogAppendEntry {
    LogAppendEntry::new(
        None,
        RecordMetadata::command(value_type, intent).with_request(request(request_id)),
        Bytes::from(payload.to_owned()),
    )
}

fn increment(name: &str, request_id: i64) -> LogAppendEntry {
    command(COUNTER, INCREMENT, name, request_id)
}

/// A node running partitions that share a task center, a rocksdb manager and a router.
struct TestNode {
    task_center: TaskCenter,
    _base_dir: TempDir,
    manager: RocksDbManager,
    config: Configuration,
    router: Arc<LocalPartitionRouter>,
    partitions: HashMap<PartitionId, TestPartition>,
}

struct TestPartition {
    log_stream: LogStream,
    processor: Option<StreamProcessorHandle>,
    recorder: Arc<Recorder>,
}

impl TestNode {
    fn new() -> Self {
        let base_dir = tempfile::tempdir().expect("temp dir");
        let config = ConfigurationBuilder::default()
            .common(
                CommonOptionsBuilder::default()
                    .base_dir(base_dir.path().to_path_buf())
                    .build()
                    .expect("common options"),
            )
            .distribution(
                CommandDistributionOptionsBuilder::default()
                    .redistribution_interval(Duration::from_millis(50).into())
                    .retry_policy(RetryPolicy::fixed_delay(Duration::from_millis(100), None))
                    .build()
                    .expect("distribution options"),
            )
            .build()
            .expect("configuration");
        let task_center = TaskCenterBuilder::default_for_tests()
            .build()
            .expect("task center builds");
        let router = LocalPartitionRouter::new(task_center.clone());

        Self {
            task_center,
            _base_dir: base_dir,
            manager: RocksDbManager::new(RocksDbOptions::default()),
            config,
            router,
            partitions: HashMap::new(),
        }
    }

    /// Opens the in-memory log stream of `partition_id`. Its entries survive processor
    /// restarts.
    async fn add_partition(&mut self, partition_id: PartitionId) -> LogStream {
        let storage: Arc<dyn LogStorage> = MemoryLogStorage::new();
        let log_stream = LogStream::open(
            partition_id,
            storage,
            Arc::new(keel_core::WallClock),
            &LogStreamOptions::default(),
        )
        .await
        .expect("log stream opens");
        self.partitions.insert(
            partition_id,
            TestPartition {
                log_stream: log_stream.clone(),
                processor: None,
                recorder: Arc::default(),
            },
        );
        log_stream
    }

    /// Makes `partition_id` reachable for distributed commands.
    fn connect(&self, partition_id: PartitionId) {
        self.router
            .register(self.partition(partition_id).log_stream.new_writer());
    }

    fn partition(&self, partition_id: PartitionId) -> &TestPartition {
        self.partitions
            .get(&partition_id)
            .expect("partition was added")
    }

    fn processor(&self, partition_id: PartitionId) -> &StreamProcessorHandle {
        self.partition(partition_id)
            .processor
            .as_ref()
            .expect("processor was started")
    }

    fn recorder(&self, partition_id: PartitionId) -> Arc<Recorder> {
        Arc::clone(&self.partition(partition_id).recorder)
    }

    /// Starts a processor with a fresh recorder and waits until it processes.
    async fn start(&mut self, partition_id: PartitionId) -> StreamProcessorHandle {
        self.start_with_exporters(partition_id, Vec::new()).await
    }

    async fn start_with_exporters(
        &mut self,
        partition_id: PartitionId,
        exporters: Vec<Box<dyn Exporter>>,
    ) -> StreamProcessorHandle {
        let recorder = Arc::new(Recorder::default());
        let partition = self
            .partitions
            .get_mut(&partition_id)
            .expect("partition was added");
        let builder = StreamProcessorBuilder::new(
            partition_id,
            &self.config,
            self.manager.clone(),
            partition.log_stream.clone(),
        )
        .with_registry(test_registry())
        .add_listener(recorder.clone())
        .with_response_sink(recorder.clone())
        .with_command_sender(self.router.clone());
        let handle = exporters
            .into_iter()
            .fold(builder, |builder, exporter| builder.add_exporter(exporter))
            .start(&self.task_center)
            .expect("processor starts");
        partition.processor = Some(handle.clone());
        partition.recorder = recorder;

        tokio::time::timeout(
            WAIT_TIMEOUT,
            handle.wait_for_phase(StreamProcessorPhase::Processing),
        )
        .await
        .expect("processor recovers in time")
        .expect("processor recovers");
        handle
    }

    async fn stop(&mut self, partition_id: PartitionId) {
        let partition = self
            .partitions
            .get_mut(&partition_id)
            .expect("partition was added");
        if let Some(processor) = partition.processor.take() {
            processor.close().await.expect("processor closes");
        }
    }

    async fn write(&self, partition_id: PartitionId, entry: LogAppendEntry) -> Position {
        self.partition(partition_id)
            .log_stream
            .new_writer()
            .try_write(vec![entry], None)
            .await
            .expect("append succeeds")
    }

    async fn shutdown(mut self) {
        let partitions: Vec<_> = self.partitions.keys().copied().collect();
        for partition_id in partitions {
            self.stop(partition_id).await;
        }
        self.manager.shutdown().await;
        self.task_center.shutdown_node("test completed", 0).await;
    }
}

/// Polls `condition` until it holds. Panics after [`WAIT_TIMEOUT`].
async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_processed(handle: &StreamProcessorHandle, position: Position) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        let processed = handle
            .last_processed_position()
            .await
            .expect("processor answers");
        if processed.is_some_and(|processed| processed >= position) {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for position {position}, processed {processed:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Every entry currently committed to `log_stream`.
fn read_log(log_stream: &LogStream) -> Vec<LoggedEntry> {
    let mut reader = log_stream.new_reader();
    let mut entries = Vec::new();
    while reader.has_next().expect("log readable") {
        entries.push(reader.next().expect("entry readable"));
    }
    entries
}
