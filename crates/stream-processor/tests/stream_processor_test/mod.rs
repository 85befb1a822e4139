// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use bytes::Bytes;
use googletest::prelude::*;
use test_log::test;

use keel_partition_store::fsm_table::ReadOnlyFsmTable;
use keel_partition_store::{create_db, PartitionStore};
use keel_stream_processor::{StreamProcessorError, StreamProcessorPhase};
use keel_types::config::LogStreamOptions;
use keel_types::logs::{
    Intent, LoggedEntry, Position, RecordType, RejectionType, SequenceNumber,
};
use keel_types::PartitionId;

use super::{
    command, decode_counter, eventually, increment, read_log, request, wait_for_processed,
    Counter, CounterKey, Observed, TestNode, COUNTER, COUNTERS, ECHO, INCREMENTED,
    INCREMENT_AND_REJECT, OVERSIZED,
};

mod distribution_test;
mod exporter_test;

const PARTITION: PartitionId = PartitionId::new_unchecked(1);

async fn single_partition_node() -> TestNode {
    let mut node = TestNode::new();
    node.add_partition(PARTITION).await;
    node.connect(PARTITION);
    node
}

fn counter_values(node: &TestNode) -> Vec<(String, u64)> {
    node.recorder(PARTITION)
        .processed_payloads(COUNTER, INCREMENTED)
        .iter()
        .map(|payload| decode_counter(payload).expect("counter event"))
        .collect()
}

fn scan_counters(store: &PartitionStore) -> Vec<(CounterKey, Counter)> {
    let mut counters = Vec::new();
    COUNTERS
        .for_each(store, |key, counter| {
            counters.push((key, counter));
            Ok(())
        })
        .expect("counters scan");
    counters
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn processes_commands_in_log_order() -> googletest::Result<()> {
    let mut node = single_partition_node().await;
    let processor = node.start(PARTITION).await;

    let mut last = Position::INVALID;
    for (request_id, name) in ["a", "b", "a", "a"].into_iter().enumerate() {
        last = node.write(PARTITION, increment(name, request_id as i64)).await;
    }
    wait_for_processed(&processor, last).await;

    let recorder = node.recorder(PARTITION);
    let processed = recorder.processed();
    assert_that!(processed.len(), eq(4));
    assert!(processed.windows(2).all(|pair| pair[0] < pair[1]));
    let observed = recorder.observed.lock().clone();
    assert_that!(
        observed.first(),
        some(eq(&Observed::Recovered(Position::INVALID)))
    );

    // the response of each command reflects all commands before it
    let third = recorder.response_to(2).expect("third command answered");
    assert_that!(third.payload, eq(Bytes::from_static(b"a=2")));
    let fourth = recorder.response_to(3).expect("fourth command answered");
    assert_that!(fourth.payload, eq(Bytes::from_static(b"a=3")));
    assert_that!(fourth.key, eq(third.key));

    // every event points back at the command it was produced by
    let log = read_log(&node.partition(PARTITION).log_stream);
    for event in log.iter().filter(|entry| entry.is_event()) {
        let source = event.source_position.expect("events carry their source");
        let command = log
            .iter()
            .find(|entry| entry.position == source)
            .expect("source in log");
        assert!(command.is_command());
        assert!(source < event.position);
    }

    node.shutdown().await;
    Ok(())
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn rejection_discards_state_changes() -> googletest::Result<()> {
    let mut node = single_partition_node().await;
    let processor = node.start(PARTITION).await;

    node.write(PARTITION, increment("a", 1)).await;
    let rejected = node
        .write(PARTITION, command(COUNTER, INCREMENT_AND_REJECT, "a", 2))
        .await;
    let last = node.write(PARTITION, increment("a", 3)).await;
    wait_for_processed(&processor, last).await;

    let recorder = node.recorder(PARTITION);
    let rejection = recorder.response_to(2).expect("rejection answered");
    assert!(rejection.is_rejection());
    assert_that!(rejection.rejection_type, some(eq(RejectionType::InvalidState)));
    assert_that!(rejection.payload, eq(Bytes::from_static(b"a")));

    // the rejected increment never happened
    let answer = recorder.response_to(3).expect("last command answered");
    assert_that!(answer.payload, eq(Bytes::from_static(b"a=2")));

    let log = read_log(&node.partition(PARTITION).log_stream);
    let written: Vec<_> = log
        .iter()
        .filter(|entry| entry.source_position == Some(rejected))
        .collect();
    assert_that!(written.len(), eq(1));
    assert_that!(written[0].record_type(), eq(RecordType::CommandRejection));
    assert_that!(
        written[0].metadata.rejection_type,
        some(eq(RejectionType::InvalidState))
    );
    assert_that!(written[0].metadata.request, some(eq(request(2))));

    node.shutdown().await;
    Ok(())
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn oversized_results_are_rejected() -> googletest::Result<()> {
    let mut node = single_partition_node().await;
    let processor = node.start(PARTITION).await;

    let oversized = node.write(PARTITION, command(COUNTER, OVERSIZED, "", 1)).await;
    let last = node.write(PARTITION, increment("big", 2)).await;
    wait_for_processed(&processor, last).await;

    let recorder = node.recorder(PARTITION);
    let rejection = recorder.response_to(1).expect("oversized command answered");
    assert_that!(
        rejection.rejection_type,
        some(eq(RejectionType::ExceededBatchRecordSize))
    );
    // neither the event nor the key it took survived
    let answer = recorder.response_to(2).expect("increment answered");
    assert_that!(answer.payload, eq(Bytes::from_static(b"big=1")));

    let log = read_log(&node.partition(PARTITION).log_stream);
    assert!(log
        .iter()
        .filter(|entry| entry.source_position == Some(oversized))
        .all(|entry| entry.is_rejection()));
    assert_that!(processor.phase(), eq(StreamProcessorPhase::Processing));

    node.shutdown().await;
    Ok(())
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn rejection_of_a_block_sized_command_fits_the_log() -> googletest::Result<()> {
    let mut node = single_partition_node().await;
    let processor = node.start(PARTITION).await;

    let max_entry_len = node.partition(PARTITION).log_stream.max_entry_len();
    assert_that!(
        max_entry_len,
        eq(LogStreamOptions::default().max_block_size - std::mem::size_of::<u32>())
    );
    // the command fills a block on its own, its rejection echoing the payload would not
    let name = "a".repeat(max_entry_len - LoggedEntry::FIXED_LEN);
    let rejected = node
        .write(PARTITION, command(COUNTER, INCREMENT_AND_REJECT, &name, 1))
        .await;
    let last = node.write(PARTITION, increment("a", 2)).await;
    wait_for_processed(&processor, last).await;
    assert_that!(processor.phase(), eq(StreamProcessorPhase::Processing));

    let log = read_log(&node.partition(PARTITION).log_stream);
    let written: Vec<_> = log
        .iter()
        .filter(|entry| entry.source_position == Some(rejected))
        .collect();
    assert_that!(written.len(), eq(1));
    let rejection = written[0];
    assert!(rejection.is_rejection());
    assert!(rejection.payload.is_empty());
    assert!(rejection.encoded_len() <= max_entry_len);
    assert!(rejection.metadata.rejection_reason.starts_with("aaaa"));
    assert_that!(rejection.metadata.request, some(eq(request(1))));

    // the requester still learns everything
    let recorder = node.recorder(PARTITION);
    let response = recorder.response_to(1).expect("rejection answered");
    assert_that!(response.rejection_type, some(eq(RejectionType::InvalidState)));
    assert_that!(response.payload.len(), eq(name.len()));
    assert_eq!(format!("{name} must not change"), &*response.rejection_reason);
    let answer = recorder.response_to(2).expect("increment answered");
    assert_that!(answer.payload, eq(Bytes::from_static(b"a=1")));

    node.shutdown().await;
    Ok(())
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn restart_replays_events_into_state() -> googletest::Result<()> {
    let mut node = single_partition_node().await;
    let processor = node.start(PARTITION).await;
    let mut last = Position::INVALID;
    for request_id in 1..=3 {
        last = node.write(PARTITION, increment("a", request_id)).await;
    }
    wait_for_processed(&processor, last).await;
    node.stop(PARTITION).await;

    let processor = node.start(PARTITION).await;
    let recorder = node.recorder(PARTITION);
    // replayed commands are not processed again
    assert_that!(recorder.processed(), is_empty());
    assert_that!(
        processor.last_processed_position().await?,
        some(eq(last))
    );

    let last = node.write(PARTITION, increment("a", 4)).await;
    wait_for_processed(&processor, last).await;
    assert_that!(counter_values(&node), elements_are![eq(("a".to_owned(), 4))]);
    assert_that!(recorder.responses.lock().len(), eq(1));

    node.shutdown().await;
    Ok(())
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn restart_after_snapshot_resumes_behind_it() -> googletest::Result<()> {
    let mut node = single_partition_node().await;
    let processor = node.start(PARTITION).await;
    let mut last = Position::INVALID;
    for request_id in 1..=3 {
        last = node
            .write(PARTITION, command(COUNTER, ECHO, "hello", request_id))
            .await;
    }
    wait_for_processed(&processor, last).await;
    assert_that!(processor.snapshot().await?, some(eq(Position::new(3))));
    // nothing changed since
    assert_that!(processor.snapshot().await?, some(eq(Position::new(3))));
    node.stop(PARTITION).await;

    node.write(PARTITION, command(COUNTER, ECHO, "four", 4)).await;
    let last = node
        .write(PARTITION, command(COUNTER, ECHO, "five", 5))
        .await;

    let processor = node.start(PARTITION).await;
    wait_for_processed(&processor, last).await;

    let recorder = node.recorder(PARTITION);
    let answered: Vec<_> = recorder
        .responses
        .lock()
        .iter()
        .map(|(request, _)| request.request_id)
        .collect();
    assert_that!(answered, elements_are![eq(4), eq(5)]);
    let observed = recorder.observed.lock().clone();
    assert_that!(
        observed.first(),
        some(eq(&Observed::Recovered(Position::new(3))))
    );
    assert_that!(processor.last_processed_position().await?, some(eq(Position::new(5))));

    node.shutdown().await;
    Ok(())
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn replay_rebuilds_identical_state() -> googletest::Result<()> {
    let mut node = single_partition_node().await;
    let processor = node.start(PARTITION).await;
    let mut last = Position::INVALID;
    for (request_id, name) in ["a", "b", "c", "a", "b", "a"].into_iter().enumerate() {
        last = node.write(PARTITION, increment(name, request_id as i64)).await;
    }
    wait_for_processed(&processor, last).await;
    node.stop(PARTITION).await;

    let runtime_dir = node.config.partition_runtime_dir(PARTITION);
    let read_state = |node: &TestNode| {
        let manager = node.manager.clone();
        let runtime_dir = runtime_dir.clone();
        async move {
            let store = create_db(&manager, PARTITION, runtime_dir)
                .await
                .expect("store opens");
            let counters = scan_counters(&store);
            let last_key = store.get_last_issued_key().expect("fsm readable");
            let last_processed = store.get_last_processed_position().expect("fsm readable");
            store.close().await;
            (counters, last_key, last_processed)
        }
    };

    let processed = read_state(&node).await;
    assert_that!(processed.0.len(), eq(3));
    assert_that!(processed.2, some(eq(last)));

    node.start(PARTITION).await;
    node.stop(PARTITION).await;
    let replayed = read_state(&node).await;
    assert_eq!(replayed, processed);

    node.shutdown().await;
    Ok(())
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn replay_from_snapshot_matches_replay_from_start() -> googletest::Result<()> {
    let mut node = single_partition_node().await;
    // batches end between commands and their events
    node.config.processor.replay_batch_size = std::num::NonZeroUsize::new(3).expect("non-zero");
    let processor = node.start(PARTITION).await;

    let mut last = Position::INVALID;
    for (request_id, name) in ["a", "b", "a"].into_iter().enumerate() {
        last = node.write(PARTITION, increment(name, request_id as i64)).await;
    }
    wait_for_processed(&processor, last).await;
    let snapshot = processor.snapshot().await?.expect("something was processed");
    for (request_id, name) in ["c", "a", "b", "a"].into_iter().enumerate() {
        last = node
            .write(PARTITION, increment(name, 10 + request_id as i64))
            .await;
    }
    wait_for_processed(&processor, last).await;
    assert!(snapshot < last);
    node.stop(PARTITION).await;

    let runtime_dir = node.config.partition_runtime_dir(PARTITION);
    let read_state = |node: &TestNode| {
        let manager = node.manager.clone();
        let runtime_dir = runtime_dir.clone();
        async move {
            let store = create_db(&manager, PARTITION, runtime_dir)
                .await
                .expect("store opens");
            let counters = scan_counters(&store);
            let last_key = store.get_last_issued_key().expect("fsm readable");
            let last_processed = store.get_last_processed_position().expect("fsm readable");
            store.close().await;
            (counters, last_key, last_processed)
        }
    };

    let processed = read_state(&node).await;
    let values: Vec<_> = processed
        .0
        .iter()
        .map(|(_, counter)| counter.value)
        .collect();
    assert_that!(values, elements_are![eq(4), eq(2), eq(1)]);
    assert_that!(processed.2, some(eq(last)));

    // the snapshot holds a=2, b=1, the rest is replayed on top of it
    node.start(PARTITION).await;
    let recorder = node.recorder(PARTITION);
    assert_that!(recorder.processed(), is_empty());
    node.stop(PARTITION).await;
    let from_snapshot = read_state(&node).await;
    assert_eq!(from_snapshot, processed);

    std::fs::remove_dir_all(node.config.partition_snapshot_dir(PARTITION))?;
    node.start(PARTITION).await;
    node.stop(PARTITION).await;
    let from_start = read_state(&node).await;
    assert_eq!(from_start, processed);

    node.shutdown().await;
    Ok(())
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn missing_processor_fails_the_partition() -> googletest::Result<()> {
    let mut node = single_partition_node().await;
    let processor = node.start(PARTITION).await;

    node.write(PARTITION, increment("a", 1)).await;
    let unknown = node
        .write(PARTITION, command(COUNTER, Intent::new(42), "?", 2))
        .await;
    node.write(PARTITION, increment("a", 3)).await;

    processor
        .wait_for_phase(StreamProcessorPhase::Failed)
        .await?;
    let status = processor.status().await?;
    assert_that!(status.last_processed_position, some(lt(unknown)));
    assert_that!(status.failure, some(contains_substring("no command processor")));
    // the command after the failing one is never looked at
    assert_that!(node.recorder(PARTITION).response_to(3), none());

    assert!(matches!(
        processor.pause().await,
        Err(StreamProcessorError::InvalidPhase { .. })
    ));
    processor.close().await?;
    assert_that!(processor.phase(), eq(StreamProcessorPhase::Closed));

    node.shutdown().await;
    Ok(())
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn paused_processor_holds_back_commands() -> googletest::Result<()> {
    let mut node = single_partition_node().await;
    let processor = node.start(PARTITION).await;

    let first = node.write(PARTITION, increment("a", 1)).await;
    wait_for_processed(&processor, first).await;

    processor.pause().await?;
    assert_that!(processor.phase(), eq(StreamProcessorPhase::Paused));
    let second = node.write(PARTITION, increment("a", 2)).await;
    // give the processor a chance to misbehave
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_that!(processor.last_processed_position().await?, some(eq(first)));
    assert!(matches!(
        processor.pause().await,
        Err(StreamProcessorError::InvalidPhase { .. })
    ));
    // snapshots are taken while paused, too
    assert_that!(processor.snapshot().await?, some(eq(first)));

    processor.resume().await?;
    assert!(matches!(
        processor.resume().await,
        Err(StreamProcessorError::InvalidPhase { .. })
    ));
    wait_for_processed(&processor, second).await;
    let recorder = node.recorder(PARTITION);
    eventually("second response", || recorder.response_to(2).is_some()).await;
    assert_that!(
        recorder.response_to(2).map(|response| response.payload),
        some(eq(Bytes::from_static(b"a=2")))
    );

    node.shutdown().await;
    Ok(())
}
