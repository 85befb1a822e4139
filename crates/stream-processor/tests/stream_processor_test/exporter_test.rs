// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use googletest::prelude::*;
use parking_lot::Mutex;
use test_log::test;

use keel_stream_processor::Exporter;
use keel_types::logs::{LoggedEntry, Position, SequenceNumber};
use keel_types::retries::RetryPolicy;

use super::{single_partition_node, PARTITION};
use crate::{
    command, eventually, increment, read_log, wait_for_processed, TestNode, COUNTER,
    INCREMENT_AND_REJECT,
};

/// Records positions, failing every entry past `up_to`.
struct RecordingExporter {
    up_to: Position,
    exported: Arc<Mutex<Vec<Position>>>,
}

impl RecordingExporter {
    fn new(exported: &Arc<Mutex<Vec<Position>>>) -> Self {
        Self::up_to(Position::MAX, exported)
    }

    fn up_to(up_to: Position, exported: &Arc<Mutex<Vec<Position>>>) -> Self {
        Self {
            up_to,
            exported: Arc::clone(exported),
        }
    }
}

#[async_trait]
impl Exporter for RecordingExporter {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn export(&mut self, entry: &LoggedEntry) -> anyhow::Result<()> {
        if entry.position > self.up_to {
            anyhow::bail!("{} is past {}", entry.position, self.up_to);
        }
        self.exported.lock().push(entry.position);
        Ok(())
    }
}

struct FailingExporter {
    attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl Exporter for FailingExporter {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn export(&mut self, _entry: &LoggedEntry) -> anyhow::Result<()> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        anyhow::bail!("sink unavailable")
    }
}

async fn node_retrying_exports_forever(compact_log_on_snapshot: bool) -> TestNode {
    let mut node = single_partition_node().await;
    node.config.processor.exporter_retry_policy =
        RetryPolicy::fixed_delay(Duration::from_millis(10), None);
    node.config.processor.compact_log_on_snapshot = compact_log_on_snapshot;
    node
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn exports_every_committed_entry_in_order() -> googletest::Result<()> {
    let mut node = node_retrying_exports_forever(false).await;
    let exported = Arc::new(Mutex::new(Vec::new()));
    let processor = node
        .start_with_exporters(PARTITION, vec![Box::new(RecordingExporter::new(&exported))])
        .await;

    node.write(PARTITION, increment("a", 1)).await;
    node.write(PARTITION, command(COUNTER, INCREMENT_AND_REJECT, "a", 2))
        .await;
    let last = node.write(PARTITION, increment("b", 3)).await;
    wait_for_processed(&processor, last).await;

    // commands, events and the rejection alike
    let committed: Vec<_> = read_log(&node.partition(PARTITION).log_stream)
        .iter()
        .map(|entry| entry.position)
        .collect();
    assert_that!(committed.len(), eq(6));
    eventually("all entries exported", || {
        processor.exported_position() == committed.last().copied()
    })
    .await;
    assert_eq!(committed, exported.lock().clone());

    node.shutdown().await;
    Ok(())
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn failing_exporter_does_not_hold_back_processing() -> googletest::Result<()> {
    let mut node = node_retrying_exports_forever(true).await;
    let attempts = Arc::new(AtomicUsize::new(0));
    let processor = node
        .start_with_exporters(
            PARTITION,
            vec![Box::new(FailingExporter {
                attempts: Arc::clone(&attempts),
            })],
        )
        .await;

    let mut last = Position::INVALID;
    for request_id in 1..=3 {
        last = node.write(PARTITION, increment("a", request_id)).await;
    }
    wait_for_processed(&processor, last).await;
    let recorder = node.recorder(PARTITION);
    assert_that!(
        recorder.response_to(3).map(|response| response.payload),
        some(eq(Bytes::from_static(b"a=3")))
    );
    eventually("export retried", || attempts.load(Ordering::Relaxed) > 1).await;
    assert_that!(processor.exported_position(), none());

    // nothing was exported, so nothing may be compacted
    assert_that!(processor.snapshot().await?, some(eq(last)));
    let log = read_log(&node.partition(PARTITION).log_stream);
    assert_that!(
        log.first().map(|entry| entry.position),
        some(eq(Position::OLDEST))
    );

    node.shutdown().await;
    Ok(())
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn snapshot_compaction_stops_at_exported_position() -> googletest::Result<()> {
    let mut node = node_retrying_exports_forever(true).await;
    let exported = Arc::new(Mutex::new(Vec::new()));
    let processor = node
        .start_with_exporters(
            PARTITION,
            vec![Box::new(RecordingExporter::up_to(
                Position::new(2),
                &exported,
            ))],
        )
        .await;

    // one command at a time: command and event positions alternate
    let mut last = Position::INVALID;
    for request_id in 1..=3 {
        last = node.write(PARTITION, increment("a", request_id)).await;
        wait_for_processed(&processor, last).await;
    }
    assert_that!(last, eq(Position::new(5)));
    eventually("first command and event exported", || {
        processor.exported_position() == Some(Position::new(2))
    })
    .await;

    assert_that!(processor.snapshot().await?, some(eq(last)));
    let remaining: Vec<_> = read_log(&node.partition(PARTITION).log_stream)
        .iter()
        .map(|entry| entry.position)
        .collect();
    assert_that!(
        remaining,
        elements_are![
            eq(Position::new(3)),
            eq(Position::new(4)),
            eq(Position::new(5)),
            eq(Position::new(6))
        ]
    );
    let exported = exported.lock().clone();
    assert_that!(exported, elements_are![eq(Position::new(1)), eq(Position::new(2))]);

    node.shutdown().await;
    Ok(())
}
