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

use keel_stream_processor::distribution::{CommandDistributionIntent, CommandDistributionRecord};
use keel_types::logs::{Intent, LogAppendEntry, RecordMetadata, RejectionType, ValueType};
use keel_types::{Key, PartitionId};

use crate::{
    command, eventually, read_log, request, TestNode, DEPLOY, DEPLOYMENT, DEPLOY_LOCALLY,
};

const ORIGIN: PartitionId = PartitionId::new_unchecked(1);
const FIRST_TARGET: PartitionId = PartitionId::new_unchecked(2);
const SECOND_TARGET: PartitionId = PartitionId::new_unchecked(3);

async fn node_with(partitions: &[PartitionId]) -> TestNode {
    let mut node = TestNode::new();
    for partition_id in partitions {
        node.add_partition(*partition_id).await;
    }
    node
}

fn has_distribution_event(
    node: &TestNode,
    distribution_key: Key,
    intent: CommandDistributionIntent,
) -> bool {
    let intent = Intent::from(intent);
    read_log(&node.partition(ORIGIN).log_stream)
        .iter()
        .any(|entry| {
            entry.is_event()
                && entry.key == Some(distribution_key)
                && entry.value_type() == ValueType::CommandDistribution
                && entry.intent() == intent
        })
}

/// Payloads of the distributed commands `partition_id` processed, redeliveries removed.
fn deployed_on(node: &TestNode, partition_id: PartitionId) -> Vec<Bytes> {
    let mut deployed: Vec<Bytes> = Vec::new();
    for payload in node
        .recorder(partition_id)
        .processed_payloads(DEPLOYMENT, DEPLOY_LOCALLY)
    {
        if !deployed.contains(&payload) {
            deployed.push(payload);
        }
    }
    deployed
}

async fn deploy(node: &TestNode, spec: &str, request_id: i64) {
    node.write(ORIGIN, command(DEPLOYMENT, DEPLOY, spec, request_id))
        .await;
}

async fn distribution_key_of(node: &TestNode, request_id: i64) -> Key {
    let recorder = node.recorder(ORIGIN);
    eventually("deployment answered", || {
        recorder.response_to(request_id).is_some()
    })
    .await;
    recorder
        .response_to(request_id)
        .and_then(|response| response.key)
        .expect("deployment returns its distribution key")
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn distribution_finishes_once_every_target_acknowledged() -> googletest::Result<()> {
    let mut node = node_with(&[ORIGIN, FIRST_TARGET, SECOND_TARGET]).await;
    for partition_id in [ORIGIN, FIRST_TARGET, SECOND_TARGET] {
        node.connect(partition_id);
        node.start(partition_id).await;
    }

    deploy(&node, "svc:3,2,3", 1).await;
    let distribution_key = distribution_key_of(&node, 1).await;
    assert_that!(distribution_key.partition_id(), eq(ORIGIN));

    eventually("distribution finished", || {
        has_distribution_event(&node, distribution_key, CommandDistributionIntent::Finished)
    })
    .await;
    for target in [FIRST_TARGET, SECOND_TARGET] {
        assert_that!(
            deployed_on(&node, target),
            elements_are![eq(Bytes::from_static(b"svc"))]
        );
    }
    // a late acknowledgement finds nothing to resolve
    let late_ack = LogAppendEntry::new(
        Some(distribution_key),
        RecordMetadata::command(
            ValueType::CommandDistribution,
            CommandDistributionIntent::Acknowledge.into(),
        )
        .with_request(request(2)),
        CommandDistributionRecord::new(FIRST_TARGET, None)
            .to_payload()
            .expect("record encodes"),
    );
    node.write(ORIGIN, late_ack).await;
    let recorder = node.recorder(ORIGIN);
    eventually("late ack answered", || recorder.response_to(2).is_some()).await;
    assert_that!(
        recorder.response_to(2).and_then(|response| response.rejection_type),
        some(eq(RejectionType::NotFound))
    );

    node.shutdown().await;
    Ok(())
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn distribution_survives_target_outage_and_origin_restart() -> googletest::Result<()> {
    let mut node = node_with(&[ORIGIN, FIRST_TARGET]).await;
    node.connect(ORIGIN);
    node.start(ORIGIN).await;

    deploy(&node, "svc:2", 1).await;
    let distribution_key = distribution_key_of(&node, 1).await;
    // a few redistribution rounds against the unreachable target
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert!(!has_distribution_event(
        &node,
        distribution_key,
        CommandDistributionIntent::Finished
    ));

    node.stop(ORIGIN).await;
    node.start(ORIGIN).await;
    node.connect(FIRST_TARGET);
    node.start(FIRST_TARGET).await;

    eventually("distribution finished", || {
        has_distribution_event(&node, distribution_key, CommandDistributionIntent::Finished)
    })
    .await;
    assert_that!(
        deployed_on(&node, FIRST_TARGET),
        elements_are![eq(Bytes::from_static(b"svc"))]
    );

    node.shutdown().await;
    Ok(())
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn queued_distributions_arrive_in_order() -> googletest::Result<()> {
    let mut node = node_with(&[ORIGIN, FIRST_TARGET]).await;
    node.connect(ORIGIN);
    node.start(ORIGIN).await;

    // queued behind each other while the target is unreachable
    for (request_id, name) in ["d1", "d2", "d3"].into_iter().enumerate() {
        deploy(&node, &format!("{name}:2"), request_id as i64).await;
    }
    let last = distribution_key_of(&node, 2).await;
    assert!(has_distribution_event(
        &node,
        last,
        CommandDistributionIntent::Enqueued
    ));

    node.connect(FIRST_TARGET);
    node.start(FIRST_TARGET).await;
    eventually("last distribution finished", || {
        has_distribution_event(&node, last, CommandDistributionIntent::Finished)
    })
    .await;

    assert_that!(
        deployed_on(&node, FIRST_TARGET),
        elements_are![
            eq(Bytes::from_static(b"d1")),
            eq(Bytes::from_static(b"d2")),
            eq(Bytes::from_static(b"d3"))
        ]
    );

    node.shutdown().await;
    Ok(())
}
