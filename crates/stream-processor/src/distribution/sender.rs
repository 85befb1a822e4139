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

use metrics::counter;
use parking_lot::RwLock;
use tracing::{debug, trace};

use keel_core::{TaskCenter, TaskKind};
use keel_log_stream::LogStreamWriter;
use keel_types::logs::LogAppendEntry;
use keel_types::PartitionId;

use crate::metric_definitions::{DISTRIBUTION_SEND_FAILED, DISTRIBUTION_SENT};

/// Delivers commands to the log stream of another partition.
///
/// Delivery is best effort. Losing a command is fine, the distributing partition keeps
/// redelivering it until the target acknowledged it.
pub trait InterPartitionCommandSender: Send + Sync + 'static {
    fn send_command(&self, target: PartitionId, entry: LogAppendEntry);
}

static_assertions::assert_obj_safe!(InterPartitionCommandSender);

/// Sends commands to partitions that run in the same process by appending to their log
/// streams directly.
pub struct LocalPartitionRouter {
    task_center: TaskCenter,
    writers: RwLock<HashMap<PartitionId, LogStreamWriter>>,
}

impl LocalPartitionRouter {
    pub fn new(task_center: TaskCenter) -> Arc<Self> {
        Arc::new(Self {
            task_center,
            writers: RwLock::default(),
        })
    }

    pub fn register(&self, writer: LogStreamWriter) {
        self.writers.write().insert(writer.partition_id(), writer);
    }

    pub fn unregister(&self, partition_id: PartitionId) -> Option<LogStreamWriter> {
        self.writers.write().remove(&partition_id)
    }

    pub fn is_registered(&self, partition_id: PartitionId) -> bool {
        self.writers.read().contains_key(&partition_id)
    }
}

impl InterPartitionCommandSender for LocalPartitionRouter {
    fn send_command(&self, target: PartitionId, entry: LogAppendEntry) {
        let Some(writer) = self.writers.read().get(&target).cloned() else {
            debug!(%target, "Dropping command for unknown partition");
            counter!(DISTRIBUTION_SEND_FAILED).increment(1);
            return;
        };

        let spawned = self.task_center.spawn(
            TaskKind::Disposable,
            "send-partition-command",
            Some(target),
            async move {
                match writer.try_write(vec![entry], None).await {
                    Ok(position) => {
                        trace!(%target, %position, "Delivered command");
                        counter!(DISTRIBUTION_SENT).increment(1);
                    }
                    Err(err) => {
                        debug!(%target, %err, "Failed delivering command");
                        counter!(DISTRIBUTION_SEND_FAILED).increment(1);
                    }
                }
                Ok(())
            },
        );
        if spawned.is_err() {
            counter!(DISTRIBUTION_SEND_FAILED).increment(1);
        }
    }
}

impl std::fmt::Debug for LocalPartitionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut partitions: Vec<_> = self.writers.read().keys().copied().collect();
        partitions.sort();
        f.debug_struct("LocalPartitionRouter")
            .field("partitions", &partitions)
            .finish()
    }
}
