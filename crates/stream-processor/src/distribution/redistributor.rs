// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::{HashMap, HashSet};

use tracing::{debug, trace};

use keel_core::SharedClock;
use keel_partition_store::distribution_table::ReadOnlyDistributionTable;
use keel_partition_store::StorageError;
use keel_types::retries::{RetryIter, RetryPolicy};
use keel_types::time::MillisSinceEpoch;
use keel_types::{Key, PartitionId};

struct Tracked {
    next_attempt: MillisSinceEpoch,
    backoff: RetryIter<'static>,
}

/// Decides which unacknowledged distributions are sent again.
///
/// Deadlines only live in memory. A retriable record that is not tracked, because it was
/// distributed before a restart, is due right away.
pub struct CommandRedistributor {
    partition_id: PartitionId,
    retry_policy: RetryPolicy,
    clock: SharedClock,
    tracked: HashMap<(Key, PartitionId), Tracked>,
}

impl CommandRedistributor {
    pub fn new(partition_id: PartitionId, retry_policy: RetryPolicy, clock: SharedClock) -> Self {
        Self {
            partition_id,
            retry_policy,
            clock,
            tracked: HashMap::new(),
        }
    }

    /// Starts the backoff of a command that was just sent to `target`.
    pub fn track_sent(&mut self, distribution_key: Key, target: PartitionId) {
        let mut backoff = self.retry_policy.clone().into_iter();
        let next_attempt = self.next_attempt(&mut backoff);
        self.tracked.insert(
            (distribution_key, target),
            Tracked {
                next_attempt,
                backoff,
            },
        );
    }

    /// Returns the distributions to send again now, ordered by distribution key, and
    /// advances their deadlines. Forgets distributions that were acknowledged meanwhile.
    pub fn due_retries(
        &mut self,
        distributions: &impl ReadOnlyDistributionTable,
    ) -> Result<Vec<(Key, PartitionId)>, StorageError> {
        let now = self.clock.now();
        let mut retriable = HashSet::new();
        let mut due = Vec::new();

        distributions.for_each_retriable(|distribution_key, target| {
            retriable.insert((distribution_key, target));
            match self.tracked.get(&(distribution_key, target)) {
                Some(tracked) if tracked.next_attempt > now => {}
                _ => due.push((distribution_key, target)),
            }
            Ok(true)
        })?;

        let before = self.tracked.len();
        self.tracked.retain(|record, _| retriable.contains(record));
        if before != self.tracked.len() {
            trace!(
                partition_id = %self.partition_id,
                "Forgot {} acknowledged distributions",
                before - self.tracked.len()
            );
        }

        for (distribution_key, target) in &due {
            match self.tracked.remove(&(*distribution_key, *target)) {
                Some(mut tracked) => {
                    tracked.next_attempt = self.next_attempt(&mut tracked.backoff);
                    self.tracked.insert((*distribution_key, *target), tracked);
                }
                None => self.track_sent(*distribution_key, *target),
            }
        }

        if !due.is_empty() {
            debug!(
                partition_id = %self.partition_id,
                "{} distributions are due for redelivery",
                due.len()
            );
        }
        Ok(due)
    }

    /// Number of distributions with a pending deadline.
    pub fn tracked_len(&self) -> usize {
        self.tracked.len()
    }

    pub fn clear(&mut self) {
        self.tracked.clear();
    }

    fn next_attempt(&self, backoff: &mut RetryIter<'static>) -> MillisSinceEpoch {
        // distribution policies never run out of attempts, the fallback keeps retrying at
        // the last interval anyway
        let delay = backoff
            .next_exact()
            .or_else(|| backoff.last_retry())
            .unwrap_or_default();
        self.clock.now().saturating_add(delay)
    }
}

impl std::fmt::Debug for CommandRedistributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRedistributor")
            .field("partition_id", &self.partition_id)
            .field("tracked", &self.tracked.len())
            .finish()
    }
}
