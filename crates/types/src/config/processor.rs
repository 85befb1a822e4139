// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use super::InvalidConfigurationError;
use crate::retries::RetryPolicy;

/// # Stream processor options
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, derive_builder::Builder)]
#[serde(rename_all = "kebab-case", default)]
#[builder(default)]
pub struct StreamProcessorOptions {
    /// # Internal queue for stream processor communication
    ///
    /// Capacity of the mailbox through which the stream processor receives control
    /// requests (pause, resume, snapshot, close).
    pub internal_queue_length: NonZeroUsize,

    /// # Snapshot interval
    ///
    /// If set, the stream processor takes a snapshot of its partition store
    /// periodically. Snapshots can always be requested on demand.
    ///
    /// Can be configured using the [`humantime`](https://docs.rs/humantime/latest/humantime/fn.parse_duration.html) format.
    #[serde_as(as = "Option<serde_with::DisplayFromStr>")]
    #[builder(setter(strip_option))]
    pub snapshot_interval: Option<humantime::Duration>,

    /// # Retained snapshots
    ///
    /// The number of valid snapshots kept per partition. Older snapshots are deleted
    /// once a newer one has been persisted.
    pub retain_snapshots: NonZeroUsize,

    /// # Compact log on snapshot
    ///
    /// Delete log entries covered by a snapshot once that snapshot has been persisted.
    pub compact_log_on_snapshot: bool,

    /// # Replay batch size
    ///
    /// The number of log entries read per replay transaction while recovering. Only the
    /// events among them are applied, but commands and rejections count towards it.
    pub replay_batch_size: NonZeroUsize,

    /// # Exporter retry policy
    ///
    /// Backoff between attempts to export the same entry. Once a limited policy is
    /// exhausted the entry is skipped by that exporter.
    pub exporter_retry_policy: RetryPolicy,
}

impl StreamProcessorOptions {
    pub fn validate(&self) -> Result<(), InvalidConfigurationError> {
        if self
            .snapshot_interval
            .is_some_and(|interval| interval.is_zero())
        {
            return Err(InvalidConfigurationError::ZeroValue(
                "processor.snapshot-interval",
            ));
        }
        Ok(())
    }
}

impl Default for StreamProcessorOptions {
    fn default() -> Self {
        Self {
            internal_queue_length: NonZeroUsize::new(1000).expect("non-zero"),
            snapshot_interval: None,
            retain_snapshots: NonZeroUsize::new(2).expect("non-zero"),
            compact_log_on_snapshot: false,
            replay_batch_size: NonZeroUsize::new(100).expect("non-zero"),
            exporter_retry_policy: RetryPolicy::exponential(
                Duration::from_millis(100),
                2.0,
                None,
                Some(Duration::from_secs(10)),
            ),
        }
    }
}
