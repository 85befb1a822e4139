// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use super::InvalidConfigurationError;
use crate::retries::RetryPolicy;

/// Interval at which the redistributor looks for records that are due.
pub const DEFAULT_REDISTRIBUTION_INTERVAL: Duration = Duration::from_secs(10);
/// Delay before the first redelivery of an unacknowledged command.
pub const DEFAULT_REDISTRIBUTION_INITIAL_BACKOFF: Duration = Duration::from_secs(10);
/// Upper bound of the delay between two redeliveries of the same command.
pub const DEFAULT_REDISTRIBUTION_MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);
/// Growth factor of the delay between redeliveries.
pub const DEFAULT_REDISTRIBUTION_BACKOFF_FACTOR: f32 = 2.0;

/// # Command distribution options
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, derive_builder::Builder)]
#[serde(rename_all = "kebab-case", default)]
#[builder(default)]
pub struct CommandDistributionOptions {
    /// # Redistribution interval
    ///
    /// How often the stream processor checks for unacknowledged distributions that
    /// are due for redelivery.
    ///
    /// Can be configured using the [`humantime`](https://docs.rs/humantime/latest/humantime/fn.parse_duration.html) format.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub redistribution_interval: humantime::Duration,

    /// # Retry policy
    ///
    /// Backoff between redeliveries of the same distributed command. The policy must not
    /// limit the number of attempts: a distribution is only ever resolved by an
    /// acknowledgement of the receiving partition.
    pub retry_policy: RetryPolicy,
}

impl CommandDistributionOptions {
    pub fn validate(&self) -> Result<(), InvalidConfigurationError> {
        if self.redistribution_interval.is_zero() {
            return Err(InvalidConfigurationError::ZeroValue(
                "distribution.redistribution-interval",
            ));
        }
        if self.retry_policy == RetryPolicy::None || self.retry_policy.max_attempts().is_some() {
            return Err(InvalidConfigurationError::LimitedDistributionRetries);
        }
        Ok(())
    }
}

impl Default for CommandDistributionOptions {
    fn default() -> Self {
        Self {
            redistribution_interval: DEFAULT_REDISTRIBUTION_INTERVAL.into(),
            retry_policy: RetryPolicy::exponential(
                DEFAULT_REDISTRIBUTION_INITIAL_BACKOFF,
                DEFAULT_REDISTRIBUTION_BACKOFF_FACTOR,
                None,
                Some(DEFAULT_REDISTRIBUTION_MAX_BACKOFF),
            ),
        }
    }
}
