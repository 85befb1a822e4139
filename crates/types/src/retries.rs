// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Retry policies. Command distribution uses them to space out redeliveries and the
//! exporter director uses them to retry failed exports.

use std::borrow::Cow;
use std::cmp;
use std::num::NonZeroUsize;
use std::time::Duration;

use rand::Rng;
use serde_with::serde_as;

const DEFAULT_JITTER_MULTIPLIER: f32 = 0.3;

/// This struct represents the policy to execute retries.
///
/// ```rust
/// use std::time::Duration;
/// use keel_types::retries::RetryPolicy;
///
/// let retry_policy = RetryPolicy::fixed_delay(Duration::from_millis(100), Some(10));
/// let mut retry_iter = retry_policy.into_iter();
///
/// loop {
/// # let operation_succeeded = true;
///     if operation_succeeded {
///         break;
///     }
///     if let Some(next_timer) = retry_iter.next() {
///         // Sleep for next_timer
///     } else {
///         // Retries exhausted
///         break;
///     }
/// }
/// ```
#[serde_as]
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "kebab-case"
)]
pub enum RetryPolicy {
    /// # None
    ///
    /// No retry strategy.
    #[default]
    None,
    /// # Fixed delay
    ///
    /// Retry with a fixed delay strategy.
    FixedDelay {
        /// # Interval
        ///
        /// Interval between retries.
        ///
        /// Can be configured using the [`humantime`](https://docs.rs/humantime/latest/humantime/fn.parse_duration.html) format.
        #[serde_as(as = "serde_with::DisplayFromStr")]
        interval: humantime::Duration,
        /// # Max attempts
        ///
        /// Number of maximum attempts before giving up. Infinite retries if unset.
        max_attempts: Option<NonZeroUsize>,
    },
    /// # Exponential
    ///
    /// Retry with an exponential strategy. The next retry is computed as
    /// `min(last_retry_interval * factor, max_interval)`.
    Exponential {
        /// # Initial Interval
        ///
        /// Initial interval for the first retry attempt.
        #[serde_as(as = "serde_with::DisplayFromStr")]
        initial_interval: humantime::Duration,

        /// # Factor
        ///
        /// The factor to use to compute the next retry attempt.
        factor: f32,

        /// # Max attempts
        ///
        /// Number of maximum attempts before giving up. Infinite retries if unset.
        max_attempts: Option<NonZeroUsize>,

        /// # Max interval
        ///
        /// Maximum interval between retries.
        #[serde_as(as = "Option<serde_with::DisplayFromStr>")]
        max_interval: Option<humantime::Duration>,
    },
}

impl RetryPolicy {
    pub fn fixed_delay(interval: Duration, max_attempts: Option<usize>) -> Self {
        Self::FixedDelay {
            interval: interval.into(),
            max_attempts: max_attempts.and_then(NonZeroUsize::new),
        }
    }

    pub fn exponential(
        initial_interval: Duration,
        factor: f32,
        max_attempts: Option<usize>,
        max_interval: Option<Duration>,
    ) -> Self {
        Self::Exponential {
            initial_interval: initial_interval.into(),
            factor,
            max_attempts: max_attempts.and_then(NonZeroUsize::new),
            max_interval: max_interval.map(Into::into),
        }
    }

    pub fn max_attempts(&self) -> Option<NonZeroUsize> {
        match self {
            RetryPolicy::None => None,
            RetryPolicy::FixedDelay { max_attempts, .. }
            | RetryPolicy::Exponential { max_attempts, .. } => *max_attempts,
        }
    }

    pub fn iter(&self) -> RetryIter<'_> {
        RetryIter {
            policy: Cow::Borrowed(self),
            attempts: 0,
            last_retry: None,
        }
    }
}

impl IntoIterator for RetryPolicy {
    type Item = Duration;
    type IntoIter = RetryIter<'static>;

    fn into_iter(self) -> Self::IntoIter {
        RetryIter {
            policy: Cow::Owned(self),
            attempts: 0,
            last_retry: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryIter<'a> {
    policy: Cow<'a, RetryPolicy>,
    attempts: usize,
    last_retry: Option<Duration>,
}

impl RetryIter<'_> {
    /// The number of attempts on this retry iterator so far
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn last_retry(&self) -> Option<Duration> {
        self.last_retry
    }

    /// Peeks the next delay without adding jitter
    pub fn peek_next(&self) -> Option<Duration> {
        self.compute_next().map(|(delay, _)| delay)
    }

    /// Advances the iterator and returns the next delay without jitter. Use this when
    /// the caller needs deterministic deadlines, e.g. when driven by a test clock.
    pub fn next_exact(&mut self) -> Option<Duration> {
        let (delay, remember) = self.compute_next()?;
        self.attempts += 1;
        if remember {
            self.last_retry = Some(delay);
        }
        Some(delay)
    }

    /// Returns the next delay and whether it should become the new base of the
    /// exponential growth.
    fn compute_next(&self) -> Option<(Duration, bool)> {
        let exhausted = |max_attempts: &Option<NonZeroUsize>| {
            max_attempts.is_some_and(|limit| (self.attempts + 1) > limit.into())
        };
        match self.policy.as_ref() {
            RetryPolicy::None => None,
            RetryPolicy::FixedDelay {
                interval,
                max_attempts,
            } => (!exhausted(max_attempts)).then_some((**interval, false)),
            RetryPolicy::Exponential {
                initial_interval,
                factor,
                max_attempts,
                max_interval,
            } => {
                if exhausted(max_attempts) {
                    return None;
                }
                let next = match self.last_retry {
                    Some(last) => cmp::min(
                        last.mul_f32(*factor),
                        max_interval.map(Into::into).unwrap_or(Duration::MAX),
                    ),
                    None => **initial_interval,
                };
                Some((next, true))
            }
        }
    }
}

impl Iterator for RetryIter<'_> {
    type Item = Duration;

    /// adds up to 1/3 target duration as jitter
    fn next(&mut self) -> Option<Self::Item> {
        self.next_exact()
            .map(|delay| with_jitter(delay, DEFAULT_JITTER_MULTIPLIER))
    }
}

// Jitter is a random duration added to the desired target, it ranges from 3ms to
// (max_multiplier * duration) of the original requested delay. The minimum of +3ms
// is to avoid falling into common zero-ending values (0, 10, 100, etc.) which are
// common cause of harmonics in systems (avoiding resonance frequencies)
static MIN_JITTER: Duration = Duration::from_millis(3);

pub fn with_jitter(duration: Duration, max_multiplier: f32) -> Duration {
    let max_jitter = duration.mul_f32(max_multiplier);
    if max_jitter <= MIN_JITTER {
        // We can't get a random value unless max_jitter is higher than MIN_JITTER.
        duration + MIN_JITTER
    } else {
        let jitter = rand::rng().random_range(MIN_JITTER..max_jitter);
        duration + jitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_retry_policy() {
        assert_eq!(
            Vec::<Duration>::new(),
            RetryPolicy::None.into_iter().collect::<Vec<_>>()
        )
    }

    #[test]
    fn fixed_delay_retry_policy() {
        let actuals = RetryPolicy::fixed_delay(Duration::from_millis(100), Some(10))
            .into_iter()
            .collect::<Vec<_>>();
        assert_eq!(10, actuals.len());
        for actual in actuals {
            assert!(within_jitter(Duration::from_millis(100), actual));
        }
    }

    #[test]
    fn exponential_retry_policy_is_capped() {
        let policy = RetryPolicy::exponential(
            Duration::from_millis(100),
            2.0,
            Some(6),
            Some(Duration::from_millis(500)),
        );
        let mut iter = policy.iter();
        let mut peeked = Vec::new();
        while let Some(next) = iter.peek_next() {
            peeked.push(next);
            let actual = iter.next().unwrap();
            assert!(within_jitter(*peeked.last().unwrap(), actual));
        }
        assert_eq!(
            vec![100, 200, 400, 500, 500, 500],
            peeked.iter().map(|d| d.as_millis()).collect::<Vec<_>>()
        );
        assert_eq!(6, iter.attempts());
    }

    #[test]
    fn exponential_without_limit_never_ends() {
        let policy = RetryPolicy::exponential(Duration::from_secs(10), 2.0, None, None);
        assert_eq!(1000, policy.into_iter().take(1000).count());
    }

    #[test]
    fn serde_uses_humantime() {
        let policy: RetryPolicy = serde_json::from_str(
            r#"{"type":"exponential","initial-interval":"10s","factor":2.0,"max-attempts":null,"max-interval":"5m"}"#,
        )
        .unwrap();
        assert_eq!(
            RetryPolicy::exponential(
                Duration::from_secs(10),
                2.0,
                None,
                Some(Duration::from_secs(300))
            ),
            policy
        );
    }

    fn within_jitter(expected: Duration, actual: Duration) -> bool {
        let max_jitter = cmp::max(expected.mul_f32(DEFAULT_JITTER_MULTIPLIER), MIN_JITTER);
        actual >= expected && actual <= expected + max_jitter
    }
}
