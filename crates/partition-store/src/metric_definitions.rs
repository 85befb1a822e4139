// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use metrics::{describe_counter, describe_histogram, Unit};

pub const PARTITION_STORE_COMMIT: &str = "keel.partition_store.commit.total";
pub const PARTITION_STORE_COMMIT_DURATION: &str = "keel.partition_store.commit_duration.seconds";
pub const PARTITION_STORE_SNAPSHOT: &str = "keel.partition_store.snapshot.total";
pub const PARTITION_STORE_MIGRATION: &str = "keel.partition_store.migration.total";

pub(crate) fn describe_metrics() {
    describe_counter!(
        PARTITION_STORE_COMMIT,
        Unit::Count,
        "Number of committed non-empty partition store transactions"
    );

    describe_histogram!(
        PARTITION_STORE_COMMIT_DURATION,
        Unit::Seconds,
        "Time spent writing a committed transaction"
    );

    describe_counter!(
        PARTITION_STORE_SNAPSHOT,
        Unit::Count,
        "Number of partition store checkpoints created"
    );

    describe_counter!(
        PARTITION_STORE_MIGRATION,
        Unit::Count,
        "Number of executed schema migration tasks"
    );
}
