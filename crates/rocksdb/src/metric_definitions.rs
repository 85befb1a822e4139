// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.


//! Metrics of the rocksdb layer. Descriptions are registered once by the
//! [`crate::RocksDbManager`].

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

pub const STORAGE_BG_TASK_SPAWNED: &str = "keel.rocksdb.storage_tasks.spawned.total";
pub const STORAGE_BG_TASK_WAIT_DURATION: &str = "keel.rocksdb.storage_tasks.queued.seconds";
pub const STORAGE_BG_TASK_RUN_DURATION: &str = "keel.rocksdb.storage_tasks.run.seconds";
pub const STORAGE_IO_OP: &str = "keel.rocksdb.write_batches.total";

pub const ROCKSDB_STALL_FLARE: &str = "keel.rocksdb.stalled_writes";
pub const ROCKSDB_STALL_DURATION: &str = "keel.rocksdb.stalled_writes.seconds";

// labels
pub const OP_TYPE: &str = "operation";
pub const PRIORITY: &str = "priority";
pub const DISPOSITION: &str = "disposition";

pub const DISPOSITION_MAYBE_BLOCKING: &str = "maybe-blocking";
pub const DISPOSITION_NON_BLOCKING: &str = "non-blocking";
pub const DISPOSITION_MOVED_TO_BG: &str = "moved-to-bg";
pub const DISPOSITION_FAILED: &str = "failed";

pub fn describe_metrics() {
    describe_counter!(
        STORAGE_BG_TASK_SPAWNED,
        Unit::Count,
        "Storage tasks handed to the blocking pool, by kind and owner"
    );
    describe_histogram!(
        STORAGE_BG_TASK_WAIT_DURATION,
        Unit::Seconds,
        "Time a storage task waited for a blocking thread"
    );
    describe_histogram!(
        STORAGE_BG_TASK_RUN_DURATION,
        Unit::Seconds,
        "Time a storage task ran on its blocking thread"
    );
    describe_counter!(
        STORAGE_IO_OP,
        Unit::Count,
        "Committed write batches, by disposition: maybe-blocking, non-blocking, moved-to-bg or failed"
    );
    describe_gauge!(
        ROCKSDB_STALL_FLARE,
        Unit::Count,
        "Writes currently exceeding the stall threshold"
    );
    describe_histogram!(
        ROCKSDB_STALL_DURATION,
        Unit::Seconds,
        "Total duration of writes that exceeded the stall threshold"
    );
}
