// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.


// Optional to have but adds description/help message to the metrics emitted to
// the metrics' sink.
use metrics::{describe_counter, describe_histogram, Unit};

pub const LOG_STREAM_APPEND: &str = "keel.log_stream.append.total";
pub const LOG_STREAM_APPEND_DURATION: &str = "keel.log_stream.append_duration.seconds";
pub const LOG_STREAM_APPEND_FAILED: &str = "keel.log_stream.append_failed.total";
pub const LOG_STREAM_READ_ENTRIES: &str = "keel.log_stream.read_entries.total";
pub const LOG_STREAM_COMPACT: &str = "keel.log_stream.compact.total";

pub const LOG_STORAGE_WRITE_BATCH_COUNT: &str = "keel.log_storage.write_batch_count";
pub const LOG_STORAGE_WRITE_BATCH_SIZE_BYTES: &str = "keel.log_storage.write_batch_size_bytes";

pub(crate) fn describe_metrics() {
    describe_counter!(
        LOG_STREAM_APPEND,
        Unit::Count,
        "Number of entries appended to log streams"
    );

    describe_histogram!(
        LOG_STREAM_APPEND_DURATION,
        Unit::Seconds,
        "Time from handing a block to the sequencer until it is committed"
    );

    describe_counter!(
        LOG_STREAM_APPEND_FAILED,
        Unit::Count,
        "Number of blocks that failed to be written"
    );

    describe_counter!(
        LOG_STREAM_READ_ENTRIES,
        Unit::Count,
        "Number of entries returned by log stream readers"
    );

    describe_counter!(
        LOG_STREAM_COMPACT,
        Unit::Count,
        "Number of compaction requests applied to log storages"
    );

    describe_histogram!(
        LOG_STORAGE_WRITE_BATCH_COUNT,
        Unit::Count,
        "Histogram of the number of blocks in a single local storage write batch"
    );

    describe_histogram!(
        LOG_STORAGE_WRITE_BATCH_SIZE_BYTES,
        Unit::Bytes,
        "Histogram of the size of local storage write batches"
    );
}
