// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

pub const PROCESSOR_COMMANDS_PROCESSED: &str = "keel.stream_processor.processed_commands.total";
pub const PROCESSOR_ENTRIES_SKIPPED: &str = "keel.stream_processor.skipped_entries.total";
pub const PROCESSOR_COMMANDS_REJECTED: &str = "keel.stream_processor.rejected_commands.total";
pub const PROCESSOR_PROCESSING_DURATION: &str = "keel.stream_processor.processing_duration.seconds";
pub const PROCESSOR_EVENTS_REPLAYED: &str = "keel.stream_processor.replayed_events.total";
pub const PROCESSOR_LAST_PROCESSED_POSITION: &str = "keel.stream_processor.last_processed_position";
pub const PROCESSOR_SNAPSHOT: &str = "keel.stream_processor.snapshot.total";
pub const PROCESSOR_SNAPSHOT_DURATION: &str = "keel.stream_processor.snapshot_duration.seconds";
pub const PROCESSOR_FAILED: &str = "keel.stream_processor.failed.total";

pub const DISTRIBUTION_SENT: &str = "keel.distribution.sent.total";
pub const DISTRIBUTION_REDISTRIBUTED: &str = "keel.distribution.redistributed.total";
pub const DISTRIBUTION_SEND_FAILED: &str = "keel.distribution.send_failed.total";

pub const EXPORTER_EXPORTED: &str = "keel.exporter.exported_entries.total";
pub const EXPORTER_FAILED: &str = "keel.exporter.failed_exports.total";

pub(crate) fn describe_metrics() {
    describe_counter!(
        PROCESSOR_COMMANDS_PROCESSED,
        Unit::Count,
        "Number of commands processed, including rejected ones"
    );
    describe_counter!(
        PROCESSOR_ENTRIES_SKIPPED,
        Unit::Count,
        "Number of entries the stream processor skipped"
    );
    describe_counter!(
        PROCESSOR_COMMANDS_REJECTED,
        Unit::Count,
        "Number of commands rejected by their processor"
    );
    describe_histogram!(
        PROCESSOR_PROCESSING_DURATION,
        Unit::Seconds,
        "Time from reading a command until its results were committed"
    );
    describe_counter!(
        PROCESSOR_EVENTS_REPLAYED,
        Unit::Count,
        "Number of events applied while replaying"
    );
    describe_gauge!(
        PROCESSOR_LAST_PROCESSED_POSITION,
        Unit::Count,
        "Position of the last processed command"
    );
    describe_counter!(
        PROCESSOR_SNAPSHOT,
        Unit::Count,
        "Number of persisted snapshots"
    );
    describe_histogram!(
        PROCESSOR_SNAPSHOT_DURATION,
        Unit::Seconds,
        "Time spent taking a snapshot"
    );
    describe_counter!(
        PROCESSOR_FAILED,
        Unit::Count,
        "Number of stream processors that transitioned to failed"
    );

    describe_counter!(
        DISTRIBUTION_SENT,
        Unit::Count,
        "Number of distributed commands handed to the inter-partition sender"
    );
    describe_counter!(
        DISTRIBUTION_REDISTRIBUTED,
        Unit::Count,
        "Number of distributed commands resent after their backoff expired"
    );
    describe_counter!(
        DISTRIBUTION_SEND_FAILED,
        Unit::Count,
        "Number of inter-partition sends that could not be delivered"
    );

    describe_counter!(
        EXPORTER_EXPORTED,
        Unit::Count,
        "Number of entries exported"
    );
    describe_counter!(
        EXPORTER_FAILED,
        Unit::Count,
        "Number of failed export attempts"
    );
}
