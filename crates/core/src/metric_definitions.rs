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

pub(crate) const TC_SPAWN: &str = "keel.task_center.spawned.total";
pub(crate) const TC_FINISHED: &str = "keel.task_center.finished.total";

pub(crate) const ACTOR_MESSAGES: &str = "keel.actor.messages.total";
pub(crate) const ACTOR_TIMERS_FIRED: &str = "keel.actor.timers_fired.total";
pub(crate) const ACTOR_TURN_DURATION: &str = "keel.actor.turn_duration.seconds";

// values of label `status` in TC_FINISHED
pub(crate) const TC_STATUS_COMPLETED: &str = "Completed";
pub(crate) const TC_STATUS_FAILED: &str = "Failed";

pub(crate) fn describe_metrics() {
    describe_counter!(
        TC_SPAWN,
        Unit::Count,
        "Total tasks spawned by the task center"
    );
    describe_counter!(
        TC_FINISHED,
        Unit::Count,
        "Number of tasks that finished with 'status'"
    );
    describe_counter!(
        ACTOR_MESSAGES,
        Unit::Count,
        "Number of mailbox messages handled by actors, by 'actor'"
    );
    describe_counter!(
        ACTOR_TIMERS_FIRED,
        Unit::Count,
        "Number of scheduled messages delivered to actors, by 'actor'"
    );
    describe_histogram!(
        ACTOR_TURN_DURATION,
        Unit::Seconds,
        "Time spent in a single actor turn, by 'actor'"
    );
}
