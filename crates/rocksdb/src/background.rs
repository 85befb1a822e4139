// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::time::Instant;

use metrics::{counter, histogram};

use crate::metric_definitions::{
    STORAGE_BG_TASK_RUN_DURATION, STORAGE_BG_TASK_SPAWNED, STORAGE_BG_TASK_WAIT_DURATION,
};
use crate::{DbName, Owner, Priority};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum StorageTaskKind {
    OpenDb,
    WriteBatch,
    FlushWal,
    FlushMemtables,
    Checkpoint,
}

impl StorageTaskKind {
    pub fn as_static_str(&self) -> &'static str {
        self.into()
    }
}

/// A blocking operation on a database, run on tokio's blocking pool. Queueing and run
/// time are recorded per kind, owner and priority.
pub(crate) struct StorageTask<OP> {
    kind: StorageTaskKind,
    db_name: DbName,
    owner: Owner,
    priority: Priority,
    op: OP,
    enqueued_at: Instant,
}

impl<OP, R> StorageTask<OP>
where
    OP: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    pub fn new(kind: StorageTaskKind, db_name: DbName, owner: Owner, op: OP) -> Self {
        Self {
            kind,
            db_name,
            owner,
            priority: Priority::default(),
            op,
            enqueued_at: Instant::now(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn run(self) -> R {
        let kind = self.kind.as_static_str();
        let owner: &'static str = self.owner.into();
        let priority = self.priority.as_static_str();
        let db = self.db_name.to_string();
        counter!(STORAGE_BG_TASK_SPAWNED, "kind" => kind, "owner" => owner).increment(1);
        histogram!(
            STORAGE_BG_TASK_WAIT_DURATION,
            "kind" => kind,
            "db" => db.clone(),
            "priority" => priority,
        )
        .record(self.enqueued_at.elapsed());

        let start = Instant::now();
        let result = (self.op)();
        histogram!(
            STORAGE_BG_TASK_RUN_DURATION,
            "kind" => kind,
            "db" => db,
            "priority" => priority,
        )
        .record(start.elapsed());
        result
    }
}
