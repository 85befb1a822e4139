// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::ShutdownError;

#[derive(
    Clone,
    Copy,
    Debug,
    Hash,
    PartialEq,
    Eq,
    Ord,
    PartialOrd,
    derive_more::Display,
    derive_more::From,
)]
pub struct TaskId(u64);

/// What cancelling a task does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnCancel {
    /// Signal the task and wait until it returned. The task must watch
    /// [`cancellation_watcher`](crate::cancellation_watcher).
    Wait,
    /// Abort the task at its next await point.
    Abort,
}

/// What a task returning an error or panicking does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnError {
    Log,
    /// Shut down the whole node.
    Shutdown,
}

/// The kinds of tasks the [`TaskCenter`](crate::TaskCenter) runs. The kind decides how a
/// task is cancelled and how its failure is handled.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, strum::IntoStaticStr, strum::Display)]
pub enum TaskKind {
    /// The actor driving the stream processor of a partition. A failed processor reports
    /// its failure through its phase, other partitions keep running.
    StreamProcessor,
    /// Batches and commits appends of a local log storage. Without it nothing is durable,
    /// so its failure stops the node.
    LogStorageWriter,
    /// Replays committed entries into an exporter.
    Exporter,
    /// Any other actor.
    Actor,
    /// Short lived fire and forget work, e.g. sending a command to another partition.
    Disposable,
}

impl TaskKind {
    pub fn on_cancel(self) -> OnCancel {
        match self {
            TaskKind::Exporter | TaskKind::Disposable => OnCancel::Abort,
            TaskKind::StreamProcessor | TaskKind::LogStorageWriter | TaskKind::Actor => {
                OnCancel::Wait
            }
        }
    }

    pub fn on_error(self) -> OnError {
        match self {
            TaskKind::LogStorageWriter => OnError::Shutdown,
            TaskKind::StreamProcessor
            | TaskKind::Exporter
            | TaskKind::Actor
            | TaskKind::Disposable => OnError::Log,
        }
    }
}

/// A task spawned on the task center. Awaiting it waits for the task to return.
pub struct TaskHandle<T> {
    pub(crate) cancellation_token: CancellationToken,
    pub(crate) join_handle: tokio::task::JoinHandle<T>,
}

impl<T> TaskHandle<T> {
    /// Requests graceful cancellation.
    pub fn cancel(&self) {
        self.cancellation_token.cancel()
    }

    /// Aborts the task at its next await point.
    pub fn abort(&self) {
        self.join_handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, ShutdownError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.join_handle
            .poll_unpin(cx)
            .map(|result| result.map_err(|_| ShutdownError))
    }
}
