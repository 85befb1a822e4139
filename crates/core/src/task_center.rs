// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{Future, FutureExt};
use metrics::counter;
use parking_lot::Mutex;
use tokio::task_local;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, error, info, instrument, trace, warn};

use keel_types::config::CommonOptions;
use keel_types::identifiers::PartitionId;

use crate::metric_definitions::{self, TC_FINISHED, TC_SPAWN, TC_STATUS_COMPLETED, TC_STATUS_FAILED};
use crate::{OnCancel, OnError, ShutdownError, TaskHandle, TaskId, TaskKind};

static WORKER_ID: AtomicUsize = const { AtomicUsize::new(0) };
static NEXT_TASK_ID: AtomicU64 = const { AtomicU64::new(0) };

const EXIT_CODE_FAILURE: i32 = 1;
/// After this long a cancelled task that is still running gets a log line.
const SLOW_CANCEL_WARNING: Duration = Duration::from_secs(2);

/// Who a running task is. Available to the task itself through task-local storage.
#[derive(Clone)]
struct TaskContext {
    id: TaskId,
    name: &'static str,
    kind: TaskKind,
    /// Set for tasks that belong to a partition, which allows cancelling all of them
    /// together.
    partition_id: Option<PartitionId>,
    cancellation_token: CancellationToken,
}

task_local! {
    static CONTEXT: TaskContext;
}

#[derive(Debug, thiserror::Error)]
pub enum TaskCenterBuildError {
    #[error("failed building the tokio runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

/// Builds a [`TaskCenter`]. A process runs a single one, tests may create several.
#[derive(Default)]
pub struct TaskCenterBuilder {
    runtime_handle: Option<tokio::runtime::Handle>,
    options: Option<CommonOptions>,
    #[cfg(any(test, feature = "test-util"))]
    pause_time: bool,
}

impl TaskCenterBuilder {
    /// Spawns tasks on an existing runtime instead of creating one.
    pub fn default_runtime_handle(mut self, handle: tokio::runtime::Handle) -> Self {
        self.runtime_handle = Some(handle);
        self
    }

    pub fn options(mut self, options: CommonOptions) -> Self {
        self.options = Some(options);
        self
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn pause_time(mut self, pause_time: bool) -> Self {
        self.pause_time = pause_time;
        self
    }

    /// A task center running on the current (test) runtime.
    #[cfg(any(test, feature = "test-util"))]
    pub fn default_for_tests() -> Self {
        Self::default().default_runtime_handle(tokio::runtime::Handle::current())
    }

    pub fn build(self) -> Result<TaskCenter, TaskCenterBuildError> {
        let options = self.options.unwrap_or_default();
        let (runtime_handle, runtime) = match self.runtime_handle {
            Some(handle) => (handle, None),
            None => {
                let mut builder = tokio::runtime::Builder::new_multi_thread();
                builder
                    .enable_all()
                    .worker_threads(options.default_thread_pool_size())
                    .thread_name_fn(|| {
                        format!("kl:worker-{}", WORKER_ID.fetch_add(1, Ordering::Relaxed))
                    });
                #[cfg(any(test, feature = "test-util"))]
                if self.pause_time {
                    builder.start_paused(true);
                }
                let runtime = builder.build()?;
                (runtime.handle().clone(), Some(runtime))
            }
        };

        metric_definitions::describe_metrics();
        Ok(TaskCenter {
            inner: Arc::new(TaskCenterInner {
                runtime_handle,
                _runtime: runtime,
                shutdown_timeout: *options.shutdown_timeout,
                shutdown_completed: CancellationToken::new(),
                shutdown_requested: AtomicBool::new(false),
                exit_code: AtomicI32::new(0),
                tasks: Mutex::new(HashMap::new()),
            }),
        })
    }
}

struct TaskCenterInner {
    runtime_handle: tokio::runtime::Handle,
    /// Keeps an owned runtime alive for as long as the task center lives.
    _runtime: Option<tokio::runtime::Runtime>,
    shutdown_timeout: Duration,
    shutdown_completed: CancellationToken,
    shutdown_requested: AtomicBool,
    exit_code: AtomicI32,
    tasks: Mutex<HashMap<TaskId, ManagedTask>>,
}

struct ManagedTask {
    context: TaskContext,
    /// Taken by whoever cancels the task first.
    handle: Option<TaskHandle<()>>,
}

/// Owns every long running task of a node: spawns them, cancels them by kind or partition
/// and reacts to their failures.
#[derive(Clone)]
pub struct TaskCenter {
    inner: Arc<TaskCenterInner>,
}

static_assertions::assert_impl_all!(TaskCenter: Send, Sync, Clone);

impl TaskCenter {
    /// Completes once a requested shutdown finished.
    pub fn watch_shutdown(&self) -> WaitForCancellationFutureOwned {
        self.inner.shutdown_completed.clone().cancelled_owned()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.inner.shutdown_requested.load(Ordering::Relaxed)
    }

    /// The exit code the process should exit with.
    pub fn exit_code(&self) -> i32 {
        self.inner.exit_code.load(Ordering::Relaxed)
    }

    /// Number of tasks that are still running.
    pub fn managed_tasks_count(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    /// Spawns a task. It runs until its future completes or it is cancelled.
    pub fn spawn<F>(
        &self,
        kind: TaskKind,
        name: &'static str,
        partition_id: Option<PartitionId>,
        future: F,
    ) -> Result<TaskId, ShutdownError>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.spawn_with_token(kind, name, partition_id, CancellationToken::new(), future)
    }

    /// Spawns a task that is cancelled together with the calling task. Outside of a task
    /// this is the same as [`TaskCenter::spawn`].
    pub fn spawn_child<F>(
        &self,
        kind: TaskKind,
        name: &'static str,
        partition_id: Option<PartitionId>,
        future: F,
    ) -> Result<TaskId, ShutdownError>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let token = CONTEXT
            .try_with(|parent| parent.cancellation_token.child_token())
            .unwrap_or_default();
        self.spawn_with_token(kind, name, partition_id, token, future)
    }

    fn spawn_with_token<F>(
        &self,
        kind: TaskKind,
        name: &'static str,
        partition_id: Option<PartitionId>,
        cancellation_token: CancellationToken,
        future: F,
    ) -> Result<TaskId, ShutdownError>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.is_shutdown_requested() {
            return Err(ShutdownError);
        }
        let id = TaskId::from(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed));
        let context = TaskContext {
            id,
            name,
            kind,
            partition_id,
            cancellation_token: cancellation_token.clone(),
        };

        let kind_label: &'static str = kind.into();
        counter!(TC_SPAWN, "kind" => kind_label).increment(1);

        // registered before the task can finish, its exit looks itself up in `tasks`
        let mut tasks = self.inner.tasks.lock();
        let join_handle = self
            .inner
            .runtime_handle
            .spawn(run_managed(self.clone(), context.clone(), future));
        tasks.insert(
            id,
            ManagedTask {
                context,
                handle: Some(TaskHandle {
                    cancellation_token,
                    join_handle,
                }),
            },
        );
        trace!(%kind, name, %id, ?partition_id, "Spawned task");
        Ok(id)
    }

    /// Requests cancellation of a single task and hands out its handle. Returns `None` if
    /// the task finished or is being cancelled by someone else. The caller is responsible
    /// for awaiting the handle.
    pub fn cancel_task(&self, id: TaskId) -> Option<TaskHandle<()>> {
        let mut tasks = self.inner.tasks.lock();
        let task = tasks.get_mut(&id)?;
        task.context.cancellation_token.cancel();
        task.handle.take()
    }

    /// Cancels every task that matches `kind` and `partition_id`, `None` matching all. Waits
    /// for tasks whose kind waits on cancellation, at most for the shutdown timeout.
    pub async fn cancel_tasks(&self, kind: Option<TaskKind>, partition_id: Option<PartitionId>) {
        let victims: Vec<_> = {
            let mut tasks = self.inner.tasks.lock();
            tasks
                .values_mut()
                .filter(|task| {
                    kind.map_or(true, |kind| task.context.kind == kind)
                        && partition_id.map_or(true, |id| task.context.partition_id == Some(id))
                })
                .filter_map(|task| {
                    task.context.cancellation_token.cancel();
                    task.handle
                        .take()
                        .map(|handle| (task.context.clone(), handle))
                })
                .collect()
        };

        for (context, mut handle) in victims {
            match context.kind.on_cancel() {
                OnCancel::Abort => {
                    debug!(kind = %context.kind, name = context.name, id = %context.id, "Aborting task");
                    handle.abort();
                }
                OnCancel::Wait => {
                    if tokio::time::timeout(SLOW_CANCEL_WARNING, &mut handle)
                        .await
                        .is_ok()
                    {
                        continue;
                    }
                    info!(kind = %context.kind, name = context.name, id = %context.id, "Waiting for task to stop");
                    let remaining = self.inner.shutdown_timeout.saturating_sub(SLOW_CANCEL_WARNING);
                    if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                        warn!(kind = %context.kind, name = context.name, id = %context.id, "Task did not stop in time, aborting it");
                        handle.abort();
                    }
                }
            }
        }
    }

    /// Cancels all tasks and marks the node as shut down. Only the first call has an effect.
    #[instrument(level = "error", skip(self, exit_code))]
    pub async fn shutdown_node(&self, reason: &str, exit_code: i32) {
        if self
            .inner
            .shutdown_requested
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let start = Instant::now();
        self.inner.exit_code.store(exit_code, Ordering::Relaxed);
        if exit_code == 0 {
            info!("Shutdown requested");
        } else {
            warn!("Shutdown requested");
        }

        self.cancel_tasks(None, None).await;
        self.inner.shutdown_completed.cancel();
        info!("Shutdown completed in {:?}", start.elapsed());
    }

    async fn on_finish(
        &self,
        context: TaskContext,
        result: Result<anyhow::Result<()>, Box<dyn std::any::Any + Send>>,
    ) {
        if self.inner.tasks.lock().remove(&context.id).is_none() {
            return;
        }
        let kind_label: &'static str = context.kind.into();

        let failure = match result {
            Ok(Ok(())) => {
                trace!(kind = %context.kind, name = context.name, id = %context.id, "Task finished");
                counter!(TC_FINISHED, "kind" => kind_label, "status" => TC_STATUS_COMPLETED)
                    .increment(1);
                return;
            }
            Ok(Err(err)) if err.root_cause().downcast_ref::<ShutdownError>().is_some() => {
                debug!(kind = %context.kind, name = context.name, id = %context.id, "Task stopped by shutdown");
                return;
            }
            Ok(Err(err)) => format!("failed: {err:?}"),
            Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
        };
        counter!(TC_FINISHED, "kind" => kind_label, "status" => TC_STATUS_FAILED).increment(1);

        match context.kind.on_error() {
            OnError::Log => {
                error!(kind = %context.kind, name = context.name, id = %context.id, "Task {failure}");
            }
            OnError::Shutdown => {
                error!(kind = %context.kind, name = context.name, id = %context.id, "Shutting down, task {failure}");
                self.shutdown_node(
                    &format!("task {} failed", context.name),
                    EXIT_CODE_FAILURE,
                )
                .await;
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}

/// Body of every managed task: runs `future` with its context installed and reports the
/// outcome, panics included.
async fn run_managed<F>(task_center: TaskCenter, context: TaskContext, future: F)
where
    F: Future<Output = anyhow::Result<()>>,
{
    trace!(kind = %context.kind, name = context.name, id = %context.id, "Starting task");
    let result = CONTEXT
        .scope(context.clone(), AssertUnwindSafe(future).catch_unwind())
        .await;
    task_center.on_finish(context, result).await;
}

/// Kind of the current task, `None` outside of task center tasks.
pub fn current_task_kind() -> Option<TaskKind> {
    CONTEXT.try_with(|ctx| ctx.kind).ok()
}

/// Partition of the current task, if it belongs to one.
pub fn current_task_partition_id() -> Option<PartitionId> {
    CONTEXT.try_with(|ctx| ctx.partition_id).ok().flatten()
}

/// Completes once the current task is asked to stop, either on its own or because its
/// parent or the node is stopping. Never completes outside of task center tasks.
pub async fn cancellation_watcher() {
    cancellation_token().cancelled().await;
}

/// The cancellation token of the current task. Outside of task center tasks this is a
/// token nobody cancels.
pub fn cancellation_token() -> CancellationToken {
    CONTEXT
        .try_with(|ctx| ctx.cancellation_token.clone())
        .unwrap_or_default()
}

pub fn is_cancellation_requested() -> bool {
    CONTEXT
        .try_with(|ctx| ctx.cancellation_token.is_cancelled())
        .unwrap_or(false)
}
