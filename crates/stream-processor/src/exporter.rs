// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Hands committed log entries to external consumers.
//!
//! The [`ExporterDirector`] runs as its own task next to the stream processor and follows
//! the committed prefix of the log stream. A slow or failing exporter delays exporting,
//! never processing.

use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use keel_core::{cancellation_watcher, ShutdownError, TaskCenter, TaskId, TaskKind};
use keel_log_stream::{LogStream, LogStreamReader, ReadError};
use keel_types::logs::{LoggedEntry, Position, SequenceNumber};
use keel_types::retries::RetryPolicy;
use keel_types::PartitionId;

use crate::metric_definitions::{EXPORTER_EXPORTED, EXPORTER_FAILED};

#[async_trait]
pub trait Exporter: Send + 'static {
    fn name(&self) -> &'static str;

    /// Exports one entry. Entries arrive in log order; an entry may be exported again
    /// after a failed attempt or a restart.
    async fn export(&mut self, entry: &LoggedEntry) -> anyhow::Result<()>;
}

static_assertions::assert_obj_safe!(Exporter);

pub struct ExporterDirector {
    partition_id: PartitionId,
    reader: LogStreamReader,
    exporters: Vec<Box<dyn Exporter>>,
    retry_policy: RetryPolicy,
    exported: watch::Sender<Option<Position>>,
}

impl ExporterDirector {
    /// Starts exporting the entries after `start_after`, or from the first entry.
    pub fn start(
        task_center: &TaskCenter,
        log_stream: &LogStream,
        start_after: Option<Position>,
        exporters: Vec<Box<dyn Exporter>>,
        retry_policy: RetryPolicy,
    ) -> Result<ExporterDirectorHandle, ExporterStartError> {
        let partition_id = log_stream.partition_id();
        let mut reader = log_stream.new_reader();
        match start_after {
            Some(position) => {
                reader.seek(position.next())?;
            }
            None => reader.seek_to_first()?,
        }

        let (exported, exported_rx) = watch::channel(start_after);
        let director = Self {
            partition_id,
            reader,
            exporters,
            retry_policy,
            exported,
        };
        let task_id = task_center.spawn(
            TaskKind::Exporter,
            "exporter-director",
            Some(partition_id),
            director.run(),
        )?;

        Ok(ExporterDirectorHandle {
            task_center: task_center.clone(),
            task_id,
            exported: exported_rx,
        })
    }

    async fn run(mut self) -> anyhow::Result<()> {
        info!(
            partition_id = %self.partition_id,
            exporters = self.exporters.len(),
            "Exporter director started"
        );
        let cancelled = cancellation_watcher();
        tokio::pin!(cancelled);

        loop {
            let entry = tokio::select! {
                _ = &mut cancelled => break,
                entry = self.reader.next_committed() => match entry {
                    Ok(entry) => entry,
                    Err(ReadError::Shutdown(_)) => break,
                    Err(err) => return Err(err.into()),
                },
            };

            for exporter in &mut self.exporters {
                export_with_retries(self.partition_id, exporter.as_mut(), &entry, &self.retry_policy)
                    .await;
            }
            self.exported.send_replace(Some(entry.position));
        }

        debug!(partition_id = %self.partition_id, "Exporter director stopped");
        Ok(())
    }
}

async fn export_with_retries(
    partition_id: PartitionId,
    exporter: &mut dyn Exporter,
    entry: &LoggedEntry,
    retry_policy: &RetryPolicy,
) {
    let mut retry_iter = retry_policy.iter();
    loop {
        match exporter.export(entry).await {
            Ok(()) => {
                counter!(EXPORTER_EXPORTED, "exporter" => exporter.name()).increment(1);
                return;
            }
            Err(err) => {
                counter!(EXPORTER_FAILED, "exporter" => exporter.name()).increment(1);
                match retry_iter.next() {
                    Some(delay) => {
                        debug!(
                            %partition_id,
                            exporter = exporter.name(),
                            position = %entry.position,
                            %err,
                            "Export failed, retrying in {:?}",
                            delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        warn!(
                            %partition_id,
                            exporter = exporter.name(),
                            position = %entry.position,
                            %err,
                            "Giving up exporting entry after {} attempts",
                            retry_iter.attempts() + 1
                        );
                        return;
                    }
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExporterStartError {
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}

/// Observes and stops a running [`ExporterDirector`].
#[derive(Debug)]
pub struct ExporterDirectorHandle {
    task_center: TaskCenter,
    task_id: TaskId,
    exported: watch::Receiver<Option<Position>>,
}

impl ExporterDirectorHandle {
    /// Position of the last entry every exporter has seen.
    pub fn exported_position(&self) -> Option<Position> {
        *self.exported.borrow()
    }

    pub fn watch_exported(&self) -> watch::Receiver<Option<Position>> {
        self.exported.clone()
    }

    /// Waits until every entry up to `position` was exported, or `timeout` elapsed.
    pub async fn wait_for_exported(&self, position: Position, timeout: Duration) -> bool {
        let mut exported = self.exported.clone();
        tokio::time::timeout(
            timeout,
            exported.wait_for(|exported| exported.is_some_and(|exported| exported >= position)),
        )
        .await
        .is_ok_and(|result| result.is_ok())
    }

    pub async fn stop(self) {
        if let Some(handle) = self.task_center.cancel_task(self.task_id) {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use test_log::test;

    use keel_core::{MockClock, TaskCenterBuilder};
    use keel_log_stream::storage::MemoryLogStorage;
    use keel_types::config::LogStreamOptions;
    use keel_types::logs::{Intent, LogAppendEntry, ValueType};

    use super::*;

    struct FlakyExporter {
        failures_left: usize,
        exported: Arc<Mutex<Vec<Position>>>,
    }

    #[async_trait]
    impl Exporter for FlakyExporter {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn export(&mut self, entry: &LoggedEntry) -> anyhow::Result<()> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                anyhow::bail!("not yet");
            }
            self.exported.lock().push(entry.position);
            Ok(())
        }
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn exports_committed_entries_in_order_despite_failures() -> googletest::Result<()> {
        let tc = TaskCenterBuilder::default_for_tests().build()?;
        let partition_id = PartitionId::new_unchecked(1);
        let log_stream = LogStream::open(
            partition_id,
            MemoryLogStorage::new(),
            Arc::new(MockClock::new()),
            &LogStreamOptions::default(),
        )
        .await?;

        let exported = Arc::new(Mutex::new(Vec::new()));
        let director = ExporterDirector::start(
            &tc,
            &log_stream,
            None,
            vec![Box::new(FlakyExporter {
                failures_left: 2,
                exported: exported.clone(),
            })],
            RetryPolicy::fixed_delay(Duration::from_millis(1), None),
        )?;

        let writer = log_stream.new_writer();
        let entry = || LogAppendEntry::command(None, ValueType::Job, Intent::new(0), "job");
        writer.try_write(vec![entry(), entry()], None).await?;
        let last = writer.try_write(vec![entry()], None).await?;

        assert!(
            director
                .wait_for_exported(last, Duration::from_secs(10))
                .await
        );
        assert_eq!(
            vec![Position::new(1), Position::new(2), Position::new(3)],
            *exported.lock()
        );

        director.stop().await;
        log_stream.close().await;
        tc.shutdown_node("test completed", 0).await;
        Ok(())
    }
}
