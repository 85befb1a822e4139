// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.


//! Thin wrapper around rocksdb shared by the log storage and the partition store.
//!
//! Every database is an [`OptimisticTransactionDB`] using the default column family only.
//! Potentially blocking operations are moved off the async worker threads.

mod background;
mod configuration;
mod db_manager;
mod db_spec;
mod error;
mod metric_definitions;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use rocksdb::checkpoint::Checkpoint;
use rocksdb::{MultiThreaded, OptimisticTransactionDB, WriteBatchWithTransaction};
use tokio::runtime::RuntimeFlavor;
use tracing::{debug, info, warn};

use keel_core::ShutdownError;

use self::background::{StorageTask, StorageTaskKind};
use self::metric_definitions::*;

// re-exports
pub use self::configuration::create_default_db_options;
pub use self::db_manager::*;
pub use self::db_spec::*;
pub use self::error::*;
pub use rocksdb;

pub type Db = OptimisticTransactionDB<MultiThreaded>;
pub type WriteBatch = WriteBatchWithTransaction<true>;

/// Denotes whether an operation is considered latency sensitive or not
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum Priority {
    High,
    #[default]
    Low,
}

impl Priority {
    pub fn as_static_str(&self) -> &'static str {
        self.into()
    }
}

/// Defines how to perform a potentially blocking rocksdb IO operation.
#[derive(Clone, Copy, Default, Debug, Eq, PartialEq)]
pub enum IoMode {
    /// [Dangerous] Allow blocking IO operation to happen in the worker thread (tokio)
    AllowBlockingIO,
    /// Fail the operation if operation needs to block on IO
    OnlyIfNonBlocking,
    /// Attempts to perform the operation without blocking IO in worker thread, if it's not
    /// possible, it'll spawn work in the background thread pool.
    #[default]
    Default,
}

#[derive(derive_more::Display)]
#[display("{}", name)]
pub struct RocksDb {
    manager: RocksDbManager,
    pub name: DbName,
    pub owner: Owner,
    pub path: PathBuf,
    pub db_options: rocksdb::Options,
    flush_on_shutdown: bool,
    db: Arc<Db>,
}

static_assertions::assert_impl_all!(RocksDb: Send, Sync);

impl fmt::Debug for RocksDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RocksDb({} at {})", self.name, self.path.display())
    }
}

impl RocksDb {
    pub(crate) fn new(manager: RocksDbManager, spec: DbSpec, db: Arc<Db>) -> Self {
        Self {
            manager,
            name: spec.name,
            owner: spec.owner,
            path: spec.path,
            db_options: spec.db_options,
            flush_on_shutdown: spec.flush_on_shutdown,
            db,
        }
    }

    /// Returns the raw rocksdb handle for reads, iteration and transactions.
    pub fn inner(&self) -> &Db {
        &self.db
    }

    #[tracing::instrument(skip_all, fields(db = %self.name))]
    pub async fn write_batch(
        &self,
        priority: Priority,
        io_mode: IoMode,
        mut write_options: rocksdb::WriteOptions,
        write_batch: WriteBatch,
    ) -> Result<(), RocksError> {
        //  depending on the IoMode, we decide how to do the write.
        match io_mode {
            IoMode::AllowBlockingIO => {
                debug!("Blocking IO is allowed for write_batch, stall detection will not be used in this operation!");
                write_options.set_no_slowdown(false);
                self.db.write_opt(write_batch, &write_options)?;
                self.record_io_op(DISPOSITION_MAYBE_BLOCKING, priority);
                return Ok(());
            }
            IoMode::OnlyIfNonBlocking => {
                write_options.set_no_slowdown(true);
                self.db.write_opt(write_batch, &write_options)?;
                self.record_io_op(DISPOSITION_NON_BLOCKING, priority);
                return Ok(());
            }
            IoMode::Default => {}
        }

        // First, attempt to write without blocking. A batch is consumed by a write, keep a
        // copy in case it has to be retried in the background.
        write_options.set_no_slowdown(true);
        let retry_batch = WriteBatch::from_data(write_batch.data());
        let result = block_in_place_if_possible(|| self.db.write_opt(write_batch, &write_options));
        match result {
            Ok(_) => {
                self.record_io_op(DISPOSITION_NON_BLOCKING, priority);
                Ok(())
            }
            Err(e) if is_retryable_error(e.kind()) => {
                self.record_io_op(DISPOSITION_MOVED_TO_BG, priority);
                // Operation will block, dispatch to background.
                let db = self.db.clone();
                // In the background we can block on IO
                write_options.set_no_slowdown(false);
                let task = self
                    .task(StorageTaskKind::WriteBatch, move || {
                        db.write_opt(retry_batch, &write_options)
                    })
                    .with_priority(priority);

                Ok(race_against_stall_detector(&self.manager, task).await??)
            }
            Err(e) => {
                self.record_io_op(DISPOSITION_FAILED, priority);
                Err(e.into())
            }
        }
    }

    #[tracing::instrument(skip_all, fields(db = %self.name))]
    pub async fn flush_wal(&self, sync: bool) -> Result<(), RocksError> {
        let db = self.db.clone();
        let task = self.task(StorageTaskKind::FlushWal, move || db.flush_wal(sync));

        Ok(self.manager.async_spawn(task).await??)
    }

    #[tracing::instrument(skip_all, fields(db = %self.name))]
    pub async fn flush_memtables(&self, wait: bool) -> Result<(), RocksError> {
        let db = self.db.clone();
        let task = self.task(StorageTaskKind::FlushMemtables, move || {
            let mut flush_options = rocksdb::FlushOptions::default();
            flush_options.set_wait(wait);
            db.flush_opt(&flush_options)
        });
        Ok(self.manager.async_spawn(task).await??)
    }

    /// Creates a consistent, openable copy of the database at `target` using hard links
    /// where possible. `target` must not exist.
    #[tracing::instrument(skip_all, fields(db = %self.name, target = %target.as_ref().display()))]
    pub async fn checkpoint(&self, target: impl AsRef<Path>) -> Result<(), RocksError> {
        let target = target.as_ref().to_path_buf();
        if target.exists() {
            return Err(RocksError::CheckpointTargetExists(
                target.display().to_string(),
            ));
        }
        let db = self.db.clone();
        let task = self
            .task(StorageTaskKind::Checkpoint, move || {
                let checkpoint = Checkpoint::new(&*db)?;
                checkpoint.create_checkpoint(&target)
            })
            .with_priority(Priority::High);
        Ok(self.manager.async_spawn(task).await??)
    }

    /// Flushes and closes this database through its manager. Other holders of the
    /// database keep it open.
    pub async fn shutdown(self: Arc<Self>) {
        let manager = self.manager.clone();
        if let Err(db) = manager.close_db(self).await {
            debug!(db = %db.name, "Database is still in use, skipping close");
        }
    }

    pub(crate) fn close(&self) {
        if self.flush_on_shutdown {
            if let Err(e) = self.db.flush_wal(true) {
                warn!(db = %self.name, "Failed to flush rocksdb WAL: {}", e);
            }
            if let Err(e) = self.db.flush() {
                warn!(db = %self.name, "Failed to flush memtables: {}", e);
            }
        }
        self.db.cancel_all_background_work(true);
        debug!(db = %self.name, "Closed rocksdb database");
    }

    fn task<OP, R>(&self, kind: StorageTaskKind, op: OP) -> StorageTask<OP>
    where
        OP: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        StorageTask::new(kind, self.name.clone(), self.owner, op)
    }

    fn record_io_op(&self, disposition: &'static str, priority: Priority) {
        counter!(STORAGE_IO_OP,
            DISPOSITION => disposition,
            OP_TYPE => StorageTaskKind::WriteBatch.as_static_str(),
            PRIORITY => priority.as_static_str(),
        )
        .increment(1);
    }
}

fn is_retryable_error(error_kind: rocksdb::ErrorKind) -> bool {
    matches!(
        error_kind,
        rocksdb::ErrorKind::Incomplete | rocksdb::ErrorKind::TryAgain | rocksdb::ErrorKind::Busy
    )
}

/// Runs `op` on the current worker thread, telling a multi-threaded runtime to move its
/// other tasks away first.
fn block_in_place_if_possible<R>(op: impl FnOnce() -> R) -> R {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(op)
        }
        _ => op(),
    }
}

async fn race_against_stall_detector<OP, R>(
    manager: &RocksDbManager,
    task: StorageTask<OP>,
) -> Result<R, ShutdownError>
where
    OP: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let mut task = std::pin::pin!(manager.async_spawn(task));
    let mut stalled = false;
    let mut stalled_since = Instant::now();
    loop {
        tokio::select! {
            result = &mut task => {
                if stalled {
                    // reset the flare gauge
                    gauge!(ROCKSDB_STALL_FLARE).decrement(1);
                    let elapsed = stalled_since.elapsed();
                    histogram!(ROCKSDB_STALL_DURATION).record(elapsed);
                    info!("[Stall Detector] Rocksdb write operation completed after a stall time of {:?}!", elapsed);
                }
                return result;
            }
            _ = tokio::time::sleep(manager.stall_detection_duration()), if !stalled => {
                stalled = true;
                stalled_since = Instant::now();
                gauge!(ROCKSDB_STALL_FLARE).increment(1);
                warn!("[Stall Detector] Rocksdb write operation exceeded the stall threshold, will continue waiting");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;
    use keel_types::config::RocksDbOptions;
    use test_log::test;

    use super::*;

    fn spec(name: &str, path: &Path) -> DbSpec {
        DbSpecBuilder::default()
            .name(name)
            .path(path)
            .db_options(create_default_db_options(true))
            .flush_on_shutdown(true)
            .build()
            .unwrap()
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn write_read_and_checkpoint() -> googletest::Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = RocksDbManager::new(RocksDbOptions::default());
        let db = manager.open_db(spec("db", &dir.path().join("db"))).await?;

        let mut batch = WriteBatch::default();
        batch.put(b"k1", b"v1");
        batch.put(b"k2", b"v2");
        db.write_batch(
            Priority::High,
            IoMode::Default,
            rocksdb::WriteOptions::default(),
            batch,
        )
        .await?;
        assert_that!(db.inner().get(b"k1")?, some(eq(b"v1".to_vec())));

        let target = dir.path().join("checkpoint");
        db.checkpoint(&target).await?;
        assert!(matches!(
            db.checkpoint(&target).await,
            Err(RocksError::CheckpointTargetExists(_))
        ));

        let copy = manager.open_db(spec("copy", &target)).await?;
        assert_that!(copy.inner().get(b"k2")?, some(eq(b"v2".to_vec())));

        manager.shutdown().await;
        Ok(())
    }

    #[test(tokio::test)]
    async fn path_can_only_be_opened_once() -> googletest::Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = RocksDbManager::new(RocksDbOptions::default());
        let path = dir.path().join("db");
        let db = manager.open_db(spec("db", &path)).await?;
        assert!(matches!(
            manager.open_db(spec("db-again", &path)).await,
            Err(RocksError::AlreadyOpen)
        ));
        assert!(manager.get_db(&path).is_some());

        db.shutdown().await;
        assert!(manager.get_db(&path).is_none());

        // the lock was released
        let reopened = manager.open_db(spec("db", &path)).await?;
        manager.shutdown().await;
        drop(reopened);
        assert!(matches!(
            manager.open_db(spec("db", &path)).await,
            Err(RocksError::Shutdown(_))
        ));
        Ok(())
    }
}
