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
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use rocksdb::{MultiThreaded, OptimisticTransactionDB};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use keel_core::ShutdownError;
use keel_types::config::RocksDbOptions;

use crate::background::{StorageTask, StorageTaskKind};
use crate::configuration::apply_db_opts_from_config;
use crate::{metric_definitions, DbSpec, RocksDb, RocksError};

/// Write operations that wait longer than this on a stalled database are reported.
pub const DEFAULT_STALL_DETECTION_DURATION: Duration = Duration::from_secs(3);

/// Opens, tracks and closes the rocksdb databases of a node.
///
/// Cloning is cheap, all clones share the same registry.
#[derive(Clone, derive_more::Debug)]
#[debug("RocksDbManager")]
pub struct RocksDbManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    opts: RocksDbOptions,
    stall_detection_duration: Duration,
    dbs: RwLock<HashMap<PathBuf, Weak<RocksDb>>>,
    shutting_down: AtomicBool,
    close_db_tasks: TaskTracker,
}

impl RocksDbManager {
    pub fn new(opts: RocksDbOptions) -> Self {
        metric_definitions::describe_metrics();
        Self {
            inner: Arc::new(ManagerInner {
                opts,
                stall_detection_duration: DEFAULT_STALL_DETECTION_DURATION,
                dbs: RwLock::default(),
                shutting_down: AtomicBool::new(false),
                close_db_tasks: TaskTracker::default(),
            }),
        }
    }

    pub fn options(&self) -> &RocksDbOptions {
        &self.inner.opts
    }

    pub(crate) fn stall_detection_duration(&self) -> Duration {
        self.inner.stall_detection_duration
    }

    /// Returns the database open at `path`, if any.
    pub fn get_db(&self, path: impl AsRef<Path>) -> Option<Arc<RocksDb>> {
        let read_guard = self.inner.dbs.upgradable_read();
        let db = read_guard.get(path.as_ref())?.upgrade();
        if let Some(db) = db {
            Some(db)
        } else {
            // the database was dropped, clean up the stale entry
            let mut write_guard = parking_lot::RwLockUpgradableReadGuard::upgrade(read_guard);
            write_guard.remove(path.as_ref());
            None
        }
    }

    pub fn get_all_dbs(&self) -> Vec<Arc<RocksDb>> {
        self.inner
            .dbs
            .read()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub async fn open_db(&self, mut db_spec: DbSpec) -> Result<Arc<RocksDb>, RocksError> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(RocksError::Shutdown(ShutdownError));
        }
        if self.get_db(&db_spec.path).is_some() {
            return Err(RocksError::AlreadyOpen);
        }

        apply_db_opts_from_config(&mut db_spec.db_options, &self.inner.opts);

        let path = db_spec.path.clone();
        let db_options = db_spec.db_options.clone();
        let task = StorageTask::new(
            StorageTaskKind::OpenDb,
            db_spec.name.clone(),
            db_spec.owner,
            move || OptimisticTransactionDB::<MultiThreaded>::open(&db_options, &path),
        );
        let db = self.async_spawn(task).await??;

        let wrapper = Arc::new(RocksDb::new(self.clone(), db_spec, Arc::new(db)));
        let mut guard = self.inner.dbs.write();
        if guard.get(&wrapper.path).and_then(Weak::upgrade).is_some() {
            // lost a race against another open of the same path
            return Err(RocksError::AlreadyOpen);
        }
        guard.insert(wrapper.path.clone(), Arc::downgrade(&wrapper));
        drop(guard);

        debug!(
            db = %wrapper.name,
            path = %wrapper.path.display(),
            "Opened rocksdb database"
        );
        Ok(wrapper)
    }

    /// Closes the database once the caller held the last reference. Returns the database
    /// back if it's still shared.
    pub async fn close_db(&self, db: Arc<RocksDb>) -> Result<(), Arc<RocksDb>> {
        let db = Arc::try_unwrap(db)?;
        self.inner.dbs.write().remove(&db.path);
        let name = db.name.clone();
        let handle = self.inner.close_db_tasks.spawn_blocking(move || {
            db.close();
        });
        if handle.await.is_err() {
            warn!(db = %name, "Closing rocksdb database panicked");
        }
        Ok(())
    }

    /// Flushes and closes every open database. Further attempts to open databases fail.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        self.inner.close_db_tasks.close();
        let dbs: Vec<_> = self.inner.dbs.write().drain().collect();
        for (_, db) in dbs {
            let Some(db) = db.upgrade() else {
                continue;
            };
            self.inner.close_db_tasks.spawn_blocking(move || {
                db.close();
            });
        }
        self.inner.close_db_tasks.wait().await;
        info!("Rocksdb manager shutdown completed");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Runs `task` on the blocking pool unless the manager is shutting down.
    pub(crate) async fn async_spawn<OP, R>(&self, task: StorageTask<OP>) -> Result<R, ShutdownError>
    where
        OP: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(ShutdownError);
        }
        tokio::task::spawn_blocking(move || task.run())
            .await
            .map_err(|_| ShutdownError)
    }
}
