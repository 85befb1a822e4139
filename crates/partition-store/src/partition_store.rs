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
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use metrics::{counter, histogram};
use rocksdb::{DBAccess, DBRawIteratorWithThreadMode, PrefixRange, ReadOptions, WriteOptions};
use tracing::{debug, info};

use keel_rocksdb::{
    create_default_db_options, Db, DbName, DbSpecBuilder, IoMode, Owner, Priority, RocksDb,
    RocksDbManager,
};
use keel_types::storage::{StorageCodec, StorageEncode};
use keel_types::PartitionId;

use crate::keys::TableKey;
use crate::metric_definitions::{
    describe_metrics, PARTITION_STORE_COMMIT, PARTITION_STORE_COMMIT_DURATION,
    PARTITION_STORE_SNAPSHOT,
};
use crate::{Result, StorageError};

/// Read access shared by [`PartitionStore`] and [`PartitionStoreTransaction`]. Reads through a
/// transaction observe the transaction's own uncommitted writes.
pub trait StorageAccess {
    fn partition_id(&self) -> PartitionId;

    fn get_kv_raw<R>(
        &self,
        key: impl AsRef<[u8]>,
        f: impl FnOnce(Option<&[u8]>) -> Result<R>,
    ) -> Result<R>;

    /// Visits every entry whose key starts with `prefix` in key order, until `f` returns
    /// `false`.
    fn scan_prefix_raw(
        &self,
        prefix: impl AsRef<[u8]>,
        f: impl FnMut(&[u8], &[u8]) -> Result<bool>,
    ) -> Result<()>;
}

/// The state store of one partition. Column families are multiplexed in a single rocksdb
/// keyspace by their 2 byte [`KeyKind`](crate::keys::KeyKind) prefix.
///
/// All writes go through [`PartitionStore::transaction`], which requires exclusive access,
/// so only one writer transaction can be open per store handle.
#[derive(Clone)]
pub struct PartitionStore {
    partition_id: PartitionId,
    rocksdb: Arc<RocksDb>,
    disable_wal: bool,
}

impl std::fmt::Debug for PartitionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionStore")
            .field("partition_id", &self.partition_id)
            .field("path", &self.rocksdb.path)
            .finish()
    }
}

/// Opens the partition store rooted at `path`, creating an empty one if the directory holds
/// no database yet. A directory restored from a snapshot opens the same way.
pub async fn create_db(
    manager: &RocksDbManager,
    partition_id: PartitionId,
    path: impl Into<PathBuf>,
) -> Result<PartitionStore> {
    describe_metrics();
    let path = path.into();
    tokio::fs::create_dir_all(&path)
        .await
        .map_err(|err| StorageError::Generic(err.into()))?;

    let spec = DbSpecBuilder::default()
        .name(DbName::new(format!("partition-{partition_id}")))
        .owner(Owner::PartitionStore)
        .path(path)
        .db_options(create_default_db_options(true))
        .flush_on_shutdown(true)
        .build()
        .map_err(|err| StorageError::Generic(err.into()))?;
    let rocksdb = manager.open_db(spec).await?;

    info!(%partition_id, path = %rocksdb.path.display(), "Opened partition store");
    Ok(PartitionStore {
        partition_id,
        rocksdb,
        disable_wal: manager.options().rocksdb_disable_wal(),
    })
}

impl PartitionStore {
    #[inline]
    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn path(&self) -> &Path {
        &self.rocksdb.path
    }

    pub fn rocksdb(&self) -> &Arc<RocksDb> {
        &self.rocksdb
    }

    pub fn transaction(&mut self) -> PartitionStoreTransaction<'_> {
        PartitionStoreTransaction {
            partition_id: self.partition_id,
            rocksdb: &self.rocksdb,
            txn: self.rocksdb.inner().transaction(),
            disable_wal: self.disable_wal,
            key_buffer: BytesMut::new(),
            value_buffer: BytesMut::new(),
        }
    }

    /// Creates a consistent copy of the whole store in `target`, which must not exist. The
    /// copy can be opened with [`create_db`].
    pub async fn create_snapshot(&self, target: impl AsRef<Path>) -> Result<()> {
        let target = target.as_ref();
        self.rocksdb.checkpoint(target).await?;
        counter!(PARTITION_STORE_SNAPSHOT).increment(1);
        debug!(
            partition_id = %self.partition_id,
            target = %target.display(),
            "Created partition store checkpoint"
        );
        Ok(())
    }

    /// Closes the underlying database if this was the last handle to it.
    pub async fn close(self) {
        debug!(partition_id = %self.partition_id, "Closing partition store");
        self.rocksdb.shutdown().await;
    }
}

impl StorageAccess for PartitionStore {
    fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    fn get_kv_raw<R>(
        &self,
        key: impl AsRef<[u8]>,
        f: impl FnOnce(Option<&[u8]>) -> Result<R>,
    ) -> Result<R> {
        let value = self.rocksdb.inner().get_pinned(key)?;
        f(value.as_deref())
    }

    fn scan_prefix_raw(
        &self,
        prefix: impl AsRef<[u8]>,
        f: impl FnMut(&[u8], &[u8]) -> Result<bool>,
    ) -> Result<()> {
        let prefix = prefix.as_ref();
        let it = self
            .rocksdb
            .inner()
            .raw_iterator_opt(prefix_read_options(prefix));
        drive_prefix_iterator(it, prefix, f)
    }
}

/// A read-your-writes transaction on the partition store. Nothing is persisted before
/// [`PartitionStoreTransaction::commit`], dropping the transaction discards all writes.
pub struct PartitionStoreTransaction<'a> {
    partition_id: PartitionId,
    rocksdb: &'a Arc<RocksDb>,
    // used as an indexed write batch, there is a single writer per store
    txn: rocksdb::Transaction<'a, Db>,
    disable_wal: bool,
    key_buffer: BytesMut,
    value_buffer: BytesMut,
}

impl PartitionStoreTransaction<'_> {
    pub(crate) fn put_kv<K: TableKey, V: StorageEncode>(&mut self, key: &K, value: &V) -> Result<()> {
        self.key_buffer.clear();
        key.serialize_to(&mut self.key_buffer);
        self.value_buffer.clear();
        StorageCodec::encode(value, &mut self.value_buffer)?;
        self.txn.put(&self.key_buffer, &self.value_buffer)?;
        Ok(())
    }

    pub(crate) fn delete_key<K: TableKey>(&mut self, key: &K) -> Result<()> {
        self.key_buffer.clear();
        key.serialize_to(&mut self.key_buffer);
        self.txn.delete(&self.key_buffer)?;
        Ok(())
    }

    /// Discards every write of this transaction. The transaction stays usable.
    pub fn rollback(&mut self) -> Result<()> {
        self.txn.rollback()?;
        Ok(())
    }

    /// Atomically persists all writes of this transaction.
    pub fn commit(self) -> impl Future<Output = Result<()>> + Send + 'static {
        let batch = self.txn.get_writebatch();
        let rocksdb = Arc::clone(self.rocksdb);
        let disable_wal = self.disable_wal;
        let partition_id = self.partition_id;

        async move {
            if batch.is_empty() {
                return Ok(());
            }
            let start = Instant::now();
            let mut write_opts = WriteOptions::default();
            write_opts.disable_wal(disable_wal);
            rocksdb
                .write_batch(Priority::High, IoMode::Default, write_opts, batch)
                .await?;
            counter!(PARTITION_STORE_COMMIT).increment(1);
            histogram!(PARTITION_STORE_COMMIT_DURATION).record(start.elapsed());
            tracing::trace!(%partition_id, "Committed partition store transaction");
            Ok(())
        }
    }
}

impl StorageAccess for PartitionStoreTransaction<'_> {
    fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    fn get_kv_raw<R>(
        &self,
        key: impl AsRef<[u8]>,
        f: impl FnOnce(Option<&[u8]>) -> Result<R>,
    ) -> Result<R> {
        let value = self.txn.get_pinned(key)?;
        f(value.as_deref())
    }

    fn scan_prefix_raw(
        &self,
        prefix: impl AsRef<[u8]>,
        f: impl FnMut(&[u8], &[u8]) -> Result<bool>,
    ) -> Result<()> {
        let prefix = prefix.as_ref();
        let it = self.txn.raw_iterator_opt(prefix_read_options(prefix));
        drive_prefix_iterator(it, prefix, f)
    }
}

fn prefix_read_options(prefix: &[u8]) -> ReadOptions {
    let mut opts = ReadOptions::default();
    opts.set_iterate_range(PrefixRange(prefix.to_vec()));
    opts
}

fn drive_prefix_iterator<D: DBAccess>(
    mut it: DBRawIteratorWithThreadMode<'_, D>,
    prefix: &[u8],
    mut f: impl FnMut(&[u8], &[u8]) -> Result<bool>,
) -> Result<()> {
    it.seek(prefix);
    while let Some((key, value)) = it.item() {
        if !key.starts_with(prefix) || !f(key, value)? {
            return Ok(());
        }
        it.next();
    }
    it.status()?;
    Ok(())
}
