// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;
use std::marker::PhantomData;

use anyhow::anyhow;

use keel_types::storage::{StorageCodec, StorageDecode, StorageEncode};

use crate::keys::{KeyKind, TableKey};
use crate::partition_store::{PartitionStoreTransaction, StorageAccess};
use crate::{Result, StorageError};

/// A named, typed sub-keyspace of the partition store. Declared once, usually as a
/// constant next to its key type:
///
/// ```ignore
/// define_table_key!(KeyKind::custom(*b"cn"), CounterKey(name: ByteString));
/// pub const COUNTERS: ColumnFamily<CounterKey, Counter> = ColumnFamily::new("counters");
/// ```
///
/// The key kind of `K` namespaces the family. Reads accept any [`StorageAccess`], writes
/// require an open transaction.
pub struct ColumnFamily<K, V> {
    name: &'static str,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> ColumnFamily<K, V> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<K, V> Clone for ColumnFamily<K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V> Copy for ColumnFamily<K, V> {}

impl<K, V> fmt::Debug for ColumnFamily<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ColumnFamily").field(&self.name).finish()
    }
}

impl<K, V> ColumnFamily<K, V>
where
    K: TableKey,
    V: StorageEncode + StorageDecode,
{
    pub fn key_kind(&self) -> KeyKind {
        K::KEY_KIND
    }

    pub fn get<S: StorageAccess>(&self, storage: &S, key: &K) -> Result<Option<V>> {
        self.ensure_complete(key)?;
        storage.get_kv_raw(key.serialize(), |value| {
            value.map(|mut value| decode_value(&mut value)).transpose()
        })
    }

    pub fn exists<S: StorageAccess>(&self, storage: &S, key: &K) -> Result<bool> {
        self.ensure_complete(key)?;
        storage.get_kv_raw(key.serialize(), |value| Ok(value.is_some()))
    }

    /// Writes a new entry, fails if `key` exists.
    pub fn insert(&self, txn: &mut PartitionStoreTransaction<'_>, key: &K, value: &V) -> Result<()> {
        if self.exists(&*txn, key)? {
            return Err(StorageError::PreconditionFailed(anyhow!(
                "{} already contains {key:?}",
                self.name
            )));
        }
        txn.put_kv(key, value)
    }

    /// Overwrites an existing entry, fails if `key` does not exist.
    pub fn update(&self, txn: &mut PartitionStoreTransaction<'_>, key: &K, value: &V) -> Result<()> {
        if !self.exists(&*txn, key)? {
            return Err(self.missing(key));
        }
        txn.put_kv(key, value)
    }

    pub fn upsert(&self, txn: &mut PartitionStoreTransaction<'_>, key: &K, value: &V) -> Result<()> {
        self.ensure_complete(key)?;
        txn.put_kv(key, value)
    }

    /// Deletes `key` if present.
    pub fn delete(&self, txn: &mut PartitionStoreTransaction<'_>, key: &K) -> Result<()> {
        self.ensure_complete(key)?;
        txn.delete_key(key)
    }

    /// Deletes `key`, fails if it does not exist.
    pub fn delete_existing(&self, txn: &mut PartitionStoreTransaction<'_>, key: &K) -> Result<()> {
        if !self.exists(&*txn, key)? {
            return Err(self.missing(key));
        }
        txn.delete_key(key)
    }

    pub fn is_empty<S: StorageAccess>(&self, storage: &S) -> Result<bool> {
        let mut empty = true;
        storage.scan_prefix_raw(K::KEY_KIND.as_bytes(), |_, _| {
            empty = false;
            Ok(false)
        })?;
        Ok(empty)
    }

    /// Visits all entries in key order.
    pub fn for_each<S: StorageAccess>(
        &self,
        storage: &S,
        mut f: impl FnMut(K, V) -> Result<()>,
    ) -> Result<()> {
        self.while_true(storage, |key, value| f(key, value).map(|_| true))
    }

    /// Visits entries in key order until `f` returns `false`.
    pub fn while_true<S: StorageAccess>(
        &self,
        storage: &S,
        f: impl FnMut(K, V) -> Result<bool>,
    ) -> Result<()> {
        scan_decoded(storage, K::KEY_KIND.as_bytes(), f)
    }

    /// Visits all entries whose leading key components equal the components set in
    /// `prefix`.
    pub fn for_each_with_prefix<S: StorageAccess>(
        &self,
        storage: &S,
        prefix: &K,
        mut f: impl FnMut(K, V) -> Result<()>,
    ) -> Result<()> {
        self.while_equal_prefix(storage, prefix, |key, value| f(key, value).map(|_| true))
    }

    /// Like [`ColumnFamily::for_each_with_prefix`] but stops once `f` returns `false`.
    pub fn while_equal_prefix<S: StorageAccess>(
        &self,
        storage: &S,
        prefix: &K,
        f: impl FnMut(K, V) -> Result<bool>,
    ) -> Result<()> {
        scan_decoded(storage, prefix.serialize(), f)
    }

    fn ensure_complete(&self, key: &K) -> Result<()> {
        if key.is_complete() {
            Ok(())
        } else {
            Err(StorageError::PreconditionFailed(anyhow!(
                "{key:?} is not a complete key of {}",
                self.name
            )))
        }
    }

    fn missing(&self, key: &K) -> StorageError {
        StorageError::PreconditionFailed(anyhow!("{} does not contain {key:?}", self.name))
    }
}

fn scan_decoded<S, K, V>(
    storage: &S,
    prefix: impl AsRef<[u8]>,
    mut f: impl FnMut(K, V) -> Result<bool>,
) -> Result<()>
where
    S: StorageAccess,
    K: TableKey,
    V: StorageDecode,
{
    storage.scan_prefix_raw(prefix, |mut key, mut value| {
        let key = K::deserialize_from(&mut key)?;
        let value = decode_value(&mut value)?;
        f(key, value)
    })
}

fn decode_value<V: StorageDecode>(value: &mut &[u8]) -> Result<V> {
    Ok(StorageCodec::decode(value)?)
}
