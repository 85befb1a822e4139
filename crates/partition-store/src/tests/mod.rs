// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::path::Path;

use bytestring::ByteString;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use keel_rocksdb::RocksDbManager;
use keel_types::config::RocksDbOptions;
use keel_types::flexbuffers_storage_encode_decode;
use keel_types::PartitionId;

use crate::keys::{define_table_key, KeyKind};
use crate::{create_db, ColumnFamily, PartitionStore};

mod migrations_test;

pub(crate) const PARTITION: PartitionId = PartitionId::new_unchecked(1);

define_table_key!(
    KeyKind::custom(*b"ct"),
    CounterKey(group: ByteString, id: i64)
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Counter(pub u64);
flexbuffers_storage_encode_decode!(Counter);

pub(crate) const COUNTERS: ColumnFamily<CounterKey, Counter> = ColumnFamily::new("counters");

pub(crate) fn counter_key(group: &str, id: i64) -> CounterKey {
    CounterKey::default().group(group.into()).id(id)
}

pub(crate) struct TestEnv {
    pub dir: TempDir,
    pub manager: RocksDbManager,
    pub store: PartitionStore,
}

pub(crate) async fn storage_test_environment() -> TestEnv {
    let dir = tempfile::tempdir().expect("temp dir");
    let manager = RocksDbManager::new(RocksDbOptions::default());
    let store = open_store(&manager, &dir.path().join("runtime")).await;
    TestEnv {
        dir,
        manager,
        store,
    }
}

pub(crate) async fn open_store(manager: &RocksDbManager, path: &Path) -> PartitionStore {
    create_db(manager, PARTITION, path)
        .await
        .expect("DB storage creation succeeds")
}
