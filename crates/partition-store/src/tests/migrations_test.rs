// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use bytes::Bytes;
use googletest::prelude::*;
use test_log::test;

use keel_types::logs::{Intent, ValueType};
use keel_types::{Key, PartitionId};

use super::{storage_test_environment, PARTITION};
use crate::distribution_table::{
    put_pending_legacy, DistributionTable, LegacyPendingDistribution, ReadOnlyDistributionTable,
    StoredDistributionCommand, PENDING_DISTRIBUTIONS,
};
use crate::fsm_table::{FsmTable, ReadOnlyFsmTable};
use crate::migrations::{
    run_migrations, DistributionMigration, MigrationTask, LATEST_SCHEMA_VERSION,
};
use crate::StorageError;

fn legacy() -> LegacyPendingDistribution {
    LegacyPendingDistribution {
        value_type: ValueType::Deployment,
        intent: Intent::new(0),
        payload: Bytes::from_static(b"legacy"),
    }
}

const P2: PartitionId = PartitionId::new_unchecked(2);
const P3: PartitionId = PartitionId::new_unchecked(3);

#[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn fresh_store_is_stamped_with_latest_version() -> googletest::Result<()> {
    let mut env = storage_test_environment().await;
    assert_eq!(0, env.store.get_schema_version()?);

    run_migrations(&mut env.store).await?;
    assert_eq!(LATEST_SCHEMA_VERSION, env.store.get_schema_version()?);

    // running again is a no-op
    run_migrations(&mut env.store).await?;
    assert_eq!(LATEST_SCHEMA_VERSION, env.store.get_schema_version()?);
    Ok(())
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn pending_distributions_become_retriable() -> googletest::Result<()> {
    let mut env = storage_test_environment().await;
    let key = Key::new(PARTITION, 7);

    let mut txn = env.store.transaction();
    put_pending_legacy(&mut txn, key, P2, &legacy())?;
    put_pending_legacy(&mut txn, key, P3, &legacy())?;
    txn.commit().await?;

    run_migrations(&mut env.store).await?;

    assert!(PENDING_DISTRIBUTIONS.is_empty(&env.store)?);
    assert!(env.store.is_retriable(key, P2)?);
    assert!(env.store.is_retriable(key, P3)?);
    assert_that!(
        env.store.get_distribution_command(key)?,
        some(eq(StoredDistributionCommand {
            value_type: ValueType::Deployment,
            intent: Intent::new(0),
            payload: Bytes::from_static(b"legacy"),
            queue: None,
        }))
    );
    Ok(())
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn migration_does_not_run_when_new_families_are_in_use() -> googletest::Result<()> {
    let mut env = storage_test_environment().await;
    let mut txn = env.store.transaction();
    assert!(!DistributionMigration.needs_to_run(&txn)?);

    put_pending_legacy(&mut txn, Key::new(PARTITION, 1), P2, &legacy())?;
    assert!(DistributionMigration.needs_to_run(&txn)?);

    let key = Key::new(PARTITION, 2);
    txn.put_distribution_command(
        key,
        &StoredDistributionCommand {
            value_type: ValueType::Deployment,
            intent: Intent::new(0),
            payload: Bytes::new(),
            queue: None,
        },
    )?;
    txn.add_retriable(key, P3)?;
    assert!(!DistributionMigration.needs_to_run(&txn)?);
    Ok(())
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn newer_schema_version_is_fatal() -> googletest::Result<()> {
    let mut env = storage_test_environment().await;
    let mut txn = env.store.transaction();
    txn.put_schema_version(LATEST_SCHEMA_VERSION + 1)?;
    txn.commit().await?;

    let result = run_migrations(&mut env.store).await;
    assert!(matches!(
        result,
        Err(StorageError::UnsupportedSchemaVersion { found, supported })
            if found == LATEST_SCHEMA_VERSION + 1 && supported == LATEST_SCHEMA_VERSION
    ));
    Ok(())
}
