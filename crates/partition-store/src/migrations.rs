// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use metrics::counter;
use static_assertions::assert_obj_safe;
use tracing::info;

use crate::distribution_table::{
    DistributionTable, ReadOnlyDistributionTable, StoredDistributionCommand,
    PENDING_DISTRIBUTIONS, QUEUED_DISTRIBUTIONS, RETRIABLE_DISTRIBUTIONS,
};
use crate::fsm_table::{FsmTable, ReadOnlyFsmTable};
use crate::metric_definitions::PARTITION_STORE_MIGRATION;
use crate::partition_store::{PartitionStore, PartitionStoreTransaction};
use crate::{Result, StorageError};

/// Schema version written by this binary. Version history:
/// * 0: distributions kept in a single "pending" column family
/// * 1: distribution commands stored once, queued and retriable markers
pub const LATEST_SCHEMA_VERSION: u16 = 1;

/// A data migration that runs inside the transaction opening the store.
pub trait MigrationTask: Send + Sync {
    fn name(&self) -> &'static str;

    fn needs_to_run(&self, txn: &PartitionStoreTransaction<'_>) -> Result<bool>;

    fn run(&self, txn: &mut PartitionStoreTransaction<'_>) -> Result<()>;
}

assert_obj_safe!(MigrationTask);

/// Moves legacy pending distributions into the retriable column family. The command is
/// stored once per distribution key.
#[derive(Debug, Default)]
pub struct DistributionMigration;

impl MigrationTask for DistributionMigration {
    fn name(&self) -> &'static str {
        "pending-to-retriable-distributions"
    }

    fn needs_to_run(&self, txn: &PartitionStoreTransaction<'_>) -> Result<bool> {
        Ok(!PENDING_DISTRIBUTIONS.is_empty(txn)?
            && RETRIABLE_DISTRIBUTIONS.is_empty(txn)?
            && QUEUED_DISTRIBUTIONS.is_empty(txn)?)
    }

    fn run(&self, txn: &mut PartitionStoreTransaction<'_>) -> Result<()> {
        let mut pending = Vec::new();
        txn.for_each_pending_legacy(|distribution_key, partition_id, value| {
            pending.push((distribution_key, partition_id, value));
            Ok(())
        })?;

        for (distribution_key, partition_id, value) in pending {
            if txn.get_distribution_command(distribution_key)?.is_none() {
                txn.put_distribution_command(
                    distribution_key,
                    &StoredDistributionCommand {
                        value_type: value.value_type,
                        intent: value.intent,
                        payload: value.payload,
                        queue: None,
                    },
                )?;
            }
            txn.add_retriable(distribution_key, partition_id)?;
            txn.delete_pending_legacy(distribution_key, partition_id)?;
        }
        Ok(())
    }
}

fn migration_tasks() -> Vec<Box<dyn MigrationTask>> {
    vec![Box::new(DistributionMigration)]
}

/// Runs every migration task that needs to run and stamps the store with the latest
/// schema version, atomically. Fails without touching the store if it was written by a
/// newer version.
pub async fn run_migrations(store: &mut PartitionStore) -> Result<()> {
    let partition_id = store.partition_id();
    let mut txn = store.transaction();
    let version = txn.get_schema_version()?;
    if version > LATEST_SCHEMA_VERSION {
        return Err(StorageError::UnsupportedSchemaVersion {
            found: version,
            supported: LATEST_SCHEMA_VERSION,
        });
    }

    for task in migration_tasks() {
        if task.needs_to_run(&txn)? {
            info!(%partition_id, migration = task.name(), "Running partition store migration");
            task.run(&mut txn)?;
            counter!(PARTITION_STORE_MIGRATION).increment(1);
        }
    }

    if version != LATEST_SCHEMA_VERSION {
        txn.put_schema_version(LATEST_SCHEMA_VERSION)?;
    }
    txn.commit().await
}
