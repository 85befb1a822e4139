// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use keel_partition_store::fsm_table::{FsmTable, ReadOnlyFsmTable};
use keel_partition_store::PartitionStoreTransaction;
use keel_types::{Key, PartitionId};

use crate::error::ProcessingError;

const MAX_COUNTER: u64 = (1 << Key::COUNTER_BITS) - 1;

/// Issues ascending keys that embed the partition id.
///
/// The last issued key lives in the fsm table and is read and written through the open
/// transaction, so keys issued by a rolled back command are issued again.
#[derive(Debug, Clone, Copy)]
pub struct KeyGenerator {
    partition_id: PartitionId,
}

impl KeyGenerator {
    pub fn new(partition_id: PartitionId) -> Self {
        Self { partition_id }
    }

    pub fn next_key(&self, txn: &mut PartitionStoreTransaction<'_>) -> Result<Key, ProcessingError> {
        let counter = match txn.get_last_issued_key()? {
            Some(last) => last.counter(),
            None => 0,
        };
        if counter >= MAX_COUNTER {
            return Err(ProcessingError::KeysExhausted);
        }
        let key = Key::new(self.partition_id, counter + 1);
        txn.put_last_issued_key(key)?;
        Ok(key)
    }

    /// Makes sure `key` is never issued again. Keys of other partitions are ignored.
    pub fn raise_to(
        &self,
        txn: &mut PartitionStoreTransaction<'_>,
        key: Key,
    ) -> Result<(), ProcessingError> {
        if key.partition_id() != self.partition_id {
            return Ok(());
        }
        let last = txn.get_last_issued_key()?.map(Key::counter).unwrap_or(0);
        if key.counter() > last {
            txn.put_last_issued_key(key)?;
        }
        Ok(())
    }
}
