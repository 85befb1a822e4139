// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Processing state of the partition: key generator, last processed position and schema
//! version.

use serde::{Deserialize, Serialize};

use keel_types::flexbuffers_storage_encode_decode;
use keel_types::logs::Position;
use keel_types::Key;

use crate::column_family::ColumnFamily;
use crate::keys::{define_table_key, KeyKind};
use crate::partition_store::{PartitionStoreTransaction, StorageAccess};
use crate::Result;

define_table_key!(KeyKind::Fsm, PartitionStateMachineKey(state_id: u64));

pub(crate) mod fsm_variable {
    pub(crate) const KEY_GENERATOR: u64 = 1;
    pub(crate) const LAST_PROCESSED_POSITION: u64 = 2;
    pub(crate) const SCHEMA_VERSION: u64 = 3;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceNumberValue(pub i64);
flexbuffers_storage_encode_decode!(SequenceNumberValue);

pub const FSM: ColumnFamily<PartitionStateMachineKey, SequenceNumberValue> =
    ColumnFamily::new("fsm");

fn fsm_key(state_id: u64) -> PartitionStateMachineKey {
    PartitionStateMachineKey::default().state_id(state_id)
}

fn get_variable<S: StorageAccess>(storage: &S, state_id: u64) -> Result<Option<i64>> {
    Ok(FSM.get(storage, &fsm_key(state_id))?.map(|value| value.0))
}

pub trait ReadOnlyFsmTable {
    /// The most recently issued key, `None` if this partition never issued one.
    fn get_last_issued_key(&self) -> Result<Option<Key>>;

    fn get_last_processed_position(&self) -> Result<Option<Position>>;

    /// Schema version of the store, 0 for a store that predates versioning.
    fn get_schema_version(&self) -> Result<u16>;
}

pub trait FsmTable: ReadOnlyFsmTable {
    fn put_last_issued_key(&mut self, key: Key) -> Result<()>;

    fn put_last_processed_position(&mut self, position: Position) -> Result<()>;

    fn put_schema_version(&mut self, version: u16) -> Result<()>;
}

impl<S: StorageAccess> ReadOnlyFsmTable for S {
    fn get_last_issued_key(&self) -> Result<Option<Key>> {
        Ok(get_variable(self, fsm_variable::KEY_GENERATOR)?.map(Key::from_raw))
    }

    fn get_last_processed_position(&self) -> Result<Option<Position>> {
        Ok(get_variable(self, fsm_variable::LAST_PROCESSED_POSITION)?.map(Position::new))
    }

    fn get_schema_version(&self) -> Result<u16> {
        let version = get_variable(self, fsm_variable::SCHEMA_VERSION)?.unwrap_or_default();
        u16::try_from(version).map_err(|_| crate::StorageError::DataIntegrityError)
    }
}

impl FsmTable for PartitionStoreTransaction<'_> {
    fn put_last_issued_key(&mut self, key: Key) -> Result<()> {
        FSM.upsert(
            self,
            &fsm_key(fsm_variable::KEY_GENERATOR),
            &SequenceNumberValue(key.as_i64()),
        )
    }

    fn put_last_processed_position(&mut self, position: Position) -> Result<()> {
        FSM.upsert(
            self,
            &fsm_key(fsm_variable::LAST_PROCESSED_POSITION),
            &SequenceNumberValue(position.as_i64()),
        )
    }

    fn put_schema_version(&mut self, version: u16) -> Result<()> {
        FSM.upsert(
            self,
            &fsm_key(fsm_variable::SCHEMA_VERSION),
            &SequenceNumberValue(i64::from(version)),
        )
    }
}
