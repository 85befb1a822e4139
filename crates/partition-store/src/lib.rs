// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Transactional state store of a partition, organized in typed column families on top of
//! a rocksdb database.

pub mod column_family;
pub mod distribution_table;
mod error;
pub mod fsm_table;
pub mod keys;
mod metric_definitions;
pub mod migrations;
mod partition_store;
pub mod snapshots;

#[cfg(test)]
mod tests;

pub use column_family::ColumnFamily;
pub use error::*;
pub use partition_store::*;

#[doc(hidden)]
pub mod __private {
    pub use bytes::{Buf, BufMut};
    pub use paste::paste;
}
