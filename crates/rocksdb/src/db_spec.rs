// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.


use std::path::PathBuf;

use derive_builder::Builder;

#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    derive_more::Display,
    derive_more::From,
    derive_more::Deref,
)]
#[display("{}", _0)]
pub struct DbName(String);

impl DbName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl From<&str> for DbName {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Which component owns a database. Used as a metric label.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum Owner {
    PartitionStore,
    LogStorage,
    #[default]
    None,
}

/// Everything needed to open a database.
#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct DbSpec {
    #[builder(setter(into))]
    pub(crate) name: DbName,
    #[builder(default)]
    pub(crate) owner: Owner,
    #[builder(setter(into))]
    pub(crate) path: PathBuf,
    /// Options of the database. Options derived from the node configuration are applied on
    /// top of them.
    #[builder(default)]
    pub(crate) db_options: rocksdb::Options,
    /// Whether memtables are flushed to disk when the database closes.
    #[builder(default)]
    pub(crate) flush_on_shutdown: bool,
}

impl DbSpec {
    pub fn name(&self) -> &DbName {
        &self.name
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}
