// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.


use keel_types::config::RocksDbOptions;

/// Baseline options shared by every keel database. Node level settings are layered on
/// top when the [`crate::RocksDbManager`] opens the database.
pub fn create_default_db_options(create_db_if_missing: bool) -> rocksdb::Options {
    let mut db_options = rocksdb::Options::default();
    db_options.create_if_missing(create_db_if_missing);
    db_options.set_avoid_unnecessary_blocking_io(true);
    db_options.set_level_compaction_dynamic_level_bytes(true);
    db_options.set_skip_stats_update_on_db_open(true);
    // both zero: obsolete WAL files are deleted instead of archived
    db_options.set_wal_ttl_seconds(0);
    db_options.set_wal_size_limit_mb(0);
    db_options
}

pub(crate) fn apply_db_opts_from_config(db_options: &mut rocksdb::Options, config: &RocksDbOptions) {
    let background_jobs = config.rocksdb_max_background_jobs().get();
    db_options.set_max_background_jobs(i32::try_from(background_jobs).unwrap_or(i32::MAX));
    db_options.set_write_buffer_size(config.rocksdb_write_buffer_size());
    db_options.set_keep_log_file_num(2);

    if !config.rocksdb_disable_statistics() {
        db_options.enable_statistics();
    }
    // recycling is unsupported for writes that skip the WAL
    if !config.rocksdb_disable_wal() {
        db_options.set_recycle_log_file_num(4);
    }
}
