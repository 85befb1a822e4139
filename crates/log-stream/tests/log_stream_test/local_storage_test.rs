// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.


use googletest::prelude::*;
use test_log::test;

use keel_log_stream::storage::LocalLogStorage;
use keel_log_stream::{LogStorage, LogStream};
use keel_rocksdb::RocksDbManager;
use keel_types::config::{LogStreamOptions, RocksDbOptions};
use keel_types::logs::Position;

use super::gapless_log_stream_test;
use crate::{clock, command, test_task_center, PARTITION};

#[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn local_log_stream_is_gapless() -> googletest::Result<()> {
    let tc = test_task_center();
    let dir = tempfile::tempdir()?;
    let manager = RocksDbManager::new(RocksDbOptions::default());
    let options = LogStreamOptions::default();

    let storage =
        LocalLogStorage::create(&tc, &manager, PARTITION, dir.path().join("log"), &options)
            .await?;
    let stream = LogStream::open(PARTITION, storage, clock().1, &options).await?;
    gapless_log_stream_test(stream.clone()).await?;
    stream.close().await;
    manager.shutdown().await;
    Ok(())
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn reopened_stream_continues_after_last_entry() -> googletest::Result<()> {
    let tc = test_task_center();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("log");
    let manager = RocksDbManager::new(RocksDbOptions::default());
    let options = LogStreamOptions::default();

    {
        let storage =
            LocalLogStorage::create(&tc, &manager, PARTITION, path.clone(), &options).await?;
        let stream = LogStream::open(PARTITION, storage, clock().1, &options).await?;
        let writer = stream.new_writer();
        writer
            .try_write(vec![command("a"), command("b")], None)
            .await?;
        writer.try_write(vec![command("c")], None).await?;
        stream.compact(Position::new(2)).await?;
        stream.close().await;
    }
    // the database closed once the last reference was dropped
    assert!(manager.get_db(&path).is_none());

    let storage = LocalLogStorage::create(&tc, &manager, PARTITION, path, &options).await?;
    let stream = LogStream::open(
        PARTITION,
        storage.clone() as std::sync::Arc<dyn LogStorage>,
        clock().1,
        &options,
    )
    .await?;
    assert_eq!(Position::new(3), stream.last_written_position());
    assert_eq!(Position::new(3), stream.commit_position());

    let highest = stream
        .new_writer()
        .try_write(vec![command("d")], None)
        .await?;
    assert_eq!(Position::new(4), highest);

    let mut reader = stream.new_reader();
    reader.seek_to_first()?;
    assert_that!(reader.next()?.position, eq(Position::new(3)));
    assert_that!(reader.next()?.position, eq(Position::new(4)));

    stream.close().await;
    manager.shutdown().await;
    Ok(())
}
