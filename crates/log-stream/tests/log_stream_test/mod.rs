// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.


mod local_storage_test;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use googletest::prelude::*;
use test_log::test;

use keel_log_stream::{
    AppendError, CommitListener, LogStorage, LogStream, ReadError, StorageError,
};
use keel_types::config::LogStreamOptionsBuilder;
use keel_types::logs::{Position, SequenceNumber};
use keel_types::time::MillisSinceEpoch;

use super::{clock, command, memory_log_stream, PARTITION};

/// Runs the same checks against any log storage.
pub(crate) async fn gapless_log_stream_test(stream: LogStream) -> googletest::Result<()> {
    let writer = stream.new_writer();
    assert_eq!(Position::INVALID, stream.commit_position());

    let first = writer
        .try_write(vec![command("a"), command("b"), command("c")], None)
        .await?;
    assert_eq!(Position::new(3), first);
    let second = writer
        .try_write(vec![command("d")], Some(Position::new(2)))
        .await?;
    assert_eq!(Position::new(4), second);
    assert_eq!(Position::new(4), stream.last_written_position());
    assert_eq!(Position::new(4), stream.commit_position());

    let mut reader = stream.new_reader();
    let mut positions = Vec::new();
    while reader.has_next()? {
        let entry = reader.next()?;
        positions.push(entry.position.as_i64());
    }
    assert_eq!(vec![1, 2, 3, 4], positions);
    assert!(matches!(reader.next(), Err(ReadError::NoNextEntry(_))));
    assert_eq!(Some(Position::new(4)), reader.last_returned_position());

    // seeking into the middle of a block
    assert!(reader.seek(Position::new(2))?);
    let entry = reader.next()?;
    assert_eq!(Position::new(2), entry.position);
    assert_eq!(None, entry.source_position);
    assert_eq!(&b"b"[..], &entry.payload[..]);

    reader.seek_to_next(Position::new(3))?;
    let entry = reader.next()?;
    assert_eq!(Some(Position::new(2)), entry.source_position);

    // seeking beyond the tail positions the reader at the end
    assert!(!reader.seek(Position::new(100))?);
    assert!(!reader.has_next()?);

    reader.seek_to_end()?;
    writer.try_write(vec![command("e")], None).await?;
    assert_eq!(Position::new(5), reader.next_committed().await?.position);

    Ok(())
}

#[test(tokio::test)]
async fn memory_log_stream_is_gapless() -> googletest::Result<()> {
    let (_, stream) = memory_log_stream().await;
    gapless_log_stream_test(stream).await
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn concurrent_writers_get_distinct_positions() -> googletest::Result<()> {
    let (_, stream) = memory_log_stream().await;

    let mut writers = Vec::new();
    for _ in 0..8 {
        let writer = stream.new_writer();
        writers.push(tokio::spawn(async move {
            let mut highest = Vec::new();
            for _ in 0..10 {
                highest.push(writer.try_write(vec![command("x"), command("y")], None).await?);
            }
            Ok::<_, AppendError>(highest)
        }));
    }
    let mut all = Vec::new();
    for writer in writers {
        let highest = writer.await??;
        // each writer observes increasing positions
        assert!(highest.windows(2).all(|w| w[0] < w[1]));
        all.extend(highest);
    }
    all.sort();
    all.dedup();
    assert_eq!(80, all.len());

    let mut reader = stream.new_reader();
    let mut expected = Position::OLDEST;
    while reader.has_next()? {
        assert_eq!(expected, reader.next()?.position);
        expected = expected.next();
    }
    assert_eq!(Position::new(161), expected);
    Ok(())
}

#[test(tokio::test)]
async fn entries_carry_clock_time() -> googletest::Result<()> {
    let (mock, shared) = clock();
    let stream = LogStream::open(
        PARTITION,
        keel_log_stream::storage::MemoryLogStorage::new(),
        shared,
        &Default::default(),
    )
    .await?;
    mock.advance(Duration::from_secs(1));
    stream.new_writer().try_write(vec![command("a")], None).await?;

    let mut reader = stream.new_reader();
    assert_that!(
        reader.next()?.timestamp,
        eq(MillisSinceEpoch::new(2_000))
    );
    Ok(())
}

#[test(tokio::test)]
async fn failed_write_is_never_visible() -> googletest::Result<()> {
    let (storage, stream) = memory_log_stream().await;
    let writer = stream.new_writer();
    writer.try_write(vec![command("a")], None).await?;

    storage.reject_writes(Some("disk full".to_owned()));
    let err = writer.try_write(vec![command("b")], None).await.unwrap_err();
    assert!(matches!(
        err,
        AppendError::Storage(StorageError::WriteRejected(_))
    ));

    // a later write would leave a gap
    storage.reject_writes(None);
    assert!(matches!(
        writer.try_write(vec![command("c")], None).await,
        Err(AppendError::Failed)
    ));
    assert!(stream.is_failed());
    assert_eq!(Position::new(1), stream.commit_position());

    let mut reader = stream.new_reader();
    assert_eq!(Position::new(1), reader.next()?.position);
    assert!(!reader.has_next()?);
    Ok(())
}

#[test(tokio::test)]
async fn oversized_and_empty_batches_are_refused() -> googletest::Result<()> {
    let storage = keel_log_stream::storage::MemoryLogStorage::new();
    let options = LogStreamOptionsBuilder::default()
        .max_block_size(200)
        .build()?;
    let stream = LogStream::open(PARTITION, storage, clock().1, &options).await?;
    let writer = stream.new_writer();

    assert!(matches!(
        writer.try_write(vec![], None).await,
        Err(AppendError::EmptyBatch)
    ));
    assert!(!writer.can_write(2, 300));
    assert!(writer.can_write(1, 100));
    assert!(matches!(
        writer
            .try_write(vec![command("a"), command("b"), command("c")], None)
            .await,
        Err(AppendError::BlockTooLarge { max: 200, .. })
    ));
    assert_eq!(Position::INVALID, stream.last_written_position());
    Ok(())
}

struct RecordingListener(AtomicI64);

impl CommitListener for RecordingListener {
    fn on_commit(&self, position: Position) {
        self.0.store(position.as_i64(), Ordering::Relaxed);
    }
}

#[test(tokio::test)]
async fn commit_listeners_observe_new_entries() -> googletest::Result<()> {
    let (_, stream) = memory_log_stream().await;
    let writer = stream.new_writer();
    let recording = Arc::new(RecordingListener(AtomicI64::new(0)));
    let listener: Arc<dyn CommitListener> = recording.clone();
    stream.register_commit_listener(Arc::clone(&listener));

    writer.try_write(vec![command("a"), command("b")], None).await?;
    assert_eq!(2, recording.0.load(Ordering::Relaxed));

    stream.remove_commit_listener(&listener);
    writer.try_write(vec![command("c")], None).await?;
    assert_eq!(2, recording.0.load(Ordering::Relaxed));
    assert_eq!(
        Position::new(3),
        stream.wait_for_commit(Position::new(3)).await?
    );
    Ok(())
}

#[test(tokio::test)]
async fn compaction_moves_readers_to_first_available() -> googletest::Result<()> {
    let (storage, stream) = memory_log_stream().await;
    let writer = stream.new_writer();
    writer.try_write(vec![command("a"), command("b")], None).await?;
    writer.try_write(vec![command("c")], None).await?;
    writer.try_write(vec![command("d")], None).await?;

    stream.compact(Position::new(3)).await?;
    assert_eq!(1, storage.block_count());

    let mut reader = stream.new_reader();
    assert!(!reader.seek(Position::new(2))?);
    assert_eq!(Position::new(4), reader.next()?.position);

    // the last entry is never compacted away, the stream recovers its tail from it
    stream.compact(Position::MAX).await?;
    assert_eq!(1, storage.block_count());
    let reopened = LogStream::open(
        PARTITION,
        storage as Arc<dyn LogStorage>,
        clock().1,
        &Default::default(),
    )
    .await?;
    assert_eq!(Position::new(4), reopened.last_written_position());
    Ok(())
}
