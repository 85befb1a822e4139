// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.


use std::collections::VecDeque;

use metrics::counter;
use tokio::sync::watch;

use keel_core::ShutdownError;
use keel_types::logs::{LoggedEntry, Position, SequenceNumber};

use crate::block::BlockEntries;
use crate::commit_watch::CommitPositionWatch;
use crate::error::ReadError;
use crate::metric_definitions::LOG_STREAM_READ_ENTRIES;
use crate::storage::LogStorageReader;

/// Forward cursor over the committed entries of a log stream.
///
/// A reader never returns an entry twice unless it is moved back with one of the seek
/// methods. Many readers can read the same stream concurrently.
pub struct LogStreamReader {
    storage_reader: Box<dyn LogStorageReader>,
    commit_watch: CommitPositionWatch,
    commit_position: watch::Receiver<Position>,
    // decoded entries of the current block that were not returned yet
    buffered: VecDeque<LoggedEntry>,
    // entries before this position are skipped
    next_position: Position,
    last_returned: Option<Position>,
}

impl LogStreamReader {
    pub(crate) fn new(
        storage_reader: Box<dyn LogStorageReader>,
        commit_watch: CommitPositionWatch,
    ) -> Self {
        let commit_position = commit_watch.subscribe();
        Self {
            storage_reader,
            commit_watch,
            commit_position,
            buffered: VecDeque::new(),
            next_position: Position::OLDEST,
            last_returned: None,
        }
    }

    /// Positions the reader so that the next entry returned is the one at `position`, or
    /// the first one after it. Seeking before the first available entry positions the
    /// reader at the start. Returns whether the entry at `position` exists.
    pub fn seek(&mut self, position: Position) -> Result<bool, ReadError> {
        let position = position.max(Position::OLDEST);
        self.buffered.clear();
        self.last_returned = None;
        self.storage_reader.seek(position)?;
        self.next_position = position;
        Ok(self.peek()?.is_some_and(|e| e.position == position))
    }

    pub fn seek_to_first(&mut self) -> Result<(), ReadError> {
        self.seek(Position::OLDEST).map(|_| ())
    }

    /// The next entry returned is the first one committed after now.
    pub fn seek_to_end(&mut self) -> Result<(), ReadError> {
        let committed = self.commit_watch.latest();
        self.seek(committed.next()).map(|_| ())
    }

    /// The next entry returned is the first one after `position`.
    pub fn seek_to_next(&mut self, position: Position) -> Result<bool, ReadError> {
        self.seek(position.next())
    }

    pub fn last_returned_position(&self) -> Option<Position> {
        self.last_returned
    }

    /// Whether a committed entry is available right now.
    pub fn has_next(&mut self) -> Result<bool, ReadError> {
        Ok(self.peek()?.is_some())
    }

    /// Returns the next committed entry. Fails with [`ReadError::NoNextEntry`] if there is
    /// none.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<LoggedEntry, ReadError> {
        if self.peek()?.is_none() {
            return Err(ReadError::NoNextEntry(
                self.last_returned.unwrap_or(Position::INVALID),
            ));
        }
        let Some(entry) = self.buffered.pop_front() else {
            return Err(ReadError::NoNextEntry(
                self.last_returned.unwrap_or(Position::INVALID),
            ));
        };
        self.next_position = entry.position.next();
        self.last_returned = Some(entry.position);
        counter!(LOG_STREAM_READ_ENTRIES).increment(1);
        Ok(entry)
    }

    /// Waits until the next entry is committed and returns it.
    pub async fn next_committed(&mut self) -> Result<LoggedEntry, ReadError> {
        loop {
            if self.has_next()? {
                return self.next();
            }
            self.commit_position
                .changed()
                .await
                .map_err(|_| ShutdownError)?;
        }
    }

    /// The next committed entry without consuming it.
    fn peek(&mut self) -> Result<Option<&LoggedEntry>, ReadError> {
        let committed = *self.commit_position.borrow_and_update();
        while self.buffered.is_empty() {
            let Some(block) = self.storage_reader.next_block()? else {
                break;
            };
            for entry in BlockEntries::new(block.data) {
                let entry = entry?;
                if entry.position >= self.next_position {
                    self.buffered.push_back(entry);
                }
            }
        }
        Ok(self
            .buffered
            .front()
            .filter(|entry| entry.position <= committed))
    }
}
