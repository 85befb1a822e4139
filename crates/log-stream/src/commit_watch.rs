// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.


use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use keel_core::ShutdownError;
use keel_types::logs::Position;

/// Tracks the highest committed position of a log stream.
#[derive(Debug, Clone)]
pub struct CommitPositionWatch {
    sender: watch::Sender<Position>,
}

impl CommitPositionWatch {
    pub fn new(position: Position) -> Self {
        let sender = watch::Sender::new(position);
        Self { sender }
    }

    /// Inform the watch that the commit position might have moved. Never moves backwards.
    pub fn notify(&self, position: Position) -> bool {
        self.sender.send_if_modified(|current| {
            if position > *current {
                *current = position;
                true
            } else {
                false
            }
        })
    }

    pub fn latest(&self) -> Position {
        *self.sender.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Position> {
        self.sender.subscribe()
    }

    /// Waits until `position` is committed and returns the commit position at that time.
    pub async fn wait_for(&self, position: Position) -> Result<Position, ShutdownError> {
        let mut receiver = self.sender.subscribe();
        receiver.mark_changed();
        let committed = receiver
            .wait_for(|committed| *committed >= position)
            .await
            .map_err(|_| ShutdownError)?;
        Ok(*committed)
    }

    /// The first yielded value is the latest commit position
    pub fn to_stream(&self) -> WatchStream<Position> {
        let mut receiver = self.sender.subscribe();
        receiver.mark_changed();
        WatchStream::new(receiver)
    }
}
