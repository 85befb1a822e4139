// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The stream processor of a partition and its handle.
//!
//! ```text
//! INITIALIZING -> REPLAYING -> PROCESSING <-> PAUSED
//!                                  |            |
//!                                  +-> CLOSING <+-> CLOSED
//! REPLAYING | PROCESSING -> FAILED
//! ```

mod actor;
mod builder;

pub use builder::StreamProcessorBuilder;

use tokio::sync::watch;

use keel_core::ActorHandle;
use keel_types::logs::Position;
use keel_types::PartitionId;

use crate::error::StreamProcessorError;
use actor::{Message, StreamProcessor};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamProcessorPhase {
    Initializing,
    Replaying,
    Processing,
    Paused,
    Closing,
    Closed,
    /// An unrecoverable error stopped processing. Only closing is possible.
    Failed,
}

impl StreamProcessorPhase {
    /// Whether the processor will never process again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StreamProcessorPhase::Closed | StreamProcessorPhase::Failed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorStatus {
    pub phase: StreamProcessorPhase,
    pub last_processed_position: Option<Position>,
    pub last_written_position: Position,
    /// Why the processor failed, if it did.
    pub failure: Option<String>,
}

/// Controls a running stream processor. Every request is handled on the processor's own
/// turn, between two commands.
#[derive(Clone)]
pub struct StreamProcessorHandle {
    partition_id: PartitionId,
    actor: ActorHandle<StreamProcessor>,
    phase: watch::Receiver<StreamProcessorPhase>,
    exported: Option<watch::Receiver<Option<Position>>>,
}

impl StreamProcessorHandle {
    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    /// Suspends processing after the current command. Entries keep accumulating in the log.
    pub async fn pause(&self) -> Result<(), StreamProcessorError> {
        self.actor.call(Message::Pause).await?
    }

    /// Continues processing at the entry after the last processed one.
    pub async fn resume(&self) -> Result<(), StreamProcessorError> {
        self.actor.call(Message::Resume).await?
    }

    /// Takes a snapshot of the partition store and returns the position it reflects, `None`
    /// if nothing was processed yet.
    pub async fn snapshot(&self) -> Result<Option<Position>, StreamProcessorError> {
        self.actor.call(Message::Snapshot).await?
    }

    pub async fn status(&self) -> Result<ProcessorStatus, StreamProcessorError> {
        Ok(self.actor.call(Message::Status).await?)
    }

    pub async fn last_processed_position(&self) -> Result<Option<Position>, StreamProcessorError> {
        Ok(self.status().await?.last_processed_position)
    }

    pub async fn last_written_position(&self) -> Result<Position, StreamProcessorError> {
        Ok(self.status().await?.last_written_position)
    }

    pub fn phase(&self) -> StreamProcessorPhase {
        *self.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<StreamProcessorPhase> {
        self.phase.clone()
    }

    /// Waits until the processor reached `phase`. Fails if it ended up in a terminal phase
    /// other than `phase` instead.
    pub async fn wait_for_phase(
        &self,
        phase: StreamProcessorPhase,
    ) -> Result<(), StreamProcessorError> {
        let mut watch = self.phase.clone();
        let reached = *watch
            .wait_for(|current| *current == phase || current.is_terminal())
            .await
            .map_err(|_| keel_core::ShutdownError)?;
        if reached == phase {
            Ok(())
        } else {
            Err(StreamProcessorError::InvalidPhase {
                operation: "wait for phase",
                phase: reached,
            })
        }
    }

    /// Position of the last entry all exporters have seen. `None` without exporters.
    pub fn exported_position(&self) -> Option<Position> {
        self.exported
            .as_ref()
            .and_then(|exported| *exported.borrow())
    }

    /// Stops processing, closes the partition store and waits for the processor to stop.
    pub async fn close(&self) -> Result<(), StreamProcessorError> {
        if self.actor.is_stopped() {
            return Ok(());
        }
        self.actor.call(Message::Close).await?;
        self.actor.stopped().await;
        Ok(())
    }
}

impl std::fmt::Debug for StreamProcessorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamProcessorHandle")
            .field("partition_id", &self.partition_id)
            .field("phase", &self.phase())
            .finish()
    }
}
