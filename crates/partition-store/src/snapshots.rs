// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Local snapshots of a partition store.
//!
//! ```text
//! <root>/pending/<id>/             checkpoint being written
//! <root>/snapshots/<id>/           valid snapshots, id = <processed_position>-<created_at_ms>
//! <root>/snapshots/<id>/metadata.json
//! ```
//!
//! A snapshot becomes visible by renaming its directory from `pending/` into `snapshots/`
//! after the checkpoint and its metadata were written. Directories without a parseable
//! metadata file are ignored.

use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use keel_types::logs::Position;
use keel_types::time::MillisSinceEpoch;
use keel_types::PartitionId;

use crate::error::SnapshotError;
use crate::fsm_table::ReadOnlyFsmTable;
use crate::partition_store::PartitionStore;

pub const SNAPSHOT_METADATA_FILE: &str = "metadata.json";
pub const SNAPSHOT_FORMAT_VERSION: u16 = 1;

const PENDING_DIR: &str = "pending";
const SNAPSHOTS_DIR: &str = "snapshots";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SnapshotMetadata {
    pub version: u16,
    pub partition_id: PartitionId,
    /// Every entry up to and including this position is reflected in the snapshot.
    pub processed_position: Position,
    pub created_at: MillisSinceEpoch,
}

impl SnapshotMetadata {
    pub fn snapshot_id(&self) -> String {
        format!(
            "{}-{}",
            self.processed_position,
            self.created_at.as_u64()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedSnapshot {
    pub path: PathBuf,
    pub metadata: SnapshotMetadata,
}

impl PersistedSnapshot {
    pub fn processed_position(&self) -> Position {
        self.metadata.processed_position
    }
}

/// Takes, lists, purges and restores the snapshots of one partition.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    partition_id: PartitionId,
    root: PathBuf,
    retain: NonZeroUsize,
}

impl SnapshotStore {
    /// Opens the snapshot store rooted at `root`. Leftovers of interrupted snapshots are
    /// deleted.
    pub async fn open(
        partition_id: PartitionId,
        root: impl Into<PathBuf>,
        retain: NonZeroUsize,
    ) -> Result<Self, SnapshotError> {
        let root = root.into();
        let pending = root.join(PENDING_DIR);
        if tokio::fs::try_exists(&pending).await? {
            tokio::fs::remove_dir_all(&pending).await?;
        }
        tokio::fs::create_dir_all(&pending).await?;
        tokio::fs::create_dir_all(root.join(SNAPSHOTS_DIR)).await?;

        Ok(Self {
            partition_id,
            root,
            retain,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshots `store` at its last processed position. The caller must not write to the
    /// store until the returned future completed.
    #[tracing::instrument(level = "debug", skip_all, fields(partition_id = %self.partition_id))]
    pub async fn take_snapshot(
        &self,
        store: &PartitionStore,
        created_at: MillisSinceEpoch,
    ) -> Result<PersistedSnapshot, SnapshotError> {
        let processed_position = store
            .get_last_processed_position()
            .map_err(|err| SnapshotError::Store(Box::new(err)))?
            .ok_or(SnapshotError::NothingProcessed)?;

        let metadata = SnapshotMetadata {
            version: SNAPSHOT_FORMAT_VERSION,
            partition_id: self.partition_id,
            processed_position,
            created_at,
        };
        let snapshot_id = metadata.snapshot_id();
        let target = self.root.join(SNAPSHOTS_DIR).join(&snapshot_id);
        if tokio::fs::try_exists(&target).await? {
            return Err(SnapshotError::AlreadyExists(snapshot_id));
        }

        let pending = self.root.join(PENDING_DIR).join(&snapshot_id);
        if tokio::fs::try_exists(&pending).await? {
            tokio::fs::remove_dir_all(&pending).await?;
        }
        store
            .create_snapshot(&pending)
            .await
            .map_err(|err| SnapshotError::Store(Box::new(err)))?;

        let json = serde_json::to_vec_pretty(&metadata)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        tokio::fs::write(pending.join(SNAPSHOT_METADATA_FILE), json).await?;
        tokio::fs::rename(&pending, &target).await?;

        info!(
            partition_id = %self.partition_id,
            %processed_position,
            path = %target.display(),
            "Persisted partition snapshot"
        );
        Ok(PersistedSnapshot {
            path: target,
            metadata,
        })
    }

    /// All valid snapshots, oldest first.
    pub async fn list(&self) -> Result<Vec<PersistedSnapshot>, SnapshotError> {
        let mut snapshots = Vec::new();
        let mut dir = tokio::fs::read_dir(self.root.join(SNAPSHOTS_DIR)).await?;
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let path = entry.path();
            match read_metadata(&path).await {
                Ok(metadata) if metadata.partition_id == self.partition_id => {
                    snapshots.push(PersistedSnapshot { path, metadata })
                }
                Ok(metadata) => warn!(
                    path = %path.display(),
                    "Ignoring snapshot of partition {}", metadata.partition_id
                ),
                Err(err) => warn!(path = %path.display(), "Ignoring invalid snapshot: {err}"),
            }
        }
        snapshots.sort_by_key(|snapshot| {
            (
                snapshot.metadata.processed_position,
                snapshot.metadata.created_at,
            )
        });
        Ok(snapshots)
    }

    pub async fn latest(&self) -> Result<Option<PersistedSnapshot>, SnapshotError> {
        Ok(self.list().await?.pop())
    }

    /// Deletes every valid snapshot but the newest `retain` ones.
    pub async fn purge(&self) -> Result<usize, SnapshotError> {
        let snapshots = self.list().await?;
        let excess = snapshots.len().saturating_sub(self.retain.get());
        for snapshot in &snapshots[..excess] {
            debug!(path = %snapshot.path.display(), "Deleting old snapshot");
            tokio::fs::remove_dir_all(&snapshot.path).await?;
        }
        Ok(excess)
    }

    /// Replaces `runtime_dir` with a copy of the latest snapshot, or with an empty directory
    /// if there is none. The directory can then be opened with
    /// [`create_db`](crate::create_db).
    pub async fn recover_into(
        &self,
        runtime_dir: &Path,
    ) -> Result<Option<SnapshotMetadata>, SnapshotError> {
        if tokio::fs::try_exists(runtime_dir).await? {
            tokio::fs::remove_dir_all(runtime_dir).await?;
        }
        tokio::fs::create_dir_all(runtime_dir).await?;

        let Some(snapshot) = self.latest().await? else {
            debug!(partition_id = %self.partition_id, "No snapshot to recover from");
            return Ok(None);
        };

        let mut dir = tokio::fs::read_dir(&snapshot.path).await?;
        while let Some(entry) = dir.next_entry().await? {
            if entry.file_name() == SNAPSHOT_METADATA_FILE || !entry.file_type().await?.is_file()
            {
                continue;
            }
            tokio::fs::copy(entry.path(), runtime_dir.join(entry.file_name())).await?;
        }

        info!(
            partition_id = %self.partition_id,
            processed_position = %snapshot.metadata.processed_position,
            "Recovered partition store from snapshot"
        );
        Ok(Some(snapshot.metadata))
    }
}

async fn read_metadata(snapshot_dir: &Path) -> Result<SnapshotMetadata, SnapshotError> {
    let path = snapshot_dir.join(SNAPSHOT_METADATA_FILE);
    let bytes = tokio::fs::read(&path).await?;
    serde_json::from_slice(&bytes).map_err(|source| SnapshotError::InvalidMetadata {
        path: path.display().to_string(),
        source,
    })
}
