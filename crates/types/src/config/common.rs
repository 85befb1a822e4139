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
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, derive_builder::Builder)]
#[serde(rename_all = "kebab-case", default)]
#[builder(default)]
pub struct CommonOptions {
    /// Root of all partition data: log storage, partition stores and snapshots.
    /// Defaults to `keel-data` in the current working directory.
    #[builder(setter(strip_option))]
    base_dir: Option<PathBuf>,

    /// # Shutdown timeout
    ///
    /// How long tasks get to finish in-flight work once cancelled before they are
    /// aborted. Humantime format, e.g. `30s`.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub shutdown_timeout: humantime::Duration,

    /// # Worker threads
    ///
    /// Worker threads of the runtime owned by the task center. Defaults to the number
    /// of available cores.
    #[builder(setter(strip_option))]
    default_thread_pool_size: Option<usize>,

    /// # Log filter
    ///
    /// `tracing` filter directives. `RUST_LOG` takes precedence when set.
    pub log_filter: String,
}

impl CommonOptions {
    pub fn base_dir(&self) -> PathBuf {
        self.base_dir.clone().unwrap_or_else(|| {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("keel-data")
        })
    }

    pub fn default_thread_pool_size(&self) -> usize {
        self.default_thread_pool_size
            .or_else(|| std::thread::available_parallelism().ok().map(Into::into))
            .unwrap_or(4)
    }
}

impl Default for CommonOptions {
    fn default() -> Self {
        Self {
            base_dir: None,
            shutdown_timeout: Duration::from_secs(60).into(),
            default_thread_pool_size: None,
            log_filter: "warn,keel=info".to_string(),
        }
    }
}
