// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Types shared by every keel crate: identifiers, log entry records and their wire
//! codec, the storage value codec, retry policies and configuration.

pub mod config;
pub mod config_loader;
pub mod errors;
pub mod identifiers;
pub mod logs;
pub mod retries;
pub mod storage;
pub mod time;

pub use identifiers::{Key, PartitionId};
pub use logs::{Position, SequenceNumber};
