// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

/// Returned once the task center (or the addressed actor) stopped accepting work.
///
/// Tasks may bubble it up as their error, the task center then treats their exit as part
/// of the shutdown rather than as a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("system is shutting down")]
pub struct ShutdownError;
