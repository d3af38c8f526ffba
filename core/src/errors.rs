// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Join errors and conversions to the engine error type.

use arrow::error::ArrowError;
use datafusion::common::DataFusionError;

/// Fatal errors raised by the partitioned hash join.
///
/// A failed memory reservation is not represented here: it is the
/// *needs-spill* signal, handled locally by the spill policy and never
/// surfaced past the operator internals.
#[derive(thiserror::Error, Debug)]
pub enum JoinError {
    /// The spill policy found no partition to unpin while an append needed
    /// memory.
    #[error("partitioned hash join out of memory: {0}")]
    OutOfMemory(String),

    /// A partition exceeded the maximum repartitioning depth, meaning the
    /// join keys are too skewed for repartitioning to split the data.
    #[error(
        "partitioned hash join cannot repartition partition beyond level {max_depth}: \
         {bytes} bytes / {rows} rows of build data share too few distinct keys"
    )]
    RepartitionLimitExceeded {
        max_depth: usize,
        bytes: usize,
        rows: usize,
    },

    /// A broken internal invariant. Always a bug.
    #[error("partitioned hash join internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Arrow {
        #[from]
        source: ArrowError,
    },

    #[error(transparent)]
    DataFusion {
        #[from]
        source: DataFusionError,
    },
}

impl From<JoinError> for DataFusionError {
    fn from(value: JoinError) -> Self {
        match value {
            JoinError::DataFusion { source } => source,
            JoinError::Arrow { source } => DataFusionError::ArrowError(Box::new(source), None),
            JoinError::OutOfMemory(_) | JoinError::RepartitionLimitExceeded { .. } => {
                DataFusionError::ResourcesExhausted(value.to_string())
            }
            JoinError::Internal(_) => DataFusionError::Internal(value.to_string()),
        }
    }
}
