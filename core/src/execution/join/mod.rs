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

//! Partitioned hash join operator.
//!
//! The join runs in distinct phases:
//!  1. Consume all build input and partition it. No hash tables are
//!     maintained yet.
//!  2. Construct hash tables for as many partitions as fit in memory.
//!  3. Consume all probe rows. Rows belonging to spilled partitions are
//!     spilled as well; rows belonging to hash-resident partitions produce
//!     output immediately.
//!  4. Iterate over the spilled partitions, construct the hash table from the
//!     spilled build rows and process the spilled probe rows. If a partition
//!     is still too big, repeat steps 1-4 with its build and probe rows as
//!     input, one level deeper.

use std::fmt;

mod driver;
mod exec;
mod hash_context;
mod hash_table;
mod partition;
mod probe;
mod scratch;
mod tuple_stream;

pub use exec::PartitionedHashJoinExec;

/// Number of partitions the build and probe inputs are fanned out into at
/// each level. Must be a power of two.
pub const PARTITION_FANOUT: usize = 4;

/// log2(PARTITION_FANOUT): number of hash bits consumed per level.
pub const NUM_PARTITIONING_BITS: u32 = PARTITION_FANOUT.trailing_zeros();

/// Maximum number of times a partition may be repartitioned. The largest
/// build side processable within budget M is M * FANOUT^MAX_PARTITION_DEPTH;
/// a partition that still does not fit at this depth is irrecoverable skew.
pub const MAX_PARTITION_DEPTH: usize = 4;

/// I/O buffer size for spill file reads and writes. The default
/// BufReader/BufWriter size (8 KB) is far too small for multi-GB spill files.
pub(crate) const SPILL_IO_BUFFER_SIZE: usize = 1024 * 1024;

const _: () = assert!(PARTITION_FANOUT.is_power_of_two());

/// State of the join. The transition goes from `PartitioningBuild` to
/// `ProcessingProbe`, then `ProbingSpilledPartition` and `Repartitioning`
/// switch back and forth as many times as repartitioning requires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum JoinState {
    /// Partitioning the build child's input across the fanout.
    PartitioningBuild,
    /// Processing the probe child's input: joining against hash-resident
    /// partitions, spilling rows destined for spilled partitions.
    ProcessingProbe,
    /// Probing a single spilled partition whose hash table fits in memory.
    ProbingSpilledPartition,
    /// Repartitioning a single spilled partition across a fresh fanout at
    /// the next level.
    Repartitioning,
}

impl fmt::Display for JoinState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JoinState::PartitioningBuild => "PARTITIONING_BUILD",
            JoinState::ProcessingProbe => "PROCESSING_PROBE",
            JoinState::ProbingSpilledPartition => "PROBING_SPILLED_PARTITION",
            JoinState::Repartitioning => "REPARTITIONING",
        };
        f.write_str(name)
    }
}
