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

//! Memory-bounded partitioned hash join for Apache DataFusion.
//!
//! The operator joins a build-side and a probe-side record batch stream under
//! a fixed memory budget enforced by the runtime's memory pool. When the build
//! side exceeds the budget, partitions are spilled to scratch disk as Arrow
//! IPC streams and recursively repartitioned until each piece fits.

// Require `Arc::clone(&x)` over `x.clone()` for reference-counted pointers,
// so refcount bumps stay visually distinct from deep copies.
#![deny(clippy::clone_on_ref_ptr)]

mod errors;
pub mod execution;

pub use errors::JoinError;
pub use execution::join::PartitionedHashJoinExec;
