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

//! A partition: one hash-disjoint shard of build (and possibly probe) rows,
//! the unit of spilling.

use std::sync::Arc;

use arrow::compute::concat_batches;
use arrow::datatypes::SchemaRef;
use datafusion::common::Result as DFResult;
use datafusion::execution::disk_manager::DiskManager;
use datafusion::execution::memory_pool::MemoryReservation;

use super::hash_context::JoinHashContext;
use super::hash_table::JoinHashTable;
use super::tuple_stream::BufferedBatchStream;

pub(crate) struct Partition {
    /// Recursion depth: 0 for partitions fed from the child inputs, one more
    /// per repartitioning step. Never decreases.
    pub level: usize,
    /// Build rows assigned to this partition. Writable only until the hash
    /// table is built.
    pub build_rows: BufferedBatchStream,
    /// Probe rows buffered for a spilled partition; absent while the
    /// partition is in memory.
    pub probe_rows: Option<BufferedBatchStream>,
    /// Present iff the partition's build side is resident in memory.
    pub hash_tbl: Option<JoinHashTable>,
    is_closed: bool,
}

impl Partition {
    pub fn new(level: usize, build_schema: SchemaRef, disk_manager: Arc<DiskManager>) -> Self {
        Self {
            level,
            build_rows: BufferedBatchStream::new_pinned(
                build_schema,
                "hash join build rows",
                disk_manager,
            ),
            probe_rows: None,
            hash_tbl: None,
            is_closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed
    }

    /// A partition is spilled once its build stream is unpinned. Before the
    /// hash-table phase this means it took a spill under memory pressure;
    /// afterwards it is exactly the partitions without a hash table.
    pub fn is_spilled(&self) -> bool {
        !self.build_rows.is_pinned()
    }

    pub fn num_build_rows(&self) -> usize {
        match &self.hash_tbl {
            Some(table) => table.num_rows(),
            None => self.build_rows.num_rows(),
        }
    }

    /// The probe stream for a spilled partition, created unpinned on first
    /// use so probe rows write straight through to scratch.
    pub fn probe_stream(
        &mut self,
        probe_schema: &SchemaRef,
        disk_manager: &Arc<DiskManager>,
    ) -> &mut BufferedBatchStream {
        self.probe_rows.get_or_insert_with(|| {
            BufferedBatchStream::new_unpinned(
                Arc::clone(probe_schema),
                "hash join probe rows",
                Arc::clone(disk_manager),
            )
        })
    }

    /// Unpin the build stream, writing its pages to scratch. Returns the
    /// bytes released.
    pub fn spill(&mut self, reservation: &mut MemoryReservation) -> DFResult<usize> {
        debug_assert!(self.hash_tbl.is_none(), "cannot spill a hash-resident partition");
        self.build_rows.unpin(reservation)
    }

    /// Pin the build rows and construct the hash table from them. Build rows
    /// cannot be appended after this succeeds. Returns `false` when the
    /// partition does not fit in memory; it is then left spilled.
    pub fn build_hash_table(
        &mut self,
        ctx: &JoinHashContext,
        reservation: &mut MemoryReservation,
    ) -> DFResult<bool> {
        debug_assert!(!self.is_closed);
        if self.hash_tbl.is_some() {
            return Ok(true);
        }
        if !self.build_rows.pin(reservation)? {
            return Ok(false);
        }

        let (batches, data_bytes) = self.build_rows.take_batches();
        let batch = concat_batches(&self.build_rows.schema(), &batches)?;

        let overhead = JoinHashTable::overhead(batch.num_rows());
        if reservation.try_grow(overhead).is_err() {
            drop(batch);
            self.build_rows.restore_batches(batches, data_bytes);
            self.build_rows.unpin(reservation)?;
            return Ok(false);
        }

        let key_arrays = ctx.eval_build_keys(&batch)?;
        let mut hashes = Vec::new();
        ctx.hash_keys(&key_arrays, self.level, &mut hashes)?;

        self.hash_tbl = Some(JoinHashTable::new(
            batch,
            key_arrays,
            &hashes,
            data_bytes + overhead,
        ));
        Ok(true)
    }

    /// Release every resource this partition holds. Safe to call more than
    /// once; the second call releases nothing further.
    pub fn close(&mut self, reservation: &mut MemoryReservation) {
        if self.is_closed {
            return;
        }
        self.is_closed = true;
        if let Some(table) = self.hash_tbl.take() {
            reservation.shrink(table.reserved());
        }
        self.build_rows.close(reservation);
        if let Some(probe) = self.probe_rows.as_mut() {
            probe.close(reservation);
        }
    }
}

/// Spill policy: choose the partition to unpin when an append hits memory
/// pressure. Prefers the largest non-closed, currently-pinned build stream;
/// ties go to the lowest partition index. `None` means nothing is unpinnable
/// and the caller must fail with out-of-memory.
pub(crate) fn choose_spill_victim(partitions: &[Partition]) -> Option<usize> {
    let mut victim: Option<(usize, usize)> = None;
    for (idx, partition) in partitions.iter().enumerate() {
        if partition.is_closed() || partition.is_spilled() || partition.hash_tbl.is_some() {
            continue;
        }
        let bytes = partition.build_rows.pinned_bytes();
        if bytes == 0 {
            continue;
        }
        match victim {
            Some((best_bytes, _)) if bytes <= best_bytes => {}
            _ => victim = Some((bytes, idx)),
        }
    }
    victim.map(|(_, idx)| idx)
}
