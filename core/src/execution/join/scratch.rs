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

//! Reusable scratch buffers for routing a batch's rows to partitions.
//!
//! A prefix-sum pass computes contiguous row-index regions per partition in a
//! single sweep, so each partition's rows can be gathered with one `take`
//! call instead of filtering the batch once per partition.

use arrow::array::{ArrayRef, RecordBatch, UInt32Array};
use arrow::compute::take;
use datafusion::common::Result as DFResult;

use super::hash_context::JoinHashContext;
use super::PARTITION_FANOUT;

#[derive(Default)]
pub(crate) struct ScratchSpace {
    /// Level-seeded hash of each row's join keys.
    hashes: Vec<u64>,
    /// Partition id assigned to each row.
    partition_ids: Vec<u32>,
    /// Row indices grouped by partition, ascending within each group.
    partition_row_indices: Vec<u32>,
    /// `partition_starts[k]..partition_starts[k+1]` is the slice of
    /// `partition_row_indices` belonging to partition k.
    partition_starts: Vec<u32>,
    /// Per-partition write position while scattering rows into their groups.
    scatter_cursor: [u32; PARTITION_FANOUT],
}

impl ScratchSpace {
    /// Hash the key columns at `level` and build the routing index for the
    /// batch those keys were evaluated from.
    pub fn route(
        &mut self,
        ctx: &JoinHashContext,
        key_arrays: &[ArrayRef],
        level: usize,
    ) -> DFResult<()> {
        ctx.hash_keys(key_arrays, level, &mut self.hashes)?;
        let num_rows = self.hashes.len();

        self.partition_ids.resize(num_rows, 0);
        for (i, hash) in self.hashes.iter().enumerate() {
            self.partition_ids[i] = (*hash as u32) & (PARTITION_FANOUT as u32 - 1);
        }

        self.group_rows_by_partition(num_rows);
        Ok(())
    }

    /// Group row indices by partition without materializing one `Vec` per
    /// partition: count group sizes, lay the groups out back to back, then
    /// scatter each row into its group's next free slot.
    fn group_rows_by_partition(&mut self, num_rows: usize) {
        let partition_ids = &self.partition_ids[..num_rows];

        let mut group_len = [0u32; PARTITION_FANOUT];
        for pid in partition_ids {
            group_len[*pid as usize] += 1;
        }

        self.partition_starts.clear();
        let mut offset = 0u32;
        for len in group_len {
            self.partition_starts.push(offset);
            offset += len;
        }
        self.partition_starts.push(offset);

        self.scatter_cursor
            .copy_from_slice(&self.partition_starts[..PARTITION_FANOUT]);
        self.partition_row_indices.resize(num_rows, 0);
        for (row, pid) in partition_ids.iter().enumerate() {
            let slot = &mut self.scatter_cursor[*pid as usize];
            self.partition_row_indices[*slot as usize] = row as u32;
            *slot += 1;
        }
    }

    /// Row indices belonging to `partition_id`.
    pub fn partition_slice(&self, partition_id: usize) -> &[u32] {
        let start = self.partition_starts[partition_id] as usize;
        let end = self.partition_starts[partition_id + 1] as usize;
        &self.partition_row_indices[start..end]
    }

    pub fn partition_len(&self, partition_id: usize) -> usize {
        (self.partition_starts[partition_id + 1] - self.partition_starts[partition_id]) as usize
    }

    /// Gather the sub-batch for `partition_id`. Returns the whole batch
    /// (zero-copy) when every row routed there.
    pub fn take_partition(
        &self,
        batch: &RecordBatch,
        partition_id: usize,
    ) -> DFResult<Option<RecordBatch>> {
        let row_indices = self.partition_slice(partition_id);
        if row_indices.is_empty() {
            return Ok(None);
        }
        if row_indices.len() == batch.num_rows() {
            return Ok(Some(batch.clone()));
        }
        let indices_array = UInt32Array::from(row_indices.to_vec());
        let columns = batch
            .columns()
            .iter()
            .map(|col| take(col.as_ref(), &indices_array, None))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(RecordBatch::try_new(batch.schema(), columns)?))
    }

    /// Gather the hashes matching a `take_partition` sub-batch, in the same
    /// row order.
    pub fn partition_hashes(&self, partition_id: usize) -> Vec<u64> {
        self.partition_slice(partition_id)
            .iter()
            .map(|&i| self.hashes[i as usize])
            .collect()
    }
}
