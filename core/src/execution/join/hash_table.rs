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

//! In-memory hash index over one partition's build rows.
//!
//! Rows are chained per 64-bit key hash: the bucket map points at the most
//! recently inserted row of a hash, `next` links back to the previous one.
//! Callers walk the chain and re-check key equality and the residual
//! predicate themselves. Each row carries a matched bit driving the
//! outer/anti join semantics.

use arrow::array::builder::BooleanBufferBuilder;
use arrow::array::{ArrayRef, RecordBatch};
use hashbrown::HashMap;

pub(crate) struct JoinHashTable {
    /// All build rows of the partition, concatenated into one batch.
    batch: RecordBatch,
    /// Key columns evaluated over `batch`.
    key_arrays: Vec<ArrayRef>,
    /// Key hash to 1-based index of the chain head. 0 is reserved for "no
    /// entry" in `next`.
    map: HashMap<u64, u64>,
    /// 1-based index of the previous row with the same hash; 0 ends a chain.
    next: Vec<u64>,
    /// One matched bit per build row.
    matched: BooleanBufferBuilder,
    /// Bytes accounted against the operator reservation: the build rows plus
    /// the table overhead, released when the owning partition closes.
    reserved: usize,
}

impl JoinHashTable {
    /// Approximate reservation required for the table structures over
    /// `num_rows` rows, in addition to the build rows themselves.
    pub fn overhead(num_rows: usize) -> usize {
        // map entry + chain link per row, one matched bit per row
        num_rows * (std::mem::size_of::<(u64, u64)>() + std::mem::size_of::<u64>())
            + num_rows.div_ceil(8)
    }

    /// Build the table from a partition's concatenated build rows. `hashes`
    /// must align with the batch's rows and use the partition's level seed.
    pub fn new(
        batch: RecordBatch,
        key_arrays: Vec<ArrayRef>,
        hashes: &[u64],
        reserved: usize,
    ) -> Self {
        let num_rows = batch.num_rows();
        debug_assert_eq!(hashes.len(), num_rows);

        let mut map: HashMap<u64, u64> = HashMap::with_capacity(num_rows);
        let mut next = vec![0u64; num_rows];
        for (row, hash) in hashes.iter().enumerate() {
            let slot = map.entry(*hash).or_insert(0);
            next[row] = *slot;
            *slot = row as u64 + 1;
        }

        let mut matched = BooleanBufferBuilder::new(num_rows);
        matched.append_n(num_rows, false);

        Self {
            batch,
            key_arrays,
            map,
            next,
            matched,
            reserved,
        }
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn num_buckets(&self) -> usize {
        self.map.len()
    }

    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    pub fn key_arrays(&self) -> &[ArrayRef] {
        &self.key_arrays
    }

    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Iterate the build-row indices whose key hash equals `hash`.
    pub fn chain(&self, hash: u64) -> ChainIter<'_> {
        ChainIter {
            next: &self.next,
            current: self.map.get(&hash).copied().unwrap_or(0),
        }
    }

    pub fn set_matched(&mut self, row: usize) {
        self.matched.set_bit(row, true);
    }

    pub fn is_matched(&self, row: usize) -> bool {
        self.matched.get_bit(row)
    }

    /// Build-row indices whose matched bit is still unset, in row order.
    pub fn unmatched_rows(&self) -> Vec<u64> {
        (0..self.num_rows() as u64)
            .filter(|&row| !self.matched.get_bit(row as usize))
            .collect()
    }
}

pub(crate) struct ChainIter<'a> {
    next: &'a [u64],
    current: u64,
}

impl Iterator for ChainIter<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.current == 0 {
            return None;
        }
        let row = self.current - 1;
        self.current = self.next[row as usize];
        Some(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int32Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn table_for(hashes: &[u64]) -> JoinHashTable {
        let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int32, false)]));
        let values: Vec<i32> = (0..hashes.len() as i32).collect();
        let array: ArrayRef = Arc::new(Int32Array::from(values));
        let batch = RecordBatch::try_new(schema, vec![Arc::clone(&array)]).unwrap();
        JoinHashTable::new(batch, vec![array], hashes, 0)
    }

    #[test]
    fn chains_group_rows_by_hash() {
        let table = table_for(&[10, 20, 10, 10, 20]);
        assert_eq!(table.num_buckets(), 2);

        let mut rows: Vec<u64> = table.chain(10).collect();
        rows.sort_unstable();
        assert_eq!(rows, vec![0, 2, 3]);

        let mut rows: Vec<u64> = table.chain(20).collect();
        rows.sort_unstable();
        assert_eq!(rows, vec![1, 4]);

        assert!(table.chain(30).next().is_none());
    }

    #[test]
    fn matched_bits_drive_unmatched_sweep() {
        let mut table = table_for(&[1, 2, 3, 4]);
        assert_eq!(table.unmatched_rows(), vec![0, 1, 2, 3]);

        table.set_matched(1);
        table.set_matched(3);
        assert!(table.is_matched(1));
        assert!(!table.is_matched(0));
        assert_eq!(table.unmatched_rows(), vec![0, 2]);
    }
}
