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

//! Hash-related functionality shared by the build and probe phases:
//! evaluating join-key expressions, level-seeded hashing, key equality and
//! the residual (non-equi) predicate.

use std::sync::Arc;

use ahash::RandomState;
use arrow::array::{Array, ArrayRef, BooleanArray, RecordBatch, UInt32Array, UInt64Array};
use arrow::compute::kernels::boolean::and;
use arrow::compute::kernels::cmp::eq;
use arrow::compute::{filter, take};
use datafusion::common::hash_utils::create_hashes;
use datafusion::common::{JoinSide, Result as DFResult};
use datafusion::physical_expr::PhysicalExpr;
use datafusion::physical_plan::joins::utils::JoinFilter;

/// Random state used to hash join keys into partitions and hash-table
/// buckets. The recursion level is folded into the first seed so that each
/// repartitioning level distributes the same keys independently; two rows
/// with equal keys always hash identically at a given level.
pub(crate) fn partition_random_state(level: usize) -> RandomState {
    RandomState::with_seeds(
        0x9fb2_1c65_1e98_df25 ^ (level as u64),
        0x3a8b_7c9d_1e2f_4056,
        0x1619_8a2d_21b4_3c61,
        0x8867_0f96_46ba_0f07,
    )
}

/// Evaluates the equi-join key expressions over build and probe rows,
/// produces level-seeded hashes, and checks key equality and the residual
/// predicate for candidate row pairs.
pub(crate) struct JoinHashContext {
    /// Key expressions over the build child's schema.
    build_keys: Vec<Arc<dyn PhysicalExpr>>,
    /// Key expressions over the probe child's schema.
    probe_keys: Vec<Arc<dyn PhysicalExpr>>,
    /// Residual non-equi conjuncts, evaluated after key equality.
    residual: Option<JoinFilter>,
}

impl JoinHashContext {
    pub fn new(
        build_keys: Vec<Arc<dyn PhysicalExpr>>,
        probe_keys: Vec<Arc<dyn PhysicalExpr>>,
        residual: Option<JoinFilter>,
    ) -> Self {
        Self {
            build_keys,
            probe_keys,
            residual,
        }
    }

    pub fn eval_build_keys(&self, batch: &RecordBatch) -> DFResult<Vec<ArrayRef>> {
        eval_keys(&self.build_keys, batch)
    }

    pub fn eval_probe_keys(&self, batch: &RecordBatch) -> DFResult<Vec<ArrayRef>> {
        eval_keys(&self.probe_keys, batch)
    }

    /// Hash the given key columns with the seed for `level`, filling `out`.
    pub fn hash_keys(
        &self,
        key_arrays: &[ArrayRef],
        level: usize,
        out: &mut Vec<u64>,
    ) -> DFResult<()> {
        let num_rows = key_arrays.first().map(|a| a.len()).unwrap_or(0);
        out.clear();
        out.resize(num_rows, 0);
        let random_state = partition_random_state(level);
        create_hashes(key_arrays, &random_state, out)?;
        Ok(())
    }

    /// Retain the candidate pairs whose keys are equal. NULL keys never
    /// compare equal, so NULL-keyed rows drop out of every pair here and
    /// surface only through the outer-side NULL extension paths.
    pub fn equal_key_pairs(
        &self,
        build_key_arrays: &[ArrayRef],
        probe_key_arrays: &[ArrayRef],
        build_indices: UInt64Array,
        probe_indices: UInt32Array,
    ) -> DFResult<(UInt64Array, UInt32Array)> {
        if build_indices.is_empty() {
            return Ok((build_indices, probe_indices));
        }
        let mut equal: Option<BooleanArray> = None;
        for (build_col, probe_col) in build_key_arrays.iter().zip(probe_key_arrays.iter()) {
            let build_taken = take(build_col.as_ref(), &build_indices, None)?;
            let probe_taken = take(probe_col.as_ref(), &probe_indices, None)?;
            let col_eq = eq(&build_taken, &probe_taken)?;
            equal = Some(match equal {
                // `and` propagates nulls, so a NULL comparison poisons the
                // conjunction and the filter below drops the pair
                Some(acc) => and(&acc, &col_eq)?,
                None => col_eq,
            });
        }
        let predicate = equal.expect("join requires at least one key pair");
        filter_pair_indices(&predicate, build_indices, probe_indices)
    }

    /// Apply the residual predicate to the surviving pairs, if one exists.
    pub fn apply_residual(
        &self,
        build_batch: &RecordBatch,
        probe_batch: &RecordBatch,
        build_indices: UInt64Array,
        probe_indices: UInt32Array,
    ) -> DFResult<(UInt64Array, UInt32Array)> {
        let Some(residual) = &self.residual else {
            return Ok((build_indices, probe_indices));
        };
        if build_indices.is_empty() {
            return Ok((build_indices, probe_indices));
        }

        // Assemble the intermediate batch the filter expression expects: one
        // column per ColumnIndex, gathered from the owning side.
        let columns = residual
            .column_indices()
            .iter()
            .map(|ci| match ci.side {
                JoinSide::Left => {
                    take(probe_batch.column(ci.index).as_ref(), &probe_indices, None)
                }
                JoinSide::Right => {
                    take(build_batch.column(ci.index).as_ref(), &build_indices, None)
                }
                JoinSide::None => unreachable!("residual filter on mark-join side"),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let intermediate =
            RecordBatch::try_new(residual.schema().clone(), columns)?;

        let num_rows = intermediate.num_rows();
        let predicate = residual
            .expression()
            .evaluate(&intermediate)?
            .into_array(num_rows)?;
        let predicate = predicate
            .as_any()
            .downcast_ref::<BooleanArray>()
            .ok_or_else(|| {
                datafusion::common::DataFusionError::Internal(
                    "join residual predicate did not evaluate to a boolean array".to_string(),
                )
            })?
            .clone();
        filter_pair_indices(&predicate, build_indices, probe_indices)
    }
}

fn eval_keys(keys: &[Arc<dyn PhysicalExpr>], batch: &RecordBatch) -> DFResult<Vec<ArrayRef>> {
    keys.iter()
        .map(|expr| {
            expr.evaluate(batch)
                .and_then(|cv| cv.into_array(batch.num_rows()))
        })
        .collect()
}

/// Keep the pair entries whose predicate slot is `true` (NULL counts as
/// false, per equi-join NULL semantics).
fn filter_pair_indices(
    predicate: &BooleanArray,
    build_indices: UInt64Array,
    probe_indices: UInt32Array,
) -> DFResult<(UInt64Array, UInt32Array)> {
    let build = filter(&build_indices, predicate)?;
    let probe = filter(&probe_indices, predicate)?;
    Ok((
        build
            .as_any()
            .downcast_ref::<UInt64Array>()
            .expect("filter preserves array type")
            .clone(),
        probe
            .as_any()
            .downcast_ref::<UInt32Array>()
            .expect("filter preserves array type")
            .clone(),
    ))
}
