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

//! Probing a hash-resident partition and emitting rows per join operation.
//!
//! Candidate pairs come from the hash-table chains; key equality and the
//! residual predicate are re-checked before any row is emitted or marked.
//! Probe side is the left child, build side the right child, so `Left*`
//! operations key off probe-row match state and `Right*` operations off the
//! build rows' matched bits.

use std::sync::Arc;

use arrow::array::{
    builder::{UInt32Builder, UInt64Builder},
    new_null_array, Array, ArrayRef, RecordBatch, UInt32Array, UInt64Array,
};
use arrow::compute::take;
use arrow::datatypes::SchemaRef;
use datafusion::common::{JoinType, Result as DFResult};

use super::hash_context::JoinHashContext;
use super::hash_table::JoinHashTable;

/// Whether the operation emits build rows that saw no probe match after the
/// probe side is exhausted.
pub(crate) fn needs_unmatched_build(join_type: JoinType) -> bool {
    matches!(
        join_type,
        JoinType::Right | JoinType::Full | JoinType::RightAnti
    )
}

/// Whether matched build rows must have their matched bit set up front.
/// Right semi also marks, but does so while emitting so each build row is
/// emitted exactly once across probe batches.
fn marks_build(join_type: JoinType) -> bool {
    matches!(
        join_type,
        JoinType::Right | JoinType::Full | JoinType::RightAnti
    )
}

/// Probe one batch against a partition's hash table, producing output
/// batches of at most `batch_size` rows. `probe_hashes` must be computed
/// with the partition's level seed.
pub(crate) fn probe_hash_resident(
    ctx: &JoinHashContext,
    join_type: JoinType,
    output_schema: &SchemaRef,
    table: &mut JoinHashTable,
    probe_batch: &RecordBatch,
    probe_hashes: &[u64],
    batch_size: usize,
) -> DFResult<Vec<RecordBatch>> {
    debug_assert_eq!(probe_hashes.len(), probe_batch.num_rows());

    // Candidate pairs: every build row whose key hash collides with the
    // probe row's hash.
    let mut candidate_build: Vec<u64> = Vec::new();
    let mut candidate_probe: Vec<u32> = Vec::new();
    for (probe_row, hash) in probe_hashes.iter().enumerate() {
        for build_row in table.chain(*hash) {
            candidate_build.push(build_row);
            candidate_probe.push(probe_row as u32);
        }
    }

    let build_batch = table.batch().clone();
    let build_keys = table.key_arrays().to_vec();
    let probe_keys = ctx.eval_probe_keys(probe_batch)?;

    let (build_indices, probe_indices) = ctx.equal_key_pairs(
        &build_keys,
        &probe_keys,
        UInt64Array::from(candidate_build),
        UInt32Array::from(candidate_probe),
    )?;
    let (build_indices, probe_indices) =
        ctx.apply_residual(&build_batch, probe_batch, build_indices, probe_indices)?;

    if marks_build(join_type) {
        for build_row in build_indices.values().iter() {
            table.set_matched(*build_row as usize);
        }
    }

    let mut probe_matched = vec![false; probe_batch.num_rows()];
    for probe_row in probe_indices.values().iter() {
        probe_matched[*probe_row as usize] = true;
    }

    let output = match join_type {
        JoinType::Inner | JoinType::Right => {
            joined_rows(output_schema, probe_batch, &build_batch, || {
                let mut build = UInt64Builder::with_capacity(build_indices.len());
                let mut probe = UInt32Builder::with_capacity(probe_indices.len());
                for (b, p) in build_indices.values().iter().zip(probe_indices.values().iter()) {
                    build.append_value(*b);
                    probe.append_value(*p);
                }
                (build.finish(), probe.finish())
            })?
        }
        JoinType::Left | JoinType::Full => {
            // matched pairs, then each unmatched probe row NULL-extended
            joined_rows(output_schema, probe_batch, &build_batch, || {
                let unmatched = probe_matched.iter().filter(|m| !**m).count();
                let mut build = UInt64Builder::with_capacity(build_indices.len() + unmatched);
                let mut probe = UInt32Builder::with_capacity(probe_indices.len() + unmatched);
                for (b, p) in build_indices.values().iter().zip(probe_indices.values().iter()) {
                    build.append_value(*b);
                    probe.append_value(*p);
                }
                for (probe_row, matched) in probe_matched.iter().enumerate() {
                    if !matched {
                        build.append_null();
                        probe.append_value(probe_row as u32);
                    }
                }
                (build.finish(), probe.finish())
            })?
        }
        JoinType::LeftSemi => {
            let rows: Vec<u32> = collect_flagged(&probe_matched, true);
            probe_only_rows(output_schema, probe_batch, &rows)?
        }
        JoinType::LeftAnti => {
            let rows: Vec<u32> = collect_flagged(&probe_matched, false);
            probe_only_rows(output_schema, probe_batch, &rows)?
        }
        JoinType::RightSemi => {
            // emit each build row once, on its first surviving match; the
            // matched bit carries the emitted-already state across batches
            let mut rows: Vec<u64> = Vec::new();
            for build_row in build_indices.values().iter() {
                if !table.is_matched(*build_row as usize) {
                    table.set_matched(*build_row as usize);
                    rows.push(*build_row);
                }
            }
            build_only_rows(output_schema, &build_batch, &rows)?
        }
        // marked above; rows surface from the unmatched-build sweep
        JoinType::RightAnti => None,
        other => {
            return Err(datafusion::common::DataFusionError::NotImplemented(format!(
                "partitioned hash join does not support {other:?}"
            )))
        }
    };

    Ok(match output {
        Some(batch) => slice_output(batch, batch_size),
        None => Vec::new(),
    })
}

/// Emit the unmatched build rows of a completed partition, in hash-table row
/// order, sliced to `batch_size`. Used for right outer, full outer and right
/// anti joins after the probe side is exhausted.
pub(crate) fn unmatched_build_batches(
    join_type: JoinType,
    output_schema: &SchemaRef,
    table: &JoinHashTable,
    batch_size: usize,
) -> DFResult<Vec<RecordBatch>> {
    debug_assert!(needs_unmatched_build(join_type));
    let unmatched = table.unmatched_rows();
    let mut out = Vec::new();
    for chunk in unmatched.chunks(batch_size) {
        let batch = match join_type {
            JoinType::RightAnti => build_only_rows(output_schema, table.batch(), chunk)?,
            _ => {
                // probe columns NULL-extended alongside the build rows
                let build_columns = take_build_columns(
                    table.batch(),
                    &UInt64Array::from(chunk.to_vec()),
                )?;
                let probe_width = output_schema.fields().len() - table.batch().num_columns();
                let mut columns: Vec<ArrayRef> = output_schema.fields()[..probe_width]
                    .iter()
                    .map(|f| new_null_array(f.data_type(), chunk.len()))
                    .collect();
                columns.extend(build_columns);
                Some(RecordBatch::try_new(Arc::clone(output_schema), columns)?)
            }
        };
        if let Some(batch) = batch {
            out.extend(slice_output(batch, batch_size));
        }
    }
    Ok(out)
}

fn collect_flagged(flags: &[bool], want: bool) -> Vec<u32> {
    flags
        .iter()
        .enumerate()
        .filter(|(_, &m)| m == want)
        .map(|(i, _)| i as u32)
        .collect()
}

/// Assemble probe ⨝ build output rows from index arrays. NULL build indices
/// produce NULL-extended build columns.
fn joined_rows(
    output_schema: &SchemaRef,
    probe_batch: &RecordBatch,
    build_batch: &RecordBatch,
    make_indices: impl FnOnce() -> (UInt64Array, UInt32Array),
) -> DFResult<Option<RecordBatch>> {
    let (build_indices, probe_indices) = make_indices();
    if probe_indices.is_empty() {
        return Ok(None);
    }
    let mut columns: Vec<ArrayRef> = probe_batch
        .columns()
        .iter()
        .map(|col| take(col.as_ref(), &probe_indices, None))
        .collect::<Result<Vec<_>, _>>()?;
    columns.extend(take_build_columns(build_batch, &build_indices)?);
    Ok(Some(RecordBatch::try_new(
        Arc::clone(output_schema),
        columns,
    )?))
}

fn probe_only_rows(
    output_schema: &SchemaRef,
    probe_batch: &RecordBatch,
    rows: &[u32],
) -> DFResult<Option<RecordBatch>> {
    if rows.is_empty() {
        return Ok(None);
    }
    let indices = UInt32Array::from(rows.to_vec());
    let columns = probe_batch
        .columns()
        .iter()
        .map(|col| take(col.as_ref(), &indices, None))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(RecordBatch::try_new(
        Arc::clone(output_schema),
        columns,
    )?))
}

fn build_only_rows(
    output_schema: &SchemaRef,
    build_batch: &RecordBatch,
    rows: &[u64],
) -> DFResult<Option<RecordBatch>> {
    if rows.is_empty() {
        return Ok(None);
    }
    let indices = UInt64Array::from(rows.to_vec());
    let columns = build_batch
        .columns()
        .iter()
        .map(|col| take(col.as_ref(), &indices, None))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(RecordBatch::try_new(
        Arc::clone(output_schema),
        columns,
    )?))
}

/// Gather build columns by (possibly NULL) indices. An empty build side can
/// only be referenced through NULL indices, which `take` cannot serve, so
/// NULL columns are materialized directly.
fn take_build_columns(
    build_batch: &RecordBatch,
    indices: &UInt64Array,
) -> DFResult<Vec<ArrayRef>> {
    if build_batch.num_rows() == 0 {
        debug_assert_eq!(indices.null_count(), indices.len());
        return Ok(build_batch
            .schema()
            .fields()
            .iter()
            .map(|f| new_null_array(f.data_type(), indices.len()))
            .collect());
    }
    build_batch
        .columns()
        .iter()
        .map(|col| take(col.as_ref(), indices, None).map_err(Into::into))
        .collect()
}

/// Split an output batch into slices of at most `batch_size` rows, dropping
/// empty ones. The slices are zero-copy views.
fn slice_output(batch: RecordBatch, batch_size: usize) -> Vec<RecordBatch> {
    let num_rows = batch.num_rows();
    if num_rows == 0 {
        return Vec::new();
    }
    if num_rows <= batch_size {
        return vec![batch];
    }
    let mut out = Vec::with_capacity(num_rows.div_ceil(batch_size));
    let mut offset = 0;
    while offset < num_rows {
        let len = batch_size.min(num_rows - offset);
        out.push(batch.slice(offset, len));
        offset += len;
    }
    out
}
