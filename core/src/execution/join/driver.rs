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

//! The join state machine.
//!
//! One driver instance runs per `execute()` call, on its own task, pushing
//! output batches through a bounded channel; the channel provides the
//! cooperative suspension points and backpressure. All resource release is
//! structural: dropping the driver releases the reservation, every partition
//! and every spill file, so cancellation and error exits share the close
//! path.

use std::collections::VecDeque;
use std::sync::Arc;

use arrow::array::RecordBatch;
use arrow::datatypes::SchemaRef;
use datafusion::common::{DataFusionError, JoinType, Result as DFResult};
use datafusion::execution::disk_manager::DiskManager;
use datafusion::execution::memory_pool::MemoryReservation;
use datafusion::physical_plan::SendableRecordBatchStream;
use futures::StreamExt;
use log::{debug, info};
use tokio::sync::mpsc::Sender;

use crate::errors::JoinError;

use super::exec::PartitionedHashJoinMetrics;
use super::hash_context::JoinHashContext;
use super::partition::{choose_spill_victim, Partition};
use super::probe;
use super::scratch::ScratchSpace;
use super::tuple_stream::BatchCursor;
use super::{JoinState, MAX_PARTITION_DEPTH, PARTITION_FANOUT};

pub(crate) struct JoinDriver {
    ctx: JoinHashContext,
    join_type: JoinType,
    output_schema: SchemaRef,
    build_schema: SchemaRef,
    probe_schema: SchemaRef,
    batch_size: usize,
    max_in_mem_build_tables: usize,
    disk_manager: Arc<DiskManager>,
    reservation: MemoryReservation,
    metrics: PartitionedHashJoinMetrics,
    state: JoinState,
    /// Level of the partitions currently being written to.
    current_level: usize,
    /// The active fanout while partitioning build or probe input.
    partitions: Vec<Partition>,
    /// Partitions spilled on both sides, awaiting the spilled-partition loop.
    spilled: VecDeque<Partition>,
    /// Completed partitions whose unmatched build rows must still be output.
    output_build: VecDeque<Partition>,
    scratch: ScratchSpace,
}

impl JoinDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: JoinHashContext,
        join_type: JoinType,
        output_schema: SchemaRef,
        build_schema: SchemaRef,
        probe_schema: SchemaRef,
        batch_size: usize,
        max_in_mem_build_tables: usize,
        disk_manager: Arc<DiskManager>,
        reservation: MemoryReservation,
        metrics: PartitionedHashJoinMetrics,
    ) -> Self {
        Self {
            ctx,
            join_type,
            output_schema,
            build_schema,
            probe_schema,
            batch_size,
            max_in_mem_build_tables,
            disk_manager,
            reservation,
            metrics,
            state: JoinState::PartitioningBuild,
            current_level: 0,
            partitions: Vec::new(),
            spilled: VecDeque::new(),
            output_build: VecDeque::new(),
            scratch: ScratchSpace::default(),
        }
    }

    /// Drive the join to completion, sending output batches on `tx`.
    pub async fn run(
        mut self,
        mut build_input: SendableRecordBatchStream,
        mut probe_input: SendableRecordBatchStream,
        tx: &Sender<DFResult<RecordBatch>>,
    ) -> DFResult<()> {
        debug!("partitioned hash join starting in state {}", self.state);
        self.new_fanout(0);
        {
            // Time handles share their underlying counter, so a clone keeps
            // the timer guard from borrowing `self` across the loop.
            let build_time = self.metrics.build_time.clone();
            let _timer = build_time.timer();
            while let Some(batch) = build_input.next().await {
                let batch = batch?;
                if batch.num_rows() == 0 {
                    continue;
                }
                self.metrics.build_input_batches.add(1);
                self.metrics.build_input_rows.add(batch.num_rows());
                self.route_build_batch(&batch)?;
            }
            drop(build_input);
            self.build_hash_tables()?;
        }
        self.log_build_summary();

        self.update_state(JoinState::ProcessingProbe);
        {
            let probe_time = self.metrics.probe_time.clone();
            let _timer = probe_time.timer();
            while let Some(batch) = probe_input.next().await {
                let batch = batch?;
                if batch.num_rows() == 0 {
                    continue;
                }
                self.metrics.input_batches.add(1);
                self.metrics.input_rows.add(batch.num_rows());
                self.process_probe_batch(&batch, tx).await?;
            }
            drop(probe_input);
        }
        self.cleanup_hash_partitions();
        self.output_unmatched(tx).await?;

        while let Some(partition) = self.spilled.pop_front() {
            self.prepare_next_partition(partition, tx).await?;
            self.output_unmatched(tx).await?;
        }

        self.close_all();
        Ok(())
    }

    fn update_state(&mut self, next: JoinState) {
        debug!("partitioned hash join transition {} -> {}", self.state, next);
        self.state = next;
    }

    /// Install a fresh set of `PARTITION_FANOUT` empty partitions at `level`.
    fn new_fanout(&mut self, level: usize) {
        debug_assert!(self.partitions.iter().all(Partition::is_closed));
        self.current_level = level;
        self.partitions = (0..PARTITION_FANOUT)
            .map(|_| {
                Partition::new(
                    level,
                    Arc::clone(&self.build_schema),
                    Arc::clone(&self.disk_manager),
                )
            })
            .collect();
        self.metrics.partitions_created.add(PARTITION_FANOUT);
        self.metrics.max_partition_level.set_max(level);
    }

    /// Route one build batch across the active fanout.
    fn route_build_batch(&mut self, batch: &RecordBatch) -> DFResult<()> {
        let key_arrays = self.ctx.eval_build_keys(batch)?;
        self.scratch.route(&self.ctx, &key_arrays, self.current_level)?;

        let total_rows = batch.num_rows();
        let total_bytes = batch.get_array_memory_size();
        for idx in 0..PARTITION_FANOUT {
            let rows = self.scratch.partition_len(idx);
            if rows == 0 {
                continue;
            }
            let sub = self
                .scratch
                .take_partition(batch, idx)?
                .expect("non-empty partition slice");
            // estimate the sub-batch proportionally; `take` shares no buffers
            // with the parent but the ratio avoids re-walking the arrays
            let bytes = (total_bytes as u64 * rows as u64 / total_rows as u64) as usize;
            self.append_build_rows(idx, &sub, bytes)?;
        }
        Ok(())
    }

    /// Append build rows to partition `idx`, spilling partitions until the
    /// append fits. Fails with out-of-memory when nothing is left to unpin.
    fn append_build_rows(
        &mut self,
        idx: usize,
        batch: &RecordBatch,
        bytes: usize,
    ) -> DFResult<()> {
        loop {
            if self.partitions[idx]
                .build_rows
                .try_append(batch, bytes, &mut self.reservation)?
            {
                return Ok(());
            }
            match choose_spill_victim(&self.partitions) {
                Some(victim) => self.spill_partition(victim)?,
                None => {
                    return Err(JoinError::OutOfMemory(format!(
                        "no partition left to spill while appending {bytes} build bytes at \
                         level {}",
                        self.current_level
                    ))
                    .into())
                }
            }
        }
    }

    fn spill_partition(&mut self, idx: usize) -> DFResult<()> {
        let freed = self.partitions[idx].spill(&mut self.reservation)?;
        info!(
            "partitioned hash join spilling partition {idx} at level {}: {freed} bytes released",
            self.partitions[idx].level,
        );
        self.metrics.num_spilled_partitions.add(1);
        if freed > 0 {
            self.metrics.spill_count.add(1);
            self.metrics.spilled_bytes.add(freed);
        }
        Ok(())
    }

    /// Attempt to materialize a hash table for every partition in the active
    /// fanout, visiting already-pinned partitions first to avoid re-reading
    /// scratch for partitions that will only spill again. Partitions that do
    /// not fit (or exceed the in-memory table cap) are left spilled.
    fn build_hash_tables(&mut self) -> DFResult<()> {
        let mut order: Vec<usize> = (0..self.partitions.len()).collect();
        order.sort_by_key(|&i| (self.partitions[i].is_spilled(), i));

        let mut built = 0usize;
        for idx in order {
            if built >= self.max_in_mem_build_tables {
                if !self.partitions[idx].is_spilled() {
                    self.spill_partition(idx)?;
                }
                continue;
            }
            if self.partitions[idx].build_hash_table(&self.ctx, &mut self.reservation)? {
                built += 1;
                let table = self.partitions[idx]
                    .hash_tbl
                    .as_ref()
                    .expect("table just built");
                self.metrics.num_hash_buckets.add(table.num_buckets());
            } else if !self.partitions[idx].is_spilled() {
                self.spill_partition(idx)?;
            }
        }
        Ok(())
    }

    /// Route one probe batch: join rows belonging to hash-resident
    /// partitions, spill rows belonging to spilled partitions.
    async fn process_probe_batch(
        &mut self,
        batch: &RecordBatch,
        tx: &Sender<DFResult<RecordBatch>>,
    ) -> DFResult<()> {
        let key_arrays = self.ctx.eval_probe_keys(batch)?;
        self.scratch.route(&self.ctx, &key_arrays, self.current_level)?;

        let total_rows = batch.num_rows();
        let total_bytes = batch.get_array_memory_size();
        for idx in 0..PARTITION_FANOUT {
            let rows = self.scratch.partition_len(idx);
            if rows == 0 {
                continue;
            }
            let sub = self
                .scratch
                .take_partition(batch, idx)?
                .expect("non-empty partition slice");

            if self.partitions[idx].hash_tbl.is_some() {
                let hashes = self.scratch.partition_hashes(idx);
                let outputs = probe::probe_hash_resident(
                    &self.ctx,
                    self.join_type,
                    &self.output_schema,
                    self.partitions[idx].hash_tbl.as_mut().expect("checked"),
                    &sub,
                    &hashes,
                    self.batch_size,
                )?;
                for out in outputs {
                    self.send(tx, out).await?;
                }
            } else {
                let bytes = (total_bytes as u64 * rows as u64 / total_rows as u64) as usize;
                self.partitions[idx]
                    .probe_stream(&self.probe_schema, &self.disk_manager)
                    .try_append(&sub, bytes, &mut self.reservation)?;
            }
        }
        Ok(())
    }

    /// Called when the probe input is exhausted. Hash-resident partitions
    /// are either queued for the unmatched-build sweep or closed; spilled
    /// partitions move to the spilled queue for later processing.
    fn cleanup_hash_partitions(&mut self) {
        let partitions = std::mem::take(&mut self.partitions);
        for mut partition in partitions {
            if partition.is_closed() {
                continue;
            }
            if partition.hash_tbl.is_some() {
                if probe::needs_unmatched_build(self.join_type) && partition.num_build_rows() > 0
                {
                    self.output_build.push_back(partition);
                } else {
                    partition.close(&mut self.reservation);
                }
            } else {
                self.spilled.push_back(partition);
            }
        }
    }

    /// Sweep queued partitions' hash tables, emitting build rows whose
    /// matched bit is unset, then close them.
    async fn output_unmatched(&mut self, tx: &Sender<DFResult<RecordBatch>>) -> DFResult<()> {
        while let Some(mut partition) = self.output_build.pop_front() {
            let batches = {
                let table = partition.hash_tbl.as_ref().expect("queued without table");
                probe::unmatched_build_batches(
                    self.join_type,
                    &self.output_schema,
                    table,
                    self.batch_size,
                )?
            };
            for batch in batches {
                self.send(tx, batch).await?;
            }
            partition.close(&mut self.reservation);
        }
        Ok(())
    }

    /// Pop-side of the spilled-partition loop: either the partition's build
    /// side fits and its probe rows stream through the fresh hash table, or
    /// it is repartitioned one level deeper.
    async fn prepare_next_partition(
        &mut self,
        mut partition: Partition,
        tx: &Sender<DFResult<RecordBatch>>,
    ) -> DFResult<()> {
        if partition.build_hash_table(&self.ctx, &mut self.reservation)? {
            self.update_state(JoinState::ProbingSpilledPartition);
            info!(
                "partitioned hash join probing spilled partition at level {}: {} build rows",
                partition.level,
                partition.num_build_rows(),
            );

            let mut cursor = match partition.probe_rows.as_mut() {
                Some(stream) => stream.read()?,
                None => BatchCursor::Empty,
            };
            let mut hashes = Vec::new();
            while let Some(batch) = cursor.next_batch()? {
                self.metrics.input_batches.add(1);
                self.metrics.input_rows.add(batch.num_rows());
                let key_arrays = self.ctx.eval_probe_keys(&batch)?;
                self.ctx.hash_keys(&key_arrays, partition.level, &mut hashes)?;
                let outputs = probe::probe_hash_resident(
                    &self.ctx,
                    self.join_type,
                    &self.output_schema,
                    partition.hash_tbl.as_mut().expect("table just built"),
                    &batch,
                    &hashes,
                    self.batch_size,
                )?;
                for out in outputs {
                    self.send(tx, out).await?;
                }
            }

            if probe::needs_unmatched_build(self.join_type) && partition.num_build_rows() > 0 {
                self.output_build.push_back(partition);
            } else {
                partition.close(&mut self.reservation);
            }
            return Ok(());
        }

        // The build side does not fit: repartition one level deeper, unless
        // that would exceed the depth limit (skew repartitioning cannot fix).
        let next_level = partition.level + 1;
        if next_level > MAX_PARTITION_DEPTH {
            return Err(JoinError::RepartitionLimitExceeded {
                max_depth: MAX_PARTITION_DEPTH,
                bytes: partition.build_rows.bytes(),
                rows: partition.build_rows.num_rows(),
            }
            .into());
        }
        self.update_state(JoinState::Repartitioning);
        self.metrics.num_repartitions.add(1);
        info!(
            "partitioned hash join repartitioning {} build bytes from level {} to level {}",
            partition.build_rows.bytes(),
            partition.level,
            next_level,
        );

        self.new_fanout(next_level);
        self.update_state(JoinState::PartitioningBuild);
        let parent_bytes = partition.build_rows.bytes().max(1);
        let mut cursor = partition.build_rows.read()?;
        while let Some(batch) = cursor.next_batch()? {
            self.route_build_batch(&batch)?;
        }
        drop(cursor);

        let largest = self
            .partitions
            .iter()
            .map(|p| p.build_rows.bytes())
            .max()
            .unwrap_or(0);
        let percent = largest * 100 / parent_bytes;
        self.metrics.largest_partition_percent.set_max(percent);

        self.build_hash_tables()?;

        self.update_state(JoinState::ProcessingProbe);
        let mut cursor = match partition.probe_rows.as_mut() {
            Some(stream) => stream.read()?,
            None => BatchCursor::Empty,
        };
        while let Some(batch) = cursor.next_batch()? {
            self.process_probe_batch(&batch, tx).await?;
        }
        drop(cursor);
        partition.close(&mut self.reservation);

        self.cleanup_hash_partitions();
        Ok(())
    }

    async fn send(&self, tx: &Sender<DFResult<RecordBatch>>, batch: RecordBatch) -> DFResult<()> {
        self.metrics.baseline.record_output(batch.num_rows());
        tx.send(Ok(batch)).await.map_err(|_| {
            DataFusionError::Execution(
                "partitioned hash join output stream disconnected".to_string(),
            )
        })
    }

    fn log_build_summary(&self) {
        let spilled = self.partitions.iter().filter(|p| p.is_spilled()).count();
        let rows: usize = self.partitions.iter().map(Partition::num_build_rows).sum();
        let bytes: usize = self.partitions.iter().map(|p| p.build_rows.bytes()).sum();
        info!(
            "partitioned hash join build phase complete: {} partitions ({spilled} spilled), \
             {rows} rows, {bytes} bytes",
            self.partitions.len(),
        );
    }

    /// Release every partition and the whole reservation. Idempotent, and
    /// also reached structurally via Drop on error or cancellation.
    fn close_all(&mut self) {
        let Self {
            partitions,
            spilled,
            output_build,
            reservation,
            ..
        } = self;
        for partition in partitions.iter_mut() {
            partition.close(reservation);
        }
        while let Some(mut partition) = spilled.pop_front() {
            partition.close(reservation);
        }
        while let Some(mut partition) = output_build.pop_front() {
            partition.close(reservation);
        }
        reservation.free();
    }
}
