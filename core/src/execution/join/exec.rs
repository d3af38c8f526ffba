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

//! The `ExecutionPlan` wrapper around the join state machine.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use arrow::array::RecordBatch;
use arrow::datatypes::{Field, Schema, SchemaRef};
use datafusion::common::{plan_err, JoinType, Result as DFResult};
use datafusion::execution::context::TaskContext;
use datafusion::execution::memory_pool::MemoryConsumer;
use datafusion::physical_expr::{EquivalenceProperties, PhysicalExpr};
use datafusion::physical_plan::execution_plan::{Boundedness, EmissionType};
use datafusion::physical_plan::joins::utils::JoinFilter;
use datafusion::physical_plan::metrics::{
    BaselineMetrics, Count, ExecutionPlanMetricsSet, Gauge, MetricBuilder, MetricsSet, Time,
};
use datafusion::physical_plan::stream::RecordBatchStreamAdapter;
use datafusion::physical_plan::{
    DisplayAs, DisplayFormatType, ExecutionPlan, Partitioning, PlanProperties,
    SendableRecordBatchStream,
};
use tokio::sync::mpsc;

use super::driver::JoinDriver;
use super::hash_context::JoinHashContext;
use super::PARTITION_FANOUT;

/// Profile counters for one join instance.
pub(crate) struct PartitionedHashJoinMetrics {
    /// Output rows and elapsed compute.
    pub baseline: BaselineMetrics,
    /// Time spent partitioning the build side and building hash tables.
    pub build_time: Time,
    /// Time spent partitioning and joining the probe side.
    pub probe_time: Time,
    pub build_input_batches: Count,
    pub build_input_rows: Count,
    pub input_batches: Count,
    pub input_rows: Count,
    /// Number of spill flushes to scratch disk.
    pub spill_count: Count,
    pub spilled_bytes: Count,
    /// Number of partitions that transitioned to the spilled state.
    pub num_spilled_partitions: Count,
    /// Number of spilled partitions that had to be repartitioned.
    pub num_repartitions: Count,
    pub partitions_created: Count,
    pub num_hash_buckets: Count,
    /// Deepest recursion level any partition reached.
    pub max_partition_level: Gauge,
    /// Largest child share (percent of the parent's build bytes) observed
    /// after a repartition; values far above 100 / fanout indicate skew.
    pub largest_partition_percent: Gauge,
}

impl PartitionedHashJoinMetrics {
    fn new(metrics: &ExecutionPlanMetricsSet, partition: usize) -> Self {
        Self {
            baseline: BaselineMetrics::new(metrics, partition),
            build_time: MetricBuilder::new(metrics).subset_time("build_time", partition),
            probe_time: MetricBuilder::new(metrics).subset_time("probe_time", partition),
            build_input_batches: MetricBuilder::new(metrics)
                .counter("build_input_batches", partition),
            build_input_rows: MetricBuilder::new(metrics).counter("build_input_rows", partition),
            input_batches: MetricBuilder::new(metrics).counter("input_batches", partition),
            input_rows: MetricBuilder::new(metrics).counter("input_rows", partition),
            spill_count: MetricBuilder::new(metrics).spill_count(partition),
            spilled_bytes: MetricBuilder::new(metrics).spilled_bytes(partition),
            num_spilled_partitions: MetricBuilder::new(metrics)
                .counter("num_spilled_partitions", partition),
            num_repartitions: MetricBuilder::new(metrics).counter("num_repartitions", partition),
            partitions_created: MetricBuilder::new(metrics)
                .counter("partitions_created", partition),
            num_hash_buckets: MetricBuilder::new(metrics).counter("num_hash_buckets", partition),
            max_partition_level: MetricBuilder::new(metrics)
                .gauge("max_partition_level", partition),
            largest_partition_percent: MetricBuilder::new(metrics)
                .gauge("largest_partition_percent", partition),
        }
    }
}

/// Partitioned hash join execution plan.
///
/// The left child is the probe side, the right child the build side. The
/// build side is fanned out into [`PARTITION_FANOUT`] partitions; partitions
/// that do not fit in the memory budget spill to scratch disk and are
/// processed (or recursively repartitioned) after the probe input is
/// exhausted.
#[derive(Debug)]
pub struct PartitionedHashJoinExec {
    /// Probe input.
    probe: Arc<dyn ExecutionPlan>,
    /// Build input.
    build: Arc<dyn ExecutionPlan>,
    /// Equi-join key pairs: (probe key, build key).
    on: Vec<(Arc<dyn PhysicalExpr>, Arc<dyn PhysicalExpr>)>,
    /// Residual non-equi conjuncts applied after key equality.
    filter: Option<JoinFilter>,
    join_type: JoinType,
    /// Cap on simultaneously resident hash tables. Defaults to the fanout;
    /// tests lower it to force the spill paths on small inputs.
    max_in_mem_build_tables: usize,
    schema: SchemaRef,
    cache: PlanProperties,
    metrics: ExecutionPlanMetricsSet,
}

impl PartitionedHashJoinExec {
    pub fn try_new(
        probe: Arc<dyn ExecutionPlan>,
        build: Arc<dyn ExecutionPlan>,
        on: Vec<(Arc<dyn PhysicalExpr>, Arc<dyn PhysicalExpr>)>,
        filter: Option<JoinFilter>,
        join_type: JoinType,
    ) -> DFResult<Self> {
        if on.is_empty() {
            return plan_err!("PartitionedHashJoinExec requires at least one equi-join key pair");
        }
        if !matches!(
            join_type,
            JoinType::Inner
                | JoinType::Left
                | JoinType::Right
                | JoinType::Full
                | JoinType::LeftSemi
                | JoinType::LeftAnti
                | JoinType::RightSemi
                | JoinType::RightAnti
        ) {
            return plan_err!("PartitionedHashJoinExec does not support {join_type:?}");
        }

        let schema = join_output_schema(&probe.schema(), &build.schema(), join_type);
        let cache = PlanProperties::new(
            EquivalenceProperties::new(Arc::clone(&schema)),
            Partitioning::UnknownPartitioning(
                probe.properties().output_partitioning().partition_count(),
            ),
            EmissionType::Both,
            Boundedness::Bounded,
        );
        Ok(Self {
            probe,
            build,
            on,
            filter,
            join_type,
            max_in_mem_build_tables: PARTITION_FANOUT,
            schema,
            cache,
            metrics: ExecutionPlanMetricsSet::new(),
        })
    }

    /// Lower the cap on in-memory hash tables. A testing knob: it forces the
    /// spill and spilled-partition paths without a tiny memory budget.
    pub fn with_max_in_mem_build_tables(mut self, cap: usize) -> Self {
        self.max_in_mem_build_tables = cap;
        self
    }

    pub fn join_type(&self) -> JoinType {
        self.join_type
    }
}

impl DisplayAs for PartitionedHashJoinExec {
    fn fmt_as(&self, t: DisplayFormatType, f: &mut fmt::Formatter) -> fmt::Result {
        match t {
            DisplayFormatType::Default
            | DisplayFormatType::Verbose
            | DisplayFormatType::TreeRender => {
                let on: Vec<String> = self.on.iter().map(|(p, b)| format!("({p}, {b})")).collect();
                write!(
                    f,
                    "PartitionedHashJoinExec: join_type={:?}, on=[{}], fanout={}",
                    self.join_type,
                    on.join(", "),
                    PARTITION_FANOUT,
                )
            }
        }
    }
}

impl ExecutionPlan for PartitionedHashJoinExec {
    fn name(&self) -> &str {
        "PartitionedHashJoinExec"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn children(&self) -> Vec<&Arc<dyn ExecutionPlan>> {
        vec![&self.probe, &self.build]
    }

    fn with_new_children(
        self: Arc<Self>,
        children: Vec<Arc<dyn ExecutionPlan>>,
    ) -> DFResult<Arc<dyn ExecutionPlan>> {
        Ok(Arc::new(
            PartitionedHashJoinExec::try_new(
                Arc::clone(&children[0]),
                Arc::clone(&children[1]),
                self.on.clone(),
                self.filter.clone(),
                self.join_type,
            )?
            .with_max_in_mem_build_tables(self.max_in_mem_build_tables),
        ))
    }

    fn properties(&self) -> &PlanProperties {
        &self.cache
    }

    fn execute(
        &self,
        partition: usize,
        context: Arc<TaskContext>,
    ) -> DFResult<SendableRecordBatchStream> {
        let probe_stream = self.probe.execute(partition, Arc::clone(&context))?;
        let build_stream = self.build.execute(partition, Arc::clone(&context))?;

        let join_metrics = PartitionedHashJoinMetrics::new(&self.metrics, partition);
        let reservation = MemoryConsumer::new(format!("PartitionedHashJoinExec[{partition}]"))
            .with_can_spill(true)
            .register(&context.runtime_env().memory_pool);

        let probe_keys: Vec<_> = self.on.iter().map(|(p, _)| Arc::clone(p)).collect();
        let build_keys: Vec<_> = self.on.iter().map(|(_, b)| Arc::clone(b)).collect();
        let ctx = JoinHashContext::new(build_keys, probe_keys, self.filter.clone());

        let driver = JoinDriver::new(
            ctx,
            self.join_type,
            Arc::clone(&self.schema),
            self.build.schema(),
            self.probe.schema(),
            context.session_config().batch_size(),
            self.max_in_mem_build_tables,
            Arc::clone(&context.runtime_env().disk_manager),
            reservation,
            join_metrics,
        );

        // The driver runs on its own task; the bounded channel provides the
        // cooperative suspension points, and dropping the receiver cancels
        // the join at its next send.
        let (tx, rx) = mpsc::channel::<DFResult<RecordBatch>>(2);
        tokio::spawn(async move {
            if let Err(e) = driver.run(build_stream, probe_stream, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
        });

        let output = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|batch| (batch, rx))
        });
        Ok(Box::pin(RecordBatchStreamAdapter::new(
            Arc::clone(&self.schema),
            output,
        )))
    }

    fn metrics(&self) -> Option<MetricsSet> {
        Some(self.metrics.clone_inner())
    }
}

/// Output schema for the supported join operations: probe columns then build
/// columns for the joined shapes (with the outer side's opposite made
/// nullable), a single side's columns for semi/anti shapes.
fn join_output_schema(probe: &Schema, build: &Schema, join_type: JoinType) -> SchemaRef {
    let plain = |schema: &Schema| -> Vec<Field> {
        schema.fields().iter().map(|f| f.as_ref().clone()).collect()
    };
    let nullable = |schema: &Schema| -> Vec<Field> {
        schema
            .fields()
            .iter()
            .map(|f| f.as_ref().clone().with_nullable(true))
            .collect()
    };
    let fields = match join_type {
        JoinType::Inner => [plain(probe), plain(build)].concat(),
        JoinType::Left => [plain(probe), nullable(build)].concat(),
        JoinType::Right => [nullable(probe), plain(build)].concat(),
        JoinType::Full => [nullable(probe), nullable(build)].concat(),
        JoinType::LeftSemi | JoinType::LeftAnti => plain(probe),
        JoinType::RightSemi | JoinType::RightAnti => plain(build),
        other => unreachable!("unsupported join type {other:?} validated at construction"),
    };
    Arc::new(Schema::new(fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Int32Array, StringArray};
    use arrow::datatypes::DataType;
    use arrow::util::display::array_value_to_string;
    use datafusion::common::{JoinSide, ScalarValue};
    use datafusion::datasource::memory::MemorySourceConfig;
    use datafusion::datasource::source::DataSourceExec;
    use datafusion::execution::memory_pool::{FairSpillPool, MemoryPool};
    use datafusion::execution::runtime_env::RuntimeEnvBuilder;
    use datafusion::logical_expr::Operator;
    use datafusion::physical_expr::expressions::{BinaryExpr, Column, Literal};
    use datafusion::physical_plan::joins::utils::ColumnIndex;
    use datafusion::prelude::{SessionConfig, SessionContext};
    use futures::{StreamExt, TryStreamExt};
    use std::time::Duration;

    fn test_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int32, true),
            Field::new("val", DataType::Utf8, false),
        ]))
    }

    fn make_batch(ids: &[i32], vals: &[&str]) -> RecordBatch {
        RecordBatch::try_new(
            test_schema(),
            vec![
                Arc::new(Int32Array::from(ids.to_vec())),
                Arc::new(StringArray::from(vals.to_vec())),
            ],
        )
        .unwrap()
    }

    fn make_batch_opt(ids: &[Option<i32>], vals: &[&str]) -> RecordBatch {
        RecordBatch::try_new(
            test_schema(),
            vec![
                Arc::new(Int32Array::from(ids.to_vec())),
                Arc::new(StringArray::from(vals.to_vec())),
            ],
        )
        .unwrap()
    }

    /// N rows with sequential IDs and a padding string column to control
    /// memory size; each row is roughly 100 bytes.
    fn make_large_batch(start_id: i32, count: usize) -> RecordBatch {
        let ids: Vec<i32> = (start_id..start_id + count as i32).collect();
        let padding = "x".repeat(100);
        let vals: Vec<&str> = (0..count).map(|_| padding.as_str()).collect();
        make_batch(&ids, &vals)
    }

    fn source(batches: Vec<RecordBatch>) -> Arc<dyn ExecutionPlan> {
        let schema = batches
            .first()
            .map(|b| b.schema())
            .unwrap_or_else(test_schema);
        Arc::new(DataSourceExec::new(Arc::new(
            MemorySourceConfig::try_new(&[batches], schema, None).unwrap(),
        )))
    }

    fn empty_source() -> Arc<dyn ExecutionPlan> {
        source(vec![RecordBatch::new_empty(test_schema())])
    }

    fn join_on() -> Vec<(Arc<dyn PhysicalExpr>, Arc<dyn PhysicalExpr>)> {
        vec![(
            Arc::new(Column::new("id", 0)) as Arc<dyn PhysicalExpr>,
            Arc::new(Column::new("id", 0)) as Arc<dyn PhysicalExpr>,
        )]
    }

    /// SessionContext backed by a bounded spill pool, plus the pool handle
    /// for reservation assertions.
    fn bounded_context(pool_bytes: usize) -> (SessionContext, Arc<FairSpillPool>) {
        let pool = Arc::new(FairSpillPool::new(pool_bytes));
        let runtime = RuntimeEnvBuilder::new()
            .with_memory_pool(Arc::<FairSpillPool>::clone(&pool))
            .build_arc()
            .unwrap();
        let ctx = SessionContext::new_with_config_rt(SessionConfig::new(), runtime);
        (ctx, pool)
    }

    async fn collect_join(
        join: &PartitionedHashJoinExec,
        ctx: &SessionContext,
    ) -> Vec<RecordBatch> {
        let stream = join.execute(0, ctx.task_ctx()).unwrap();
        stream.try_collect().await.unwrap()
    }

    /// Render every output row as strings ("·" for NULL), sorted, so
    /// multisets compare directly.
    fn rows(batches: &[RecordBatch]) -> Vec<Vec<String>> {
        let mut out = Vec::new();
        for batch in batches {
            for row in 0..batch.num_rows() {
                out.push(
                    batch
                        .columns()
                        .iter()
                        .map(|col| {
                            if col.is_null(row) {
                                "·".to_string()
                            } else {
                                array_value_to_string(col, row).unwrap()
                            }
                        })
                        .collect::<Vec<_>>(),
                );
            }
        }
        out.sort();
        out
    }

    fn expected(rows: &[&[&str]]) -> Vec<Vec<String>> {
        let mut out: Vec<Vec<String>> = rows
            .iter()
            .map(|r| r.iter().map(|s| s.to_string()).collect())
            .collect();
        out.sort();
        out
    }

    fn num_output_rows(batches: &[RecordBatch]) -> usize {
        batches.iter().map(|b| b.num_rows()).sum()
    }

    fn metric(join: &PartitionedHashJoinExec, name: &str) -> usize {
        join.metrics()
            .unwrap()
            .sum_by_name(name)
            .map(|v| v.as_usize())
            .unwrap_or(0)
    }

    /// The driver task releases its reservation when it exits; give it a
    /// moment after cancellation or an error.
    async fn wait_for_release(pool: &Arc<FairSpillPool>) {
        for _ in 0..200 {
            if pool.reserved() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} bytes still reserved after join ended", pool.reserved());
    }

    fn scenario_inputs() -> (Arc<dyn ExecutionPlan>, Arc<dyn ExecutionPlan>) {
        let probe = source(vec![make_batch(&[2, 3, 4], &["X", "Y", "Z"])]);
        let build = source(vec![make_batch(&[1, 2, 3], &["A", "B", "C"])]);
        (probe, build)
    }

    #[tokio::test]
    async fn inner_join_no_spill() {
        let ctx = SessionContext::new();
        let (probe, build) = scenario_inputs();
        let join =
            PartitionedHashJoinExec::try_new(probe, build, join_on(), None, JoinType::Inner)
                .unwrap();
        let batches = collect_join(&join, &ctx).await;
        assert_eq!(
            rows(&batches),
            expected(&[&["2", "X", "2", "B"], &["3", "Y", "3", "C"]])
        );
        assert_eq!(metric(&join, "num_repartitions"), 0);
    }

    #[tokio::test]
    async fn left_outer_join_no_spill() {
        let ctx = SessionContext::new();
        let (probe, build) = scenario_inputs();
        let join =
            PartitionedHashJoinExec::try_new(probe, build, join_on(), None, JoinType::Left)
                .unwrap();
        let batches = collect_join(&join, &ctx).await;
        assert_eq!(
            rows(&batches),
            expected(&[
                &["2", "X", "2", "B"],
                &["3", "Y", "3", "C"],
                &["4", "Z", "·", "·"],
            ])
        );
    }

    #[tokio::test]
    async fn right_outer_join_no_spill() {
        let ctx = SessionContext::new();
        let (probe, build) = scenario_inputs();
        let join =
            PartitionedHashJoinExec::try_new(probe, build, join_on(), None, JoinType::Right)
                .unwrap();
        let batches = collect_join(&join, &ctx).await;
        assert_eq!(
            rows(&batches),
            expected(&[
                &["2", "X", "2", "B"],
                &["3", "Y", "3", "C"],
                &["·", "·", "1", "A"],
            ])
        );
    }

    #[tokio::test]
    async fn full_outer_join_no_spill() {
        let ctx = SessionContext::new();
        let (probe, build) = scenario_inputs();
        let join =
            PartitionedHashJoinExec::try_new(probe, build, join_on(), None, JoinType::Full)
                .unwrap();
        let batches = collect_join(&join, &ctx).await;
        assert_eq!(
            rows(&batches),
            expected(&[
                &["2", "X", "2", "B"],
                &["3", "Y", "3", "C"],
                &["4", "Z", "·", "·"],
                &["·", "·", "1", "A"],
            ])
        );
    }

    #[tokio::test]
    async fn semi_joins_emit_each_row_once() {
        let ctx = SessionContext::new();

        let (probe, build) = scenario_inputs();
        let join =
            PartitionedHashJoinExec::try_new(probe, build, join_on(), None, JoinType::LeftSemi)
                .unwrap();
        let batches = collect_join(&join, &ctx).await;
        assert_eq!(rows(&batches), expected(&[&["2", "X"], &["3", "Y"]]));

        // duplicate probe matches, within and across batches, must not
        // duplicate the build row
        let probe = source(vec![
            make_batch(&[2, 2], &["X1", "X2"]),
            make_batch(&[2, 3], &["X3", "Y"]),
        ]);
        let build = source(vec![make_batch(&[1, 2, 3], &["A", "B", "C"])]);
        let join =
            PartitionedHashJoinExec::try_new(probe, build, join_on(), None, JoinType::RightSemi)
                .unwrap();
        let batches = collect_join(&join, &ctx).await;
        assert_eq!(rows(&batches), expected(&[&["2", "B"], &["3", "C"]]));
    }

    #[tokio::test]
    async fn anti_joins_emit_only_unmatched_rows() {
        let ctx = SessionContext::new();

        let (probe, build) = scenario_inputs();
        let join =
            PartitionedHashJoinExec::try_new(probe, build, join_on(), None, JoinType::LeftAnti)
                .unwrap();
        let batches = collect_join(&join, &ctx).await;
        assert_eq!(rows(&batches), expected(&[&["4", "Z"]]));

        let (probe, build) = scenario_inputs();
        let join =
            PartitionedHashJoinExec::try_new(probe, build, join_on(), None, JoinType::RightAnti)
                .unwrap();
        let batches = collect_join(&join, &ctx).await;
        assert_eq!(rows(&batches), expected(&[&["1", "A"]]));
    }

    #[tokio::test]
    async fn duplicate_keys_multiply_inner_matches() {
        let ctx = SessionContext::new();
        let probe = source(vec![make_batch(&[1, 2, 2], &["X", "Y1", "Y2"])]);
        let build = source(vec![make_batch(&[1, 1, 2], &["A1", "A2", "B"])]);
        let join =
            PartitionedHashJoinExec::try_new(probe, build, join_on(), None, JoinType::Inner)
                .unwrap();
        let batches = collect_join(&join, &ctx).await;
        assert_eq!(
            rows(&batches),
            expected(&[
                &["1", "X", "1", "A1"],
                &["1", "X", "1", "A2"],
                &["2", "Y1", "2", "B"],
                &["2", "Y2", "2", "B"],
            ])
        );
    }

    /// Residual predicate `build.id > 2`, evaluated after key equality.
    fn build_id_gt_2_filter() -> JoinFilter {
        let expression = Arc::new(BinaryExpr::new(
            Arc::new(Column::new("id", 0)),
            Operator::Gt,
            Arc::new(Literal::new(ScalarValue::Int32(Some(2)))),
        )) as Arc<dyn PhysicalExpr>;
        let column_indices = vec![ColumnIndex {
            index: 0,
            side: JoinSide::Right,
        }];
        let intermediate_schema = Schema::new(vec![Field::new("id", DataType::Int32, true)]);
        JoinFilter::new(expression, column_indices, Arc::new(intermediate_schema))
    }

    #[tokio::test]
    async fn residual_predicate_runs_after_key_equality() {
        let ctx = SessionContext::new();

        let (probe, build) = scenario_inputs();
        let join = PartitionedHashJoinExec::try_new(
            probe,
            build,
            join_on(),
            Some(build_id_gt_2_filter()),
            JoinType::Inner,
        )
        .unwrap();
        let batches = collect_join(&join, &ctx).await;
        assert_eq!(rows(&batches), expected(&[&["3", "Y", "3", "C"]]));

        // a pair dropped by the residual leaves the probe row unmatched, so
        // the outer path NULL-extends it
        let (probe, build) = scenario_inputs();
        let join = PartitionedHashJoinExec::try_new(
            probe,
            build,
            join_on(),
            Some(build_id_gt_2_filter()),
            JoinType::Left,
        )
        .unwrap();
        let batches = collect_join(&join, &ctx).await;
        assert_eq!(
            rows(&batches),
            expected(&[
                &["2", "X", "·", "·"],
                &["3", "Y", "3", "C"],
                &["4", "Z", "·", "·"],
            ])
        );
    }

    #[tokio::test]
    async fn null_keys_never_match_but_null_extend() {
        let ctx = SessionContext::new();
        let probe = source(vec![make_batch_opt(
            &[None, Some(1), Some(2)],
            &["P0", "P1", "P2"],
        )]);
        let build = source(vec![make_batch_opt(&[None, Some(1)], &["B0", "B1"])]);
        let join =
            PartitionedHashJoinExec::try_new(probe, build, join_on(), None, JoinType::Full)
                .unwrap();
        let batches = collect_join(&join, &ctx).await;
        assert_eq!(
            rows(&batches),
            expected(&[
                &["1", "P1", "1", "B1"],
                &["·", "P0", "·", "·"],
                &["2", "P2", "·", "·"],
                &["·", "·", "·", "B0"],
            ])
        );
    }

    #[tokio::test]
    async fn empty_build_side() {
        let ctx = SessionContext::new();
        let probe_batch = make_batch(&[2, 3, 4], &["X", "Y", "Z"]);

        for (join_type, expected_rows) in [
            (JoinType::Inner, 0),
            (JoinType::Right, 0),
            (JoinType::LeftSemi, 0),
            (JoinType::Left, 3),
            (JoinType::LeftAnti, 3),
        ] {
            let join = PartitionedHashJoinExec::try_new(
                source(vec![probe_batch.clone()]),
                empty_source(),
                join_on(),
                None,
                join_type,
            )
            .unwrap();
            let batches = collect_join(&join, &ctx).await;
            assert_eq!(
                num_output_rows(&batches),
                expected_rows,
                "unexpected output for {join_type:?} with empty build side"
            );
        }
    }

    #[tokio::test]
    async fn empty_probe_side() {
        let ctx = SessionContext::new();
        let build_batch = make_batch(&[1, 2, 3], &["A", "B", "C"]);

        for (join_type, expected_rows) in [
            (JoinType::Inner, 0),
            (JoinType::Left, 0),
            (JoinType::LeftSemi, 0),
            (JoinType::Right, 3),
            (JoinType::Full, 3),
            (JoinType::RightAnti, 3),
        ] {
            let join = PartitionedHashJoinExec::try_new(
                empty_source(),
                source(vec![build_batch.clone()]),
                join_on(),
                None,
                join_type,
            )
            .unwrap();
            let batches = collect_join(&join, &ctx).await;
            assert_eq!(
                num_output_rows(&batches),
                expected_rows,
                "unexpected output for {join_type:?} with empty probe side"
            );
        }
    }

    #[tokio::test]
    async fn mark_joins_are_rejected() {
        let (probe, build) = scenario_inputs();
        let result =
            PartitionedHashJoinExec::try_new(probe, build, join_on(), None, JoinType::LeftMark);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn inner_join_with_forced_spill() {
        let (ctx, pool) = bounded_context(200 * 1024);

        // build ids 0..4000, probe ids 2000..6000: exactly 2000 matches
        let build = source((0..4).map(|i| make_large_batch(i * 1000, 1000)).collect());
        let probe = source(
            (0..4)
                .map(|i| make_large_batch(2000 + i * 1000, 1000))
                .collect(),
        );
        let join =
            PartitionedHashJoinExec::try_new(probe, build, join_on(), None, JoinType::Inner)
                .unwrap();
        let batches = collect_join(&join, &ctx).await;

        assert_eq!(num_output_rows(&batches), 2000);
        assert!(
            metric(&join, "num_spilled_partitions") >= 3,
            "expected at least 3 spilled partitions, saw {}",
            metric(&join, "num_spilled_partitions")
        );
        assert!(metric(&join, "spill_count") >= 1);
        assert!(metric(&join, "spilled_bytes") > 0);
        assert_eq!(pool.reserved(), 0);
    }

    #[tokio::test]
    async fn full_outer_join_with_forced_repartition() {
        let (ctx, pool) = bounded_context(300 * 1024);

        // build ids 0..12000, probe ids 6000..18000: 6000 matched on both
        // sides, 6000 build-only, 6000 probe-only
        let build = source((0..6).map(|i| make_large_batch(i * 2000, 2000)).collect());
        let probe = source(
            (0..6)
                .map(|i| make_large_batch(6000 + i * 2000, 2000))
                .collect(),
        );
        let join =
            PartitionedHashJoinExec::try_new(probe, build, join_on(), None, JoinType::Full)
                .unwrap();
        let batches = collect_join(&join, &ctx).await;

        assert_eq!(num_output_rows(&batches), 18000);
        assert!(
            metric(&join, "max_partition_level") >= 1,
            "expected at least one repartitioning level, saw {}",
            metric(&join, "max_partition_level")
        );
        assert!(metric(&join, "num_repartitions") >= 1);
        assert_eq!(pool.reserved(), 0);
    }

    fn make_mod_batch(start: i32, count: usize, modulus: i32, tag: &str) -> RecordBatch {
        let ids: Vec<i32> = (start..start + count as i32).map(|i| i % modulus).collect();
        let vals: Vec<String> = (start..start + count as i32)
            .map(|i| format!("{tag}{i}{}", "y".repeat(40)))
            .collect();
        let val_refs: Vec<&str> = vals.iter().map(|s| s.as_str()).collect();
        make_batch(&ids, &val_refs)
    }

    #[tokio::test]
    async fn spilling_join_matches_in_memory_join() {
        let build_batches: Vec<RecordBatch> = (0..3)
            .map(|i| make_mod_batch(i * 1000, 1000, 97, "b"))
            .collect();
        let probe_batches: Vec<RecordBatch> = (0..3)
            .map(|i| make_mod_batch(i * 1000, 1000, 89, "p"))
            .collect();

        let ctx = SessionContext::new();
        let join = PartitionedHashJoinExec::try_new(
            source(probe_batches.clone()),
            source(build_batches.clone()),
            join_on(),
            None,
            JoinType::Inner,
        )
        .unwrap();
        let in_memory = rows(&collect_join(&join, &ctx).await);
        assert_eq!(metric(&join, "num_spilled_partitions"), 0);

        let (ctx, pool) = bounded_context(80 * 1024);
        let join = PartitionedHashJoinExec::try_new(
            source(probe_batches),
            source(build_batches),
            join_on(),
            None,
            JoinType::Inner,
        )
        .unwrap();
        let spilled = rows(&collect_join(&join, &ctx).await);
        assert!(metric(&join, "num_spilled_partitions") >= 1);
        assert_eq!(pool.reserved(), 0);

        assert!(!in_memory.is_empty());
        assert_eq!(in_memory, spilled);
    }

    #[tokio::test]
    async fn build_table_cap_forces_spill_paths() {
        let ctx = SessionContext::new();
        let (probe, build) = scenario_inputs();
        let join =
            PartitionedHashJoinExec::try_new(probe, build, join_on(), None, JoinType::Left)
                .unwrap()
                .with_max_in_mem_build_tables(1);
        let batches = collect_join(&join, &ctx).await;
        assert_eq!(
            rows(&batches),
            expected(&[
                &["2", "X", "2", "B"],
                &["3", "Y", "3", "C"],
                &["4", "Z", "·", "·"],
            ])
        );
        assert!(metric(&join, "num_spilled_partitions") >= 3);
    }

    #[tokio::test]
    async fn skew_fails_with_repartition_limit() {
        let (ctx, pool) = bounded_context(128 * 1024);

        // every row shares one key: repartitioning can never split this
        let skew_ids = vec![7i32; 1000];
        let padding = "x".repeat(100);
        let skew_vals: Vec<&str> = (0..1000).map(|_| padding.as_str()).collect();
        let build = source(
            (0..3)
                .map(|_| make_batch(&skew_ids, &skew_vals))
                .collect(),
        );
        let probe = source(vec![make_batch(&skew_ids[..100], &skew_vals[..100])]);

        let join =
            PartitionedHashJoinExec::try_new(probe, build, join_on(), None, JoinType::Inner)
                .unwrap();
        let stream = join.execute(0, ctx.task_ctx()).unwrap();
        let result: Result<Vec<RecordBatch>, _> = stream.try_collect().await;

        let err = result.expect_err("skewed join must fail").to_string();
        assert!(
            err.contains("repartition"),
            "unexpected error for skewed join: {err}"
        );
        wait_for_release(&pool).await;
    }

    #[tokio::test]
    async fn cancellation_releases_all_memory() {
        let (ctx, pool) = bounded_context(200 * 1024);
        let build = source((0..4).map(|i| make_large_batch(i * 1000, 1000)).collect());
        let probe = source((0..4).map(|i| make_large_batch(i * 1000, 1000)).collect());
        let join =
            PartitionedHashJoinExec::try_new(probe, build, join_on(), None, JoinType::Inner)
                .unwrap();

        let mut stream = join.execute(0, ctx.task_ctx()).unwrap();
        let first = stream.next().await;
        assert!(first.is_some());
        drop(stream);

        wait_for_release(&pool).await;
    }
}
