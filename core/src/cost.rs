//! Closed-form cost model for shuffle topologies and task billing.
//!
//! Everything here is advisory: the driver reports these numbers, it never
//! changes behaviour based on them.

use serde::{Deserialize, Serialize};

use crate::executor::InvocationStats;

/// Prices of compute and object-store requests.
///
/// Defaults are AWS Lambda and S3 list prices.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingRates {
    /// Price of one GB-second of worker time.
    pub gb_second: f64,
    /// Price of one worker invocation.
    pub invocation: f64,
    /// Price of one PUT/COPY/POST/LIST request.
    pub write_request: f64,
    /// Price of one GET or other request.
    pub read_request: f64,
}

impl Default for BillingRates {
    fn default() -> Self {
        Self {
            gb_second: 0.000_016_666_7,
            invocation: 0.20 / 1_000_000.0,
            write_request: 0.005 / 1000.0,
            read_request: 0.0004 / 1000.0,
        }
    }
}

impl BillingRates {
    pub fn mb_second(&self) -> f64 {
        self.gb_second / 1024.0
    }

    fn request_pair(&self) -> f64 {
        self.write_request + self.read_request
    }
}

/// Billing of a group of task invocations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionCost {
    pub total_billed_time: f64,
    pub execution_cost: f64,
    pub invocation_cost: f64,
    pub storage_request_cost: f64,
    pub total_cost: f64,
}

/// Shuffle topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShuffleStrategy {
    /// Every mapper writes one shard per reducer: M·N objects.
    Direct,
    /// Shards are first combined within groups of about sqrt(W) workers.
    TwoLevel,
}

/// Request cost of both shuffle topologies for one job shape.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShuffleEstimate {
    pub map_tasks: u32,
    pub reduce_tasks: u32,
    pub direct_cost: f64,
    pub two_level_cost: f64,
    pub recommended: ShuffleStrategy,
}

impl ShuffleEstimate {
    pub fn for_job(model: &CostModel, mappers: u32, reducers: u32) -> Self {
        model.shuffle_estimate(mappers, reducers)
    }

    /// Cost of the cheaper topology.
    pub fn best_cost(&self) -> f64 {
        self.direct_cost.min(self.two_level_cost)
    }
}

/// Pure cost functions over a set of [`BillingRates`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CostModel {
    rates: BillingRates,
}

impl CostModel {
    pub fn new(rates: BillingRates) -> Self {
        Self { rates }
    }

    pub fn rates(&self) -> &BillingRates {
        &self.rates
    }

    /// All-to-all shuffle: one write and one read per (mapper, reducer).
    pub fn direct_shuffle_cost(&self, mappers: u32, reducers: u32) -> f64 {
        (mappers as f64 * reducers as f64) * self.rates.request_pair()
    }

    /// Hierarchical shuffle over `workers` workers: W·sqrt(W) transfers.
    pub fn two_level_shuffle_cost(&self, workers: u32) -> f64 {
        let w = workers as f64;
        w * w.sqrt() * self.rates.request_pair()
    }

    pub fn read_dataset_cost(&self, workers: u32) -> f64 {
        workers as f64 * self.rates.read_request
    }

    pub fn write_dataset_cost(&self, workers: u32) -> f64 {
        workers as f64 * self.rates.write_request
    }

    /// Bill a set of finished invocations.
    ///
    /// Each invocation pays for its memory-seconds, one invocation, its
    /// status and result reads, and the one write of its result.
    pub fn execution_cost<'a, I>(&self, invocations: I) -> ExecutionCost
    where
        I: IntoIterator<Item = &'a InvocationStats>,
    {
        let mut cost = ExecutionCost::default();
        for stats in invocations {
            cost.total_billed_time += stats.worker_exec_time;
            cost.execution_cost +=
                stats.worker_exec_time * self.rates.mb_second() * stats.runtime_memory_mb as f64;
            cost.invocation_cost += self.rates.invocation;
            cost.storage_request_cost += (stats.status_query_count + stats.result_query_count)
                as f64
                * self.rates.read_request;
            cost.storage_request_cost += self.rates.write_request;
        }
        cost.total_cost = cost.execution_cost + cost.invocation_cost + cost.storage_request_cost;
        cost
    }

    /// Compare both topologies for M mappers and N reducers.
    ///
    /// The two-level topology is priced over the larger of the two worker
    /// pools, since that pool bounds the aggregation tier.
    pub fn shuffle_estimate(&self, mappers: u32, reducers: u32) -> ShuffleEstimate {
        let direct_cost = self.direct_shuffle_cost(mappers, reducers);
        let two_level_cost = self.two_level_shuffle_cost(mappers.max(reducers));
        let recommended = if two_level_cost < direct_cost {
            ShuffleStrategy::TwoLevel
        } else {
            ShuffleStrategy::Direct
        };
        ShuffleEstimate {
            map_tasks: mappers,
            reduce_tasks: reducers,
            direct_cost,
            two_level_cost,
            recommended,
        }
    }
}

/// Compute cost of one phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseCosts {
    pub total_cost: f64,
    pub map_cost: ExecutionCost,
    pub red_cost: ExecutionCost,
}

/// Full cost breakdown of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct JobCost {
    pub total_cost: f64,
    pub compute_cost: PhaseCosts,
    pub shuffle_cost: f64,
    pub shuffle_estimate: Option<ShuffleEstimate>,
}

impl JobCost {
    /// Compute cost of both phases plus the direct shuffle actually run.
    pub fn compute(
        model: &CostModel,
        map_stats: &[InvocationStats],
        reduce_stats: &[InvocationStats],
    ) -> Self {
        let map_cost = model.execution_cost(map_stats);
        let red_cost = model.execution_cost(reduce_stats);
        let compute_cost = PhaseCosts {
            total_cost: map_cost.total_cost + red_cost.total_cost,
            map_cost,
            red_cost,
        };
        let mappers = map_stats.len() as u32;
        let reducers = reduce_stats.len() as u32;
        let shuffle_cost = model.direct_shuffle_cost(mappers, reducers);
        Self {
            total_cost: compute_cost.total_cost + shuffle_cost,
            compute_cost,
            shuffle_cost,
            shuffle_estimate: Some(model.shuffle_estimate(mappers, reducers)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskId;

    const EPSILON: f64 = 1e-12;

    fn stats(exec: f64, memory_mb: u32, status: u64, result: u64) -> InvocationStats {
        InvocationStats {
            task_id: TaskId::map(0),
            attempts: 1,
            worker_exec_time: exec,
            worker_start_tstamp: 0.0,
            worker_end_tstamp: exec,
            status_query_count: status,
            result_query_count: result,
            runtime_memory_mb: memory_mb,
        }
    }

    #[test]
    fn test_direct_cost_is_monotonic() {
        let model = CostModel::default();
        for m in 1..20 {
            for n in 1..20 {
                assert!(model.direct_shuffle_cost(m, n) <= model.direct_shuffle_cost(m + 1, n));
                assert!(model.direct_shuffle_cost(m, n) <= model.direct_shuffle_cost(m, n + 1));
            }
        }
    }

    #[test]
    fn test_two_level_grows_slower() {
        let model = CostModel::default();
        // Same worker count on both sides: W·sqrt(W) against W·W.
        assert!(model.two_level_shuffle_cost(100) < model.direct_shuffle_cost(100, 100));
        assert!(model.two_level_shuffle_cost(10) < model.direct_shuffle_cost(10, 10));

        let ratios: Vec<f64> = [4, 16, 64, 256]
            .iter()
            .map(|&w| model.two_level_shuffle_cost(w) / model.direct_shuffle_cost(w, w))
            .collect();
        assert!(ratios.windows(2).all(|pair| pair[1] < pair[0]));

        let expected = 100.0 * 10.0 * (0.005 / 1000.0 + 0.0004 / 1000.0);
        assert!((model.two_level_shuffle_cost(100) - expected).abs() < EPSILON);
    }

    #[test]
    fn test_dataset_costs() {
        let model = CostModel::default();
        assert!((model.read_dataset_cost(1000) - 0.0004).abs() < EPSILON);
        assert!((model.write_dataset_cost(1000) - 0.005).abs() < EPSILON);
    }

    #[test]
    fn test_execution_cost_matches_hand_computation() {
        let model = CostModel::default();
        let invocations = [
            stats(10.0, 1024, 3, 1),
            stats(2.5, 2048, 0, 1),
            stats(4.0, 512, 7, 2),
        ];
        let cost = model.execution_cost(&invocations);

        let mb_sec = 0.0000166667 / 1024.0;
        let execution = 10.0 * 1024.0 * mb_sec + 2.5 * 2048.0 * mb_sec + 4.0 * 512.0 * mb_sec;
        let invocation = 3.0 * 0.20 / 1_000_000.0;
        let reads = (4.0 + 1.0 + 9.0) * 0.0004 / 1000.0;
        let writes = 3.0 * 0.005 / 1000.0;
        let total = execution + invocation + reads + writes;

        assert!((cost.total_billed_time - 16.5).abs() < EPSILON);
        assert!((cost.execution_cost - execution).abs() < EPSILON);
        assert!((cost.invocation_cost - invocation).abs() < EPSILON);
        assert!((cost.storage_request_cost - (reads + writes)).abs() < EPSILON);
        assert!((cost.total_cost - total).abs() < EPSILON);
    }

    #[test]
    fn test_estimate_recommends_cheaper_topology() {
        let model = CostModel::default();
        assert_eq!(
            model.shuffle_estimate(100, 100).recommended,
            ShuffleStrategy::TwoLevel
        );
        assert_eq!(model.shuffle_estimate(1, 1).recommended, ShuffleStrategy::Direct);

        let estimate = ShuffleEstimate::for_job(&model, 1, 4);
        assert_eq!(estimate.recommended, ShuffleStrategy::Direct);
        assert_eq!(estimate.best_cost(), estimate.direct_cost);
    }

    #[test]
    fn test_job_cost_adds_shuffle() {
        let model = CostModel::default();
        let maps = [stats(1.0, 1024, 1, 1), stats(1.0, 1024, 1, 1)];
        let reduces = [stats(2.0, 1024, 0, 1)];
        let cost = JobCost::compute(&model, &maps, &reduces);

        let expected_shuffle = 2.0 * (0.005 / 1000.0 + 0.0004 / 1000.0);
        assert!((cost.shuffle_cost - expected_shuffle).abs() < EPSILON);
        assert!(
            (cost.total_cost
                - (cost.compute_cost.map_cost.total_cost
                    + cost.compute_cost.red_cost.total_cost
                    + expected_shuffle))
                .abs()
                < EPSILON
        );
    }
}
