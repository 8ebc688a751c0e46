//! Result ordering and handle identity

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::{MockDriver, Step, init_tracing, int_batch, param_i64};
use pretty_assertions::assert_eq;
use txguard_core::Value;
use txguard_executor::{ParallelExecutor, ParallelOptions, PartitionStrategy, WorkItem};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_results_follow_partition_order_despite_staggered_completion() {
    init_tracing();
    // Earlier rows sleep longer, so later partitions finish first
    let driver = Arc::new(MockDriver::scripted(|_, params| {
        Step::Sleep(Duration::from_millis(((10 - param_i64(params, "a")) * 15) as u64))
    }));

    let results = ParallelExecutor::new(driver.clone(), ParallelOptions::new().with_parallelism(5))
        .execute(WorkItem::new("stagger"), int_batch("a", 10))
        .await
        .expect("execute");

    let indexes: Vec<usize> = results.iter().map(|r| r.partition_index).collect();
    assert_eq!(indexes, vec![0, 1, 2, 3, 4]);

    let values: Vec<i64> = results
        .iter()
        .flat_map(|r| r.rows().unwrap_or_default().to_vec())
        .filter_map(|row| row.get_by_name("a").and_then(Value::as_i64))
        .collect();
    assert_eq!(values, (0..10).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_round_robin_results_keep_partition_order() {
    let driver = Arc::new(MockDriver::echo());

    let results = ParallelExecutor::new(
        driver.clone(),
        ParallelOptions::new()
            .with_parallelism(3)
            .with_partition_strategy(PartitionStrategy::RoundRobin),
    )
    .execute(WorkItem::new("echo"), int_batch("a", 7))
    .await
    .expect("execute");

    let per_partition: Vec<Vec<i64>> = results
        .iter()
        .map(|r| {
            r.rows()
                .unwrap_or_default()
                .iter()
                .filter_map(|row| row.get_by_name("a").and_then(Value::as_i64))
                .collect()
        })
        .collect();
    assert_eq!(per_partition, vec![vec![0, 3, 6], vec![1, 4], vec![2, 5]]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_every_partition_gets_its_own_transaction() {
    init_tracing();
    let driver = Arc::new(MockDriver::scripted(|_, _| Step::Sleep(Duration::from_millis(5))));

    let results = ParallelExecutor::new(driver.clone(), ParallelOptions::new().with_parallelism(100))
        .execute(WorkItem::new("echo"), int_batch("a", 100))
        .await
        .expect("execute");

    let ids: HashSet<_> = results.iter().filter_map(|r| r.transaction_id).collect();
    assert_eq!(results.len(), 100);
    assert_eq!(ids.len(), 100);
    assert_eq!(driver.begun(), 100);
    assert_eq!(driver.committed(), 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shared_parameters_reach_every_row() {
    let driver = Arc::new(MockDriver::echo());
    let item = WorkItem::new("echo").with_parameter("label", "batch-7");

    let results = ParallelExecutor::new(driver, ParallelOptions::new().with_parallelism(2))
        .execute(item, int_batch("a", 4))
        .await
        .expect("execute");

    for result in &results {
        for row in result.rows().unwrap_or_default() {
            assert_eq!(row.get_by_name("label"), Some(&Value::String("batch-7".into())));
        }
    }
}
