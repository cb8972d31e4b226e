//! Partition reload idempotence, including reloads interrupted mid-insert.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use futures::stream;
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

use velo_core::PartitionKey;
use velo_flow::config::PipelineConfig;
use velo_flow::error::Disposition;
use velo_flow::record::TripRecord;
use velo_flow::reload::PartitionReloadManager;
use velo_flow::source::RecordStream;
use velo_flow::warehouse::{InMemoryWarehouse, Warehouse};
use velo_test_utils::{FaultyWarehouse, TripFactory, init_test_logging};

fn jan() -> PartitionKey {
    PartitionKey::new(2025, 1).unwrap()
}

fn stream_of(trips: Vec<TripRecord>) -> RecordStream<TripRecord> {
    Box::pin(stream::iter(trips.into_iter().map(Ok)))
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn repeated_reloads_leave_exactly_one_copy(
        count in 0_usize..300,
        chunk_rows in 1_usize..64,
        repeats in 1_usize..4,
        seed in any::<u64>(),
    ) {
        let table = PipelineConfig::default().trips_table_ref();
        let warehouse = Arc::new(InMemoryWarehouse::new().with_chunk_rows(chunk_rows));
        let manager = PartitionReloadManager::new(Arc::clone(&warehouse) as Arc<dyn Warehouse>);
        let trips = TripFactory::new(jan(), seed).trips(count);
        let february = TripFactory::new(jan().next().unwrap(), seed ^ 1).trips(5);
        let cancel = CancellationToken::new();

        let rt = runtime();
        rt.block_on(manager.reload(&table, jan().next().unwrap(), stream_of(february), &cancel)).unwrap();
        for i in 0..repeats {
            let outcome = rt
                .block_on(manager.reload(&table, jan(), stream_of(trips.clone()), &cancel))
                .unwrap();
            prop_assert_eq!(outcome.rows_inserted, count as u64);
            prop_assert_eq!(outcome.rows_deleted, if i == 0 { 0 } else { count as u64 });
        }

        prop_assert_eq!(warehouse.row_count(&table.relation).unwrap(), count + 5);
    }
}

#[tokio::test]
async fn interrupted_reload_is_repaired_by_rerun() {
    init_test_logging();
    let table = PipelineConfig::default().trips_table_ref();
    let inner = Arc::new(InMemoryWarehouse::new().with_chunk_rows(10));
    let faulty = Arc::new(FaultyWarehouse::new(Arc::clone(&inner)));
    let manager = PartitionReloadManager::new(Arc::clone(&faulty) as Arc<dyn Warehouse>);
    let trips = TripFactory::new(jan(), 11).trips(100);
    let cancel = CancellationToken::new();

    manager
        .reload(&table, jan(), stream_of(trips.clone()), &cancel)
        .await
        .unwrap();

    faulty.fail_inserts_after(3);
    let err = manager
        .reload(&table, jan(), stream_of(trips.clone()), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "LOAD_ERROR");
    assert_eq!(err.disposition(), Disposition::Retryable);
    // Delete ran, then three chunks landed.
    assert_eq!(inner.row_count(&table.relation).unwrap(), 30);

    faulty.heal();
    let outcome = manager
        .reload(&table, jan(), stream_of(trips), &cancel)
        .await
        .unwrap();
    assert_eq!(outcome.rows_deleted, 30);
    assert_eq!(outcome.rows_inserted, 100);
    assert_eq!(inner.row_count(&table.relation).unwrap(), 100);
}

#[tokio::test]
async fn failed_delete_leaves_month_intact() {
    let table = PipelineConfig::default().trips_table_ref();
    let inner = Arc::new(InMemoryWarehouse::new());
    let faulty = Arc::new(FaultyWarehouse::new(Arc::clone(&inner)));
    let manager = PartitionReloadManager::new(Arc::clone(&faulty) as Arc<dyn Warehouse>);
    let cancel = CancellationToken::new();
    manager
        .reload(&table, jan(), stream_of(TripFactory::new(jan(), 2).trips(40)), &cancel)
        .await
        .unwrap();

    faulty.configure(velo_test_utils::FaultConfig {
        fail_deletes: true,
        ..Default::default()
    });
    let err = manager
        .reload(&table, jan(), stream_of(TripFactory::new(jan(), 3).trips(7)), &cancel)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "WAREHOUSE_ERROR");
    assert_eq!(inner.row_count(&table.relation).unwrap(), 40);
}
