//! Idempotent monthly reloads of raw tables.
//!
//! A reload deletes every row of the target month and then inserts the
//! freshly fetched records. The two phases are not transactional: between a
//! completed delete and a completed insert the month is partially or fully
//! missing. Re-running the reload restores it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use velo_core::PartitionKey;

use crate::error::{Error, Result};
use crate::metrics::PipelineMetrics;
use crate::row::WarehouseRecord;
use crate::source::RecordStream;
use crate::warehouse::{Statement, TableRef, Warehouse};

/// Row counts of one reload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadOutcome {
    /// Rows removed from the month.
    pub rows_deleted: u64,
    /// Rows inserted.
    pub rows_inserted: u64,
    /// Records dropped because their partition date lies outside the month.
    pub rows_skipped: u64,
}

/// Runs delete-then-insert reloads against a warehouse.
#[derive(Clone)]
pub struct PartitionReloadManager {
    warehouse: Arc<dyn Warehouse>,
    metrics: PipelineMetrics,
}

impl std::fmt::Debug for PartitionReloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionReloadManager").finish_non_exhaustive()
    }
}

impl PartitionReloadManager {
    /// Creates a reload manager.
    #[must_use]
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self {
            warehouse,
            metrics: PipelineMetrics::new(),
        }
    }

    /// Replaces `partition` in `table` with `records`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Warehouse`] if the table cannot be declared or the
    /// delete fails, [`Error::Load`] if an insert chunk fails, the stream's
    /// error if a record cannot be read, and [`Error::Cancelled`] if `cancel`
    /// fires. After any error past the delete phase the month is incomplete
    /// until the reload is repeated.
    #[tracing::instrument(skip_all, fields(table = %table.relation, partition = %partition))]
    pub async fn reload<R: WarehouseRecord>(
        &self,
        table: &TableRef,
        partition: PartitionKey,
        records: RecordStream<R>,
        cancel: &CancellationToken,
    ) -> Result<ReloadOutcome> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled {
                step: format!("reload of {}", table.relation),
            });
        }

        self.warehouse
            .execute(&Statement::EnsureTable {
                table: table.clone(),
            })
            .await?;

        let rows_deleted = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(Error::Cancelled { step: format!("delete from {}", table.relation) });
            }
            deleted = self.warehouse.delete_partition(table, partition) => deleted?,
        };
        tracing::info!(rows_deleted, "partition cleared");

        let skipped = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&skipped);
        let relation = table.relation.clone();
        let rows = records
            .filter_map(move |item| {
                let keep = match item {
                    Ok(record) => {
                        let date = record.partition_date();
                        if date.is_some_and(|d| partition.contains(d)) {
                            Some(Ok(record.to_row()))
                        } else {
                            counter.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(
                                table = %relation,
                                partition_date = ?date,
                                "skipping record outside partition"
                            );
                            None
                        }
                    }
                    Err(e) => Some(Err(e)),
                };
                futures::future::ready(keep)
            })
            .boxed();

        let inserted = self.warehouse.bulk_insert(table, rows, cancel).await;
        let rows_inserted = match inserted {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    rows_deleted,
                    "reload interrupted after delete; partition incomplete until reloaded"
                );
                return Err(e);
            }
        };

        let outcome = ReloadOutcome {
            rows_deleted,
            rows_inserted,
            rows_skipped: skipped.load(Ordering::Relaxed),
        };
        self.metrics.record_reload(
            &table.relation,
            outcome.rows_deleted,
            outcome.rows_inserted,
            outcome.rows_skipped,
        );
        tracing::info!(
            rows_inserted = outcome.rows_inserted,
            rows_skipped = outcome.rows_skipped,
            "partition reloaded"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::WeatherObservation;
    use crate::warehouse::{Dataset, InMemoryWarehouse};
    use chrono::NaiveDate;
    use futures::stream;

    fn obs(month: u32, day: u32, hour: u32) -> WeatherObservation {
        let at = NaiveDate::from_ymd_opt(2025, month, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap();
        WeatherObservation::new(at, Some(40.0), Some(0.0), Some(10.0))
    }

    fn setup() -> (Arc<InMemoryWarehouse>, PartitionReloadManager, TableRef) {
        let wh = Arc::new(InMemoryWarehouse::new().with_chunk_rows(3));
        let manager = PartitionReloadManager::new(wh.clone());
        let table = TableRef::weather(&Dataset::new("p", "d"), "weather");
        (wh, manager, table)
    }

    fn records(items: Vec<WeatherObservation>) -> RecordStream<WeatherObservation> {
        Box::pin(stream::iter(items.into_iter().map(Ok)))
    }

    #[tokio::test]
    async fn repeated_reload_keeps_one_copy() {
        let (wh, manager, table) = setup();
        let jan = PartitionKey::new(2025, 1).unwrap();
        let data = || (0..10).map(|h| obs(1, 1, h)).collect::<Vec<_>>();
        let cancel = CancellationToken::new();

        let first = manager.reload(&table, jan, records(data()), &cancel).await.unwrap();
        assert_eq!(first.rows_deleted, 0);
        let second = manager.reload(&table, jan, records(data()), &cancel).await.unwrap();
        assert_eq!(second.rows_deleted, 10);
        assert_eq!(second.rows_inserted, 10);
        assert_eq!(wh.row_count("p.d.weather").unwrap(), 10);
    }

    #[tokio::test]
    async fn records_outside_month_are_skipped() {
        let (wh, manager, table) = setup();
        let jan = PartitionKey::new(2025, 1).unwrap();
        let outcome = manager
            .reload(
                &table,
                jan,
                records(vec![obs(1, 31, 23), obs(2, 1, 0)]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.rows_inserted, 1);
        assert_eq!(outcome.rows_skipped, 1);
        assert_eq!(wh.row_count("p.d.weather").unwrap(), 1);
    }

    #[tokio::test]
    async fn neighbouring_months_are_untouched() {
        let (wh, manager, table) = setup();
        let cancel = CancellationToken::new();
        let jan = PartitionKey::new(2025, 1).unwrap();
        let feb = PartitionKey::new(2025, 2).unwrap();
        manager.reload(&table, feb, records(vec![obs(2, 1, 0)]), &cancel).await.unwrap();
        manager.reload(&table, jan, records(vec![obs(1, 1, 0)]), &cancel).await.unwrap();
        manager.reload(&table, jan, records(vec![obs(1, 2, 0)]), &cancel).await.unwrap();
        assert_eq!(wh.row_count("p.d.weather").unwrap(), 2);
    }

    #[tokio::test]
    async fn cancelled_before_start_touches_nothing() {
        let (wh, manager, table) = setup();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = manager
            .reload(&table, PartitionKey::new(2025, 1).unwrap(), records(vec![]), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
        assert!(wh.operations().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stream_error_is_propagated() {
        let (_wh, manager, table) = setup();
        let bad: RecordStream<WeatherObservation> = Box::pin(stream::iter(vec![
            Ok(obs(1, 1, 0)),
            Err(Error::source_format("test", "bad row")),
        ]));
        let err = manager
            .reload(&table, PartitionKey::new(2025, 1).unwrap(), bad, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SourceFormat { .. }));
    }
}
