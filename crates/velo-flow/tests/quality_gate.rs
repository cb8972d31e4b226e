//! Quality gate evaluation: every assertion runs, failures are collected.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use velo_flow::error::{Disposition, Error};
use velo_flow::quality::{QualityAssertion, QualityGate};
use velo_flow::row::Row;
use velo_flow::warehouse::{Dataset, InMemoryWarehouse, WarehouseOp};
use velo_test_utils::{FaultConfig, FaultyWarehouse};

fn dataset() -> Dataset {
    Dataset::new("p", "d")
}

fn seeded_warehouse() -> Arc<InMemoryWarehouse> {
    let warehouse = Arc::new(InMemoryWarehouse::new());
    let station = |id: &str, kind: Option<&str>| {
        Row::new()
            .with("station_id", id)
            .with("kind", kind)
    };
    warehouse
        .insert_rows(
            dataset().relation("stations"),
            vec![
                station("s1", Some("dock")),
                station("s1", Some("dock")),
                station("s2", Some("hover")),
                station("s3", None),
            ],
        )
        .unwrap();
    warehouse
        .insert_rows(
            dataset().relation("rides"),
            vec![Row::new().with("ride_id", "r1")],
        )
        .unwrap();
    warehouse
}

fn assertions() -> Vec<QualityAssertion> {
    vec![
        QualityAssertion::unique("stations", &["station_id"]),
        QualityAssertion::not_null("stations", "kind"),
        QualityAssertion::accepted_values("stations", "kind", &["dock", "dockless"]),
        QualityAssertion::not_null("rides", "ride_id"),
        QualityAssertion::unique("rides", &["ride_id"]),
    ]
}

#[tokio::test]
async fn every_assertion_is_evaluated_after_failures() {
    let inner = seeded_warehouse();
    let faulty = Arc::new(FaultyWarehouse::new(Arc::clone(&inner)));
    faulty.configure(FaultConfig {
        failing_assertions: HashSet::from(["rides".to_string()]),
        ..FaultConfig::default()
    });
    let gate = QualityGate::new(faulty, dataset(), 2);

    let report = gate
        .evaluate(&assertions(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.total(), 5);
    assert_eq!(report.failed(), 5);
    let violations: Vec<u64> = report.results.iter().map(|r| r.violating_row_count).collect();
    // Duplicate group counts both rows; accepted_values skips the NULL.
    assert_eq!(violations, vec![2, 1, 1, 0, 0]);
    assert!(report.results[3].error.as_ref().unwrap().contains("injected"));
    assert!(report.results[..3].iter().all(|r| r.error.is_none()));

    let evaluated = inner
        .operations()
        .unwrap()
        .into_iter()
        .filter(|op| matches!(op, WarehouseOp::Assertion { .. }))
        .count();
    assert_eq!(evaluated, 3);

    let err = report.into_result().unwrap_err();
    assert!(matches!(err, Error::QualityGateFailure { failed: 5, total: 5 }));
    assert_eq!(err.disposition(), Disposition::Fatal);
}

#[tokio::test]
async fn passing_gate_reports_in_assertion_order() {
    let warehouse = seeded_warehouse();
    let gate = QualityGate::new(warehouse, dataset(), 4);
    let assertions = vec![
        QualityAssertion::not_null("rides", "ride_id"),
        QualityAssertion::unique("rides", &["ride_id"]),
        QualityAssertion::accepted_values("stations", "kind", &["dock", "hover"]),
    ];

    let report = gate
        .evaluate(&assertions, &CancellationToken::new())
        .await
        .unwrap()
        .into_result()
        .unwrap();

    assert!(report.passed());
    let order: Vec<&QualityAssertion> = report.results.iter().map(|r| &r.assertion).collect();
    assert_eq!(order, assertions.iter().collect::<Vec<_>>());
}

#[tokio::test]
async fn missing_relation_fails_its_assertion_only() {
    let gate = QualityGate::new(seeded_warehouse(), dataset(), 1);
    let report = gate
        .evaluate(
            &[
                QualityAssertion::not_null("absent", "x"),
                QualityAssertion::not_null("rides", "ride_id"),
            ],
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(!report.results[0].passed);
    assert!(report.results[0].error.is_some());
    assert!(report.results[1].passed);
}

#[tokio::test]
async fn cancelled_gate_is_an_error() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let gate = QualityGate::new(seeded_warehouse(), dataset(), 1);
    let err = gate.evaluate(&assertions(), &cancel).await.unwrap_err();
    assert_eq!(err.kind(), "CANCELLED");
}
