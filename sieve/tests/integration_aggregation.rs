//! Integration tests for aggregation.

use sieve::ast::{Expr, Grouping};
use sieve::error::{ParameterError, TypeError};
use sieve::metric::Metric;
use sieve::plan::PlanNode;
use sieve::storage::MemoryStorage;
use sieve::value::{PointMatrix, is_stale};
use sieve::{Engine, Frames, RuntimeValue, SieveError};

/// Four instances over two jobs, with values changing between the two grid points.
fn storage() -> MemoryStorage {
    let mut storage = MemoryStorage::default();
    for (job, instance, first, second) in [
        ("api", "a", 1.0, 8.0),
        ("api", "b", 4.0, 2.0),
        ("db", "c", 3.0, 3.0),
        ("db", "d", 9.0, 1.0),
    ] {
        let metric = Metric::new([("__name__", "load"), ("job", job), ("instance", instance)]);
        storage.insert_series(&metric, [(0, first), (60_000, second)]);
    }
    storage
}

fn grid() -> Frames {
    Frames::new(0, 60_000, 60_000).unwrap()
}

fn query(expr: &Expr) -> Result<RuntimeValue, SieveError> {
    Engine::default().query(expr, &grid(), &storage())
}

fn vector(value: RuntimeValue) -> PointMatrix {
    value.into_vector("result").unwrap()
}

fn find<'a>(m: &'a PointMatrix, key: &str, value: &str) -> &'a [f64] {
    m.iter()
        .find(|(metric, _)| metric.get(key) == Some(value))
        .map(|(_, row)| row.values())
        .unwrap()
}

fn load() -> Expr {
    Expr::metric("load")
}

#[test]
fn test_mapping_aggregators_by_job() {
    let by_job = || Some(Grouping::by(["job"]));
    let sum = vector(query(&Expr::aggregate("sum", None, load(), by_job())).unwrap());
    assert_eq!(sum.len(), 2);
    assert!(sum.metrics().iter().all(|m| m.name().is_none() && m.get("instance").is_none()));
    assert_eq!(find(&sum, "job", "api"), &[5.0, 10.0]);
    assert_eq!(find(&sum, "job", "db"), &[12.0, 4.0]);

    let avg = vector(query(&Expr::aggregate("avg", None, load(), by_job())).unwrap());
    assert_eq!(find(&avg, "job", "db"), &[6.0, 2.0]);

    let min = vector(query(&Expr::aggregate("min", None, load(), by_job())).unwrap());
    assert_eq!(find(&min, "job", "api"), &[1.0, 2.0]);

    let max = vector(query(&Expr::aggregate("max", None, load(), by_job())).unwrap());
    assert_eq!(find(&max, "job", "api"), &[4.0, 8.0]);

    let stddev = vector(query(&Expr::aggregate("stddev", None, load(), by_job())).unwrap());
    assert!((find(&stddev, "job", "db")[0] - 3.0).abs() < 1e-9);
}

#[test]
fn test_without_keeps_remaining_labels() {
    let out = vector(query(&Expr::aggregate("count", None, load(), Some(Grouping::without(["instance"])))).unwrap());
    assert_eq!(out.len(), 2);
    assert_eq!(find(&out, "job", "api"), &[2.0, 2.0]);
    assert!(out.metrics().iter().all(|m| m.len() == 1));
}

#[test]
fn test_fixed_input_groups_are_planned() {
    let engine = Engine::default();
    let plan = engine
        .plan(&Expr::aggregate("sum", None, load(), Some(Grouping::by(["job"]))), &storage())
        .unwrap();
    let PlanNode::AggregateFixed { groups, .. } = plan.root() else {
        panic!("expected a fixed aggregation");
    };
    assert_eq!(groups.metrics.len(), 2);
    assert!(groups.members.iter().all(|m| m.len() == 2));
}

#[test]
fn test_topk_blanks_rows_instead_of_removing() {
    let out = vector(query(&Expr::aggregate("topk", Some(Expr::number(1.0)), load(), None)).unwrap());
    // d wins the first timestamp, a the second; every other value is stale.
    assert_eq!(out.len(), 4);
    assert!(out.metrics().iter().all(|m| m.name() == Some("load")));
    let d = find(&out, "instance", "d");
    assert_eq!(d[0], 9.0);
    assert!(is_stale(d[1]));
    let a = find(&out, "instance", "a");
    assert!(is_stale(a[0]));
    assert_eq!(a[1], 8.0);
    for t in 0..2 {
        assert_eq!(out.rows().iter().filter(|r| !is_stale(r.values()[t])).count(), 1);
    }
}

#[test]
fn test_topk_per_group() {
    let expr = Expr::aggregate("topk", Some(Expr::number(1.0)), load(), Some(Grouping::by(["job"])));
    let out = vector(query(&expr).unwrap());
    for t in 0..2 {
        assert_eq!(out.rows().iter().filter(|r| !is_stale(r.values()[t])).count(), 2);
    }
}

#[test]
fn test_bottomk_orders_by_last_value() {
    let out = vector(query(&Expr::aggregate("bottomk", Some(Expr::number(2.0)), load(), None)).unwrap());
    // At 60s the two smallest are d (1) and b (2); a and c were kept at 0s.
    let first: Vec<_> = out.metrics().iter().take(2).filter_map(|m| m.get("instance")).collect();
    assert_eq!(first, ["d", "b"]);
    assert_eq!(find(&out, "instance", "d")[1], 1.0);
    assert!(is_stale(find(&out, "instance", "c")[1]));
}

#[test]
fn test_topk_zero_keeps_nothing() {
    let out = vector(query(&Expr::aggregate("topk", Some(Expr::number(0.0)), load(), None)).unwrap());
    assert!(out.rows().iter().all(|r| r.values().iter().all(|&v| is_stale(v))));
}

#[test]
fn test_quantile_interpolates() {
    let out = vector(query(&Expr::aggregate("quantile", Some(Expr::number(0.5)), load(), None)).unwrap());
    assert_eq!(out.len(), 1);
    assert_eq!(out.metrics()[0], Metric::empty());
    // Sorted first column: 1, 3, 4, 9 -> rank 1.5 between 3 and 4.
    assert!((out.rows()[0].values()[0] - 3.5).abs() < 1e-9);
}

#[test]
fn test_count_values_labels_by_value() {
    let expr = Expr::aggregate("count_values", Some(Expr::string("v")), load(), None);
    let out = vector(query(&expr).unwrap());
    assert_eq!(find(&out, "v", "3")[0], 1.0);
    assert!(is_stale(find(&out, "v", "9")[1]));
    assert_eq!(find(&out, "v", "8")[1], 1.0);

    let bad = Expr::aggregate("count_values", Some(Expr::string("not a label")), load(), None);
    assert!(matches!(
        query(&bad),
        Err(SieveError::Parameter(ParameterError::InvalidLabelName { .. }))
    ));
}

#[test]
fn test_parameter_kinds_checked() {
    let expr = Expr::aggregate("topk", Some(Expr::string("1")), load(), None);
    assert!(matches!(query(&expr), Err(SieveError::Type(TypeError::UnexpectedKind { .. }))));

    let expr = Expr::aggregate("sum", Some(Expr::number(1.0)), load(), None);
    assert!(matches!(query(&expr), Err(SieveError::Type(TypeError::ArgumentCount { .. }))));
}

#[test]
fn test_aggregate_over_nothing_is_empty() {
    let out = vector(query(&Expr::aggregate("sum", None, Expr::metric("missing"), None)).unwrap());
    assert!(out.is_empty());
}
