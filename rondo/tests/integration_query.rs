//! Integration tests for query planning, predicates, and the stack-machine
//! executor, run against a real store on disk.

use rondo::error::{QueryError, RondoError};
use rondo::ingest::Submission;
use rondo::query::{ConsolidationConfig, Field, Op, Predicate, Query};
use rondo::reservoir::CfKind;
use rondo::store::Store;
use tempfile::tempdir;

fn sub(series: &str, ts: u64, value: f64) -> Submission {
    Submission { series: series.to_string(), ts, value }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

#[test]
fn where_predicate_restricts_matching_series() {
    let temp_dir = tempdir().unwrap();
    let mut store = Store::init(&temp_dir.path().join("where"), b"where-key".to_vec()).unwrap();

    let now = now_ms();
    store.insert(&sub("cpu|region=east", now - 1_000, 10.0)).unwrap();
    store.insert(&sub("cpu|region=west", now - 1_000, 20.0)).unwrap();

    let result = store
        .query(Query {
            select: vec![Field { name: "cpu".to_string(), ops: vec![Op::Push("cpu".to_string())] }],
            where_: Some(Predicate::Eq("region".to_string(), "east".to_string())),
            from_secs: -60,
            until_secs: 0,
            bucket: ConsolidationConfig { cf: CfKind::Sum, stride_secs: 60, samples: 16 },
            aggregate: None,
        })
        .unwrap();

    assert!(result.fields[0].series.points.iter().any(|&(_, v)| (v - 10.0).abs() < 1e-9));
    assert!(!result.fields[0].series.points.iter().any(|&(_, v)| (v - 20.0).abs() < 1e-9));
}

#[test]
fn arithmetic_ops_combine_two_pushed_series() {
    let temp_dir = tempdir().unwrap();
    let mut store = Store::init(&temp_dir.path().join("arith"), b"arith-key".to_vec()).unwrap();

    let now = now_ms();
    store.insert(&sub("used|host=a", now - 1_000, 30.0)).unwrap();
    store.insert(&sub("total|host=a", now - 1_000, 100.0)).unwrap();

    let result = store
        .query(Query {
            select: vec![Field {
                name: "ratio".to_string(),
                ops: vec![
                    Op::Push("total".to_string()),
                    Op::Push("used".to_string()),
                    Op::Div,
                    Op::MulC(100.0),
                ],
            }],
            where_: None,
            from_secs: -60,
            until_secs: 0,
            bucket: ConsolidationConfig { cf: CfKind::Sum, stride_secs: 60, samples: 16 },
            aggregate: None,
        })
        .unwrap();

    assert!(result.fields[0].series.points.iter().any(|&(_, v)| (v - 30.0).abs() < 1e-6));
}

#[test]
fn aggregate_phase_reconsolidates_bucketed_output() {
    let temp_dir = tempdir().unwrap();
    let mut store = Store::init(&temp_dir.path().join("aggregate"), b"aggregate-key".to_vec()).unwrap();

    let now = now_ms();
    for i in 0u64..20 {
        store.insert(&sub("cpu|host=a", now - 20_000 + i * 1_000, i as f64)).unwrap();
    }

    let result = store
        .query(Query {
            select: vec![Field { name: "cpu".to_string(), ops: vec![Op::Push("cpu".to_string()), Op::Aggr(CfKind::Max)] }],
            where_: None,
            from_secs: -60,
            until_secs: 0,
            bucket: ConsolidationConfig { cf: CfKind::Mean, stride_secs: 5, samples: 16 },
            aggregate: Some(ConsolidationConfig { cf: CfKind::Max, stride_secs: 60, samples: 16 }),
        })
        .unwrap();

    assert_eq!(result.fields.len(), 1);
    assert!(result.count() > 0);
}

#[test]
fn normalize_rejects_empty_select_at_store_boundary() {
    let temp_dir = tempdir().unwrap();
    let store = Store::init(&temp_dir.path().join("empty-select"), b"empty-key".to_vec()).unwrap();

    let result = store.query(Query {
        select: vec![],
        where_: None,
        from_secs: -60,
        until_secs: 0,
        bucket: ConsolidationConfig::default_bucket(),
        aggregate: None,
    });

    assert!(matches!(result, Err(RondoError::Query(QueryError::EmptySelect))));
}

#[test]
fn normalize_rejects_inverted_window_at_store_boundary() {
    let temp_dir = tempdir().unwrap();
    let store = Store::init(&temp_dir.path().join("inverted-window"), b"inverted-key".to_vec()).unwrap();

    let result = store.query(Query {
        select: vec![Field { name: "cpu".to_string(), ops: vec![Op::Push("cpu".to_string())] }],
        where_: None,
        from_secs: 0,
        until_secs: -60,
        bucket: ConsolidationConfig::default_bucket(),
        aggregate: None,
    });

    assert!(matches!(result, Err(RondoError::Query(QueryError::InvalidWindow { .. }))));
}

#[test]
fn unmatched_metric_yields_nan_buckets_not_an_error() {
    let temp_dir = tempdir().unwrap();
    let mut store = Store::init(&temp_dir.path().join("unmatched"), b"unmatched-key".to_vec()).unwrap();
    store.insert(&sub("cpu|host=a", now_ms() - 1_000, 1.0)).unwrap();

    let result = store
        .query(Query {
            select: vec![Field { name: "missing".to_string(), ops: vec![Op::Push("does_not_exist".to_string())] }],
            where_: None,
            from_secs: -60,
            until_secs: 0,
            bucket: ConsolidationConfig::default_bucket(),
            aggregate: None,
        })
        .unwrap();

    assert!(result.fields[0].series.points.iter().all(|&(_, v)| v.is_nan()));
}
