//! Query AST, planner, and stack-based executor.
//!
//! A query names one or more `select` fields, each a small stack program
//! over per-metric time series (`PUSH`/`ADD`/`ADDC`/.../`AGGR`/`RETURN`),
//! an optional `where` predicate over tags, a time window, and two
//! consolidation configurations — `bucket` (phase 1: raw cells into
//! fixed-width buckets) and `aggregate` (phase 2: buckets into coarser
//! buckets). Both phases consolidate via a [`crate::reservoir::Cf`].
//!
//! Grounded on bolo's `db2.c`: `plan_cond`/`satisfies`/`plan_query` for
//! planning, `db2_query`'s op-stream stack machine and forward-link chain
//! traversal for execution. The where-predicate intersection this module
//! always performs is the resolved "newer path" from `SPEC_FULL.md` §9 —
//! there is no older code path to select between.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::catalog::Catalog;
use crate::error::{QueryError, Result};
use crate::reservoir::{Cf, CfKind};
use crate::tblock::TBlock;

/// Default query window: the last 4 hours.
pub const DEFAULT_FROM_SECS: i64 = -14_400;
/// Default query window end: now.
pub const DEFAULT_UNTIL_SECS: i64 = 0;
/// Default bucket stride.
pub const DEFAULT_BUCKET_STRIDE_SECS: u64 = 60;
/// Default reservoir capacity per bucket.
pub const DEFAULT_SAMPLES: usize = 2048;
/// Default consolidation function.
pub const DEFAULT_CF: CfKind = CfKind::Median;

/// A boolean predicate over a series' tags.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Predicate {
    /// Series carries the exact `key=value` tag.
    Eq(String, String),
    /// Series carries `key` with any value.
    Exist(String),
    /// Negation.
    Not(Box<Predicate>),
    /// Conjunction.
    And(Box<Predicate>, Box<Predicate>),
    /// Disjunction.
    Or(Box<Predicate>, Box<Predicate>),
}

/// One stack operation in a field's evaluation program.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Op {
    /// Push the bucketed series for `metric`, filtered by the query's
    /// `where` predicate.
    Push(String),
    /// Pop two series, push their pointwise sum.
    Add,
    /// Pop two series (`a` then `b`), push `b - a`.
    Sub,
    /// Pop two series, push their pointwise product.
    Mul,
    /// Pop two series (`a` then `b`), push `b / a` (`NaN` where `a == 0`).
    Div,
    /// Add a constant to the top series.
    AddC(f64),
    /// Subtract a constant from the top series.
    SubC(f64),
    /// Multiply the top series by a constant.
    MulC(f64),
    /// Divide the top series by a constant (`NaN` series if the constant is `0`).
    DivC(f64),
    /// Replace the top series with its phase-2 aggregate consolidation.
    Aggr(CfKind),
    /// Finish the field: exactly one series must remain on the stack.
    Return,
}

/// Configuration for one consolidation phase.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct ConsolidationConfig {
    /// Which consolidation function to apply.
    pub cf: CfKind,
    /// Width of each window, in seconds.
    pub stride_secs: u64,
    /// Reservoir capacity per window.
    pub samples: usize,
}

impl ConsolidationConfig {
    /// The default bucket-phase configuration.
    #[must_use]
    pub fn default_bucket() -> Self {
        ConsolidationConfig { cf: DEFAULT_CF, stride_secs: DEFAULT_BUCKET_STRIDE_SECS, samples: DEFAULT_SAMPLES }
    }
}

/// One `select` field: a name and its evaluation program.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Field {
    /// Field name in the result set.
    pub name: String,
    /// Stack program evaluated to produce this field's series.
    pub ops: Vec<Op>,
}

/// A parsed query, ready for planning and execution.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Query {
    /// Fields to compute.
    pub select: Vec<Field>,
    /// Optional tag predicate restricting which series contribute.
    pub where_: Option<Predicate>,
    /// Window start, seconds relative to now (negative = in the past).
    pub from_secs: i64,
    /// Window end, seconds relative to now. `<= 0` per spec means "now".
    pub until_secs: i64,
    /// Phase 1 consolidation (raw cells -> buckets).
    pub bucket: ConsolidationConfig,
    /// Optional phase 2 consolidation (buckets -> aggregates).
    pub aggregate: Option<ConsolidationConfig>,
}

impl Query {
    /// Validates the query and fills in defaults for an unset window,
    /// bucket configuration, or field names.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::EmptySelect`] if there are no fields, or
    /// [`QueryError::InvalidWindow`] if the window is empty or inverted.
    pub fn normalize(mut self) -> Result<Self> {
        if self.select.is_empty() {
            return Err(QueryError::EmptySelect.into());
        }
        if self.until_secs <= self.from_secs {
            return Err(QueryError::InvalidWindow { from: self.from_secs, until: self.until_secs }.into());
        }
        for (i, field) in self.select.iter_mut().enumerate() {
            if field.name.is_empty() {
                field.name = format!("metric_{}", i + 1);
            }
        }
        Ok(self)
    }
}

/// A resolved index set for one `PUSH`: the tree ids whose series matched
/// both the pushed metric name and the query's `where` predicate.
type IndexSet = HashSet<u64>;

/// Resolves `predicate` to the set of tree ids satisfying it.
fn resolve_predicate(catalog: &Catalog, predicate: &Predicate) -> IndexSet {
    match predicate {
        Predicate::Eq(k, v) => catalog.resolve_tag_eq(k, v),
        Predicate::Exist(k) => catalog.resolve_tag_exists(k),
        Predicate::Not(inner) => {
            let all: IndexSet = catalog.resolve_metric("").into_iter().collect();
            let inner_set = resolve_predicate(catalog, inner);
            all.difference(&inner_set).copied().collect()
        }
        Predicate::And(a, b) => {
            let sa = resolve_predicate(catalog, a);
            let sb = resolve_predicate(catalog, b);
            sa.intersection(&sb).copied().collect()
        }
        Predicate::Or(a, b) => {
            let sa = resolve_predicate(catalog, a);
            let sb = resolve_predicate(catalog, b);
            sa.union(&sb).copied().collect()
        }
    }
}

/// Resolves one `PUSH metric` to its index set: every series under `metric`,
/// intersected with the query's `where` predicate when present.
fn resolve_push(catalog: &Catalog, metric: &str, predicate: Option<&Predicate>) -> IndexSet {
    let by_metric = catalog.resolve_metric(metric);
    match predicate {
        None => by_metric,
        Some(pred) => {
            let allowed = resolve_predicate(catalog, pred);
            by_metric.intersection(&allowed).copied().collect()
        }
    }
}

/// Plans a normalized query: resolves every `PUSH` to its index set, in the
/// order its `Op::Push` appears across `select` fields.
#[must_use]
pub fn plan(catalog: &Catalog, query: &Query) -> Vec<IndexSet> {
    let mut pushes = Vec::new();
    for field in &query.select {
        for op in &field.ops {
            if let Op::Push(metric) = op {
                pushes.push(resolve_push(catalog, metric, query.where_.as_ref()));
            }
        }
    }
    pushes
}

/// One consolidated time series: aligned `(bucket_start_ms, value)` pairs.
#[derive(Debug, Clone, Default)]
pub struct Series {
    /// Sample points, in ascending time order.
    pub points: Vec<(u64, f64)>,
}

/// The result of evaluating one `select` field.
#[derive(Debug, Clone)]
pub struct FieldResult {
    /// The field's name.
    pub name: String,
    /// The field's computed series.
    pub series: Series,
    /// True if any bucket's reservoir saw more raw samples than its
    /// capacity, meaning the result is a statistical summary rather than an
    /// exact one.
    pub may_be_incomplete: bool,
}

/// The full result of executing a query: one [`FieldResult`] per `select`
/// field, plus the absolute time window that was actually evaluated.
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// Per-field results, in `select` order.
    pub fields: Vec<FieldResult>,
    /// Absolute window start, in milliseconds since the epoch.
    pub window_start_ms: u64,
    /// Absolute window end, in milliseconds since the epoch.
    pub window_end_ms: u64,
}

impl QueryResult {
    /// Total number of points across all fields.
    #[must_use]
    pub fn count(&self) -> usize {
        self.fields.iter().map(|f| f.series.points.len()).sum()
    }
}

/// Something able to look up a measurement block by id, regardless of which
/// slab backs it. Implemented by [`crate::store::Store`].
pub trait BlockSource {
    /// Looks up a block by id.
    fn block(&self, id: u64) -> Option<&TBlock>;
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_millis() as u64
}

/// Executes a normalized, planned query against `catalog`/`blocks`.
///
/// # Errors
///
/// Returns a [`QueryError`] if the field programs are malformed (stack
/// underflow, mismatched operand lengths, nested `AGGR`, or a `RETURN` with
/// other than exactly one value on the stack).
pub fn execute(
    catalog: &Catalog,
    blocks: &impl BlockSource,
    query: &Query,
    pushes: &[IndexSet],
) -> Result<QueryResult> {
    let now = now_ms();
    let window_start_ms = now.saturating_sub((-query.from_secs).max(0) as u64 * 1000);
    let window_end_ms = if query.until_secs <= 0 {
        now
    } else {
        now.saturating_sub((-query.until_secs).max(0) as u64 * 1000)
    };

    let mut push_cursor = 0usize;
    let mut fields = Vec::with_capacity(query.select.len());

    for field in &query.select {
        let mut stack: Vec<(Series, bool)> = Vec::new();
        let mut aggregated = false;

        for op in &field.ops {
            match op {
                Op::Push(_) => {
                    let idxs = &pushes[push_cursor];
                    push_cursor += 1;
                    let (series, incomplete) =
                        bucket_phase(catalog, blocks, idxs, window_start_ms, window_end_ms, &query.bucket);
                    stack.push((series, incomplete));
                }
                Op::Add | Op::Sub | Op::Mul | Op::Div => {
                    let (b, b_inc) =
                        stack.pop().ok_or_else(|| QueryError::StackUnderflow { op: format!("{op:?}") })?;
                    let (a, a_inc) =
                        stack.pop().ok_or_else(|| QueryError::StackUnderflow { op: format!("{op:?}") })?;
                    let combined = combine(op, &a, &b)?;
                    stack.push((combined, a_inc || b_inc));
                }
                Op::AddC(c) | Op::SubC(c) | Op::MulC(c) | Op::DivC(c) => {
                    let (top, inc) =
                        stack.pop().ok_or_else(|| QueryError::StackUnderflow { op: format!("{op:?}") })?;
                    stack.push((scale(op, *c, &top), inc));
                }
                Op::Aggr(cf) => {
                    if aggregated {
                        return Err(QueryError::NestedAggregation.into());
                    }
                    aggregated = true;
                    let (top, inc) =
                        stack.pop().ok_or_else(|| QueryError::StackUnderflow { op: "AGGR".to_string() })?;
                    let cfg = ConsolidationConfig {
                        cf: *cf,
                        stride_secs: query.aggregate.map_or(query.bucket.stride_secs, |a| a.stride_secs),
                        samples: query.aggregate.map_or(query.bucket.samples, |a| a.samples),
                    };
                    let (aggregated_series, more_inc) = aggregate_phase(&top, query.bucket.stride_secs, &cfg);
                    stack.push((aggregated_series, inc || more_inc));
                }
                Op::Return => {
                    if stack.len() != 1 {
                        return Err(QueryError::BadReturnStack { found: stack.len() }.into());
                    }
                }
            }
        }

        if stack.len() != 1 {
            return Err(QueryError::BadReturnStack { found: stack.len() }.into());
        }
        let (mut series, mut incomplete) = stack.pop().unwrap();
        if !aggregated {
            if let Some(agg) = query.aggregate {
                let (aggregated_series, more_inc) = aggregate_phase(&series, query.bucket.stride_secs, &agg);
                series = aggregated_series;
                incomplete |= more_inc;
            }
        }

        fields.push(FieldResult { name: field.name.clone(), series, may_be_incomplete: incomplete });
    }

    Ok(QueryResult { fields, window_start_ms, window_end_ms })
}

/// Aligns `ts` down to the `stride`-millisecond boundary: `ts - (ts %
/// stride)`. Always applied uniformly, per the resolved Open Question 2 in
/// `SPEC_FULL.md` §9.
fn align_down(ts: u64, stride_ms: u64) -> u64 {
    ts - (ts % stride_ms)
}

fn bucket_phase(
    catalog: &Catalog,
    blocks: &impl BlockSource,
    idxs: &IndexSet,
    window_start_ms: u64,
    window_end_ms: u64,
    cfg: &ConsolidationConfig,
) -> (Series, bool) {
    let stride_ms = cfg.stride_secs.max(1) * 1000;
    let start = align_down(window_start_ms, stride_ms);
    let mut points = Vec::new();
    let mut incomplete = false;
    let mut cf = Cf::new(cfg.cf, cfg.samples);

    let mut bucket_start = start;
    while bucket_start < window_end_ms {
        let bucket_end = bucket_start + stride_ms;
        if bucket_start != start {
            cf.reset();
        }

        for &idx in idxs {
            let Some(tree) = catalog.tree(idx) else { continue };
            let Ok(mut block_id) = tree.find(bucket_start) else { continue };
            'chain: loop {
                let Some(block) = blocks.block(block_id) else { break 'chain };
                for (ts, value) in block.iter() {
                    if ts > bucket_end {
                        break 'chain;
                    }
                    if ts >= bucket_start {
                        cf.sample(value);
                    }
                }
                let next = block.next();
                if next == 0 {
                    break 'chain;
                }
                block_id = next;
            }
        }

        if cf.count() as usize > cfg.samples {
            incomplete = true;
        }
        points.push((bucket_start, cf.value()));
        bucket_start = bucket_end;
    }

    (Series { points }, incomplete)
}

fn aggregate_phase(input: &Series, bucket_stride_secs: u64, cfg: &ConsolidationConfig) -> (Series, bool) {
    let b2a = (cfg.stride_secs / bucket_stride_secs.max(1)).max(1) as usize;
    let mut points = Vec::new();
    let mut incomplete = false;
    let mut cf = Cf::new(cfg.cf, cfg.samples);

    for (i, chunk) in input.points.chunks(b2a).enumerate() {
        if i > 0 {
            cf.reset();
        }
        for &(_, v) in chunk {
            if !v.is_nan() {
                cf.sample(v);
            }
        }
        if cf.count() as usize > cfg.samples {
            incomplete = true;
        }
        let start = chunk[0].0;
        points.push((start, cf.value()));
    }

    (Series { points }, incomplete)
}

fn combine(op: &Op, a: &Series, b: &Series) -> Result<Series> {
    if a.points.len() != b.points.len() {
        return Err(QueryError::LengthMismatch { left: a.points.len(), right: b.points.len() }.into());
    }
    let points = a
        .points
        .iter()
        .zip(b.points.iter())
        .map(|(&(ts, av), &(_, bv))| {
            let v = match op {
                Op::Add => av + bv,
                Op::Sub => bv - av,
                Op::Mul => av * bv,
                Op::Div => {
                    if av == 0.0 {
                        f64::NAN
                    } else {
                        bv / av
                    }
                }
                _ => unreachable!("combine only called for binary ops"),
            };
            (ts, v)
        })
        .collect();
    Ok(Series { points })
}

fn scale(op: &Op, c: f64, s: &Series) -> Series {
    let points = s
        .points
        .iter()
        .map(|&(ts, v)| {
            let out = match op {
                Op::AddC(_) => v + c,
                Op::SubC(_) => v - c,
                Op::MulC(_) => v * c,
                Op::DivC(_) => {
                    if c == 0.0 {
                        f64::NAN
                    } else {
                        v / c
                    }
                }
                _ => unreachable!("scale only called for scalar ops"),
            };
            (ts, out)
        })
        .collect();
    Series { points }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_fills_defaults() {
        let q = Query {
            select: vec![Field { name: String::new(), ops: vec![] }],
            where_: None,
            from_secs: DEFAULT_FROM_SECS,
            until_secs: DEFAULT_UNTIL_SECS,
            bucket: ConsolidationConfig::default_bucket(),
            aggregate: None,
        }
        .normalize()
        .unwrap();
        assert_eq!(q.select[0].name, "metric_1");
    }

    #[test]
    fn normalize_rejects_empty_select() {
        let q = Query {
            select: vec![],
            where_: None,
            from_secs: -60,
            until_secs: 0,
            bucket: ConsolidationConfig::default_bucket(),
            aggregate: None,
        };
        assert!(q.normalize().is_err());
    }

    #[test]
    fn normalize_rejects_inverted_window() {
        let q = Query {
            select: vec![Field { name: "a".to_string(), ops: vec![] }],
            where_: None,
            from_secs: 0,
            until_secs: -60,
            bucket: ConsolidationConfig::default_bucket(),
            aggregate: None,
        };
        assert!(q.normalize().is_err());
    }

    #[test]
    fn align_down_snaps_to_stride() {
        assert_eq!(align_down(1_234_567, 60_000), 1_200_000);
    }
}
