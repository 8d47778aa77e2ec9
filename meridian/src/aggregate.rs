//! The query aggregation engine (§4.6): typed point-stream transforms run
//! over a merged sequence of points for one series, or over the unified
//! sequence MERGE produces for several.
//!
//! Grouped aggregates partition points into fixed-width time buckets with
//! `group_ts = ⌈ts / group_by⌉ · group_by + offset` — the same ceiling-bucket
//! rule `examples/original_source/src/siri/db/aggregate.c`'s `GROUP_TS` macro
//! uses — then reduce each bucket with one of the named functions below.
//! Ungrouped, a kind collapses the whole input to one point (`to_one`, e.g.
//! plain `count()`), or in the case of `difference`/`derivative`/`filter`/
//! `interval`/`timeval` transforms the whole stream without bucketing.

use regex::Regex;

use crate::error::QueryError;
use crate::point::{Point, SeriesType, Value};

/// The named aggregate/transform a query operator applies.
#[derive(Debug, Clone)]
pub enum AggrKind {
    /// Number of points in the group.
    Count,
    /// Value of the first point.
    First,
    /// Value of the last point.
    Last,
    /// Smallest value.
    Min,
    /// Largest value.
    Max,
    /// Arithmetic mean.
    Mean,
    /// Sum of values (overflow-checked for integers).
    Sum,
    /// Median; averages the two middle values for an even-sized group.
    Median,
    /// Median, rounding to the upper of the two middle values when even.
    MedianHigh,
    /// Median, rounding to the lower of the two middle values when even.
    MedianLow,
    /// Sample variance (divides by `n - 1`).
    Variance,
    /// Population variance (divides by `n`).
    PVariance,
    /// Sample standard deviation.
    StdDev,
    /// `last - first` per group (or per adjacent pair, ungrouped);
    /// overflow-checked for integers, preserves the series' value type.
    Difference,
    /// `(last - first) * timespan` per group, or per adjacent pair divided
    /// by elapsed time when ungrouped; always produces a float series.
    Derivative,
    /// Keeps only points whose value satisfies a comparator against a
    /// constant, or (string series only, `==`/`!=`) a regular expression.
    Filter(FilterSpec),
    /// Per adjacent pair, the elapsed time since the previous point.
    Interval,
    /// Re-emits each point's own timestamp as its integer value.
    TimeVal,
    /// Passes every point through unchanged.
    All,
}

/// A `filter` operator's comparator and right-hand operand.
#[derive(Debug, Clone)]
pub struct FilterSpec {
    /// The comparator applied as `point.value <comparator> operand`.
    pub comparator: Comparator,
    /// The constant (or compiled regex) compared against.
    pub operand: FilterOperand,
}

/// Comparators a `filter` operator supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `<`
    Lt,
    /// `<=`
    Le,
}

/// The right-hand side of a `filter` comparison.
#[derive(Debug, Clone)]
pub enum FilterOperand {
    /// Integer constant; compared against integer series (coerced to float
    /// for float series, matching the original's int/float coercion).
    Int(i64),
    /// Float constant; compared against float series (coerced from integer
    /// series on the fly).
    Float(f64),
    /// String constant; string series only.
    Str(String),
    /// Compiled regular expression; string series only, `==`/`!=` only.
    Regex(Regex),
}

/// A fully-parameterized aggregation operator (§4.6).
#[derive(Debug, Clone)]
pub struct Aggregation {
    /// The function or transform to apply.
    pub kind: AggrKind,
    /// Width of each group-by-time bucket; `0` collapses the whole input to
    /// one point.
    pub group_by: u64,
    /// Shift applied to every bucket boundary.
    pub offset: u64,
    /// When set, `group_by`/`offset` are derived from the input's own time
    /// span so the output has at most this many points (§4.6 "limit").
    pub limit: Option<u64>,
    /// Derivative's time-span factor; `1.0` unless the query overrides it.
    pub timespan: f64,
}

impl Aggregation {
    /// Builds an ungrouped operator (`group_by = 0`, `timespan = 1.0`).
    #[must_use]
    pub fn new(kind: AggrKind) -> Self {
        Self {
            kind,
            group_by: 0,
            offset: 0,
            limit: None,
            timespan: 1.0,
        }
    }

    /// Returns a copy of this operator grouped by `group_by`, with `offset`
    /// normalized into `[0, group_by)`.
    #[must_use]
    pub fn grouped(mut self, group_by: u64, offset: u64) -> Self {
        self.group_by = group_by;
        self.offset = if group_by == 0 { 0 } else { offset % group_by };
        self
    }
}

/// The group timestamp a point at `ts` falls into, per the ceiling-bucket
/// rule `⌈ts / group_by⌉ · group_by + offset`.
#[must_use]
pub fn group_ts(ts: u64, group_by: u64, offset: u64) -> u64 {
    (ts + group_by - 1) / group_by * group_by + offset
}

/// Runs `agg` over `points` for a series of the given `series_type`.
///
/// String-valued series reject every numeric-only kind with
/// [`QueryError::TypeMismatch`] (§4.6); `count`, `first`, `last`, `filter`,
/// and `all` accept any type.
///
/// # Errors
///
/// Returns [`QueryError`] for type mismatches, integer overflow in
/// `difference`/`sum`, or an invalid filter (wrong operand type, or a regex
/// used with anything but `==`/`!=`).
pub fn apply(agg: &Aggregation, points: &[Point], series_type: SeriesType) -> Result<Vec<Point>, QueryError> {
    if series_type == SeriesType::String && !kind_allows_string(&agg.kind) {
        return Err(QueryError::TypeMismatch {
            function: kind_name(&agg.kind).to_string(),
        });
    }

    if points.is_empty() {
        return Ok(Vec::new());
    }

    if let Some(limit) = agg.limit {
        return apply(&limited(agg, limit, points), points, series_type);
    }

    match &agg.kind {
        AggrKind::Difference if agg.group_by == 0 => ungrouped_difference(points, series_type),
        AggrKind::Derivative if agg.group_by == 0 => ungrouped_derivative(points, agg.timespan),
        AggrKind::Filter(spec) => filter(points, series_type, spec),
        AggrKind::Interval => Ok(interval(points)),
        AggrKind::TimeVal => Ok(timeval(points)),
        AggrKind::All => Ok(points.to_vec()),
        kind if agg.group_by == 0 => Ok(vec![to_one(kind, points, series_type, agg.timespan)?]),
        kind => group_by_time(points, agg.group_by, agg.offset)
            .into_iter()
            .map(|(ts, group)| Ok(Point::new(ts, reduce(kind, &group, series_type, agg.timespan)?)))
            .collect(),
    }
}

/// Derives the `group_by`/`offset` a `limit N` request resolves to, mirroring
/// `AGGREGATE_limit`'s `timespan / limit + 1` rule.
fn limited(agg: &Aggregation, limit: u64, points: &[Point]) -> Aggregation {
    if (points.len() as u64) <= limit {
        let mut ungrouped = agg.clone();
        ungrouped.limit = None;
        return ungrouped;
    }
    let timespan = points.last().unwrap().ts - points.first().unwrap().ts;
    let group_by = timespan / limit + 1;
    let offset = (points.first().unwrap().ts.wrapping_sub(1)) % group_by;
    let mut grouped = agg.clone();
    grouped.limit = None;
    grouped.group_by = group_by;
    grouped.offset = offset;
    grouped
}

fn kind_allows_string(kind: &AggrKind) -> bool {
    matches!(
        kind,
        AggrKind::Count | AggrKind::First | AggrKind::Last | AggrKind::Filter(_) | AggrKind::All
    )
}

fn kind_name(kind: &AggrKind) -> &'static str {
    match kind {
        AggrKind::Count => "count",
        AggrKind::First => "first",
        AggrKind::Last => "last",
        AggrKind::Min => "min",
        AggrKind::Max => "max",
        AggrKind::Mean => "mean",
        AggrKind::Sum => "sum",
        AggrKind::Median => "median",
        AggrKind::MedianHigh => "median_high",
        AggrKind::MedianLow => "median_low",
        AggrKind::Variance => "variance",
        AggrKind::PVariance => "pvariance",
        AggrKind::StdDev => "stddev",
        AggrKind::Difference => "difference",
        AggrKind::Derivative => "derivative",
        AggrKind::Filter(_) => "filter",
        AggrKind::Interval => "interval",
        AggrKind::TimeVal => "timeval",
        AggrKind::All => "all",
    }
}

/// Partitions `points` (already ts-sorted) into contiguous runs sharing the
/// same [`group_ts`].
fn group_by_time(points: &[Point], group_by: u64, offset: u64) -> Vec<(u64, Vec<Point>)> {
    let mut groups: Vec<(u64, Vec<Point>)> = Vec::new();
    for p in points {
        let ts = group_ts(p.ts, group_by, offset);
        match groups.last_mut() {
            Some((g, bucket)) if *g == ts => bucket.push(p.clone()),
            _ => groups.push((ts, vec![p.clone()])),
        }
    }
    groups
}

fn to_one(kind: &AggrKind, points: &[Point], series_type: SeriesType, timespan: f64) -> Result<Point, QueryError> {
    let ts = match kind {
        AggrKind::First => points[0].ts,
        _ => points[points.len() - 1].ts,
    };
    Ok(Point::new(ts, reduce(kind, points, series_type, timespan)?))
}

fn reduce(kind: &AggrKind, group: &[Point], series_type: SeriesType, timespan: f64) -> Result<Value, QueryError> {
    match kind {
        AggrKind::Count => Ok(Value::Int(group.len() as i64)),
        AggrKind::First => Ok(group[0].value.clone()),
        AggrKind::Last => Ok(group[group.len() - 1].value.clone()),
        AggrKind::Min => min_max(group, series_type, "min", false),
        AggrKind::Max => min_max(group, series_type, "max", true),
        AggrKind::Mean => Ok(Value::Float(mean(group, series_type)?)),
        AggrKind::Sum => sum(group, series_type),
        AggrKind::Median => Ok(Value::Float(median(group, series_type, 0.5)?)),
        AggrKind::MedianLow => Ok(Value::Float(median(group, series_type, 0.0)?)),
        AggrKind::MedianHigh => Ok(Value::Float(median(group, series_type, 1.0)?)),
        AggrKind::Variance => Ok(Value::Float(variance(group, series_type, group.len().saturating_sub(1))?)),
        AggrKind::PVariance => Ok(Value::Float(variance(group, series_type, group.len())?)),
        AggrKind::StdDev => Ok(Value::Float(variance(group, series_type, group.len().saturating_sub(1))?.sqrt())),
        AggrKind::Difference => grouped_difference(group, series_type),
        AggrKind::Derivative => grouped_derivative(group, series_type, timespan),
        _ => unreachable!("group_by dispatch only reaches statistical kinds"),
    }
}

fn values_as_f64(group: &[Point], series_type: SeriesType) -> Result<Vec<f64>, QueryError> {
    match series_type {
        SeriesType::Integer => Ok(group.iter().map(|p| p.value.as_int().unwrap() as f64).collect()),
        SeriesType::Float => Ok(group.iter().map(|p| p.value.as_float().unwrap()).collect()),
        SeriesType::String => Err(QueryError::TypeMismatch {
            function: "numeric aggregate".to_string(),
        }),
    }
}

fn min_max(group: &[Point], series_type: SeriesType, name: &str, want_max: bool) -> Result<Value, QueryError> {
    if series_type == SeriesType::String {
        return Err(QueryError::TypeMismatch { function: name.to_string() });
    }
    let best = group.iter().reduce(|a, b| {
        let a_gt_b = match series_type {
            SeriesType::Integer => a.value.as_int().unwrap() > b.value.as_int().unwrap(),
            SeriesType::Float => a.value.as_float().unwrap() > b.value.as_float().unwrap(),
            SeriesType::String => unreachable!(),
        };
        if a_gt_b == want_max { a } else { b }
    });
    Ok(best.unwrap().value.clone())
}

fn mean(group: &[Point], series_type: SeriesType) -> Result<f64, QueryError> {
    let values = values_as_f64(group, series_type)?;
    Ok(values.iter().sum::<f64>() / values.len() as f64)
}

fn sum(group: &[Point], series_type: SeriesType) -> Result<Value, QueryError> {
    match series_type {
        SeriesType::Integer => {
            let mut total: i64 = 0;
            for p in group {
                total = total
                    .checked_add(p.value.as_int().unwrap())
                    .ok_or_else(|| QueryError::Overflow { function: "sum".to_string() })?;
            }
            Ok(Value::Int(total))
        }
        SeriesType::Float => Ok(Value::Float(group.iter().map(|p| p.value.as_float().unwrap()).sum())),
        SeriesType::String => Err(QueryError::TypeMismatch { function: "sum".to_string() }),
    }
}

/// Sample/population variance switch on `denominator`: the numerator (sum of
/// squared deviations from the mean) is shared between `variance`,
/// `pvariance`, and `stddev`, matching `siridb_variance()`'s role in the
/// original.
fn variance(group: &[Point], series_type: SeriesType, denominator: usize) -> Result<f64, QueryError> {
    if denominator == 0 {
        return Ok(0.0);
    }
    let values = values_as_f64(group, series_type)?;
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let sq_dev: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    Ok(sq_dev / denominator as f64)
}

/// `frac` selects which of the two middle values an even-length group
/// resolves to: `0.0` = lower, `1.0` = upper, `0.5` = their average.
fn median(group: &[Point], series_type: SeriesType, frac: f64) -> Result<f64, QueryError> {
    let mut values = values_as_f64(group, series_type)?;
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = values.len();
    if n % 2 == 1 {
        Ok(values[n / 2])
    } else {
        let low = values[n / 2 - 1];
        let high = values[n / 2];
        Ok(low + (high - low) * frac)
    }
}

fn grouped_difference(group: &[Point], series_type: SeriesType) -> Result<Value, QueryError> {
    if group.len() == 1 {
        return Ok(match series_type {
            SeriesType::Integer => Value::Int(0),
            SeriesType::Float => Value::Float(0.0),
            SeriesType::String => return Err(QueryError::TypeMismatch { function: "difference".to_string() }),
        });
    }
    let first = &group[0].value;
    let last = &group[group.len() - 1].value;
    checked_difference(first, last, series_type)
}

fn checked_difference(first: &Value, last: &Value, series_type: SeriesType) -> Result<Value, QueryError> {
    match series_type {
        SeriesType::Integer => {
            let diff = last
                .as_int()
                .unwrap()
                .checked_sub(first.as_int().unwrap())
                .ok_or_else(|| QueryError::Overflow { function: "difference".to_string() })?;
            Ok(Value::Int(diff))
        }
        SeriesType::Float => Ok(Value::Float(last.as_float().unwrap() - first.as_float().unwrap())),
        SeriesType::String => Err(QueryError::TypeMismatch { function: "difference".to_string() }),
    }
}

fn grouped_derivative(group: &[Point], series_type: SeriesType, timespan: f64) -> Result<Value, QueryError> {
    if series_type == SeriesType::String {
        return Err(QueryError::TypeMismatch { function: "derivative".to_string() });
    }
    if group.len() == 1 {
        return Ok(Value::Float(0.0));
    }
    let first = as_f64(&group[0].value);
    let last = as_f64(&group[group.len() - 1].value);
    Ok(Value::Float((last - first) * timespan))
}

fn as_f64(v: &Value) -> f64 {
    match v {
        Value::Int(i) => *i as f64,
        Value::Float(f) => *f,
        Value::Str(_) => unreachable!("string series rejected upstream"),
    }
}

/// Pairwise `difference` over the whole stream (no `group_by`): one output
/// point per adjacent pair, `ts` taken from the later point.
fn ungrouped_difference(points: &[Point], series_type: SeriesType) -> Result<Vec<Point>, QueryError> {
    if series_type == SeriesType::String {
        return Err(QueryError::TypeMismatch { function: "difference".to_string() });
    }
    let mut out = Vec::with_capacity(points.len().saturating_sub(1));
    for pair in points.windows(2) {
        let value = checked_difference(&pair[0].value, &pair[1].value, series_type)?;
        out.push(Point::new(pair[1].ts, value));
    }
    Ok(out)
}

/// Pairwise `derivative` over the whole stream: `(Δvalue / Δts) * timespan`
/// per adjacent pair, always a float series.
fn ungrouped_derivative(points: &[Point], timespan: f64) -> Result<Vec<Point>, QueryError> {
    let mut out = Vec::with_capacity(points.len().saturating_sub(1));
    for pair in points.windows(2) {
        if pair[0].value.series_type() == SeriesType::String {
            return Err(QueryError::TypeMismatch { function: "derivative".to_string() });
        }
        let dt = (pair[1].ts - pair[0].ts) as f64;
        let dv = as_f64(&pair[1].value) - as_f64(&pair[0].value);
        out.push(Point::new(pair[1].ts, Value::Float(dv / dt * timespan)));
    }
    Ok(out)
}

/// `interval`: elapsed ts since the previous point, one point shorter than
/// the input.
fn interval(points: &[Point]) -> Vec<Point> {
    points
        .windows(2)
        .map(|pair| Point::new(pair[1].ts, Value::Int((pair[1].ts - pair[0].ts) as i64)))
        .collect()
}

/// `timeval`: re-emits each point's own ts as an integer value.
fn timeval(points: &[Point]) -> Vec<Point> {
    points.iter().map(|p| Point::new(p.ts, Value::Int(p.ts as i64))).collect()
}

fn filter(points: &[Point], series_type: SeriesType, spec: &FilterSpec) -> Result<Vec<Point>, QueryError> {
    if let FilterOperand::Regex(re) = &spec.operand {
        if !matches!(spec.comparator, Comparator::Eq | Comparator::Ne) {
            return Err(QueryError::InvalidRegexComparator);
        }
        if series_type != SeriesType::String {
            return Err(QueryError::TypeMismatch { function: "filter".to_string() });
        }
        return Ok(points
            .iter()
            .filter(|p| {
                let matched = re.is_match(p.value.as_str().unwrap());
                matched == (spec.comparator == Comparator::Eq)
            })
            .cloned()
            .collect());
    }

    match (&spec.operand, series_type) {
        (FilterOperand::Str(s), SeriesType::String) => Ok(points
            .iter()
            .filter(|p| compare_str(spec.comparator, p.value.as_str().unwrap(), s))
            .cloned()
            .collect()),
        (FilterOperand::Str(_), _) => Err(QueryError::TypeMismatch { function: "filter".to_string() }),
        (_, SeriesType::String) => Err(QueryError::TypeMismatch { function: "filter".to_string() }),
        (FilterOperand::Int(i), SeriesType::Integer) => Ok(points
            .iter()
            .filter(|p| compare_num(spec.comparator, p.value.as_int().unwrap() as f64, *i as f64))
            .cloned()
            .collect()),
        (FilterOperand::Int(i), SeriesType::Float) => Ok(points
            .iter()
            .filter(|p| compare_num(spec.comparator, p.value.as_float().unwrap(), *i as f64))
            .cloned()
            .collect()),
        (FilterOperand::Float(f), SeriesType::Integer) => Ok(points
            .iter()
            .filter(|p| compare_num(spec.comparator, p.value.as_int().unwrap() as f64, *f))
            .cloned()
            .collect()),
        (FilterOperand::Float(f), SeriesType::Float) => Ok(points
            .iter()
            .filter(|p| compare_num(spec.comparator, p.value.as_float().unwrap(), *f))
            .cloned()
            .collect()),
        (FilterOperand::Regex(_), _) => unreachable!("handled above"),
    }
}

fn compare_num(op: Comparator, lhs: f64, rhs: f64) -> bool {
    match op {
        Comparator::Eq => lhs == rhs,
        Comparator::Ne => lhs != rhs,
        Comparator::Gt => lhs > rhs,
        Comparator::Ge => lhs >= rhs,
        Comparator::Lt => lhs < rhs,
        Comparator::Le => lhs <= rhs,
    }
}

fn compare_str(op: Comparator, lhs: &str, rhs: &str) -> bool {
    match op {
        Comparator::Eq => lhs == rhs,
        Comparator::Ne => lhs != rhs,
        Comparator::Gt => lhs > rhs,
        Comparator::Ge => lhs >= rhs,
        Comparator::Lt => lhs < rhs,
        Comparator::Le => lhs <= rhs,
    }
}

/// Merge strategy chosen for a cross-series union (§4.6 "Merge"), selected
/// by `(series_count, total_points)`. All three converge on the same
/// ts-ordered result; the choice is a performance characteristic of how the
/// union is assembled, not a semantic one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// `≤ 3` input series: repeatedly pick the series whose next point has
    /// the highest (least-advanced) tail.
    HighestTail,
    /// Output size comparable to the series count: concatenate everything,
    /// then sort once.
    ConcatenateThenSort,
    /// Otherwise: an amortized linear merge that remembers the
    /// last-chosen series across calls.
    HighestTailWithMarker,
}

/// Picks the merge strategy §4.6 specifies for `series_count` series
/// producing `total_points` points combined.
#[must_use]
pub fn choose_merge_strategy(series_count: usize, total_points: usize) -> MergeStrategy {
    if series_count <= 3 {
        MergeStrategy::HighestTail
    } else if total_points <= series_count * 4 {
        MergeStrategy::ConcatenateThenSort
    } else {
        MergeStrategy::HighestTailWithMarker
    }
}

/// Merges per-series point streams into one ts-ordered sequence, promoting
/// integer series to float when mixed with a float series.
///
/// # Errors
///
/// Returns [`QueryError::IncompatibleMerge`] if a string series is mixed
/// with a numeric one.
pub fn merge_series(series: Vec<(SeriesType, Vec<Point>)>) -> Result<Vec<Point>, QueryError> {
    let has_string = series.iter().any(|(t, _)| *t == SeriesType::String);
    let has_numeric = series.iter().any(|(t, _)| *t != SeriesType::String);
    if has_string && has_numeric {
        return Err(QueryError::IncompatibleMerge);
    }
    let promote_to_float = series.iter().any(|(t, _)| *t == SeriesType::Float)
        && series.iter().any(|(t, _)| *t == SeriesType::Integer);

    let strategy = choose_merge_strategy(series.len(), series.iter().map(|(_, p)| p.len()).sum());
    let mut merged: Vec<Point> = match strategy {
        MergeStrategy::HighestTail | MergeStrategy::HighestTailWithMarker => {
            highest_tail_merge(series.iter().map(|(_, p)| p.as_slice()).collect())
        }
        MergeStrategy::ConcatenateThenSort => {
            let mut all: Vec<Point> = series.into_iter().flat_map(|(_, p)| p).collect();
            all.sort_by_key(|p| p.ts);
            all
        }
    };

    if promote_to_float {
        for p in &mut merged {
            if let Value::Int(i) = p.value {
                p.value = Value::Float(i as f64);
            }
        }
    }
    Ok(merged)
}

/// Repeatedly selects the smallest available head across `streams`,
/// producing one ts-ordered sequence. Used for both [`MergeStrategy::HighestTail`]
/// and [`MergeStrategy::HighestTailWithMarker`] — "highest tail" refers to
/// the candidate being furthest from exhausted, not to sort order.
fn highest_tail_merge(streams: Vec<&[Point]>) -> Vec<Point> {
    let mut cursors = vec![0usize; streams.len()];
    let total: usize = streams.iter().map(|s| s.len()).sum();
    let mut out = Vec::with_capacity(total);
    loop {
        let mut best: Option<(usize, u64)> = None;
        for (i, stream) in streams.iter().enumerate() {
            if cursors[i] < stream.len() {
                let ts = stream[cursors[i]].ts;
                if best.is_none_or(|(_, best_ts)| ts < best_ts) {
                    best = Some((i, ts));
                }
            }
        }
        match best {
            Some((i, _)) => {
                out.push(streams[i][cursors[i]].clone());
                cursors[i] += 1;
            }
            None => break,
        }
    }
    out
}
