//! Aggregation and quantification over the host, instance or time domain.

use super::{fill_num, fill_truth};
use crate::expr::{AggOp, Arena, Dom, Expr, Op, QuantOp};
use vigil_common::types::Truth;

/// Positions of the argument's values that fold into output value `j` of
/// sample `i`, as `(sample, position)` pairs.
fn members(arg: &Expr, arena: &Arena, dom: Dom, i: usize, j: usize) -> Vec<(usize, usize)> {
    match dom {
        Dom::Host => (0..arg.tspan).map(|p| (i, p)).collect(),
        Dom::Inst => {
            if arg.e_idom < 0 {
                // instances already collapsed: one value per host
                return if j < arg.tspan { vec![(i, j)] } else { Vec::new() };
            }
            match arg.metrics.and_then(|m| arena.get(m)) {
                Some(leaf) if !leaf.metric_set.is_empty() => leaf
                    .metric_set
                    .get(j)
                    .map(|m| {
                        (m.offset..m.offset + m.width())
                            .filter(|p| *p < arg.tspan)
                            .map(|p| (i, p))
                            .collect()
                    })
                    .unwrap_or_default(),
                _ if j == 0 => (0..arg.tspan).map(|p| (i, p)).collect(),
                _ => Vec::new(),
            }
        }
        Dom::Time => {
            let depth = arg.window();
            if arg.valid < depth || j >= arg.tspan {
                return Vec::new();
            }
            (0..depth).map(|s| (s, j)).collect()
        }
    }
}

fn sample_ok(arg: &Expr, dom: Dom, i: usize) -> bool {
    match dom {
        Dom::Time => arg.valid >= arg.window(),
        _ => i < arg.valid,
    }
}

pub(super) fn fold(x: &mut Expr, arena: &Arena) {
    let Some(a1) = x.arg1 else {
        return;
    };
    let arg = &arena[a1];
    let stamp = |i: usize| {
        if sample_ok(arg, Dom::Host, i) {
            arg.ring.stamp(i)
        } else {
            0.0
        }
    };

    match x.op {
        Op::Aggregate(op, dom) => fill_num(
            x,
            |i, j| {
                if !sample_ok(arg, dom, i) {
                    // an empty instance set still counts as zero
                    return if op == AggOp::Count && arg.tspan == 0 { 0.0 } else { f64::NAN };
                }
                aggregate(op, arg, &members(arg, arena, dom, i, j))
            },
            stamp,
        ),
        Op::Quantify(op, dom) => {
            let pcnt = x.arg2.map_or(f64::NAN, |p| arena[p].value());
            fill_truth(
                x,
                |i, j| {
                    if !sample_ok(arg, dom, i) {
                        return Truth::Unknown;
                    }
                    let values = members(arg, arena, dom, i, j)
                        .into_iter()
                        .map(|(s, p)| arg.ring.get_truth(s, p));
                    quantify(op, pcnt, values)
                },
                stamp,
            )
        }
        _ => {}
    }
}

fn aggregate(op: AggOp, arg: &Expr, at: &[(usize, usize)]) -> f64 {
    if op == AggOp::Count {
        let n = if arg.ring.is_boolean() {
            at.iter()
                .filter(|(s, p)| arg.ring.get_truth(*s, *p) == Truth::True)
                .count()
        } else {
            at.iter()
                .filter(|(s, p)| !arg.ring.get_f64(*s, *p).is_nan())
                .count()
        };
        return n as f64;
    }
    let mut values = at
        .iter()
        .map(|(s, p)| arg.ring.get_f64(*s, *p))
        .filter(|v| !v.is_nan())
        .peekable();
    if values.peek().is_none() {
        return f64::NAN;
    }
    match op {
        AggOp::Sum => values.sum(),
        AggOp::Avg => {
            let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
            sum / n as f64
        }
        AggOp::Max => values.fold(f64::NEG_INFINITY, f64::max),
        AggOp::Min => values.fold(f64::INFINITY, f64::min),
        AggOp::Count => f64::NAN,
    }
}

/// Folds truth values. An empty set, or one with no known values for
/// `percent`, gives UNKNOWN.
pub(crate) fn quantify(op: QuantOp, pcnt: f64, values: impl Iterator<Item = Truth>) -> Truth {
    let mut seen = 0usize;
    let mut known = 0usize;
    let mut trues = 0usize;
    let mut acc: Option<Truth> = None;
    for t in values {
        seen += 1;
        if t.is_known() {
            known += 1;
        }
        if t == Truth::True {
            trues += 1;
        }
        acc = Some(match (op, acc) {
            (_, None) => t,
            (QuantOp::All, Some(a)) => a.and(t),
            (QuantOp::Some, Some(a)) => a.or(t),
            (QuantOp::Percent, Some(a)) => a,
        });
    }
    if seen == 0 {
        return Truth::Unknown;
    }
    match op {
        QuantOp::All | QuantOp::Some => acc.unwrap_or_default(),
        QuantOp::Percent if known == 0 || pcnt.is_nan() => Truth::Unknown,
        QuantOp::Percent => Truth::from_bool(trues as f64 / known as f64 >= pcnt),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Truth = Truth::True;
    const F: Truth = Truth::False;
    const U: Truth = Truth::Unknown;

    #[test]
    fn percent_counts_only_known_values() {
        // 3 of 4 known values are true
        let vals = [T, T, F, U, T];
        assert_eq!(quantify(QuantOp::Percent, 0.75, vals.into_iter()), T);
        assert_eq!(quantify(QuantOp::Percent, 0.76, vals.into_iter()), F);
        assert_eq!(quantify(QuantOp::Percent, 0.5, [U, U].into_iter()), U);
        assert_eq!(quantify(QuantOp::Percent, 0.5, std::iter::empty()), U);
    }

    #[test]
    fn all_and_some_fold_three_valued() {
        assert_eq!(quantify(QuantOp::All, 0.0, [T, T].into_iter()), T);
        assert_eq!(quantify(QuantOp::All, 0.0, [T, U].into_iter()), U);
        assert_eq!(quantify(QuantOp::All, 0.0, [U, F].into_iter()), F);
        assert_eq!(quantify(QuantOp::Some, 0.0, [F, U].into_iter()), U);
        assert_eq!(quantify(QuantOp::Some, 0.0, [U, T].into_iter()), T);
        assert_eq!(quantify(QuantOp::Some, 0.0, std::iter::empty()), U);
    }
}
