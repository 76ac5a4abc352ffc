//! Element-wise operators: arithmetic, comparison, three-valued logic,
//! rate and edge detection, and instance-name matching.
//!
//! Binary operators follow a four-way split per sample. When both sides are
//! valid the result combines them and takes the later timestamp; when only
//! one side is valid `and`/`or` fall back to [`Truth::and1`] and
//! [`Truth::or1`] while arithmetic and comparisons give no value.

use super::{fill_num, fill_truth, Operand, Shape};
use crate::expr::{Arena, ArithOp, Expr, Op, RelOp};
use crate::show;
use vigil_common::types::Truth;

pub(super) fn unary(x: &mut Expr, arena: &Arena, shape: Shape) {
    let Some(a1) = x.arg1 else {
        return;
    };
    let a = Operand::new(&arena[a1], shape);
    let counter_fetch = arena.is_counter_fetch(a1);

    match x.op {
        Op::Neg => fill_num(x, |i, j| -a.num(i, j), |i| a.stamp(i)),
        Op::Not => fill_truth(x, |i, j| !a.truth(i, j), |i| a.stamp(i)),
        Op::Instant if counter_fetch => instant_counter(x, a.x),
        Op::Instant => fill_num(x, |i, j| a.num(i, j), |i| a.stamp(i)),
        Op::Rate if counter_fetch => fill_num(x, |i, j| a.num(i, j), |i| a.stamp(i)),
        Op::Rate => rate(x, &a),
        Op::Rise | Op::Fall => edge(x, &a),
        _ => {}
    }
}

/// Raw counter values, as last fetched, in canonical units.
fn instant_counter(x: &mut Expr, fetch: &Expr) {
    let raw = |j: usize| -> f64 {
        fetch
            .metric_set
            .iter()
            .find(|m| j >= m.offset && j < m.offset + m.width())
            .and_then(|m| m.raw.get(j - m.offset).copied())
            .unwrap_or(f64::NAN)
    };
    let stamp = fetch.ring.stamp(0);
    fill_num(
        x,
        |i, j| if i == 0 { raw(j) } else { f64::NAN },
        |_| stamp,
    );
}

/// Change per second between consecutive samples of the argument.
fn rate(x: &mut Expr, a: &Operand<'_>) {
    let arg = a.x;
    fill_num(
        x,
        |i, j| {
            if arg.valid < i + 2 || j >= arg.tspan {
                return f64::NAN;
            }
            let dt = arg.ring.stamp(i) - arg.ring.stamp(i + 1);
            if dt <= 0.0 {
                return f64::NAN;
            }
            (arg.ring.get_f64(i, j) - arg.ring.get_f64(i + 1, j)) / dt
        },
        |i| a.stamp(i),
    );
}

/// Rising (false to true) or falling (true to false) edge between
/// consecutive samples.
fn edge(x: &mut Expr, a: &Operand<'_>) {
    let arg = a.x;
    let (from, to) = if x.op == Op::Rise {
        (Truth::False, Truth::True)
    } else {
        (Truth::True, Truth::False)
    };
    fill_truth(
        x,
        |i, j| {
            if arg.valid < i + 2 || j >= arg.tspan {
                return Truth::Unknown;
            }
            let prev = arg.ring.get_truth(i + 1, j);
            let cur = arg.ring.get_truth(i, j);
            if !prev.is_known() || !cur.is_known() {
                Truth::Unknown
            } else {
                Truth::from_bool(prev == from && cur == to)
            }
        },
        |i| a.stamp(i),
    );
}

pub(super) fn binary(x: &mut Expr, arena: &Arena, lhs: Shape, rhs: Shape) {
    let (Some(a1), Some(a2)) = (x.arg1, x.arg2) else {
        return;
    };
    let a = Operand::new(&arena[a1], lhs);
    let b = Operand::new(&arena[a2], rhs);
    let stamp = |i: usize| a.stamp(i).max(b.stamp(i));

    match x.op {
        Op::Arith(op) => fill_num(
            x,
            |i, j| {
                if !(a.is_valid(i) && b.is_valid(i)) {
                    return f64::NAN;
                }
                let (l, r) = (a.num(i, j), b.num(i, j));
                match op {
                    ArithOp::Add => l + r,
                    ArithOp::Sub => l - r,
                    ArithOp::Mul => l * r,
                    ArithOp::Div => l / r,
                }
            },
            stamp,
        ),
        Op::Rel(op) => fill_truth(
            x,
            |i, j| {
                if !(a.is_valid(i) && b.is_valid(i)) {
                    return Truth::Unknown;
                }
                let (l, r) = (a.num(i, j), b.num(i, j));
                if l.is_nan() || r.is_nan() {
                    return Truth::Unknown;
                }
                Truth::from_bool(match op {
                    RelOp::Eq => l == r,
                    RelOp::Neq => l != r,
                    RelOp::Lt => l < r,
                    RelOp::Lte => l <= r,
                    RelOp::Gt => l > r,
                    RelOp::Gte => l >= r,
                })
            },
            stamp,
        ),
        Op::And | Op::Or => {
            let and = x.op == Op::And;
            fill_truth(
                x,
                |i, j| match (a.is_valid(i), b.is_valid(i)) {
                    (true, true) if and => a.truth(i, j).and(b.truth(i, j)),
                    (true, true) => a.truth(i, j).or(b.truth(i, j)),
                    (true, false) if and => a.truth(i, j).and1(),
                    (true, false) => a.truth(i, j).or1(),
                    (false, true) if and => b.truth(i, j).and1(),
                    (false, true) => b.truth(i, j).or1(),
                    (false, false) => Truth::Unknown,
                },
                stamp,
            )
        }
        Op::Match | Op::NoMatch => {
            let want = x.op == Op::Match;
            let Some(pattern) = arena[a2].pattern.clone() else {
                return;
            };
            let names: Vec<String> = (0..x.tspan)
                .map(|j| show::lookup_host_inst(arena, x, j).1)
                .collect();
            fill_truth(
                x,
                |i, j| {
                    let hit = names.get(j).is_some_and(|n| pattern.is_match(n));
                    a.truth(i, j).and(Truth::from_bool(hit == want))
                },
                |i| a.stamp(i),
            )
        }
        _ => {}
    }
}
