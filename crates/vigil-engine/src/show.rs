//! Text rendering of expressions and their values for diagnostics.

use crate::expr::{AggOp, Arena, ArithOp, Dom, Expr, ExprId, Op, QuantOp, RelOp};
use std::fmt::Write;
use vigil_common::types::{to_datetime, RealTime, Sem};

pub fn op_str(op: Op) -> String {
    let dom = |d: Dom| match d {
        Dom::Host => "host",
        Dom::Inst => "inst",
        Dom::Time => "sample",
    };
    match op {
        Op::Nop => "<nop>".into(),
        Op::Fetch => "<fetch>".into(),
        Op::Delay => "<delay>".into(),
        Op::Clock(t) => t.name().into(),
        Op::Rate => "rate".into(),
        Op::Instant => "instant".into(),
        Op::Neg => "-".into(),
        Op::Arith(a) => match a {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
        }
        .into(),
        Op::Rel(r) => match r {
            RelOp::Eq => "==",
            RelOp::Neq => "!=",
            RelOp::Lt => "<",
            RelOp::Lte => "<=",
            RelOp::Gt => ">",
            RelOp::Gte => ">=",
        }
        .into(),
        Op::Not => "!".into(),
        Op::And => "&&".into(),
        Op::Or => "||".into(),
        Op::Rise => "rising".into(),
        Op::Fall => "falling".into(),
        Op::Match => "match_inst".into(),
        Op::NoMatch => "nomatch_inst".into(),
        Op::Aggregate(a, d) => {
            let a = match a {
                AggOp::Sum => "sum",
                AggOp::Avg => "avg",
                AggOp::Max => "max",
                AggOp::Min => "min",
                AggOp::Count => "count",
            };
            format!("{a}_{}", dom(d))
        }
        Op::Quantify(q, d) => {
            let q = match q {
                QuantOp::All => "all",
                QuantOp::Some => "some",
                QuantOp::Percent => "pcnt",
            };
            format!("{q}_{}", dom(d))
        }
        Op::Rule => "->".into(),
        Op::ActSeq => "&".into(),
        Op::ActAlt => "|".into(),
        Op::Action(kind) => kind.to_string(),
    }
}

/// A number as the engine prints it; missing values show as `?`.
pub fn num_string(v: f64) -> String {
    if v.is_nan() {
        "?".into()
    } else {
        format!("{v}")
    }
}

pub fn time_string(t: RealTime) -> String {
    if !t.is_finite() {
        return "never".into();
    }
    to_datetime(t).format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

/// Values of sample 0. Several values are shown in brackets.
pub fn value_string(x: &Expr) -> String {
    let one = |j: usize| -> String {
        if x.valid == 0 {
            "?".into()
        } else if x.sem == Sem::Boolean {
            x.ring.get_truth(0, j).to_string()
        } else {
            num_string(x.ring.get_f64(0, j))
        }
    };
    match x.tspan {
        0 => "[]".into(),
        1 => one(0),
        n => format!(
            "[{}]",
            (0..n).map(one).collect::<Vec<_>>().join(" ")
        ),
    }
}

/// Host and instance names labelling value position `j` of a node, taken
/// from the fetch leaf the node inherits its metrics from.
pub fn lookup_host_inst(arena: &Arena, x: &Expr, j: usize) -> (String, String) {
    let leaf = match x.metrics {
        Some(_) if x.op == Op::Fetch => Some(x),
        Some(id) => arena.get(id),
        None => None,
    };
    let Some(leaf) = leaf else {
        return (String::new(), String::new());
    };
    if x.e_idom < 0 {
        let host = leaf
            .metric_set
            .get(j)
            .map_or_else(String::new, |m| m.hname.clone());
        return (host, String::new());
    }
    for m in &leaf.metric_set {
        if j >= m.offset && j < m.offset + m.width() {
            return (m.hname.clone(), m.inst_name(j - m.offset).to_string());
        }
    }
    (String::new(), String::new())
}

/// Values of sample 0, each labelled with its host and instance.
pub fn annotated_string(arena: &Arena, x: &Expr) -> String {
    if x.tspan <= 1 && x.metrics.is_none() {
        return value_string(x);
    }
    let mut out = String::new();
    for j in 0..x.tspan {
        let (host, inst) = lookup_host_inst(arena, x, j);
        let v = if x.valid == 0 {
            "?".to_string()
        } else if x.sem == Sem::Boolean {
            x.ring.get_truth(0, j).to_string()
        } else {
            num_string(x.ring.get_f64(0, j))
        };
        if !out.is_empty() {
            out.push('\n');
        }
        let _ = match (host.is_empty(), inst.is_empty()) {
            (false, false) => write!(out, "    {host}: [{inst}] {v}"),
            (false, true) => write!(out, "    {host}: {v}"),
            _ => write!(out, "    {v}"),
        };
    }
    if out.is_empty() {
        value_string(x)
    } else {
        format!("\n{out}")
    }
}

/// Indented dump of a sub-tree with each node's shape and state.
pub fn dump_tree(arena: &Arena, id: ExprId) -> String {
    let mut out = String::new();
    dump(arena, id, 0, &mut out);
    out
}

fn dump(arena: &Arena, id: ExprId, depth: usize, out: &mut String) {
    let x = &arena[id];
    let pad = "  ".repeat(depth);
    let label = match (x.op, &x.text) {
        (Op::Fetch, _) => x
            .metric_set
            .first()
            .map_or_else(|| "<fetch>".into(), |m| format!("{} :{}", m.mname, m.hname)),
        (_, Some(text)) => format!("{} {text:?}", op_str(x.op)),
        _ => op_str(x.op),
    };
    let units = x.units.map_or_else(|| "?".into(), |u| u.to_string());
    let _ = writeln!(
        out,
        "{pad}{id} {label} eval={:?} dom=({},{},{}) smpls={} valid={} sem={} units={units} value={}",
        x.eval,
        x.hdom,
        x.e_idom,
        x.tdom,
        x.nsmpls,
        x.valid,
        x.sem,
        value_string(x),
    );
    for m in &x.metric_set {
        let _ = writeln!(
            out,
            "{pad}  metric {} :{} specinst={} m_idom={} conv={:?}",
            m.mname, m.hname, m.specinst, m.m_idom, m.conv
        );
    }
    for arg in [x.arg1, x.arg2].into_iter().flatten() {
        dump(arena, arg, depth + 1, out);
    }
}
