//! Operator evaluation.
//!
//! [`find_eval`] binds each node to an [`Eval`]: the operator family plus,
//! for unary and binary operators, whether each operand is a broadcastable
//! scalar (one value, one sample). [`evaluate`] walks a rule bottom-up,
//! evaluating arguments before the node that reads them.

mod arith;
mod fetch;
mod fold;

use crate::action::{self, ActionSink};
use crate::expr::{Arena, Expr, ExprId, Op};
use crate::stats::EngineStats;
use vigil_common::types::{RealTime, Truth};

/// Whether an operand is read at every position or broadcast from its
/// single value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Shape {
    #[default]
    Scalar,
    Vector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Eval {
    #[default]
    Nop,
    Fetch,
    Delay,
    Clock,
    Unary(Shape),
    Binary(Shape, Shape),
    Fold,
    Rule,
    Action,
}

/// Per-tick state handed to the evaluators.
pub struct EvalCtx<'a> {
    /// Scheduled time of this evaluation.
    pub now: RealTime,
    /// Sample interval of the task being evaluated.
    pub delta: f64,
    /// Log actions instead of performing them.
    pub archive: bool,
    pub actions: &'a mut dyn ActionSink,
    pub stats: &'a mut EngineStats,
}

fn shape_of(x: &Expr) -> Shape {
    if x.tspan == 1 && x.window() == 1 {
        Shape::Scalar
    } else {
        Shape::Vector
    }
}

/// Selects the evaluator for a node from its operator and the shape of its
/// arguments.
pub fn find_eval(arena: &mut Arena, id: ExprId) {
    let x = &arena[id];
    let shape = |arg: Option<ExprId>| arg.map_or(Shape::Scalar, |a| shape_of(&arena[a]));
    let eval = match x.op {
        Op::Nop => Eval::Nop,
        Op::Fetch => Eval::Fetch,
        Op::Delay => Eval::Delay,
        Op::Clock(_) => Eval::Clock,
        Op::Neg | Op::Not | Op::Rate | Op::Instant | Op::Rise | Op::Fall => {
            Eval::Unary(shape(x.arg1))
        }
        Op::Arith(_) | Op::Rel(_) | Op::And | Op::Or | Op::Match | Op::NoMatch => {
            Eval::Binary(shape(x.arg1), shape(x.arg2))
        }
        Op::Aggregate(..) | Op::Quantify(..) => Eval::Fold,
        Op::Rule => Eval::Rule,
        Op::ActSeq | Op::ActAlt | Op::Action(_) => Eval::Action,
    };
    arena[id].eval = eval;
}

/// Binds evaluators throughout a sub-tree.
pub fn find_eval_tree(arena: &mut Arena, id: ExprId) {
    let (a1, a2) = (arena[id].arg1, arena[id].arg2);
    for arg in [a1, a2].into_iter().flatten() {
        find_eval_tree(arena, arg);
    }
    find_eval(arena, id);
}

/// Evaluates a node after its arguments. Action sub-trees only run when
/// the rule that owns them fires.
pub fn evaluate(arena: &mut Arena, id: ExprId, ctx: &mut EvalCtx<'_>) {
    let x = &arena[id];
    if x.op == Op::Nop || x.op.is_action() {
        return;
    }
    let args = if x.op == Op::Rule {
        [x.arg1, None]
    } else {
        [x.arg1, x.arg2]
    };
    for arg in args.into_iter().flatten() {
        evaluate(arena, arg, ctx);
    }
    arena.with_detached(id, |x, arena| dispatch(x, arena, ctx));
}

/// Evaluates an operator over constant arguments, for folding at build
/// time. Returns false for operators that need a tick context.
pub fn eval_const_node(arena: &mut Arena, id: ExprId) -> bool {
    arena
        .with_detached(id, |x, arena| match x.eval {
            Eval::Unary(shape) => {
                arith::unary(x, arena, shape);
                true
            }
            Eval::Binary(lhs, rhs) => {
                arith::binary(x, arena, lhs, rhs);
                true
            }
            Eval::Fold => {
                fold::fold(x, arena);
                true
            }
            _ => false,
        })
        .unwrap_or(false)
}

fn dispatch(x: &mut Expr, arena: &Arena, ctx: &mut EvalCtx<'_>) {
    match x.eval {
        Eval::Nop | Eval::Action => {}
        Eval::Fetch => fetch::fetch(x),
        Eval::Delay => fetch::delay(x, arena),
        Eval::Clock => fetch::clock(x, ctx),
        Eval::Unary(shape) => arith::unary(x, arena, shape),
        Eval::Binary(lhs, rhs) => arith::binary(x, arena, lhs, rhs),
        Eval::Fold => fold::fold(x, arena),
        Eval::Rule => rule(x, arena, ctx),
    }
}

fn rule(x: &mut Expr, arena: &Arena, ctx: &mut EvalCtx<'_>) {
    let cond = x.arg1.map(|c| &arena[c]);
    let value = cond.map_or(Truth::Unknown, Expr::truth);
    let stamp = cond.map_or(ctx.now, |c| c.ring.stamp(0));

    if let Some(t) = x.ring.truth_mut(0).first_mut() {
        *t = value;
    }
    x.ring.sample_mut(0).stamp = stamp;
    x.valid = 1;

    if value == Truth::True {
        if let (Some(cond), Some(act)) = (x.arg1, x.arg2) {
            let bindings = action::satisfying(arena, cond);
            action::run(arena, act, &bindings, ctx);
        }
    }
}

/// Read access to an evaluated argument, honouring its shape and the
/// number of valid samples it holds.
pub(crate) struct Operand<'a> {
    pub x: &'a Expr,
    scalar: bool,
}

impl<'a> Operand<'a> {
    pub fn new(x: &'a Expr, shape: Shape) -> Self {
        Self {
            x,
            scalar: shape == Shape::Scalar,
        }
    }

    fn sample(&self, i: usize) -> usize {
        if self.scalar {
            0
        } else {
            i
        }
    }

    pub fn is_valid(&self, i: usize) -> bool {
        self.sample(i) < self.x.valid
    }

    fn at(&self, i: usize, j: usize) -> Option<(usize, usize)> {
        let (i, j) = if self.scalar { (0, 0) } else { (i, j) };
        (i < self.x.valid && j < self.x.tspan).then_some((i, j))
    }

    pub fn num(&self, i: usize, j: usize) -> f64 {
        self.at(i, j)
            .map_or(f64::NAN, |(i, j)| self.x.ring.get_f64(i, j))
    }

    pub fn truth(&self, i: usize, j: usize) -> Truth {
        self.at(i, j)
            .map_or(Truth::Unknown, |(i, j)| self.x.ring.get_truth(i, j))
    }

    pub fn stamp(&self, i: usize) -> RealTime {
        if self.is_valid(i) {
            self.x.ring.stamp(self.sample(i))
        } else {
            0.0
        }
    }
}

/// True for nodes that accumulate history one sample per tick rather than
/// recomputing their whole window.
fn accumulates(x: &Expr) -> bool {
    matches!(x.op, Op::Fetch | Op::Delay) || x.nsmpls > x.window()
}

fn begin(x: &mut Expr) {
    if x.nsmpls > 1 && accumulates(x) {
        x.ring.rotate();
    }
}

/// Updates `valid` from the number of leading samples that came out with
/// at least one known value.
fn settle(x: &mut Expr, leading: usize) {
    x.valid = if accumulates(x) {
        if leading > 0 {
            (x.valid + 1).min(x.nsmpls)
        } else {
            0
        }
    } else {
        leading
    };
}

/// Samples written this tick.
fn computed(x: &Expr) -> usize {
    if accumulates(x) {
        1
    } else {
        x.window()
    }
}

/// Writes `f(i, j)` into each computed sample of a numeric node.
fn fill_num(
    x: &mut Expr,
    mut f: impl FnMut(usize, usize) -> f64,
    stamp: impl Fn(usize) -> RealTime,
) {
    begin(x);
    let mut leading = 0;
    let mut broken = false;
    for i in 0..computed(x) {
        let mut known = false;
        for (j, v) in x.ring.num_mut(i).iter_mut().enumerate() {
            let r = f(i, j);
            *v = if r.is_finite() { r } else { f64::NAN };
            known |= !v.is_nan();
        }
        x.ring.sample_mut(i).stamp = stamp(i);
        if known && !broken {
            leading += 1;
        } else {
            broken = true;
        }
    }
    settle(x, leading);
}

/// Writes `f(i, j)` into each computed sample of a boolean node.
fn fill_truth(
    x: &mut Expr,
    mut f: impl FnMut(usize, usize) -> Truth,
    stamp: impl Fn(usize) -> RealTime,
) {
    begin(x);
    let mut leading = 0;
    let mut broken = false;
    for i in 0..computed(x) {
        let mut known = false;
        for (j, v) in x.ring.truth_mut(i).iter_mut().enumerate() {
            *v = f(i, j);
            known |= v.is_known();
        }
        x.ring.sample_mut(i).stamp = stamp(i);
        if known && !broken {
            leading += 1;
        } else {
            broken = true;
        }
    }
    settle(x, leading);
}
