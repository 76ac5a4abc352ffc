//! Expression nodes and the arena that owns them.
//!
//! Every node carries three cardinalities: `hdom` (hosts), `e_idom`
//! (instances) and `tdom` (samples). A positive value is a count, `-1`
//! means the dimension is collapsed to one value and `0` is an empty
//! instance set. Values are stored in a [`RingBuffer`] of `nsmpls`
//! samples, each holding `tspan` values where `tspan` is `e_idom` when
//! non-negative and `|hdom|` otherwise.
//!
//! Nodes refer to each other by [`ExprId`]. Each node is owned by its
//! parent; the metric bindings of a fetch leaf are owned by that leaf and
//! referenced (via [`Expr::metrics`]) by ancestors that label their values
//! with its hosts and instances.

use crate::action::ActionKind;
use crate::ops::Eval;
use crate::pragmatics::Metric;
use crate::ring::RingBuffer;
use regex::Regex;
use std::ops::{Index, IndexMut};
use vigil_common::types::{Sem, Truth};
use vigil_common::units::Units;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(u32);

impl ExprId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for ExprId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "x{}", self.0)
    }
}

/// Dimension folded by an aggregation or quantification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dom {
    Host,
    Inst,
    Time,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggOp {
    Sum,
    Avg,
    Max,
    Min,
    Count,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuantOp {
    All,
    Some,
    Percent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
}

/// Reserved variables whose value is derived from the evaluation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeVar {
    Delta,
    Second,
    Minute,
    Hour,
    Day,
    Month,
    Year,
    DayOfWeek,
}

impl TimeVar {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "delta" => Some(TimeVar::Delta),
            "second" => Some(TimeVar::Second),
            "minute" => Some(TimeVar::Minute),
            "hour" => Some(TimeVar::Hour),
            "day" => Some(TimeVar::Day),
            "month" => Some(TimeVar::Month),
            "year" => Some(TimeVar::Year),
            "day_of_week" => Some(TimeVar::DayOfWeek),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TimeVar::Delta => "delta",
            TimeVar::Second => "second",
            TimeVar::Minute => "minute",
            TimeVar::Hour => "hour",
            TimeVar::Day => "day",
            TimeVar::Month => "month",
            TimeVar::Year => "year",
            TimeVar::DayOfWeek => "day_of_week",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// Constant leaf, or a sub-tree folded to a constant at build time.
    Nop,
    Fetch,
    Delay,
    Clock(TimeVar),
    Rate,
    Instant,
    Neg,
    Arith(ArithOp),
    Rel(RelOp),
    Not,
    And,
    Or,
    Rise,
    Fall,
    Match,
    NoMatch,
    Aggregate(AggOp, Dom),
    Quantify(QuantOp, Dom),
    Rule,
    ActSeq,
    ActAlt,
    Action(ActionKind),
}

impl Op {
    pub fn is_action(self) -> bool {
        matches!(self, Op::ActSeq | Op::ActAlt | Op::Action(_))
    }

    /// Operators whose output has no instance dimension regardless of
    /// their arguments.
    pub fn collapses_instances(self) -> bool {
        matches!(
            self,
            Op::Aggregate(_, Dom::Host | Dom::Inst)
                | Op::Quantify(_, Dom::Host | Dom::Inst)
                | Op::Rule
                | Op::ActSeq
                | Op::ActAlt
                | Op::Action(_)
        )
    }

    /// Operators whose shape follows their arguments and must be rebuilt
    /// when a fetch leaf below them changes cardinality.
    pub fn reshapes(self) -> bool {
        matches!(
            self,
            Op::Fetch
                | Op::Neg
                | Op::Arith(_)
                | Op::Aggregate(AggOp::Sum | AggOp::Avg | AggOp::Max | AggOp::Min, _)
                | Op::Rel(_)
                | Op::Not
                | Op::And
                | Op::Or
                | Op::Rise
                | Op::Fall
                | Op::Instant
                | Op::Match
                | Op::NoMatch
        )
    }
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub op: Op,
    pub arg1: Option<ExprId>,
    pub arg2: Option<ExprId>,
    pub parent: Option<ExprId>,
    pub eval: Eval,
    pub hdom: i32,
    pub e_idom: i32,
    pub tdom: i32,
    pub tspan: usize,
    pub nsmpls: usize,
    pub nvals: usize,
    /// Number of leading samples that currently hold usable values.
    pub valid: usize,
    pub sem: Sem,
    /// `None` until the units can be derived from the arguments.
    pub units: Option<Units>,
    /// Fetch leaf whose metric bindings label this node's values.
    pub metrics: Option<ExprId>,
    /// Metric bindings, one per host; only fetch leaves own any.
    pub metric_set: Vec<Metric>,
    pub ring: RingBuffer,
    pub text: Option<String>,
    pub pattern: Option<Regex>,
}

impl Expr {
    /// Samples computed per evaluation; further samples are history.
    pub fn window(&self) -> usize {
        (self.tdom.unsigned_abs() as usize).clamp(1, self.nsmpls.max(1))
    }

    /// Sample depth needed by the node's time dimension.
    pub fn span_of(tdom: i32) -> usize {
        (tdom.unsigned_abs() as usize).max(1)
    }

    pub fn is_const(&self) -> bool {
        self.op == Op::Nop
    }

    /// Current value as a number (sample 0, first value).
    pub fn value(&self) -> f64 {
        if self.valid == 0 {
            return f64::NAN;
        }
        self.ring.get_f64(0, 0)
    }

    /// Current value as a truth value (sample 0, first value).
    pub fn truth(&self) -> Truth {
        if self.valid == 0 {
            return Truth::Unknown;
        }
        self.ring.get_truth(0, 0)
    }

    fn compute_span(&mut self) {
        self.tspan = if self.e_idom >= 0 {
            self.e_idom as usize
        } else {
            self.hdom.unsigned_abs() as usize
        };
        self.nvals = self.tspan * self.nsmpls;
    }
}

/// Owner of all expression nodes.
#[derive(Debug, Default)]
pub struct Arena {
    nodes: Vec<Option<Expr>>,
    free: Vec<u32>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ExprId) -> Option<&Expr> {
        self.nodes.get(id.index()).and_then(|n| n.as_ref())
    }

    pub fn get_mut(&mut self, id: ExprId) -> Option<&mut Expr> {
        self.nodes.get_mut(id.index()).and_then(|n| n.as_mut())
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn alloc(&mut self, x: Expr) -> ExprId {
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx as usize] = Some(x);
                ExprId(idx)
            }
            None => {
                self.nodes.push(Some(x));
                ExprId((self.nodes.len() - 1) as u32)
            }
        }
    }

    /// Creates a node and links its arguments to it.
    ///
    /// `metrics` is inherited from the primary argument. Units start known
    /// (dimensionless) for engine-produced semantics and unknown otherwise.
    #[allow(clippy::too_many_arguments)]
    pub fn new_expr(
        &mut self,
        op: Op,
        arg1: Option<ExprId>,
        arg2: Option<ExprId>,
        hdom: i32,
        idom: i32,
        tdom: i32,
        nsmpls: usize,
        sem: Sem,
    ) -> ExprId {
        let metrics = arg1.and_then(|a1| self[self.primary(a1, arg2)].metrics);
        let units = match sem {
            Sem::NumVar | Sem::NumConst | Sem::Boolean | Sem::Char | Sem::Regex => {
                Some(Units::NONE)
            }
            _ => None,
        };
        let mut x = Expr {
            op,
            arg1,
            arg2,
            parent: None,
            eval: Eval::Nop,
            hdom,
            e_idom: idom,
            tdom,
            tspan: 0,
            nsmpls: nsmpls.max(1),
            nvals: 0,
            valid: 0,
            sem,
            units,
            metrics,
            metric_set: Vec::new(),
            ring: RingBuffer::default(),
            text: None,
            pattern: None,
        };
        x.compute_span();
        x.ring = RingBuffer::new(sem, x.tspan, x.nsmpls);
        let id = self.alloc(x);
        for arg in [arg1, arg2].into_iter().flatten() {
            self[arg].parent = Some(id);
        }
        id
    }

    /// Picks the argument whose attributes a binary node inherits: the one
    /// with more than one value, else the one that owns metrics and has an
    /// uncollapsed dimension, else `arg1`.
    pub fn primary(&self, arg1: ExprId, arg2: Option<ExprId>) -> ExprId {
        let Some(arg2) = arg2 else {
            return arg1;
        };
        let a1 = &self[arg1];
        let a2 = &self[arg2];
        if a1.nvals > 1 {
            return arg1;
        }
        if a2.nvals > 1 {
            return arg2;
        }
        let open = |x: &Expr| {
            x.metrics.is_some() && (x.hdom != -1 || x.e_idom != -1 || x.tdom != -1)
        };
        if open(a1) {
            return arg1;
        }
        if open(a2) {
            return arg2;
        }
        arg1
    }

    /// Changes the ring depth of a node, discarding its history.
    pub fn change_smpls(&mut self, id: ExprId, nsmpls: usize) {
        let x = &mut self[id];
        if nsmpls == x.nsmpls {
            return;
        }
        x.nsmpls = nsmpls;
        x.nvals = x.tspan * nsmpls;
        x.valid = 0;
        x.ring.resize(nsmpls);
    }

    /// True for a fetch leaf whose metric is a counter (values are already
    /// per-second rates).
    pub fn is_counter_fetch(&self, id: ExprId) -> bool {
        let x = &self[id];
        x.op == Op::Fetch
            && x
                .metric_set
                .iter()
                .any(|m| m.desc.as_ref().is_some_and(|d| d.sem == Sem::Counter))
    }

    /// Propagates semantics, units and instance cardinality from the
    /// arguments of `id` and continues upward while something changed.
    pub fn inst_expr(&mut self, id: ExprId) {
        let mut next = Some(id);
        while let Some(id) = next.take() {
            if self.inst_one(id) {
                next = self[id].parent;
            }
        }
    }

    fn inst_one(&mut self, id: ExprId) -> bool {
        let (op, arg1, arg2) = {
            let x = &self[id];
            (x.op, x.arg1, x.arg2)
        };
        let Some(arg1) = arg1 else {
            return false;
        };
        let arg = self.primary(arg1, arg2);
        let (a1_sem, a1_units) = (self[arg1].sem, self[arg1].units);
        let a2 = arg2.map(|a| (self[a].sem, self[a].units));
        let (p_sem, p_units, p_idom) = (self[arg].sem, self[arg].units, self[arg].e_idom);
        let counter_src = self[id]
            .metrics
            .is_some_and(|m| self.is_counter_fetch(m));
        let arg_is_counter_fetch = self.is_counter_fetch(arg1);

        let mut up = false;
        let x = &mut self[id];

        if x.sem == Sem::Unknown {
            match a2 {
                None if a1_sem.is_known() => {
                    up = true;
                    x.sem = a1_sem;
                }
                None => {}
                Some((a2_sem, _)) if a1_sem.is_known() && a2_sem.is_known() => {
                    up = true;
                    x.sem = p_sem;
                }
                Some(_) => return false,
            }
        }

        if x.units.is_none() {
            match a2 {
                None => {
                    if a1_units.is_some() {
                        up = true;
                        x.units = a1_units;
                    }
                    if let Some(u) = x.units {
                        if op == Op::Instant && counter_src {
                            x.units = Some(u.times_second());
                        }
                        if op == Op::Rate && !arg_is_counter_fetch {
                            x.units = Some(u.per_second());
                        }
                    }
                }
                Some((_, a2_units)) => {
                    if let (Some(u1), Some(u2)) = (a1_units, a2_units) {
                        up = true;
                        x.units = match op {
                            Op::Arith(ArithOp::Mul) => Some(u1.product(&u2)),
                            Op::Arith(ArithOp::Div) => Some(u1.quotient(&u2)),
                            _ => p_units,
                        };
                    }
                }
            }
        }

        if !op.collapses_instances() && x.e_idom != p_idom {
            up = true;
            x.e_idom = p_idom;
            x.compute_span();
            x.valid = 0;
            x.ring.reshape(x.tspan);
        }
        up
    }

    /// Recomputes a fetch leaf's semantics, units and instance count from
    /// its metric bindings, and propagates any change to its ancestors.
    pub fn inst_fetch_expr(&mut self, id: ExprId) {
        let mut up = false;
        let x = &mut self[id];

        if x.sem == Sem::Unknown {
            if let Some(desc) = x.metric_set.iter().find_map(|m| m.desc.as_ref()) {
                if desc.sem == Sem::Counter {
                    x.sem = Sem::Instant;
                    x.units = Some(desc.units.canon().per_second());
                } else {
                    x.sem = desc.sem;
                    x.units = Some(desc.units.canon());
                }
                up = true;
            }
        }

        // m_idom < 0: instance count not known yet (host or metric
        // unavailable); 0: no values but otherwise fine.
        let mut ninst: i32 = -1;
        let mut offset = 0usize;
        for m in &mut x.metric_set {
            m.offset = offset;
            if m.m_idom >= 0 {
                ninst = ninst.max(0) + m.m_idom;
                offset += m.m_idom as usize;
            }
        }
        if x.e_idom != ninst {
            x.e_idom = ninst;
            x.compute_span();
            x.valid = 0;
            x.ring.reshape(x.tspan);
            up = true;
        }

        let units_known = x.units.is_some();
        if let Some(parent) = x.parent {
            if up || (self[parent].units.is_none() && units_known) {
                self.inst_expr(parent);
            }
        }
    }

    /// Marks a sub-tree as holding no usable values.
    pub fn clobber(&mut self, id: ExprId) {
        let x = &mut self[id];
        if x.op == Op::Nop {
            return;
        }
        x.valid = 0;
        x.ring.clear();
        let (a1, a2) = (x.arg1, x.arg2);
        for arg in [a1, a2].into_iter().flatten() {
            self.clobber(arg);
        }
    }

    /// Marks a node and every ancestor as holding no usable values, leaving
    /// sibling sub-trees alone.
    pub fn clobber_upward(&mut self, id: ExprId) {
        let mut next = Some(id);
        while let Some(id) = next {
            let x = &mut self[id];
            if x.op != Op::Nop {
                x.valid = 0;
                x.ring.clear();
            }
            next = x.parent;
        }
    }

    /// Runs `f` with the node taken out of the arena, so that it can be
    /// written while its arguments are read. `None` if the node is gone.
    pub(crate) fn with_detached<R>(
        &mut self,
        id: ExprId,
        f: impl FnOnce(&mut Expr, &Arena) -> R,
    ) -> Option<R> {
        let mut x = self.nodes.get_mut(id.index())?.take()?;
        let r = f(&mut x, self);
        self.nodes[id.index()] = Some(x);
        Some(r)
    }

    /// Frees a node and its whole sub-tree.
    pub fn free_tree(&mut self, id: ExprId) {
        let Some(x) = self.nodes.get_mut(id.index()).and_then(|n| n.take()) else {
            return;
        };
        self.free.push(id.0);
        for arg in [x.arg1, x.arg2].into_iter().flatten() {
            self.free_tree(arg);
        }
    }

    /// Deep copy of a sub-tree, returning the new root (with no parent).
    pub fn dup_tree(&mut self, id: ExprId) -> ExprId {
        let mut x = self[id].clone();
        let a1 = x.arg1.map(|a| self.dup_tree(a));
        let a2 = x.arg2.map(|a| self.dup_tree(a));
        x.arg1 = a1;
        x.arg2 = a2;
        x.parent = None;
        let is_fetch = x.op == Op::Fetch;
        let new_id = self.alloc(x);
        for arg in [a1, a2].into_iter().flatten() {
            self[arg].parent = Some(new_id);
        }
        if is_fetch {
            self[new_id].metrics = Some(new_id);
            for m in &mut self[new_id].metric_set {
                m.expr = Some(new_id);
            }
        }
        self.relink_metrics(new_id);
        new_id
    }

    /// Re-derives `metrics` references in a freshly copied sub-tree.
    fn relink_metrics(&mut self, id: ExprId) {
        let x = &self[id];
        if x.op == Op::Fetch {
            return;
        }
        if let Some(a1) = x.arg1 {
            let arg2 = x.arg2;
            let p = self.primary(a1, arg2);
            let m = self[p].metrics;
            self[id].metrics = m;
        }
    }

    /// Fetch leaves in a sub-tree, in left-to-right order.
    pub fn fetch_leaves(&self, id: ExprId) -> Vec<ExprId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            let x = &self[id];
            if x.op == Op::Fetch {
                out.push(id);
                continue;
            }
            if let Some(a2) = x.arg2 {
                stack.push(a2);
            }
            if let Some(a1) = x.arg1 {
                stack.push(a1);
            }
        }
        out
    }
}

impl Index<ExprId> for Arena {
    type Output = Expr;

    fn index(&self, id: ExprId) -> &Expr {
        self.get(id).unwrap_or_else(|| panic!("expression {id} freed"))
    }
}

impl IndexMut<ExprId> for Arena {
    fn index_mut(&mut self, id: ExprId) -> &mut Expr {
        self.get_mut(id)
            .unwrap_or_else(|| panic!("expression {id} freed"))
    }
}
