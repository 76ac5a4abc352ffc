//! Constructor-style calls that assemble expression trees.
//!
//! Each call checks its operands, creates the node with the cardinalities
//! of its primary operand and binds an evaluator. Operators whose operands
//! are all constants are folded on the spot. On error the operands passed
//! in are freed.

use crate::action::ActionKind;
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::expr::{AggOp, Dom, ExprId, Op, QuantOp, RelOp, TimeVar};
use crate::ops::{eval_const_node, find_eval, find_eval_tree};
use crate::pragmatics::{init_metric, InitStatus, Metric};
use regex::Regex;
use vigil_common::types::{Sem, Truth};
use vigil_common::units::Units;

impl Engine {
    fn fail<T>(&mut self, args: &[ExprId], err: EngineError) -> Result<T> {
        for &a in args {
            self.free_expr(a);
        }
        Err(err)
    }

    /// Frees an expression tree and drops its host and metric references.
    pub fn free_expr(&mut self, id: ExprId) {
        if self.arena.get(id).is_none() {
            return;
        }
        for leaf in self.arena.fetch_leaves(id) {
            for m in &self.arena[leaf].metric_set {
                if let Some(s) = self.host_names.lookup(&m.hname) {
                    self.host_names.release(s);
                }
                if let Some(s) = self.metric_names.lookup(&m.mname) {
                    self.metric_names.release(s);
                }
            }
        }
        self.arena.free_tree(id);
    }

    /// Fetch of `metric` from each of `hosts` (the default host if empty),
    /// restricted to `instances` if any are named.
    ///
    /// `range` selects samples `t1..=t2` ticks back; with `t1 > 0` a delay
    /// node on top of the fetch yields the older samples.
    pub fn fetch_expr(
        &mut self,
        metric: &str,
        hosts: &[&str],
        instances: &[&str],
        range: (u32, u32),
    ) -> Result<ExprId> {
        let (t1, t2) = range;
        if t2 < t1 {
            return Err(EngineError::ArgType {
                op: metric.to_string(),
                reason: format!("bad sample range {t1}..{t2}"),
            });
        }
        let (fsz, dsz) = if t1 == 0 {
            (t2 as usize + 1, 0)
        } else {
            (t1 as usize + 1, (t2 - t1) as usize + 1)
        };

        let default_host = [self.options.default_host.as_str()];
        let hosts: Vec<String> = if hosts.is_empty() { &default_host[..] } else { hosts }
            .iter()
            .map(|h| h.to_string())
            .collect();
        let instances: Vec<String> = instances.iter().map(|i| i.to_string()).collect();

        let mut set = Vec::with_capacity(hosts.len());
        for host in &hosts {
            let mut m = Metric::new(host, metric, &instances);
            if init_metric(self.source.as_mut(), &mut self.tracker, &mut m) == InitStatus::Dud {
                return Err(EngineError::BadMetric {
                    metric: metric.to_string(),
                    host: host.clone(),
                    reason: "cannot be used in a rule".to_string(),
                });
            }
            set.push(m);
        }
        for m in &set {
            self.host_names.intern(&m.hname);
            self.metric_names.intern(&m.mname);
        }

        let sum: i32 = set.iter().map(|m| m.m_idom.max(0)).sum();
        let idom = if sum == 0 { -1 } else { sum };
        let hdom = set.len() as i32;
        let x = self.arena.new_expr(
            Op::Fetch,
            None,
            None,
            hdom,
            idom,
            fsz as i32,
            fsz,
            Sem::Unknown,
        );
        self.arena[x].metric_set = set;
        self.arena[x].metrics = Some(x);
        for m in &mut self.arena[x].metric_set {
            m.expr = Some(x);
        }
        find_eval(&mut self.arena, x);
        self.arena.inst_fetch_expr(x);

        if dsz == 0 {
            return Ok(x);
        }
        let (hdom, e_idom) = (self.arena[x].hdom, self.arena[x].e_idom);
        let d = self.arena.new_expr(
            Op::Delay,
            Some(x),
            None,
            hdom,
            e_idom,
            dsz as i32,
            dsz,
            Sem::Unknown,
        );
        self.arena.inst_expr(d);
        find_eval(&mut self.arena, d);
        Ok(d)
    }

    /// Numeric constant, converted to canonical units.
    pub fn num_const(&mut self, value: f64, units: Units) -> ExprId {
        let x = self
            .arena
            .new_expr(Op::Nop, None, None, -1, -1, -1, 1, Sem::NumConst);
        let node = &mut self.arena[x];
        node.units = Some(units.canon());
        if let Some(v) = node.ring.num_mut(0).first_mut() {
            *v = value * units.scale();
        }
        node.valid = 1;
        x
    }

    pub fn str_const(&mut self, s: &str) -> ExprId {
        let x = self
            .arena
            .new_expr(Op::Nop, None, None, -1, -1, -1, 1, Sem::Char);
        self.arena[x].text = Some(s.to_string());
        self.arena[x].valid = 1;
        x
    }

    pub fn bool_const(&mut self, value: Truth) -> ExprId {
        let x = self
            .arena
            .new_expr(Op::Nop, None, None, -1, -1, -1, 1, Sem::Boolean);
        if let Some(t) = self.arena[x].ring.truth_mut(0).first_mut() {
            *t = value;
        }
        self.arena[x].valid = 1;
        x
    }

    /// Compiled pattern for `match_inst`/`nomatch_inst`.
    pub fn regex_const(&mut self, pattern: &str) -> Result<ExprId> {
        let re = Regex::new(pattern).map_err(|source| EngineError::Regex {
            pattern: pattern.to_string(),
            source,
        })?;
        let x = self
            .arena
            .new_expr(Op::Nop, None, None, -1, -1, -1, 1, Sem::Regex);
        let node = &mut self.arena[x];
        node.text = Some(pattern.to_string());
        node.pattern = Some(re);
        node.valid = 1;
        Ok(x)
    }

    /// Binds a named expression that rules can copy with [`Engine::var_ref`].
    /// A previous binding of the same name is freed.
    pub fn define_var(&mut self, name: &str, x: ExprId) {
        let sym = match self.vars.lookup(name) {
            Some(sym) => sym,
            None => self.vars.intern(name),
        };
        if let Some(old) = self.vars.set_value(sym, x) {
            self.free_expr(old);
        }
    }

    /// A copy of a variable's expression, or a clock node for the reserved
    /// time variables.
    pub fn var_ref(&mut self, name: &str) -> Result<ExprId> {
        if let Some(var) = TimeVar::from_name(name) {
            let x = self
                .arena
                .new_expr(Op::Clock(var), None, None, -1, -1, -1, 1, Sem::NumVar);
            find_eval(&mut self.arena, x);
            return Ok(x);
        }
        let Some(template) = self.var(name) else {
            return Err(EngineError::UnknownVar(name.to_string()));
        };
        let x = self.arena.dup_tree(template);
        for leaf in self.arena.fetch_leaves(x) {
            for m in &self.arena[leaf].metric_set {
                self.host_names.intern(&m.hname);
                self.metric_names.intern(&m.mname);
            }
        }
        find_eval_tree(&mut self.arena, x);
        Ok(x)
    }

    fn check_doms(&mut self, op: Op, a1: ExprId, a2: ExprId) -> Result<()> {
        let (x1, x2) = (&self.arena[a1], &self.arena[a2]);
        if x1.nvals == 1 || x2.nvals == 1 {
            return Ok(());
        }
        let dom = if x1.hdom != x2.hdom {
            "host"
        } else if x1.e_idom != x2.e_idom {
            "instance"
        } else if x1.tdom != x2.tdom {
            "time"
        } else {
            return Ok(());
        };
        self.fail(
            &[a1, a2],
            EngineError::DomainMismatch {
                op: crate::show::op_str(op),
                dom,
            },
        )
    }

    fn require(&mut self, op: Op, args: &[ExprId], ok: impl Fn(Sem) -> bool, what: &str) -> Result<()> {
        if args.iter().all(|a| ok(self.arena[*a].sem)) {
            return Ok(());
        }
        self.fail(
            args,
            EngineError::ArgType {
                op: crate::show::op_str(op),
                reason: format!("requires {what} argument"),
            },
        )
    }

    /// Folds a node whose operands are all constants into a constant.
    fn eval_const(&mut self, x: ExprId) {
        let node = &self.arena[x];
        let constant = |a: Option<ExprId>| a.map_or(true, |a| self.arena[a].op == Op::Nop);
        if node.op.is_action() || node.op == Op::Rule || node.arg1.is_none() {
            return;
        }
        if !(constant(node.arg1) && constant(node.arg2)) {
            return;
        }
        if !eval_const_node(&mut self.arena, x) {
            return;
        }
        let node = &mut self.arena[x];
        let args = [node.arg1.take(), node.arg2.take()];
        node.op = Op::Nop;
        node.eval = Default::default();
        node.metrics = None;
        for a in args.into_iter().flatten() {
            self.arena.free_tree(a);
        }
    }

    /// `-x`, `!x` or `instant x`.
    pub fn unary_expr(&mut self, op: Op, arg: ExprId) -> Result<ExprId> {
        match op {
            Op::Neg | Op::Instant => self.require(op, &[arg], numeric, "numeric")?,
            Op::Not => self.require(op, &[arg], boolean, "boolean")?,
            _ => {
                return self.fail(
                    &[arg],
                    EngineError::ArgType {
                        op: crate::show::op_str(op),
                        reason: "not a unary operator".to_string(),
                    },
                )
            }
        }
        let a = &self.arena[arg];
        let (hdom, idom, tdom, sem) = (a.hdom, a.e_idom, a.tdom, a.sem);
        let x = self.arena.new_expr(
            op,
            Some(arg),
            None,
            hdom,
            idom,
            tdom,
            Self::span(tdom),
            sem,
        );
        self.arena.inst_expr(x);
        find_eval(&mut self.arena, x);
        self.eval_const(x);
        Ok(x)
    }

    /// `rate`, `rising` or `falling`: operators that compare consecutive
    /// samples, so the argument keeps one more sample than its window.
    pub fn merge_expr(&mut self, op: Op, arg: ExprId) -> Result<ExprId> {
        match op {
            Op::Rate => self.require(op, &[arg], numeric, "numeric")?,
            Op::Rise | Op::Fall => self.require(op, &[arg], boolean, "boolean")?,
            _ => {
                return self.fail(
                    &[arg],
                    EngineError::ArgType {
                        op: crate::show::op_str(op),
                        reason: "not a sample-merging operator".to_string(),
                    },
                )
            }
        }
        let need = self.arena[arg].window() + 1;
        if self.arena[arg].nsmpls < need {
            self.arena.change_smpls(arg, need);
        }
        let a = &self.arena[arg];
        let (hdom, idom, tdom, sem) = (a.hdom, a.e_idom, a.tdom, a.sem);
        let x = self.arena.new_expr(
            op,
            Some(arg),
            None,
            hdom,
            idom,
            tdom,
            Self::span(tdom),
            sem,
        );
        self.arena.inst_expr(x);
        find_eval(&mut self.arena, x);
        find_eval(&mut self.arena, arg);
        Ok(x)
    }

    /// Arithmetic, `&&`, `||`, `match_inst` and `nomatch_inst`.
    ///
    /// For the pattern operators `a2` must be a string constant; it is
    /// compiled in place.
    pub fn binary_expr(&mut self, op: Op, a1: ExprId, a2: ExprId) -> Result<ExprId> {
        let arg = match op {
            Op::Arith(_) => {
                self.require(op, &[a1, a2], numeric, "numeric")?;
                self.check_doms(op, a1, a2)?;
                self.arena.primary(a1, Some(a2))
            }
            Op::And | Op::Or => {
                self.require(op, &[a1, a2], boolean, "boolean")?;
                self.check_doms(op, a1, a2)?;
                self.arena.primary(a1, Some(a2))
            }
            Op::Match | Op::NoMatch => {
                self.require(op, &[a1], boolean, "boolean")?;
                let node = &self.arena[a2];
                let pattern = match (&node.pattern, &node.text) {
                    (Some(_), _) => None,
                    (None, Some(text)) if node.sem == Sem::Char => Some(text.clone()),
                    _ => {
                        return self.fail(
                            &[a1, a2],
                            EngineError::ArgType {
                                op: crate::show::op_str(op),
                                reason: "requires a pattern".to_string(),
                            },
                        )
                    }
                };
                if let Some(pattern) = pattern {
                    match Regex::new(&pattern) {
                        Ok(re) => {
                            let node = &mut self.arena[a2];
                            node.pattern = Some(re);
                            node.sem = Sem::Regex;
                        }
                        Err(source) => {
                            return self.fail(&[a1, a2], EngineError::Regex { pattern, source })
                        }
                    }
                }
                a1
            }
            _ => {
                return self.fail(
                    &[a1, a2],
                    EngineError::ArgType {
                        op: crate::show::op_str(op),
                        reason: "not a binary operator".to_string(),
                    },
                )
            }
        };
        let p = &self.arena[arg];
        let (hdom, idom, tdom, sem) = (p.hdom, p.e_idom, p.tdom, p.sem);
        let x = self.arena.new_expr(
            op,
            Some(a1),
            Some(a2),
            hdom,
            idom,
            tdom,
            Self::span(tdom),
            sem,
        );
        self.arena.inst_expr(x);
        find_eval(&mut self.arena, x);
        self.eval_const(x);
        Ok(x)
    }

    /// Comparison of two numeric operands, giving a truth value per
    /// position.
    pub fn rel_expr(&mut self, op: RelOp, a1: ExprId, a2: ExprId) -> Result<ExprId> {
        let rel = Op::Rel(op);
        self.require(rel, &[a1, a2], numeric, "numeric")?;
        self.check_doms(rel, a1, a2)?;
        let arg = self.arena.primary(a1, Some(a2));
        let p = &self.arena[arg];
        let (hdom, idom, tdom) = (p.hdom, p.e_idom, p.tdom);
        let x = self.arena.new_expr(
            rel,
            Some(a1),
            Some(a2),
            hdom,
            idom,
            tdom,
            Self::span(tdom),
            Sem::Boolean,
        );
        self.arena.inst_expr(x);
        find_eval(&mut self.arena, x);
        self.eval_const(x);
        Ok(x)
    }

    /// Aggregation (`sum`, `avg`, `max`, `min`, `count`) or quantification
    /// (`all`, `some`) over one domain of `arg`.
    pub fn domain_expr(&mut self, op: Op, arg: ExprId) -> Result<ExprId> {
        let dom = match op {
            Op::Aggregate(AggOp::Count, dom) => dom,
            Op::Aggregate(_, dom) => {
                self.require(op, &[arg], numeric, "numeric")?;
                dom
            }
            Op::Quantify(_, dom) => {
                self.require(op, &[arg], boolean, "boolean")?;
                dom
            }
            _ => {
                return self.fail(
                    &[arg],
                    EngineError::ArgType {
                        op: crate::show::op_str(op),
                        reason: "not an aggregation".to_string(),
                    },
                )
            }
        };
        let a = &self.arena[arg];
        let (mut hdom, mut idom, mut tdom, sem) = (a.hdom, a.e_idom, a.tdom, a.sem);
        match dom {
            Dom::Host => {
                if hdom == -1 {
                    return self.fail(
                        &[arg],
                        EngineError::NoDomain {
                            op: crate::show::op_str(op),
                            dom: "host",
                        },
                    );
                }
                hdom = -1;
                idom = -1;
            }
            Dom::Inst => idom = -1,
            Dom::Time => {
                if tdom == -1 {
                    return self.fail(
                        &[arg],
                        EngineError::NoDomain {
                            op: crate::show::op_str(op),
                            dom: "time",
                        },
                    );
                }
                tdom = -1;
            }
        }
        let count = matches!(op, Op::Aggregate(AggOp::Count, _));
        let sem = if count { Sem::Instant } else { sem };
        let x = self.arena.new_expr(
            op,
            Some(arg),
            None,
            hdom,
            idom,
            tdom,
            Self::span(tdom),
            sem,
        );
        if count {
            self.arena[x].units = Some(Units::count());
        }
        self.arena.inst_expr(x);
        find_eval(&mut self.arena, x);
        Ok(x)
    }

    /// `pcnt_<dom>(pcnt, arg)`: TRUE when at least `pcnt` percent of the
    /// known values are TRUE.
    pub fn percent_expr(&mut self, dom: Dom, pcnt: f64, arg: ExprId) -> Result<ExprId> {
        if !(0.0..=100.0).contains(&pcnt) {
            return self.fail(&[arg], EngineError::BadPercent(pcnt));
        }
        let x = self.domain_expr(Op::Quantify(QuantOp::Percent, dom), arg)?;
        let p = self.num_const(pcnt / 100.0, Units::NONE);
        self.arena[x].arg2 = Some(p);
        self.arena[p].parent = Some(x);
        Ok(x)
    }

    /// A rule: `cond -> action`. Without an action the condition itself is
    /// the rule.
    pub fn rule_expr(&mut self, cond: ExprId, action: Option<ExprId>) -> Result<ExprId> {
        let Some(action) = action else {
            return Ok(cond);
        };
        if self.arena[cond].nvals != 1 {
            let what = crate::show::op_str(self.arena[cond].op);
            return self.fail(&[cond, action], EngineError::RuleCondition(what));
        }
        let x = self.arena.new_expr(
            Op::Rule,
            Some(cond),
            Some(action),
            -1,
            -1,
            -1,
            1,
            Sem::Boolean,
        );
        find_eval(&mut self.arena, x);
        Ok(x)
    }

    /// An action whose message is `args` joined by spaces.
    pub fn action_expr(&mut self, kind: ActionKind, args: &[&str]) -> ExprId {
        let x = self
            .arena
            .new_expr(Op::Action(kind), None, None, -1, -1, -1, 1, Sem::Boolean);
        self.arena[x].text = Some(args.join(" "));
        find_eval(&mut self.arena, x);
        x
    }

    /// `a & b`: run `b` only if `a` succeeded.
    pub fn action_seq(&mut self, a: ExprId, b: ExprId) -> ExprId {
        self.act_node(Op::ActSeq, a, b)
    }

    /// `a | b`: run `b` only if `a` failed.
    pub fn action_alt(&mut self, a: ExprId, b: ExprId) -> ExprId {
        self.act_node(Op::ActAlt, a, b)
    }

    fn act_node(&mut self, op: Op, a: ExprId, b: ExprId) -> ExprId {
        let x = self
            .arena
            .new_expr(op, Some(a), Some(b), -1, -1, -1, 1, Sem::Boolean);
        find_eval(&mut self.arena, x);
        x
    }

    /// Adds a named statement. A constant becomes a variable (replacing any
    /// previous value); anything else becomes a rule evaluated every
    /// `delta` seconds (the default interval if `None`).
    pub fn add_rule(&mut self, name: &str, x: ExprId, delta: Option<f64>) -> Result<()> {
        if self.arena[x].op == Op::Nop {
            self.define_var(name, x);
            return Ok(());
        }
        let delta = delta.unwrap_or(self.options.default_delta);
        if !(delta.is_finite() && delta > 0.0) {
            return self.fail(&[x], EngineError::BadDelta(delta));
        }
        if self.rules.lookup(name).is_some() {
            return self.fail(&[x], EngineError::DuplicateRule(name.to_string()));
        }

        for leaf in self.arena.fetch_leaves(x) {
            self.arena.inst_fetch_expr(leaf);
        }
        find_eval_tree(&mut self.arena, x);
        self.arena[x].text = Some(name.to_string());
        let sym = self.rules.intern(name);
        self.rules.set_value(sym, x);

        let task = self.find_task(delta);
        self.bundle(task, x);
        self.tasks[task].rules.push(x);
        self.stats.rules += 1;
        self.stats.eval_expected += 1.0 / delta;
        tracing::debug!(rule = name, delta, "rule scheduled");
        Ok(())
    }

    fn span(tdom: i32) -> usize {
        crate::expr::Expr::span_of(tdom)
    }
}

// Operands whose semantics are still unknown (metric not yet resolved)
// pass either check.
fn numeric(sem: Sem) -> bool {
    sem == Sem::Unknown || sem.is_numeric()
}

fn boolean(sem: Sem) -> bool {
    sem == Sem::Unknown || sem == Sem::Boolean
}
