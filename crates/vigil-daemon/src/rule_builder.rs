use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use vigil_common::types::Truth;
use vigil_common::units::Units;
use vigil_engine::{
    ActionKind, AggOp, ArithOp, Dom, Engine, ExprId, Op, QuantOp, RelOp,
};

// ---- Rule file JSON schema ----

#[derive(Debug, Clone, Deserialize)]
pub struct RuleFile {
    #[serde(default)]
    pub statements: Vec<Statement>,
}

/// A named expression. Constants become variables; everything else is a
/// rule evaluated every `delta` seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct Statement {
    pub name: String,
    pub delta: Option<f64>,
    pub expr: ExprSpec,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExprSpec {
    Fetch {
        metric: String,
        #[serde(default)]
        hosts: Vec<String>,
        #[serde(default)]
        instances: Vec<String>,
        /// `[t1, t2]`: samples t1 to t2 intervals ago.
        samples: Option<[u32; 2]>,
    },
    Num {
        value: f64,
        #[serde(default)]
        units: Units,
    },
    Bool(bool),
    Str(String),
    Var(String),
    /// `neg`, `not`, `instant`, `rate`, `rising`, `falling`.
    Unary { op: String, arg: Box<ExprSpec> },
    /// Arithmetic, comparison, `&&`, `||`, `match_inst`, `nomatch_inst`.
    Binary {
        op: String,
        lhs: Box<ExprSpec>,
        rhs: Box<ExprSpec>,
    },
    /// `<op>_<domain>`, e.g. `sum_inst`, `all_host`, `max_sample`.
    Aggregate { op: String, arg: Box<ExprSpec> },
    Percent {
        dom: String,
        pcnt: f64,
        arg: Box<ExprSpec>,
    },
    Rule {
        cond: Box<ExprSpec>,
        action: ActionSpec,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionSpec {
    Run {
        kind: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Second action runs only if the first succeeds.
    Seq(Box<ActionSpec>, Box<ActionSpec>),
    /// Second action runs only if the first fails.
    Alt(Box<ActionSpec>, Box<ActionSpec>),
}

// ---- Operator names ----

fn parse_dom(s: &str) -> Result<Dom> {
    match s {
        "host" => Ok(Dom::Host),
        "inst" => Ok(Dom::Inst),
        "sample" => Ok(Dom::Time),
        other => Err(anyhow!("unknown domain: {other}")),
    }
}

fn unary_op(s: &str) -> Result<Op> {
    match s {
        "neg" | "-" => Ok(Op::Neg),
        "not" | "!" => Ok(Op::Not),
        "instant" => Ok(Op::Instant),
        "rate" => Ok(Op::Rate),
        "rising" => Ok(Op::Rise),
        "falling" => Ok(Op::Fall),
        other => Err(anyhow!("unknown unary operator: {other}")),
    }
}

fn binary_op(s: &str) -> Result<Op> {
    Ok(match s {
        "+" => Op::Arith(ArithOp::Add),
        "-" => Op::Arith(ArithOp::Sub),
        "*" => Op::Arith(ArithOp::Mul),
        "/" => Op::Arith(ArithOp::Div),
        "==" => Op::Rel(RelOp::Eq),
        "!=" => Op::Rel(RelOp::Neq),
        "<" => Op::Rel(RelOp::Lt),
        "<=" => Op::Rel(RelOp::Lte),
        ">" => Op::Rel(RelOp::Gt),
        ">=" => Op::Rel(RelOp::Gte),
        "&&" | "and" => Op::And,
        "||" | "or" => Op::Or,
        "match_inst" => Op::Match,
        "nomatch_inst" => Op::NoMatch,
        other => return Err(anyhow!("unknown binary operator: {other}")),
    })
}

fn domain_op(s: &str) -> Result<Op> {
    let (op, dom) = s
        .split_once('_')
        .ok_or_else(|| anyhow!("aggregation must be <op>_<domain>: {s}"))?;
    let dom = parse_dom(dom)?;
    Ok(match op {
        "sum" => Op::Aggregate(AggOp::Sum, dom),
        "avg" => Op::Aggregate(AggOp::Avg, dom),
        "max" => Op::Aggregate(AggOp::Max, dom),
        "min" => Op::Aggregate(AggOp::Min, dom),
        "count" => Op::Aggregate(AggOp::Count, dom),
        "all" => Op::Quantify(QuantOp::All, dom),
        "some" => Op::Quantify(QuantOp::Some, dom),
        other => return Err(anyhow!("unknown aggregation: {other}")),
    })
}

// ---- JSON -> expression tree ----

/// Builds an expression tree through the engine's builder calls.
pub fn build_expr(engine: &mut Engine, spec: &ExprSpec) -> Result<ExprId> {
    match spec {
        ExprSpec::Fetch {
            metric,
            hosts,
            instances,
            samples,
        } => {
            let hosts: Vec<&str> = hosts.iter().map(String::as_str).collect();
            let instances: Vec<&str> = instances.iter().map(String::as_str).collect();
            let [t1, t2] = samples.unwrap_or([0, 0]);
            Ok(engine.fetch_expr(metric, &hosts, &instances, (t1, t2))?)
        }
        ExprSpec::Num { value, units } => Ok(engine.num_const(*value, *units)),
        ExprSpec::Bool(b) => Ok(engine.bool_const(Truth::from_bool(*b))),
        ExprSpec::Str(s) => Ok(engine.str_const(s)),
        ExprSpec::Var(name) => Ok(engine.var_ref(name)?),
        ExprSpec::Unary { op, arg } => {
            let op = unary_op(op)?;
            let arg = build_expr(engine, arg)?;
            let x = match op {
                Op::Rate | Op::Rise | Op::Fall => engine.merge_expr(op, arg)?,
                _ => engine.unary_expr(op, arg)?,
            };
            Ok(x)
        }
        ExprSpec::Binary { op, lhs, rhs } => {
            let op = binary_op(op)?;
            let lhs = build_expr(engine, lhs)?;
            let rhs = match build_expr(engine, rhs) {
                Ok(rhs) => rhs,
                Err(e) => {
                    engine.free_expr(lhs);
                    return Err(e);
                }
            };
            let x = match op {
                Op::Rel(rel) => engine.rel_expr(rel, lhs, rhs)?,
                _ => engine.binary_expr(op, lhs, rhs)?,
            };
            Ok(x)
        }
        ExprSpec::Aggregate { op, arg } => {
            let op = domain_op(op)?;
            let arg = build_expr(engine, arg)?;
            Ok(engine.domain_expr(op, arg)?)
        }
        ExprSpec::Percent { dom, pcnt, arg } => {
            let dom = parse_dom(dom)?;
            let arg = build_expr(engine, arg)?;
            Ok(engine.percent_expr(dom, *pcnt, arg)?)
        }
        ExprSpec::Rule { cond, action } => {
            let cond = build_expr(engine, cond)?;
            let action = match build_action(engine, action) {
                Ok(a) => a,
                Err(e) => {
                    engine.free_expr(cond);
                    return Err(e);
                }
            };
            Ok(engine.rule_expr(cond, Some(action))?)
        }
    }
}

fn build_action(engine: &mut Engine, spec: &ActionSpec) -> Result<ExprId> {
    match spec {
        ActionSpec::Run { kind, args } => {
            let kind: ActionKind = kind.parse().map_err(|e: String| anyhow!("{e}"))?;
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            Ok(engine.action_expr(kind, &args))
        }
        ActionSpec::Seq(a, b) | ActionSpec::Alt(a, b) => {
            let a = build_action(engine, a)?;
            let b = match build_action(engine, b) {
                Ok(b) => b,
                Err(e) => {
                    engine.free_expr(a);
                    return Err(e);
                }
            };
            Ok(match spec {
                ActionSpec::Seq(..) => engine.action_seq(a, b),
                _ => engine.action_alt(a, b),
            })
        }
    }
}

/// Adds every statement of a parsed rule file. Statements that fail to
/// build are logged and skipped. Returns the number added.
pub fn load_statements(engine: &mut Engine, file: &RuleFile) -> usize {
    let mut loaded = 0;
    for stmt in &file.statements {
        let added = build_expr(engine, &stmt.expr)
            .and_then(|x| Ok(engine.add_rule(&stmt.name, x, stmt.delta)?));
        match added {
            Ok(()) => loaded += 1,
            Err(e) => tracing::warn!(rule = %stmt.name, error = %e, "skipping statement"),
        }
    }
    loaded
}

/// Loads a JSON rule file into the engine.
pub fn load_rules(engine: &mut Engine, path: &str) -> Result<usize> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("cannot read rules from {path}"))?;
    let file: RuleFile =
        serde_json::from_str(&content).with_context(|| format!("invalid rule file {path}"))?;
    let loaded = load_statements(engine, &file);
    tracing::info!(
        path,
        loaded,
        skipped = file.statements.len() - loaded,
        "rules loaded"
    );
    Ok(loaded)
}
