use crate::action::{ActionKind, ActionSink};
use crate::engine::{wall_clock, Engine, EngineOptions};
use crate::error::EngineError;
use crate::expr::{AggOp, ArithOp, Dom, Op, QuantOp, RelOp};
use crate::scheduler::Signals;
use parking_lot::Mutex;
use std::sync::Arc;
use vigil_common::types::{InstId, InstanceSelection, RealTime, Sem, Truth};
use vigil_common::units::Units;
use vigil_source::archive::ArchiveSource;
use vigil_source::sim::SimulatedSource;

const T0: RealTime = 1_000.0;

#[derive(Clone, Default)]
struct Recorder {
    log: Arc<Mutex<Vec<(ActionKind, String)>>>,
}

impl Recorder {
    fn messages(&self) -> Vec<String> {
        self.log.lock().iter().map(|(_, m)| m.clone()).collect()
    }
}

impl ActionSink for Recorder {
    fn execute(&mut self, kind: ActionKind, message: &str, _now: RealTime) -> bool {
        self.log.lock().push((kind, message.to_string()));
        true
    }
}

fn engine_with(sim: &SimulatedSource, rec: &Recorder, delta: f64) -> Engine {
    Engine::new(
        Box::new(sim.clone()),
        Box::new(rec.clone()),
        EngineOptions {
            default_host: "alpha".into(),
            default_delta: delta,
            quiet: true,
            start: Some(T0),
            ..Default::default()
        },
    )
}

fn engine(sim: &SimulatedSource) -> Engine {
    engine_with(sim, &Recorder::default(), 1.0)
}

/// Moves the simulated clock to the next due time and runs that step.
fn tick(e: &mut Engine, sim: &SimulatedSource) -> RealTime {
    let (_, due) = e.next_due().expect("no tasks queued");
    sim.set_time(due);
    e.step().expect("past stop time")
}

/// Runs every step due at or before `until`.
fn run_until(e: &mut Engine, sim: &SimulatedSource, until: RealTime) {
    while e.next_due().is_some_and(|(_, due)| due <= until) {
        tick(e, sim);
    }
}

fn value(e: &Engine, rule: &str) -> f64 {
    e.arena()[e.rule(rule).unwrap()].value()
}

fn disk_host(sim: &SimulatedSource, host: &str, values: &[(InstId, &str, f64)]) {
    sim.add_host(host);
    let insts: Vec<(InstId, &str)> = values.iter().map(|(id, n, _)| (*id, *n)).collect();
    let indom = sim.add_indom(host, &insts);
    sim.add_metric(host, "disk.busy", Sem::Instant, Units::NONE, Some(indom));
    let vals: Vec<(InstId, f64)> = values.iter().map(|(id, _, v)| (*id, *v)).collect();
    sim.set_values(host, "disk.busy", &vals);
}

#[test]
fn counter_rate_rule_fires_with_bindings() {
    let sim = SimulatedSource::new();
    sim.add_host("alpha");
    sim.add_metric("alpha", "disk.bytes_read", Sem::Counter, Units::bytes(), None);
    sim.set_value("alpha", "disk.bytes_read", 0.0);
    let rec = Recorder::default();
    let mut e = engine_with(&sim, &rec, 1.0);

    let f = e.fetch_expr("disk.bytes_read", &[], &[], (0, 0)).unwrap();
    let rate = e.merge_expr(Op::Rate, f).unwrap();
    let limit = e.num_const(50.0, Units::NONE);
    let cond = e.rel_expr(RelOp::Gt, rate, limit).unwrap();
    let act = e.action_expr(ActionKind::Print, &["%h", "reads", "%v", "bytes/s"]);
    let rule = e.rule_expr(cond, Some(act)).unwrap();
    e.add_rule("busy_reader", rule, None).unwrap();
    e.start();

    tick(&mut e, &sim);
    assert_eq!(e.rule_value("busy_reader"), Truth::Unknown);
    assert!(rec.messages().is_empty());

    sim.set_value("alpha", "disk.bytes_read", 100.0);
    tick(&mut e, &sim);
    assert_eq!(e.rule_value("busy_reader"), Truth::True);
    assert_eq!(rec.messages(), vec!["alpha reads 100 bytes/s".to_string()]);

    sim.set_value("alpha", "disk.bytes_read", 120.0);
    tick(&mut e, &sim);
    assert_eq!(e.rule_value("busy_reader"), Truth::False);

    let stats = e.stats();
    assert_eq!(stats.rules, 1);
    assert_eq!(stats.eval_actual, 3);
    assert_eq!(stats.eval_unknown, 1);
    assert_eq!(stats.eval_true, 1);
    assert_eq!(stats.eval_false, 1);
    assert_eq!(stats.actions, 1);
}

#[test]
fn counter_wrap_yields_no_value() {
    let sim = SimulatedSource::new();
    sim.add_host("alpha");
    sim.add_metric("alpha", "net.packets", Sem::Counter, Units::count(), None);
    sim.set_value("alpha", "net.packets", 500.0);
    let mut e = engine(&sim);
    let f = e.fetch_expr("net.packets", &[], &[], (0, 0)).unwrap();
    e.add_rule("packets", f, None).unwrap();
    e.start();

    tick(&mut e, &sim);
    sim.set_value("alpha", "net.packets", 700.0);
    tick(&mut e, &sim);
    assert_eq!(value(&e, "packets"), 200.0);

    sim.set_value("alpha", "net.packets", 10.0);
    tick(&mut e, &sim);
    assert!(value(&e, "packets").is_nan());

    sim.set_value("alpha", "net.packets", 40.0);
    tick(&mut e, &sim);
    assert_eq!(value(&e, "packets"), 30.0);
}

#[test]
fn instant_reads_raw_counter() {
    let sim = SimulatedSource::new();
    sim.add_host("alpha");
    sim.add_metric("alpha", "net.packets", Sem::Counter, Units::count(), None);
    sim.set_value("alpha", "net.packets", 500.0);
    let mut e = engine(&sim);
    let f = e.fetch_expr("net.packets", &[], &[], (0, 0)).unwrap();
    let x = e.unary_expr(Op::Instant, f).unwrap();
    e.add_rule("raw", x, None).unwrap();
    e.start();

    tick(&mut e, &sim);
    assert_eq!(value(&e, "raw"), 500.0);
}

#[test]
fn delayed_fetch_reads_older_samples() {
    let sim = SimulatedSource::new();
    sim.add_host("alpha");
    sim.add_metric("alpha", "kernel.load", Sem::Instant, Units::NONE, None);
    let mut e = engine(&sim);
    let x = e.fetch_expr("kernel.load", &[], &[], (2, 2)).unwrap();
    assert_eq!(e.arena()[x].op, Op::Delay);
    e.add_rule("lagged", x, None).unwrap();
    e.start();

    for (n, v) in [1.0, 2.0, 3.0, 4.0].into_iter().enumerate() {
        sim.set_value("alpha", "kernel.load", v);
        tick(&mut e, &sim);
        if n < 2 {
            assert!(value(&e, "lagged").is_nan(), "tick {n}");
        }
    }
    // value fetched two ticks before the last one
    assert_eq!(value(&e, "lagged"), 2.0);
}

#[test]
fn sample_window_aggregates_over_time() {
    let sim = SimulatedSource::new();
    sim.add_host("alpha");
    sim.add_metric("alpha", "kernel.load", Sem::Instant, Units::NONE, None);
    let mut e = engine(&sim);
    let f = e.fetch_expr("kernel.load", &[], &[], (0, 2)).unwrap();
    let avg = e.domain_expr(Op::Aggregate(AggOp::Avg, Dom::Time), f).unwrap();
    e.add_rule("avg3", avg, None).unwrap();
    e.start();

    for v in [3.0, 6.0] {
        sim.set_value("alpha", "kernel.load", v);
        tick(&mut e, &sim);
        assert!(value(&e, "avg3").is_nan());
    }
    sim.set_value("alpha", "kernel.load", 9.0);
    tick(&mut e, &sim);
    assert_eq!(value(&e, "avg3"), 6.0);
    sim.set_value("alpha", "kernel.load", 12.0);
    tick(&mut e, &sim);
    assert_eq!(value(&e, "avg3"), 9.0);
}

#[test]
fn all_instance_fetch_follows_instance_changes() {
    let sim = SimulatedSource::new();
    disk_host(&sim, "alpha", &[(1, "sda", 1.0), (2, "sdb", 2.0)]);
    let mut e = engine(&sim);
    let f = e.fetch_expr("disk.busy", &[], &[], (0, 0)).unwrap();
    let sum = e.domain_expr(Op::Aggregate(AggOp::Sum, Dom::Inst), f).unwrap();
    e.add_rule("total", sum, None).unwrap();
    e.start();

    tick(&mut e, &sim);
    assert_eq!(value(&e, "total"), 3.0);
    assert_eq!(e.arena()[f].e_idom, 2);

    sim.set_values("alpha", "disk.busy", &[(1, 1.0), (2, 2.0), (3, 4.0)]);
    tick(&mut e, &sim);
    assert_eq!(e.arena()[f].e_idom, 3);
    assert_eq!(e.arena()[f].tspan, 3);
    assert_eq!(value(&e, "total"), 7.0);

    // same instance set again: no reshape, history kept
    tick(&mut e, &sim);
    assert_eq!(e.arena()[f].e_idom, 3);
    assert_eq!(e.arena()[f].valid, 1);
    assert_eq!(value(&e, "total"), 7.0);

    sim.set_values("alpha", "disk.busy", &[(3, 4.0)]);
    tick(&mut e, &sim);
    assert_eq!(e.arena()[f].e_idom, 1);
    assert_eq!(value(&e, "total"), 4.0);
}

#[test]
fn replaced_instance_does_not_inherit_history() {
    let sim = SimulatedSource::new();
    disk_host(&sim, "alpha", &[(1, "sda", 10.0), (2, "sdb", 20.0)]);
    let mut e = engine(&sim);
    let f = e.fetch_expr("disk.busy", &[], &[], (0, 0)).unwrap();
    let rate = e.merge_expr(Op::Rate, f).unwrap();
    e.add_rule("busy_rate", rate, None).unwrap();
    e.start();

    tick(&mut e, &sim);
    tick(&mut e, &sim);
    assert_eq!(e.arena()[rate].ring.num(0), &[0.0, 0.0][..]);

    // sda leaves and sdc arrives: same count, different instances
    let indom = e.arena()[f].metric_set[0].indom().unwrap();
    sim.set_instances("alpha", indom, &[(2, "sdb"), (3, "sdc")]);
    sim.set_values("alpha", "disk.busy", &[(2, 20.0), (3, 100.0)]);
    tick(&mut e, &sim);
    assert_eq!(e.arena()[f].e_idom, 2);
    assert_eq!(e.arena()[f].metric_set[0].inames, vec!["sdb", "sdc"]);
    assert!(e.arena()[rate].ring.num(0).iter().all(|v| v.is_nan()));

    sim.set_values("alpha", "disk.busy", &[(2, 25.0), (3, 103.0)]);
    tick(&mut e, &sim);
    assert_eq!(e.arena()[rate].ring.num(0), &[5.0, 3.0][..]);
}

#[test]
fn percent_of_instances() {
    let sim = SimulatedSource::new();
    disk_host(
        &sim,
        "alpha",
        &[(1, "sda", 10.0), (2, "sdb", 20.0), (3, "sdc", 30.0), (4, "sdd", 40.0)],
    );
    let mut e = engine(&sim);
    for (name, pcnt) in [("half", 50.0), ("most", 60.0)] {
        let f = e.fetch_expr("disk.busy", &[], &[], (0, 0)).unwrap();
        let c = e.num_const(25.0, Units::NONE);
        let rel = e.rel_expr(RelOp::Gt, f, c).unwrap();
        let x = e.percent_expr(Dom::Inst, pcnt, rel).unwrap();
        e.add_rule(name, x, None).unwrap();
    }
    e.start();
    tick(&mut e, &sim);
    assert_eq!(e.rule_value("half"), Truth::True);
    assert_eq!(e.rule_value("most"), Truth::False);

    let bad = e.num_const(1.0, Units::NONE);
    assert!(matches!(
        e.percent_expr(Dom::Inst, 150.0, bad),
        Err(EngineError::BadPercent(_))
    ));
}

#[test]
fn missing_named_instance_is_retried() {
    let sim = SimulatedSource::new();
    disk_host(&sim, "alpha", &[(1, "sda", 10.0), (2, "sdb", 20.0)]);
    let mut e = engine(&sim);
    let f = e
        .fetch_expr("disk.busy", &[], &["sdb", "sdz", "sda"], (0, 0))
        .unwrap();
    e.add_rule("picked", f, None).unwrap();

    // the missing instance is moved to the end
    let m = &e.arena()[f].metric_set[0];
    assert_eq!(m.inames, vec!["sdb", "sda", "sdz"]);
    assert_eq!(m.iids, vec![Some(2), Some(1), None]);
    assert_eq!(e.arena()[f].e_idom, 2);

    e.start();
    tick(&mut e, &sim);
    assert!(e.waiting(0));
    assert!(value(&e, "picked").is_nan());

    let indom = e.arena()[f].metric_set[0].indom().unwrap();
    sim.set_instances("alpha", indom, &[(1, "sda"), (2, "sdb"), (5, "sdz")]);
    sim.set_values("alpha", "disk.busy", &[(1, 10.0), (2, 20.0), (5, 50.0)]);
    run_until(&mut e, &sim, T0 + 1.0);
    assert!(!e.waiting(0));

    let x = &e.arena()[f];
    assert_eq!(x.e_idom, 3);
    assert_eq!(x.ring.num(0), &[20.0, 10.0, 50.0][..]);
}

#[test]
fn fetch_bundle_requests_all_instances_when_any_rule_needs_them() {
    for all_first in [false, true] {
        let sim = SimulatedSource::new();
        disk_host(&sim, "alpha", &[(1, "sda", 10.0), (2, "sdb", 20.0)]);
        let mut e = engine(&sim);
        let insts: [&[&str]; 2] = if all_first {
            [&[], &["sda"]]
        } else {
            [&["sda"], &[]]
        };
        for (n, inst) in insts.into_iter().enumerate() {
            let f = e.fetch_expr("disk.busy", &["alpha"], inst, (0, 0)).unwrap();
            let x = e.domain_expr(Op::Aggregate(AggOp::Max, Dom::Inst), f).unwrap();
            e.add_rule(&format!("r{n}"), x, None).unwrap();
        }
        assert_eq!(e.tasks().len(), 1);

        let calls = sim.selection_calls();
        assert_eq!(calls.last().unwrap().selection, InstanceSelection::All);
        if all_first {
            assert_eq!(calls.len(), 1);
        } else {
            assert_eq!(calls[0].selection, InstanceSelection::Only(vec![1]));
        }

        e.start();
        tick(&mut e, &sim);
        let fetches = sim.fetch_calls();
        assert_eq!(fetches.len(), 1, "one fetch per host per tick");
        assert_eq!(fetches[0].1.len(), 1);
        assert_eq!(value(&e, if all_first { "r0" } else { "r1" }), 20.0);
        assert_eq!(value(&e, if all_first { "r1" } else { "r0" }), 10.0);
    }
}

#[test]
fn host_failure_invalidates_only_its_expressions() {
    let sim = SimulatedSource::new();
    for host in ["alpha", "beta"] {
        sim.add_host(host);
        sim.add_metric(host, "kernel.load", Sem::Instant, Units::NONE, None);
        sim.set_value(host, "kernel.load", 2.0);
    }
    let mut e = engine(&sim);
    for (name, hosts) in [
        ("on_alpha", &["alpha"][..]),
        ("on_beta", &["beta"][..]),
        ("on_any", &["alpha", "beta"][..]),
    ] {
        let f = e.fetch_expr("kernel.load", hosts, &[], (0, 0)).unwrap();
        let c = e.num_const(1.0, Units::NONE);
        let rel = e.rel_expr(RelOp::Gt, f, c).unwrap();
        let x = if hosts.len() > 1 {
            e.domain_expr(Op::Quantify(QuantOp::All, Dom::Host), rel)
                .unwrap()
        } else {
            rel
        };
        e.add_rule(name, x, None).unwrap();
    }
    e.start();
    tick(&mut e, &sim);
    for rule in ["on_alpha", "on_beta", "on_any"] {
        assert_eq!(e.rule_value(rule), Truth::True, "{rule}");
    }

    sim.fail_fetches("alpha", 1);
    tick(&mut e, &sim);
    assert_eq!(e.rule_value("on_alpha"), Truth::Unknown);
    assert_eq!(e.rule_value("on_beta"), Truth::True);
    assert_eq!(e.rule_value("on_any"), Truth::Unknown);
    assert!(e.waiting(0));

    // the retry reconnects before the next evaluation
    run_until(&mut e, &sim, T0 + 2.0);
    assert!(!e.waiting(0));
    assert_eq!(e.rule_value("on_alpha"), Truth::True);
    assert_eq!(e.rule_value("on_any"), Truth::True);
}

#[test]
fn or_and_resolve_around_an_unavailable_operand() {
    let sim = SimulatedSource::new();
    for host in ["alpha", "beta"] {
        sim.add_host(host);
        sim.add_metric(host, "kernel.load", Sem::Instant, Units::NONE, None);
        sim.set_value(host, "kernel.load", 2.0);
    }
    sim.set_up("beta", false);
    let mut e = engine(&sim);
    let loaded = |e: &mut Engine, host: &str| {
        let f = e.fetch_expr("kernel.load", &[host], &[], (0, 0)).unwrap();
        let c = e.num_const(1.0, Units::NONE);
        e.rel_expr(RelOp::Gt, f, c).unwrap()
    };
    for (name, op) in [("either", Op::Or), ("both", Op::And)] {
        let a = loaded(&mut e, "alpha");
        let b = loaded(&mut e, "beta");
        let x = e.binary_expr(op, a, b).unwrap();
        e.add_rule(name, x, None).unwrap();
    }
    let b1 = e.fetch_expr("kernel.load", &["beta"], &[], (0, 0)).unwrap();
    let b2 = e.fetch_expr("kernel.load", &["beta"], &[], (0, 0)).unwrap();
    let same = e.rel_expr(RelOp::Eq, b1, b2).unwrap();
    e.add_rule("same", same, None).unwrap();
    e.start();

    run_until(&mut e, &sim, T0);
    assert_eq!(e.rule_value("either"), Truth::True);
    assert_eq!(e.rule_value("both"), Truth::Unknown);
    assert_eq!(e.rule_value("same"), Truth::Unknown);

    sim.set_value("alpha", "kernel.load", 0.0);
    run_until(&mut e, &sim, T0 + 1.0);
    assert_eq!(e.rule_value("either"), Truth::Unknown);
    assert_eq!(e.rule_value("both"), Truth::False);
    assert_eq!(e.rule_value("same"), Truth::Unknown);
}

#[test]
fn counter_rule_turns_true_once_two_samples_follow_an_outage() {
    let sim = SimulatedSource::new();
    sim.add_host("alpha");
    sim.add_metric("alpha", "disk.bytes_read", Sem::Counter, Units::bytes(), None);
    sim.set_up("alpha", false);
    let rec = Recorder::default();
    let mut e = engine_with(&sim, &rec, 10.0);

    let f = e.fetch_expr("disk.bytes_read", &[], &[], (0, 0)).unwrap();
    let rate = e.merge_expr(Op::Rate, f).unwrap();
    let limit = e.num_const(50.0, Units::NONE);
    let cond = e.rel_expr(RelOp::Gt, rate, limit).unwrap();
    let act = e.action_expr(ActionKind::Print, &["%v"]);
    let rule = e.rule_expr(cond, Some(act)).unwrap();
    e.add_rule("reading", rule, None).unwrap();
    e.start();

    // 1000 bytes more every 10 second tick
    let mut seen = Vec::new();
    for n in 0..5 {
        let (_, due) = e.next_due().unwrap();
        sim.set_value("alpha", "disk.bytes_read", 100.0 * (due - T0));
        if n == 1 {
            sim.set_up("alpha", true);
        }
        let at = tick(&mut e, &sim) - T0;
        seen.push((at, e.rule_value("reading")));
    }
    assert_eq!(
        seen,
        vec![
            (0.0, Truth::Unknown),
            (5.0, Truth::Unknown),
            (10.0, Truth::Unknown),
            (20.0, Truth::True),
            (30.0, Truth::True),
        ]
    );
    assert_eq!(rec.messages(), vec!["100".to_string(), "100".to_string()]);
}

#[test]
fn fetch_error_on_a_working_connection_keeps_the_host_up() {
    let sim = SimulatedSource::new();
    sim.add_host("alpha");
    sim.add_metric("alpha", "kernel.load", Sem::Instant, Units::NONE, None);
    sim.set_value("alpha", "kernel.load", 2.0);
    let mut e = engine(&sim);
    let f = e.fetch_expr("kernel.load", &[], &[], (0, 0)).unwrap();
    e.add_rule("load", f, None).unwrap();
    e.start();
    tick(&mut e, &sim);
    assert_eq!(value(&e, "load"), 2.0);

    sim.reject_fetches("alpha", 1);
    tick(&mut e, &sim);
    assert!(value(&e, "load").is_nan());
    assert!(!e.waiting(0));
    assert_eq!(e.tasks()[0].retry, 0.0);

    tick(&mut e, &sim);
    assert_eq!(value(&e, "load"), 2.0);
}

#[test]
fn unavailable_host_is_retried_with_backoff() {
    let sim = SimulatedSource::new();
    sim.add_host("alpha");
    sim.add_metric("alpha", "kernel.load", Sem::Instant, Units::NONE, None);
    sim.set_value("alpha", "kernel.load", 3.0);
    sim.set_up("alpha", false);

    let mut e = engine_with(&sim, &Recorder::default(), 60.0);
    let f = e.fetch_expr("kernel.load", &[], &[], (0, 0)).unwrap();
    assert_eq!(e.arena()[f].sem, Sem::Unknown);
    let c = e.num_const(1.0, Units::NONE);
    let rel = e.rel_expr(RelOp::Gt, f, c).unwrap();
    e.add_rule("loaded", rel, None).unwrap();
    e.start();
    assert!(e.waiting(0));

    // retries 5, 10, 20 then 40 (capped at 60) seconds apart, with the
    // evaluation at 60 in between
    let steps: Vec<RealTime> = (0..6).map(|_| tick(&mut e, &sim) - T0).collect();
    assert_eq!(steps, vec![0.0, 5.0, 15.0, 35.0, 60.0, 75.0]);
    assert_eq!(e.tasks()[0].backoff, 60.0);
    assert_eq!(e.rule_value("loaded"), Truth::Unknown);

    sim.set_up("alpha", true);
    assert_eq!(tick(&mut e, &sim) - T0, 120.0);
    assert_eq!(e.rule_value("loaded"), Truth::Unknown);
    assert_eq!(tick(&mut e, &sim) - T0, 135.0);
    assert!(!e.waiting(0));
    assert_eq!(e.arena()[f].sem, Sem::Instant);
    assert_eq!(e.tasks()[0].backoff, 5.0);

    assert_eq!(tick(&mut e, &sim) - T0, 180.0);
    assert_eq!(e.rule_value("loaded"), Truth::True);
    assert_eq!(tick(&mut e, &sim) - T0, 240.0);
}

#[test]
fn metric_appearing_later_is_picked_up() {
    let sim = SimulatedSource::new();
    sim.add_host("alpha");
    let mut e = engine(&sim);
    let f = e.fetch_expr("kernel.load", &[], &[], (0, 0)).unwrap();
    e.add_rule("load", f, None).unwrap();
    e.start();
    tick(&mut e, &sim);
    assert!(value(&e, "load").is_nan());

    sim.add_metric("alpha", "kernel.load", Sem::Instant, Units::NONE, None);
    sim.set_value("alpha", "kernel.load", 0.25);
    run_until(&mut e, &sim, T0 + 1.0);
    assert_eq!(value(&e, "load"), 0.25);
}

#[test]
fn unusable_metric_is_rejected() {
    let sim = SimulatedSource::new();
    sim.add_host("alpha");
    sim.add_metric("alpha", "kernel.load", Sem::Instant, Units::NONE, None);
    let mut e = engine(&sim);
    // a singular metric has no instances to pick
    assert!(matches!(
        e.fetch_expr("kernel.load", &[], &["cpu0"], (0, 0)),
        Err(EngineError::BadMetric { .. })
    ));
}

#[test]
fn constant_expressions_fold_into_variables() {
    let sim = SimulatedSource::new();
    let mut e = engine(&sim);
    let before = e.arena().len();

    let a = e.num_const(3.0, Units::NONE);
    let b = e.num_const(2.0, Units::NONE);
    let prod = e.binary_expr(Op::Arith(ArithOp::Mul), a, b).unwrap();
    let c = e.num_const(5.0, Units::NONE);
    let rel = e.rel_expr(RelOp::Gt, prod, c).unwrap();
    assert_eq!(e.arena()[rel].op, Op::Nop);
    assert_eq!(e.arena()[rel].truth(), Truth::True);
    assert_eq!(e.arena().len(), before + 1);

    e.add_rule("always", rel, None).unwrap();
    assert!(e.rule("always").is_none());
    assert_eq!(e.var("always"), Some(rel));
    assert_eq!(e.stats().rules, 0);

    let neg = e.num_const(4.0, Units::NONE);
    let neg = e.unary_expr(Op::Neg, neg).unwrap();
    assert_eq!(e.arena()[neg].value(), -4.0);
}

#[test]
fn variables_are_copied_into_rules() {
    let sim = SimulatedSource::new();
    sim.add_host("alpha");
    sim.add_metric("alpha", "kernel.load", Sem::Instant, Units::NONE, None);
    sim.set_value("alpha", "kernel.load", 7.0);
    let mut e = engine(&sim);

    let limit = e.num_const(5.0, Units::NONE);
    e.add_rule("limit", limit, None).unwrap();
    for name in ["a", "b"] {
        let f = e.fetch_expr("kernel.load", &[], &[], (0, 0)).unwrap();
        let l = e.var_ref("limit").unwrap();
        assert_ne!(l, limit);
        let rel = e.rel_expr(RelOp::Gt, f, l).unwrap();
        e.add_rule(name, rel, None).unwrap();
    }
    assert!(matches!(e.var_ref("nope"), Err(EngineError::UnknownVar(_))));

    let hour = e.var_ref("hour").unwrap();
    e.add_rule("hour", hour, None).unwrap();
    e.start();
    tick(&mut e, &sim);
    assert_eq!(e.rule_value("a"), Truth::True);
    assert_eq!(e.rule_value("b"), Truth::True);
    let h = value(&e, "hour");
    assert!((0.0..24.0).contains(&h));
}

#[test]
fn duplicate_rule_is_rejected_and_freed() {
    let sim = SimulatedSource::new();
    sim.add_host("alpha");
    sim.add_metric("alpha", "kernel.load", Sem::Instant, Units::NONE, None);
    let mut e = engine(&sim);

    let f = e.fetch_expr("kernel.load", &[], &[], (0, 0)).unwrap();
    e.add_rule("load", f, None).unwrap();
    let live = e.arena().len();

    let g = e.fetch_expr("kernel.load", &[], &[], (0, 0)).unwrap();
    let err = e.add_rule("load", g, None).unwrap_err();
    assert!(matches!(err, EngineError::DuplicateRule(ref n) if n == "load"));
    assert_eq!(e.arena().len(), live);
    assert_eq!(e.rule_names(), vec!["load".to_string()]);
}

#[test]
fn mismatched_domains_are_rejected() {
    let sim = SimulatedSource::new();
    for host in ["alpha", "beta"] {
        sim.add_host(host);
        sim.add_metric(host, "kernel.load", Sem::Instant, Units::NONE, None);
    }
    disk_host(&sim, "alpha", &[(1, "sda", 1.0), (2, "sdb", 2.0), (3, "sdc", 3.0)]);
    let mut e = engine(&sim);
    let live = e.arena().len();

    let load = e
        .fetch_expr("kernel.load", &["alpha", "beta"], &[], (0, 0))
        .unwrap();
    let disk = e.fetch_expr("disk.busy", &["alpha"], &[], (0, 0)).unwrap();
    let err = e
        .binary_expr(Op::Arith(ArithOp::Add), load, disk)
        .unwrap_err();
    assert!(matches!(err, EngineError::DomainMismatch { .. }));
    assert_eq!(e.arena().len(), live);

    let load = e.fetch_expr("kernel.load", &["alpha"], &[], (0, 0)).unwrap();
    assert!(matches!(
        e.unary_expr(Op::Not, load),
        Err(EngineError::ArgType { .. })
    ));
}

#[test]
fn match_inst_filters_by_instance_name() {
    let sim = SimulatedSource::new();
    disk_host(
        &sim,
        "alpha",
        &[(1, "sda", 90.0), (2, "sdb", 95.0), (3, "nvme0", 99.0)],
    );
    let rec = Recorder::default();
    let mut e = engine_with(&sim, &rec, 1.0);
    let f = e.fetch_expr("disk.busy", &[], &[], (0, 0)).unwrap();
    let c = e.num_const(80.0, Units::NONE);
    let rel = e.rel_expr(RelOp::Gt, f, c).unwrap();
    let re = e.str_const("^sd");
    let m = e.binary_expr(Op::Match, rel, re).unwrap();
    let count = e
        .domain_expr(Op::Aggregate(AggOp::Count, Dom::Inst), m)
        .unwrap();
    e.add_rule("scsi_busy", count, None).unwrap();

    let f = e.fetch_expr("disk.busy", &[], &[], (0, 0)).unwrap();
    let c = e.num_const(92.0, Units::NONE);
    let rel = e.rel_expr(RelOp::Gt, f, c).unwrap();
    let some = e.domain_expr(Op::Quantify(QuantOp::Some, Dom::Inst), rel).unwrap();
    let act = e.action_expr(ActionKind::Alarm, &["busy:", "%i"]);
    let rule = e.rule_expr(some, Some(act)).unwrap();
    e.add_rule("any_busy", rule, None).unwrap();

    e.start();
    tick(&mut e, &sim);
    assert_eq!(value(&e, "scsi_busy"), 2.0);
    assert_eq!(e.rule_value("any_busy"), Truth::True);
    assert_eq!(rec.messages(), vec!["busy: sdb nvme0".to_string()]);

    let bad = e.str_const("(");
    let f = e.fetch_expr("disk.busy", &[], &[], (0, 0)).unwrap();
    let c = e.num_const(1.0, Units::NONE);
    let rel = e.rel_expr(RelOp::Gt, f, c).unwrap();
    assert!(matches!(
        e.binary_expr(Op::Match, rel, bad),
        Err(EngineError::Regex { .. })
    ));
}

#[test]
fn rising_edge_fires_once() {
    let sim = SimulatedSource::new();
    sim.add_host("alpha");
    sim.add_metric("alpha", "kernel.load", Sem::Instant, Units::NONE, None);
    let mut e = engine(&sim);
    let f = e.fetch_expr("kernel.load", &[], &[], (0, 0)).unwrap();
    let c = e.num_const(5.0, Units::NONE);
    let rel = e.rel_expr(RelOp::Gt, f, c).unwrap();
    let rise = e.merge_expr(Op::Rise, rel).unwrap();
    e.add_rule("went_high", rise, None).unwrap();
    e.start();

    let mut seen = Vec::new();
    for v in [1.0, 9.0, 9.0, 1.0, 9.0] {
        sim.set_value("alpha", "kernel.load", v);
        tick(&mut e, &sim);
        seen.push(e.rule_value("went_high"));
    }
    assert_eq!(
        seen,
        vec![
            Truth::Unknown,
            Truth::True,
            Truth::False,
            Truth::False,
            Truth::True
        ]
    );
}

#[test]
fn action_sequences_and_alternatives() {
    #[derive(Clone, Default)]
    struct Flaky(Arc<Mutex<Vec<String>>>);

    impl ActionSink for Flaky {
        fn execute(&mut self, kind: ActionKind, message: &str, _now: RealTime) -> bool {
            self.0.lock().push(message.to_string());
            kind != ActionKind::Shell
        }
    }

    let sim = SimulatedSource::new();
    let sink = Flaky::default();
    let mut e = Engine::new(
        Box::new(sim.clone()),
        Box::new(sink.clone()),
        EngineOptions {
            start: Some(T0),
            default_delta: 1.0,
            ..Default::default()
        },
    );
    let t1 = e.bool_const(Truth::True);
    let t2 = e.bool_const(Truth::True);
    let cond = e.binary_expr(Op::And, t1, t2).unwrap();
    let shell = e.action_expr(ActionKind::Shell, &["false"]);
    let print = e.action_expr(ActionKind::Print, &["fallback"]);
    let alt = e.action_alt(shell, print);
    let again = e.action_expr(ActionKind::Shell, &["again"]);
    let never = e.action_expr(ActionKind::Print, &["never"]);
    let seq = e.action_seq(again, never);
    let both = e.action_seq(alt, seq);
    let rule = e.rule_expr(cond, Some(both)).unwrap();
    e.add_rule("act", rule, None).unwrap();
    e.start();
    tick(&mut e, &sim);

    assert_eq!(
        *sink.0.lock(),
        vec!["false".to_string(), "fallback".to_string(), "again".to_string()]
    );
    assert_eq!(e.stats().actions, 3);
    assert_eq!(e.stats().action_failures, 2);
}

#[test]
fn dump_shows_tree() {
    let sim = SimulatedSource::new();
    sim.add_host("alpha");
    sim.add_metric("alpha", "kernel.load", Sem::Instant, Units::NONE, None);
    let mut e = engine(&sim);
    let f = e.fetch_expr("kernel.load", &[], &[], (0, 0)).unwrap();
    let c = e.num_const(1.0, Units::NONE);
    let rel = e.rel_expr(RelOp::Gt, f, c).unwrap();
    e.add_rule("loaded", rel, None).unwrap();
    let dump = e.dump_rule("loaded").unwrap();
    assert!(dump.contains("kernel.load :alpha"));
    assert!(dump.contains(">"));
    let (hosts, metrics) = e.referenced();
    assert_eq!(hosts, vec!["alpha".to_string()]);
    assert_eq!(metrics, vec!["kernel.load".to_string()]);
}

const ARCHIVE: &str = r#"{
  "host": "web-01",
  "metrics": [
    { "name": "disk.dev.read_bytes", "type": "u64", "sem": "counter",
      "units": { "dim_space": 1 }, "indom": 1 }
  ],
  "indoms": { "1": [ { "id": 0, "name": "sda" }, { "id": 1, "name": "sdb" } ] },
  "records": [
    { "timestamp": 100.0, "values": { "disk.dev.read_bytes": [[0, 1000.0], [1, 5.0]] } },
    { "timestamp": 110.0, "values": { "disk.dev.read_bytes": [[0, 2000.0], [1, 6.0]] } },
    { "timestamp": 120.0, "values": { "disk.dev.read_bytes": [[0, 3000.0], [1, 7.0]] } }
  ]
}"#;

#[tokio::test]
async fn archive_replay_runs_to_the_end_without_sleeping() {
    let mut archive = ArchiveSource::new();
    archive.add_json(ARCHIVE).unwrap();
    let rec = Recorder::default();
    let mut e = Engine::new(
        Box::new(archive),
        Box::new(rec.clone()),
        EngineOptions {
            default_host: "web-01".into(),
            default_delta: 10.0,
            ..Default::default()
        },
    );
    assert!(e.is_archive());
    assert_eq!((e.start_time(), e.stop_time()), (100.0, 120.0));

    let f = e.fetch_expr("disk.dev.read_bytes", &[], &[], (0, 0)).unwrap();
    let c = e.num_const(50.0, Units::NONE);
    let rel = e.rel_expr(RelOp::Gt, f, c).unwrap();
    let some = e.domain_expr(Op::Quantify(QuantOp::Some, Dom::Inst), rel).unwrap();
    let act = e.action_expr(ActionKind::Shell, &["echo", "%i"]);
    let rule = e.rule_expr(some, Some(act)).unwrap();
    e.add_rule("reading", rule, None).unwrap();

    let signals = Signals::new();
    let started = wall_clock();
    e.run(&signals, || {}).await;
    assert!(wall_clock() - started < 5.0);

    let stats = e.stats();
    assert_eq!(stats.eval_actual, 3);
    assert_eq!(stats.eval_unknown, 1);
    assert_eq!(stats.eval_true, 2);
    // archive mode logs actions instead of performing them
    assert_eq!(stats.actions, 2);
    assert!(rec.messages().is_empty());
}

#[tokio::test]
async fn live_run_stops_on_shutdown() {
    let sim = SimulatedSource::new();
    sim.add_host("alpha");
    sim.add_metric("alpha", "kernel.load", Sem::Instant, Units::NONE, None);
    sim.set_value("alpha", "kernel.load", 1.0);
    let mut e = Engine::new(
        Box::new(sim.clone()),
        Box::new(Recorder::default()),
        EngineOptions {
            default_host: "alpha".into(),
            default_delta: 3600.0,
            ..Default::default()
        },
    );
    let f = e.fetch_expr("kernel.load", &[], &[], (0, 0)).unwrap();
    e.add_rule("load", f, None).unwrap();

    let signals = Arc::new(Signals::new());
    let stopper = signals.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        stopper.shutdown();
    });
    tokio::time::timeout(std::time::Duration::from_secs(10), e.run(&signals, || {}))
        .await
        .expect("run did not stop");
    assert_eq!(e.stats().eval_actual, 1);
    assert_eq!(value(&e, "load"), 1.0);
}
