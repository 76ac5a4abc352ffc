//! Rule actions.
//!
//! When a rule's condition is TRUE its action tree runs once for that tick.
//! Leaves are [`ActionKind`] actions with a message template; `%h`, `%i`
//! and `%v` in the template expand to the hosts, instances and values that
//! satisfied the condition. Inner nodes combine actions: a sequence runs
//! its second action only if the first succeeded, an alternative only if
//! it failed.

use crate::expr::{Arena, ExprId, Op};
use crate::ops::EvalCtx;
use crate::show;
use std::process::{Child, Command};
use vigil_common::types::{to_datetime, RealTime, Truth};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// Run a command with `sh -c`, without waiting for it.
    Shell,
    Alarm,
    Syslog,
    Print,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActionKind::Shell => "shell",
            ActionKind::Alarm => "alarm",
            ActionKind::Syslog => "syslog",
            ActionKind::Print => "print",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shell" => Ok(ActionKind::Shell),
            "alarm" => Ok(ActionKind::Alarm),
            "syslog" => Ok(ActionKind::Syslog),
            "print" => Ok(ActionKind::Print),
            other => Err(format!("unknown action kind: {other}")),
        }
    }
}

/// Performs actions on behalf of the engine.
pub trait ActionSink: Send {
    /// Performs one action; returns false if it failed.
    fn execute(&mut self, kind: ActionKind, message: &str, now: RealTime) -> bool;

    /// Collects finished child processes. Called before every sleep.
    fn reap(&mut self) {}
}

/// Actions with real side effects: shell commands are spawned, alarms and
/// syslog messages go to the log, print writes to standard output.
#[derive(Debug, Default)]
pub struct SystemActions {
    children: Vec<Child>,
}

impl SystemActions {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ActionSink for SystemActions {
    fn execute(&mut self, kind: ActionKind, message: &str, now: RealTime) -> bool {
        match kind {
            ActionKind::Shell => match Command::new("sh").arg("-c").arg(message).spawn() {
                Ok(child) => {
                    tracing::debug!(pid = child.id(), command = %message, "spawned action");
                    self.children.push(child);
                    true
                }
                Err(e) => {
                    tracing::error!(command = %message, error = %e, "cannot run shell action");
                    false
                }
            },
            ActionKind::Alarm => {
                tracing::warn!(target: "vigil::alarm", "{message}");
                true
            }
            ActionKind::Syslog => {
                tracing::info!(target: "vigil::syslog", "{message}");
                true
            }
            ActionKind::Print => {
                println!("{}: {message}", to_datetime(now).format("%a %b %e %H:%M:%S %Y"));
                true
            }
        }
    }

    fn reap(&mut self) {
        self.children.retain_mut(|child| match child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(pid = child.id(), %status, "action finished");
                false
            }
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(pid = child.id(), error = %e, "cannot wait for action");
                false
            }
        });
    }
}

/// One value that satisfied a rule condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub host: String,
    pub inst: String,
    pub value: f64,
}

/// Hosts, instances and values for which the first comparison in the
/// condition held on this tick.
pub fn satisfying(arena: &Arena, cond: ExprId) -> Vec<Binding> {
    let mut stack = vec![cond];
    let mut rel = None;
    while let Some(id) = stack.pop() {
        let x = &arena[id];
        if matches!(x.op, Op::Rel(_)) {
            rel = Some(id);
            break;
        }
        if let Some(a2) = x.arg2 {
            stack.push(a2);
        }
        if let Some(a1) = x.arg1 {
            stack.push(a1);
        }
    }
    let Some(rel) = rel else {
        return Vec::new();
    };
    let x = &arena[rel];
    if x.valid == 0 {
        return Vec::new();
    }
    let operand = x.arg1.map(|a1| &arena[arena.primary(a1, x.arg2)]);
    (0..x.tspan)
        .filter(|&j| x.ring.get_truth(0, j) == Truth::True)
        .map(|j| {
            let (host, inst) = show::lookup_host_inst(arena, x, j);
            let value = operand.map_or(f64::NAN, |o| {
                let k = if o.tspan == 1 { 0 } else { j };
                o.ring.get_f64(0, k)
            });
            Binding { host, inst, value }
        })
        .collect()
}

/// Expands `%h`, `%i`, `%v` and `%%` in an action template.
pub fn expand(template: &str, bindings: &[Binding]) -> String {
    let join = |f: &dyn Fn(&Binding) -> String| {
        bindings.iter().map(f).collect::<Vec<_>>().join(" ")
    };
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('h') => out.push_str(&join(&|b| b.host.clone())),
            Some('i') => out.push_str(&join(&|b| b.inst.clone())),
            Some('v') => out.push_str(&join(&|b| show::num_string(b.value))),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

/// Runs an action tree; returns whether it succeeded.
pub(crate) fn run(arena: &Arena, id: ExprId, bindings: &[Binding], ctx: &mut EvalCtx<'_>) -> bool {
    let x = &arena[id];
    match x.op {
        Op::ActSeq => {
            let ok = x.arg1.is_some_and(|a| run(arena, a, bindings, ctx));
            ok && x.arg2.map_or(true, |b| run(arena, b, bindings, ctx))
        }
        Op::ActAlt => {
            let ok = x.arg1.is_some_and(|a| run(arena, a, bindings, ctx));
            ok || x.arg2.is_some_and(|b| run(arena, b, bindings, ctx))
        }
        Op::Action(kind) => {
            let message = expand(x.text.as_deref().unwrap_or_default(), bindings);
            ctx.stats.actions += 1;
            if ctx.archive {
                tracing::info!(action = %kind, %message, "action (not performed in archive mode)");
                return true;
            }
            let ok = ctx.actions.execute(kind, &message, ctx.now);
            if !ok {
                ctx.stats.action_failures += 1;
            }
            ok
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_bindings() {
        let bindings = vec![
            Binding {
                host: "alpha".into(),
                inst: "sda".into(),
                value: 12.5,
            },
            Binding {
                host: "alpha".into(),
                inst: "sdb".into(),
                value: 40.0,
            },
        ];
        assert_eq!(
            expand("busy %i on %h: %v%%", &bindings[..1]),
            "busy sda on alpha: 12.5%"
        );
        assert_eq!(expand("%i", &bindings), "sda sdb");
        assert_eq!(expand("%v", &bindings), "12.5 40");
        assert_eq!(expand("100%x %", &[]), "100%x %");
    }

    #[test]
    fn action_kind_round_trips_through_text() {
        for kind in [
            ActionKind::Shell,
            ActionKind::Alarm,
            ActionKind::Syslog,
            ActionKind::Print,
        ] {
            assert_eq!(kind.to_string().parse::<ActionKind>(), Ok(kind));
        }
        assert!("page".parse::<ActionKind>().is_err());
    }
}
