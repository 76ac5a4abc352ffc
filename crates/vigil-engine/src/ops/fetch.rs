//! Leaf evaluators: metric fetches, delayed samples and clock variables.

use super::{settle, EvalCtx};
use crate::expr::{Arena, Expr, Op, TimeVar};
use chrono::{Datelike, Local, TimeZone, Timelike};

/// Copies the values distributed by the last task fetch into sample 0,
/// converting counters to per-second rates.
pub(super) fn fetch(x: &mut Expr) {
    if x.nsmpls > 1 {
        x.ring.rotate();
    }
    let tspan = x.tspan;
    let mut out = vec![f64::NAN; tspan];
    let mut stamp = 0.0_f64;

    for m in &mut x.metric_set {
        let (Some(conv), Some(set)) = (m.conv, m.vset.as_ref()) else {
            m.raw.fill(f64::NAN);
            continue;
        };
        stamp = stamp.max(m.stamp);
        let singular = m.is_singular();
        let counter = m.is_counter();
        let width = m.width();
        m.raw.resize(width, f64::NAN);
        if counter {
            m.prev.resize(width, f64::NAN);
        }
        let dt = m.stamp - m.stomp;
        for k in 0..width {
            let value = if singular {
                set.values.first().map(|(_, v)| *v)
            } else {
                m.iids.get(k).copied().flatten().and_then(|id| set.get(id))
            };
            let raw = value.map_or(f64::NAN, |v| v * conv);
            m.raw[k] = raw;
            let v = if counter {
                let prev = std::mem::replace(&mut m.prev[k], raw);
                if m.stomp > 0.0 && dt > 0.0 && raw >= prev {
                    (raw - prev) / dt
                } else {
                    f64::NAN
                }
            } else {
                raw
            };
            if let Some(slot) = out.get_mut(m.offset + k) {
                *slot = v;
            }
        }
        if counter {
            m.stomp = m.stamp;
        }
    }

    let known = out.iter().any(|v| !v.is_nan());
    for (dst, v) in x.ring.num_mut(0).iter_mut().zip(out) {
        *dst = v;
    }
    x.ring.sample_mut(0).stamp = stamp;
    settle(x, usize::from(known));
}

/// Emits the oldest sample held by the argument, i.e. the value fetched
/// `arg.nsmpls - 1` ticks ago.
pub(super) fn delay(x: &mut Expr, arena: &Arena) {
    let Some(arg) = x.arg1.map(|a| &arena[a]) else {
        return;
    };
    if x.nsmpls > 1 {
        x.ring.rotate();
    }
    let n = arg.nsmpls;
    if arg.valid < n {
        x.ring.clear_sample(0);
        x.ring.sample_mut(0).stamp = 0.0;
        settle(x, 0);
        return;
    }
    let stamp = arg.ring.stamp(n - 1);
    let src = arg.ring.num(n - 1);
    let mut known = false;
    for (dst, v) in x.ring.num_mut(0).iter_mut().zip(src) {
        *dst = *v;
        known |= !v.is_nan();
    }
    x.ring.sample_mut(0).stamp = stamp;
    settle(x, usize::from(known));
}

/// Reserved time variables, taken from the scheduled evaluation time in
/// local time.
pub(super) fn clock(x: &mut Expr, ctx: &EvalCtx<'_>) {
    let Op::Clock(var) = x.op else {
        return;
    };
    let secs = ctx.now.floor() as i64;
    let value = match Local.timestamp_opt(secs, 0).single() {
        Some(t) => match var {
            TimeVar::Delta => ctx.delta,
            TimeVar::Second => f64::from(t.second()),
            TimeVar::Minute => f64::from(t.minute()),
            TimeVar::Hour => f64::from(t.hour()),
            TimeVar::Day => f64::from(t.day()),
            TimeVar::Month => f64::from(t.month0()),
            TimeVar::Year => f64::from(t.year()),
            TimeVar::DayOfWeek => f64::from(t.weekday().num_days_from_sunday()),
        },
        None if var == TimeVar::Delta => ctx.delta,
        None => f64::NAN,
    };
    if let Some(v) = x.ring.num_mut(0).first_mut() {
        *v = value;
    }
    x.ring.sample_mut(0).stamp = ctx.now;
    x.valid = usize::from(!value.is_nan());
}
