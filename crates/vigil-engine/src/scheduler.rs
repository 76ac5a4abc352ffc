//! Task queue and the evaluation loop.
//!
//! Rules sharing a sample interval form a [`Task`]. The queue is ordered by
//! each task's next due time: the earlier of its next evaluation and, while
//! something it needs is unavailable, its next retry. Evaluations keep a
//! fixed cadence (`epoch + tick * delta`) that does not drift with the time
//! spent evaluating.

use crate::engine::{wall_clock, Engine};
use crate::expr::ExprId;
use crate::ops::{evaluate, EvalCtx};
use crate::pragmatics::{Host, HostState, InitStatus};
use crate::show;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use vigil_common::types::{RealTime, Sem, Truth};

/// First retry interval, in seconds.
const RETRY: f64 = 5.0;

/// Rules evaluated together at one sample interval.
#[derive(Debug, Clone)]
pub struct Task {
    pub delta: f64,
    pub rules: Vec<ExprId>,
    pub hosts: Vec<Host>,
    /// Next scheduled evaluation.
    pub eval: RealTime,
    /// Next retry of unavailable hosts and metrics, 0 when healthy.
    pub retry: RealTime,
    pub epoch: RealTime,
    pub tick: u64,
    /// Interval before the pending retry; doubled after each failed one.
    pub backoff: f64,
}

impl Task {
    pub fn new(delta: f64) -> Self {
        Self {
            delta,
            rules: Vec::new(),
            hosts: Vec::new(),
            eval: 0.0,
            retry: 0.0,
            epoch: 0.0,
            tick: 0,
            backoff: delta.min(RETRY),
        }
    }

    fn retry_due(&self) -> bool {
        self.retry > 0.0 && self.retry <= self.eval
    }

    /// Time at which the task next needs attention.
    pub fn due(&self) -> RealTime {
        if self.retry_due() {
            self.retry
        } else {
            self.eval
        }
    }
}

/// Requests delivered to the run loop from signal handlers.
#[derive(Debug, Default)]
pub struct Signals {
    shutdown: AtomicBool,
    rotate: AtomicBool,
    wake: Notify,
}

impl Signals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops the loop at its next boundary.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Asks the loop to reopen its log file before its next evaluation.
    pub fn rotate(&self) {
        self.rotate.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn take_rotate(&self) -> bool {
        self.rotate.swap(false, Ordering::SeqCst)
    }
}

impl Engine {
    /// Resets every task to the start time and builds the queue.
    pub fn start(&mut self) {
        let start = self.start;
        self.queue.clear();
        for task in 0..self.tasks.len() {
            let waiting = self.waiting(task);
            let t = &mut self.tasks[task];
            t.epoch = start;
            t.eval = start;
            t.tick = 0;
            t.backoff = t.delta.min(RETRY);
            t.retry = if waiting { start + t.backoff } else { 0.0 };
            self.enqueue(task);
        }
        self.now = start;
        tracing::info!(
            tasks = self.tasks.len(),
            rules = self.stats.rules,
            start = %crate::show::time_string(start),
            "evaluation started"
        );
    }

    /// Inserts a task behind every task due no later than it.
    fn enqueue(&mut self, task: usize) {
        let due = self.tasks[task].due();
        let at = self
            .queue
            .iter()
            .position(|&other| self.tasks[other].due() > due)
            .unwrap_or(self.queue.len());
        self.queue.insert(at, task);
    }

    /// Task at the head of the queue and the time it is due.
    pub fn next_due(&self) -> Option<(usize, RealTime)> {
        self.queue.front().map(|&t| (t, self.tasks[t].due()))
    }

    /// Runs the task at the head of the queue without waiting for its due
    /// time. Returns that time, or `None` once past the stop time.
    pub fn step(&mut self) -> Option<RealTime> {
        let (task, due) = self.next_due()?;
        if due > self.stop {
            return None;
        }
        self.queue.pop_front();
        self.now = due;

        if self.tasks[task].retry_due() {
            self.enable(task);
            self.schedule_retry(task);
        } else {
            self.eval_task(task);
            let waiting = self.waiting(task);
            let now = self.now;
            let t = &mut self.tasks[task];
            t.tick += 1;
            t.eval = t.epoch + t.tick as f64 * t.delta;
            if waiting && t.retry == 0.0 {
                t.retry = now + t.backoff;
            }
        }
        self.enqueue(task);
        Some(due)
    }

    /// Evaluates until the stop time or a shutdown request, sleeping in
    /// real time between evaluations unless replaying an archive.
    pub async fn run(&mut self, signals: &Signals, mut on_rotate: impl FnMut()) {
        self.start();
        while let Some((task, due)) = self.next_due() {
            if due > self.stop {
                tracing::info!("reached stop time");
                break;
            }
            if !self.sleep_tight(due, signals, &mut on_rotate).await {
                tracing::info!("shutdown requested");
                break;
            }
            if !self.is_archive() {
                self.catch_up(task);
            }
            if self.step().is_none() {
                break;
            }
        }
        self.actions.reap();
        tracing::info!(
            evaluations = self.stats.eval_actual,
            actions = self.stats.actions,
            "evaluation finished"
        );
    }

    /// Waits until `due`. Returns false if shutdown was requested.
    async fn sleep_tight(
        &mut self,
        due: RealTime,
        signals: &Signals,
        on_rotate: &mut impl FnMut(),
    ) -> bool {
        self.actions.reap();
        if self.is_archive() {
            if signals.take_rotate() {
                on_rotate();
            }
            return !signals.shutdown_requested();
        }
        let late = wall_clock() - due;
        if late > 1.0 {
            tracing::warn!(late_secs = late, "running late");
        }
        loop {
            if signals.shutdown_requested() {
                return false;
            }
            if signals.take_rotate() {
                on_rotate();
            }
            let remaining = due - wall_clock();
            if remaining <= 0.0 {
                return true;
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs_f64(remaining)) => {}
                _ = signals.wake.notified() => {}
            }
        }
    }

    /// Skips evaluations missed by more than one interval, discarding
    /// history that would otherwise span the gap.
    fn catch_up(&mut self, task: usize) {
        let t = &mut self.tasks[task];
        if t.retry_due() {
            return;
        }
        let late = wall_clock() - t.eval;
        if late <= t.delta {
            return;
        }
        let missed = (late / t.delta).floor() as u64;
        t.tick += missed;
        t.eval = t.epoch + t.tick as f64 * t.delta;
        tracing::warn!(delta = t.delta, missed, "evaluations skipped");
        self.invalidate(task);
    }

    /// Marks every expression of the task as holding no usable values.
    pub fn invalidate(&mut self, task: usize) {
        for i in 0..self.tasks[task].rules.len() {
            let root = self.tasks[task].rules[i];
            self.arena.clobber(root);
        }
    }

    /// True while a host of the task is down or has metrics waiting to be
    /// resolved. Archive replay never retries.
    pub fn waiting(&self, task: usize) -> bool {
        !self.is_archive()
            && self.tasks[task]
                .hosts
                .iter()
                .any(|h| h.down || !h.waits.is_empty())
    }

    fn schedule_retry(&mut self, task: usize) {
        let waiting = self.waiting(task);
        let now = self.now;
        let t = &mut self.tasks[task];
        if waiting {
            t.backoff = (t.backoff * 2.0).min(t.delta);
            t.retry = now + t.backoff;
            tracing::debug!(delta = t.delta, retry_in = t.backoff, "still waiting");
        } else {
            t.retry = 0.0;
            t.backoff = t.delta.min(RETRY);
            tracing::debug!(delta = t.delta, "all hosts and metrics available");
        }
    }

    /// Reconnects down hosts and re-resolves waiting metrics.
    pub(crate) fn enable(&mut self, task: usize) {
        for h in 0..self.tasks[task].hosts.len() {
            if self.tasks[task].hosts[h].down {
                if !self.reconnect(task, h) {
                    continue;
                }
                let host = &mut self.tasks[task].hosts[h];
                host.down = false;
                self.tracker.transition(&host.name, HostState::Reconn, None);
            }
            let waits = std::mem::take(&mut self.tasks[task].hosts[h].waits);
            for r in waits {
                match self.reinit_metric(r) {
                    InitStatus::Ready => self.bundle_metric(task, h, r),
                    InitStatus::Retry => self.tasks[task].hosts[h].waits.push(r),
                    InitStatus::Dud => {
                        let m = self.metric(r);
                        tracing::warn!(metric = %m.mname, host = %m.hname, "metric dropped");
                        self.tasks[task].hosts[h].duds.push(r);
                    }
                }
            }
        }
    }

    /// Fetches and evaluates every rule of the task at `self.now`.
    fn eval_task(&mut self, task: usize) {
        self.task_fetch(task);
        let delta = self.tasks[task].delta;
        let archive = self.is_archive();
        for i in 0..self.tasks[task].rules.len() {
            let root = self.tasks[task].rules[i];
            let mut ctx = EvalCtx {
                now: self.now,
                delta,
                archive,
                actions: self.actions.as_mut(),
                stats: &mut self.stats,
            };
            evaluate(&mut self.arena, root, &mut ctx);

            let x = &self.arena[root];
            self.stats.eval_actual += 1;
            if x.sem == Sem::Boolean {
                match x.truth() {
                    Truth::True => self.stats.eval_true += 1,
                    Truth::False => self.stats.eval_false += 1,
                    Truth::Unknown => self.stats.eval_unknown += 1,
                }
            }
            let name = x.text.as_deref().unwrap_or("?");
            match self.options.verbose {
                0 => {}
                1 => tracing::info!(rule = name, value = %show::value_string(x), "rule"),
                _ => tracing::info!(
                    rule = name,
                    value = %show::annotated_string(&self.arena, x),
                    "rule"
                ),
            }
        }
        tracing::trace!(delta, now = self.now, "task evaluated");
    }
}
