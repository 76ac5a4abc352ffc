use crate::action::ActionSink;
use crate::expr::{Arena, ExprId};
use crate::pragmatics::HostTracker;
use crate::scheduler::Task;
use crate::show;
use crate::stats::EngineStats;
use std::collections::VecDeque;
use vigil_common::symbol::SymbolTable;
use vigil_common::types::{RealTime, Truth};
use vigil_source::MetricSource;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Host used by fetches that name none.
    pub default_host: String,
    /// Sample interval for rules added without one.
    pub default_delta: f64,
    /// Suppress host connection state messages.
    pub quiet: bool,
    /// 0: silent, 1: log rule values, 2: label values with hosts and
    /// instances.
    pub verbose: u8,
    /// First evaluation time; defaults to now, or the start of the archive.
    pub start: Option<RealTime>,
    /// Last evaluation time; defaults to forever, or the end of the archive.
    pub stop: Option<RealTime>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            default_host: "localhost".to_string(),
            default_delta: 10.0,
            quiet: false,
            verbose: 0,
            start: None,
            stop: None,
        }
    }
}

/// The rule evaluation engine: expression arena, symbol tables, tasks and
/// the metric source they fetch from.
pub struct Engine {
    pub(crate) arena: Arena,
    pub(crate) rules: SymbolTable<ExprId>,
    pub(crate) vars: SymbolTable<ExprId>,
    pub(crate) host_names: SymbolTable<()>,
    pub(crate) metric_names: SymbolTable<()>,
    pub(crate) source: Box<dyn MetricSource>,
    pub(crate) actions: Box<dyn ActionSink>,
    pub(crate) tracker: HostTracker,
    pub(crate) tasks: Vec<Task>,
    /// Task indices ordered by next due time.
    pub(crate) queue: VecDeque<usize>,
    pub(crate) stats: EngineStats,
    pub(crate) options: EngineOptions,
    pub(crate) start: RealTime,
    pub(crate) stop: RealTime,
    pub(crate) now: RealTime,
}

/// Current wall-clock time as a [`RealTime`].
pub fn wall_clock() -> RealTime {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) * 1e-6
}

impl Engine {
    pub fn new(
        source: Box<dyn MetricSource>,
        actions: Box<dyn ActionSink>,
        options: EngineOptions,
    ) -> Self {
        let window = source.time_window();
        let start = options
            .start
            .or(window.map(|(first, _)| first))
            .unwrap_or_else(wall_clock);
        let stop = options
            .stop
            .or(window.map(|(_, last)| last))
            .unwrap_or(f64::INFINITY);
        tracing::debug!(source = source.name(), start, stop, "engine created");
        Self {
            arena: Arena::new(),
            rules: SymbolTable::new(),
            vars: SymbolTable::new(),
            host_names: SymbolTable::new(),
            metric_names: SymbolTable::new(),
            source,
            actions,
            tracker: HostTracker::new(options.quiet),
            tasks: Vec::new(),
            queue: VecDeque::new(),
            stats: EngineStats::default(),
            options,
            start,
            stop,
            now: start,
        }
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn is_archive(&self) -> bool {
        self.source.is_archive()
    }

    /// Time of the evaluation in progress (or last completed).
    pub fn now(&self) -> RealTime {
        self.now
    }

    pub fn start_time(&self) -> RealTime {
        self.start
    }

    pub fn stop_time(&self) -> RealTime {
        self.stop
    }

    pub fn rule(&self, name: &str) -> Option<ExprId> {
        self.rules
            .lookup(name)
            .and_then(|s| self.rules.value(s))
            .copied()
    }

    /// Current value of a rule as a truth value.
    pub fn rule_value(&self, name: &str) -> Truth {
        self.rule(name)
            .map_or(Truth::Unknown, |id| self.arena[id].truth())
    }

    /// Rule names in the order they were scheduled.
    pub fn rule_names(&self) -> Vec<String> {
        self.tasks
            .iter()
            .flat_map(|t| t.rules.iter())
            .filter_map(|id| self.arena[*id].text.clone())
            .collect()
    }

    pub fn var(&self, name: &str) -> Option<ExprId> {
        self.vars
            .lookup(name)
            .and_then(|s| self.vars.value(s))
            .copied()
    }

    /// Names of hosts and metrics referenced by loaded expressions.
    pub fn referenced(&self) -> (Vec<String>, Vec<String>) {
        let names = |t: &SymbolTable<()>| t.iter().map(|(_, n)| n.to_string()).collect();
        (names(&self.host_names), names(&self.metric_names))
    }

    pub fn dump_rule(&self, name: &str) -> Option<String> {
        self.rule(name).map(|id| show::dump_tree(&self.arena, id))
    }
}
