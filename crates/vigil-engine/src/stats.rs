use serde::Serialize;

/// Counters describing the engine's work since start-up.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineStats {
    /// Rules scheduled for evaluation.
    pub rules: usize,
    /// Rule evaluations per second implied by the task intervals.
    pub eval_expected: f64,
    pub eval_actual: u64,
    pub eval_true: u64,
    pub eval_false: u64,
    pub eval_unknown: u64,
    pub actions: u64,
    pub action_failures: u64,
}
