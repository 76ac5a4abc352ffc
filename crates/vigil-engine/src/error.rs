/// Errors raised while building rules. Evaluation itself never fails: a
/// missing value becomes UNKNOWN instead.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("rule {0} defined twice")]
    DuplicateRule(String),

    #[error("metric {metric} from {host}: {reason}")]
    BadMetric {
        metric: String,
        host: String,
        reason: String,
    },

    #[error("{op}: {reason}")]
    ArgType { op: String, reason: String },

    #[error("{op}: operands have different {dom} domains")]
    DomainMismatch { op: String, dom: &'static str },

    #[error("{op}: operand has no {dom} domain")]
    NoDomain { op: String, dom: &'static str },

    #[error("rule condition {0} must produce a single truth value")]
    RuleCondition(String),

    #[error("bad regular expression {pattern:?}: {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("undefined variable {0}")]
    UnknownVar(String),

    #[error("invalid sample interval {0}")]
    BadDelta(f64),

    #[error("percentage {0} out of range")]
    BadPercent(f64),
}

pub type Result<T> = std::result::Result<T, EngineError>;
