use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::units::Units;

/// Seconds since the Unix epoch, with sub-second precision.
pub type RealTime = f64;

/// Instance identifier within an instance domain.
pub type InstId = i32;

/// Instance id reported for metrics without an instance domain.
pub const NULL_INST: InstId = -1;

/// Converts a [`RealTime`] into a UTC timestamp, clamping out-of-range values
/// to the epoch.
pub fn to_datetime(t: RealTime) -> DateTime<Utc> {
    let secs = t.floor();
    let nanos = ((t - secs) * 1e9) as u32;
    Utc.timestamp_opt(secs as i64, nanos)
        .single()
        .unwrap_or_default()
}

/// Three-valued truth used by every boolean operator.
///
/// # Examples
///
/// ```
/// use vigil_common::types::Truth;
///
/// assert_eq!(Truth::True.or(Truth::Unknown), Truth::True);
/// assert_eq!(Truth::True.and(Truth::Unknown), Truth::Unknown);
/// assert_eq!(Truth::False.and(Truth::Unknown), Truth::False);
/// assert_eq!(!Truth::Unknown, Truth::Unknown);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Truth {
    False,
    True,
    #[default]
    Unknown,
}

impl Truth {
    pub fn from_bool(b: bool) -> Self {
        if b {
            Truth::True
        } else {
            Truth::False
        }
    }

    /// `TRUE` if either side is true, `FALSE` only if both are false.
    pub fn or(self, other: Truth) -> Truth {
        match (self, other) {
            (Truth::True, _) | (_, Truth::True) => Truth::True,
            (Truth::False, Truth::False) => Truth::False,
            _ => Truth::Unknown,
        }
    }

    /// `FALSE` if either side is false, `TRUE` only if both are true.
    pub fn and(self, other: Truth) -> Truth {
        match (self, other) {
            (Truth::False, _) | (_, Truth::False) => Truth::False,
            (Truth::True, Truth::True) => Truth::True,
            _ => Truth::Unknown,
        }
    }

    /// OR with the other operand unavailable: can never be proven false.
    pub fn or1(self) -> Truth {
        match self {
            Truth::True => Truth::True,
            _ => Truth::Unknown,
        }
    }

    /// AND with the other operand unavailable: can never be proven true.
    pub fn and1(self) -> Truth {
        match self {
            Truth::False => Truth::False,
            _ => Truth::Unknown,
        }
    }

    pub fn is_known(self) -> bool {
        self != Truth::Unknown
    }

    /// Numeric view: 1, 0 or NaN.
    pub fn as_f64(self) -> f64 {
        match self {
            Truth::True => 1.0,
            Truth::False => 0.0,
            Truth::Unknown => f64::NAN,
        }
    }
}

impl std::ops::Not for Truth {
    type Output = Truth;

    fn not(self) -> Truth {
        match self {
            Truth::True => Truth::False,
            Truth::False => Truth::True,
            Truth::Unknown => Truth::Unknown,
        }
    }
}

impl fmt::Display for Truth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Truth::True => write!(f, "true"),
            Truth::False => write!(f, "false"),
            Truth::Unknown => write!(f, "?"),
        }
    }
}

/// Value semantics carried by metric descriptors and expression nodes.
///
/// `Counter`, `Instant` and `Discrete` come from metric descriptors; the
/// remaining kinds are produced by the engine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sem {
    #[default]
    Unknown,
    Counter,
    Instant,
    Discrete,
    NumVar,
    NumConst,
    Boolean,
    Char,
    Regex,
}

impl Sem {
    pub fn is_known(self) -> bool {
        self != Sem::Unknown
    }

    /// True for every kind whose samples are stored as floating-point values.
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            Sem::Counter | Sem::Instant | Sem::Discrete | Sem::NumVar | Sem::NumConst
        )
    }
}

impl fmt::Display for Sem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Sem::Unknown => "unknown",
            Sem::Counter => "counter",
            Sem::Instant => "instant",
            Sem::Discrete => "discrete",
            Sem::NumVar => "numeric",
            Sem::NumConst => "constant",
            Sem::Boolean => "boolean",
            Sem::Char => "string",
            Sem::Regex => "regex",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Sem {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "counter" => Ok(Sem::Counter),
            "instant" => Ok(Sem::Instant),
            "discrete" => Ok(Sem::Discrete),
            _ => Err(format!("unknown metric semantics: {s}")),
        }
    }
}

/// Storage type of a metric as reported by its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    I32,
    U32,
    I64,
    U64,
    Float,
    #[default]
    Double,
    String,
    Aggregate,
    Event,
    Unknown,
}

impl ValueType {
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            ValueType::I32
                | ValueType::U32
                | ValueType::I64
                | ValueType::U64
                | ValueType::Float
                | ValueType::Double
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MetricId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InDomId(pub u32);

impl fmt::Display for MetricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pmid:{}", self.0)
    }
}

impl fmt::Display for InDomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "indom:{}", self.0)
    }
}

/// Descriptor returned when a metric name is resolved against a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDesc {
    pub id: MetricId,
    pub value_type: ValueType,
    pub sem: Sem,
    #[serde(default)]
    pub units: Units,
    /// `None` for singular metrics.
    pub indom: Option<InDomId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstId,
    pub name: String,
}

/// Which instances of a domain a connection should report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceSelection {
    All,
    Only(Vec<InstId>),
}

/// Values of one metric in a fetch result, as `(instance, value)` pairs.
///
/// An empty set means the source had no value for the metric this time,
/// which is distinct from the fetch failing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueSet {
    pub metric: MetricId,
    pub values: Vec<(InstId, f64)>,
}

impl ValueSet {
    /// Orders values by instance id so they can be merged against a sorted
    /// instance list.
    pub fn sort(&mut self) {
        self.values.sort_by_key(|(inst, _)| *inst);
    }

    /// Looks up one instance in a sorted value set.
    pub fn get(&self, inst: InstId) -> Option<f64> {
        self.values
            .binary_search_by_key(&inst, |(i, _)| *i)
            .ok()
            .map(|idx| self.values[idx].1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResult {
    pub timestamp: RealTime,
    pub sets: Vec<ValueSet>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Truth; 3] = [Truth::True, Truth::False, Truth::Unknown];

    #[test]
    fn or_and_are_commutative() {
        for x in ALL {
            for y in ALL {
                assert_eq!(x.or(y), y.or(x), "{x} or {y}");
                assert_eq!(x.and(y), y.and(x), "{x} and {y}");
            }
        }
    }

    #[test]
    fn unknown_absorbs_only_where_undecided() {
        assert_eq!(Truth::True.and(Truth::Unknown), Truth::Unknown);
        assert_eq!(Truth::False.or(Truth::Unknown), Truth::Unknown);
        assert_eq!(Truth::False.and(Truth::Unknown), Truth::False);
        assert_eq!(Truth::True.or(Truth::Unknown), Truth::True);
    }

    #[test]
    fn one_sided_forms_cannot_prove_the_missing_case() {
        assert_eq!(Truth::True.or1(), Truth::True);
        assert_eq!(Truth::False.or1(), Truth::Unknown);
        assert_eq!(Truth::False.and1(), Truth::False);
        assert_eq!(Truth::True.and1(), Truth::Unknown);
    }

    #[test]
    fn value_set_lookup_after_sort() {
        let mut vs = ValueSet {
            metric: MetricId(7),
            values: vec![(3, 30.0), (1, 10.0), (2, 20.0)],
        };
        vs.sort();
        assert_eq!(vs.values[0], (1, 10.0));
        assert_eq!(vs.get(2), Some(20.0));
        assert_eq!(vs.get(9), None);
    }

    #[test]
    fn realtime_converts_to_utc() {
        let dt = to_datetime(1_700_000_000.5);
        assert_eq!(dt.timestamp(), 1_700_000_000);
        assert_eq!(dt.timestamp_subsec_millis(), 500);
    }
}
