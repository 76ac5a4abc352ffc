//! Value types shared by the vigil metric sources and the rule engine.

pub mod symbol;
pub mod types;
pub mod units;

pub use symbol::{Symbol, SymbolTable};
pub use types::{
    FetchResult, InDomId, InstId, Instance, InstanceSelection, MetricDesc, MetricId, RealTime,
    Sem, Truth, ValueSet, ValueType, NULL_INST,
};
pub use units::Units;
