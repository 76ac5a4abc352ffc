//! Continuous rule evaluation over live or recorded metrics.
//!
//! Rules are expression trees assembled through the [`builder`] calls on
//! [`Engine`]. Every node holds a matrix of values indexed by host,
//! instance and sample, evaluated with three-valued logic so that missing
//! data yields UNKNOWN rather than an error. Rules sharing a sample
//! interval are grouped into tasks; [`pragmatics`] bundles their metric
//! requests into one fetch per host per tick and retries hosts and metrics
//! that are unavailable, and [`scheduler`] drives the evaluation loop.

pub mod action;
pub mod builder;
pub mod engine;
pub mod error;
pub mod expr;
pub mod ops;
pub mod pragmatics;
pub mod ring;
pub mod scheduler;
pub mod show;
pub mod stats;

#[cfg(test)]
mod tests;

pub use action::{ActionKind, ActionSink, SystemActions};
pub use engine::{Engine, EngineOptions};
pub use error::{EngineError, Result};
pub use expr::{AggOp, ArithOp, Dom, ExprId, Op, QuantOp, RelOp, TimeVar};
pub use scheduler::{Signals, Task};
pub use stats::EngineStats;
