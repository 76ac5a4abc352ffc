//! Metric sources for the vigil rule engine.
//!
//! A [`MetricSource`] is the engine's only window onto monitored hosts: it
//! opens connections, resolves metric names to descriptors, enumerates
//! instance domains and fetches values. Three implementations ship here:
//! [`local::LocalSource`] samples the machine vigil runs on,
//! [`archive::ArchiveSource`] replays recorded samples, and
//! [`sim::SimulatedSource`] is a scriptable in-memory source for dry runs
//! and tests.

pub mod archive;
pub mod error;
pub mod local;
pub mod sim;

#[cfg(test)]
mod tests;

pub use error::{Result, SourceError};

use vigil_common::types::{
    FetchResult, InDomId, Instance, InstanceSelection, MetricDesc, MetricId, RealTime,
};

/// Connection handle issued by [`MetricSource::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub u32);

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A provider of metric values for one or more named hosts.
///
/// All calls are synchronous; the engine drives sources from a single
/// scheduling loop. Fetch failures must be reported as errors, while a
/// metric that simply has no value right now comes back as an empty
/// [`vigil_common::types::ValueSet`].
pub trait MetricSource: Send {
    /// Short name used in log output (e.g. `"local"`, `"archive"`).
    fn name(&self) -> &str;

    /// Opens a connection to `host`.
    ///
    /// # Errors
    ///
    /// Returns a connection error if the host cannot be reached.
    fn connect(&mut self, host: &str) -> Result<Handle>;

    /// Releases a connection. Unknown handles are ignored.
    fn disconnect(&mut self, handle: Handle);

    /// Looks up the descriptor for a metric name.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::UnknownMetric`] if the name is not served, or a
    /// connection error if the host went away.
    fn resolve(&mut self, handle: Handle, metric: &str) -> Result<MetricDesc>;

    /// Enumerates the current members of an instance domain.
    fn list_instances(&mut self, handle: Handle, indom: InDomId) -> Result<Vec<Instance>>;

    /// Restricts which instances of `indom` subsequent fetches report.
    fn set_instance_selection(
        &mut self,
        handle: Handle,
        indom: InDomId,
        selection: InstanceSelection,
    ) -> Result<()>;

    /// Fetches current values for `metrics`, one value set per requested id
    /// in request order.
    fn fetch(&mut self, handle: Handle, metrics: &[MetricId]) -> Result<FetchResult>;

    /// Re-establishes a connection that previously failed.
    fn reconnect(&mut self, handle: Handle) -> Result<()>;

    /// True when values come from a recording rather than live hosts.
    fn is_archive(&self) -> bool {
        false
    }

    /// First and last recorded timestamps, for archive sources.
    fn time_window(&self) -> Option<(RealTime, RealTime)> {
        None
    }

    /// Positions an archive connection so that successive fetches step
    /// through recorded time from `start` by `delta` seconds.
    fn set_replay(&mut self, _handle: Handle, _start: RealTime, _delta: f64) -> Result<()> {
        Ok(())
    }
}
