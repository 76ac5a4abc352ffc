//! Scriptable in-memory metric source.
//!
//! A [`SimulatedSource`] is cheaply cloneable; every clone shares the same
//! state, so a test (or a dry run) can keep one handle to script hosts and
//! values while the engine owns another. Calls made by the engine are
//! recorded for later inspection.

use crate::{Handle, MetricSource, Result, SourceError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use vigil_common::types::{
    FetchResult, InDomId, InstId, Instance, InstanceSelection, MetricDesc, MetricId, RealTime,
    Sem, ValueSet, ValueType,
};
use vigil_common::units::Units;

/// One recorded `set_instance_selection` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionCall {
    pub host: String,
    pub indom: InDomId,
    pub selection: InstanceSelection,
}

#[derive(Debug, Default)]
struct SimHost {
    up: bool,
    fail_fetches: u32,
    reject_fetches: u32,
    metrics: HashMap<String, MetricDesc>,
    values: HashMap<MetricId, Vec<(InstId, f64)>>,
    indoms: HashMap<InDomId, Vec<Instance>>,
}

#[derive(Debug, Default)]
struct SimState {
    hosts: HashMap<String, SimHost>,
    pmids: HashMap<String, MetricId>,
    next_indom: u32,
    handles: Vec<Option<String>>,
    selections: HashMap<(u32, InDomId), InstanceSelection>,
    selection_log: Vec<SelectionCall>,
    fetch_log: Vec<(String, Vec<MetricId>)>,
    connects: u32,
    now: RealTime,
}

impl SimState {
    fn host_of(&self, handle: Handle) -> Result<&str> {
        self.handles
            .get(handle.0 as usize)
            .and_then(|h| h.as_deref())
            .ok_or(SourceError::BadHandle(handle.0))
    }

    fn live_host(&self, handle: Handle) -> Result<(&str, &SimHost)> {
        let name = self.host_of(handle)?;
        let host = self
            .hosts
            .get(name)
            .ok_or_else(|| SourceError::UnknownHost(name.to_string()))?;
        if !host.up {
            return Err(SourceError::ConnectionLost {
                host: name.to_string(),
            });
        }
        Ok((name, host))
    }

    fn pmid(&mut self, name: &str) -> MetricId {
        let next = MetricId(self.pmids.len() as u32 + 1);
        *self.pmids.entry(name.to_string()).or_insert(next)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedSource {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a reachable host with no metrics.
    pub fn add_host(&self, host: &str) {
        let mut st = self.state.lock();
        st.hosts.entry(host.to_string()).or_default().up = true;
    }

    /// Marks a host reachable or unreachable. Connections to a down host are
    /// refused and fetches on existing connections fail.
    pub fn set_up(&self, host: &str, up: bool) {
        let mut st = self.state.lock();
        st.hosts.entry(host.to_string()).or_default().up = up;
    }

    /// Makes the next `n` fetches against `host` fail while leaving the host
    /// reachable for reconnects.
    pub fn fail_fetches(&self, host: &str, n: u32) {
        let mut st = self.state.lock();
        st.hosts.entry(host.to_string()).or_default().fail_fetches = n;
    }

    /// Makes the next `n` fetches against `host` fail with an error that
    /// leaves the connection usable.
    pub fn reject_fetches(&self, host: &str, n: u32) {
        let mut st = self.state.lock();
        st.hosts.entry(host.to_string()).or_default().reject_fetches = n;
    }

    /// Creates an instance domain on `host` and returns its id.
    pub fn add_indom(&self, host: &str, instances: &[(InstId, &str)]) -> InDomId {
        let mut st = self.state.lock();
        st.next_indom += 1;
        let indom = InDomId(st.next_indom);
        let list = instances
            .iter()
            .map(|(id, name)| Instance {
                id: *id,
                name: name.to_string(),
            })
            .collect();
        st.hosts
            .entry(host.to_string())
            .or_default()
            .indoms
            .insert(indom, list);
        indom
    }

    /// Replaces the members of an instance domain.
    pub fn set_instances(&self, host: &str, indom: InDomId, instances: &[(InstId, &str)]) {
        let mut st = self.state.lock();
        let list = instances
            .iter()
            .map(|(id, name)| Instance {
                id: *id,
                name: name.to_string(),
            })
            .collect();
        st.hosts
            .entry(host.to_string())
            .or_default()
            .indoms
            .insert(indom, list);
    }

    /// Serves a metric from `host`. The same name maps to the same metric id
    /// on every host.
    pub fn add_metric(
        &self,
        host: &str,
        name: &str,
        sem: Sem,
        units: Units,
        indom: Option<InDomId>,
    ) -> MetricId {
        self.add_typed_metric(host, name, ValueType::Double, sem, units, indom)
    }

    pub fn add_typed_metric(
        &self,
        host: &str,
        name: &str,
        value_type: ValueType,
        sem: Sem,
        units: Units,
        indom: Option<InDomId>,
    ) -> MetricId {
        let mut st = self.state.lock();
        let id = st.pmid(name);
        let desc = MetricDesc {
            id,
            value_type,
            sem,
            units,
            indom,
        };
        st.hosts
            .entry(host.to_string())
            .or_default()
            .metrics
            .insert(name.to_string(), desc);
        id
    }

    /// Sets the values reported for a metric; an empty slice means "no
    /// values right now".
    pub fn set_values(&self, host: &str, name: &str, values: &[(InstId, f64)]) {
        let mut st = self.state.lock();
        let id = st.pmid(name);
        st.hosts
            .entry(host.to_string())
            .or_default()
            .values
            .insert(id, values.to_vec());
    }

    /// Sets the value of a singular metric.
    pub fn set_value(&self, host: &str, name: &str, value: f64) {
        self.set_values(host, name, &[(vigil_common::types::NULL_INST, value)]);
    }

    /// Sets the timestamp stamped on subsequent fetch results.
    pub fn set_time(&self, now: RealTime) {
        self.state.lock().now = now;
    }

    pub fn selection_calls(&self) -> Vec<SelectionCall> {
        self.state.lock().selection_log.clone()
    }

    /// Metric ids requested by each fetch, in call order.
    pub fn fetch_calls(&self) -> Vec<(String, Vec<MetricId>)> {
        self.state.lock().fetch_log.clone()
    }

    pub fn connect_count(&self) -> u32 {
        self.state.lock().connects
    }
}

impl MetricSource for SimulatedSource {
    fn name(&self) -> &str {
        "simulated"
    }

    fn connect(&mut self, host: &str) -> Result<Handle> {
        let mut st = self.state.lock();
        match st.hosts.get(host) {
            None => return Err(SourceError::UnknownHost(host.to_string())),
            Some(h) if !h.up => {
                return Err(SourceError::ConnectionRefused {
                    host: host.to_string(),
                })
            }
            Some(_) => {}
        }
        st.connects += 1;
        st.handles.push(Some(host.to_string()));
        Ok(Handle((st.handles.len() - 1) as u32))
    }

    fn disconnect(&mut self, handle: Handle) {
        let mut st = self.state.lock();
        if let Some(slot) = st.handles.get_mut(handle.0 as usize) {
            *slot = None;
        }
        st.selections.retain(|(h, _), _| *h != handle.0);
    }

    fn resolve(&mut self, handle: Handle, metric: &str) -> Result<MetricDesc> {
        let st = self.state.lock();
        let (_, host) = st.live_host(handle)?;
        host.metrics
            .get(metric)
            .cloned()
            .ok_or_else(|| SourceError::UnknownMetric(metric.to_string()))
    }

    fn list_instances(&mut self, handle: Handle, indom: InDomId) -> Result<Vec<Instance>> {
        let st = self.state.lock();
        let (_, host) = st.live_host(handle)?;
        host.indoms
            .get(&indom)
            .cloned()
            .ok_or(SourceError::InDomUnavailable(indom))
    }

    fn set_instance_selection(
        &mut self,
        handle: Handle,
        indom: InDomId,
        selection: InstanceSelection,
    ) -> Result<()> {
        let mut st = self.state.lock();
        let host = st.host_of(handle)?.to_string();
        st.selection_log.push(SelectionCall {
            host,
            indom,
            selection: selection.clone(),
        });
        st.selections.insert((handle.0, indom), selection);
        Ok(())
    }

    fn fetch(&mut self, handle: Handle, metrics: &[MetricId]) -> Result<FetchResult> {
        let mut st = self.state.lock();
        let name = st.host_of(handle)?.to_string();
        st.fetch_log.push((name.clone(), metrics.to_vec()));
        let now = st.now;

        let host = st
            .hosts
            .get_mut(&name)
            .ok_or_else(|| SourceError::UnknownHost(name.clone()))?;
        if !host.up {
            return Err(SourceError::ConnectionLost { host: name });
        }
        if host.fail_fetches > 0 {
            host.fail_fetches -= 1;
            return Err(SourceError::ConnectionLost { host: name });
        }
        if host.reject_fetches > 0 {
            host.reject_fetches -= 1;
            return Err(SourceError::InDomUnavailable(InDomId(0)));
        }

        let host = &st.hosts[&name];
        let mut sets = Vec::with_capacity(metrics.len());
        for id in metrics {
            let indom = host.metrics.values().find(|d| d.id == *id).and_then(|d| d.indom);
            let selection = indom.and_then(|i| st.selections.get(&(handle.0, i)));
            let values = host
                .values
                .get(id)
                .map(|vals| {
                    vals.iter()
                        .filter(|(inst, _)| match selection {
                            Some(InstanceSelection::Only(ids)) => ids.contains(inst),
                            _ => true,
                        })
                        .copied()
                        .collect()
                })
                .unwrap_or_default();
            sets.push(ValueSet {
                metric: *id,
                values,
            });
        }
        Ok(FetchResult {
            timestamp: now,
            sets,
        })
    }

    fn reconnect(&mut self, handle: Handle) -> Result<()> {
        let st = self.state.lock();
        st.live_host(handle).map(|_| ())
    }
}
