//! Fetch bundling, connection management and retry ("pragmatics").
//!
//! Every task owns a list of [`Host`]s. A host carries at most one
//! [`Fetch`] (one source connection), which groups the metrics it serves
//! into one [`Profile`] per instance domain. A single `fetch` call per host
//! per tick covers every metric the task's rules need from that host.
//! Metrics that cannot be resolved yet sit on the host's wait list until an
//! `enable` pass brings them in.

use crate::engine::Engine;
use crate::expr::ExprId;
use crate::ops::find_eval;
use std::collections::HashMap;
use vigil_common::types::{
    InDomId, InstId, InstanceSelection, MetricDesc, MetricId, RealTime, Sem, ValueSet,
};
use vigil_source::{Handle, MetricSource, SourceError};

/// Binding of one named metric on one host, owned by a fetch leaf.
#[derive(Debug, Clone)]
pub struct Metric {
    pub mname: String,
    pub hname: String,
    pub desc: Option<MetricDesc>,
    /// Number of instances named by the rule; 0 selects every instance.
    pub specinst: usize,
    /// Instance ids in value order; `None` for a requested instance that
    /// the host does not currently have.
    pub iids: Vec<Option<InstId>>,
    pub inames: Vec<String>,
    /// Number of values this metric contributes, -1 while unknown.
    pub m_idom: i32,
    /// Position of this metric's first value within the fetch leaf.
    pub offset: usize,
    /// Factor into canonical units; `None` until the metric is initialised.
    pub conv: Option<f64>,
    pub vset: Option<ValueSet>,
    pub stamp: RealTime,
    /// Timestamp of the previous counter sample.
    pub stomp: RealTime,
    /// Last raw (canonical, unconverted) values, per instance.
    pub raw: Vec<f64>,
    /// Previous raw counter values, per instance.
    pub prev: Vec<f64>,
    pub expr: Option<ExprId>,
}

impl Metric {
    pub fn new(host: &str, metric: &str, instances: &[String]) -> Self {
        Self {
            mname: metric.to_string(),
            hname: host.to_string(),
            desc: None,
            specinst: instances.len(),
            iids: vec![None; instances.len()],
            inames: instances.to_vec(),
            m_idom: -1,
            offset: 0,
            conv: None,
            vset: None,
            stamp: 0.0,
            stomp: 0.0,
            raw: Vec::new(),
            prev: Vec::new(),
            expr: None,
        }
    }

    pub fn is_counter(&self) -> bool {
        self.desc.as_ref().is_some_and(|d| d.sem == Sem::Counter)
    }

    pub fn is_singular(&self) -> bool {
        self.desc.as_ref().is_some_and(|d| d.indom.is_none())
    }

    pub fn indom(&self) -> Option<InDomId> {
        self.desc.as_ref().and_then(|d| d.indom)
    }

    pub fn pmid(&self) -> Option<MetricId> {
        self.desc.as_ref().map(|d| d.id)
    }

    /// Number of values this metric contributes to its fetch leaf.
    pub fn width(&self) -> usize {
        self.m_idom.max(0) as usize
    }

    /// Name of the instance at value position `k`, empty for singular
    /// metrics.
    pub fn inst_name(&self, k: usize) -> &str {
        self.inames.get(k).map_or("", String::as_str)
    }

    /// Instance ids that should be requested from the source.
    pub fn known_iids(&self) -> Vec<InstId> {
        self.iids.iter().flatten().copied().collect()
    }
}

/// Address of a [`Metric`] inside a fetch leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricRef {
    pub expr: ExprId,
    pub index: usize,
}

/// Metrics sharing one instance domain within a [`Fetch`].
#[derive(Debug, Clone)]
pub struct Profile {
    pub indom: Option<InDomId>,
    /// Set once any metric needs every instance; named subsets are then
    /// ignored.
    pub need_all: bool,
    pub metrics: Vec<MetricRef>,
}

/// One source connection and the metric ids requested through it.
#[derive(Debug, Clone)]
pub struct Fetch {
    pub handle: Handle,
    pub pmids: Vec<MetricId>,
    pub profiles: Vec<Profile>,
}

#[derive(Debug, Clone)]
pub struct Host {
    pub name: String,
    pub down: bool,
    pub fetch: Option<Fetch>,
    pub waits: Vec<MetricRef>,
    /// Metrics that can never be initialised.
    pub duds: Vec<MetricRef>,
}

impl Host {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            down: false,
            fetch: None,
            waits: Vec::new(),
            duds: Vec::new(),
        }
    }
}

/// Outcome of initialising a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStatus {
    Ready,
    /// Not available yet; try again on the next retry pass.
    Retry,
    /// Will never work; stop trying.
    Dud,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostState {
    #[default]
    Init,
    FailInit,
    Reconn,
    LostConn,
}

/// Remembers the connection state of each host so that changes are
/// reported once per transition rather than once per retry.
#[derive(Debug, Default)]
pub struct HostTracker {
    states: HashMap<String, HostState>,
    quiet: bool,
}

impl HostTracker {
    pub fn new(quiet: bool) -> Self {
        Self {
            states: HashMap::new(),
            quiet,
        }
    }

    pub fn state(&self, host: &str) -> HostState {
        self.states.get(host).copied().unwrap_or_default()
    }

    /// Records a new state for `host`; returns true if it changed.
    pub fn transition(&mut self, host: &str, state: HostState, cause: Option<&SourceError>) -> bool {
        let prev = self.state(host);
        if prev == state {
            return false;
        }
        self.states.insert(host.to_string(), state);
        if self.quiet {
            return true;
        }
        match state {
            HostState::FailInit => match cause {
                Some(SourceError::ConnectionRefused { .. }) => {
                    tracing::warn!(host, "metric source on host does not respond")
                }
                Some(SourceError::PermissionDenied { .. }) => {
                    tracing::warn!(host, "host does not permit delivery of metrics")
                }
                Some(SourceError::ConnectionLimit { .. }) => {
                    tracing::warn!(host, "host has exceeded its connection limit")
                }
                Some(e) => tracing::warn!(host, error = %e, "cannot connect to host"),
                None => tracing::warn!(host, "cannot connect to host"),
            },
            HostState::Reconn if prev != HostState::Init => {
                tracing::info!(host, "re-established connection")
            }
            HostState::LostConn => tracing::warn!(host, "lost connection"),
            _ => {}
        }
        true
    }
}

/// Instance name equality, not symmetric: `requested` matches the first
/// or the second whitespace-separated word of `actual`.
pub fn eqinst(requested: &str, actual: &str) -> bool {
    let mut words = actual.split_whitespace();
    if actual.starts_with(requested)
        && actual[requested.len()..]
            .chars()
            .next()
            .map_or(true, char::is_whitespace)
    {
        return true;
    }
    words.next();
    words.next() == Some(requested)
}

fn new_context(
    source: &mut dyn MetricSource,
    tracker: &mut HostTracker,
    host: &str,
) -> Option<Handle> {
    match source.connect(host) {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracker.transition(host, HostState::FailInit, Some(&e));
            None
        }
    }
}

/// Resolves a metric's descriptor and instances over a temporary
/// connection.
pub fn init_metric(
    source: &mut dyn MetricSource,
    tracker: &mut HostTracker,
    m: &mut Metric,
) -> InitStatus {
    let archive = source.is_archive();
    let Some(handle) = new_context(source, tracker, &m.hname) else {
        return if archive {
            InitStatus::Dud
        } else {
            InitStatus::Retry
        };
    };
    tracker.transition(&m.hname, HostState::Reconn, None);

    let status = describe(source, handle, m, archive);
    source.disconnect(handle);

    if archive && status == InitStatus::Retry {
        InitStatus::Dud
    } else {
        status
    }
}

fn describe(
    source: &mut dyn MetricSource,
    handle: Handle,
    m: &mut Metric,
    archive: bool,
) -> InitStatus {
    let desc = match source.resolve(handle, &m.mname) {
        Ok(desc) => desc,
        Err(e) => {
            tracing::warn!(metric = %m.mname, host = %m.hname, error = %e, "metric not available");
            return InitStatus::Retry;
        }
    };

    let mut status = InitStatus::Ready;
    if !desc.value_type.is_numeric() {
        tracing::error!(metric = %m.mname, "metric has non-numeric type");
        status = InitStatus::Dud;
    } else if let Some(indom) = desc.indom {
        match source.list_instances(handle, indom) {
            Err(e) => {
                tracing::warn!(
                    metric = %m.mname,
                    host = %m.hname,
                    error = %e,
                    "instance domain not (currently) available"
                );
                status = if archive {
                    InitStatus::Dud
                } else {
                    InitStatus::Retry
                };
            }
            Ok(list) if m.specinst == 0 => {
                m.iids = list.iter().map(|i| Some(i.id)).collect();
                m.inames = list.into_iter().map(|i| i.name).collect();
                m.m_idom = m.iids.len() as i32;
            }
            Ok(list) => {
                let mut found = 0;
                for (iid, name) in m.iids.iter_mut().zip(&m.inames) {
                    match list.iter().find(|i| eqinst(name, &i.name)) {
                        Some(inst) => {
                            *iid = Some(inst.id);
                            found += 1;
                        }
                        None => {
                            tracing::warn!(
                                metric = %m.mname,
                                host = %m.hname,
                                instance = %name,
                                "metric does not (currently) have instance"
                            );
                            *iid = None;
                            status = InitStatus::Retry;
                        }
                    }
                }
                // missing instances go last so that values stay packed
                let mut pairs: Vec<_> = m.iids.drain(..).zip(m.inames.drain(..)).collect();
                pairs.sort_by_key(|(iid, _)| iid.is_none());
                let (iids, inames): (Vec<_>, Vec<_>) = pairs.into_iter().unzip();
                m.iids = iids;
                m.inames = inames;
                m.m_idom = found;
            }
        }
    } else if m.specinst != 0 {
        tracing::error!(metric = %m.mname, "metric has no instances");
        status = InitStatus::Dud;
    } else {
        m.iids = vec![Some(vigil_common::types::NULL_INST)];
        m.inames.clear();
        m.m_idom = 1;
    }

    if status == InitStatus::Ready {
        m.conv = Some(desc.units.scale());
        let n = m.width();
        m.raw = vec![f64::NAN; n];
        if desc.sem == Sem::Counter {
            m.prev = vec![f64::NAN; n];
            m.stomp = 0.0;
        }
    }
    m.desc = Some(desc);
    status
}

impl Engine {
    pub(crate) fn metric(&self, r: MetricRef) -> &Metric {
        &self.arena[r.expr].metric_set[r.index]
    }

    pub(crate) fn metric_mut(&mut self, r: MetricRef) -> &mut Metric {
        &mut self.arena[r.expr].metric_set[r.index]
    }

    /// Task for a new rule: the last queued task if it has the same
    /// interval, otherwise a new one.
    pub(crate) fn find_task(&mut self, delta: f64) -> usize {
        if let Some(last) = self.tasks.last() {
            if last.delta == delta {
                return self.tasks.len() - 1;
            }
        }
        self.tasks.push(crate::scheduler::Task::new(delta));
        self.tasks.len() - 1
    }

    pub(crate) fn find_host(&mut self, task: usize, name: &str) -> usize {
        let hosts = &mut self.tasks[task].hosts;
        if let Some(i) = hosts.iter().position(|h| h.name == name) {
            return i;
        }
        hosts.push(Host::new(name));
        hosts.len() - 1
    }

    /// Attaches every metric below `root` to the task's hosts, either on a
    /// fetch list or, if not yet initialised, on a wait list.
    pub(crate) fn bundle(&mut self, task: usize, root: ExprId) {
        for leaf in self.arena.fetch_leaves(root) {
            for index in 0..self.arena[leaf].metric_set.len() {
                let r = MetricRef { expr: leaf, index };
                self.metric_mut(r).expr = Some(leaf);
                let hname = self.metric(r).hname.clone();
                let h = self.find_host(task, &hname);
                if self.metric(r).conv.is_some() {
                    self.bundle_metric(task, h, r);
                } else {
                    self.tasks[task].hosts[h].waits.push(r);
                }
            }
        }
    }

    /// Puts an initialised metric onto its host's fetch list.
    pub(crate) fn bundle_metric(&mut self, task: usize, host: usize, r: MetricRef) {
        if self.find_fetch(task, host, r) {
            self.find_profile(task, host, r);
        } else {
            self.tasks[task].hosts[host].waits.push(r);
        }
    }

    /// Ensures the host has a fetch bundle requesting the metric's id,
    /// opening the connection on first use. Returns false (and marks the
    /// host down) if the connection cannot be made.
    pub(crate) fn find_fetch(&mut self, task: usize, host: usize, r: MetricRef) -> bool {
        let pmid = self.metric(r).pmid();
        let delta = self.tasks[task].delta;
        let start = self.start;
        let h = &mut self.tasks[task].hosts[host];

        if h.fetch.is_none() {
            let Some(handle) = new_context(self.source.as_mut(), &mut self.tracker, &h.name)
            else {
                h.down = true;
                return false;
            };
            if self.source.is_archive() {
                if let Err(e) = self.source.set_replay(handle, start, delta) {
                    tracing::error!(host = %h.name, error = %e, "cannot position archive");
                }
            }
            tracing::debug!(host = %h.name, %handle, delta, "new fetch bundle");
            h.fetch = Some(Fetch {
                handle,
                pmids: Vec::new(),
                profiles: Vec::new(),
            });
        }

        if let (Some(f), Some(pmid)) = (h.fetch.as_mut(), pmid) {
            if !f.pmids.contains(&pmid) {
                f.pmids.push(pmid);
            }
        }
        true
    }

    /// Adds the metric to the profile for its instance domain and installs
    /// the domain's instance selection on the connection.
    pub(crate) fn find_profile(&mut self, task: usize, host: usize, r: MetricRef) {
        let (indom, specinst) = {
            let m = self.metric(r);
            (m.indom(), m.specinst)
        };
        let Some(f) = self.tasks[task].hosts[host].fetch.as_mut() else {
            return;
        };
        let p = match f.profiles.iter().position(|p| p.indom == indom) {
            Some(p) => p,
            None => {
                f.profiles.push(Profile {
                    indom,
                    need_all: false,
                    metrics: Vec::new(),
                });
                f.profiles.len() - 1
            }
        };
        let handle = f.handle;
        let profile = &mut f.profiles[p];
        profile.metrics.push(r);

        let Some(indom) = indom else {
            return;
        };
        let selection = if specinst == 0 && !profile.need_all {
            profile.need_all = true;
            InstanceSelection::All
        } else if profile.need_all {
            return;
        } else {
            let mut ids: Vec<InstId> = Vec::new();
            for &other in &profile.metrics {
                ids.extend(self.arena[other.expr].metric_set[other.index].known_iids());
            }
            ids.sort_unstable();
            ids.dedup();
            InstanceSelection::Only(ids)
        };
        if let Err(e) = self
            .source
            .set_instance_selection(handle, indom, selection)
        {
            tracing::error!(%indom, error = %e, "cannot install instance selection");
        }
    }

    /// Re-resolves a waiting metric and reshapes the expressions that
    /// depend on it.
    pub(crate) fn reinit_metric(&mut self, r: MetricRef) -> InitStatus {
        let m = &mut self.arena[r.expr].metric_set[r.index];
        let status = init_metric(self.source.as_mut(), &mut self.tracker, m);
        if status != InitStatus::Dud {
            self.reshape(r.expr);
        }
        status
    }

    /// Propagates a fetch leaf's instance count upward and rebinds the
    /// evaluators of every ancestor labelled by that leaf.
    pub(crate) fn reshape(&mut self, leaf: ExprId) {
        self.arena.inst_fetch_expr(leaf);
        let mut x = leaf;
        loop {
            if self.arena[x].op.reshapes() {
                find_eval(&mut self.arena, x);
            }
            match self.arena[x].parent {
                Some(p) if self.arena[p].metrics == Some(leaf) => x = p,
                _ => break,
            }
        }
    }

    /// Tries to reconnect every fetch of a down host.
    pub(crate) fn reconnect(&mut self, task: usize, host: usize) -> bool {
        match &self.tasks[task].hosts[host].fetch {
            Some(f) => self.source.reconnect(f.handle).is_ok(),
            None => true,
        }
    }

    /// Invalidates every expression of the task that reads from `host`,
    /// leaving branches that only read other hosts alone.
    fn mark_all(&mut self, task: usize, host: &str) {
        let rules = self.tasks[task].rules.clone();
        for root in rules {
            for leaf in self.arena.fetch_leaves(root) {
                if self.arena[leaf].metric_set.iter().any(|m| m.hname == host) {
                    self.arena.clobber_upward(leaf);
                }
            }
        }
    }

    /// Fetches from every live host of the task and hands the sorted value
    /// sets to the metrics that asked for them.
    pub(crate) fn task_fetch(&mut self, task: usize) {
        let archive = self.source.is_archive();
        let mut results = Vec::with_capacity(self.tasks[task].hosts.len());

        for h in 0..self.tasks[task].hosts.len() {
            let host = &self.tasks[task].hosts[h];
            let result = match (&host.fetch, host.down) {
                (Some(f), false) => match self.source.fetch(f.handle, &f.pmids) {
                    Ok(r) => Some(r),
                    Err(e) if !archive && e.is_connection() => {
                        let name = host.name.clone();
                        tracing::error!(host = %name, error = %e, "fetch failed");
                        self.tracker
                            .transition(&name, HostState::LostConn, Some(&e));
                        self.tasks[task].hosts[h].down = true;
                        self.mark_all(task, &name);
                        None
                    }
                    // the connection still works; this tick has no values
                    Err(e) => {
                        tracing::debug!(host = %host.name, error = %e, "fetch returned no values");
                        None
                    }
                },
                _ => None,
            };
            results.push(result);
        }

        let mut reshaped = Vec::new();
        for (h, result) in results.into_iter().enumerate() {
            let Some(fetch) = self.tasks[task].hosts[h].fetch.clone() else {
                continue;
            };
            let mut result = result;
            if let Some(r) = result.as_mut() {
                for set in &mut r.sets {
                    set.sort();
                }
            }
            for p in &fetch.profiles {
                for &mr in &p.metrics {
                    let set = result
                        .as_ref()
                        .and_then(|r| r.sets.iter().find(|s| Some(s.metric) == self.metric(mr).pmid()))
                        .filter(|s| !s.values.is_empty())
                        .cloned();
                    let stamp = result.as_ref().map_or(0.0, |r| r.timestamp);
                    let m = self.metric_mut(mr);
                    match set {
                        Some(set) => {
                            m.stamp = stamp;
                            if m.specinst == 0 && !m.is_singular() {
                                if let Some(change) = track_instances(m, &set) {
                                    reshaped.push((h, mr, change));
                                }
                            }
                            m.vset = Some(set);
                        }
                        None => m.vset = None,
                    }
                }
            }
        }

        for (h, mr, change) in reshaped {
            self.refresh_names(task, h, mr);
            // later metrics of the same leaf sit after this one in its values
            let shifts_later = self.arena[mr.expr].metric_set[mr.index + 1..]
                .iter()
                .any(|m| m.m_idom > 0);
            self.reshape(mr.expr);
            if change == InstanceChange::Moved || shifts_later {
                let m = self.metric(mr);
                tracing::debug!(metric = %m.mname, host = %m.hname, "instances moved, history dropped");
                self.arena.clobber_upward(mr.expr);
            }
        }
    }

    /// Reloads instance names for a metric whose instance set changed.
    fn refresh_names(&mut self, task: usize, host: usize, r: MetricRef) {
        let Some(f) = &self.tasks[task].hosts[host].fetch else {
            return;
        };
        let Some(indom) = self.metric(r).indom() else {
            return;
        };
        let names: HashMap<InstId, String> = match self.source.list_instances(f.handle, indom) {
            Ok(list) => list.into_iter().map(|i| (i.id, i.name)).collect(),
            Err(e) => {
                tracing::debug!(%indom, error = %e, "cannot refresh instance names");
                HashMap::new()
            }
        };
        let m = self.metric_mut(r);
        m.inames = m
            .iids
            .iter()
            .map(|iid| {
                iid.and_then(|id| names.get(&id).cloned())
                    .unwrap_or_else(|| iid.map_or_else(String::new, |id| id.to_string()))
            })
            .collect();
        tracing::debug!(metric = %m.mname, host = %m.hname, instances = m.m_idom, "instance set changed");
    }
}

/// How the instance list of an all-instances metric changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InstanceChange {
    /// Instances were added or dropped at the end; the others kept their
    /// positions.
    Resized,
    /// Some position now holds a different instance.
    Moved,
}

/// Follows the instances reported for an all-instances metric. Returns
/// `None` when the set is unchanged. Raw counter values are carried over by
/// id; expression history is positional and only survives a [`Resized`]
/// change.
///
/// [`Resized`]: InstanceChange::Resized
fn track_instances(m: &mut Metric, set: &ValueSet) -> Option<InstanceChange> {
    let ids: Vec<InstId> = set.values.iter().map(|(i, _)| *i).collect();
    if m.iids.len() == ids.len() && m.iids.iter().zip(&ids).all(|(a, b)| *a == Some(*b)) {
        return None;
    }
    let change = if m.iids.iter().zip(&ids).all(|(a, b)| *a == Some(*b)) {
        InstanceChange::Resized
    } else {
        InstanceChange::Moved
    };
    let carry = |old: &[f64], iids: &[Option<InstId>]| -> Vec<f64> {
        ids.iter()
            .map(|id| {
                iids.iter()
                    .position(|i| *i == Some(*id))
                    .and_then(|k| old.get(k).copied())
                    .unwrap_or(f64::NAN)
            })
            .collect()
    };
    let prev = carry(&m.prev, &m.iids);
    let raw = carry(&m.raw, &m.iids);
    if m.is_counter() {
        m.prev = prev;
    }
    m.raw = raw;
    m.iids = ids.iter().map(|i| Some(*i)).collect();
    m.m_idom = ids.len() as i32;
    Some(change)
}
