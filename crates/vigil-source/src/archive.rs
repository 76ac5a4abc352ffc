//! Replay of recorded metric values.
//!
//! An archive is a JSON document holding the descriptors and instance
//! domains of one host plus a time-ordered list of records:
//!
//! ```json
//! {
//!   "host": "web-01",
//!   "metrics": [
//!     { "name": "disk.dev.read_bytes", "type": "u64", "sem": "counter",
//!       "units": { "dim_space": 1 }, "indom": 1 }
//!   ],
//!   "indoms": { "1": [ { "id": 0, "name": "sda" } ] },
//!   "records": [
//!     { "timestamp": 1700000000.0,
//!       "values": { "disk.dev.read_bytes": [[0, 4096.0]] } }
//!   ]
//! }
//! ```
//!
//! Replay is positioned with [`MetricSource::set_replay`]; each fetch then
//! returns the latest record at or before the replay cursor and advances the
//! cursor by the replay interval.

use crate::{Handle, MetricSource, Result, SourceError};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use vigil_common::types::{
    FetchResult, InDomId, InstId, Instance, InstanceSelection, MetricDesc, MetricId, RealTime,
    Sem, ValueSet, ValueType,
};
use vigil_common::units::Units;

#[derive(Debug, Deserialize)]
struct ArchiveFile {
    host: String,
    metrics: Vec<ArchiveMetric>,
    #[serde(default)]
    indoms: HashMap<u32, Vec<Instance>>,
    records: Vec<ArchiveRecord>,
}

#[derive(Debug, Deserialize)]
struct ArchiveMetric {
    name: String,
    #[serde(rename = "type", default)]
    value_type: ValueType,
    sem: Sem,
    #[serde(default)]
    units: Units,
    indom: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ArchiveRecord {
    timestamp: RealTime,
    values: HashMap<String, Vec<(InstId, f64)>>,
}

/// One loaded archive, with values keyed by metric id.
#[derive(Debug)]
struct Archive {
    host: String,
    descs: HashMap<String, MetricDesc>,
    indoms: HashMap<InDomId, Vec<Instance>>,
    records: Vec<(RealTime, HashMap<MetricId, Vec<(InstId, f64)>>)>,
}

impl Archive {
    fn from_file(file: ArchiveFile) -> Result<Self> {
        let mut descs = HashMap::new();
        let mut ids = HashMap::new();
        for (i, m) in file.metrics.into_iter().enumerate() {
            let id = MetricId(i as u32 + 1);
            ids.insert(m.name.clone(), id);
            descs.insert(
                m.name,
                MetricDesc {
                    id,
                    value_type: m.value_type,
                    sem: m.sem,
                    units: m.units,
                    indom: m.indom.map(InDomId),
                },
            );
        }

        let mut records = Vec::with_capacity(file.records.len());
        let mut last = f64::NEG_INFINITY;
        for rec in file.records {
            if rec.timestamp < last {
                return Err(SourceError::Archive(format!(
                    "record at {} is out of order",
                    rec.timestamp
                )));
            }
            last = rec.timestamp;
            let values = rec
                .values
                .into_iter()
                .filter_map(|(name, vals)| ids.get(&name).map(|id| (*id, vals)))
                .collect();
            records.push((rec.timestamp, values));
        }

        Ok(Self {
            host: file.host,
            descs,
            indoms: file
                .indoms
                .into_iter()
                .map(|(k, v)| (InDomId(k), v))
                .collect(),
            records,
        })
    }

    fn window(&self) -> Option<(RealTime, RealTime)> {
        Some((self.records.first()?.0, self.records.last()?.0))
    }

    /// Index of the latest record at or before `t`.
    fn record_at(&self, t: RealTime) -> Option<usize> {
        let n = self.records.partition_point(|(ts, _)| *ts <= t);
        n.checked_sub(1)
    }
}

#[derive(Debug)]
struct Cursor {
    archive: usize,
    at: RealTime,
    delta: f64,
    selections: HashMap<InDomId, InstanceSelection>,
}

#[derive(Debug, Default)]
pub struct ArchiveSource {
    archives: Vec<Archive>,
    cursors: Vec<Option<Cursor>>,
}

impl ArchiveSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads one archive file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a valid archive.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut source = Self::new();
        source.add_file(path)?;
        Ok(source)
    }

    pub fn add_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let content = std::fs::read_to_string(path.as_ref())?;
        self.add_json(&content)
    }

    pub fn add_json(&mut self, json: &str) -> Result<()> {
        let file: ArchiveFile = serde_json::from_str(json)?;
        let archive = Archive::from_file(file)?;
        tracing::debug!(
            host = %archive.host,
            records = archive.records.len(),
            "Loaded archive"
        );
        self.archives.push(archive);
        Ok(())
    }

    /// Host names recorded in the loaded archives.
    pub fn hosts(&self) -> Vec<&str> {
        self.archives.iter().map(|a| a.host.as_str()).collect()
    }

    fn cursor(&self, handle: Handle) -> Result<&Cursor> {
        self.cursors
            .get(handle.0 as usize)
            .and_then(|c| c.as_ref())
            .ok_or(SourceError::BadHandle(handle.0))
    }

    fn cursor_mut(&mut self, handle: Handle) -> Result<&mut Cursor> {
        self.cursors
            .get_mut(handle.0 as usize)
            .and_then(|c| c.as_mut())
            .ok_or(SourceError::BadHandle(handle.0))
    }
}

impl MetricSource for ArchiveSource {
    fn name(&self) -> &str {
        "archive"
    }

    fn connect(&mut self, host: &str) -> Result<Handle> {
        let idx = self
            .archives
            .iter()
            .position(|a| a.host == host)
            .ok_or_else(|| SourceError::UnknownHost(host.to_string()))?;
        let start = self.archives[idx].window().map_or(0.0, |w| w.0);
        self.cursors.push(Some(Cursor {
            archive: idx,
            at: start,
            delta: 0.0,
            selections: HashMap::new(),
        }));
        Ok(Handle((self.cursors.len() - 1) as u32))
    }

    fn disconnect(&mut self, handle: Handle) {
        if let Some(slot) = self.cursors.get_mut(handle.0 as usize) {
            *slot = None;
        }
    }

    fn resolve(&mut self, handle: Handle, metric: &str) -> Result<MetricDesc> {
        let cursor = self.cursor(handle)?;
        self.archives[cursor.archive]
            .descs
            .get(metric)
            .cloned()
            .ok_or_else(|| SourceError::UnknownMetric(metric.to_string()))
    }

    fn list_instances(&mut self, handle: Handle, indom: InDomId) -> Result<Vec<Instance>> {
        let cursor = self.cursor(handle)?;
        self.archives[cursor.archive]
            .indoms
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
        self.cursor_mut(handle)?.selections.insert(indom, selection);
        Ok(())
    }

    fn fetch(&mut self, handle: Handle, metrics: &[MetricId]) -> Result<FetchResult> {
        let cursor = self.cursor(handle)?;
        let archive = &self.archives[cursor.archive];
        let (_, end) = archive.window().ok_or(SourceError::EndOfArchive)?;
        if cursor.at > end {
            return Err(SourceError::EndOfArchive);
        }
        let idx = archive.record_at(cursor.at).ok_or_else(|| {
            SourceError::Archive(format!("no record at or before {}", cursor.at))
        })?;
        let (timestamp, values) = &archive.records[idx];

        let sets = metrics
            .iter()
            .map(|id| {
                let indom = archive
                    .descs
                    .values()
                    .find(|d| d.id == *id)
                    .and_then(|d| d.indom);
                let selection = indom.and_then(|i| cursor.selections.get(&i));
                let vals = values
                    .get(id)
                    .map(|v| {
                        v.iter()
                            .filter(|(inst, _)| match selection {
                                Some(InstanceSelection::Only(ids)) => ids.contains(inst),
                                _ => true,
                            })
                            .copied()
                            .collect()
                    })
                    .unwrap_or_default();
                ValueSet {
                    metric: *id,
                    values: vals,
                }
            })
            .collect();
        let result = FetchResult {
            timestamp: *timestamp,
            sets,
        };

        let cursor = self.cursor_mut(handle)?;
        cursor.at += cursor.delta;
        Ok(result)
    }

    fn reconnect(&mut self, handle: Handle) -> Result<()> {
        self.cursor(handle).map(|_| ())
    }

    fn is_archive(&self) -> bool {
        true
    }

    fn time_window(&self) -> Option<(RealTime, RealTime)> {
        self.archives
            .iter()
            .filter_map(Archive::window)
            .reduce(|a, b| (a.0.min(b.0), a.1.max(b.1)))
    }

    fn set_replay(&mut self, handle: Handle, start: RealTime, delta: f64) -> Result<()> {
        let cursor = self.cursor_mut(handle)?;
        cursor.at = start;
        cursor.delta = delta;
        Ok(())
    }
}
