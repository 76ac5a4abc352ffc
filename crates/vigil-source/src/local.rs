//! Live source sampling the machine vigil runs on.
//!
//! Metric names follow the dotted style used throughout vigil rules:
//!
//! | metric | semantics | instances |
//! |--------|-----------|-----------|
//! | `kernel.all.cpu.util` | instant, percent | - |
//! | `kernel.percpu.cpu.util` | instant, percent | cpus |
//! | `kernel.all.load` | instant | `1 minute`, `5 minute`, `15 minute` |
//! | `kernel.all.uptime` | instant, seconds | - |
//! | `mem.physmem` | discrete, bytes | - |
//! | `mem.util.used` / `mem.util.available` | instant, bytes | - |
//! | `swap.used` | instant, bytes | - |
//! | `filesys.capacity` / `filesys.free` | bytes | mount points |
//! | `filesys.full` | instant, percent | mount points |
//! | `network.interface.{in,out}.bytes` | counter, bytes | interfaces |
//! | `network.interface.{in,out}.packets` | counter, count | interfaces |

use crate::{Handle, MetricSource, Result, SourceError};
use std::collections::HashMap;
use sysinfo::{Disks, Networks, System};
use vigil_common::types::{
    FetchResult, InDomId, InstId, Instance, InstanceSelection, MetricDesc, MetricId, Sem,
    ValueSet, ValueType, NULL_INST,
};
use vigil_common::units::Units;

const INDOM_CPU: InDomId = InDomId(1);
const INDOM_LOAD: InDomId = InDomId(2);
const INDOM_FILESYS: InDomId = InDomId(3);
const INDOM_NETIF: InDomId = InDomId(4);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sampler {
    CpuAll,
    CpuPer,
    Load,
    Uptime,
    PhysMem,
    MemUsed,
    MemAvailable,
    SwapUsed,
    FsCapacity,
    FsFree,
    FsFull,
    NetInBytes,
    NetOutBytes,
    NetInPackets,
    NetOutPackets,
}

struct Catalog {
    name: &'static str,
    sampler: Sampler,
    sem: Sem,
    units: Units,
    indom: Option<InDomId>,
}

fn catalog() -> Vec<Catalog> {
    let bytes = Units::bytes();
    let none = Units::NONE;
    let count = Units::count();
    vec![
        Catalog { name: "kernel.all.cpu.util", sampler: Sampler::CpuAll, sem: Sem::Instant, units: none, indom: None },
        Catalog { name: "kernel.percpu.cpu.util", sampler: Sampler::CpuPer, sem: Sem::Instant, units: none, indom: Some(INDOM_CPU) },
        Catalog { name: "kernel.all.load", sampler: Sampler::Load, sem: Sem::Instant, units: none, indom: Some(INDOM_LOAD) },
        Catalog { name: "kernel.all.uptime", sampler: Sampler::Uptime, sem: Sem::Instant, units: Units::seconds(), indom: None },
        Catalog { name: "mem.physmem", sampler: Sampler::PhysMem, sem: Sem::Discrete, units: bytes, indom: None },
        Catalog { name: "mem.util.used", sampler: Sampler::MemUsed, sem: Sem::Instant, units: bytes, indom: None },
        Catalog { name: "mem.util.available", sampler: Sampler::MemAvailable, sem: Sem::Instant, units: bytes, indom: None },
        Catalog { name: "swap.used", sampler: Sampler::SwapUsed, sem: Sem::Instant, units: bytes, indom: None },
        Catalog { name: "filesys.capacity", sampler: Sampler::FsCapacity, sem: Sem::Discrete, units: bytes, indom: Some(INDOM_FILESYS) },
        Catalog { name: "filesys.free", sampler: Sampler::FsFree, sem: Sem::Instant, units: bytes, indom: Some(INDOM_FILESYS) },
        Catalog { name: "filesys.full", sampler: Sampler::FsFull, sem: Sem::Instant, units: none, indom: Some(INDOM_FILESYS) },
        Catalog { name: "network.interface.in.bytes", sampler: Sampler::NetInBytes, sem: Sem::Counter, units: bytes, indom: Some(INDOM_NETIF) },
        Catalog { name: "network.interface.out.bytes", sampler: Sampler::NetOutBytes, sem: Sem::Counter, units: bytes, indom: Some(INDOM_NETIF) },
        Catalog { name: "network.interface.in.packets", sampler: Sampler::NetInPackets, sem: Sem::Counter, units: count, indom: Some(INDOM_NETIF) },
        Catalog { name: "network.interface.out.packets", sampler: Sampler::NetOutPackets, sem: Sem::Counter, units: count, indom: Some(INDOM_NETIF) },
    ]
}

/// Stable instance ids for domains whose members come and go by name.
#[derive(Debug, Default)]
struct NameIds {
    ids: HashMap<String, InstId>,
}

impl NameIds {
    fn id(&mut self, name: &str) -> InstId {
        let next = self.ids.len() as InstId;
        *self.ids.entry(name.to_string()).or_insert(next)
    }
}

pub struct LocalSource {
    hostname: String,
    catalog: Vec<Catalog>,
    system: System,
    disks: Disks,
    networks: Networks,
    mounts: NameIds,
    interfaces: NameIds,
    handles: Vec<Option<HashMap<InDomId, InstanceSelection>>>,
}

impl LocalSource {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_all();
        system.refresh_memory();
        Self {
            hostname: System::host_name().unwrap_or_else(|| "localhost".to_string()),
            catalog: catalog(),
            system,
            disks: Disks::new_with_refreshed_list(),
            networks: Networks::new_with_refreshed_list(),
            mounts: NameIds::default(),
            interfaces: NameIds::default(),
            handles: Vec::new(),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    fn serves(&self, host: &str) -> bool {
        host == "localhost" || host == "local:" || host == self.hostname
    }

    fn selections(&self, handle: Handle) -> Result<&HashMap<InDomId, InstanceSelection>> {
        self.handles
            .get(handle.0 as usize)
            .and_then(|h| h.as_ref())
            .ok_or(SourceError::BadHandle(handle.0))
    }

    fn instances(&mut self, indom: InDomId) -> Result<Vec<Instance>> {
        let list = match indom {
            INDOM_CPU => self
                .system
                .cpus()
                .iter()
                .enumerate()
                .map(|(i, _)| Instance {
                    id: i as InstId,
                    name: format!("cpu{i}"),
                })
                .collect(),
            INDOM_LOAD => [(1, "1 minute"), (5, "5 minute"), (15, "15 minute")]
                .into_iter()
                .map(|(id, name)| Instance {
                    id,
                    name: name.to_string(),
                })
                .collect(),
            INDOM_FILESYS => {
                self.disks.refresh_list();
                let mut list = Vec::new();
                for disk in self.disks.iter() {
                    let mount = disk.mount_point().to_string_lossy().to_string();
                    list.push(Instance {
                        id: self.mounts.id(&mount),
                        name: mount,
                    });
                }
                list
            }
            INDOM_NETIF => {
                self.networks.refresh_list();
                let mut list = Vec::new();
                for (name, _) in self.networks.iter() {
                    list.push(Instance {
                        id: self.interfaces.id(name),
                        name: name.clone(),
                    });
                }
                list
            }
            other => return Err(SourceError::InDomUnavailable(other)),
        };
        Ok(list)
    }

    fn sample(&mut self, sampler: Sampler) -> Vec<(InstId, f64)> {
        match sampler {
            Sampler::CpuAll => vec![(NULL_INST, self.system.global_cpu_usage() as f64)],
            Sampler::CpuPer => self
                .system
                .cpus()
                .iter()
                .enumerate()
                .map(|(i, cpu)| (i as InstId, cpu.cpu_usage() as f64))
                .collect(),
            Sampler::Load => {
                let load = System::load_average();
                vec![(1, load.one), (5, load.five), (15, load.fifteen)]
            }
            Sampler::Uptime => vec![(NULL_INST, System::uptime() as f64)],
            Sampler::PhysMem => vec![(NULL_INST, self.system.total_memory() as f64)],
            Sampler::MemUsed => vec![(NULL_INST, self.system.used_memory() as f64)],
            Sampler::MemAvailable => vec![(NULL_INST, self.system.available_memory() as f64)],
            Sampler::SwapUsed => vec![(NULL_INST, self.system.used_swap() as f64)],
            Sampler::FsCapacity | Sampler::FsFree | Sampler::FsFull => {
                let mut out = Vec::new();
                for disk in self.disks.iter() {
                    let mount = disk.mount_point().to_string_lossy().to_string();
                    let total = disk.total_space() as f64;
                    let free = disk.available_space() as f64;
                    let v = match sampler {
                        Sampler::FsCapacity => total,
                        Sampler::FsFree => free,
                        _ if total > 0.0 => (total - free) / total * 100.0,
                        _ => continue,
                    };
                    out.push((self.mounts.id(&mount), v));
                }
                out
            }
            Sampler::NetInBytes | Sampler::NetOutBytes | Sampler::NetInPackets | Sampler::NetOutPackets => {
                let mut out = Vec::new();
                for (name, data) in self.networks.iter() {
                    let v = match sampler {
                        Sampler::NetInBytes => data.total_received(),
                        Sampler::NetOutBytes => data.total_transmitted(),
                        Sampler::NetInPackets => data.total_packets_received(),
                        _ => data.total_packets_transmitted(),
                    };
                    out.push((self.interfaces.id(name), v as f64));
                }
                out
            }
        }
    }
}

impl Default for LocalSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricSource for LocalSource {
    fn name(&self) -> &str {
        "local"
    }

    fn connect(&mut self, host: &str) -> Result<Handle> {
        if !self.serves(host) {
            return Err(SourceError::ConnectionRefused {
                host: host.to_string(),
            });
        }
        self.handles.push(Some(HashMap::new()));
        Ok(Handle((self.handles.len() - 1) as u32))
    }

    fn disconnect(&mut self, handle: Handle) {
        if let Some(slot) = self.handles.get_mut(handle.0 as usize) {
            *slot = None;
        }
    }

    fn resolve(&mut self, handle: Handle, metric: &str) -> Result<MetricDesc> {
        self.selections(handle)?;
        self.catalog
            .iter()
            .position(|c| c.name == metric)
            .map(|i| {
                let c = &self.catalog[i];
                MetricDesc {
                    id: MetricId(i as u32 + 1),
                    value_type: ValueType::Double,
                    sem: c.sem,
                    units: c.units,
                    indom: c.indom,
                }
            })
            .ok_or_else(|| SourceError::UnknownMetric(metric.to_string()))
    }

    fn list_instances(&mut self, handle: Handle, indom: InDomId) -> Result<Vec<Instance>> {
        self.selections(handle)?;
        self.instances(indom)
    }

    fn set_instance_selection(
        &mut self,
        handle: Handle,
        indom: InDomId,
        selection: InstanceSelection,
    ) -> Result<()> {
        let slot = self
            .handles
            .get_mut(handle.0 as usize)
            .and_then(|h| h.as_mut())
            .ok_or(SourceError::BadHandle(handle.0))?;
        slot.insert(indom, selection);
        Ok(())
    }

    fn fetch(&mut self, handle: Handle, metrics: &[MetricId]) -> Result<FetchResult> {
        let selections = self.selections(handle)?.clone();

        self.system.refresh_cpu_all();
        self.system.refresh_memory();
        self.disks.refresh();
        self.networks.refresh();

        let mut sets = Vec::with_capacity(metrics.len());
        for id in metrics {
            let entry = (id.0 as usize)
                .checked_sub(1)
                .and_then(|i| self.catalog.get(i))
                .map(|c| (c.sampler, c.indom));
            let values = match entry {
                Some((sampler, indom)) => {
                    let mut values = self.sample(sampler);
                    if let Some(InstanceSelection::Only(ids)) =
                        indom.and_then(|i| selections.get(&i))
                    {
                        values.retain(|(inst, _)| ids.contains(inst));
                    }
                    values
                }
                None => Vec::new(),
            };
            sets.push(ValueSet {
                metric: *id,
                values,
            });
        }

        Ok(FetchResult {
            timestamp: chrono::Utc::now().timestamp_micros() as f64 / 1e6,
            sets,
        })
    }

    fn reconnect(&mut self, handle: Handle) -> Result<()> {
        self.selections(handle).map(|_| ())
    }
}
