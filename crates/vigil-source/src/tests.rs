use crate::archive::ArchiveSource;
use crate::local::LocalSource;
use crate::sim::SimulatedSource;
use crate::{MetricSource, SourceError};
use std::io::Write;
use vigil_common::types::{InstanceSelection, Sem, NULL_INST};
use vigil_common::units::Units;

const ARCHIVE: &str = r#"{
  "host": "web-01",
  "metrics": [
    { "name": "disk.dev.read_bytes", "type": "u64", "sem": "counter",
      "units": { "dim_space": 1 }, "indom": 1 },
    { "name": "kernel.all.load", "sem": "instant" }
  ],
  "indoms": { "1": [ { "id": 0, "name": "sda" }, { "id": 1, "name": "sdb" } ] },
  "records": [
    { "timestamp": 100.0, "values": { "disk.dev.read_bytes": [[0, 1000.0], [1, 5.0]],
                                      "kernel.all.load": [[-1, 0.5]] } },
    { "timestamp": 110.0, "values": { "disk.dev.read_bytes": [[0, 2000.0], [1, 6.0]] } },
    { "timestamp": 120.0, "values": { "disk.dev.read_bytes": [[0, 3000.0], [1, 7.0]] } }
  ]
}"#;

#[test]
fn sim_refuses_down_hosts_and_recovers() {
    let sim = SimulatedSource::new();
    sim.add_host("web-01");
    sim.add_metric("web-01", "kernel.all.load", Sem::Instant, Units::NONE, None);
    sim.set_value("web-01", "kernel.all.load", 1.5);

    let mut source = sim.clone();
    let h = source.connect("web-01").unwrap();
    let desc = source.resolve(h, "kernel.all.load").unwrap();
    let r = source.fetch(h, &[desc.id]).unwrap();
    assert_eq!(r.sets[0].values, vec![(NULL_INST, 1.5)]);

    sim.set_up("web-01", false);
    assert!(matches!(
        source.fetch(h, &[desc.id]),
        Err(SourceError::ConnectionLost { .. })
    ));
    assert!(source.reconnect(h).is_err());
    assert!(source.connect("web-01").unwrap_err().is_connection());

    sim.set_up("web-01", true);
    assert!(source.reconnect(h).is_ok());
    assert!(matches!(
        source.connect("nowhere"),
        Err(SourceError::UnknownHost(_))
    ));
}

#[test]
fn sim_applies_instance_selection_and_records_it() {
    let sim = SimulatedSource::new();
    sim.add_host("h");
    let indom = sim.add_indom("h", &[(0, "sda"), (1, "sdb"), (2, "sdc")]);
    let id = sim.add_metric("h", "disk.dev.total", Sem::Counter, Units::count(), Some(indom));
    sim.set_values("h", "disk.dev.total", &[(0, 1.0), (1, 2.0), (2, 3.0)]);

    let mut source = sim.clone();
    let h = source.connect("h").unwrap();
    source
        .set_instance_selection(h, indom, InstanceSelection::Only(vec![0, 2]))
        .unwrap();
    let r = source.fetch(h, &[id]).unwrap();
    assert_eq!(r.sets[0].values, vec![(0, 1.0), (2, 3.0)]);

    let calls = sim.selection_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].host, "h");
    assert_eq!(calls[0].selection, InstanceSelection::Only(vec![0, 2]));
    assert_eq!(sim.fetch_calls().len(), 1);
}

#[test]
fn sim_injected_fetch_failure_is_one_shot() {
    let sim = SimulatedSource::new();
    sim.add_host("h");
    let id = sim.add_metric("h", "m", Sem::Instant, Units::NONE, None);
    sim.set_value("h", "m", 1.0);
    sim.fail_fetches("h", 1);

    let mut source = sim.clone();
    let h = source.connect("h").unwrap();
    assert!(source.fetch(h, &[id]).is_err());
    assert!(source.fetch(h, &[id]).is_ok());
}

#[test]
fn archive_replays_records_by_interval() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(ARCHIVE.as_bytes()).unwrap();

    let mut source = ArchiveSource::open(file.path()).unwrap();
    assert!(source.is_archive());
    assert_eq!(source.time_window(), Some((100.0, 120.0)));
    assert_eq!(source.hosts(), vec!["web-01"]);

    let h = source.connect("web-01").unwrap();
    let desc = source.resolve(h, "disk.dev.read_bytes").unwrap();
    assert_eq!(desc.sem, Sem::Counter);
    assert_eq!(desc.units, Units::bytes());
    let insts = source.list_instances(h, desc.indom.unwrap()).unwrap();
    assert_eq!(insts.len(), 2);
    assert_eq!(insts[1].name, "sdb");

    source.set_replay(h, 105.0, 10.0).unwrap();
    let r = source.fetch(h, &[desc.id]).unwrap();
    assert_eq!(r.timestamp, 100.0);
    assert_eq!(r.sets[0].values[0], (0, 1000.0));
    let r = source.fetch(h, &[desc.id]).unwrap();
    assert_eq!(r.timestamp, 110.0);
    let r = source.fetch(h, &[desc.id]).unwrap();
    assert_eq!(r.timestamp, 120.0);
    assert!(matches!(
        source.fetch(h, &[desc.id]),
        Err(SourceError::EndOfArchive)
    ));
}

#[test]
fn archive_rejects_unknown_names_and_hosts() {
    let mut source = ArchiveSource::new();
    source.add_json(ARCHIVE).unwrap();
    assert!(source.connect("db-01").is_err());
    let h = source.connect("web-01").unwrap();
    assert!(matches!(
        source.resolve(h, "no.such.metric"),
        Err(SourceError::UnknownMetric(_))
    ));
    let load = source.resolve(h, "kernel.all.load").unwrap();
    assert_eq!(load.indom, None);
}

#[test]
fn archive_rejects_out_of_order_records() {
    let bad = r#"{ "host": "h", "metrics": [],
        "records": [ { "timestamp": 2.0, "values": {} }, { "timestamp": 1.0, "values": {} } ] }"#;
    let mut source = ArchiveSource::new();
    assert!(matches!(source.add_json(bad), Err(SourceError::Archive(_))));
}

#[test]
fn local_source_serves_only_this_host() {
    let mut source = LocalSource::new();
    assert!(source.connect("some-other-host.example").is_err());
    let h = source.connect("localhost").unwrap();
    let desc = source.resolve(h, "mem.physmem").unwrap();
    assert_eq!(desc.indom, None);
    let r = source.fetch(h, &[desc.id]).unwrap();
    assert_eq!(r.sets.len(), 1);
    assert!(r.sets[0].values[0].1 > 0.0);

    let load = source.resolve(h, "kernel.all.load").unwrap();
    let insts = source.list_instances(h, load.indom.unwrap()).unwrap();
    assert_eq!(insts[0].name, "1 minute");
    assert!(source.resolve(h, "no.such.metric").is_err());
}
