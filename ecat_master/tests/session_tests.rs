//! Session integration tests against the simulation driver.
//!
//! Covers bring-up sequencing, the cyclic exchange through an echo link,
//! object requests, reload rules and bring-up failures.

use ecat_common::config::MasterConfig;
use ecat_common::state::AlState;
use ecat_master::drivers::simulation::{
    DriverCall, EchoLink, FailPoint, RequestBehaviour, SimulationConfig, SimulationDriver,
    SimulationProbe,
};
use ecat_master::{
    ConfigSource, CycleReport, CycleState, DriverRegistry, EcatMaster, EntryError, MasterError,
    ObjectRequest, ObjectValue, RequestError,
};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

/// One device: 16-bit output 0x7000:1 on SM2, 8-bit input 0x6000:1 on SM3.
const ECHO_DEVICES: &str = r#"[{
    "alias": 0, "position": 0, "vendor_id": "0x00000002", "product_code": "0x07d43052",
    "syncs": [
        {"index": 2, "direction": "output", "pdos": [{"index": "0x1600", "entries": [
            {"index": "0x7000", "subindex": 1, "size": 16, "add_to_domain": true}
        ]}]},
        {"index": 3, "direction": "input", "pdos": [{"index": "0x1a00", "entries": [
            {"index": "0x6000", "subindex": 1, "size": 8, "add_to_domain": true}
        ]}]}
    ],
    "parameters": [{"index": "0x8000", "subindex": 1, "size": 16, "value": 100}]
}]"#;

fn fast_config() -> MasterConfig {
    let mut config = MasterConfig::default();
    config.master.health_check_interval_ms = 1;
    config.master.drain_timeout_ms = 200;
    config.master.request_poll_interval_us = 100;
    config
}

fn master_with(sim: SimulationConfig, devices: &str) -> (EcatMaster, SimulationProbe) {
    let mut master =
        EcatMaster::new(fast_config(), DriverRegistry::with_builtin(), "simulation").unwrap();
    master
        .load_configuration(ConfigSource::Text(devices.to_string()), false)
        .unwrap();
    let driver = SimulationDriver::new(sim);
    let probe = driver.probe();
    master.inject_driver(Box::new(driver));
    (master, probe)
}

fn echo_master(activation_cycles: u32) -> (EcatMaster, SimulationProbe) {
    master_with(
        SimulationConfig {
            activation_cycles,
            echo: vec![EchoLink { output: (0, 0x7000, 1), input: (0, 0x6000, 1) }],
            ..SimulationConfig::default()
        },
        ECHO_DEVICES,
    )
}

fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    pred()
}

#[test]
fn test_echo_exchange_end_to_end() {
    let (mut master, probe) = echo_master(50);
    let reports: Arc<Mutex<Vec<CycleReport>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    let session = master
        .start(move |r| sink.lock().unwrap().push(*r))
        .expect("start");

    master.write_by_key(0, 0x7000, 1, 0x1234).unwrap();
    assert_eq!(master.read_by_key(0, 0x6000, 1).unwrap(), 0);
    assert!(!master.is_operational());

    assert!(wait_until(Duration::from_secs(2), || master.is_operational()));
    assert!(wait_until(Duration::from_secs(2), || {
        master.read_by_key(0, 0x6000, 1).unwrap() == 0x34
    }));
    assert_eq!(master.read_by_key(0, 0x7000, 1).unwrap(), 0x1234);
    assert!(master.master_state_details().op);

    let snapshot = master.snapshot_domain().unwrap();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].pending, 0x1234);
    assert_eq!((snapshot[1].byte_offset, snapshot[1].bit_offset), (2, 0));

    let values = master.snapshot_values().unwrap();
    assert_eq!(values[1].value, 0x34);

    let devices = master.device_states();
    assert_eq!(devices.len(), 1);
    assert!(devices[0].state.operational);

    master.stop();
    let stats = session.wait().unwrap();
    assert!(stats.cycle_count > 0);
    assert_eq!(master.cycle_state(), Some(CycleState::Stopped));
    assert!(matches!(
        master.read_by_key(0, 0x6000, 1),
        Err(MasterError::Entry(EntryError::NoDomain))
    ));
    assert_eq!(probe.count(|c| matches!(c, DriverCall::Deactivate)), 1);
    assert_eq!(probe.count(|c| matches!(c, DriverCall::Release)), 1);

    let reports = reports.lock().unwrap();
    assert!(reports.iter().any(|r| r.state_changed));
    assert!(reports.iter().any(|r| r.operational && r.al_states == AlState::OP));
}

#[test]
fn test_one_sync_manager_per_channel() {
    let devices = r#"[{
        "alias": 0, "position": 0, "vendor_id": 2, "product_code": 1,
        "syncs": [
            {"index": 2, "pdos": [
                {"index": "0x1600", "entries": [
                    {"index": "0x7000", "subindex": 1, "size": 1, "add_to_domain": true},
                    {"index": "0x7000", "subindex": 2, "size": 1, "add_to_domain": true}
                ]},
                {"index": "0x1601", "entries": [
                    {"index": "0x7010", "subindex": 1, "size": 16, "add_to_domain": true}
                ]}
            ]},
            {"index": 3, "pdos": [{"index": "0x1a00", "entries": [
                {"index": "0x6000", "subindex": 1, "size": 32, "signed": true, "add_to_domain": true}
            ]}]}
        ]
    }, {
        "alias": 0, "position": 1, "vendor_id": 2, "product_code": 2
    }]"#;
    let (mut master, probe) = master_with(SimulationConfig::default(), devices);
    let session = master.start(|_| {}).expect("start");

    assert_eq!(probe.count(|c| matches!(c, DriverCall::SlaveConfig { .. })), 2);
    assert_eq!(probe.count(|c| matches!(c, DriverCall::SyncManager { .. })), 2);
    assert_eq!(probe.count(|c| matches!(c, DriverCall::PdoAssignAdd { .. })), 3);
    assert_eq!(probe.count(|c| matches!(c, DriverCall::PdoMappingAdd { .. })), 4);
    assert_eq!(probe.count(|c| matches!(c, DriverCall::RegisterEntries { count: 4 })), 1);

    let calls = probe.calls();
    let sm = calls
        .iter()
        .position(|c| matches!(c, DriverCall::SyncManager { sync_index: 2, .. }))
        .unwrap();
    let assign = calls
        .iter()
        .position(|c| matches!(c, DriverCall::PdoAssignAdd { pdo_index: 0x1600, .. }))
        .unwrap();
    assert!(sm < assign);

    // Two bit entries share the first byte.
    let snapshot = master.snapshot_domain().unwrap();
    assert_eq!((snapshot[0].byte_offset, snapshot[0].bit_offset), (0, 0));
    assert_eq!((snapshot[1].byte_offset, snapshot[1].bit_offset), (0, 1));
    assert_eq!(snapshot[2].byte_offset, 1);

    master.stop();
    session.wait().unwrap();
}

#[test]
fn test_object_requests() {
    let (mut master, probe) = echo_master(3);
    let session = master.start(|_| {}).expect("start");
    assert!(wait_until(Duration::from_secs(2), || {
        master
            .device_states()
            .first()
            .is_some_and(|d| d.state.al_state.accepts_requests())
    }));

    // Startup parameter landed in the dictionary.
    assert_eq!(probe.object(0, 0x8000, 1), Some(vec![100, 0]));
    let value = master
        .request_object(&ObjectRequest::read(0, 0x8000, 1, 2))
        .expect("read");
    assert_eq!(value, ObjectValue::Int(100));

    let write = ObjectRequest::write(0, 0x8000, 2, 4, ObjectValue::Int(0xDEAD_BEEF));
    master.request_object(&write).expect("write");
    assert_eq!(probe.object(0, 0x8000, 2), Some(vec![0xEF, 0xBE, 0xAD, 0xDE]));

    probe.set_object(0, 0x1008, 0, b"EL2008");
    let name = master
        .request_object(&ObjectRequest::read(0, 0x1008, 0, 6))
        .expect("raw read");
    assert_eq!(name, ObjectValue::Bytes(b"EL2008".to_vec()));

    probe.set_request_behaviour(RequestBehaviour::DropFirst { after_polls: 1 });
    assert_eq!(
        master.request_object(&ObjectRequest::read(0, 0x8000, 1, 2)).unwrap(),
        ObjectValue::Int(100)
    );

    probe.set_request_behaviour(RequestBehaviour::Hang);
    let timeout = Duration::from_millis(20);
    let started = Instant::now();
    let err = master
        .request_object(&ObjectRequest::read(0, 0x8000, 1, 2).with_timeout(timeout))
        .unwrap_err();
    let elapsed = started.elapsed();
    // Bounded by the timeout plus one poll interval; the margin absorbs
    // scheduling and driver lock contention with the cyclic thread.
    let poll = master.config().request_poll_interval();
    assert!(elapsed >= timeout, "returned after {elapsed:?}");
    assert!(elapsed < timeout + poll + Duration::from_millis(30), "returned after {elapsed:?}");
    match err {
        MasterError::Request(e) => {
            assert!(matches!(e, RequestError::Timeout { position: 0, index: 0x8000, .. }));
            assert!(e.is_retryable());
        }
        other => panic!("unexpected error: {other}"),
    }
    // The cyclic thread keeps running while requests poll.
    let before = master.cycle_count();
    std::thread::sleep(Duration::from_millis(20));
    assert!(master.cycle_count() > before);

    probe.set_request_behaviour(RequestBehaviour::Fail);
    assert!(matches!(
        master.request_object(&ObjectRequest::read(0, 0x8000, 1, 2)),
        Err(MasterError::Request(RequestError::Failed { position: 0, .. }))
    ));

    assert!(matches!(
        master.request_object(&ObjectRequest::read(9, 0x8000, 1, 2)),
        Err(MasterError::Request(RequestError::UnknownDevice { position: 9 }))
    ));

    master.stop();
    session.wait().unwrap();
}

#[test]
fn test_request_refused_in_init() {
    let (mut master, probe) = echo_master(3);
    let session = master.start(|_| {}).expect("start");

    probe.set_device_state(0, AlState::INIT);
    assert!(wait_until(Duration::from_secs(2), || {
        master
            .device_states()
            .first()
            .is_some_and(|d| d.state.al_state == AlState::INIT)
    }));
    probe.clear_calls();

    let err = master
        .request_object(&ObjectRequest::read(0, 0x8000, 1, 2))
        .unwrap_err();
    assert!(matches!(
        err,
        MasterError::Request(RequestError::NotInitialized { position: 0, state: AlState::INIT })
    ));
    assert_eq!(probe.count(|c| matches!(c, DriverCall::CreateRequest { .. })), 0);

    master.stop();
    session.wait().unwrap();
}

#[test]
fn test_reload_refused_while_active() {
    let (mut master, _probe) = echo_master(3);
    let session = master.start(|_| {}).expect("start");

    let result = master.load_configuration(ConfigSource::Text(ECHO_DEVICES.to_string()), true);
    assert!(matches!(result, Err(MasterError::SessionActive)));
    assert!(matches!(master.start(|_| {}), Err(MasterError::SessionActive)));

    master.stop();
    session.wait().unwrap();

    master
        .load_configuration(ConfigSource::Text(ECHO_DEVICES.to_string()), true)
        .expect("reload after stop");
    let session = master.start(|_| {}).expect("restart with registry driver");
    master.stop();
    session.wait().unwrap();
}

#[test]
fn test_failed_load_keeps_previous_configuration() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(ECHO_DEVICES.as_bytes()).unwrap();

    let mut master = EcatMaster::simulated();
    master
        .load_configuration(ConfigSource::Path(file.path().to_path_buf()), false)
        .unwrap();
    assert_eq!(master.context().unwrap().cyclic_count(), 2);

    let missing = master.load_configuration(
        ConfigSource::Path("/nonexistent/slaves.json".into()),
        false,
    );
    assert!(matches!(missing, Err(MasterError::Config(_))));

    let incomplete = r#"[{"alias": 0, "position": 0, "vendor_id": 2}]"#;
    assert!(matches!(
        master.load_configuration(ConfigSource::Text(incomplete.to_string()), false),
        Err(MasterError::Config(ecat_common::config::ConfigError::MissingField {
            field: "product_code",
            ..
        }))
    ));

    assert_eq!(master.context().unwrap().cyclic_count(), 2);
    assert_eq!(master.context().unwrap().parameters().len(), 1);
}

#[test]
fn test_bring_up_failures_are_fatal() {
    for point in [
        FailPoint::RequestMaster,
        FailPoint::SlaveConfig,
        FailPoint::SyncManager,
        FailPoint::PdoAssignAdd,
        FailPoint::PdoMappingAdd,
        FailPoint::ConfigSdo,
        FailPoint::CreateDomain,
        FailPoint::RegisterEntries,
        FailPoint::Activate,
    ] {
        let (mut master, probe) = master_with(
            SimulationConfig { fail_at: Some(point), ..SimulationConfig::default() },
            ECHO_DEVICES,
        );
        let err = master.start(|_| {}).unwrap_err();
        assert!(err.is_fatal(), "{point:?}: {err}");
        assert_eq!(
            probe.count(|c| matches!(c, DriverCall::Release)),
            1,
            "{point:?} must release the master"
        );
        assert!(master.cycle_state().is_none());
    }
}

#[test]
fn test_writes_and_period() {
    let (mut master, _probe) = echo_master(3);
    let session = master.start(|_| {}).expect("start");

    let results = master.write_many(&[(0, 5), (1, 7), (9, 1)]);
    assert!(results[0].is_ok());
    assert!(matches!(
        results[1],
        Err(MasterError::Entry(EntryError::NotOutput { slot: 1 }))
    ));
    assert!(matches!(
        results[2],
        Err(MasterError::Entry(EntryError::SlotOutOfRange { slot: 9, len: 2 }))
    ));
    assert!(matches!(
        master.write_by_key(0, 0x7001, 1, 1),
        Err(MasterError::Entry(EntryError::UnknownKey { .. }))
    ));

    master
        .set_period(ecat_common::config::Period::Micros(500))
        .unwrap();
    assert_eq!(master.period_ns(), 500_000);

    master.stop();
    session.wait().unwrap();
}
