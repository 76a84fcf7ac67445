//! End-to-end exercises of the spawned daemon: real worker threads, real
//! message round-trips, simulated pulse hardware.

use std::time::{Duration, Instant};

use syntond::{Engine, EngineEvent, ShmInstanceConfig, SyncState, SyntondConfig};
use syntond_types::{PulseEvent, WallTime};

fn test_config(dir: &std::path::Path) -> SyntondConfig {
    let mut config = SyntondConfig::default();
    config.general.state_dir = dir.join("state");
    config.general.stats_dir = dir.join("stats");

    let mut instance = ShmInstanceConfig::for_interface("eth0");
    instance.outlier_filter_type = syntond_config::OutlierFilterType::Disabled;
    config.shm.insert("pulse0".to_string(), instance);
    config
}

/// Polls `check` until it passes or the deadline expires.
fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if check() {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn daemon_locks_onto_pulse_train() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Engine::start(&test_config(dir.path())).expect("engine start");
    engine.run().expect("run");

    let injector = engine.injector("pulse0").expect("injector").clone();

    // Keep the synthetic 1 Hz train flowing while the daemon locks on;
    // timestamps advance by exactly one second regardless of wall pacing.
    let mut seq = 0u32;
    let mut pulse = move || {
        seq += 1;
        injector.push(PulseEvent {
            seq,
            timestamp: WallTime::new(i64::from(seq) * 1_000_000_000 + 200),
        });
    };
    for _ in 0..6 {
        pulse();
    }

    wait_for("instance to reach SLAVE with an engaged servo", || {
        pulse();
        let status = engine.get_status("pulse0").expect("status");
        status.state == SyncState::Slave && status.offset_valid
    });

    pulse();
    let status = engine.get_status("pulse0").expect("status");
    assert!(status.alarms.is_empty());
    assert!(status.offset_from_master_ns.abs() < 1_000.0);

    // The state transition was broadcast to the engine
    wait_for("state-change notification", || {
        engine
            .drain_events()
            .iter()
            .any(|e| matches!(e, EngineEvent::StateChanged(s) if s.state == SyncState::Slave))
    });
}

#[test]
fn save_state_and_stats_reach_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Engine::start(&test_config(dir.path())).expect("engine start");
    engine.run().expect("run");

    let injector = engine.injector("pulse0").expect("injector").clone();
    for i in 1..=6u32 {
        injector.push(PulseEvent {
            seq: i,
            timestamp: WallTime::new(i64::from(i) * 1_000_000_000),
        });
    }
    wait_for("servo engagement", || {
        engine.get_status("pulse0").expect("status").offset_valid
    });

    engine.save_state().expect("save state");
    let state_file = dir.path().join("state/state-shm-pulse0");
    wait_for("state file", || state_file.exists());
    let content = std::fs::read_to_string(&state_file).expect("read state file");
    assert!(content.contains("instance: pulse0"));

    engine
        .stats_end_period(WallTime::new(6_000_000_000))
        .expect("stats end period");
    let stats_file = dir.path().join("stats/stats-shm-pulse0");
    wait_for("stats file", || stats_file.exists());
}

#[test]
fn system_clock_instance_locks_and_slews() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = SyntondConfig::default();
    config.general.state_dir = dir.path().join("state");
    config.general.stats_dir = dir.path().join("stats");
    let mut instance = ShmInstanceConfig::for_interface("system");
    instance.outlier_filter_type = syntond_config::OutlierFilterType::Disabled;
    config.shm.insert("sys0".to_string(), instance);

    let engine = Engine::start(&config).expect("engine start");
    engine.run().expect("run");

    let injector = engine.injector("sys0").expect("injector").clone();
    for i in 1..=6u32 {
        injector.push(PulseEvent {
            seq: i,
            timestamp: WallTime::new(i64::from(i) * 1_000_000_000 + 100),
        });
    }

    wait_for("system-clock instance to engage its servo", || {
        let status = engine.get_status("sys0").expect("status");
        status.state == SyncState::Slave && status.offset_valid
    });

    let status = engine.get_status("sys0").expect("status");
    assert_eq!(status.clock, "system");
    assert!(status.offset_from_master_ns.abs() < 1_000.0);
}

#[test]
fn forced_step_counts_and_resets() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Engine::start(&test_config(dir.path())).expect("engine start");
    engine.run().expect("run");

    engine
        .step_clock("pulse0", syntond_types::Nanos::from_millis(-250))
        .expect("step");

    engine.save_state().expect("save state");
    let state_file = dir.path().join("state/state-shm-pulse0");
    wait_for("state file", || state_file.exists());
    let content = std::fs::read_to_string(&state_file).expect("read state file");
    assert!(content.contains("clock-steps: 1"));
}
