//! End-to-end governor behavior through the public API, with a mock
//! actuator standing in for the platform layer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use schedfreq::{
    CapacityModel, CommitPhase, DomainConfig, FastSwitch, FreqActuator, Governor,
    GovernorOptions, GovernorError, OperatingPoint, TunableScope, UtilClass, CAPACITY_SCALE,
};

const MS: u64 = 1_000_000;

struct MockActuator {
    calls: Mutex<Vec<u32>>,
    reject: AtomicBool,
}

impl MockActuator {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            reject: AtomicBool::new(false),
        })
    }

    fn calls(&self) -> Vec<u32> {
        self.calls.lock().unwrap().clone()
    }
}

impl FreqActuator for MockActuator {
    fn fast_switch(&self, _domain: u32, target_khz: u32) -> FastSwitch {
        if self.reject.load(Ordering::Relaxed) {
            return FastSwitch::Rejected;
        }
        self.calls.lock().unwrap().push(target_khz);
        FastSwitch::Applied(target_khz)
    }

    fn set_target(&self, _domain: u32, target_khz: u32) -> schedfreq::Result<u32, GovernorError> {
        self.calls.lock().unwrap().push(target_khz);
        Ok(target_khz)
    }
}

fn mhz_table() -> Vec<OperatingPoint> {
    [200_000u32, 400_000, 800_000, 1_000_000]
        .iter()
        .map(|&freq_khz| OperatingPoint {
            freq_khz,
            capacity: freq_khz as u64 * CAPACITY_SCALE / 1_000_000,
        })
        .collect()
}

fn config(cpus: Vec<usize>, table: Option<Vec<OperatingPoint>>, fast_switch: bool) -> DomainConfig {
    DomainConfig {
        id: 0,
        cpus,
        min_khz: 200_000,
        max_khz: 1_000_000,
        table,
        transition_latency_ns: 0,
        fast_switch,
        stale_window_ns: 10 * MS,
    }
}

fn governor(nr_cpus: usize) -> Governor {
    Governor::new(GovernorOptions {
        nr_cpus,
        tunable_scope: TunableScope::PerDomain,
    })
    .unwrap()
}

#[test_log::test]
fn moderate_load_picks_the_next_point_up() {
    let gov = governor(1);
    let actuator = MockActuator::new();
    gov.start(config(vec![0], Some(mhz_table()), true), actuator.clone())
        .unwrap();

    // 300/1024 with the 1.25x margin lands between 400 MHz and 800 MHz;
    // rounding never goes down.
    gov.update_util(0, UtilClass::Cfs, 1 * MS, 300, CAPACITY_SCALE);
    assert_eq!(actuator.calls(), vec![800_000]);

    let status = gov.status(0).unwrap();
    assert_eq!(status.current_khz, 800_000);
    assert_eq!(status.phase, CommitPhase::Throttled);
    assert_eq!(status.last_eval_ns, 1 * MS);
}

#[test_log::test]
fn commits_are_rate_limited() {
    let gov = governor(1);
    let actuator = MockActuator::new();
    gov.start(config(vec![0], Some(mhz_table()), true), actuator.clone())
        .unwrap();

    gov.update_util(0, UtilClass::Cfs, 1 * MS, 300, CAPACITY_SCALE);
    // Still inside the 10 ms default interval: dropped even though the
    // demand calls for a higher point.
    gov.update_util(0, UtilClass::Cfs, 5 * MS, 800, CAPACITY_SCALE);
    assert_eq!(actuator.calls(), vec![800_000]);

    gov.update_util(0, UtilClass::Cfs, 12 * MS, 800, CAPACITY_SCALE);
    assert_eq!(actuator.calls(), vec![800_000, 1_000_000]);
}

#[test_log::test]
fn unchanged_target_is_not_recommitted() {
    let gov = governor(1);
    let actuator = MockActuator::new();
    gov.start(config(vec![0], Some(mhz_table()), true), actuator.clone())
        .unwrap();

    gov.update_util(0, UtilClass::Cfs, 1 * MS, 300, CAPACITY_SCALE);
    gov.update_util(0, UtilClass::Cfs, 20 * MS, 300, CAPACITY_SCALE);
    assert_eq!(actuator.calls(), vec![800_000]);
    // The evaluation still ran; only the redundant commit was suppressed.
    let status = gov.status(0).unwrap();
    assert_eq!(status.last_eval_ns, 20 * MS);
    // The phase reports the last commit outcome, not elapsed time: it stays
    // Throttled past the interval until another decision replaces it.
    assert_eq!(status.phase, CommitPhase::Throttled);
}

#[test_log::test]
fn shared_domain_follows_the_busiest_cpu_until_it_goes_stale() {
    let gov = governor(2);
    let actuator = MockActuator::new();
    gov.start(config(vec![0, 1], Some(mhz_table()), true), actuator.clone())
        .unwrap();

    gov.update_util(0, UtilClass::Cfs, 1 * MS, 100, CAPACITY_SCALE);
    assert_eq!(actuator.calls(), vec![400_000]);

    // cpu 1 reports more utilization than capacity: the whole domain jumps
    // to max.
    gov.update_util(1, UtilClass::Cfs, 20 * MS, CAPACITY_SCALE + 1, CAPACITY_SCALE);
    assert_eq!(actuator.calls(), vec![400_000, 1_000_000]);

    // Much later cpu 1 has gone quiet; its old saturated record is past the
    // stale window and no longer pins the domain.
    gov.update_util(0, UtilClass::Cfs, 200 * MS, 100, CAPACITY_SCALE);
    similar_asserts::assert_eq!(actuator.calls(), vec![400_000, 1_000_000, 400_000]);
}

#[test_log::test]
fn limits_change_clamps_immediately_and_unthrottles_once() {
    let gov = governor(1);
    let actuator = MockActuator::new();
    gov.start(config(vec![0], None, true), actuator.clone()).unwrap();

    gov.update_util(0, UtilClass::Cfs, 1 * MS, 300, CAPACITY_SCALE);
    assert_eq!(actuator.calls(), vec![529_589]);

    // The running frequency falls below the new floor: clamped out of band
    // even though the throttle interval has not elapsed.
    gov.limits_changed(0, 850_000, 1_000_000, 2 * MS).unwrap();
    assert_eq!(actuator.calls(), vec![529_589, 850_000]);
    assert_eq!(gov.status(0).unwrap().current_khz, 850_000);

    // The first post-change sample bypasses the throttle...
    gov.update_util(0, UtilClass::Cfs, 3 * MS, 800, CAPACITY_SCALE);
    similar_asserts::assert_eq!(actuator.calls(), vec![529_589, 850_000, 1_000_000]);

    // ...and only the first.
    gov.update_util(0, UtilClass::Cfs, 4 * MS, 300, CAPACITY_SCALE);
    similar_asserts::assert_eq!(actuator.calls(), vec![529_589, 850_000, 1_000_000]);
}

#[test_log::test]
fn trigger_update_forces_maximum() {
    let gov = governor(1);
    let actuator = MockActuator::new();
    gov.start(config(vec![0], Some(mhz_table()), true), actuator.clone())
        .unwrap();

    gov.trigger_update(0, 1 * MS);
    assert_eq!(actuator.calls(), vec![1_000_000]);
}

#[test_log::test]
fn class_contributions_accumulate() {
    let gov = governor(1);
    let actuator = MockActuator::new();
    gov.start(config(vec![0], Some(mhz_table()), true), actuator.clone())
        .unwrap();

    gov.update_util(0, UtilClass::Cfs, 1 * MS, 200, CAPACITY_SCALE);
    // 200 * 1.25 / 1024 maps below 400 MHz.
    assert_eq!(actuator.calls(), vec![400_000]);

    // RT load on top of the same CFS load pushes the total to 700.
    gov.update_util(0, UtilClass::Rt, 20 * MS, 500, CAPACITY_SCALE);
    assert_eq!(actuator.calls(), vec![400_000, 1_000_000]);
}

#[test_log::test]
fn tick_uses_the_capacity_model_ceiling() {
    let model = CapacityModel::uniform(2);
    model.set_scale(1, 512);
    let gov = Governor::with_capacity_model(
        GovernorOptions {
            nr_cpus: 2,
            tunable_scope: TunableScope::PerDomain,
        },
        model,
    )
    .unwrap();
    let actuator = MockActuator::new();
    gov.start(config(vec![1], None, true), actuator.clone()).unwrap();

    // util 256 against a 512 ceiling is half load on the little core.
    gov.tick(1, UtilClass::Cfs, 1 * MS, 256);
    assert_eq!(actuator.calls(), vec![762_500]);

    // Restoring the core to full scale halves the relative load; the same
    // sample now maps to a lower target.
    gov.capacity_model().set_scale(1, CAPACITY_SCALE);
    gov.tick(1, UtilClass::Cfs, 20 * MS, 256);
    similar_asserts::assert_eq!(actuator.calls(), vec![762_500, 481_250]);
}

#[test_log::test]
fn rate_limit_tunable_applies_to_later_commits() {
    let gov = governor(1);
    let actuator = MockActuator::new();
    gov.start(config(vec![0], Some(mhz_table()), true), actuator.clone())
        .unwrap();
    gov.store_tunable(0, "rate_limit_us", "50000").unwrap();

    gov.update_util(0, UtilClass::Cfs, 1 * MS, 300, CAPACITY_SCALE);
    gov.update_util(0, UtilClass::Cfs, 20 * MS, 800, CAPACITY_SCALE);
    assert_eq!(actuator.calls(), vec![800_000], "50 ms window still open");

    gov.update_util(0, UtilClass::Cfs, 60 * MS, 800, CAPACITY_SCALE);
    assert_eq!(actuator.calls(), vec![800_000, 1_000_000]);
}

#[test_log::test]
fn rejected_fast_switch_is_retried_on_the_next_sample() {
    let gov = governor(1);
    let actuator = MockActuator::new();
    gov.start(config(vec![0], Some(mhz_table()), true), actuator.clone())
        .unwrap();

    actuator.reject.store(true, Ordering::Relaxed);
    gov.update_util(0, UtilClass::Cfs, 1 * MS, 300, CAPACITY_SCALE);
    assert!(actuator.calls().is_empty());
    assert_eq!(gov.status(0).unwrap().phase, CommitPhase::Idle);

    actuator.reject.store(false, Ordering::Relaxed);
    gov.update_util(0, UtilClass::Cfs, 20 * MS, 300, CAPACITY_SCALE);
    assert_eq!(actuator.calls(), vec![800_000]);
}

/// Actuator that reports every slow-path application over a channel.
struct SignallingActuator {
    tx: Mutex<mpsc::Sender<u32>>,
}

impl FreqActuator for SignallingActuator {
    fn fast_switch(&self, _domain: u32, _target_khz: u32) -> FastSwitch {
        FastSwitch::Rejected
    }

    fn set_target(&self, _domain: u32, target_khz: u32) -> schedfreq::Result<u32, GovernorError> {
        self.tx.lock().unwrap().send(target_khz).ok();
        Ok(target_khz)
    }
}

#[test_log::test]
fn slow_path_applies_asynchronously_and_stop_joins_the_worker() {
    let (tx, rx) = mpsc::channel();
    let gov = governor(2);
    let actuator = Arc::new(SignallingActuator { tx: Mutex::new(tx) });
    gov.start(config(vec![0], Some(mhz_table()), false), actuator.clone())
        .unwrap();

    gov.update_util(0, UtilClass::Cfs, 1 * MS, 300, CAPACITY_SCALE);
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        800_000,
        "worker must pick up the pending request"
    );

    // The commit lands shortly after the actuator call returns.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = gov.status(0).unwrap();
        if status.phase == CommitPhase::Throttled {
            assert_eq!(status.current_khz, 800_000);
            break;
        }
        assert!(std::time::Instant::now() < deadline, "commit never landed");
        std::thread::yield_now();
    }

    gov.stop(0).unwrap();
    // The hook is unpublished: further samples are no-ops.
    gov.update_util(0, UtilClass::Cfs, 20 * MS, 800, CAPACITY_SCALE);
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

    // The CPU is free to be claimed again.
    gov.start(config(vec![0], Some(mhz_table()), false), actuator).unwrap();
    gov.stop(0).unwrap();
}
