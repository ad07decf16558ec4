//! End-to-end engine runs against the mock bench.

use anyhow::{Context, Result};
use async_trait::async_trait;
use diode_daq::driver::mock::{MockBench, MockLcrMeter, MockSourceMeter};
use diode_daq::driver::{Role, RoleDriver};
use diode_daq::measurement::{
    event_channel, CvMeasurement, DriverFactory, EventReceiver, IvMeasurement, MeasurementEvent,
};
use diode_daq::state::{ChangeVoltageRequest, MeasurementState, MeasurementType, RoleConfig};
use diode_daq::StateHandle;

/// Hands out a pre-built mock driver, once.
struct MockFactory {
    driver: Option<RoleDriver>,
}

impl MockFactory {
    fn new(driver: RoleDriver) -> Box<Self> {
        Box::new(Self {
            driver: Some(driver),
        })
    }
}

#[async_trait]
impl DriverFactory for MockFactory {
    async fn connect(&mut self) -> Result<RoleDriver> {
        self.driver.take().context("factory already consumed")
    }
}

struct FailingFactory;

#[async_trait]
impl DriverFactory for FailingFactory {
    async fn connect(&mut self) -> Result<RoleDriver> {
        anyhow::bail!("GPIB0::16::INSTR: no listener")
    }
}

fn iv_state() -> StateHandle {
    let mut state = MeasurementState::default();
    state.measurement_type = MeasurementType::Iv;
    state.voltage_begin = 0.0;
    state.voltage_end = 2.0;
    state.voltage_step = 1.0;
    state.waiting_time = 0.1;
    state.waiting_time_continuous = 0.1;
    state.roles.insert(
        Role::Smu,
        RoleConfig {
            enabled: true,
            model: "K2410".to_string(),
            resource_name: "GPIB0::16::INSTR".to_string(),
            ..Default::default()
        },
    );
    state.source = Some(Role::Smu);
    StateHandle::new(state)
}

fn drain(events: &mut EventReceiver) -> Vec<MeasurementEvent> {
    let mut collected = Vec::new();
    while let Ok(event) = events.try_recv() {
        collected.push(event);
    }
    collected
}

fn readings(events: &[MeasurementEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, MeasurementEvent::Reading(_)))
        .count()
}

#[tokio::test(start_paused = true)]
async fn test_iv_run_completes_and_powers_down() {
    diode_daq::init_logging();
    let bench = MockBench::default();
    bench.script_currents([1.0e-9, 2.0e-9, 3.0e-9]);

    let state = iv_state();
    let (tx, mut rx) = event_channel();
    let mut engine = IvMeasurement::iv(state.clone(), tx);
    engine.add_role(
        Role::Smu,
        MockFactory::new(RoleDriver::SourceMeter(Box::new(MockSourceMeter::new(
            &bench,
        )))),
    );
    engine.run().await;

    let events = drain(&mut rx);
    assert!(matches!(events.first(), Some(MeasurementEvent::Started)));
    assert!(matches!(events.last(), Some(MeasurementEvent::Finished)));
    assert_eq!(readings(&events), 3);
    assert!(events
        .iter()
        .any(|e| matches!(e, MeasurementEvent::Cleared)));
    assert!(!events
        .iter()
        .any(|e| matches!(e, MeasurementEvent::Failed(_))));

    // Sweep covered 0, 1, 2 V and finalize brought the source back down.
    let voltages = bench.voltages();
    assert!(voltages.windows(3).any(|w| w == [0.0, 1.0, 2.0]));
    assert_eq!(voltages.last(), Some(&0.0));
    assert!(!bench.output());
    assert_eq!(bench.compliance_level(), 1e-6);
    assert_eq!(bench.configures(), 1);

    // Live values are unset again after the run.
    assert!(state.read(|s| s.live.smu_current.is_nan()));
}

#[tokio::test(start_paused = true)]
async fn test_stop_before_sweep_still_powers_down() {
    let bench = MockBench::default();
    let state = iv_state();
    state.request_stop();

    let (tx, mut rx) = event_channel();
    let mut engine = IvMeasurement::iv(state, tx);
    engine.add_role(
        Role::Smu,
        MockFactory::new(RoleDriver::SourceMeter(Box::new(MockSourceMeter::new(
            &bench,
        )))),
    );
    engine.run().await;

    let events = drain(&mut rx);
    assert_eq!(readings(&events), 0);
    assert!(matches!(events.last(), Some(MeasurementEvent::Finished)));
    assert!(events
        .iter()
        .any(|e| matches!(e, MeasurementEvent::OutputState(false))));
    assert!(!bench.output());
    assert_eq!(bench.voltage(), 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_compliance_trip_aborts_by_default() {
    let bench = MockBench::default();
    bench.trip_at_read(2);

    let state = iv_state();
    let (tx, mut rx) = event_channel();
    let mut engine = IvMeasurement::iv(state, tx);
    engine.add_role(
        Role::Smu,
        MockFactory::new(RoleDriver::SourceMeter(Box::new(MockSourceMeter::new(
            &bench,
        )))),
    );
    engine.run().await;

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, MeasurementEvent::ComplianceTripped)));
    assert!(events
        .iter()
        .any(|e| matches!(e, MeasurementEvent::Failed(_))));
    assert!(readings(&events) < 3);
    // The abort path still powers the source down.
    assert!(!bench.output());
    assert_eq!(bench.voltage(), 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_compliance_trip_tolerated_when_configured() {
    let bench = MockBench::default();
    bench.trip_at_read(2);

    let state = iv_state();
    state.update(|s| s.continue_in_compliance = true);
    let (tx, mut rx) = event_channel();
    let mut engine = IvMeasurement::iv(state, tx);
    engine.add_role(
        Role::Smu,
        MockFactory::new(RoleDriver::SourceMeter(Box::new(MockSourceMeter::new(
            &bench,
        )))),
    );
    engine.run().await;

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, MeasurementEvent::ComplianceTripped)));
    assert!(!events
        .iter()
        .any(|e| matches!(e, MeasurementEvent::Failed(_))));
    assert_eq!(readings(&events), 3);
}

#[tokio::test(start_paused = true)]
async fn test_failed_connect_reports_and_finishes() {
    let state = iv_state();
    let (tx, mut rx) = event_channel();
    let mut engine = IvMeasurement::iv(state, tx);
    engine.add_role(Role::Smu, Box::new(FailingFactory));
    engine.run().await;

    let events = drain(&mut rx);
    assert!(matches!(events.first(), Some(MeasurementEvent::Started)));
    assert!(matches!(events.last(), Some(MeasurementEvent::Finished)));
    assert!(events.iter().any(|e| matches!(
        e,
        MeasurementEvent::Failed(message) if message.contains("no listener")
    )));
    assert_eq!(readings(&events), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_preparation_still_clears_state() {
    let state = iv_state();
    state.set_source_voltage(1.5);

    let (tx, mut rx) = event_channel();
    let mut engine = IvMeasurement::iv(state.clone(), tx);
    engine.add_before_run(Box::new(|_| anyhow::bail!("output directory is not writable")));
    engine.run().await;

    let events = drain(&mut rx);
    assert!(matches!(events.first(), Some(MeasurementEvent::Started)));
    assert!(events.iter().any(|e| matches!(
        e,
        MeasurementEvent::Failed(message) if message.contains("not writable")
    )));
    // The preparation-failure path runs the same teardown tail as every
    // other exit: live values reset, Cleared, then Finished.
    assert!(events
        .iter()
        .any(|e| matches!(e, MeasurementEvent::Cleared)));
    assert!(matches!(events.last(), Some(MeasurementEvent::Finished)));
    assert_eq!(readings(&events), 0);
    assert!(state.read(|s| s.live.source_voltage.is_nan()));
}

#[tokio::test(start_paused = true)]
async fn test_continuous_change_voltage_ramps_exactly_once() {
    let bench = MockBench::default();
    let state = iv_state();
    state.update(|s| s.continuous = true);

    let (tx, mut rx) = event_channel();
    let mut engine = IvMeasurement::iv(state.clone(), tx);
    engine.add_role(
        Role::Smu,
        MockFactory::new(RoleDriver::SourceMeter(Box::new(MockSourceMeter::new(
            &bench,
        )))),
    );
    let handle = engine.spawn();

    // Let the sweep finish and the continuous loop settle.
    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    state.request_change_voltage(ChangeVoltageRequest {
        end_voltage: -3.0,
        step_voltage: 1.0,
        waiting_time: 0.1,
    });
    // Several poll intervals pass; the request must execute only once.
    tokio::time::sleep(std::time::Duration::from_secs(10)).await;
    state.request_stop();
    handle.await.unwrap();

    assert!(state.take_change_voltage().is_none());
    let voltages = bench.voltages();
    assert!(voltages
        .windows(6)
        .any(|w| w == [2.0, 1.0, 0.0, -1.0, -2.0, -3.0]));
    // One change ramp, so -2 V is commanded exactly once.
    assert_eq!(voltages.iter().filter(|v| **v == -2.0).count(), 1);
    // Range widened for the larger magnitude before ramping.
    assert!(bench.ranges().contains(&3.0));
    assert_eq!(voltages.last(), Some(&0.0));
    assert!(!bench.output());

    let events = drain(&mut rx);
    assert!(readings(&events) > 3);
    assert!(matches!(events.last(), Some(MeasurementEvent::Finished)));
}

#[tokio::test(start_paused = true)]
async fn test_cv_run_reads_capacitance() {
    let bench = MockBench::default();
    bench.script_capacities([1.0e-12, 2.0e-12, 4.0e-12]);

    let mut initial = MeasurementState::default();
    initial.measurement_type = MeasurementType::Cv;
    initial.voltage_begin = 0.0;
    initial.voltage_end = -2.0;
    initial.voltage_step = 1.0;
    initial.waiting_time = 0.1;
    initial.roles.insert(
        Role::Lcr,
        RoleConfig {
            enabled: true,
            model: "E4980A".to_string(),
            resource_name: "GPIB0::4::INSTR".to_string(),
            ..Default::default()
        },
    );
    initial.source = Some(Role::Lcr);
    let state = StateHandle::new(initial);

    let (tx, mut rx) = event_channel();
    let mut engine = CvMeasurement::cv(state, tx);
    engine.add_role(
        Role::Lcr,
        MockFactory::new(RoleDriver::Lcr(Box::new(MockLcrMeter::new(&bench)))),
    );
    engine.run().await;

    let events = drain(&mut rx);
    let samples: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            MeasurementEvent::Reading(r) => Some(*r),
            _ => None,
        })
        .collect();
    assert_eq!(samples.len(), 3);
    assert_eq!(samples[0].c_lcr, 1.0e-12);
    assert_eq!(samples[2].c2_lcr, 1.0 / (4.0e-12 * 4.0e-12));
    // LCR teardown ran.
    assert!(bench.finalized());
    assert!(!bench.output());
}
