//! Measurement orchestration engine.
//!
//! [`RangeMeasurement`] drives one run: it opens every wired role's
//! transport, configures the instruments, ramps the source through the
//! requested voltage range, acquires one [`Reading`] per step, optionally
//! enters the continuous acquisition loop, and always ramps back to zero and
//! disables the output on the way out — whether the run completed, failed or
//! was stopped.
//!
//! The engine runs on its own Tokio task; the controlling side never blocks
//! on it. Everything crossing back to the controller goes through a one-way
//! unbounded event channel, and everything crossing in goes through the
//! shared [`StateHandle`] (stop flag, live voltage-change requests).

pub mod cv;
pub mod iv;
pub mod reading;

pub use cv::{inverse_square, CvAcquirer, CvMeasurement};
pub use iv::{IvAcquirer, IvMeasurement};
pub use reading::Reading;

use crate::driver::{registry, Role, RoleDriver};
use crate::error::DaqError;
use crate::estimate::Estimate;
use crate::range::LinearRange;
use crate::resource::{AutoReconnect, Transport, VisaResource};
use crate::state::{ChangeVoltageRequest, MeasurementType, RoleConfig, StateHandle};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

/// Step size for the internal safety ramps (to begin, to zero). Not
/// operator-configurable; only the main sweep and continuous voltage changes
/// use the configured step.
pub const SAFE_RAMP_STEP: f64 = 5.0;
/// Settle time between safety-ramp steps.
pub const SAFE_RAMP_SETTLE: Duration = Duration::from_millis(250);
/// Settle after output enable / begin ramp before the first reading.
const OUTPUT_SETTLE: Duration = Duration::from_secs(1);

/// Events emitted by the engine, consumed by the controller (UI, writer,
/// remote-state reporter) on its own schedule.
#[derive(Clone, Debug)]
pub enum MeasurementEvent {
    Started,
    Reading(Reading),
    SourceVoltage(f64),
    OutputState(bool),
    Progress {
        passed: usize,
        total: usize,
        remaining: Duration,
    },
    Message(String),
    ComplianceTripped,
    Failed(String),
    /// Live channel values are unset again; emitted on every exit path.
    Cleared,
    Finished,
}

pub type EventSender = mpsc::UnboundedSender<MeasurementEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<MeasurementEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Hook invoked synchronously at run start, before any instrument I/O.
/// Collaborators use this to create output directories and file headers.
pub type BeforeRunHook = Box<dyn FnMut(&StateHandle) -> Result<()> + Send>;

/// Builds the driver for one role, opening its transport.
///
/// The engine calls `connect` once per run for every registered role before
/// any instrument configuration begins, and guarantees driver shutdown on
/// every exit path.
#[async_trait]
pub trait DriverFactory: Send {
    async fn connect(&mut self) -> Result<RoleDriver>;
}

/// Standard factory: VISA transport (optionally wrapped in the reconnect
/// policy) plus registry lookup by model name.
pub struct VisaDriverFactory {
    pub role: Role,
    pub config: RoleConfig,
    pub auto_reconnect: bool,
}

#[async_trait]
impl DriverFactory for VisaDriverFactory {
    async fn connect(&mut self) -> Result<RoleDriver> {
        if self.config.resource_name.is_empty() {
            return Err(DaqError::Precondition(format!(
                "role '{}' is enabled but has no resource name",
                self.role
            ))
            .into());
        }
        if !registry::is_supported(&self.config.model) {
            return Err(DaqError::Precondition(format!(
                "role '{}': no driver for model '{}'",
                self.role, self.config.model
            ))
            .into());
        }

        let resource = VisaResource::new(self.config.resource_name.clone())
            .with_timeout(Duration::from_secs_f64(self.config.timeout.max(0.1)))
            .with_termination(self.config.termination.clone());
        let mut transport: Box<dyn Transport> = if self.auto_reconnect {
            Box::new(AutoReconnect::new(Box::new(resource)))
        } else {
            Box::new(resource)
        };
        transport.open().await?;
        Ok(registry::create_driver(&self.config.model, transport)?)
    }
}

/// Role-specific single-sample acquisition; IV and CV runs differ only here.
#[async_trait]
pub trait ReadingAcquirer: Send {
    fn measurement_type(&self) -> MeasurementType;

    async fn acquire(
        &mut self,
        contexts: &mut HashMap<Role, RoleDriver>,
        voltage: f64,
        continuous: bool,
    ) -> Result<Reading>;
}

/// The orchestration core. See the module docs for the run lifecycle.
pub struct RangeMeasurement<A> {
    state: StateHandle,
    events: EventSender,
    acquirer: A,
    factories: HashMap<Role, Box<dyn DriverFactory>>,
    contexts: HashMap<Role, RoleDriver>,
    before_run: Vec<BeforeRunHook>,
    /// Minimum spacing of compliance/change-request checks inside the
    /// continuous loop. One second bounds instrument chatter without making
    /// stops sluggish; tune per bench if needed.
    pub poll_interval: Duration,
}

impl<A: ReadingAcquirer> RangeMeasurement<A> {
    pub fn new(state: StateHandle, events: EventSender, acquirer: A) -> Self {
        Self {
            state,
            events,
            acquirer,
            factories: HashMap::new(),
            contexts: HashMap::new(),
            before_run: Vec::new(),
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Wires a role to its driver factory. Only wired roles take part in the
    /// run.
    pub fn add_role(&mut self, role: Role, factory: Box<dyn DriverFactory>) {
        self.factories.insert(role, factory);
    }

    /// Wires every enabled role from the state using the standard VISA
    /// factory.
    pub fn wire_from_state(&mut self) {
        let auto_reconnect = self.state.read(|s| s.auto_reconnect);
        let roles: Vec<(Role, RoleConfig)> = self.state.read(|s| {
            s.roles
                .iter()
                .filter(|(_, config)| config.enabled)
                .map(|(role, config)| (*role, config.clone()))
                .collect()
        });
        for (role, config) in roles {
            self.add_role(
                role,
                Box::new(VisaDriverFactory {
                    role,
                    config,
                    auto_reconnect,
                }),
            );
        }
    }

    pub fn add_before_run(&mut self, hook: BeforeRunHook) {
        self.before_run.push(hook);
    }

    pub fn state(&self) -> &StateHandle {
        &self.state
    }

    fn emit(&self, event: MeasurementEvent) {
        // The controller side owning the receiver may already be gone during
        // shutdown; that is not the engine's problem.
        let _ = self.events.send(event);
    }

    /// Runs the measurement to completion on the current task.
    ///
    /// This is the single boundary converting failures into events: nothing
    /// escapes as a raw error, and `Finished` is emitted on every path.
    pub async fn run(&mut self) {
        self.contexts.clear();
        self.state.mark_run_started();
        self.emit(MeasurementEvent::Started);

        let mut prepared = Ok(());
        for hook in &mut self.before_run {
            if let Err(err) = hook(&self.state) {
                prepared = Err(err);
                break;
            }
        }

        match prepared {
            Err(err) => {
                log::error!("run preparation failed: {err:#}");
                self.emit(MeasurementEvent::Failed(format!("{err:#}")));
            }
            Ok(()) => match self.connect_all().await {
                Err(err) => {
                    log::error!("connecting instruments failed: {err:#}");
                    self.emit(MeasurementEvent::Failed(format!("{err:#}")));
                }
                Ok(()) => {
                    let result = self.execute().await;
                    if let Err(err) = self.finalize().await {
                        log::warn!("finalize failed: {err:#}");
                    }
                    if let Err(err) = result {
                        log::error!("measurement failed: {err:#}");
                        self.emit(MeasurementEvent::Failed(format!("{err:#}")));
                    }
                }
            },
        }

        self.shutdown_all().await;
        self.state.clear_live();
        self.emit(MeasurementEvent::Cleared);
        self.emit(MeasurementEvent::Finished);
    }

    /// Spawns the run on a dedicated task, returning the engine afterwards so
    /// the caller can reuse it for the next run.
    pub fn spawn(mut self) -> tokio::task::JoinHandle<Self>
    where
        A: 'static,
    {
        tokio::spawn(async move {
            self.run().await;
            self
        })
    }

    async fn execute(&mut self) -> Result<()> {
        self.initialize().await?;
        self.measure().await
    }

    async fn connect_all(&mut self) -> Result<()> {
        for (role, factory) in self.factories.iter_mut() {
            let driver = factory
                .connect()
                .await
                .with_context(|| format!("connecting role '{role}'"))?;
            self.contexts.insert(*role, driver);
        }
        Ok(())
    }

    /// Closes every opened driver; errors are logged, never raised, so a
    /// partial open still releases whatever succeeded.
    async fn shutdown_all(&mut self) {
        for (role, mut driver) in self.contexts.drain() {
            if let Err(err) = driver.shutdown().await {
                log::warn!("closing role '{role}' failed: {err:#}");
            }
        }
    }

    fn source_role(&self) -> Result<Role> {
        let role = self
            .state
            .read(|s| s.source)
            .ok_or_else(|| DaqError::Precondition("no source role selected".into()))?;
        let enabled = self
            .state
            .read(|s| s.role(role).map(|c| c.enabled).unwrap_or(false));
        if !enabled {
            return Err(DaqError::Precondition(format!(
                "source role '{role}' is not enabled"
            ))
            .into());
        }
        if !self.contexts.contains_key(&role) {
            return Err(
                DaqError::Precondition(format!("source role '{role}' is not wired")).into(),
            );
        }
        Ok(role)
    }

    async fn initialize(&mut self) -> Result<()> {
        let source_role = self.source_role()?;

        for (role, driver) in self.contexts.iter_mut() {
            let identity = driver
                .identify()
                .await
                .with_context(|| format!("identify role '{role}'"))?;
            log::info!("{role}: {identity}");
        }

        // Never reconfigure a live output: ramp it down first.
        {
            let source = source_driver(&mut self.contexts, source_role)?;
            if source.get_output_enabled().await? {
                let level = source.get_voltage_level().await?;
                log::warn!("source output live at {level} V, ramping to zero before setup");
                ramp(
                    source,
                    &self.events,
                    &self.state,
                    LinearRange::new(level, 0.0, SAFE_RAMP_STEP),
                    SAFE_RAMP_SETTLE,
                    false,
                )
                .await?;
            } else {
                source.set_voltage_level(0.0).await?;
                self.state.set_source_voltage(0.0);
                let _ = self.events.send(MeasurementEvent::SourceVoltage(0.0));
            }
        }

        if self.state.read(|s| s.reset) {
            for (role, driver) in self.contexts.iter_mut() {
                driver
                    .reset()
                    .await
                    .with_context(|| format!("reset role '{role}'"))?;
            }
        }

        for (role, driver) in self.contexts.iter_mut() {
            driver
                .clear()
                .await
                .with_context(|| format!("clear role '{role}'"))?;
        }

        // Fail fast on any instrument-reported error; a partially configured
        // run never proceeds.
        for (role, driver) in self.contexts.iter_mut() {
            let options = self
                .state
                .read(|s| s.role(*role).map(|c| c.options.clone()))
                .unwrap_or_default();
            driver
                .configure(&options)
                .await
                .with_context(|| format!("configure role '{role}'"))?;
            driver.raise_on_error().await?;
        }

        let (compliance, begin, end) = self
            .state
            .read(|s| (s.current_compliance, s.voltage_begin, s.voltage_end));
        {
            let source = source_driver(&mut self.contexts, source_role)?;
            source.set_current_compliance_level(compliance).await?;
            source.raise_on_error().await?;
            // The range must cover the whole sweep, not just the begin ramp.
            source
                .set_voltage_range(begin.abs().max(end.abs()).max(SAFE_RAMP_STEP))
                .await?;
            source.set_output_enabled(true).await?;
        }
        self.state.set_output_state(Some(true));
        let _ = self.events.send(MeasurementEvent::OutputState(true));

        {
            let source = source_driver(&mut self.contexts, source_role)?;
            ramp(
                source,
                &self.events,
                &self.state,
                LinearRange::new(0.0, begin, SAFE_RAMP_STEP),
                SAFE_RAMP_SETTLE,
                true,
            )
            .await?;
        }

        tokio::time::sleep(OUTPUT_SETTLE).await;
        Ok(())
    }

    async fn measure(&mut self) -> Result<()> {
        let source_role = self.source_role()?;
        let (begin, end, step, waiting_time, continuous) = self.state.read(|s| {
            (
                s.voltage_begin,
                s.voltage_end,
                s.voltage_step,
                s.waiting_time,
                s.continuous,
            )
        });

        let range = LinearRange::new(begin, end, step);
        let mut estimate = Estimate::new(range.len());
        let mut applied_compliance = self.state.read(|s| s.current_compliance);

        for level in range.iter() {
            if self.state.stop_requested() {
                return Ok(());
            }

            {
                let source = source_driver(&mut self.contexts, source_role)?;
                source.set_voltage_level(level).await?;
            }
            self.state.set_source_voltage(level);
            let _ = self.events.send(MeasurementEvent::SourceVoltage(level));

            tokio::time::sleep(Duration::from_secs_f64(waiting_time.max(0.0))).await;

            let reading = self
                .acquirer
                .acquire(&mut self.contexts, level, false)
                .await?;
            self.update_live(&reading);
            let _ = self.events.send(MeasurementEvent::Reading(reading));

            applied_compliance = self
                .check_compliance(source_role, applied_compliance)
                .await?;

            estimate.advance();
            let _ = self.events.send(MeasurementEvent::Progress {
                passed: estimate.passed(),
                total: estimate.total(),
                remaining: estimate.remaining(),
            });
        }

        if continuous && !self.state.stop_requested() {
            self.continuous_loop(source_role).await?;
        }
        Ok(())
    }

    /// Unbounded cooperative acquisition after the sweep; loops until stop.
    async fn continuous_loop(&mut self, source_role: Role) -> Result<()> {
        let _ = self
            .events
            .send(MeasurementEvent::Message("Continuous measurement...".into()));

        let mut last_poll = tokio::time::Instant::now();
        let mut applied_compliance = self.state.read(|s| s.current_compliance);

        loop {
            if self.state.stop_requested() {
                return Ok(());
            }

            let voltage = self.state.source_voltage();
            let reading = self
                .acquirer
                .acquire(&mut self.contexts, voltage, true)
                .await?;
            self.update_live(&reading);
            let _ = self.events.send(MeasurementEvent::Reading(reading));

            // Rate-limited housekeeping: compliance and pending change
            // requests are checked at most once per poll interval to bound
            // instrument chatter.
            if last_poll.elapsed() >= self.poll_interval {
                last_poll = tokio::time::Instant::now();
                applied_compliance = self
                    .check_compliance(source_role, applied_compliance)
                    .await?;
                if let Some(request) = self.state.take_change_voltage() {
                    self.execute_change_voltage(source_role, request).await?;
                }
            }

            self.continuous_wait(source_role).await?;
        }
    }

    /// Inter-reading wait. Short waits sleep directly; waits of a second or
    /// more tick at one-second granularity, checking the stop flag and any
    /// pending change request on every tick, so worst-case stop latency stays
    /// near one second even for long waits.
    async fn continuous_wait(&mut self, source_role: Role) -> Result<()> {
        let wait = self.state.read(|s| s.waiting_time_continuous).max(0.0);
        if wait < 1.0 {
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
            return Ok(());
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs_f64(wait);
        loop {
            if self.state.stop_requested() {
                return Ok(());
            }
            if let Some(request) = self.state.take_change_voltage() {
                self.execute_change_voltage(source_role, request).await?;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(());
            }
            let remaining = deadline - now;
            let _ = self.events.send(MeasurementEvent::Message(format!(
                "Next reading in {} s...",
                remaining.as_secs().max(1)
            )));
            tokio::time::sleep(remaining.min(Duration::from_secs(1))).await;
        }
    }

    /// Checks the compliance trip state and re-applies the configured level
    /// if it changed mid-run. Returns the applied level.
    async fn check_compliance(&mut self, source_role: Role, applied: f64) -> Result<f64> {
        let (configured, tolerate) = self
            .state
            .read(|s| (s.current_compliance, s.continue_in_compliance));

        let source = source_driver(&mut self.contexts, source_role)?;
        if source.compliance_tripped().await? {
            let _ = self.events.send(MeasurementEvent::ComplianceTripped);
            if !tolerate {
                return Err(DaqError::ComplianceTripped.into());
            }
            log::warn!("current compliance tripped, continuing");
        }

        if configured != applied {
            log::info!("compliance changed mid-run: {applied:E} A -> {configured:E} A");
            source.set_current_compliance_level(configured).await?;
            source.raise_on_error().await?;
        }
        Ok(configured)
    }

    /// Executes one consumed voltage-change request as an interruptible ramp
    /// from the present source voltage. The range is widened before ramping
    /// when the new magnitude is larger, and narrowed only afterwards, so the
    /// ramp never clips.
    async fn execute_change_voltage(
        &mut self,
        source_role: Role,
        request: ChangeVoltageRequest,
    ) -> Result<()> {
        let mut current = self.state.source_voltage();
        let source = source_driver(&mut self.contexts, source_role)?;
        if !current.is_finite() {
            current = source.get_voltage_level().await?;
        }

        let _ = self.events.send(MeasurementEvent::Message(format!(
            "Changing voltage to {} V...",
            request.end_voltage
        )));

        if request.end_voltage.abs() > current.abs() {
            source.set_voltage_range(request.end_voltage.abs()).await?;
        }
        ramp(
            &mut *source,
            &self.events,
            &self.state,
            LinearRange::new(current, request.end_voltage, request.step_voltage),
            Duration::from_secs_f64(request.waiting_time.max(0.0)),
            true,
        )
        .await?;
        if request.end_voltage.abs() < current.abs() {
            source.set_voltage_range(request.end_voltage.abs()).await?;
        }
        Ok(())
    }

    /// Instrument-side teardown: ramp to zero, output off, role-specific
    /// finalizers. Runs on every path where instruments were connected; the
    /// zero ramp is not skippable by a stop request.
    async fn finalize(&mut self) -> Result<()> {
        let source_role = self.state.read(|s| s.source);
        if let Some(role) = source_role {
            if self.contexts.contains_key(&role) {
                let source = source_driver(&mut self.contexts, role)?;
                let mut level = self.state.source_voltage();
                if !level.is_finite() {
                    level = match source.get_voltage_level().await {
                        Ok(level) => level,
                        Err(err) => {
                            log::warn!("cannot read source voltage for zero ramp: {err:#}");
                            0.0
                        }
                    };
                }
                ramp(
                    &mut *source,
                    &self.events,
                    &self.state,
                    LinearRange::new(level, 0.0, SAFE_RAMP_STEP),
                    SAFE_RAMP_SETTLE,
                    false,
                )
                .await?;
                source.set_output_enabled(false).await?;
                self.state.set_output_state(Some(false));
                let _ = self.events.send(MeasurementEvent::OutputState(false));
            }
        }

        for (role, driver) in self.contexts.iter_mut() {
            driver
                .finalize()
                .await
                .with_context(|| format!("finalize role '{role}'"))?;
        }
        Ok(())
    }

    fn update_live(&self, reading: &Reading) {
        self.state.update(|s| {
            s.live.smu_current = reading.i_smu;
            s.live.elm_current = reading.i_elm;
            s.live.lcr_capacity = reading.c_lcr;
            s.live.lcr_capacity_c2 = reading.c2_lcr;
            s.live.dmm_temperature = reading.t_dmm;
        });
    }
}

fn source_driver(
    contexts: &mut HashMap<Role, RoleDriver>,
    role: Role,
) -> Result<&mut RoleDriver> {
    let driver = contexts
        .get_mut(&role)
        .ok_or_else(|| DaqError::Precondition(format!("source role '{role}' is not wired")))?;
    if !driver.is_source() {
        return Err(DaqError::Precondition(format!(
            "source role '{role}' is not a voltage source"
        ))
        .into());
    }
    Ok(driver)
}

/// Shared stepwise ramp used for the begin ramp, the zero ramp and continuous
/// voltage changes. Returns false when aborted by a stop request.
async fn ramp(
    driver: &mut RoleDriver,
    events: &EventSender,
    state: &StateHandle,
    range: LinearRange,
    settle: Duration,
    interruptible: bool,
) -> Result<bool> {
    let mut estimate = Estimate::new(range.len());
    for level in range.iter() {
        if interruptible && state.stop_requested() {
            return Ok(false);
        }
        driver.set_voltage_level(level).await?;
        state.set_source_voltage(level);
        let _ = events.send(MeasurementEvent::SourceVoltage(level));
        estimate.advance();
        let _ = events.send(MeasurementEvent::Progress {
            passed: estimate.passed(),
            total: estimate.total(),
            remaining: estimate.remaining(),
        });
        tokio::time::sleep(settle).await;
    }
    Ok(true)
}
