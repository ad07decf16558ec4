//! Generic SCPI drivers.
//!
//! Thin drivers speaking the common SCPI subset shared by the supported bench
//! instruments. Model-specific quirks stay out of the measurement engine; the
//! registry maps model names onto these implementations.
//!
//! Option keys understood by `configure` (anything else is logged and
//! skipped):
//!
//! - `nplc`: integration time in power-line cycles
//! - `filter.enabled`, `filter.count`, `filter.mode`: averaging filter
//! - `sense.range`: current sense range in amps
//! - `route.terminals`: `FRONT`/`REAR`
//! - `setup`: array of raw SCPI commands sent verbatim, in order

use super::{
    Dmm, Driver, DriverOptions, Electrometer, InstrumentError, LcrMeter, SourceMeter,
    SwitchingMatrix,
};
use crate::error::DaqError;
use crate::resource::Transport;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

/// Wall-clock bound for operation-complete polls.
const OPC_TIMEOUT: Duration = Duration::from_secs(60);
/// Polling interval inside bounded fetch loops.
const OPC_INTERVAL: Duration = Duration::from_millis(250);

/// Transport plus the shared SCPI plumbing every driver here uses.
struct ScpiCore {
    name: &'static str,
    transport: Box<dyn Transport>,
}

impl ScpiCore {
    fn new(name: &'static str, transport: Box<dyn Transport>) -> Self {
        Self { name, transport }
    }

    async fn write(&mut self, command: &str) -> Result<()> {
        self.transport
            .write(command)
            .await
            .with_context(|| format!("{}: write '{}'", self.name, command))
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        self.transport
            .query(command)
            .await
            .with_context(|| format!("{}: query '{}'", self.name, command))
    }

    async fn query_f64(&mut self, command: &str) -> Result<f64> {
        let response = self.query(command).await?;
        parse_first_field(&response)
            .ok_or_else(|| DaqError::driver(self.name, format!("unparseable response '{response}'")).into())
    }

    async fn query_bool(&mut self, command: &str) -> Result<bool> {
        let response = self.query(command).await?;
        match response.trim() {
            "1" | "ON" => Ok(true),
            "0" | "OFF" => Ok(false),
            other => {
                Err(DaqError::driver(self.name, format!("unexpected boolean '{other}'")).into())
            }
        }
    }

    /// Blocks until the instrument reports operation complete, bounded by
    /// [`OPC_TIMEOUT`].
    ///
    /// The deadline runs on the runtime clock, so paused-time tests observe
    /// the bound without waiting it out.
    async fn wait_complete(&mut self) -> Result<()> {
        let started = Instant::now();
        loop {
            if self.query("*OPC?").await?.trim() == "1" {
                return Ok(());
            }
            if started.elapsed() >= OPC_TIMEOUT {
                return Err(DaqError::Timeout {
                    elapsed: started.elapsed(),
                }
                .into());
            }
            tokio::time::sleep(OPC_INTERVAL).await;
        }
    }

    async fn next_error(&mut self) -> Result<Option<InstrumentError>> {
        let response = self.query(":SYST:ERR?").await?;
        Ok(parse_error_queue(&response))
    }

    /// Shared `configure` implementation for the sense/filter option keys.
    async fn apply_options(&mut self, options: &DriverOptions) -> Result<()> {
        for (key, value) in options {
            match key.as_str() {
                "nplc" => {
                    let nplc = as_f64(self.name, key, value)?;
                    self.write(&format!(":SENS:CURR:NPLC {nplc}")).await?;
                }
                "filter.enabled" => {
                    let state = if as_bool(self.name, key, value)? { "ON" } else { "OFF" };
                    self.write(&format!(":SENS:AVER:STAT {state}")).await?;
                }
                "filter.count" => {
                    let count = as_f64(self.name, key, value)? as i64;
                    self.write(&format!(":SENS:AVER:COUN {count}")).await?;
                }
                "filter.mode" => {
                    let mode = as_str(self.name, key, value)?;
                    self.write(&format!(":SENS:AVER:TCON {mode}")).await?;
                }
                "sense.range" => {
                    let range = as_f64(self.name, key, value)?;
                    self.write(&format!(":SENS:CURR:RANG {range:E}")).await?;
                }
                "route.terminals" => {
                    let terminals = as_str(self.name, key, value)?;
                    self.write(&format!(":ROUT:TERM {terminals}")).await?;
                }
                "setup" => {
                    for command in value.as_array().into_iter().flatten() {
                        if let Some(command) = command.as_str() {
                            self.write(command).await?;
                        }
                    }
                }
                other => {
                    log::warn!("{}: ignoring unknown option '{}'", self.name, other);
                }
            }
        }
        Ok(())
    }
}

fn parse_first_field(response: &str) -> Option<f64> {
    response
        .split(',')
        .next()
        .and_then(|field| field.trim().parse::<f64>().ok())
}

/// Parses a `code,"message"` error-queue response; code 0 means empty queue.
fn parse_error_queue(response: &str) -> Option<InstrumentError> {
    let mut fields = response.splitn(2, ',');
    let code = fields.next()?.trim().parse::<i32>().ok()?;
    if code == 0 {
        return None;
    }
    let message = fields
        .next()
        .unwrap_or("")
        .trim()
        .trim_matches('"')
        .to_string();
    Some(InstrumentError { code, message })
}

fn as_f64(driver: &str, key: &str, value: &serde_json::Value) -> Result<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| DaqError::driver(driver, format!("option '{key}' is not a number")).into())
}

fn as_bool(driver: &str, key: &str, value: &serde_json::Value) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| DaqError::driver(driver, format!("option '{key}' is not a boolean")).into())
}

fn as_str<'a>(driver: &str, key: &str, value: &'a serde_json::Value) -> Result<&'a str> {
    value
        .as_str()
        .ok_or_else(|| DaqError::driver(driver, format!("option '{key}' is not a string")).into())
}

// ============================================================================
// Source meter
// ============================================================================

/// Generic SCPI source meter (Keithley 24xx/26xx class).
pub struct ScpiSourceMeter {
    core: ScpiCore,
}

impl ScpiSourceMeter {
    pub fn new(name: &'static str, transport: Box<dyn Transport>) -> Self {
        Self {
            core: ScpiCore::new(name, transport),
        }
    }
}

#[async_trait]
impl Driver for ScpiSourceMeter {
    fn driver_type(&self) -> &'static str {
        self.core.name
    }

    async fn identify(&mut self) -> Result<String> {
        self.core.query("*IDN?").await
    }

    async fn reset(&mut self) -> Result<()> {
        self.core.write("*RST").await?;
        self.core.wait_complete().await
    }

    async fn clear(&mut self) -> Result<()> {
        self.core.write("*CLS").await
    }

    async fn next_error(&mut self) -> Result<Option<InstrumentError>> {
        self.core.next_error().await
    }

    async fn configure(&mut self, options: &DriverOptions) -> Result<()> {
        self.core.write(":SOUR:FUNC VOLT").await?;
        self.core.write(":SENS:FUNC 'CURR'").await?;
        self.core.apply_options(options).await
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.core.transport.close().await
    }
}

#[async_trait]
impl SourceMeter for ScpiSourceMeter {
    async fn get_output_enabled(&mut self) -> Result<bool> {
        self.core.query_bool(":OUTP:STAT?").await
    }

    async fn set_output_enabled(&mut self, enabled: bool) -> Result<()> {
        let state = if enabled { "ON" } else { "OFF" };
        self.core.write(&format!(":OUTP:STAT {state}")).await
    }

    async fn get_voltage_level(&mut self) -> Result<f64> {
        self.core.query_f64(":SOUR:VOLT:LEV?").await
    }

    async fn set_voltage_level(&mut self, level: f64) -> Result<()> {
        self.core.write(&format!(":SOUR:VOLT:LEV {level:E}")).await
    }

    async fn set_voltage_range(&mut self, level: f64) -> Result<()> {
        self.core
            .write(&format!(":SOUR:VOLT:RANG {level:E}"))
            .await
    }

    async fn set_current_compliance_level(&mut self, level: f64) -> Result<()> {
        self.core
            .write(&format!(":SENS:CURR:PROT:LEV {level:E}"))
            .await
    }

    async fn compliance_tripped(&mut self) -> Result<bool> {
        self.core.query_bool(":SENS:CURR:PROT:TRIP?").await
    }

    async fn read_current(&mut self) -> Result<f64> {
        self.core.query_f64(":READ?").await
    }
}

// ============================================================================
// Electrometer
// ============================================================================

/// Generic SCPI electrometer with built-in voltage source (Keithley 65xx
/// class).
pub struct ScpiElectrometer {
    core: ScpiCore,
}

impl ScpiElectrometer {
    pub fn new(name: &'static str, transport: Box<dyn Transport>) -> Self {
        Self {
            core: ScpiCore::new(name, transport),
        }
    }
}

#[async_trait]
impl Driver for ScpiElectrometer {
    fn driver_type(&self) -> &'static str {
        self.core.name
    }

    async fn identify(&mut self) -> Result<String> {
        self.core.query("*IDN?").await
    }

    async fn reset(&mut self) -> Result<()> {
        self.core.write("*RST").await?;
        self.core.wait_complete().await
    }

    async fn clear(&mut self) -> Result<()> {
        self.core.write("*CLS").await
    }

    async fn next_error(&mut self) -> Result<Option<InstrumentError>> {
        self.core.next_error().await
    }

    async fn configure(&mut self, options: &DriverOptions) -> Result<()> {
        // Readings with zero check engaged are meaningless; disengage before
        // anything else touches the input.
        self.set_zero_check_enabled(false).await?;
        self.core.write(":SENS:FUNC 'CURR'").await?;
        self.core.apply_options(options).await
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.core.transport.close().await
    }
}

#[async_trait]
impl SourceMeter for ScpiElectrometer {
    async fn get_output_enabled(&mut self) -> Result<bool> {
        self.core.query_bool(":OUTP:STAT?").await
    }

    async fn set_output_enabled(&mut self, enabled: bool) -> Result<()> {
        let state = if enabled { "ON" } else { "OFF" };
        self.core.write(&format!(":OUTP:STAT {state}")).await
    }

    async fn get_voltage_level(&mut self) -> Result<f64> {
        self.core.query_f64(":SOUR:VOLT:LEV?").await
    }

    async fn set_voltage_level(&mut self, level: f64) -> Result<()> {
        self.core.write(&format!(":SOUR:VOLT:LEV {level:E}")).await
    }

    async fn set_voltage_range(&mut self, level: f64) -> Result<()> {
        self.core
            .write(&format!(":SOUR:VOLT:RANG {level:E}"))
            .await
    }

    async fn set_current_compliance_level(&mut self, level: f64) -> Result<()> {
        self.core
            .write(&format!(":SOUR:VOLT:ILIM {level:E}"))
            .await
    }

    async fn compliance_tripped(&mut self) -> Result<bool> {
        self.core.query_bool(":SOUR:VOLT:ILIM:TRIP?").await
    }

    async fn read_current(&mut self) -> Result<f64> {
        self.core.query_f64(":READ?").await
    }
}

#[async_trait]
impl Electrometer for ScpiElectrometer {
    async fn set_zero_check_enabled(&mut self, enabled: bool) -> Result<()> {
        let state = if enabled { "ON" } else { "OFF" };
        self.core.write(&format!(":SYST:ZCH {state}")).await
    }
}

// ============================================================================
// LCR meter
// ============================================================================

/// Generic SCPI LCR meter with DC bias source (Keysight E4980A class).
///
/// The bias source stands in for the voltage-source capability; the
/// instrument has no current compliance, so the compliance operations are
/// no-ops that never trip.
pub struct ScpiLcrMeter {
    core: ScpiCore,
}

impl ScpiLcrMeter {
    pub fn new(name: &'static str, transport: Box<dyn Transport>) -> Self {
        Self {
            core: ScpiCore::new(name, transport),
        }
    }
}

#[async_trait]
impl Driver for ScpiLcrMeter {
    fn driver_type(&self) -> &'static str {
        self.core.name
    }

    async fn identify(&mut self) -> Result<String> {
        self.core.query("*IDN?").await
    }

    async fn reset(&mut self) -> Result<()> {
        self.core.write("*RST").await?;
        self.core.wait_complete().await
    }

    async fn clear(&mut self) -> Result<()> {
        self.core.write("*CLS").await
    }

    async fn next_error(&mut self) -> Result<Option<InstrumentError>> {
        self.core.next_error().await
    }

    async fn configure(&mut self, options: &DriverOptions) -> Result<()> {
        // Cp-D is the function the capacitance readout expects.
        self.core.write(":FUNC:IMP CPD").await?;
        self.core.write(":TRIG:SOUR BUS").await?;
        self.core.apply_options(options).await
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.core.transport.close().await
    }
}

#[async_trait]
impl SourceMeter for ScpiLcrMeter {
    async fn get_output_enabled(&mut self) -> Result<bool> {
        self.core.query_bool(":BIAS:STAT?").await
    }

    async fn set_output_enabled(&mut self, enabled: bool) -> Result<()> {
        let state = if enabled { "ON" } else { "OFF" };
        self.core.write(&format!(":BIAS:STAT {state}")).await
    }

    async fn get_voltage_level(&mut self) -> Result<f64> {
        self.core.query_f64(":BIAS:VOLT:LEV?").await
    }

    async fn set_voltage_level(&mut self, level: f64) -> Result<()> {
        self.core.write(&format!(":BIAS:VOLT:LEV {level:E}")).await
    }

    async fn set_voltage_range(&mut self, _level: f64) -> Result<()> {
        // Bias range is fixed on this instrument class.
        Ok(())
    }

    async fn set_current_compliance_level(&mut self, _level: f64) -> Result<()> {
        Ok(())
    }

    async fn compliance_tripped(&mut self) -> Result<bool> {
        Ok(false)
    }

    async fn read_current(&mut self) -> Result<f64> {
        Err(DaqError::driver(self.core.name, "current readout not supported").into())
    }
}

#[async_trait]
impl LcrMeter for ScpiLcrMeter {
    async fn read_capacity(&mut self) -> Result<f64> {
        self.core.write("*TRG").await?;
        self.core.wait_complete().await?;
        self.core.query_f64(":FETC?").await
    }

    async fn finalize(&mut self) -> Result<()> {
        self.core.write(":ABOR").await?;
        self.set_output_enabled(false).await
    }
}

// ============================================================================
// DMM
// ============================================================================

/// Generic SCPI multimeter used as a temperature readout (Keithley 2700
/// class with a thermocouple card).
pub struct ScpiDmm {
    core: ScpiCore,
}

impl ScpiDmm {
    pub fn new(name: &'static str, transport: Box<dyn Transport>) -> Self {
        Self {
            core: ScpiCore::new(name, transport),
        }
    }
}

#[async_trait]
impl Driver for ScpiDmm {
    fn driver_type(&self) -> &'static str {
        self.core.name
    }

    async fn identify(&mut self) -> Result<String> {
        self.core.query("*IDN?").await
    }

    async fn reset(&mut self) -> Result<()> {
        self.core.write("*RST").await?;
        self.core.wait_complete().await
    }

    async fn clear(&mut self) -> Result<()> {
        self.core.write("*CLS").await
    }

    async fn next_error(&mut self) -> Result<Option<InstrumentError>> {
        self.core.next_error().await
    }

    async fn configure(&mut self, options: &DriverOptions) -> Result<()> {
        self.core.write(":SENS:FUNC 'TEMP'").await?;
        self.core.apply_options(options).await
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.core.transport.close().await
    }
}

#[async_trait]
impl Dmm for ScpiDmm {
    async fn read_temperature(&mut self) -> Result<f64> {
        self.core.query_f64(":READ?").await
    }
}

// ============================================================================
// Switching matrix
// ============================================================================

/// Generic SCPI switching matrix (Keithley 708B class).
///
/// Channel lists use the instrument's `(@...)` notation; the `channels`
/// configure option (array of strings) closes its channels at setup time.
pub struct ScpiMatrix {
    core: ScpiCore,
}

impl ScpiMatrix {
    pub fn new(name: &'static str, transport: Box<dyn Transport>) -> Self {
        Self {
            core: ScpiCore::new(name, transport),
        }
    }
}

fn channel_list(channels: &[String]) -> String {
    format!("(@{})", channels.join(","))
}

#[async_trait]
impl Driver for ScpiMatrix {
    fn driver_type(&self) -> &'static str {
        self.core.name
    }

    async fn identify(&mut self) -> Result<String> {
        self.core.query("*IDN?").await
    }

    async fn reset(&mut self) -> Result<()> {
        self.core.write("*RST").await?;
        self.core.wait_complete().await
    }

    async fn clear(&mut self) -> Result<()> {
        self.core.write("*CLS").await
    }

    async fn next_error(&mut self) -> Result<Option<InstrumentError>> {
        self.core.next_error().await
    }

    async fn configure(&mut self, options: &DriverOptions) -> Result<()> {
        if let Some(value) = options.get("channels") {
            let channels: Vec<String> = value
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|c| c.as_str().map(str::to_string))
                .collect();
            self.open_all_channels().await?;
            if !channels.is_empty() {
                self.close_channels(&channels).await?;
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.core.transport.close().await
    }
}

#[async_trait]
impl SwitchingMatrix for ScpiMatrix {
    async fn close_channels(&mut self, channels: &[String]) -> Result<()> {
        self.core
            .write(&format!(":ROUT:CLOS {}", channel_list(channels)))
            .await
    }

    async fn open_channels(&mut self, channels: &[String]) -> Result<()> {
        self.core
            .write(&format!(":ROUT:OPEN {}", channel_list(channels)))
            .await
    }

    async fn open_all_channels(&mut self) -> Result<()> {
        self.core.write(":ROUT:OPEN:ALL").await
    }

    async fn closed_channels(&mut self) -> Result<Vec<String>> {
        let response = self.core.query(":ROUT:CLOS?").await?;
        Ok(response
            .trim()
            .trim_start_matches("(@")
            .trim_end_matches(')')
            .split(',')
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect())
    }
}
