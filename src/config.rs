//! Application configuration.
//!
//! Settings load from a TOML file plus `DIODE_DAQ_` environment variable
//! overrides (nesting separator `__`, e.g.
//! `DIODE_DAQ_MEASUREMENT__VOLTAGE_STEP=5`). Every section has working
//! defaults so an empty file is a valid configuration.

use crate::driver::Role;
use crate::error::DaqResult;
use crate::state::{MeasurementState, MeasurementType, RoleConfig};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "DIODE_DAQ";

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub output: OutputSettings,
    pub remote: RemoteSettings,
    pub measurement: MeasurementSettings,
    /// Per-role instrument configuration, keyed by role name.
    pub roles: HashMap<Role, RoleConfig>,
    /// The role acting as voltage source.
    pub source: Option<Role>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            output: OutputSettings::default(),
            remote: RemoteSettings::default(),
            measurement: MeasurementSettings::default(),
            roles: HashMap::new(),
            source: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub path: PathBuf,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data"),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    pub enabled: bool,
    pub bind: String,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "127.0.0.1:8001".to_string(),
        }
    }
}

/// Defaults for the run parameters; the operator mutates these per run
/// through the shared state.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MeasurementSettings {
    pub measurement_type: MeasurementType,
    pub sample: String,
    pub continuous: bool,
    pub reset: bool,
    pub auto_reconnect: bool,
    pub voltage_begin: f64,
    pub voltage_end: f64,
    pub voltage_step: f64,
    pub waiting_time: f64,
    pub waiting_time_continuous: f64,
    pub current_compliance: f64,
    pub continue_in_compliance: bool,
}

impl Default for MeasurementSettings {
    fn default() -> Self {
        let state = MeasurementState::default();
        Self {
            measurement_type: state.measurement_type,
            sample: state.sample,
            continuous: state.continuous,
            reset: state.reset,
            auto_reconnect: state.auto_reconnect,
            voltage_begin: state.voltage_begin,
            voltage_end: state.voltage_end,
            voltage_step: state.voltage_step,
            waiting_time: state.waiting_time,
            waiting_time_continuous: state.waiting_time_continuous,
            current_compliance: state.current_compliance,
            continue_in_compliance: state.continue_in_compliance,
        }
    }
}

impl Settings {
    /// Loads settings from `path` (optional) layered with environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> DaqResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path.to_path_buf()).required(false));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    /// Builds the initial session state from the configured defaults.
    pub fn to_state(&self) -> MeasurementState {
        MeasurementState {
            measurement_type: self.measurement.measurement_type,
            sample: self.measurement.sample.clone(),
            timestamp: 0.0,
            continuous: self.measurement.continuous,
            reset: self.measurement.reset,
            auto_reconnect: self.measurement.auto_reconnect,
            voltage_begin: self.measurement.voltage_begin,
            voltage_end: self.measurement.voltage_end,
            voltage_step: self.measurement.voltage_step,
            waiting_time: self.measurement.waiting_time,
            waiting_time_continuous: self.measurement.waiting_time_continuous,
            current_compliance: self.measurement.current_compliance,
            continue_in_compliance: self.measurement.continue_in_compliance,
            roles: self.roles.clone(),
            source: self.source,
            live: Default::default(),
            change_voltage_continuous: None,
            filename: None,
        }
    }
}
