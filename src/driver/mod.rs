//! Instrument driver capability interface.
//!
//! Every instrument role is driven through one of the capability traits
//! defined here: [`Driver`] is the base every instrument supports, and
//! [`SourceMeter`], [`Electrometer`], [`LcrMeter`], [`Dmm`] and
//! [`SwitchingMatrix`] add role-specific operations on top.
//!
//! The measurement engine holds instruments as [`RoleDriver`] handles, an
//! erased enum over the capability traits. Operations a role does not support
//! report a driver error instead of panicking, so a mis-wired configuration
//! fails loudly at the call site.
//!
//! Every mutating call may be slow (a GPIB round-trip is tens to hundreds of
//! milliseconds) and may fail transiently; retries belong to the transport's
//! reconnect policy, never to this layer.

pub mod mock;
pub mod registry;
pub mod scpi;

use crate::error::DaqError;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// A named instrument function slot.
///
/// A role may or may not be enabled/configured for a given run; the engine
/// only ever touches roles it was handed a driver for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Smu,
    Smu2,
    Elm,
    Lcr,
    Dmm,
    Matrix,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::Smu,
        Role::Smu2,
        Role::Elm,
        Role::Lcr,
        Role::Dmm,
        Role::Matrix,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Smu => "smu",
            Role::Smu2 => "smu2",
            Role::Elm => "elm",
            Role::Lcr => "lcr",
            Role::Dmm => "dmm",
            Role::Matrix => "matrix",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "smu" => Ok(Role::Smu),
            "smu2" => Ok(Role::Smu2),
            "elm" => Ok(Role::Elm),
            "lcr" => Ok(Role::Lcr),
            "dmm" => Ok(Role::Dmm),
            "matrix" => Ok(Role::Matrix),
            other => Err(DaqError::Precondition(format!("unknown role '{other}'"))),
        }
    }
}

/// One entry read back from an instrument's own error queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentError {
    pub code: i32,
    pub message: String,
}

/// Model-specific configuration options passed to [`Driver::configure`].
pub type DriverOptions = HashMap<String, serde_json::Value>;

/// Operations every instrument role supports.
#[async_trait]
pub trait Driver: Send {
    /// Short driver identifier used in diagnostics, e.g. `K2410`.
    fn driver_type(&self) -> &'static str;

    /// Queries the instrument identity string (`*IDN?`).
    async fn identify(&mut self) -> Result<String>;

    /// Issues a hardware reset.
    async fn reset(&mut self) -> Result<()>;

    /// Clears status and the error queue.
    async fn clear(&mut self) -> Result<()>;

    /// Pops the next entry from the instrument error queue, if any.
    async fn next_error(&mut self) -> Result<Option<InstrumentError>>;

    /// Applies model-specific configuration options.
    async fn configure(&mut self, options: &DriverOptions) -> Result<()>;

    /// Releases the underlying transport. Default is a no-op for drivers
    /// without one (mocks).
    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Voltage source with current measurement and compliance.
#[async_trait]
pub trait SourceMeter: Driver {
    async fn get_output_enabled(&mut self) -> Result<bool>;
    async fn set_output_enabled(&mut self, enabled: bool) -> Result<()>;
    async fn get_voltage_level(&mut self) -> Result<f64>;
    async fn set_voltage_level(&mut self, level: f64) -> Result<()>;
    async fn set_voltage_range(&mut self, level: f64) -> Result<()>;
    async fn set_current_compliance_level(&mut self, level: f64) -> Result<()>;
    async fn compliance_tripped(&mut self) -> Result<bool>;
    async fn read_current(&mut self) -> Result<f64>;
}

/// Electrometer: a source meter with zero-check control.
#[async_trait]
pub trait Electrometer: SourceMeter {
    async fn set_zero_check_enabled(&mut self, enabled: bool) -> Result<()>;
}

/// LCR meter: bias source with capacitance measurement.
#[async_trait]
pub trait LcrMeter: SourceMeter {
    async fn read_capacity(&mut self) -> Result<f64>;

    /// Model-specific teardown after a run (bias off, open correction state).
    async fn finalize(&mut self) -> Result<()>;
}

/// Temperature readout.
#[async_trait]
pub trait Dmm: Driver {
    async fn read_temperature(&mut self) -> Result<f64>;
}

/// Channel multiplexer in front of the sample.
#[async_trait]
pub trait SwitchingMatrix: Driver {
    async fn close_channels(&mut self, channels: &[String]) -> Result<()>;
    async fn open_channels(&mut self, channels: &[String]) -> Result<()>;
    async fn open_all_channels(&mut self) -> Result<()>;
    async fn closed_channels(&mut self) -> Result<Vec<String>>;
}

/// Erased driver handle held by the measurement engine, one per wired role.
pub enum RoleDriver {
    SourceMeter(Box<dyn SourceMeter>),
    Electrometer(Box<dyn Electrometer>),
    Lcr(Box<dyn LcrMeter>),
    Dmm(Box<dyn Dmm>),
    Matrix(Box<dyn SwitchingMatrix>),
}

impl std::fmt::Debug for RoleDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RoleDriver").field(&self.driver_type()).finish()
    }
}

impl RoleDriver {
    pub fn driver_type(&self) -> &'static str {
        match self {
            RoleDriver::SourceMeter(d) => d.driver_type(),
            RoleDriver::Electrometer(d) => d.driver_type(),
            RoleDriver::Lcr(d) => d.driver_type(),
            RoleDriver::Dmm(d) => d.driver_type(),
            RoleDriver::Matrix(d) => d.driver_type(),
        }
    }

    pub async fn identify(&mut self) -> Result<String> {
        match self {
            RoleDriver::SourceMeter(d) => d.identify().await,
            RoleDriver::Electrometer(d) => d.identify().await,
            RoleDriver::Lcr(d) => d.identify().await,
            RoleDriver::Dmm(d) => d.identify().await,
            RoleDriver::Matrix(d) => d.identify().await,
        }
    }

    pub async fn reset(&mut self) -> Result<()> {
        match self {
            RoleDriver::SourceMeter(d) => d.reset().await,
            RoleDriver::Electrometer(d) => d.reset().await,
            RoleDriver::Lcr(d) => d.reset().await,
            RoleDriver::Dmm(d) => d.reset().await,
            RoleDriver::Matrix(d) => d.reset().await,
        }
    }

    pub async fn clear(&mut self) -> Result<()> {
        match self {
            RoleDriver::SourceMeter(d) => d.clear().await,
            RoleDriver::Electrometer(d) => d.clear().await,
            RoleDriver::Lcr(d) => d.clear().await,
            RoleDriver::Dmm(d) => d.clear().await,
            RoleDriver::Matrix(d) => d.clear().await,
        }
    }

    pub async fn next_error(&mut self) -> Result<Option<InstrumentError>> {
        match self {
            RoleDriver::SourceMeter(d) => d.next_error().await,
            RoleDriver::Electrometer(d) => d.next_error().await,
            RoleDriver::Lcr(d) => d.next_error().await,
            RoleDriver::Dmm(d) => d.next_error().await,
            RoleDriver::Matrix(d) => d.next_error().await,
        }
    }

    pub async fn configure(&mut self, options: &DriverOptions) -> Result<()> {
        match self {
            RoleDriver::SourceMeter(d) => d.configure(options).await,
            RoleDriver::Electrometer(d) => d.configure(options).await,
            RoleDriver::Lcr(d) => d.configure(options).await,
            RoleDriver::Dmm(d) => d.configure(options).await,
            RoleDriver::Matrix(d) => d.configure(options).await,
        }
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        match self {
            RoleDriver::SourceMeter(d) => d.shutdown().await,
            RoleDriver::Electrometer(d) => d.shutdown().await,
            RoleDriver::Lcr(d) => d.shutdown().await,
            RoleDriver::Dmm(d) => d.shutdown().await,
            RoleDriver::Matrix(d) => d.shutdown().await,
        }
    }

    /// Checks the instrument error queue and raises on any reported error.
    ///
    /// Called after every `configure` and after every compliance change; an
    /// instrument-reported error always aborts the run.
    pub async fn raise_on_error(&mut self) -> Result<()> {
        if let Some(error) = self.next_error().await? {
            return Err(DaqError::Instrument {
                code: error.code,
                message: format!("{} ({})", error.message, self.driver_type()),
            }
            .into());
        }
        Ok(())
    }

    fn not_a_source(&self) -> anyhow::Error {
        DaqError::driver(self.driver_type(), "role is not a voltage source").into()
    }

    pub fn is_source(&self) -> bool {
        matches!(
            self,
            RoleDriver::SourceMeter(_) | RoleDriver::Electrometer(_) | RoleDriver::Lcr(_)
        )
    }

    pub async fn get_output_enabled(&mut self) -> Result<bool> {
        match self {
            RoleDriver::SourceMeter(d) => d.get_output_enabled().await,
            RoleDriver::Electrometer(d) => d.get_output_enabled().await,
            RoleDriver::Lcr(d) => d.get_output_enabled().await,
            _ => Err(self.not_a_source()),
        }
    }

    pub async fn set_output_enabled(&mut self, enabled: bool) -> Result<()> {
        match self {
            RoleDriver::SourceMeter(d) => d.set_output_enabled(enabled).await,
            RoleDriver::Electrometer(d) => d.set_output_enabled(enabled).await,
            RoleDriver::Lcr(d) => d.set_output_enabled(enabled).await,
            _ => Err(self.not_a_source()),
        }
    }

    pub async fn get_voltage_level(&mut self) -> Result<f64> {
        match self {
            RoleDriver::SourceMeter(d) => d.get_voltage_level().await,
            RoleDriver::Electrometer(d) => d.get_voltage_level().await,
            RoleDriver::Lcr(d) => d.get_voltage_level().await,
            _ => Err(self.not_a_source()),
        }
    }

    pub async fn set_voltage_level(&mut self, level: f64) -> Result<()> {
        match self {
            RoleDriver::SourceMeter(d) => d.set_voltage_level(level).await,
            RoleDriver::Electrometer(d) => d.set_voltage_level(level).await,
            RoleDriver::Lcr(d) => d.set_voltage_level(level).await,
            _ => Err(self.not_a_source()),
        }
    }

    pub async fn set_voltage_range(&mut self, level: f64) -> Result<()> {
        match self {
            RoleDriver::SourceMeter(d) => d.set_voltage_range(level).await,
            RoleDriver::Electrometer(d) => d.set_voltage_range(level).await,
            RoleDriver::Lcr(d) => d.set_voltage_range(level).await,
            _ => Err(self.not_a_source()),
        }
    }

    pub async fn set_current_compliance_level(&mut self, level: f64) -> Result<()> {
        match self {
            RoleDriver::SourceMeter(d) => d.set_current_compliance_level(level).await,
            RoleDriver::Electrometer(d) => d.set_current_compliance_level(level).await,
            RoleDriver::Lcr(d) => d.set_current_compliance_level(level).await,
            _ => Err(self.not_a_source()),
        }
    }

    pub async fn compliance_tripped(&mut self) -> Result<bool> {
        match self {
            RoleDriver::SourceMeter(d) => d.compliance_tripped().await,
            RoleDriver::Electrometer(d) => d.compliance_tripped().await,
            RoleDriver::Lcr(d) => d.compliance_tripped().await,
            _ => Err(self.not_a_source()),
        }
    }

    pub async fn read_current(&mut self) -> Result<f64> {
        match self {
            RoleDriver::SourceMeter(d) => d.read_current().await,
            RoleDriver::Electrometer(d) => d.read_current().await,
            RoleDriver::Lcr(d) => d.read_current().await,
            _ => Err(self.not_a_source()),
        }
    }

    pub async fn read_capacity(&mut self) -> Result<f64> {
        match self {
            RoleDriver::Lcr(d) => d.read_capacity().await,
            _ => Err(DaqError::driver(self.driver_type(), "role is not an LCR meter").into()),
        }
    }

    pub async fn read_temperature(&mut self) -> Result<f64> {
        match self {
            RoleDriver::Dmm(d) => d.read_temperature().await,
            _ => Err(DaqError::driver(self.driver_type(), "role is not a DMM").into()),
        }
    }

    pub async fn set_zero_check_enabled(&mut self, enabled: bool) -> Result<()> {
        match self {
            RoleDriver::Electrometer(d) => d.set_zero_check_enabled(enabled).await,
            _ => Err(DaqError::driver(self.driver_type(), "role is not an electrometer").into()),
        }
    }

    /// LCR-specific teardown; a no-op for every other capability.
    pub async fn finalize(&mut self) -> Result<()> {
        match self {
            RoleDriver::Lcr(d) => d.finalize().await,
            _ => Ok(()),
        }
    }
}
