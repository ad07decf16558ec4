//! Measurement orchestration for semiconductor diode IV/CV characterization.
//!
//! The crate drives a bench of GPIB/VISA instruments (source meters,
//! electrometers, LCR meters, multimeters, switching matrices) through
//! voltage-ramp measurements:
//!
//! - [`measurement`] is the orchestration engine: voltage ramps, per-step
//!   acquisition, compliance handling, continuous mode with live
//!   voltage-change requests, progress estimation.
//! - [`driver`] defines the instrument capability traits, the SCPI drivers
//!   behind them, the model registry and full mock drivers for tests.
//! - [`resource`] is the transport layer: VISA message-based I/O behind an
//!   async trait, with an optional auto-reconnect policy.
//! - [`state`] holds the shared run-time state and the cooperative stop and
//!   voltage-change signalling between engine and controller.
//! - [`data`] reads and writes the tab-delimited measurement files.
//! - [`remote`] exposes start/stop/change-voltage/state over a line-oriented
//!   TCP protocol.
//!
//! Real instrument I/O requires the `instrument_visa` feature; without it the
//! VISA transport reports a feature-not-enabled error and the mock bench is
//! the only way to run.

pub mod config;
pub mod data;
pub mod driver;
pub mod error;
pub mod estimate;
pub mod measurement;
pub mod range;
pub mod remote;
pub mod resource;
pub mod state;

pub use config::Settings;

use std::sync::Once;

static LOG_INIT: Once = Once::new();

/// Initializes env_logger once for embedding binaries and tests. Controlled
/// by `RUST_LOG`, defaulting to `info`.
pub fn init_logging() {
    LOG_INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_millis()
            .init();
    });
}

pub use error::{DaqError, DaqResult};
pub use estimate::Estimate;
pub use measurement::{
    event_channel, CvMeasurement, IvMeasurement, MeasurementEvent, RangeMeasurement,
};
pub use range::LinearRange;
pub use state::{ChangeVoltageRequest, MeasurementState, MeasurementType, StateHandle};
