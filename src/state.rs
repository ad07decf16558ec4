//! Run-time measurement state shared between the engine and its caller.
//!
//! A [`MeasurementState`] is created once per application session and mutated
//! throughout; the engine and the controller share it through a cloneable
//! [`StateHandle`]. The stop flag lives outside the mutex as an atomic so the
//! engine can poll it at every suspension point without contention, and the
//! pending continuous voltage-change request is consumed with a
//! read-then-clear under the lock so only one request ever executes.

use crate::driver::Role;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasurementType {
    Iv,
    Cv,
}

impl MeasurementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeasurementType::Iv => "iv",
            MeasurementType::Cv => "cv",
        }
    }
}

impl fmt::Display for MeasurementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transient request to change the source voltage during continuous
/// acquisition. A new request overwrites a pending one; requests never queue.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeVoltageRequest {
    pub end_voltage: f64,
    #[serde(default = "default_step_voltage")]
    pub step_voltage: f64,
    #[serde(default = "default_waiting_time")]
    pub waiting_time: f64,
}

fn default_step_voltage() -> f64 {
    1.0
}

fn default_waiting_time() -> f64 {
    1.0
}

/// Per-role instrument configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RoleConfig {
    pub enabled: bool,
    pub model: String,
    pub resource_name: String,
    #[serde(default)]
    pub visa_library: String,
    #[serde(default = "default_termination")]
    pub termination: String,
    /// Transport timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    /// Model-specific configuration passed through to the driver.
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
}

fn default_termination() -> String {
    "\r\n".to_string()
}

fn default_timeout() -> f64 {
    4.0
}

/// Live channel values updated by the engine during a run.
///
/// Missing/unavailable channels report `NaN`, never absence.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct LiveValues {
    #[serde(serialize_with = "nan_as_null")]
    pub source_voltage: f64,
    pub source_output_state: Option<bool>,
    #[serde(serialize_with = "nan_as_null")]
    pub smu_current: f64,
    #[serde(serialize_with = "nan_as_null")]
    pub elm_current: f64,
    #[serde(serialize_with = "nan_as_null")]
    pub lcr_capacity: f64,
    #[serde(serialize_with = "nan_as_null")]
    pub lcr_capacity_c2: f64,
    #[serde(serialize_with = "nan_as_null")]
    pub dmm_temperature: f64,
}

impl Default for LiveValues {
    fn default() -> Self {
        Self {
            source_voltage: f64::NAN,
            source_output_state: None,
            smu_current: f64::NAN,
            elm_current: f64::NAN,
            lcr_capacity: f64::NAN,
            lcr_capacity_c2: f64::NAN,
            dmm_temperature: f64::NAN,
        }
    }
}

/// Serializes non-finite floats as JSON null so strict parsers on the remote
/// side never see a bare `NaN` literal.
fn nan_as_null<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if value.is_finite() {
        serializer.serialize_f64(*value)
    } else {
        serializer.serialize_none()
    }
}

/// The mutable run configuration and live state for one measurement session.
#[derive(Clone, Debug)]
pub struct MeasurementState {
    pub measurement_type: MeasurementType,
    pub sample: String,
    /// Seconds since epoch, set at run start.
    pub timestamp: f64,

    pub continuous: bool,
    /// Issue an instrument reset before configure.
    pub reset: bool,
    pub auto_reconnect: bool,

    pub voltage_begin: f64,
    pub voltage_end: f64,
    pub voltage_step: f64,
    /// Settle time per ramp step, seconds.
    pub waiting_time: f64,
    /// Wait between continuous readings, seconds.
    pub waiting_time_continuous: f64,

    pub current_compliance: f64,
    /// When false, a compliance trip aborts the run.
    pub continue_in_compliance: bool,

    pub roles: HashMap<Role, RoleConfig>,
    /// The role acting as voltage source. Must be present and enabled before
    /// a run starts.
    pub source: Option<Role>,

    pub live: LiveValues,
    pub change_voltage_continuous: Option<ChangeVoltageRequest>,
    pub filename: Option<PathBuf>,
}

impl Default for MeasurementState {
    fn default() -> Self {
        Self {
            measurement_type: MeasurementType::Iv,
            sample: String::new(),
            timestamp: 0.0,
            continuous: false,
            reset: false,
            auto_reconnect: false,
            voltage_begin: 0.0,
            voltage_end: 0.0,
            voltage_step: 0.0,
            waiting_time: 1.0,
            waiting_time_continuous: 1.0,
            current_compliance: 1e-6,
            continue_in_compliance: false,
            roles: HashMap::new(),
            source: None,
            live: LiveValues::default(),
            change_voltage_continuous: None,
            filename: None,
        }
    }
}

impl MeasurementState {
    pub fn role(&self, role: Role) -> Option<&RoleConfig> {
        self.roles.get(&role)
    }
}

/// Snapshot of the state for the remote-control `state` operation.
#[derive(Clone, Debug, Serialize)]
pub struct StateSnapshot {
    pub measurement_type: MeasurementType,
    pub sample: String,
    pub timestamp: f64,
    pub continuous: bool,
    pub stop_requested: bool,
    pub voltage_begin: f64,
    pub voltage_end: f64,
    pub voltage_step: f64,
    pub waiting_time: f64,
    pub waiting_time_continuous: f64,
    pub current_compliance: f64,
    pub continue_in_compliance: bool,
    pub source: Option<Role>,
    #[serde(flatten)]
    pub live: LiveValues,
    pub filename: Option<String>,
}

struct Inner {
    stop: AtomicBool,
    data: Mutex<MeasurementState>,
}

/// Cloneable handle to the shared measurement state.
#[derive(Clone)]
pub struct StateHandle {
    inner: Arc<Inner>,
}

impl StateHandle {
    pub fn new(state: MeasurementState) -> Self {
        Self {
            inner: Arc::new(Inner {
                stop: AtomicBool::new(false),
                data: Mutex::new(state),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MeasurementState> {
        // A poisoned state mutex means a panic mid-update; there is no sane
        // way to continue a measurement from that.
        #[allow(clippy::unwrap_used)]
        self.inner.data.lock().unwrap()
    }

    /// Reads from the state under the lock.
    pub fn read<R>(&self, f: impl FnOnce(&MeasurementState) -> R) -> R {
        f(&self.lock())
    }

    /// Mutates the state under the lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut MeasurementState) -> R) -> R {
        f(&mut self.lock())
    }

    // --- stop flag --------------------------------------------------------

    /// True once [`request_stop`](Self::request_stop) was called for the
    /// current run. Polled by the engine at every natural suspension point.
    pub fn stop_requested(&self) -> bool {
        self.inner.stop.load(Ordering::Relaxed)
    }

    pub fn request_stop(&self) {
        self.inner.stop.store(true, Ordering::Relaxed);
    }

    /// Clears the stop flag. Only the controller calls this, between runs;
    /// the flag is never reset while a run is active.
    pub fn clear_stop(&self) {
        self.inner.stop.store(false, Ordering::Relaxed);
    }

    // --- run bookkeeping --------------------------------------------------

    /// Stamps the run start time.
    pub fn mark_run_started(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        self.lock().timestamp = now;
    }

    // --- change-voltage request -------------------------------------------

    /// Stores a pending voltage-change request, overwriting any previous one.
    pub fn request_change_voltage(&self, request: ChangeVoltageRequest) {
        self.lock().change_voltage_continuous = Some(request);
    }

    /// Consumes the pending request, if any. Read-then-clear is atomic under
    /// the state lock.
    pub fn take_change_voltage(&self) -> Option<ChangeVoltageRequest> {
        self.lock().change_voltage_continuous.take()
    }

    // --- live values ------------------------------------------------------

    pub fn set_source_voltage(&self, voltage: f64) {
        self.lock().live.source_voltage = voltage;
    }

    pub fn source_voltage(&self) -> f64 {
        self.lock().live.source_voltage
    }

    pub fn set_output_state(&self, enabled: Option<bool>) {
        self.lock().live.source_output_state = enabled;
    }

    /// Resets all live channel values to unset/NaN.
    pub fn clear_live(&self) {
        self.lock().live = LiveValues::default();
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let state = self.lock();
        StateSnapshot {
            measurement_type: state.measurement_type,
            sample: state.sample.clone(),
            timestamp: state.timestamp,
            continuous: state.continuous,
            stop_requested: self.inner.stop.load(Ordering::Relaxed),
            voltage_begin: state.voltage_begin,
            voltage_end: state.voltage_end,
            voltage_step: state.voltage_step,
            waiting_time: state.waiting_time,
            waiting_time_continuous: state.waiting_time_continuous,
            current_compliance: state.current_compliance,
            continue_in_compliance: state.continue_in_compliance,
            source: state.source,
            live: state.live,
            filename: state
                .filename
                .as_ref()
                .map(|p| p.display().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_flag_set_once() {
        let handle = StateHandle::new(MeasurementState::default());
        assert!(!handle.stop_requested());
        handle.request_stop();
        handle.request_stop();
        assert!(handle.stop_requested());
        handle.clear_stop();
        assert!(!handle.stop_requested());
    }

    #[test]
    fn test_change_voltage_read_then_clear() {
        let handle = StateHandle::new(MeasurementState::default());
        assert!(handle.take_change_voltage().is_none());

        handle.request_change_voltage(ChangeVoltageRequest {
            end_voltage: -10.0,
            step_voltage: 1.0,
            waiting_time: 0.5,
        });
        // A second request overwrites, never queues.
        handle.request_change_voltage(ChangeVoltageRequest {
            end_voltage: 5.0,
            step_voltage: 2.0,
            waiting_time: 1.0,
        });

        let request = handle.take_change_voltage().unwrap();
        assert_eq!(request.end_voltage, 5.0);
        assert!(handle.take_change_voltage().is_none());
    }

    #[test]
    fn test_snapshot_serializes_nan_as_null() {
        let handle = StateHandle::new(MeasurementState::default());
        let json = serde_json::to_value(handle.snapshot()).unwrap();
        assert_eq!(json["source_voltage"], serde_json::Value::Null);
        assert_eq!(json["smu_current"], serde_json::Value::Null);

        handle.set_source_voltage(2.5);
        let json = serde_json::to_value(handle.snapshot()).unwrap();
        assert_eq!(json["source_voltage"], serde_json::json!(2.5));
    }

    #[test]
    fn test_change_request_defaults_from_json() {
        let request: ChangeVoltageRequest =
            serde_json::from_value(serde_json::json!({ "end_voltage": 3.0 })).unwrap();
        assert_eq!(request.step_voltage, 1.0);
        assert_eq!(request.waiting_time, 1.0);
    }

    #[test]
    fn test_mark_run_started_sets_epoch_timestamp() {
        let handle = StateHandle::new(MeasurementState::default());
        handle.mark_run_started();
        let timestamp = handle.read(|s| s.timestamp);
        assert!(timestamp > 1.0e9);
    }
}
