//! Point-in-time samples emitted by the measurement engine.

use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

/// One immutable sample.
///
/// Channels that are not wired for the current run report `NaN`, never
/// absence; downstream consumers treat `NaN` as "no such channel". JSON
/// serialization turns non-finite values into null.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Reading {
    /// Seconds since epoch.
    pub timestamp: f64,
    /// The presently commanded (or read back) source voltage.
    pub voltage: f64,
    pub i_smu: f64,
    pub i_elm: f64,
    pub c_lcr: f64,
    /// Derived `1 / c_lcr²`, `NaN` when the capacitance is zero or
    /// non-finite.
    pub c2_lcr: f64,
    pub t_dmm: f64,
    /// True when taken inside the continuous acquisition loop.
    pub continuous: bool,
}

impl Reading {
    pub fn new(voltage: f64) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Self {
            timestamp,
            voltage,
            i_smu: f64::NAN,
            i_elm: f64::NAN,
            c_lcr: f64::NAN,
            c2_lcr: f64::NAN,
            t_dmm: f64::NAN,
            continuous: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwired_channels_are_nan() {
        let reading = Reading::new(1.5);
        assert_eq!(reading.voltage, 1.5);
        assert!(reading.i_smu.is_nan());
        assert!(reading.c_lcr.is_nan());
        assert!(reading.t_dmm.is_nan());
        assert!(!reading.continuous);
        assert!(reading.timestamp > 1.0e9);
    }

    #[test]
    fn test_json_renders_nan_as_null() {
        let reading = Reading::new(0.0);
        let json = serde_json::to_value(reading).unwrap();
        assert_eq!(json["i_smu"], serde_json::Value::Null);
        assert_eq!(json["voltage"], serde_json::json!(0.0));
    }
}
