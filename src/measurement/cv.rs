//! Capacitance-voltage measurement.

use super::{RangeMeasurement, Reading, ReadingAcquirer};
use crate::driver::{Role, RoleDriver};
use crate::state::{MeasurementType, StateHandle};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// Derived `1 / c²` channel used for Mott-Schottky plots. Yields `NaN` when
/// the capacitance is zero or non-finite so a bad reading never turns into an
/// infinity downstream.
pub fn inverse_square(capacity: f64) -> f64 {
    if capacity == 0.0 || !capacity.is_finite() {
        return f64::NAN;
    }
    1.0 / (capacity * capacity)
}

/// Acquires one CV sample: LCR capacitance plus the derived 1/c² channel,
/// optionally SMU bias current and DMM temperature.
#[derive(Debug, Default)]
pub struct CvAcquirer;

#[async_trait]
impl ReadingAcquirer for CvAcquirer {
    fn measurement_type(&self) -> MeasurementType {
        MeasurementType::Cv
    }

    async fn acquire(
        &mut self,
        contexts: &mut HashMap<Role, RoleDriver>,
        voltage: f64,
        continuous: bool,
    ) -> Result<Reading> {
        let mut reading = Reading::new(voltage);
        reading.continuous = continuous;
        if let Some(lcr) = contexts.get_mut(&Role::Lcr) {
            reading.c_lcr = lcr.read_capacity().await?;
            reading.c2_lcr = inverse_square(reading.c_lcr);
        }
        if let Some(smu) = contexts.get_mut(&Role::Smu) {
            reading.i_smu = smu.read_current().await?;
        }
        if let Some(dmm) = contexts.get_mut(&Role::Dmm) {
            reading.t_dmm = dmm.read_temperature().await?;
        }
        Ok(reading)
    }
}

pub type CvMeasurement = RangeMeasurement<CvAcquirer>;

impl CvMeasurement {
    pub fn cv(state: StateHandle, events: super::EventSender) -> Self {
        RangeMeasurement::new(state, events, CvAcquirer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::{MockBench, MockLcrMeter};

    #[test]
    fn test_inverse_square() {
        assert_eq!(inverse_square(2.0), 0.25);
        assert_eq!(inverse_square(1e-12), 1e24);
        assert!(inverse_square(0.0).is_nan());
        assert!(inverse_square(f64::NAN).is_nan());
        assert!(inverse_square(f64::INFINITY).is_nan());
    }

    #[tokio::test]
    async fn test_acquire_derives_c2_channel() {
        let bench = MockBench::default();
        bench.script_capacities([4.0e-12]);

        let mut contexts = HashMap::new();
        contexts.insert(
            Role::Lcr,
            RoleDriver::Lcr(Box::new(MockLcrMeter::new(&bench))),
        );

        let mut acquirer = CvAcquirer;
        let reading = acquirer.acquire(&mut contexts, 5.0, true).await.unwrap();
        assert_eq!(reading.c_lcr, 4.0e-12);
        assert_eq!(reading.c2_lcr, 1.0 / (4.0e-12 * 4.0e-12));
        assert!(reading.continuous);
        assert!(reading.i_smu.is_nan());
    }
}
