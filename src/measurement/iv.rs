//! Current-voltage measurement.

use super::{RangeMeasurement, Reading, ReadingAcquirer};
use crate::driver::{Role, RoleDriver};
use crate::state::{MeasurementType, StateHandle};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// Acquires one IV sample: SMU current, optionally electrometer current and
/// DMM temperature.
#[derive(Debug, Default)]
pub struct IvAcquirer;

#[async_trait]
impl ReadingAcquirer for IvAcquirer {
    fn measurement_type(&self) -> MeasurementType {
        MeasurementType::Iv
    }

    async fn acquire(
        &mut self,
        contexts: &mut HashMap<Role, RoleDriver>,
        voltage: f64,
        continuous: bool,
    ) -> Result<Reading> {
        let mut reading = Reading::new(voltage);
        reading.continuous = continuous;
        if let Some(smu) = contexts.get_mut(&Role::Smu) {
            reading.i_smu = smu.read_current().await?;
        }
        if let Some(elm) = contexts.get_mut(&Role::Elm) {
            reading.i_elm = elm.read_current().await?;
        }
        if let Some(dmm) = contexts.get_mut(&Role::Dmm) {
            reading.t_dmm = dmm.read_temperature().await?;
        }
        Ok(reading)
    }
}

pub type IvMeasurement = RangeMeasurement<IvAcquirer>;

impl IvMeasurement {
    pub fn iv(state: StateHandle, events: super::EventSender) -> Self {
        RangeMeasurement::new(state, events, IvAcquirer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::{MockBench, MockDmm, MockSourceMeter};

    #[tokio::test]
    async fn test_acquire_reads_wired_roles_only() {
        let bench = MockBench::default();
        bench.script_currents([2.5e-9]);
        bench.script_temperatures([23.5]);

        let mut contexts = HashMap::new();
        contexts.insert(
            Role::Smu,
            RoleDriver::SourceMeter(Box::new(MockSourceMeter::new(&bench))),
        );
        contexts.insert(
            Role::Dmm,
            RoleDriver::Dmm(Box::new(MockDmm::with_bench(&bench))),
        );

        let mut acquirer = IvAcquirer;
        let reading = acquirer.acquire(&mut contexts, -10.0, false).await.unwrap();
        assert_eq!(reading.voltage, -10.0);
        assert_eq!(reading.i_smu, 2.5e-9);
        assert_eq!(reading.t_dmm, 23.5);
        assert!(reading.i_elm.is_nan());
        assert!(reading.c_lcr.is_nan());
    }
}
