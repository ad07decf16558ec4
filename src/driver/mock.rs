//! Mock instrument drivers.
//!
//! Used by the engine tests and available to downstream consumers for dry
//! runs without hardware. Each mock driver is backed by a [`MockBench`]
//! handle: tests keep a clone, script readings and injected faults on it, and
//! inspect the recorded traffic after the run.

use super::{Dmm, Driver, DriverOptions, Electrometer, InstrumentError, LcrMeter, SourceMeter, SwitchingMatrix};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Shared scripting/recording state behind every mock driver.
#[derive(Clone, Default)]
pub struct MockBench {
    inner: Arc<Mutex<BenchInner>>,
}

#[derive(Default)]
struct BenchInner {
    voltage: f64,
    output: bool,
    voltage_range: f64,
    compliance_level: f64,
    zero_check: bool,
    finalized: bool,
    voltages: Vec<f64>,
    ranges: Vec<f64>,
    currents: VecDeque<f64>,
    capacities: VecDeque<f64>,
    temperatures: VecDeque<f64>,
    errors: VecDeque<InstrumentError>,
    trip_at_read: Option<usize>,
    reads: usize,
    resets: usize,
    clears: usize,
    configures: usize,
    closed_channels: Vec<String>,
}

impl MockBench {
    fn lock(&self) -> std::sync::MutexGuard<'_, BenchInner> {
        // Mutex poisoning only happens if a test panicked while holding the
        // lock; propagating that as a second panic is what we want.
        #[allow(clippy::unwrap_used)]
        self.inner.lock().unwrap()
    }

    pub fn script_currents(&self, values: impl IntoIterator<Item = f64>) {
        self.lock().currents.extend(values);
    }

    pub fn script_capacities(&self, values: impl IntoIterator<Item = f64>) {
        self.lock().capacities.extend(values);
    }

    pub fn script_temperatures(&self, values: impl IntoIterator<Item = f64>) {
        self.lock().temperatures.extend(values);
    }

    pub fn push_error(&self, code: i32, message: &str) {
        self.lock().errors.push_back(InstrumentError {
            code,
            message: message.to_string(),
        });
    }

    /// Makes `compliance_tripped` report true from the n-th current read on.
    pub fn trip_at_read(&self, read: usize) {
        self.lock().trip_at_read = Some(read);
    }

    pub fn set_output(&self, enabled: bool) {
        self.lock().output = enabled;
    }

    pub fn set_voltage(&self, level: f64) {
        self.lock().voltage = level;
    }

    // --- inspection -------------------------------------------------------

    pub fn voltage(&self) -> f64 {
        self.lock().voltage
    }

    pub fn output(&self) -> bool {
        self.lock().output
    }

    /// Every voltage commanded on this bench, in order.
    pub fn voltages(&self) -> Vec<f64> {
        self.lock().voltages.clone()
    }

    pub fn ranges(&self) -> Vec<f64> {
        self.lock().ranges.clone()
    }

    pub fn compliance_level(&self) -> f64 {
        self.lock().compliance_level
    }

    pub fn zero_check(&self) -> bool {
        self.lock().zero_check
    }

    pub fn finalized(&self) -> bool {
        self.lock().finalized
    }

    pub fn resets(&self) -> usize {
        self.lock().resets
    }

    pub fn clears(&self) -> usize {
        self.lock().clears
    }

    pub fn configures(&self) -> usize {
        self.lock().configures
    }

    pub fn reads(&self) -> usize {
        self.lock().reads
    }

    pub fn closed_channels(&self) -> Vec<String> {
        self.lock().closed_channels.clone()
    }

    fn next_scripted(queue: &mut VecDeque<f64>, fallback: f64) -> f64 {
        // The last scripted value repeats so open-ended continuous loops
        // never run dry.
        if queue.len() > 1 {
            queue.pop_front().unwrap_or(fallback)
        } else {
            queue.front().copied().unwrap_or(fallback)
        }
    }
}

// ============================================================================
// Source meter
// ============================================================================

pub struct MockSourceMeter {
    bench: MockBench,
}

impl MockSourceMeter {
    pub fn new(bench: &MockBench) -> Self {
        Self {
            bench: bench.clone(),
        }
    }
}

#[async_trait]
impl Driver for MockSourceMeter {
    fn driver_type(&self) -> &'static str {
        "MockSMU"
    }

    async fn identify(&mut self) -> Result<String> {
        Ok("Mock Instruments Inc., Model SMU, 0, 1.0".to_string())
    }

    async fn reset(&mut self) -> Result<()> {
        self.bench.lock().resets += 1;
        Ok(())
    }

    async fn clear(&mut self) -> Result<()> {
        self.bench.lock().clears += 1;
        Ok(())
    }

    async fn next_error(&mut self) -> Result<Option<InstrumentError>> {
        Ok(self.bench.lock().errors.pop_front())
    }

    async fn configure(&mut self, _options: &DriverOptions) -> Result<()> {
        self.bench.lock().configures += 1;
        Ok(())
    }
}

#[async_trait]
impl SourceMeter for MockSourceMeter {
    async fn get_output_enabled(&mut self) -> Result<bool> {
        Ok(self.bench.lock().output)
    }

    async fn set_output_enabled(&mut self, enabled: bool) -> Result<()> {
        self.bench.lock().output = enabled;
        Ok(())
    }

    async fn get_voltage_level(&mut self) -> Result<f64> {
        Ok(self.bench.lock().voltage)
    }

    async fn set_voltage_level(&mut self, level: f64) -> Result<()> {
        let mut inner = self.bench.lock();
        inner.voltage = level;
        inner.voltages.push(level);
        Ok(())
    }

    async fn set_voltage_range(&mut self, level: f64) -> Result<()> {
        let mut inner = self.bench.lock();
        inner.voltage_range = level;
        inner.ranges.push(level);
        Ok(())
    }

    async fn set_current_compliance_level(&mut self, level: f64) -> Result<()> {
        self.bench.lock().compliance_level = level;
        Ok(())
    }

    async fn compliance_tripped(&mut self) -> Result<bool> {
        let inner = self.bench.lock();
        Ok(inner
            .trip_at_read
            .map(|read| inner.reads >= read)
            .unwrap_or(false))
    }

    async fn read_current(&mut self) -> Result<f64> {
        let mut inner = self.bench.lock();
        inner.reads += 1;
        let value = MockBench::next_scripted(&mut inner.currents, 1e-9);
        Ok(value)
    }
}

// ============================================================================
// Electrometer
// ============================================================================

pub struct MockElectrometer {
    meter: MockSourceMeter,
}

impl MockElectrometer {
    pub fn new(bench: &MockBench) -> Self {
        Self {
            meter: MockSourceMeter::new(bench),
        }
    }
}

#[async_trait]
impl Driver for MockElectrometer {
    fn driver_type(&self) -> &'static str {
        "MockELM"
    }

    async fn identify(&mut self) -> Result<String> {
        Ok("Mock Instruments Inc., Model ELM, 0, 1.0".to_string())
    }

    async fn reset(&mut self) -> Result<()> {
        self.meter.reset().await
    }

    async fn clear(&mut self) -> Result<()> {
        self.meter.clear().await
    }

    async fn next_error(&mut self) -> Result<Option<InstrumentError>> {
        self.meter.next_error().await
    }

    async fn configure(&mut self, options: &DriverOptions) -> Result<()> {
        self.meter.configure(options).await
    }
}

#[async_trait]
impl SourceMeter for MockElectrometer {
    async fn get_output_enabled(&mut self) -> Result<bool> {
        self.meter.get_output_enabled().await
    }

    async fn set_output_enabled(&mut self, enabled: bool) -> Result<()> {
        self.meter.set_output_enabled(enabled).await
    }

    async fn get_voltage_level(&mut self) -> Result<f64> {
        self.meter.get_voltage_level().await
    }

    async fn set_voltage_level(&mut self, level: f64) -> Result<()> {
        self.meter.set_voltage_level(level).await
    }

    async fn set_voltage_range(&mut self, level: f64) -> Result<()> {
        self.meter.set_voltage_range(level).await
    }

    async fn set_current_compliance_level(&mut self, level: f64) -> Result<()> {
        self.meter.set_current_compliance_level(level).await
    }

    async fn compliance_tripped(&mut self) -> Result<bool> {
        self.meter.compliance_tripped().await
    }

    async fn read_current(&mut self) -> Result<f64> {
        self.meter.read_current().await
    }
}

#[async_trait]
impl Electrometer for MockElectrometer {
    async fn set_zero_check_enabled(&mut self, enabled: bool) -> Result<()> {
        self.meter.bench.lock().zero_check = enabled;
        Ok(())
    }
}

// ============================================================================
// LCR meter
// ============================================================================

pub struct MockLcrMeter {
    meter: MockSourceMeter,
}

impl MockLcrMeter {
    pub fn new(bench: &MockBench) -> Self {
        Self {
            meter: MockSourceMeter::new(bench),
        }
    }
}

#[async_trait]
impl Driver for MockLcrMeter {
    fn driver_type(&self) -> &'static str {
        "MockLCR"
    }

    async fn identify(&mut self) -> Result<String> {
        Ok("Mock Instruments Inc., Model LCR, 0, 1.0".to_string())
    }

    async fn reset(&mut self) -> Result<()> {
        self.meter.reset().await
    }

    async fn clear(&mut self) -> Result<()> {
        self.meter.clear().await
    }

    async fn next_error(&mut self) -> Result<Option<InstrumentError>> {
        self.meter.next_error().await
    }

    async fn configure(&mut self, options: &DriverOptions) -> Result<()> {
        self.meter.configure(options).await
    }
}

#[async_trait]
impl SourceMeter for MockLcrMeter {
    async fn get_output_enabled(&mut self) -> Result<bool> {
        self.meter.get_output_enabled().await
    }

    async fn set_output_enabled(&mut self, enabled: bool) -> Result<()> {
        self.meter.set_output_enabled(enabled).await
    }

    async fn get_voltage_level(&mut self) -> Result<f64> {
        self.meter.get_voltage_level().await
    }

    async fn set_voltage_level(&mut self, level: f64) -> Result<()> {
        self.meter.set_voltage_level(level).await
    }

    async fn set_voltage_range(&mut self, level: f64) -> Result<()> {
        self.meter.set_voltage_range(level).await
    }

    async fn set_current_compliance_level(&mut self, level: f64) -> Result<()> {
        self.meter.set_current_compliance_level(level).await
    }

    async fn compliance_tripped(&mut self) -> Result<bool> {
        self.meter.compliance_tripped().await
    }

    async fn read_current(&mut self) -> Result<f64> {
        self.meter.read_current().await
    }
}

#[async_trait]
impl LcrMeter for MockLcrMeter {
    async fn read_capacity(&mut self) -> Result<f64> {
        let mut inner = self.meter.bench.lock();
        let value = MockBench::next_scripted(&mut inner.capacities, 1e-12);
        Ok(value)
    }

    async fn finalize(&mut self) -> Result<()> {
        self.meter.bench.lock().finalized = true;
        Ok(())
    }
}

// ============================================================================
// DMM
// ============================================================================

#[derive(Default)]
pub struct MockDmm {
    bench: MockBench,
}

impl MockDmm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bench(bench: &MockBench) -> Self {
        Self {
            bench: bench.clone(),
        }
    }
}

#[async_trait]
impl Driver for MockDmm {
    fn driver_type(&self) -> &'static str {
        "MockDMM"
    }

    async fn identify(&mut self) -> Result<String> {
        Ok("Mock Instruments Inc., Model DMM, 0, 1.0".to_string())
    }

    async fn reset(&mut self) -> Result<()> {
        self.bench.lock().resets += 1;
        Ok(())
    }

    async fn clear(&mut self) -> Result<()> {
        self.bench.lock().clears += 1;
        Ok(())
    }

    async fn next_error(&mut self) -> Result<Option<InstrumentError>> {
        Ok(self.bench.lock().errors.pop_front())
    }

    async fn configure(&mut self, _options: &DriverOptions) -> Result<()> {
        self.bench.lock().configures += 1;
        Ok(())
    }
}

#[async_trait]
impl Dmm for MockDmm {
    async fn read_temperature(&mut self) -> Result<f64> {
        let mut inner = self.bench.lock();
        let value = MockBench::next_scripted(&mut inner.temperatures, 25.0);
        Ok(value)
    }
}

// ============================================================================
// Switching matrix
// ============================================================================

#[derive(Default)]
pub struct MockMatrix {
    bench: MockBench,
}

impl MockMatrix {
    pub fn new(bench: &MockBench) -> Self {
        Self {
            bench: bench.clone(),
        }
    }
}

#[async_trait]
impl Driver for MockMatrix {
    fn driver_type(&self) -> &'static str {
        "MockMatrix"
    }

    async fn identify(&mut self) -> Result<String> {
        Ok("Mock Instruments Inc., Model Matrix, 0, 1.0".to_string())
    }

    async fn reset(&mut self) -> Result<()> {
        self.bench.lock().resets += 1;
        Ok(())
    }

    async fn clear(&mut self) -> Result<()> {
        self.bench.lock().clears += 1;
        Ok(())
    }

    async fn next_error(&mut self) -> Result<Option<InstrumentError>> {
        Ok(self.bench.lock().errors.pop_front())
    }

    async fn configure(&mut self, _options: &DriverOptions) -> Result<()> {
        self.bench.lock().configures += 1;
        Ok(())
    }
}

#[async_trait]
impl SwitchingMatrix for MockMatrix {
    async fn close_channels(&mut self, channels: &[String]) -> Result<()> {
        let mut inner = self.bench.lock();
        for channel in channels {
            if !inner.closed_channels.contains(channel) {
                inner.closed_channels.push(channel.clone());
            }
        }
        Ok(())
    }

    async fn open_channels(&mut self, channels: &[String]) -> Result<()> {
        self.bench
            .lock()
            .closed_channels
            .retain(|c| !channels.contains(c));
        Ok(())
    }

    async fn open_all_channels(&mut self) -> Result<()> {
        self.bench.lock().closed_channels.clear();
        Ok(())
    }

    async fn closed_channels(&mut self) -> Result<Vec<String>> {
        Ok(self.bench.lock().closed_channels.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_currents_repeat_last_value() {
        let bench = MockBench::default();
        bench.script_currents([1.0, 2.0]);
        let mut smu = MockSourceMeter::new(&bench);

        assert_eq!(smu.read_current().await.unwrap(), 1.0);
        assert_eq!(smu.read_current().await.unwrap(), 2.0);
        assert_eq!(smu.read_current().await.unwrap(), 2.0);
        assert_eq!(bench.reads(), 3);
    }

    #[tokio::test]
    async fn test_compliance_trip_scripting() {
        let bench = MockBench::default();
        bench.trip_at_read(2);
        let mut smu = MockSourceMeter::new(&bench);

        assert!(!smu.compliance_tripped().await.unwrap());
        smu.read_current().await.unwrap();
        assert!(!smu.compliance_tripped().await.unwrap());
        smu.read_current().await.unwrap();
        assert!(smu.compliance_tripped().await.unwrap());
    }

    #[tokio::test]
    async fn test_matrix_channel_bookkeeping() {
        let bench = MockBench::default();
        let mut matrix = MockMatrix::new(&bench);
        matrix
            .close_channels(&["1A01".into(), "1B02".into()])
            .await
            .unwrap();
        matrix.open_channels(&["1A01".into()]).await.unwrap();
        assert_eq!(matrix.closed_channels().await.unwrap(), vec!["1B02"]);
        matrix.open_all_channels().await.unwrap();
        assert!(matrix.closed_channels().await.unwrap().is_empty());
    }
}
