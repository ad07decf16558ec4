//! Instrument transport layer.
//!
//! A [`Transport`] brackets a physical connection to one instrument and
//! exposes the write/query/clear primitives every driver is built on. Faults
//! at this level are wrapped into [`DaqError::Resource`] carrying the resource
//! name; only those are considered retryable.
//!
//! Two implementations ship here:
//!
//! - [`VisaResource`]: real VISA I/O through the `visa-rs` crate, executed on
//!   Tokio's blocking pool. Only available with the `instrument_visa` feature;
//!   without it the type still exists but every operation reports the missing
//!   feature.
//! - [`AutoReconnect`]: decorator that retries connection-class failures by
//!   closing and reopening the underlying transport a fixed number of times
//!   with a fixed delay, then re-issuing the original operation. Protocol or
//!   semantic errors are never retried.

use crate::error::{is_connection_error, DaqError};
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Default number of reconnect attempts before giving up.
pub const RECONNECT_ATTEMPTS: usize = 3;
/// Default delay between reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Scoped-acquisition connection to a physical instrument.
///
/// `open()`/`close()` bracket the connection; all other operations require an
/// open transport. Implementations are exclusively owned by one measurement
/// run at a time.
#[async_trait]
pub trait Transport: Send {
    /// The resource identifier, e.g. `GPIB0::16::INSTR`.
    fn resource_name(&self) -> &str;

    async fn open(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    /// Sends a message, appending the configured termination.
    async fn write(&mut self, message: &str) -> Result<()>;

    /// Sends a message and reads back one response line, trimmed.
    async fn query(&mut self, message: &str) -> Result<String>;

    /// Issues a device clear.
    async fn clear(&mut self) -> Result<()>;
}

// ============================================================================
// VISA transport
// ============================================================================

/// VISA transport for GPIB/USB/Ethernet instruments.
///
/// Supports resource strings like:
/// - `GPIB0::16::INSTR` (GPIB interface)
/// - `TCPIP0::192.168.1.100::INSTR` (Ethernet/LXI)
/// - `USB0::0x1234::0x5678::SERIAL::INSTR` (USB)
pub struct VisaResource {
    resource_string: String,
    timeout: Duration,
    termination: String,
    #[cfg(feature = "instrument_visa")]
    session: Option<std::sync::Arc<std::sync::Mutex<visa_rs::Instrument>>>,
}

impl VisaResource {
    pub fn new(resource_string: impl Into<String>) -> Self {
        Self {
            resource_string: resource_string.into(),
            timeout: Duration::from_secs(4),
            termination: "\r\n".to_string(),
            #[cfg(feature = "instrument_visa")]
            session: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_termination(mut self, termination: impl Into<String>) -> Self {
        self.termination = termination.into();
        self
    }
}

#[cfg(feature = "instrument_visa")]
mod visa_enabled {
    use super::*;
    use anyhow::Context;
    use std::ffi::CString;
    use std::io::{Read, Write as IoWrite};
    use std::sync::{Arc, Mutex};
    use visa_rs::enums::attribute::AttrTmoValue;

    fn fault(resource: &str, err: impl ToString) -> anyhow::Error {
        DaqError::resource(resource, err.to_string()).into()
    }

    #[async_trait]
    impl Transport for VisaResource {
        fn resource_name(&self) -> &str {
            &self.resource_string
        }

        async fn open(&mut self) -> Result<()> {
            let resource = self.resource_string.clone();
            let timeout_ms = self.timeout.as_millis() as u32;

            // Blocking VISA calls run on the dedicated blocking pool so the
            // runtime is never stalled by a slow GPIB round-trip.
            let session = tokio::task::spawn_blocking(move || {
                let rm = visa_rs::DefaultRM::new()
                    .map_err(|e| fault(&resource, format!("resource manager: {e}")))?;
                let c_string = CString::new(resource.as_str())
                    .context("invalid resource string")?;
                let session = rm
                    .open(
                        &visa_rs::VisaString::from(c_string),
                        visa_rs::flags::AccessMode::NO_LOCK,
                        visa_rs::TIMEOUT_IMMEDIATE,
                    )
                    .map_err(|e| fault(&resource, e))?;
                // The open timeout above only bounds session creation; reads
                // and writes are bounded by the session TMO attribute.
                let tmo = AttrTmoValue::new_checked(timeout_ms)
                    .ok_or_else(|| fault(&resource, format!("invalid timeout {timeout_ms} ms")))?;
                session
                    .set_attr(tmo.into())
                    .map_err(|e| fault(&resource, format!("set timeout: {e}")))?;
                Ok::<_, anyhow::Error>(session)
            })
            .await
            .context("VISA open task panicked")??;

            self.session = Some(Arc::new(Mutex::new(session)));
            log::debug!(
                "VISA resource '{}' opened with {} ms timeout",
                self.resource_string,
                self.timeout.as_millis()
            );
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            if self.session.take().is_some() {
                log::debug!("VISA resource '{}' closed", self.resource_string);
            }
            Ok(())
        }

        async fn write(&mut self, message: &str) -> Result<()> {
            let session = self
                .session
                .as_ref()
                .ok_or_else(|| fault(&self.resource_string, "not open"))?
                .clone();
            let resource = self.resource_string.clone();
            let payload = format!("{}{}", message, self.termination);

            tokio::task::spawn_blocking(move || {
                let mut guard = session
                    .lock()
                    .map_err(|_| fault(&resource, "session poisoned"))?;
                guard
                    .write_all(payload.as_bytes())
                    .map_err(|e| fault(&resource, e))?;
                Ok(())
            })
            .await
            .context("VISA write task panicked")?
        }

        async fn query(&mut self, message: &str) -> Result<String> {
            let session = self
                .session
                .as_ref()
                .ok_or_else(|| fault(&self.resource_string, "not open"))?
                .clone();
            let resource = self.resource_string.clone();
            let payload = format!("{}{}", message, self.termination);

            tokio::task::spawn_blocking(move || {
                let mut guard = session
                    .lock()
                    .map_err(|_| fault(&resource, "session poisoned"))?;
                guard
                    .write_all(payload.as_bytes())
                    .map_err(|e| fault(&resource, e))?;
                let mut buf = [0u8; 4096];
                let n = guard.read(&mut buf).map_err(|e| fault(&resource, e))?;
                Ok(String::from_utf8_lossy(&buf[..n]).trim().to_string())
            })
            .await
            .context("VISA query task panicked")?
        }

        async fn clear(&mut self) -> Result<()> {
            let session = self
                .session
                .as_ref()
                .ok_or_else(|| fault(&self.resource_string, "not open"))?
                .clone();
            let resource = self.resource_string.clone();

            // viClear reaches a wedged listener where a buffered command
            // cannot; *CLS stays as the fallback for bridges that reject it.
            let cleared = tokio::task::spawn_blocking(move || {
                let guard = session
                    .lock()
                    .map_err(|_| fault(&resource, "session poisoned"))?;
                guard.clear().map_err(|e| fault(&resource, e))
            })
            .await
            .context("VISA clear task panicked")?;

            match cleared {
                Ok(()) => Ok(()),
                Err(err) => {
                    log::warn!(
                        "device clear on '{}' failed ({err:#}), sending *CLS",
                        self.resource_string
                    );
                    self.write("*CLS").await
                }
            }
        }
    }
}

#[cfg(not(feature = "instrument_visa"))]
#[async_trait]
impl Transport for VisaResource {
    fn resource_name(&self) -> &str {
        &self.resource_string
    }

    async fn open(&mut self) -> Result<()> {
        Err(DaqError::FeatureNotEnabled("instrument_visa".into()).into())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write(&mut self, _message: &str) -> Result<()> {
        Err(DaqError::FeatureNotEnabled("instrument_visa".into()).into())
    }

    async fn query(&mut self, _message: &str) -> Result<String> {
        Err(DaqError::FeatureNotEnabled("instrument_visa".into()).into())
    }

    async fn clear(&mut self) -> Result<()> {
        Err(DaqError::FeatureNotEnabled("instrument_visa".into()).into())
    }
}

// ============================================================================
// Auto-reconnect decorator
// ============================================================================

/// Retries connection-class transport faults with a close/reopen cycle.
///
/// On each retry the connection is closed, reopened, and the original
/// operation re-issued. Semantic errors (instrument error queue, parse
/// failures) surface immediately.
pub struct AutoReconnect {
    inner: Box<dyn Transport>,
    attempts: usize,
    delay: Duration,
}

impl AutoReconnect {
    pub fn new(inner: Box<dyn Transport>) -> Self {
        Self {
            inner,
            attempts: RECONNECT_ATTEMPTS,
            delay: RECONNECT_DELAY,
        }
    }

    pub fn with_attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    async fn reconnect(&mut self, attempt: usize) -> Result<()> {
        log::warn!(
            "reconnecting '{}' (attempt {}/{})",
            self.inner.resource_name(),
            attempt,
            self.attempts
        );
        let _ = self.inner.close().await;
        tokio::time::sleep(self.delay).await;
        self.inner.open().await
    }
}

#[async_trait]
impl Transport for AutoReconnect {
    fn resource_name(&self) -> &str {
        self.inner.resource_name()
    }

    async fn open(&mut self) -> Result<()> {
        self.inner.open().await
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }

    async fn write(&mut self, message: &str) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.inner.write(message).await {
                Ok(value) => return Ok(value),
                Err(err) if is_connection_error(&err) && attempt + 1 < self.attempts => {
                    attempt += 1;
                    self.reconnect(attempt).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn query(&mut self, message: &str) -> Result<String> {
        let mut attempt = 0;
        loop {
            match self.inner.query(message).await {
                Ok(value) => return Ok(value),
                Err(err) if is_connection_error(&err) && attempt + 1 < self.attempts => {
                    attempt += 1;
                    self.reconnect(attempt).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn clear(&mut self) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.inner.clear().await {
                Ok(value) => return Ok(value),
                Err(err) if is_connection_error(&err) && attempt + 1 < self.attempts => {
                    attempt += 1;
                    self.reconnect(attempt).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

// ============================================================================
// Mock transport
// ============================================================================

/// In-memory transport used by driver tests.
///
/// Queries pop scripted responses in FIFO order; all traffic is recorded for
/// later assertions. Optional failure injection drops the "connection" for a
/// given number of operations to exercise the reconnect policy.
#[derive(Default)]
pub struct MockTransport {
    name: String,
    open: bool,
    pub writes: Vec<String>,
    pub responses: std::collections::VecDeque<String>,
    pub fail_next: usize,
    pub open_count: usize,
}

impl MockTransport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn push_response(&mut self, response: impl Into<String>) -> &mut Self {
        self.responses.push_back(response.into());
        self
    }

    fn check_fault(&mut self) -> Result<()> {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(DaqError::resource(&self.name, "simulated connection loss").into());
        }
        if !self.open {
            return Err(DaqError::resource(&self.name, "not open").into());
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn resource_name(&self) -> &str {
        &self.name
    }

    async fn open(&mut self) -> Result<()> {
        self.open = true;
        self.open_count += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    async fn write(&mut self, message: &str) -> Result<()> {
        self.check_fault()?;
        self.writes.push(message.to_string());
        Ok(())
    }

    async fn query(&mut self, message: &str) -> Result<String> {
        self.check_fault()?;
        self.writes.push(message.to_string());
        self.responses
            .pop_front()
            .ok_or_else(|| DaqError::resource(&self.name, "no scripted response").into())
    }

    async fn clear(&mut self) -> Result<()> {
        self.check_fault()?;
        self.writes.push("<clear>".to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_transport_scripting() {
        let mut transport = MockTransport::new("GPIB0::16::INSTR");
        transport.open().await.unwrap();
        transport.push_response("KEITHLEY,2410,1,1.0");

        transport.write(":SOUR:VOLT 1.0").await.unwrap();
        let idn = transport.query("*IDN?").await.unwrap();
        assert_eq!(idn, "KEITHLEY,2410,1,1.0");
        assert_eq!(transport.writes, vec![":SOUR:VOLT 1.0", "*IDN?"]);

        // Exhausted script is a resource fault, not a panic.
        assert!(transport.query("*IDN?").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_reconnect_retries_connection_faults() {
        let mut inner = MockTransport::new("GPIB0::7::INSTR");
        inner.open = true;
        inner.fail_next = 2;
        inner.push_response("ok");

        let mut transport = AutoReconnect::new(Box::new(inner));
        let response = transport.query("READ?").await.unwrap();
        assert_eq!(response, "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_reconnect_gives_up_after_attempts() {
        let mut inner = MockTransport::new("GPIB0::7::INSTR");
        inner.open = true;
        inner.fail_next = 10;

        let mut transport = AutoReconnect::new(Box::new(inner)).with_attempts(3);
        assert!(transport.write("*RST").await.is_err());
    }
}
