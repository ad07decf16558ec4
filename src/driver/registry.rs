//! Driver registry.
//!
//! Maps an instrument model identifier from the role configuration onto a
//! driver constructor. Lookups are validated at configuration time so an
//! unknown model is a precondition fault before any instrument I/O, not a
//! crash deep in the ramp loop.

use super::scpi::{ScpiDmm, ScpiElectrometer, ScpiLcrMeter, ScpiMatrix, ScpiSourceMeter};
use super::RoleDriver;
use crate::error::{DaqError, DaqResult};
use crate::resource::Transport;

/// Instrument models with a driver in this build.
pub const SUPPORTED_MODELS: &[&str] = &[
    "K237", "K2410", "K2470", "K2657A", // source meters
    "K6514", "K6517B", // electrometers
    "E4980A", // LCR meters
    "K2700", // multimeters
    "K708B", // switching matrices
];

/// Returns true if `model` resolves to a driver.
pub fn is_supported(model: &str) -> bool {
    SUPPORTED_MODELS.contains(&model)
}

/// Constructs the driver for `model` over an already-configured transport.
///
/// The transport is not opened here; the measurement engine opens all
/// transports up front so a partial failure can still close what succeeded.
pub fn create_driver(model: &str, transport: Box<dyn Transport>) -> DaqResult<RoleDriver> {
    let driver = match model {
        "K237" => RoleDriver::SourceMeter(Box::new(ScpiSourceMeter::new("K237", transport))),
        "K2410" => RoleDriver::SourceMeter(Box::new(ScpiSourceMeter::new("K2410", transport))),
        "K2470" => RoleDriver::SourceMeter(Box::new(ScpiSourceMeter::new("K2470", transport))),
        "K2657A" => RoleDriver::SourceMeter(Box::new(ScpiSourceMeter::new("K2657A", transport))),
        "K6514" => RoleDriver::Electrometer(Box::new(ScpiElectrometer::new("K6514", transport))),
        "K6517B" => RoleDriver::Electrometer(Box::new(ScpiElectrometer::new("K6517B", transport))),
        "E4980A" => RoleDriver::Lcr(Box::new(ScpiLcrMeter::new("E4980A", transport))),
        "K2700" => RoleDriver::Dmm(Box::new(ScpiDmm::new("K2700", transport))),
        "K708B" => RoleDriver::Matrix(Box::new(ScpiMatrix::new("K708B", transport))),
        other => {
            return Err(DaqError::Precondition(format!(
                "no driver for model '{other}' (supported: {})",
                SUPPORTED_MODELS.join(", ")
            )))
        }
    };
    Ok(driver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::MockTransport;

    #[test]
    fn test_every_supported_model_constructs() {
        for model in SUPPORTED_MODELS {
            let transport = Box::new(MockTransport::new("GPIB0::1::INSTR"));
            assert!(create_driver(model, transport).is_ok(), "model {model}");
        }
    }

    #[test]
    fn test_unknown_model_is_precondition_fault() {
        let transport = Box::new(MockTransport::new("GPIB0::1::INSTR"));
        let err = create_driver("HP3458A", transport).unwrap_err();
        assert!(matches!(err, DaqError::Precondition(_)));
        assert!(err.to_string().contains("HP3458A"));
    }

    #[test]
    fn test_capability_mapping() {
        let make = |model: &str| {
            create_driver(model, Box::new(MockTransport::new("GPIB0::1::INSTR")))
                .expect("supported model")
        };
        assert!(make("K2410").is_source());
        assert!(make("K6517B").is_source());
        assert!(make("E4980A").is_source());
        assert!(!make("K2700").is_source());
        assert!(!make("K708B").is_source());
    }
}
