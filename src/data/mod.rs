//! On-disk measurement format.
//!
//! Files are tab-delimited text with CRLF line endings: a `key: value`
//! metadata block terminated by a blank line, then one table per acquisition
//! phase. Each table is preceded by a blank line and starts with a
//! tab-separated column header whose names carry the unit in bracket
//! notation, e.g. `voltage[V]`.
//!
//! [`writer::OutputWriter`] produces the format from engine events;
//! [`reader`] parses it back into metadata plus ordered row maps.

pub mod reader;
pub mod writer;

pub use reader::{OutputFile, read_file};
pub use writer::OutputWriter;

use crate::state::MeasurementType;

pub const LINE_ENDING: &str = "\r\n";

/// Column headers of the main sweep table.
pub fn ramp_columns(measurement_type: MeasurementType) -> &'static [&'static str] {
    match measurement_type {
        MeasurementType::Iv => &[
            "timestamp[s]",
            "voltage[V]",
            "i_smu[A]",
            "i_elm[A]",
            "t_dmm[degC]",
        ],
        MeasurementType::Cv => &[
            "timestamp[s]",
            "voltage[V]",
            "c_lcr[F]",
            "c2_lcr[1/F^2]",
            "i_smu[A]",
            "t_dmm[degC]",
        ],
    }
}

/// Column headers of the continuous table. Reduced set: only the primary
/// channel is sampled at rate, everything else is in the sweep table.
pub fn continuous_columns(measurement_type: MeasurementType) -> &'static [&'static str] {
    match measurement_type {
        MeasurementType::Iv => &["timestamp[s]", "i_smu[A]"],
        MeasurementType::Cv => &["timestamp[s]", "c_lcr[F]"],
    }
}

/// Formats one channel value for the file. Non-finite values render as the
/// literal `nan` so reimport stays unambiguous.
pub fn format_value(value: f64) -> String {
    if value.is_finite() {
        format!("{value:+.3E}")
    } else {
        "nan".to_string()
    }
}

/// Timestamps keep sub-second resolution but stay readable.
pub fn format_timestamp(value: f64) -> String {
    format!("{value:.2}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_formatting() {
        assert_eq!(format_value(2.5e-9), "+2.500E-9");
        assert_eq!(format_value(-1.0), "-1.000E0");
        assert_eq!(format_value(f64::NAN), "nan");
        assert_eq!(format_value(f64::INFINITY), "nan");
        assert_eq!(format_timestamp(1724659200.125), "1724659200.13");
    }

    #[test]
    fn test_continuous_columns_are_reduced() {
        assert!(continuous_columns(MeasurementType::Iv).len() < ramp_columns(MeasurementType::Iv).len());
        assert_eq!(continuous_columns(MeasurementType::Iv)[1], "i_smu[A]");
        assert_eq!(continuous_columns(MeasurementType::Cv)[1], "c_lcr[F]");
    }
}
