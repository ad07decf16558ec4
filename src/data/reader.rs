//! Output file reader.
//!
//! Parses the format written by [`super::writer::OutputWriter`] back into
//! metadata plus ordered row maps, one per table. Unit suffixes in bracket
//! notation are stripped from both metadata keys and column names, so a
//! `voltage[V]` column comes back as `voltage`.

use anyhow::{bail, Context, Result};
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;

/// One parsed measurement file.
#[derive(Clone, Debug, Default)]
pub struct OutputFile {
    pub metadata: HashMap<String, String>,
    /// Main sweep rows, keyed by unit-stripped column name, in file order.
    pub ramp: Vec<HashMap<String, f64>>,
    /// Continuous rows, empty for non-continuous runs.
    pub continuous: Vec<HashMap<String, f64>>,
}

pub fn read_file(path: impl AsRef<Path>) -> Result<OutputFile> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading measurement file {path:?}"))?;
    parse(&text).with_context(|| format!("parsing measurement file {path:?}"))
}

/// Strips a trailing `[unit]` suffix.
fn strip_unit(name: &str, unit_re: &Regex) -> String {
    unit_re.replace(name, "").trim().to_string()
}

fn parse(text: &str) -> Result<OutputFile> {
    // Compiled per parse; file imports are rare and operator-driven.
    #[allow(clippy::unwrap_used)]
    let unit_re = Regex::new(r"\[[^\]]*\]\s*$").unwrap();

    let mut file = OutputFile::default();
    let mut lines = text.lines().peekable();

    // Metadata block runs to the first blank line.
    for line in lines.by_ref() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            break;
        }
        let Some((key, value)) = line.split_once(':') else {
            bail!("malformed metadata line '{line}'");
        };
        file.metadata
            .insert(strip_unit(key.trim(), &unit_re), value.trim().to_string());
    }

    // Remaining content is tables: a tab-separated header then data rows,
    // separated by blank lines. First table is the sweep, second continuous.
    let mut tables: Vec<Vec<HashMap<String, f64>>> = Vec::new();
    let mut columns: Option<Vec<String>> = None;
    for line in lines {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            columns = None;
            continue;
        }
        match &columns {
            None => {
                let names = line
                    .split('\t')
                    .map(|name| strip_unit(name, &unit_re))
                    .collect::<Vec<_>>();
                columns = Some(names);
                tables.push(Vec::new());
            }
            Some(names) => {
                let fields: Vec<&str> = line.split('\t').collect();
                if fields.len() != names.len() {
                    bail!(
                        "row has {} fields, expected {}: '{line}'",
                        fields.len(),
                        names.len()
                    );
                }
                let mut row = HashMap::new();
                for (name, field) in names.iter().zip(fields) {
                    row.insert(name.clone(), parse_value(field)?);
                }
                // A header was just seen, so a table exists.
                if let Some(table) = tables.last_mut() {
                    table.push(row);
                }
            }
        }
    }

    let mut tables = tables.into_iter();
    file.ramp = tables.next().unwrap_or_default();
    file.continuous = tables.next().unwrap_or_default();
    Ok(file)
}

fn parse_value(field: &str) -> Result<f64> {
    if field.eq_ignore_ascii_case("nan") {
        return Ok(f64::NAN);
    }
    field
        .parse::<f64>()
        .with_context(|| format!("malformed numeric field '{field}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "sample: D42\r\n\
        measurement_type: iv\r\n\
        voltage_begin[V]: 0\r\n\
        voltage_end[V]: -100\r\n\
        current_compliance[A]: 1E-6\r\n\
        \r\n\
        timestamp[s]\tvoltage[V]\ti_smu[A]\ti_elm[A]\tt_dmm[degC]\r\n\
        100.00\t+0.000E0\t+1.000E-9\tnan\t+2.350E1\r\n\
        101.00\t-1.000E1\t+2.000E-9\tnan\t+2.350E1\r\n\
        \r\n\
        timestamp[s]\ti_smu[A]\r\n\
        102.00\t+2.100E-9\r\n";

    #[test]
    fn test_round_trip_of_written_format() {
        let file = parse(SAMPLE).unwrap();
        assert_eq!(file.metadata["sample"], "D42");
        assert_eq!(file.metadata["voltage_end"], "-100");
        assert_eq!(file.ramp.len(), 2);
        assert_eq!(file.continuous.len(), 1);

        let first = &file.ramp[0];
        assert_eq!(first["timestamp"], 100.0);
        assert_eq!(first["voltage"], 0.0);
        assert_eq!(first["i_smu"], 1.0e-9);
        assert!(first["i_elm"].is_nan());
        assert_eq!(file.continuous[0]["i_smu"], 2.1e-9);
    }

    #[test]
    fn test_no_continuous_table() {
        let text = "sample: x\r\n\r\ntimestamp[s]\tvoltage[V]\r\n1.00\t+1.000E0\r\n";
        let file = parse(text).unwrap();
        assert_eq!(file.ramp.len(), 1);
        assert!(file.continuous.is_empty());
    }

    #[test]
    fn test_field_count_mismatch_is_an_error() {
        let text = "sample: x\r\n\r\ntimestamp[s]\tvoltage[V]\r\n1.00\r\n";
        assert!(parse(text).is_err());
    }

    #[test]
    fn test_malformed_metadata_is_an_error() {
        assert!(parse("no separator here\r\n\r\n").is_err());
    }
}
