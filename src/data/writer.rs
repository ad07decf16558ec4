//! Output file writer.

use super::{continuous_columns, format_timestamp, format_value, ramp_columns, LINE_ENDING};
use crate::measurement::{MeasurementEvent, Reading};
use crate::state::{MeasurementType, StateHandle};
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Writes engine readings into the tab-delimited measurement file.
///
/// The writer is created per run against an output directory; `init` derives
/// the file name, creates the file with the metadata block and sweep table
/// header, and publishes the path into the shared state. Readings then append
/// as rows; the first continuous reading opens the continuous table.
pub struct OutputWriter {
    directory: PathBuf,
    path: PathBuf,
    measurement_type: MeasurementType,
    writer: Option<BufWriter<File>>,
    continuous_header_written: bool,
}

impl OutputWriter {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            path: PathBuf::new(),
            measurement_type: MeasurementType::Iv,
            writer: None,
            continuous_header_written: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the output file and writes the metadata block and sweep table
    /// header. Intended as a run-start hook, before any instrument I/O.
    pub fn init(&mut self, state: &StateHandle) -> Result<()> {
        if !self.directory.exists() {
            std::fs::create_dir_all(&self.directory).with_context(|| {
                format!("creating output directory {:?}", self.directory)
            })?;
        }

        let (sample, measurement_type) =
            state.read(|s| (s.sample.clone(), s.measurement_type));
        self.measurement_type = measurement_type;
        let stem = if sample.is_empty() {
            "unnamed"
        } else {
            sample.as_str()
        };
        let file_name = format!(
            "{}_{}_{}.txt",
            sanitize(stem),
            measurement_type,
            chrono::Local::now().format("%Y-%m-%dT%H-%M-%S")
        );
        self.path = self.directory.join(file_name);

        let file = File::create(&self.path)
            .with_context(|| format!("creating output file {:?}", self.path))?;
        self.writer = Some(BufWriter::new(file));
        self.continuous_header_written = false;
        state.update(|s| s.filename = Some(self.path.clone()));
        log::info!("writing output to '{}'", self.path.display());

        self.write_metadata(state)?;
        self.write_line(&ramp_columns(measurement_type).join("\t"))?;
        Ok(())
    }

    fn write_metadata(&mut self, state: &StateHandle) -> Result<()> {
        let lines = state.read(|s| {
            vec![
                format!("sample: {}", s.sample),
                format!("measurement_type: {}", s.measurement_type),
                format!("timestamp: {}", format_timestamp(s.timestamp)),
                format!("voltage_begin[V]: {}", s.voltage_begin),
                format!("voltage_end[V]: {}", s.voltage_end),
                format!("voltage_step[V]: {}", s.voltage_step),
                format!("waiting_time[s]: {}", s.waiting_time),
                format!("waiting_time_continuous[s]: {}", s.waiting_time_continuous),
                format!("current_compliance[A]: {:E}", s.current_compliance),
            ]
        });
        for line in lines {
            self.write_line(&line)?;
        }
        self.write_line("")?;
        Ok(())
    }

    /// Appends one reading. Sweep readings go to the sweep table; the first
    /// continuous reading closes it and opens the continuous table.
    pub fn write_reading(&mut self, reading: &Reading) -> Result<()> {
        if reading.continuous && !self.continuous_header_written {
            self.write_line("")?;
            self.write_line(&continuous_columns(self.measurement_type).join("\t"))?;
            self.continuous_header_written = true;
        }
        let row = if reading.continuous {
            self.continuous_row(reading)
        } else {
            self.ramp_row(reading)
        };
        self.write_line(&row)
    }

    fn ramp_row(&self, reading: &Reading) -> String {
        let mut fields = vec![
            format_timestamp(reading.timestamp),
            format_value(reading.voltage),
        ];
        match self.measurement_type {
            MeasurementType::Iv => {
                fields.push(format_value(reading.i_smu));
                fields.push(format_value(reading.i_elm));
            }
            MeasurementType::Cv => {
                fields.push(format_value(reading.c_lcr));
                fields.push(format_value(reading.c2_lcr));
                fields.push(format_value(reading.i_smu));
            }
        }
        fields.push(format_value(reading.t_dmm));
        fields.join("\t")
    }

    fn continuous_row(&self, reading: &Reading) -> String {
        let value = match self.measurement_type {
            MeasurementType::Iv => reading.i_smu,
            MeasurementType::Cv => reading.c_lcr,
        };
        format!(
            "{}\t{}",
            format_timestamp(reading.timestamp),
            format_value(value)
        )
    }

    /// Routes engine events: readings append, `Finished` flushes and closes.
    pub fn record(&mut self, event: &MeasurementEvent) -> Result<()> {
        match event {
            MeasurementEvent::Reading(reading) => self.write_reading(reading),
            MeasurementEvent::Finished => self.shutdown(),
            _ => Ok(()),
        }
    }

    pub fn shutdown(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().context("flushing output file")?;
        }
        Ok(())
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .context("output writer is not initialized")?;
        writer
            .write_all(line.as_bytes())
            .and_then(|_| writer.write_all(LINE_ENDING.as_bytes()))
            .with_context(|| format!("writing to {:?}", self.path))
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MeasurementState;

    fn state(measurement_type: MeasurementType) -> StateHandle {
        let mut s = MeasurementState::default();
        s.sample = "D42 W7".into();
        s.measurement_type = measurement_type;
        s.voltage_begin = 0.0;
        s.voltage_end = -100.0;
        s.voltage_step = 10.0;
        StateHandle::new(s)
    }

    fn reading(timestamp: f64, voltage: f64, i_smu: f64, continuous: bool) -> Reading {
        let mut r = Reading::new(voltage);
        r.timestamp = timestamp;
        r.i_smu = i_smu;
        r.continuous = continuous;
        r
    }

    #[test]
    fn test_iv_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(MeasurementType::Iv);
        let mut writer = OutputWriter::new(dir.path());
        writer.init(&state).unwrap();
        writer.write_reading(&reading(100.0, 0.0, 1.0e-9, false)).unwrap();
        writer.write_reading(&reading(101.0, -10.0, 2.0e-9, false)).unwrap();
        writer.write_reading(&reading(102.0, -10.0, 2.1e-9, true)).unwrap();
        writer.write_reading(&reading(103.0, -10.0, 2.2e-9, true)).unwrap();
        writer.shutdown().unwrap();

        let text = std::fs::read_to_string(writer.path()).unwrap();
        assert!(text.contains("sample: D42 W7\r\n"));
        assert!(text.contains("measurement_type: iv\r\n"));
        assert!(text.contains("\r\n\r\ntimestamp[s]\tvoltage[V]\ti_smu[A]\ti_elm[A]\tt_dmm[degC]\r\n"));
        // Continuous table opens once, with the reduced column set.
        assert_eq!(text.matches("timestamp[s]\ti_smu[A]").count(), 1);
        assert!(text.contains("100.00\t+0.000E0\t+1.000E-9\tnan\tnan\r\n"));
        assert!(text.contains("102.00\t+2.100E-9\r\n"));

        let published = state.read(|s| s.filename.clone()).unwrap();
        assert_eq!(published, writer.path());
    }

    #[test]
    fn test_cv_rows_carry_derived_channel() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(MeasurementType::Cv);
        let mut writer = OutputWriter::new(dir.path());
        writer.init(&state).unwrap();

        let mut r = reading(200.0, 5.0, 1.0e-9, false);
        r.c_lcr = 2.0e-12;
        r.c2_lcr = 1.0 / (2.0e-12 * 2.0e-12);
        writer.write_reading(&r).unwrap();
        writer.shutdown().unwrap();

        let text = std::fs::read_to_string(writer.path()).unwrap();
        assert!(text.contains("c_lcr[F]\tc2_lcr[1/F^2]"));
        assert!(text.contains("200.00\t+5.000E0\t+2.000E-12\t+2.500E23\t+1.000E-9\tnan\r\n"));
    }

    #[test]
    fn test_filename_is_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(MeasurementType::Iv);
        let mut writer = OutputWriter::new(dir.path());
        writer.init(&state).unwrap();
        let name = writer.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("D42_W7_iv_"));
        assert!(name.ends_with(".txt"));
    }
}
