//! CSV trace output for simulation runs.

use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// One sampled row of a simulation run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TraceRow {
    pub time_s: f64,
    pub status: String,
    pub mode: String,
    pub tl_position: f64,
    pub tr_position: f64,
    pub bl_position: f64,
    pub br_position: f64,
    pub tl_current: f64,
    pub tr_current: f64,
    pub bl_current: f64,
    pub br_current: f64,
    pub sled_x: Option<f64>,
    pub sled_y: Option<f64>,
}

pub struct TraceRecorder<W: Write> {
    writer: csv::Writer<W>,
    rows: usize,
}

impl TraceRecorder<File> {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, csv::Error> {
        Ok(Self::from_writer(File::create(path)?))
    }
}

impl<W: Write> TraceRecorder<W> {
    pub fn from_writer(writer: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(writer),
            rows: 0,
        }
    }

    pub fn record(&mut self, row: &TraceRow) -> Result<(), csv::Error> {
        self.writer.serialize(row)?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn into_inner(self) -> Result<W, csv::Error> {
        self.writer
            .into_inner()
            .map_err(|e| csv::Error::from(e.into_error()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_header_and_rows() {
        let mut recorder = TraceRecorder::from_writer(Vec::new());
        let row = TraceRow {
            time_s: 0.5,
            status: "Homing".to_string(),
            mode: "retracting".to_string(),
            sled_x: Some(1.0),
            ..TraceRow::default()
        };
        recorder.record(&row).unwrap();
        assert_eq!(recorder.rows(), 1);
        let bytes = recorder.into_inner().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("time_s,status,mode,tl_position"));
        assert!(lines.next().unwrap().starts_with("0.5,Homing,retracting,"));
    }
}
