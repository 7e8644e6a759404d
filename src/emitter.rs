//! Urban Flows CSV dialect writer.
//!
//! `|` delimiter, `\n` terminator, minimal quoting, UTF-8. The header is the
//! source's fixed column tuple. The file is created with the first row and is
//! removed when a run ends without rows.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use csv::{QuoteStyle, Terminator, WriterBuilder};
use tracing::{debug, info};

use crate::error::HarvestResult;
use crate::models::{format_timestamp, OutputColumns, WideRow};

// ---

pub const DELIMITER: u8 = b'|';

pub struct CsvEmitter {
    path: PathBuf,
    header: Vec<String>,
    writer: Option<csv::Writer<File>>,
    rows_written: usize,
}

impl CsvEmitter {
    pub fn new(path: impl Into<PathBuf>, columns: &OutputColumns) -> Self {
        CsvEmitter::with_header(path, columns.header())
    }

    /// Emitter with an explicit header. A header without metric columns
    /// never creates the file.
    pub fn with_header(path: impl Into<PathBuf>, header: Vec<String>) -> Self {
        CsvEmitter {
            path: path.into(),
            header,
            writer: None,
            rows_written: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    fn has_metrics(&self) -> bool {
        self.header.len() > 2
    }

    fn writer(&mut self) -> HarvestResult<&mut csv::Writer<File>> {
        // ---
        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => self.open()?,
        };
        Ok(self.writer.insert(writer))
    }

    fn open(&self) -> HarvestResult<csv::Writer<File>> {
        // ---
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        let mut writer = WriterBuilder::new()
            .delimiter(DELIMITER)
            .terminator(Terminator::Any(b'\n'))
            .quote_style(QuoteStyle::Necessary)
            .from_writer(file);
        writer.write_record(&self.header)?;
        info!("Writing {}", self.path.display());
        Ok(writer)
    }

    /// Append raw records and make them durable.
    pub fn write_records(&mut self, records: &[Vec<String>]) -> HarvestResult<usize> {
        // ---
        if records.is_empty() || !self.has_metrics() {
            return Ok(0);
        }
        let writer = self.writer()?;
        for record in records {
            writer.write_record(record)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        self.rows_written += records.len();
        debug!("Wrote {} rows to {}", records.len(), self.path.display());
        Ok(records.len())
    }

    /// Append pivoted rows (`timestamp`, id, cells) and make them durable.
    pub fn write_rows(&mut self, rows: &[WideRow]) -> HarvestResult<usize> {
        // ---
        let records: Vec<Vec<String>> = rows
            .iter()
            .map(|row| {
                let mut record = Vec::with_capacity(row.cells.len() + 2);
                record.push(format_timestamp(&row.timestamp));
                record.push(row.sensor_id.clone());
                record.extend(row.cells.iter().map(|c| c.to_string()));
                record
            })
            .collect();
        self.write_records(&records)
    }

    /// Close the file. Returns the number of rows written; a run without rows
    /// leaves no file behind.
    pub fn finish(mut self) -> HarvestResult<usize> {
        // ---
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        if self.rows_written == 0 && self.path.exists() {
            std::fs::remove_file(&self.path)?;
            info!("No rows produced, removed {}", self.path.display());
        }
        Ok(self.rows_written)
    }
}
