// Frame-aligned GPIO log
//
// CSV text: a header naming each digital line, then one row of 0/1 values per
// recorded frame. Rows are written in the order frames reach the encoder so the
// row index always equals the video frame index.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::devices::GpioState;

pub struct GpioLogWriter {
    writer: BufWriter<File>,
    line_count: usize,
    rows: u64,
    row_buf: String,
}

impl GpioLogWriter {
    /// Create the log and write its header. Fails if the file already exists.
    pub fn create(path: &Path, line_names: &[String]) -> std::io::Result<Self> {
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let mut writer = BufWriter::new(file);

        let header: Vec<String> = line_names.iter().map(|n| csv_field(n)).collect();
        writer.write_all(header.join(",").as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;

        Ok(Self {
            writer,
            line_count: line_names.len(),
            rows: 0,
            row_buf: String::with_capacity(line_names.len() * 2),
        })
    }

    /// Append the row for one recorded frame
    pub fn append(&mut self, gpio: &GpioState) -> std::io::Result<()> {
        self.row_buf.clear();
        for i in 0..self.line_count {
            if i > 0 {
                self.row_buf.push(',');
            }
            self.row_buf.push(if gpio.line(i) { '1' } else { '0' });
        }
        self.row_buf.push('\n');
        self.writer.write_all(self.row_buf.as_bytes())?;
        self.rows += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }

    /// Flush, sync to disk and close. Returns the row count.
    pub fn finish(mut self) -> std::io::Result<u64> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(self.rows)
    }
}

/// Quote a CSV field when it contains a separator, quote or newline
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Split one CSV line, honouring double-quoted fields
pub fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}
