use csv_core::WriteResult;
use std::path::PathBuf;

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum Format {
    Table,
    /// A single JSON array.
    Json,
    /// One JSON object per line.
    Jsonl,
    Csv,
}

#[derive(clap::Parser)]
#[group(id = "output::Args")]
pub struct Args {
    /// Write to this file instead of the terminal.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    #[arg(long, short='f', value_enum, default_value_t = Format::Table)]
    format: Format,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open the specified output file at {1:?}")]
    OpenOutputFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the output file at {1:?}")]
    WriteFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the terminal")]
    WriteStdout(#[source] std::io::Error),
    #[error("could not serialize the result to JSON")]
    SerializeJson(#[source] serde_json::Error),
}

impl Args {
    pub fn to_output(self) -> Result<Output, Error> {
        let io = match &self.output {
            None => Box::new(std::io::stdout().lock()) as Box<_>,
            Some(path) => Box::new(
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| Error::OpenOutputFile(e, path.clone()))?,
            ) as Box<_>,
        };
        let formatter = match self.format {
            Format::Table => {
                let mut comfy = comfy_table::Table::new();
                comfy.set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
                Formatter::Table { comfy }
            }
            Format::Json => Formatter::Json { records: Vec::new() },
            Format::Jsonl => Formatter::Jsonl,
            Format::Csv => Formatter::Csv { written_records: false },
        };
        Ok(Output { path: self.output, io, formatter })
    }
}

pub struct Output {
    path: Option<PathBuf>,
    io: Box<dyn std::io::Write>,
    formatter: Formatter,
}

enum Formatter {
    Csv { written_records: bool },
    Table { comfy: comfy_table::Table },
    Json { records: Vec<serde_json::Value> },
    Jsonl,
}

impl Output {
    pub fn table_headers(&mut self, hdrs: Vec<&'static str>) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { written_records } => {
                assert!(!*written_records, "table headers for csv must be written very first!");
                *written_records = true;
                let row = csv_row(&hdrs);
                self.write(&row)?;
            }
            Formatter::Table { comfy } => {
                comfy.set_header(hdrs);
            }
            Formatter::Json { .. } | Formatter::Jsonl => {}
        }
        Ok(())
    }

    pub fn result<R: serde::Serialize>(
        &mut self,
        table_row: impl FnOnce() -> Vec<String>,
        serde_record: impl FnOnce() -> R,
    ) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { written_records } => {
                *written_records = true;
                let row = csv_row(&table_row());
                self.write(&row)?;
            }
            Formatter::Table { comfy } => {
                comfy.add_row(table_row());
            }
            Formatter::Json { records } => {
                records.push(serde_json::to_value(serde_record()).map_err(Error::SerializeJson)?);
            }
            Formatter::Jsonl => {
                let mut line = serde_json::to_vec(&serde_record()).map_err(Error::SerializeJson)?;
                line.push(b'\n');
                self.write(&line)?;
            }
        }
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        self.io.write_all(data).map_err(|e| self.write_error(e))
    }

    fn write_error(&self, e: std::io::Error) -> Error {
        match &self.path {
            None => Error::WriteStdout(e),
            Some(p) => Error::WriteFile(e, p.clone()),
        }
    }

    pub fn commit(mut self) -> Result<(), Error> {
        match std::mem::replace(&mut self.formatter, Formatter::Jsonl) {
            Formatter::Csv { .. } | Formatter::Jsonl => {}
            Formatter::Table { comfy } => {
                self.write(format!("{comfy}\n").as_bytes())?;
            }
            Formatter::Json { records } => {
                let mut data = serde_json::to_vec(&records).map_err(Error::SerializeJson)?;
                data.push(b'\n');
                self.write(&data)?;
            }
        }
        self.io.flush().map_err(|e| self.write_error(e))
    }
}

/// Encode one CSV record, terminator included.
pub(crate) fn csv_row<V: AsRef<str>>(values: &[V]) -> Vec<u8> {
    let mut writer = csv_core::Writer::new();
    let mut row = Vec::new();
    let mut buffer = [0; 256];
    for (idx, value) in values.iter().enumerate() {
        if idx > 0 {
            let (_, written) = writer.delimiter(&mut buffer);
            row.extend_from_slice(&buffer[..written]);
        }
        let mut input = value.as_ref().as_bytes();
        loop {
            let (result, read, written) = writer.field(input, &mut buffer);
            input = &input[read..];
            row.extend_from_slice(&buffer[..written]);
            if let WriteResult::InputEmpty = result {
                break;
            }
        }
    }
    let (_, written) = writer.terminator(&mut buffer);
    row.extend_from_slice(&buffer[..written]);
    row
}
