//! CSV adapter
//!
//! Options (artifact / output metadata):
//! - `delimiter`: single character, default `,`
//! - `header`: first record holds column names, default `true`
//! - `trim`: trim whitespace around fields, default `false`

use std::fs::File;
use std::path::Path;

use csv::{ReaderBuilder, StringRecord, StringRecordsIntoIter, Trim, WriterBuilder};
use serde_json::Value;

use super::Adapter;
use crate::artifact::{ArtifactSchema, ArtifactSpec};
use crate::error::TraktError;
use crate::table::{Cell, Table};
use crate::value::{ChunkStream, Metadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CsvOptions {
    delimiter: u8,
    header: bool,
    trim: bool,
}

impl CsvOptions {
    fn from_metadata(metadata: &Metadata, path: &Path) -> Result<Self, TraktError> {
        let delimiter = match metadata.get("delimiter") {
            None | Some(Value::Null) => b',',
            Some(Value::String(s)) if s.len() == 1 => s.as_bytes()[0],
            Some(Value::String(s)) if s == "\\t" => b'\t',
            Some(other) => {
                return Err(TraktError::adapter(
                    path.display(),
                    format!("delimiter must be a single byte character, got {other}"),
                ))
            }
        };
        Ok(Self {
            delimiter,
            header: flag(metadata, "header", true, path)?,
            trim: flag(metadata, "trim", false, path)?,
        })
    }
}

fn flag(metadata: &Metadata, key: &str, default: bool, path: &Path) -> Result<bool, TraktError> {
    match metadata.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(b)) => Ok(*b),
        Some(other) => Err(TraktError::adapter(
            path.display(),
            format!("{key} must be a boolean, got {other}"),
        )),
    }
}

/// Reads and writes delimited text files
#[derive(Debug, Default, Clone)]
pub struct CsvAdapter;

impl CsvAdapter {
    fn open(
        &self,
        path: &Path,
        options: CsvOptions,
    ) -> Result<(Vec<String>, StringRecordsIntoIter<File>), TraktError> {
        let mut reader = ReaderBuilder::new()
            .delimiter(options.delimiter)
            .has_headers(options.header)
            .trim(if options.trim { Trim::All } else { Trim::None })
            .from_path(path)
            .map_err(|e| TraktError::adapter(path.display(), e))?;

        let columns = if options.header {
            reader
                .headers()
                .map_err(|e| TraktError::adapter(path.display(), e))?
                .iter()
                .map(str::to_string)
                .collect()
        } else {
            // Peek the first record for its width; keep it for the row iterator
            let mut peek = ReaderBuilder::new()
                .delimiter(options.delimiter)
                .has_headers(false)
                .from_path(path)
                .map_err(|e| TraktError::adapter(path.display(), e))?;
            let mut first = StringRecord::new();
            let width = if peek
                .read_record(&mut first)
                .map_err(|e| TraktError::adapter(path.display(), e))?
            {
                first.len()
            } else {
                0
            };
            (0..width).map(|i| i.to_string()).collect()
        };
        Ok((columns, reader.into_records()))
    }

    fn validate_schema(
        schema: Option<&ArtifactSchema>,
        table: &Table,
        artifact: &str,
        path: &Path,
    ) -> Result<(), TraktError> {
        match schema {
            Some(schema) => schema.validate(table, artifact, &path.display().to_string()),
            None => Ok(()),
        }
    }
}

fn to_row(record: &StringRecord) -> Vec<Cell> {
    record.iter().map(Cell::parse).collect()
}

impl Adapter for CsvAdapter {
    fn file_extension(&self) -> Option<&str> {
        Some(".csv")
    }

    fn read_columns(&self, path: &Path, artifact: &ArtifactSpec) -> Result<Vec<String>, TraktError> {
        let options = CsvOptions::from_metadata(&artifact.metadata, path)?;
        Ok(self.open(path, options)?.0)
    }

    fn load(&self, path: &Path, artifact: &ArtifactSpec) -> Result<Table, TraktError> {
        let options = CsvOptions::from_metadata(&artifact.metadata, path)?;
        let (columns, records) = self.open(path, options)?;
        let mut table = Table::new(columns);
        for record in records {
            let record = record.map_err(|e| TraktError::adapter(path.display(), e))?;
            table.push_row(to_row(&record))?;
        }
        Self::validate_schema(artifact.schema.as_ref(), &table, &artifact.name, path)?;
        tracing::debug!(path = %path.display(), rows = table.num_rows(), "loaded csv");
        Ok(table)
    }

    fn load_stream(
        &self,
        path: &Path,
        artifact: &ArtifactSpec,
        chunk_size: usize,
    ) -> Result<ChunkStream, TraktError> {
        let options = CsvOptions::from_metadata(&artifact.metadata, path)?;
        let (columns, records) = self.open(path, options)?;
        if let Some(schema) = &artifact.schema {
            schema.validate_columns(&columns, &artifact.name, &path.display().to_string())?;
        }
        Ok(ChunkStream::new(CsvChunks {
            records,
            columns,
            chunk_size: chunk_size.max(1),
            path: path.display().to_string(),
            artifact: artifact.name.clone(),
            schema: artifact.schema.clone(),
            done: false,
        }))
    }

    fn write(&self, table: &Table, path: &Path, metadata: &Metadata) -> Result<(), TraktError> {
        let mut writer = TableWriter::create(path, metadata)?;
        writer.write_table(table)?;
        writer.finish()
    }

    fn write_stream(
        &self,
        stream: ChunkStream,
        path: &Path,
        metadata: &Metadata,
        on_chunk: &mut dyn FnMut(usize),
    ) -> Result<(), TraktError> {
        let mut writer = TableWriter::create(path, metadata)?;
        for chunk in stream {
            let chunk = chunk?;
            writer.write_table(&chunk)?;
            on_chunk(chunk.num_rows());
        }
        writer.finish()
    }
}

// ============================================================================
// CHUNKED READER
// ============================================================================

struct CsvChunks {
    records: StringRecordsIntoIter<File>,
    columns: Vec<String>,
    chunk_size: usize,
    path: String,
    artifact: String,
    schema: Option<ArtifactSchema>,
    done: bool,
}

impl CsvChunks {
    fn next_chunk(&mut self) -> Result<Option<Table>, TraktError> {
        let mut chunk = Table::new(self.columns.iter().cloned());
        while chunk.num_rows() < self.chunk_size {
            match self.records.next() {
                Some(record) => {
                    let record = record.map_err(|e| TraktError::adapter(&self.path, e))?;
                    chunk.push_row(to_row(&record))?;
                }
                None => {
                    self.done = true;
                    break;
                }
            }
        }
        if chunk.is_empty() {
            return Ok(None);
        }
        if let Some(schema) = &self.schema {
            schema.validate(&chunk, &self.artifact, &self.path)?;
        }
        Ok(Some(chunk))
    }
}

impl Iterator for CsvChunks {
    type Item = Result<Table, TraktError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_chunk() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

// ============================================================================
// WRITER
// ============================================================================

struct TableWriter {
    writer: csv::Writer<File>,
    path: String,
    columns: Option<Vec<String>>,
    header: bool,
}

impl TableWriter {
    fn create(path: &Path, metadata: &Metadata) -> Result<Self, TraktError> {
        let options = CsvOptions::from_metadata(metadata, path)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let writer = WriterBuilder::new()
            .delimiter(options.delimiter)
            .from_path(path)
            .map_err(|e| TraktError::adapter(path.display(), e))?;
        Ok(Self {
            writer,
            path: path.display().to_string(),
            columns: None,
            header: options.header,
        })
    }

    fn write_table(&mut self, table: &Table) -> Result<(), TraktError> {
        match &self.columns {
            None => {
                if self.header {
                    self.writer
                        .write_record(table.columns())
                        .map_err(|e| TraktError::adapter(&self.path, e))?;
                }
                self.columns = Some(table.columns().to_vec());
            }
            Some(columns) if columns.as_slice() != table.columns() => {
                return Err(TraktError::adapter(
                    &self.path,
                    format!(
                        "chunk columns {:?} differ from first chunk {:?}",
                        table.columns(),
                        columns
                    ),
                ));
            }
            Some(_) => {}
        }
        for row in table.rows() {
            self.writer
                .write_record(row.iter().map(|cell| cell.to_string()))
                .map_err(|e| TraktError::adapter(&self.path, e))?;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<(), TraktError> {
        self.writer.flush()?;
        Ok(())
    }
}
