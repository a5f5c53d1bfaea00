// Record sinks: JSON lines to a file or stdout, and per-type CSV tables

use grapharc_scanner::RecordSink;
use grapharc_scanner::definition::{CsvField, DefinitionRegistry};
use grapharc_scanner::error::{Result, ScanError};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Output file for a root node's records.
pub fn node_output_path(output_dir: &Path, node_id: &str) -> PathBuf {
    output_dir.join(format!("{}.jsonl", node_id))
}

/// Writes one JSON document per record, flushing after each.
pub struct JsonLinesOutput {
    writer: Box<dyn Write>,
    pretty: bool,
    path: Option<PathBuf>,
}

impl JsonLinesOutput {
    pub fn stdout(pretty: bool) -> Self {
        Self {
            writer: Box::new(io::stdout()),
            pretty,
            path: None,
        }
    }

    /// Creates or truncates `path`.
    pub fn create(path: impl Into<PathBuf>, pretty: bool) -> Result<Self> {
        let path = path.into();
        let file = File::create(&path)?;
        Ok(Self::from_file(file, path, pretty))
    }

    /// Opens `path` for appending, creating it if needed.
    pub fn append(path: impl Into<PathBuf>, pretty: bool) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self::from_file(file, path, pretty))
    }

    fn from_file(file: File, path: PathBuf, pretty: bool) -> Self {
        debug!("Writing records to {}", path.display());
        Self {
            writer: Box::new(BufWriter::new(file)),
            pretty,
            path: Some(path),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl RecordSink for JsonLinesOutput {
    fn write_record(&mut self, record: &Value) -> Result<()> {
        if self.pretty {
            serde_json::to_writer_pretty(&mut self.writer, record)?;
        } else {
            serde_json::to_writer(&mut self.writer, record)?;
        }
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

struct CsvTable {
    writer: BufWriter<File>,
    columns: Vec<CsvField>,
}

/// Writes records into `<type>.csv` files, one per observed type.
pub struct CsvOutput {
    dir: PathBuf,
    append: bool,
    registry: Arc<DefinitionRegistry>,
    tables: HashMap<String, CsvTable>,
}

impl CsvOutput {
    /// Creates `dir` if needed. Tables are truncated when first written.
    pub fn create(dir: impl Into<PathBuf>, registry: Arc<DefinitionRegistry>) -> Result<Self> {
        Self::open(dir.into(), registry, false)
    }

    /// Like `create`, but extends existing tables.
    pub fn append(dir: impl Into<PathBuf>, registry: Arc<DefinitionRegistry>) -> Result<Self> {
        Self::open(dir.into(), registry, true)
    }

    fn open(dir: PathBuf, registry: Arc<DefinitionRegistry>, append: bool) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            append,
            registry,
            tables: HashMap::new(),
        })
    }

    pub fn table_path(&self, definition_name: &str) -> PathBuf {
        self.dir.join(format!("{}.csv", definition_name))
    }

    fn columns_for(&self, definition_name: &str) -> Vec<CsvField> {
        let mut columns = vec![
            CsvField::Name("id".to_string()),
            CsvField::Path(vec!["metadata".to_string(), "type".to_string()]),
        ];
        match self.registry.get(definition_name) {
            Ok(definition) => columns.extend(definition.csv_projection.iter().cloned()),
            Err(_) => warn!(
                "No definition for type {}, writing only id columns",
                definition_name
            ),
        }
        columns
    }

    fn open_table(&self, definition_name: &str) -> Result<CsvTable> {
        let path = self.table_path(definition_name);
        let has_rows = self.append && fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);
        let file = if self.append {
            OpenOptions::new().create(true).append(true).open(&path)?
        } else {
            File::create(&path)?
        };
        let mut table = CsvTable {
            writer: BufWriter::new(file),
            columns: self.columns_for(definition_name),
        };
        if !has_rows {
            let header: Vec<String> = table.columns.iter().map(CsvField::header).collect();
            write_row(&mut table.writer, &header)?;
        }
        debug!("Opened CSV table {}", path.display());
        Ok(table)
    }
}

impl RecordSink for CsvOutput {
    fn write_record(&mut self, record: &Value) -> Result<()> {
        let definition_name = record
            .pointer("/metadata/type")
            .and_then(Value::as_str)
            .ok_or_else(|| ScanError::Parse("record has no metadata.type".to_string()))?;

        if !self.tables.contains_key(definition_name) {
            let table = self.open_table(definition_name)?;
            self.tables.insert(definition_name.to_string(), table);
        }
        let Some(table) = self.tables.get_mut(definition_name) else {
            return Ok(());
        };

        let row: Vec<String> = table
            .columns
            .iter()
            .map(|column| cell(record, &column.path()))
            .collect();
        write_row(&mut table.writer, &row)?;
        table.writer.flush()?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        for table in self.tables.values_mut() {
            table.writer.flush()?;
        }
        Ok(())
    }
}

/// The value at `path` inside `record`, flattened to one line. Empty when any
/// step of the path is missing.
pub fn cell(record: &Value, path: &[&str]) -> String {
    let mut current = record;
    for key in path {
        match current.get(*key) {
            Some(next) => current = next,
            None => return String::new(),
        }
    }
    match current {
        Value::Null => String::new(),
        Value::String(s) => s.replace('\n', " "),
        other => other.to_string(),
    }
}

/// Quotes a field when it contains a delimiter, quote or line break.
pub fn quote(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn write_row<W: Write>(writer: &mut W, fields: &[String]) -> io::Result<()> {
    let line: Vec<String> = fields.iter().map(|f| quote(f)).collect();
    writer.write_all(line.join(",").as_bytes())?;
    writer.write_all(b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cell_walks_path() {
        let record = json!({"id": "1", "parent": {"id": "2"}, "count": 3, "flag": true});
        assert_eq!(cell(&record, &["parent", "id"]), "2");
        assert_eq!(cell(&record, &["count"]), "3");
        assert_eq!(cell(&record, &["flag"]), "true");
    }

    #[test]
    fn test_cell_missing_hop_is_empty() {
        let record = json!({"id": "1", "message": null});
        assert_eq!(cell(&record, &["object", "id"]), "");
        assert_eq!(cell(&record, &["message"]), "");
    }

    #[test]
    fn test_cell_flattens_newlines() {
        let record = json!({"message": "one\ntwo"});
        assert_eq!(cell(&record, &["message"]), "one two");
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("plain"), "plain");
        assert_eq!(quote("a,b"), "\"a,b\"");
        assert_eq!(quote("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(quote(""), "");
    }
}
