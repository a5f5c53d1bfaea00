// Tests for JSON lines and CSV output sinks

use grapharc_core::output::{CsvOutput, JsonLinesOutput, node_output_path};
use grapharc_scanner::{DefinitionRegistry, RecordSink};
use serde_json::{Value, json};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn registry() -> Arc<DefinitionRegistry> {
    let mut registry = DefinitionRegistry::new();
    registry
        .register_json(
            "comment",
            r#"{"fields": {"message": {"default": true}, "parent": {"edge_type": "comment"}},
                "csv_fields": ["message", ["from", "name"], {"parent_comment": ["parent", "id"]}]}"#,
        )
        .unwrap();
    Arc::new(registry)
}

fn comment(id: &str, message: &str) -> Value {
    json!({"id": id, "metadata": {"type": "comment"}, "message": message,
           "from": {"name": "Someone"}})
}

// ============================================================================
// JSON Lines Tests
// ============================================================================

#[test]
fn test_node_output_path() {
    assert_eq!(
        node_output_path(Path::new("/tmp/out"), "12345"),
        Path::new("/tmp/out/12345.jsonl")
    );
}

#[test]
fn test_json_lines_compact() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("out.jsonl");

    let mut output = JsonLinesOutput::create(&path, false).unwrap();
    output.write_record(&json!({"id": "1"})).unwrap();
    output.write_record(&json!({"id": "2", "nested": {"a": 1}})).unwrap();

    // Flushed per record, so readable before finish.
    let content = fs::read_to_string(&path).unwrap();
    assert_eq!(content, "{\"id\":\"1\"}\n{\"id\":\"2\",\"nested\":{\"a\":1}}\n");
    assert_eq!(output.path(), Some(path.as_path()));
}

#[test]
fn test_json_lines_pretty() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("out.jsonl");

    let mut output = JsonLinesOutput::create(&path, true).unwrap();
    output.write_record(&json!({"id": "1"})).unwrap();
    output.finish().unwrap();

    let content = fs::read_to_string(&path).unwrap();
    assert_eq!(content, "{\n  \"id\": \"1\"\n}\n");
}

#[test]
fn test_json_lines_append() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("out.jsonl");
    fs::write(&path, "{\"id\":\"1\"}\n").unwrap();

    let mut output = JsonLinesOutput::append(&path, false).unwrap();
    output.write_record(&json!({"id": "2"})).unwrap();
    output.finish().unwrap();

    let content = fs::read_to_string(&path).unwrap();
    assert_eq!(content.lines().count(), 2);
}

#[test]
fn test_json_lines_create_truncates() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("out.jsonl");
    fs::write(&path, "old\n").unwrap();

    let mut output = JsonLinesOutput::create(&path, false).unwrap();
    output.write_record(&json!({"id": "2"})).unwrap();

    assert_eq!(fs::read_to_string(&path).unwrap(), "{\"id\":\"2\"}\n");
}

// ============================================================================
// CSV Tests
// ============================================================================

#[test]
fn test_csv_header_and_rows() {
    let dir = TempDir::new().unwrap();
    let mut output = CsvOutput::create(dir.path().join("csv"), registry()).unwrap();

    output.write_record(&comment("c1", "hello")).unwrap();
    let mut reply = comment("c2", "say \"hi\"");
    reply["parent"] = json!({"id": "c1"});
    output.write_record(&reply).unwrap();
    output.finish().unwrap();

    let content = fs::read_to_string(dir.path().join("csv/comment.csv")).unwrap();
    assert_eq!(
        content,
        "id,metadata_type,message,from_name,parent_comment\r\n\
         c1,comment,hello,Someone,\r\n\
         c2,comment,\"say \"\"hi\"\"\",Someone,c1\r\n"
    );
}

#[test]
fn test_csv_append_skips_header_for_existing_table() {
    let dir = TempDir::new().unwrap();
    {
        let mut output = CsvOutput::create(dir.path(), registry()).unwrap();
        output.write_record(&comment("c1", "one")).unwrap();
        output.finish().unwrap();
    }
    let mut output = CsvOutput::append(dir.path(), registry()).unwrap();
    output.write_record(&comment("c2", "two")).unwrap();
    output.finish().unwrap();

    let content = fs::read_to_string(dir.path().join("comment.csv")).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("id,metadata_type"));
    assert!(lines[2].starts_with("c2,"));
}

#[test]
fn test_csv_append_writes_header_for_new_table() {
    let dir = TempDir::new().unwrap();
    let mut output = CsvOutput::append(dir.path(), registry()).unwrap();
    output.write_record(&comment("c1", "one")).unwrap();
    output.finish().unwrap();

    let content = fs::read_to_string(dir.path().join("comment.csv")).unwrap();
    assert!(content.starts_with("id,metadata_type,message"));
}

#[test]
fn test_csv_unknown_type_writes_id_columns() {
    let dir = TempDir::new().unwrap();
    let mut output = CsvOutput::create(dir.path(), registry()).unwrap();
    output
        .write_record(&json!({"id": "s1", "metadata": {"type": "status"}, "message": "x"}))
        .unwrap();
    output.finish().unwrap();

    let content = fs::read_to_string(dir.path().join("status.csv")).unwrap();
    assert_eq!(content, "id,metadata_type\r\ns1,status\r\n");
}

#[test]
fn test_csv_record_without_type_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut output = CsvOutput::create(dir.path(), registry()).unwrap();
    assert!(output.write_record(&json!({"id": "1"})).is_err());
}
