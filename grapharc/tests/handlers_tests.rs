use grapharc::handlers::*;
use grapharc_core::bundled_registry;
use grapharc_scanner::error::{GraphApiError, ScanError};
use std::io::{Cursor, Write};
use std::path::PathBuf;
use tempfile::NamedTempFile;

fn api_error(code: i64, subcode: Option<i64>) -> ScanError {
    ScanError::RemoteProtocol(GraphApiError {
        code,
        subcode,
        message: "rejected".to_string(),
        kind: None,
        transient: false,
    })
}

#[test]
fn test_parse_node_line_trims() {
    assert_eq!(parse_node_line("  12345 \n"), Some("12345".to_string()));
    assert_eq!(parse_node_line("\t"), None);
}

#[test]
fn test_load_node_ids_from_file() -> Result<(), Box<dyn std::error::Error>> {
    let mut temp_file = NamedTempFile::new()?;
    writeln!(temp_file, "153080620724")?;
    writeln!(temp_file)?; // Empty line
    writeln!(temp_file, "  nytimes  ")?;

    let ids = load_node_ids_from_file(temp_file.path())?;
    assert_eq!(ids, vec!["153080620724", "nytimes"]);
    Ok(())
}

#[test]
fn test_load_node_ids_from_several_files_in_order() {
    let mut first = NamedTempFile::new().unwrap();
    writeln!(first, "a").unwrap();
    let mut second = NamedTempFile::new().unwrap();
    writeln!(second, "b\nc").unwrap();

    let files = vec![
        PathBuf::from(first.path()),
        PathBuf::from(second.path()),
    ];
    assert_eq!(load_node_ids(&files).unwrap(), vec!["a", "b", "c"]);
}

#[test]
fn test_load_node_ids_empty_files() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file).unwrap();
    writeln!(temp_file, "   ").unwrap();

    let result = load_node_ids(&[PathBuf::from(temp_file.path())]);
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("No node ids"));
}

#[test]
fn test_load_node_ids_missing_file() {
    let result = load_node_ids(&[PathBuf::from("/nonexistent/ids.txt")]);
    assert!(result.is_err());
}

#[test]
fn test_load_node_ids_from_reader() {
    let ids = load_node_ids_from_reader(Cursor::new("1\n\n2\n")).unwrap();
    assert_eq!(ids, vec!["1", "2"]);
}

#[test]
fn test_resolve_access_token_prefers_flag() {
    assert_eq!(
        resolve_access_token(Some("flag"), Some("env".to_string())),
        Some("flag".to_string())
    );
    assert_eq!(
        resolve_access_token(None, Some(" env \n".to_string())),
        Some("env".to_string())
    );
    assert_eq!(resolve_access_token(None, Some("  ".to_string())), None);
    assert_eq!(resolve_access_token(None, None), None);
}

#[test]
fn test_expand_path_without_tilde() {
    assert_eq!(expand_path("/tmp/out"), PathBuf::from("/tmp/out"));
}

#[test]
fn test_parse_delay() {
    assert_eq!(parse_delay(0.5).unwrap(), std::time::Duration::from_millis(500));
    assert_eq!(parse_delay(0.0).unwrap(), std::time::Duration::ZERO);
    assert!(parse_delay(-1.0).is_err());
    assert!(parse_delay(f64::NAN).is_err());
    assert!(parse_delay(f64::INFINITY).is_err());
    assert!(parse_delay(1e30).is_err());
}

#[test]
fn test_check_definition() {
    let registry = bundled_registry().unwrap();
    assert!(check_definition(&registry, "page", false).is_ok());
    assert!(check_definition(&registry, DISCOVER, true).is_ok());
    assert!(check_definition(&registry, DISCOVER, false).is_err());

    let error = check_definition(&registry, "group", true).unwrap_err();
    assert!(error.to_string().contains("Known definitions: album, comment"));
}

#[test]
fn test_error_hints() {
    assert!(error_hint(&api_error(100, Some(33))).is_some());
    assert!(
        error_hint(&api_error(190, Some(490)).for_node("1"))
            .unwrap()
            .contains("Security check")
    );
    assert!(error_hint(&api_error(2, None)).is_none());
    assert!(error_hint(&ScanError::Resume("empty".to_string())).is_none());
}

#[test]
fn test_generate_crawl_report() {
    let mut summary = grapharc_scanner::CrawlSummary::default();
    summary.record_emitted("page");
    summary.record_emitted("post");
    summary.requests = 2;

    let report = generate_crawl_report(&summary);

    assert!(report.contains("Nodes archived: 2"));
    assert!(report.contains("Requests made: 2"));
    assert!(report.contains("page"));
}
