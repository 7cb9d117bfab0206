//! Reading raw area documents from files.
//!
//! Accepts JSON lines, one document per line, or a single JSON array
//! of documents. Blank lines are skipped.

use std::fs;
use std::path::Path;

use crate::errors::{ErrorKind, Reraise, Result};
use crate::model::RawArea;

pub fn parse_areas(text: &str) -> Result<Vec<RawArea>> {
    if text.trim_start().starts_with('[') {
        return serde_json::from_str(text)
            .raise(ErrorKind::MalformedRecord, "malformed area document array");
    }
    text.lines()
        .enumerate()
        .filter(|(_i, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).raise(
                ErrorKind::MalformedRecord,
                &format!("malformed area document on line {}", i + 1),
            )
        })
        .collect()
}

pub fn read_areas(path: &Path) -> Result<Vec<RawArea>> {
    let text = fs::read_to_string(path).raise(
        ErrorKind::MalformedRecord,
        &format!("can't read areas from {path:?}"),
    )?;
    let areas = parse_areas(&text)?;
    tracing::debug!("Read {} areas from {path:?}", areas.len());
    Ok(areas)
}

#[test]
fn parses_json_lines() {
    let text = r#"{"_id": "01001", "city": "AGAWAM", "loc": [-72.622739, 42.070206], "pop": 15338, "state": "MA"}

{"_id": "01002", "city": "CUSHMAN", "loc": [-72.51565, 42.377017], "pop": 36963, "state": "MA"}
"#;
    let found = parse_areas(text).unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(found[1].city.as_deref(), Some("CUSHMAN"));
}

#[test]
fn parses_array() {
    let found =
        parse_areas(r#" [{"zip": "90210", "city": "Beverly Hills", "state": "CA", "pop": 21000}]"#)
            .unwrap();
    assert_eq!(found, vec![RawArea::new("90210", "Beverly Hills", "CA", 21000)]);
}

#[test]
fn bad_line_is_malformed_record() {
    let err = parse_areas("{\"_id\": \"01001\"}\nnot json\n").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedRecord);
    assert!(err.to_string().contains("line 2"), "{err}");
}

#[test]
fn unreadable_input_is_not_a_store_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = read_areas(&dir.path().join("nope.json")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedRecord);
    assert!(err.to_string().contains("can't read areas"), "{err}");
}
