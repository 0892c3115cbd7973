use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use vba_contracts::ExecutionResult;

/// Writes `<dir>/<request_id>.csv`. The file must not already exist.
pub fn write_csv(dir: &Path, request_id: &str, result: &ExecutionResult) -> io::Result<PathBuf> {
    if !vba_ledger::is_safe_id(request_id) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsafe export id {:?}", request_id),
        ));
    }

    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.csv", request_id));
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)?;
    file.write_all(render_csv(result).as_bytes())?;
    file.sync_all()?;
    Ok(path)
}

pub fn render_csv(result: &ExecutionResult) -> String {
    let mut out = String::new();
    push_record(&mut out, result.columns.iter().map(String::as_str));
    for row in &result.rows {
        let cells = row.iter().map(cell_text).collect::<Vec<_>>();
        push_record(&mut out, cells.iter().map(String::as_str));
    }
    out
}

fn push_record<'a>(out: &mut String, fields: impl Iterator<Item = &'a str>) {
    for (idx, field) in fields.enumerate() {
        if idx > 0 {
            out.push(',');
        }
        push_field(out, field);
    }
    out.push_str("\r\n");
}

fn push_field(out: &mut String, field: &str) {
    if field.contains([',', '"', '\r', '\n']) {
        out.push('"');
        out.push_str(&field.replace('"', "\"\""));
        out.push('"');
    } else {
        out.push_str(field);
    }
}

fn cell_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result() -> ExecutionResult {
        ExecutionResult {
            columns: vec!["period".to_string(), "product".to_string(), "complaint_count".to_string()],
            rows: vec![
                vec![json!("2024-01-01"), json!("Credit card, prepaid"), json!(42)],
                vec![json!("2024-02-01"), json!("Say \"hi\""), json!(null)],
            ],
            row_count: 2,
            suppressed_count: 0,
        }
    }

    #[test]
    fn fields_are_quoted_only_when_needed() {
        assert_eq!(
            render_csv(&result()),
            "period,product,complaint_count\r\n\
             2024-01-01,\"Credit card, prepaid\",42\r\n\
             2024-02-01,\"Say \"\"hi\"\"\",\r\n"
        );
    }

    #[test]
    fn export_never_overwrites() {
        let dir = std::env::temp_dir().join(format!("vba-export-test-{}", ulid::Ulid::new()));
        let path = write_csv(&dir, "req-7", &result()).expect("write");
        assert_eq!(path, dir.join("req-7.csv"));

        let err = write_csv(&dir, "req-7", &result()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);

        let err = write_csv(&dir, "../escape", &result()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let _ = fs::remove_dir_all(&dir);
    }
}
