//! CSV export of alert history.

use std::{fs, io::Write, path::Path};

use crate::error::VisionError;

/// Quote a field when it contains a comma, quote or line break.
pub fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Render `rows` under `header` as CSV text with `\n` line endings.
pub fn to_csv<R, F>(header: &[&str], rows: R) -> String
where
    R: IntoIterator<Item = F>,
    F: AsRef<[String]>,
{
    let mut out = header.join(",");
    out.push('\n');
    for row in rows {
        let fields: Vec<String> = row.as_ref().iter().map(|f| csv_field(f)).collect();
        out.push_str(&fields.join(","));
        out.push('\n');
    }
    out
}

pub fn write_csv<R, F>(path: &Path, header: &[&str], rows: R) -> Result<(), VisionError>
where
    R: IntoIterator<Item = F>,
    F: AsRef<[String]>,
{
    let io_err = |source| VisionError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = fs::File::create(path).map_err(io_err)?;
    file.write_all(to_csv(header, rows).as_bytes()).map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_fields_are_unquoted() {
        assert_eq!(csv_field("NIÑO CERCA DE HORNO!"), "NIÑO CERCA DE HORNO!");
    }

    #[test]
    fn separators_and_quotes_are_escaped() {
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("two\nlines"), "\"two\nlines\"");
    }

    #[test]
    fn rows_follow_the_header() {
        let rows = vec![vec![
            "2025-01-01 10:00:00".to_string(),
            "A | B".to_string(),
            "Cámara 0".to_string(),
        ]];
        assert_eq!(
            to_csv(&["timestamp", "alert", "source"], rows),
            "timestamp,alert,source\n2025-01-01 10:00:00,A | B,Cámara 0\n"
        );
    }

    #[test]
    fn csv_is_written_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alerts.csv");
        write_csv(&path, &["timestamp", "alert"], Vec::<Vec<String>>::new()).unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "timestamp,alert\n");
    }
}
