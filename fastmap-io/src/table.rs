//! Whitespace-delimited numeric tables with comment-prefixed headers.
//!
//! Scaler and gather files share this format: `#` or `;` lines are header
//! lines, every other non-blank line is one row of numbers.

use crate::{Error, Result};
use fastmap_core::Table;
use ndarray::Array2;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

/// Parses table text. `origin` is only used in error messages.
///
/// # Errors
/// [`Error::Format`] on a non-numeric value or a ragged row.
pub fn parse_table(text: &str, origin: &Path) -> Result<Table> {
    let mut header = Vec::new();
    let mut values = Vec::new();
    let mut columns: Option<usize> = None;

    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix('#').or_else(|| line.strip_prefix(';')) {
            header.push(rest.trim().to_string());
            continue;
        }
        let row = line
            .split_whitespace()
            .map(str::parse::<f64>)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::format(origin, format!("line {}: {e}", lineno + 1)))?;
        match columns {
            None => columns = Some(row.len()),
            Some(n) if n != row.len() => {
                return Err(Error::format(
                    origin,
                    format!("line {}: {} columns, expected {n}", lineno + 1, row.len()),
                ));
            }
            Some(_) => {}
        }
        values.extend(row);
    }

    let ncols = columns.unwrap_or(0);
    let nrows = if ncols == 0 { 0 } else { values.len() / ncols };
    let values = Array2::from_shape_vec((nrows, ncols), values).map_err(fastmap_core::Error::from)?;
    Ok(Table { header, values })
}

/// Reads and parses a table file.
///
/// # Errors
/// I/O errors and [`Error::Format`].
pub fn read_table<P: AsRef<Path>>(path: P) -> Result<Table> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)?;
    parse_table(&text, path)
}

/// Formats a table: header lines prefixed with `# `, values space-separated.
#[must_use]
pub fn format_table(table: &Table) -> String {
    let mut out = String::new();
    for line in &table.header {
        let _ = writeln!(out, "# {line}");
    }
    for row in table.values.rows() {
        let cells: Vec<String> = row.iter().map(|v| format!("{v}")).collect();
        let _ = writeln!(out, "{}", cells.join(" "));
    }
    out
}

/// Writes a table file.
///
/// # Errors
/// I/O errors.
pub fn write_table<P: AsRef<Path>>(path: P, table: &Table) -> Result<()> {
    fs::write(path, format_table(table))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_parse_header_and_values() {
        let text = "# Struck MCA data\n# TSCALER | I0 | I1\n  10 20 30\n\n11 21 31\n";
        let table = parse_table(text, Path::new("struck.0001")).unwrap();
        assert_eq!(table.header.len(), 2);
        assert_eq!(table.values, array![[10.0, 20.0, 30.0], [11.0, 21.0, 31.0]]);
        assert_eq!(table.column_names(), vec!["TSCALER", "I0", "I1"]);
    }

    #[test]
    fn test_semicolon_header() {
        let table = parse_table("; gathered\n1.5 -2.5\n", Path::new("xps")).unwrap();
        assert_eq!(table.header, vec!["gathered"]);
        assert_eq!(table.rows(), 1);
    }

    #[test]
    fn test_ragged_rows_rejected() {
        let err = parse_table("1 2 3\n4 5\n", Path::new("t")).unwrap_err();
        assert!(matches!(err, Error::Format { .. }));
    }

    #[test]
    fn test_non_numeric_rejected() {
        assert!(parse_table("1 x 3\n", Path::new("t")).is_err());
    }

    #[test]
    fn test_empty_table() {
        let table = parse_table("# only header\n", Path::new("t")).unwrap();
        assert_eq!(table.rows(), 0);
        assert_eq!(table.columns(), 0);
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("struck.0001");
        let table = Table {
            header: vec!["a | b".into()],
            values: array![[1.0, 2.5], [3.0, 4.0]],
        };
        write_table(&path, &table).unwrap();
        assert_eq!(read_table(&path).unwrap(), table);
    }
}
