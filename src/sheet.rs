use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::Path;

use anyhow::Context;

use crate::error::SchemaError;

pub const DEFAULT_SHEET: &str = "Export";

/// Header → cell text for one data row.
pub type RawRow = HashMap<String, String>;

#[derive(Debug, Clone, Default)]
pub struct RawTable {
    pub sheet: String,
    pub headers: Vec<String>,
    pub rows: Vec<RawRow>,
}

impl RawTable {
    pub fn from_reader<R: Read>(sheet: &str, reader: R) -> anyhow::Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers: Vec<String> = reader
            .headers()
            .with_context(|| format!("failed to read header row of `{sheet}`"))?
            .iter()
            .map(str::to_string)
            .collect();

        if headers.iter().all(|header| header.is_empty()) {
            return Err(SchemaError::EmptySheet {
                sheet: sheet.to_string(),
            }
            .into());
        }

        let mut rows = Vec::new();
        for (index, result) in reader.records().enumerate() {
            let record =
                result.with_context(|| format!("failed to read row {} of `{sheet}`", index + 2))?;
            let mut row = RawRow::with_capacity(headers.len());
            for (header, cell) in headers.iter().zip(record.iter()) {
                if header.is_empty() {
                    continue;
                }
                // First occurrence of a duplicated header wins.
                row.entry(header.clone()).or_insert_with(|| cell.to_string());
            }
            rows.push(row);
        }

        Ok(RawTable {
            sheet: sheet.to_string(),
            headers,
            rows,
        })
    }
}

/// Reads one worksheet exported as CSV.
///
/// A directory is treated as a workbook holding one `<sheet>.csv` per
/// worksheet (matched case-insensitively); a file is the worksheet itself.
pub fn read_sheet(path: &Path, sheet: &str) -> anyhow::Result<RawTable> {
    let file = if path.is_dir() {
        find_sheet(path, sheet)?.ok_or_else(|| SchemaError::MissingSheet {
            sheet: sheet.to_string(),
            location: path.display().to_string(),
        })?
    } else {
        path.to_path_buf()
    };

    let handle = fs::File::open(&file)
        .with_context(|| format!("failed to open {}", file.display()))?;
    RawTable::from_reader(sheet, handle)
}

fn find_sheet(dir: &Path, sheet: &str) -> anyhow::Result<Option<std::path::PathBuf>> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?;
    for entry in entries {
        let candidate = entry?.path();
        let is_csv = candidate
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("csv"))
            .unwrap_or(false);
        let stem_matches = candidate
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(|stem| stem.eq_ignore_ascii_case(sheet))
            .unwrap_or(false);
        if is_csv && stem_matches {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_headers_and_trimmed_cells() {
        let data = "Subject, Catalog Number ,Dropped\nMATH , 101,2\nBIO,200\n";
        let table = RawTable::from_reader("Export", data.as_bytes()).unwrap();
        assert_eq!(table.headers, vec!["Subject", "Catalog Number", "Dropped"]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0]["Subject"], "MATH");
        assert_eq!(table.rows[0]["Catalog Number"], "101");
        assert!(!table.rows[1].contains_key("Dropped"));
    }

    #[test]
    fn empty_input_is_a_schema_error() {
        let err = RawTable::from_reader("Export", "".as_bytes()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<SchemaError>(),
            Some(&SchemaError::EmptySheet {
                sheet: "Export".to_string()
            })
        );
    }

    #[test]
    fn workbook_directory_resolves_sheet_by_name() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("export.csv"), "Subject\nMATH\n").unwrap();
        fs::write(dir.path().join("Notes.csv"), "Text\nhello\n").unwrap();

        let table = read_sheet(dir.path(), "Export").unwrap();
        assert_eq!(table.rows[0]["Subject"], "MATH");
    }

    #[test]
    fn missing_worksheet_is_a_schema_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Notes.csv"), "Text\nhello\n").unwrap();

        let err = read_sheet(dir.path(), "Export").unwrap_err();
        match err.downcast_ref::<SchemaError>() {
            Some(SchemaError::MissingSheet { sheet, .. }) => assert_eq!(sheet, "Export"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
