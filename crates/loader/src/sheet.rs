//! Spreadsheet sources (xlsx, xls, xlsb, ods).
//!
//! A workbook is materialized in full into an in-memory delimited buffer
//! and then streamed through the same path as flat text. Whole-file
//! materialization is accepted: supplier spreadsheets are small.

use std::path::Path;

use calamine::{open_workbook_auto, Data, Reader};

use crate::error::LoadError;

pub const SPREADSHEET_EXTENSIONS: &[&str] = &["xlsx", "xlsm", "xls", "xlsb", "ods"];

pub fn is_spreadsheet(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SPREADSHEET_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Convert the first worksheet into a delimited text buffer using the
/// caller's delimiter and quoting.
pub fn spreadsheet_to_buffer(
    path: &Path,
    delimiter: u8,
    quote: u8,
) -> Result<String, LoadError> {
    let err = |message: String| LoadError::SpreadsheetConversion {
        path: path.display().to_string(),
        message,
    };

    let mut workbook = open_workbook_auto(path).map_err(|e| err(e.to_string()))?;
    let sheet_names = workbook.sheet_names().to_vec();
    let first = sheet_names
        .first()
        .ok_or_else(|| err("workbook contains no sheets".into()))?;
    let range = workbook
        .worksheet_range(first)
        .map_err(|e| err(format!("sheet '{first}': {e}")))?;

    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .quote(quote)
        .flexible(true)
        .from_writer(Vec::new());

    for row in range.rows() {
        let record: Vec<String> = row.iter().map(cell_text).collect();
        writer
            .write_record(&record)
            .map_err(|e| err(e.to_string()))?;
    }

    let bytes = writer.into_inner().map_err(|e| err(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| err(e.to_string()))
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        // Integers without decimals, like a CSV export would print them.
        Data::Float(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
        Data::Float(n) => format!("{n}"),
        Data::Int(n) => format!("{n}"),
        Data::Bool(b) => (if *b { "TRUE" } else { "FALSE" }).to_string(),
        Data::Error(e) => format!("#{e:?}"),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(ndt) if ndt.time() == chrono::NaiveTime::MIN => {
                ndt.date().format("%Y-%m-%d").to_string()
            }
            Some(ndt) => ndt.format("%Y-%m-%d %H:%M:%S").to_string(),
            None => format!("{}", dt.as_f64()),
        },
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_detection() {
        assert!(is_spreadsheet(Path::new("suppliers/acme.XLSX")));
        assert!(is_spreadsheet(Path::new("a.ods")));
        assert!(!is_spreadsheet(Path::new("a.csv")));
        assert!(!is_spreadsheet(Path::new("noext")));
    }

    #[test]
    fn cell_text_formats() {
        assert_eq!(cell_text(&Data::Empty), "");
        assert_eq!(cell_text(&Data::String("x;y".into())), "x;y");
        assert_eq!(cell_text(&Data::Float(42.0)), "42");
        assert_eq!(cell_text(&Data::Float(19.95)), "19.95");
        assert_eq!(cell_text(&Data::Int(-3)), "-3");
        assert_eq!(cell_text(&Data::Bool(true)), "TRUE");
    }

    #[test]
    fn missing_file_is_a_conversion_error() {
        let result = spreadsheet_to_buffer(Path::new("/nonexistent/x.xlsx"), b';', b'"');
        assert!(matches!(
            result,
            Err(LoadError::SpreadsheetConversion { .. })
        ));
    }
}
