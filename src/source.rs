//! Source-of-truth item listings.
//!
//! The listing is either a CSV export with a header row (the item column is
//! picked by name) or a plain file with one identifier per line.

use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use crate::error::{Error, Result};

pub const DEFAULT_COLUMN: &str = "subject_timepoint";

/// Read item keys from `path`. `.csv` files are parsed by header; anything
/// else is treated as newline-delimited.
pub fn read_item_keys(path: &Path, column: &str) -> Result<Vec<String>> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::Config(format!("cannot open listing {}: {e}", path.display())))?;
    if path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
    {
        from_csv(file, column)
    } else {
        from_lines(file)
    }
}

/// Values of `column` from a headed CSV, blank cells skipped.
pub fn from_csv<R: Read>(reader: R, column: &str) -> Result<Vec<String>> {
    let mut csv = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let index = csv
        .headers()?
        .iter()
        .position(|h| h == column)
        .ok_or_else(|| Error::Config(format!("listing has no '{column}' column")))?;

    let mut keys = Vec::new();
    for record in csv.records() {
        let record = record?;
        if let Some(value) = record.get(index).filter(|v| !v.is_empty()) {
            keys.push(value.to_string());
        }
    }
    Ok(keys)
}

/// One key per non-blank line; `#` starts a comment line.
pub fn from_lines<R: Read>(reader: R) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    for line in BufReader::new(reader).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        keys.push(trimmed.to_string());
    }
    Ok(keys)
}
