//! Item listings from files.

use std::io::Write;

use batchtrack::error::Error;
use batchtrack::source;

#[test]
fn csv_listing_reads_named_column() {
    let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
    writeln!(file, "site,subject_timepoint,notes").unwrap();
    writeln!(file, "S01, NDAR_A_baseline ,ok").unwrap();
    writeln!(file, "S02,,missing").unwrap();
    writeln!(file, "S03,NDAR_B_2year,").unwrap();
    file.flush().unwrap();

    let keys = source::read_item_keys(file.path(), source::DEFAULT_COLUMN).unwrap();
    assert_eq!(keys, vec!["NDAR_A_baseline", "NDAR_B_2year"]);
}

#[test]
fn csv_listing_without_column_is_config_error() {
    let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
    writeln!(file, "id,name").unwrap();
    writeln!(file, "1,a").unwrap();
    file.flush().unwrap();

    let err = source::read_item_keys(file.path(), "subject_timepoint").unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn plain_listing_skips_blanks_and_comments() {
    let mut file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
    writeln!(file, "# exported 2024-01-01").unwrap();
    writeln!(file, "B_0").unwrap();
    writeln!(file).unwrap();
    writeln!(file, "  A_2  ").unwrap();
    file.flush().unwrap();

    let keys = source::read_item_keys(file.path(), source::DEFAULT_COLUMN).unwrap();
    assert_eq!(keys, vec!["B_0", "A_2"]);
}

#[test]
fn missing_listing_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = source::read_item_keys(&dir.path().join("absent.csv"), "x").unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}
