use chrono::{Datelike, Local};
use std::path::PathBuf;

/// Generate default export filename with format: aq-{dataset}-{YYMMDD}.parquet
pub fn generate_default_export_filename(dataset: &str) -> PathBuf {
    let now = Local::now();
    let year = now.year() % 100; // Get last 2 digits of year
    let month = now.month();
    let day = now.day();

    let filename = format!("aq-{}-{:02}{:02}{:02}.parquet", dataset, year, month, day);
    PathBuf::from("output").join(filename)
}
