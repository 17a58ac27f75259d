//! Gridded products (satellite retrievals, reanalysis fields) exported as
//! `latitude,longitude,value` CSV files, one file per grid and time.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use csv::{ReaderBuilder, StringRecord, Trim};
use memmap2::Mmap;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use super::{AdapterOutput, SourceAdapter};
use crate::error::{PipelineError, Result};
use crate::models::{GridBatch, GridCell, RawValue, StationRegistry};
use crate::processors::report::{SkipLog, SkipReason};
use crate::settings::GridSourceSettings;

const FILENAME_TIME_FORMAT: &str = "%Y%m%dT%H%M";

/// Column positions resolved from the header row.
struct Columns {
    latitude: usize,
    longitude: usize,
    value: usize,
}

impl Columns {
    fn from_headers(headers: &StringRecord, value_column: &str) -> Result<Self> {
        let find = |names: &[&str]| {
            headers
                .iter()
                .position(|h| names.iter().any(|n| h.eq_ignore_ascii_case(n)))
        };

        let missing = |what: &str| PipelineError::MalformedRecord(format!("grid file has no {} column", what));
        Ok(Self {
            latitude: find(&["latitude", "lat"]).ok_or_else(|| missing("latitude"))?,
            longitude: find(&["longitude", "lon", "lng"]).ok_or_else(|| missing("longitude"))?,
            value: find(&["value", value_column]).ok_or_else(|| missing("value"))?,
        })
    }
}

/// Observation time from a `_YYYYMMDDTHHMM` filename suffix, if present.
pub fn timestamp_from_filename(path: &Path) -> Option<DateTime<Utc>> {
    let stem = path.file_stem()?.to_str()?;
    let suffix = stem.rsplit('_').next()?;
    let naive = NaiveDateTime::parse_from_str(suffix, FILENAME_TIME_FORMAT).ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

pub struct GridFileAdapter {
    name: String,
    source: GridSourceSettings,
}

impl GridFileAdapter {
    pub fn new(source: GridSourceSettings) -> Self {
        let name = format!("grid:{}", source.dir.display());
        Self { name, source }
    }

    /// Grid files in the source directory, sorted by name.
    pub fn list_files(&self) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(&self.source.dir).map_err(|e| {
            PipelineError::source_unavailable(&self.name, format!("{}: {}", self.source.dir.display(), e))
        })?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && path
                        .extension()
                        .and_then(|ext| ext.to_str())
                        .map_or(false, |ext| ext.eq_ignore_ascii_case(&self.source.extension))
            })
            .collect();
        files.sort();
        Ok(files)
    }

    /// Decode one file. Rows without a usable value are dropped and counted.
    pub fn read_file(&self, path: &Path, skips: &mut SkipLog) -> Result<GridBatch> {
        let file = File::open(path)?;
        let cells = if self.source.use_mmap {
            // read-only map; grid exports are written once and not modified in place
            let mmap = unsafe { Mmap::map(&file)? };
            self.parse_cells(&mmap[..], path, skips)?
        } else {
            self.parse_cells(BufReader::new(file), path, skips)?
        };

        let timestamp = timestamp_from_filename(path)
            .or_else(|| {
                fs::metadata(path)
                    .and_then(|m| m.modified())
                    .ok()
                    .map(DateTime::<Utc>::from)
            })
            .unwrap_or_else(Utc::now);

        Ok(GridBatch {
            label: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            kind: self.source.kind,
            field: self.source.field,
            timestamp,
            cells,
        })
    }

    fn parse_cells<R: Read>(&self, reader: R, path: &Path, skips: &mut SkipLog) -> Result<Vec<GridCell>> {
        let mut csv_reader = ReaderBuilder::new()
            .trim(Trim::All)
            .flexible(true)
            .from_reader(reader);

        let columns = Columns::from_headers(csv_reader.headers()?, self.source.field.column())?;

        let mut cells = Vec::new();
        let mut malformed = 0;
        let mut absent = 0;

        for record in csv_reader.records() {
            let record = match record {
                Ok(record) => record,
                Err(e) if e.is_io_error() => return Err(e.into()),
                Err(e) => {
                    tracing::debug!(file = %path.display(), error = %e, "Undecodable grid row");
                    malformed += 1;
                    continue;
                }
            };
            let number = |i: usize| record.get(i).and_then(|s| s.parse::<f64>().ok());

            let (Some(latitude), Some(longitude)) = (number(columns.latitude), number(columns.longitude)) else {
                malformed += 1;
                continue;
            };

            match record.get(columns.value).and_then(|s| RawValue::from(s).as_number()) {
                Some(value) => cells.push(GridCell::new(latitude, longitude, value)),
                None => absent += 1,
            }
        }

        if malformed > 0 {
            skips.record(
                SkipReason::MalformedRecord,
                path.display().to_string(),
                format!("{} undecodable rows or rows with unparseable coordinates", malformed),
            );
        }
        tracing::debug!(
            file = %path.display(),
            cells = cells.len(),
            absent,
            "Decoded grid file"
        );
        Ok(cells)
    }
}

impl SourceAdapter for GridFileAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn collect(&self, _registry: &StationRegistry, skips: &mut SkipLog) -> Result<Vec<AdapterOutput>> {
        let files = self.list_files()?;
        let mut outputs = Vec::with_capacity(files.len());

        for path in files {
            match self.read_file(&path, skips) {
                Ok(batch) => outputs.push(AdapterOutput::Grid(batch)),
                Err(e) => skips.record_error(path.display().to_string(), &e),
            }
        }

        tracing::info!(source = %self.name, grids = outputs.len(), "Collected grid files");
        Ok(outputs)
    }
}
