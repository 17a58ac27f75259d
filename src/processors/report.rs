use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{ErrorCategory, PipelineError};
use crate::processors::resolver::ResolutionStats;
use crate::utils::constants::MAX_REPORTED_SKIPS;

/// Why an item (record, grid, station, row) was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SkipReason {
    SourceUnavailable,
    MalformedRecord,
    GeometryMismatch,
    EmptyGrid,
    NoGridMatch,
    StorageConflict,
    UnknownStation,
    NoSnapshot,
    Infrastructure,
}

impl SkipReason {
    pub fn from_error(error: &PipelineError) -> Self {
        match error.category() {
            ErrorCategory::SourceUnavailable => SkipReason::SourceUnavailable,
            ErrorCategory::MalformedRecord => SkipReason::MalformedRecord,
            ErrorCategory::GeometryMismatch => SkipReason::GeometryMismatch,
            ErrorCategory::StorageConflict => SkipReason::StorageConflict,
            ErrorCategory::InsufficientTrainingData | ErrorCategory::Infrastructure => {
                SkipReason::Infrastructure
            }
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SkipReason::SourceUnavailable => "source unavailable",
            SkipReason::MalformedRecord => "malformed record",
            SkipReason::GeometryMismatch => "geometry mismatch",
            SkipReason::EmptyGrid => "empty grid",
            SkipReason::NoGridMatch => "no grid cell within cutoff",
            SkipReason::StorageConflict => "storage conflict",
            SkipReason::UnknownStation => "unknown station",
            SkipReason::NoSnapshot => "no feature snapshot",
            SkipReason::Infrastructure => "infrastructure failure",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Skip {
    pub reason: SkipReason,
    pub subject: String,
    pub details: String,
}

/// Skip counters per reason, with the first few details kept for display.
#[derive(Debug, Clone, Default)]
pub struct SkipLog {
    pub counts: BTreeMap<SkipReason, usize>,
    pub details: Vec<Skip>,
}

impl SkipLog {
    pub fn record(&mut self, reason: SkipReason, subject: impl Into<String>, details: impl Into<String>) {
        let subject = subject.into();
        let details = details.into();
        tracing::warn!(%reason, %subject, %details, "Skipped");

        *self.counts.entry(reason).or_default() += 1;
        if self.details.len() < MAX_REPORTED_SKIPS {
            self.details.push(Skip {
                reason,
                subject,
                details,
            });
        }
    }

    pub fn record_error(&mut self, subject: impl Into<String>, error: &PipelineError) {
        self.record(SkipReason::from_error(error), subject, error.to_string());
    }

    /// Count-only entry, for high-volume silent skips.
    pub fn count(&mut self, reason: SkipReason, n: usize) {
        if n > 0 {
            *self.counts.entry(reason).or_default() += n;
        }
    }

    pub fn get(&self, reason: SkipReason) -> usize {
        self.counts.get(&reason).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    fn write_summary(&self, summary: &mut String) {
        summary.push_str(&format!("\nSkipped: {}\n", self.total()));
        for (reason, n) in &self.counts {
            summary.push_str(&format!("  {}: {}\n", reason, n));
        }

        if !self.details.is_empty() {
            summary.push_str(&format!("\nFirst {} skips:\n", self.details.len().min(10)));
            for (i, skip) in self.details.iter().take(10).enumerate() {
                summary.push_str(&format!(
                    "  {}. [{}] {}: {}\n",
                    i + 1,
                    skip.reason,
                    skip.subject,
                    skip.details
                ));
            }
        }
    }
}

/// Outcome of one ingestion pass.
#[derive(Debug, Clone, Default)]
pub struct PassReport {
    pub stations: usize,
    pub readings: usize,
    pub grids_joined: usize,
    pub cells: usize,
    pub resolution: ResolutionStats,
    pub rows_upserted: usize,
    pub dedup_removed: usize,
    pub skips: SkipLog,
}

impl PassReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip(&mut self, reason: SkipReason, subject: impl Into<String>, details: impl Into<String>) {
        self.skips.record(reason, subject, details);
    }

    pub fn skip_error(&mut self, subject: impl Into<String>, error: &PipelineError) {
        self.skips.record_error(subject, error);
    }

    pub fn generate_summary(&self) -> String {
        let mut summary = String::new();

        summary.push_str("=== Fusion Pass Report ===\n");
        summary.push_str(&format!("Stations: {}\n", self.stations));
        summary.push_str(&format!("Readings collected: {}\n", self.readings));
        summary.push_str(&format!("Grids joined: {}\n", self.grids_joined));
        summary.push_str(&format!("Cells resolved: {}\n", self.cells));
        summary.push_str(&format!(
            "Values: {} observed, {} generated, {} absent\n",
            self.resolution.observed, self.resolution.generated, self.resolution.absent
        ));
        for (source, n) in &self.resolution.by_source {
            summary.push_str(&format!("  from {}: {}\n", source, n));
        }
        summary.push_str(&format!("Rows upserted: {}\n", self.rows_upserted));
        summary.push_str(&format!("Duplicate rows removed: {}\n", self.dedup_removed));

        self.skips.write_summary(&mut summary);
        summary
    }
}

/// Outcome of one forecast run.
#[derive(Debug, Clone)]
pub struct ForecastReport {
    pub run_at: DateTime<Utc>,
    pub training_rows: usize,
    pub r_squared: f64,
    pub stations_predicted: usize,
    pub points_written: usize,
    pub skips: SkipLog,
}

impl ForecastReport {
    pub fn new(run_at: DateTime<Utc>) -> Self {
        Self {
            run_at,
            training_rows: 0,
            r_squared: 0.0,
            stations_predicted: 0,
            points_written: 0,
            skips: SkipLog::default(),
        }
    }

    pub fn generate_summary(&self) -> String {
        let mut summary = String::new();

        summary.push_str("=== Forecast Run Report ===\n");
        summary.push_str(&format!("Run at: {}\n", self.run_at.format("%Y-%m-%d %H:%M UTC")));
        summary.push_str(&format!("Training rows: {}\n", self.training_rows));
        summary.push_str(&format!("Training R²: {:.3}\n", self.r_squared));
        summary.push_str(&format!("Stations predicted: {}\n", self.stations_predicted));
        summary.push_str(&format!("Prediction points written: {}\n", self.points_written));

        self.skips.write_summary(&mut summary);
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_log_counts_and_caps_details() {
        let mut log = SkipLog::default();
        for i in 0..(MAX_REPORTED_SKIPS + 5) {
            log.record(SkipReason::MalformedRecord, format!("row {}", i), "bad timestamp");
        }
        log.count(SkipReason::NoGridMatch, 3);

        assert_eq!(log.get(SkipReason::MalformedRecord), MAX_REPORTED_SKIPS + 5);
        assert_eq!(log.get(SkipReason::NoGridMatch), 3);
        assert_eq!(log.details.len(), MAX_REPORTED_SKIPS);
    }

    #[test]
    fn test_error_maps_to_skip_reason() {
        let err = PipelineError::source_unavailable("ground", "HTTP 503");
        assert_eq!(SkipReason::from_error(&err), SkipReason::SourceUnavailable);

        let err = PipelineError::GeometryMismatch("scan angles".to_string());
        assert_eq!(SkipReason::from_error(&err), SkipReason::GeometryMismatch);
    }

    #[test]
    fn test_summary_mentions_skips() {
        let mut report = PassReport::new();
        report.stations = 3;
        report.skip(SkipReason::EmptyGrid, "aod_20241103T0600.csv", "no cells in bbox");

        let summary = report.generate_summary();
        assert!(summary.contains("Stations: 3"));
        assert!(summary.contains("empty grid: 1"));
        assert!(summary.contains("aod_20241103T0600.csv"));
    }
}
