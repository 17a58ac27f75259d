use chrono::{DateTime, Duration, DurationRound, FixedOffset, Timelike, Utc};
use std::f64::consts::PI;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};
use crate::models::{Field, Measurement, PredictionPoint, PredictionSet};
use crate::processors::regression::LinearModel;
use crate::processors::report::{ForecastReport, SkipReason};
use crate::settings::ForecastSettings;
use crate::storage::MeasurementStore;
use crate::utils::constants::{MAX_CONFIDENCE, MIN_CONFIDENCE};

/// Advisory lock on a file, held for the duration of a forecast run.
///
/// The OS drops the lock when the holder exits, so a killed run never
/// blocks the next one. The file itself stays on disk with the holder's pid.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    file: File,
}

impl RunLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if let Err(e) = FileExt::try_lock_exclusive(&file) {
            if e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
                || e.kind() == ErrorKind::WouldBlock
            {
                return Err(PipelineError::ForecastInProgress(path.to_path_buf()));
            }
            return Err(e.into());
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        // clear the pid before unlocking so a reader never sees a stale holder
        let _ = self.file.set_len(0);
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "Could not release forecast lock");
        }
    }
}

/// Trains a fresh model from recent history each run and replaces the whole
/// prediction set.
pub struct ForecastEngine {
    settings: ForecastSettings,
}

impl ForecastEngine {
    pub fn new(settings: ForecastSettings) -> Self {
        Self { settings }
    }

    pub fn from_settings(settings: &ForecastSettings) -> Self {
        Self::new(settings.clone())
    }

    /// Fit on the most recent rows carrying pm25.
    pub fn train(&self, store: &dyn MeasurementStore) -> Result<LinearModel> {
        let rows = store.get_recent_measurements(self.settings.training_window, Field::Pm25)?;

        if rows.len() < self.settings.min_training_rows {
            return Err(PipelineError::InsufficientTrainingData {
                available: rows.len(),
                required: self.settings.min_training_rows,
            });
        }

        LinearModel::fit(
            &rows,
            Field::Pm25,
            &self.settings.predictors,
            self.settings.ridge_lambda,
        )
    }

    /// First forecast instant: the next whole hour after `now`.
    pub fn first_step(now: DateTime<Utc>) -> DateTime<Utc> {
        let hour = now.duration_trunc(Duration::hours(1)).unwrap_or(now);
        hour + Duration::hours(1)
    }

    /// Diurnal term for a forecast instant; positive around the night peak.
    fn diurnal_adjustment(&self, at: DateTime<Utc>) -> f64 {
        let local = FixedOffset::east_opt(self.settings.diurnal_utc_offset_minutes * 60)
            .map(|offset| at.with_timezone(&offset).time())
            .unwrap_or_else(|| at.time());
        let hour = local.hour() as f64 + local.minute() as f64 / 60.0;

        self.settings.diurnal_amplitude
            * (2.0 * PI * (hour - self.settings.diurnal_peak_hour) / 24.0).cos()
    }

    /// Hourly projection from one base estimate.
    pub fn project(&self, base: f64, r_squared: f64, now: DateTime<Utc>) -> Vec<PredictionPoint> {
        let start = Self::first_step(now);
        let confidence = r_squared.clamp(MIN_CONFIDENCE, MAX_CONFIDENCE);

        (0..self.settings.horizon_hours)
            .map(|step| {
                let at = start + Duration::hours(step as i64);
                let value = (base + self.diurnal_adjustment(at)).max(self.settings.floor);
                let decayed = confidence * self.settings.confidence_decay.powi(step as i32);
                PredictionPoint::new(at, value, decayed)
            })
            .collect()
    }

    fn predict_station(
        &self,
        model: &LinearModel,
        snapshot: &Measurement,
        now: DateTime<Utc>,
    ) -> Option<Vec<PredictionPoint>> {
        let base = model.predict(snapshot);
        if !base.is_finite() {
            return None;
        }
        Some(self.project(base, model.r_squared, now))
    }

    /// One full run: lock, train, predict every station, swap the set.
    ///
    /// On `InsufficientTrainingData` the stored predictions are left as they were.
    pub fn run(&self, store: &dyn MeasurementStore, now: DateTime<Utc>) -> Result<ForecastReport> {
        let _lock = match &self.settings.lock_path {
            Some(path) => Some(RunLock::acquire(path)?),
            None => None,
        };

        let mut report = ForecastReport::new(now);

        let model = self.train(store).map_err(|e| {
            tracing::error!(error = %e, "Forecast run aborted, predictions left unchanged");
            e
        })?;
        report.training_rows = model.training_rows;
        report.r_squared = model.r_squared;
        tracing::info!(
            rows = model.training_rows,
            r_squared = model.r_squared,
            "Trained pm25 model"
        );

        let mut predictions = PredictionSet::new();
        for station in store.get_stations()? {
            let snapshot = match store.get_latest_measurement(&station.id)? {
                Some(snapshot) => snapshot,
                None => {
                    report.skips.record(SkipReason::NoSnapshot, &station.id, "no stored measurement");
                    continue;
                }
            };

            match self.predict_station(&model, &snapshot, now) {
                Some(points) => {
                    predictions.insert(station.id.clone(), points);
                }
                None => report.skips.record(
                    SkipReason::NoSnapshot,
                    &station.id,
                    "snapshot produced a non-finite estimate",
                ),
            }
        }

        report.stations_predicted = predictions.len();
        report.points_written = store.replace_all_predictions(&predictions)?;

        if let Some(path) = &self.settings.model_path {
            if let Err(e) = model.save_json(path) {
                tracing::warn!(path = %path.display(), error = %e, "Could not write model artifact");
            }
        }

        tracing::info!(
            stations = report.stations_predicted,
            points = report.points_written,
            "Forecast run complete"
        );
        Ok(report)
    }
}
