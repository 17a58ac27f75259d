use chrono::{DateTime, Utc};
use rayon::prelude::*;
use std::collections::BTreeMap;
use validator::Validate;

use crate::adapters::{AdapterOutput, SourceAdapter};
use crate::error::{PipelineError, Result};
use crate::models::{GridBatch, GridKind, MeasurementPatch, Reading, Station, StationRegistry};
use crate::processors::fusion::FusionEngine;
use crate::processors::report::{PassReport, SkipReason};
use crate::processors::resolver::ValueResolver;
use crate::processors::spatial_joiner::{GridRejection, JoinOutcome, SpatialJoiner};
use crate::processors::task_runner::TaskRunner;
use crate::settings::Settings;
use crate::storage::{MeasurementStore, StoreConnector};
use crate::utils::progress::ProgressReporter;

/// One resolved write, ready for the upsert workers.
struct UpsertJob {
    station_id: String,
    timestamp: DateTime<Utc>,
    patch: MeasurementPatch,
}

/// Drives one ingestion pass: collect, join, resolve, upsert.
pub struct FusionPipeline {
    settings: Settings,
    max_workers: usize,
}

impl FusionPipeline {
    pub fn new(settings: &Settings) -> Self {
        Self {
            settings: settings.clone(),
            max_workers: settings.http.max_workers,
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    /// Register discovered stations that are not yet known. Stations failing
    /// validation are skipped and reported.
    pub fn sync_stations(
        &self,
        store: &dyn MeasurementStore,
        discovered: Vec<Station>,
        report: &mut PassReport,
    ) -> Result<usize> {
        let mut valid = Vec::with_capacity(discovered.len());
        for station in discovered {
            match station.validate() {
                Ok(()) => valid.push(station),
                Err(e) => report.skip(SkipReason::MalformedRecord, station.id.clone(), e.to_string()),
            }
        }

        let added = store.register_stations(&valid)?;
        report.stations = store.get_stations()?.len();
        tracing::info!(offered = valid.len(), added, "Synchronised stations");
        Ok(added)
    }

    /// Run one pass. Only failures of the primary store connection abort it;
    /// every other failure is skipped and counted in the report.
    pub fn run_pass(
        &self,
        store: &dyn MeasurementStore,
        connector: &dyn StoreConnector,
        adapters: &[&dyn SourceAdapter],
        progress: Option<&ProgressReporter>,
    ) -> Result<PassReport> {
        let mut report = PassReport::new();
        let engine = FusionEngine::from_settings(&self.settings.fusion);

        report.dedup_removed = engine.prepare(store)?;
        let registry = StationRegistry::new(store.get_stations()?);
        report.stations = registry.len();

        if let Some(p) = progress {
            p.set_message("Collecting sources...");
        }

        let mut readings = Vec::new();
        let mut grids = Vec::new();
        for adapter in adapters {
            match adapter.collect(&registry, &mut report.skips) {
                Ok(outputs) => {
                    for output in outputs {
                        match output {
                            AdapterOutput::Readings(batch) => readings.extend(batch),
                            AdapterOutput::Grid(batch) => grids.push(batch),
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(source = adapter.name(), error = %e, "Source failed for this pass");
                    report.skip_error(adapter.name(), &e);
                }
            }
        }

        if let Some(p) = progress {
            p.set_message(&format!("Joining {} grids...", grids.len()));
        }
        readings.extend(self.join_grids(&registry, &grids, &mut report)?);
        report.readings = readings.len();

        let readings = self.attach_station_ids(&registry, readings, &mut report);

        let mut resolver = ValueResolver::from_settings(&self.settings.resolver);
        let cells = engine.group(readings);
        report.cells = cells.len();

        let jobs: Vec<UpsertJob> = cells
            .into_iter()
            .filter_map(|cell| {
                let patch = resolver.resolve_cell(&cell.station_id, cell.timestamp, &cell.offers);
                (!patch.is_empty()).then(|| UpsertJob {
                    station_id: cell.station_id,
                    timestamp: cell.timestamp,
                    patch,
                })
            })
            .collect();
        report.resolution = resolver.take_stats();

        if let Some(p) = progress {
            p.set_length(jobs.len() as u64);
            p.set_message(&format!("Upserting {} rows...", jobs.len()));
        }

        let runner = TaskRunner::new(self.max_workers);
        let outcomes = runner.run(
            jobs,
            || connector.connect(),
            |worker_store, job| engine.upsert(worker_store.as_ref(), &job.station_id, job.timestamp, &job.patch),
            progress,
        );

        for outcome in outcomes {
            match outcome.result {
                Ok(Some(_)) => report.rows_upserted += 1,
                Ok(None) => {}
                Err(e) => {
                    let subject = format!("{} @ {}", outcome.item.station_id, outcome.item.timestamp);
                    report.skip_error(subject, &e);
                }
            }
        }

        if let Some(p) = progress {
            p.finish_with_message(&format!("Upserted {} rows", report.rows_upserted));
        }
        tracing::info!(
            rows = report.rows_upserted,
            skipped = report.skips.total(),
            "Pass complete"
        );
        Ok(report)
    }

    /// Join every grid onto the registry on a bounded rayon pool and turn the
    /// matches into readings stamped with the grid's time.
    fn join_grids(
        &self,
        registry: &StationRegistry,
        grids: &[GridBatch],
        report: &mut PassReport,
    ) -> Result<Vec<Reading>> {
        if grids.is_empty() {
            return Ok(Vec::new());
        }

        let satellite = SpatialJoiner::from_settings(&self.settings.spatial, GridKind::Satellite);
        let weather = SpatialJoiner::from_settings(&self.settings.spatial, GridKind::Weather);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.max_workers)
            .build()
            .map_err(|e| PipelineError::WorkerPool(e.to_string()))?;

        let outcomes: Vec<std::result::Result<JoinOutcome, GridRejection>> = pool.install(|| {
            grids
                .par_iter()
                .map(|batch| {
                    let joiner = match batch.kind {
                        GridKind::Satellite => &satellite,
                        GridKind::Weather => &weather,
                    };
                    joiner.join(registry, &batch.cells)
                })
                .collect()
        });

        let mut readings = Vec::new();
        for (batch, outcome) in grids.iter().zip(outcomes) {
            match outcome {
                Ok(joined) => {
                    report.grids_joined += 1;
                    report.skips.count(SkipReason::NoGridMatch, joined.unmatched_stations.len());
                    readings.extend(joined.matches.into_iter().map(|m| {
                        Reading::new(m.station_id, batch.timestamp, batch.kind.source(), batch.field, m.cell.value)
                    }));
                }
                Err(GridRejection::EmptyGrid) => {
                    report.skip(SkipReason::EmptyGrid, batch.label.clone(), "no cells inside the area of interest");
                }
                Err(GridRejection::GeometryMismatch(detail)) => {
                    report.skip(SkipReason::GeometryMismatch, batch.label.clone(), detail);
                }
            }
        }

        Ok(readings)
    }

    /// Rewrite station keys to registry ids, dropping readings for stations
    /// the registry does not know.
    fn attach_station_ids(
        &self,
        registry: &StationRegistry,
        readings: Vec<Reading>,
        report: &mut PassReport,
    ) -> Vec<Reading> {
        let mut unknown: BTreeMap<String, usize> = BTreeMap::new();
        let mut attached = Vec::with_capacity(readings.len());

        for mut reading in readings {
            match registry.resolve(&reading.station_key) {
                Some(station) => {
                    if station.id != reading.station_key {
                        reading.station_key = station.id.clone();
                    }
                    attached.push(reading);
                }
                None => *unknown.entry(reading.station_key).or_default() += 1,
            }
        }

        for (key, n) in unknown {
            report.skip(SkipReason::UnknownStation, key, format!("{} readings dropped", n));
        }
        attached
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Field, GridCell, SourceKind};
    use crate::processors::report::SkipLog;
    use crate::storage::InMemoryStore;
    use chrono::TimeZone;

    struct FixedAdapter {
        name: &'static str,
        outputs: Vec<AdapterOutput>,
    }

    impl SourceAdapter for FixedAdapter {
        fn name(&self) -> &str {
            self.name
        }

        fn collect(&self, _registry: &StationRegistry, _skips: &mut SkipLog) -> Result<Vec<AdapterOutput>> {
            Ok(self.outputs.clone())
        }
    }

    struct DownAdapter;

    impl SourceAdapter for DownAdapter {
        fn name(&self) -> &str {
            "down"
        }

        fn collect(&self, _registry: &StationRegistry, _skips: &mut SkipLog) -> Result<Vec<AdapterOutput>> {
            Err(PipelineError::source_unavailable("down", "connection refused"))
        }
    }

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 11, 3, h, m, 0).unwrap()
    }

    fn store() -> InMemoryStore {
        InMemoryStore::with_stations(vec![
            Station::new("DL-ITO", "ITO, Delhi - CPCB", 28.70, 77.10),
            Station::new("DL-RKP", "R K Puram, Delhi - DPCC", 28.56, 77.18),
        ])
    }

    #[test]
    fn test_pass_fuses_ground_and_grid_sources() -> Result<()> {
        let store = store();
        let ground = FixedAdapter {
            name: "ground",
            outputs: vec![AdapterOutput::Readings(vec![
                Reading::new("ITO, Delhi - CPCB", ts(9, 30), SourceKind::GroundSensor, Field::Pm25, "212"),
                Reading::new("ITO, Delhi - CPCB", ts(9, 30), SourceKind::GroundSensor, Field::No2, "NA"),
                Reading::new("Nowhere", ts(9, 30), SourceKind::GroundSensor, Field::Pm25, "40"),
            ])],
        };
        let satellite = FixedAdapter {
            name: "satellite",
            outputs: vec![AdapterOutput::Grid(GridBatch {
                label: "no2_20241103T0940.csv".to_string(),
                kind: GridKind::Satellite,
                field: Field::No2Sat,
                timestamp: ts(9, 40),
                cells: vec![GridCell::new(28.70, 77.12, 64.0), GridCell::new(28.56, 77.19, 51.0)],
            })],
        };

        let pipeline = FusionPipeline::new(&Settings::default()).with_max_workers(2);
        let report = pipeline.run_pass(&store, &store, &[&ground, &satellite, &DownAdapter], None)?;

        assert_eq!(report.grids_joined, 1);
        assert_eq!(report.skips.get(SkipReason::SourceUnavailable), 1);
        assert_eq!(report.skips.get(SkipReason::UnknownStation), 1);

        let ito = store.get_latest_measurement("DL-ITO")?.unwrap();
        assert_eq!(ito.timestamp, ts(9, 30));
        assert_eq!(ito.get(Field::Pm25), Some(212.0));
        assert_eq!(ito.get(Field::No2Sat), Some(64.0));
        assert_eq!(ito.get(Field::No2), None);

        let rkp = store.get_latest_measurement("DL-RKP")?.unwrap();
        assert_eq!(rkp.get(Field::No2Sat), Some(51.0));
        assert_eq!(report.rows_upserted, 2);
        Ok(())
    }

    #[test]
    fn test_rejected_grid_is_skipped() -> Result<()> {
        let store = store();
        let scan_angles = FixedAdapter {
            name: "satellite",
            outputs: vec![AdapterOutput::Grid(GridBatch {
                label: "raw_swath.csv".to_string(),
                kind: GridKind::Satellite,
                field: Field::Aod,
                timestamp: ts(10, 0),
                cells: vec![GridCell::new(0.4, 0.7, 0.3), GridCell::new(1.1, 0.9, 0.2)],
            })],
        };

        let report = FusionPipeline::new(&Settings::default()).run_pass(&store, &store, &[&scan_angles], None)?;

        assert_eq!(report.grids_joined, 0);
        assert_eq!(report.rows_upserted, 0);
        assert_eq!(
            report.skips.get(SkipReason::GeometryMismatch) + report.skips.get(SkipReason::EmptyGrid),
            1
        );
        Ok(())
    }

    #[test]
    fn test_sync_stations_skips_invalid() -> Result<()> {
        let store = store();
        let mut report = PassReport::new();
        let added = FusionPipeline::new(&Settings::default()).sync_stations(
            &store,
            vec![
                Station::new("DL-ITO", "ITO, Delhi - CPCB", 28.70, 77.10),
                Station::new("NO-Sector_62", "Sector 62, Noida - UPPCB", 28.62, 77.36),
                Station::new("BAD", "Bad", 123.0, 77.0),
            ],
            &mut report,
        )?;

        assert_eq!(added, 1);
        assert_eq!(report.stations, 3);
        assert_eq!(report.skips.get(SkipReason::MalformedRecord), 1);
        Ok(())
    }
}
