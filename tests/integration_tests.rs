use aq_fusion::adapters::{AdapterOutput, GridFileAdapter, SourceAdapter};
use aq_fusion::error::{PipelineError, Result};
use aq_fusion::models::{
    Field, GridBatch, GridCell, GridKind, Measurement, MeasurementPatch, PredictionPoint, PredictionSet,
    Reading, SourceKind, Station, StationRegistry,
};
use aq_fusion::processors::{
    Candidate, FallbackGenerator, ForecastEngine, FusionEngine, FusionPipeline, Origin, SkipLog, SkipReason,
    SpatialJoiner, ValueResolver,
};
use aq_fusion::settings::{ForecastSettings, GridSourceSettings, Settings};
use aq_fusion::storage::{InMemoryStore, MeasurementStore};
use aq_fusion::writers::ParquetWriter;
use chrono::{DateTime, Duration, TimeZone, Utc};
use pretty_assertions::assert_eq;
use std::fs;
use tempfile::TempDir;

fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 11, 3, h, m, 0).unwrap()
}

fn delhi_stations() -> Vec<Station> {
    vec![
        Station::new("DL-ITO", "ITO, Delhi - CPCB", 28.70, 77.10),
        Station::new("DL-Anand_Vihar", "Anand Vihar, Delhi - DPCC", 28.6476, 77.3158),
        Station::new("DL-Unlocated", "Unlocated, Delhi - DPCC", 0.0, 0.0),
    ]
}

struct StaticAdapter {
    name: &'static str,
    outputs: Vec<AdapterOutput>,
}

impl SourceAdapter for StaticAdapter {
    fn name(&self) -> &str {
        self.name
    }

    fn collect(&self, _registry: &StationRegistry, _skips: &mut SkipLog) -> Result<Vec<AdapterOutput>> {
        Ok(self.outputs.clone())
    }
}

struct Fixed(f64);

impl FallbackGenerator for Fixed {
    fn generate(&mut self, _field: Field) -> Option<f64> {
        Some(self.0)
    }
}

#[test]
fn test_upsert_with_disjoint_fields_is_order_independent() -> Result<()> {
    let a = MeasurementPatch::new().observed(Field::Pm25, 212.0);
    let b = MeasurementPatch::new().observed(Field::TempC, 17.5).observed(Field::WindSpeed10m, 4.2);

    let forward = InMemoryStore::with_stations(delhi_stations());
    forward.upsert_measurement("DL-ITO", at(9, 30), &a)?;
    forward.upsert_measurement("DL-ITO", at(9, 30), &b)?;
    forward.upsert_measurement("DL-ITO", at(9, 30), &a)?;

    let backward = InMemoryStore::with_stations(delhi_stations());
    backward.upsert_measurement("DL-ITO", at(9, 30), &b)?;
    backward.upsert_measurement("DL-ITO", at(9, 30), &a)?;

    let mut left = forward.get_latest_measurement("DL-ITO")?.unwrap();
    let mut right = backward.get_latest_measurement("DL-ITO")?.unwrap();
    left.id = None;
    right.id = None;
    assert_eq!(left, right);
    assert_eq!(forward.measurement_count()?, 1);
    Ok(())
}

#[test]
fn test_dedup_removes_exactly_the_surplus() -> Result<()> {
    let store = InMemoryStore::with_stations(delhi_stations());
    let keys = [("DL-ITO", at(9, 0)), ("DL-ITO", at(10, 0)), ("DL-Anand_Vihar", at(9, 0))];
    let copies = [3, 1, 4];

    for ((station, ts), n) in keys.iter().zip(copies) {
        for i in 0..n {
            store.insert_raw(Measurement::new(*station, *ts).with_value(Field::Pm25, 100.0 + i as f64))?;
        }
    }
    let total = store.measurement_count()?;
    assert_eq!(total, 8);

    let removed = FusionEngine::default().prepare(&store)?;
    assert_eq!(removed, total - keys.len());
    assert_eq!(store.measurement_count()?, keys.len());
    assert!(store.is_unique_enforced()?);

    // lowest id of each key survives
    let kept = store.get_latest_measurement("DL-Anand_Vihar")?.unwrap();
    assert_eq!(kept.get(Field::Pm25), Some(100.0));

    let err = store.insert_raw(Measurement::new("DL-ITO", at(9, 0))).unwrap_err();
    assert!(matches!(err, PipelineError::StorageConflict(_)));
    Ok(())
}

#[test]
fn test_fallback_fills_when_every_source_is_absent() {
    let mut resolver = ValueResolver::new().with_fallback(Box::new(Fixed(42.5)), [Field::Pm25]);
    let candidates = [
        Candidate::new(SourceKind::GroundSensor, None::<f64>),
        Candidate::new(SourceKind::Satellite, "NA"),
    ];

    let resolution = resolver.resolve("DL-ITO", at(9, 30), Field::Pm25, &candidates).unwrap();
    assert_eq!(resolution.value, 42.5);
    assert_eq!(resolution.origin, Origin::Generated);

    // fields without fallback stay absent rather than becoming zero
    assert!(resolver.resolve("DL-ITO", at(9, 30), Field::No2, &candidates).is_none());
}

#[test]
fn test_generated_value_never_overwrites_a_real_one() -> Result<()> {
    let store = InMemoryStore::with_stations(delhi_stations());
    store.upsert_measurement("DL-ITO", at(9, 30), &MeasurementPatch::new().observed(Field::Pm25, 188.0))?;
    let row = store.upsert_measurement("DL-ITO", at(9, 30), &MeasurementPatch::new().generated(Field::Pm25, 42.5))?;

    assert_eq!(row.get(Field::Pm25), Some(188.0));
    assert!(!row.is_generated(Field::Pm25));
    Ok(())
}

#[test]
fn test_joiner_picks_nearest_cell_inside_cutoff() {
    let registry = StationRegistry::new(vec![Station::new("S", "Station S", 28.70, 77.10)]);
    let cells = [GridCell::new(28.70, 77.12, 0.61), GridCell::new(28.70, 77.18, 0.93)];

    let outcome = SpatialJoiner::new(0.05).join(&registry, &cells).unwrap();
    assert_eq!(outcome.matches.len(), 1);
    assert_eq!(outcome.matches[0].cell, cells[0]);
    assert!(outcome.matches.iter().all(|m| m.distance_deg <= 0.05));

    let strict = SpatialJoiner::new(0.01).join(&registry, &cells).unwrap();
    assert!(strict.matches.is_empty());
    assert_eq!(strict.unmatched_stations, vec!["S".to_string()]);
}

#[test]
fn test_pass_with_grid_files_then_forecast() -> Result<()> {
    let dir = TempDir::new()?;
    fs::write(
        dir.path().join("aod_20241103T0945.csv"),
        "latitude,longitude,value\n28.70,77.11,0.58\n28.65,77.31,NA\n",
    )?;

    let store = InMemoryStore::with_stations(delhi_stations());

    // history for training: pm25 tracks pm10
    let start = at(0, 0) - Duration::days(2);
    for i in 0..30 {
        let pm10 = 120.0 + (i as f64 * 7.0) % 60.0;
        let station = if i % 2 == 0 { "DL-ITO" } else { "DL-Anand_Vihar" };
        store.upsert_measurement(
            station,
            start + Duration::hours(i),
            &MeasurementPatch::new()
                .observed(Field::Pm10, pm10)
                .observed(Field::Pm25, 0.6 * pm10),
        )?;
    }

    let ground = StaticAdapter {
        name: "ground",
        outputs: vec![AdapterOutput::Readings(vec![
            Reading::new("ITO, Delhi - CPCB", at(9, 30), SourceKind::GroundSensor, Field::Pm25, "231"),
            Reading::new("ITO, Delhi - CPCB", at(9, 30), SourceKind::GroundSensor, Field::Pm10, "380"),
            Reading::new("Anand Vihar, Delhi - DPCC", at(9, 30), SourceKind::GroundSensor, Field::Pm25, "-999"),
        ])],
    };
    let satellite = GridFileAdapter::new(GridSourceSettings {
        dir: dir.path().to_path_buf(),
        kind: GridKind::Satellite,
        field: Field::Aod,
        extension: "csv".to_string(),
        use_mmap: true,
    });

    let settings = Settings::default();
    let report = FusionPipeline::new(&settings)
        .with_max_workers(2)
        .run_pass(&store, &store, &[&ground, &satellite], None)?;

    assert_eq!(report.grids_joined, 1);
    assert!(report.generate_summary().contains("Grids joined: 1"));

    let ito = store.get_latest_measurement("DL-ITO")?.unwrap();
    assert_eq!(ito.timestamp, at(9, 30));
    assert_eq!(ito.get(Field::Pm25), Some(231.0));
    assert_eq!(ito.get(Field::Aod), Some(0.58));

    // a sentinel-only reading produces no row at all
    let anand_vihar = store.get_latest_measurement("DL-Anand_Vihar")?.unwrap();
    assert!(anand_vihar.timestamp < at(9, 0));

    // re-running the same pass changes nothing
    let before = store.measurement_count()?;
    FusionPipeline::new(&settings).run_pass(&store, &store, &[&ground, &satellite], None)?;
    assert_eq!(store.measurement_count()?, before);

    let mut stale = PredictionSet::new();
    stale.insert("RETIRED".to_string(), vec![PredictionPoint::new(at(8, 0), 90.0, 0.5)]);
    store.replace_all_predictions(&stale)?;

    let forecast = ForecastEngine::new(ForecastSettings {
        predictors: vec![Field::Pm10],
        ..ForecastSettings::default()
    });
    let run = forecast.run(&store, at(10, 5))?;

    assert_eq!(run.stations_predicted, 2);
    assert_eq!(run.skips.get(SkipReason::NoSnapshot), 1);

    let predictions = store.get_predictions(None)?;
    assert_eq!(predictions.len(), 96);
    assert!(predictions.iter().all(|p| p.predicted_pm25 >= 5.0));
    assert!(predictions.iter().all(|p| p.station_id != "RETIRED"));
    for station in ["DL-ITO", "DL-Anand_Vihar"] {
        let points = store.get_predictions(Some(station))?;
        assert_eq!(points.len(), 48);
        assert_eq!(points[0].forecast_timestamp, at(11, 0));
    }

    let export = dir.path().join("predictions.parquet");
    let written = ParquetWriter::new().write_predictions(&predictions, &export)?;
    assert_eq!(written, 96);
    Ok(())
}

#[test]
fn test_forecast_with_too_little_history_keeps_predictions() -> Result<()> {
    let store = InMemoryStore::with_stations(delhi_stations());
    for i in 0..8 {
        store.upsert_measurement(
            "DL-ITO",
            at(0, 0) + Duration::hours(i),
            &MeasurementPatch::new().observed(Field::Pm25, 150.0 + i as f64),
        )?;
    }

    let mut kept = PredictionSet::new();
    kept.insert("DL-ITO".to_string(), vec![PredictionPoint::new(at(12, 0), 160.0, 0.6)]);
    store.replace_all_predictions(&kept)?;

    let err = ForecastEngine::from_settings(&ForecastSettings::default())
        .run(&store, at(10, 0))
        .unwrap_err();
    assert!(matches!(err, PipelineError::InsufficientTrainingData { available: 8, .. }));
    assert!(err.halts_run());

    let predictions = store.get_predictions(None)?;
    assert_eq!(predictions.len(), 1);
    assert_eq!(predictions[0].predicted_pm25, 160.0);
    Ok(())
}

#[test]
fn test_grid_batch_from_adapter_matches_manual_join() -> Result<()> {
    let dir = TempDir::new()?;
    fs::write(dir.path().join("no2_20241103T1000.csv"), "lat,lon,value\n28.70,77.10,55.0\n")?;

    let adapter = GridFileAdapter::new(GridSourceSettings {
        dir: dir.path().to_path_buf(),
        kind: GridKind::Satellite,
        field: Field::No2Sat,
        extension: "csv".to_string(),
        use_mmap: false,
    });
    let registry = StationRegistry::new(delhi_stations());
    let outputs = adapter.collect(&registry, &mut SkipLog::default())?;

    let batch: &GridBatch = match &outputs[0] {
        AdapterOutput::Grid(batch) => batch,
        AdapterOutput::Readings(_) => panic!("expected a grid"),
    };
    assert_eq!(batch.timestamp, at(10, 0));

    let joined = SpatialJoiner::new(0.1).join_batch(&registry, batch)?;
    assert_eq!(joined.matches.len(), 1);
    assert_eq!(joined.matches[0].station_id, "DL-ITO");
    assert_eq!(joined.unmatched_stations, vec!["DL-Anand_Vihar".to_string()]);
    Ok(())
}
