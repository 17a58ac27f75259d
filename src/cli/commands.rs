use chrono::Utc;

use crate::adapters::{GridFileAdapter, GroundSensorAdapter, SourceAdapter, WeatherModelAdapter};
use crate::analyzers::{assess, classify};
use crate::cli::args::{Cli, Commands, ExportKind, IngestSource};
use crate::error::{PipelineError, Result};
use crate::models::Field;
use crate::processors::{ForecastEngine, FusionEngine, FusionPipeline, PassReport};
use crate::settings::Settings;
use crate::storage::{MeasurementStore, PostgresConnector, PostgresStore};
use crate::utils::filename::generate_default_export_filename;
use crate::utils::logging::init_logging;
use crate::utils::progress::ProgressReporter;
use crate::writers::ParquetWriter;

fn database_url(settings: &Settings) -> Result<&str> {
    settings.database_url.as_deref().ok_or_else(|| {
        PipelineError::Config("database_url is not set (config file or AQF_DATABASE_URL)".to_string())
    })
}

fn build_adapters(settings: &Settings, source: IngestSource) -> Result<Vec<Box<dyn SourceAdapter>>> {
    let mut adapters: Vec<Box<dyn SourceAdapter>> = Vec::new();

    if matches!(source, IngestSource::Ground | IngestSource::All) {
        adapters.push(Box::new(GroundSensorAdapter::new(&settings.ground, &settings.http)?));
    }
    if matches!(source, IngestSource::Weather | IngestSource::All) {
        adapters.push(Box::new(WeatherModelAdapter::new(&settings.weather, &settings.http)?));
    }
    if matches!(source, IngestSource::Grid | IngestSource::All) {
        for grid in &settings.grid.sources {
            adapters.push(Box::new(GridFileAdapter::new(grid.clone())));
        }
    }

    Ok(adapters)
}

fn format_value(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.1}", v))
}

pub fn run(cli: Cli) -> Result<()> {
    init_logging(cli.verbose, cli.log_file.as_deref())?;

    let settings = Settings::load(cli.config.as_deref())?;
    let url = database_url(&settings)?;
    let store = PostgresStore::connect(url)?;

    match cli.command {
        Commands::SyncStations => {
            println!("Discovering stations in {} target cities...", settings.ground.target_cities.len());

            let spinner = ProgressReporter::new_spinner("Querying station listings...", cli.quiet);
            let adapter = GroundSensorAdapter::new(&settings.ground, &settings.http)?;
            let discovered = adapter.discover()?;
            spinner.finish_with_message(&format!("Discovered {} stations", discovered.len()));

            let mut report = PassReport::new();
            let added = FusionPipeline::new(&settings).sync_stations(&store, discovered, &mut report)?;

            println!("Registered {} new stations ({} total)", added, report.stations);
            if report.skips.total() > 0 {
                println!("\n{}", report.generate_summary());
            }
        }

        Commands::Ingest {
            source,
            max_workers,
        } => {
            let adapters = build_adapters(&settings, source)?;
            if adapters.is_empty() {
                println!("No sources configured for {:?}", source);
                return Ok(());
            }
            let adapter_refs: Vec<&dyn SourceAdapter> = adapters.iter().map(|a| a.as_ref()).collect();

            let mut pipeline = FusionPipeline::new(&settings);
            if let Some(n) = max_workers {
                pipeline = pipeline.with_max_workers(n);
            }

            let progress = ProgressReporter::new(0, "Starting pass...", cli.quiet);
            let connector = PostgresConnector::new(url);
            let report = pipeline.run_pass(&store, &connector, &adapter_refs, Some(&progress))?;

            println!("\n{}", report.generate_summary());
        }

        Commands::Dedup => {
            let removed = FusionEngine::from_settings(&settings.fusion).prepare(&store)?;
            println!("Removed {} duplicate rows; unique key on (station_id, timestamp) enforced", removed);
        }

        Commands::Forecast => {
            let engine = ForecastEngine::from_settings(&settings.forecast);
            let spinner = ProgressReporter::new_spinner("Training forecast model...", cli.quiet);
            let outcome = engine.run(&store, Utc::now());
            drop(spinner);
            match outcome {
                Ok(report) => println!("{}", report.generate_summary()),
                Err(e) if e.halts_run() => {
                    println!("Forecast skipped, existing predictions kept: {}", e);
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }

        Commands::Status { station_id } => {
            let mut stations = store.get_stations()?;
            if let Some(id) = &station_id {
                stations.retain(|s| &s.id == id);
                if stations.is_empty() {
                    return Err(PipelineError::StationNotFound {
                        station_id: id.clone(),
                    });
                }
            }

            println!(
                "{:<28} {:<17} {:>7} {:>7} {:>7}  {:<24} Advice",
                "Station", "Updated (UTC)", "PM2.5", "NO2", "AQI", "Likely source"
            );
            for station in &stations {
                let Some(latest) = store.get_latest_measurement(&station.id)? else {
                    println!("{:<28} no measurements yet", station.id);
                    continue;
                };

                let fingerprint = classify(&latest, &settings.heuristics);
                let advice = assess(&latest, &settings.heuristics)
                    .map(|a| format!("{}: {}", a.category, a.message))
                    .unwrap_or_else(|| "No data".to_string());

                println!(
                    "{:<28} {:<17} {:>7} {:>7} {:>7}  {:<24} {}",
                    station.id,
                    latest.timestamp.format("%Y-%m-%d %H:%M"),
                    format_value(latest.get(Field::Pm25)),
                    format_value(latest.get(Field::No2)),
                    format_value(latest.get(Field::Aqi)),
                    fingerprint.likely_source.to_string(),
                    advice
                );
            }

            if let Some(id) = &station_id {
                let predictions = store.get_predictions(Some(id))?;
                if let Some(next) = predictions.first() {
                    println!(
                        "\nNext forecast for {}: {:.1} {} at {} (confidence {:.2}, {} points)",
                        id,
                        next.predicted_pm25,
                        Field::Pm25.units(),
                        next.forecast_timestamp.format("%Y-%m-%d %H:%M"),
                        next.confidence,
                        predictions.len()
                    );
                }
            }
        }

        Commands::Export {
            what,
            output,
            compression,
        } => {
            let output = output.unwrap_or_else(|| generate_default_export_filename(what.dataset_name()));
            let writer = ParquetWriter::new().with_compression(&compression)?;

            if let Some(parent) = output.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let written = match what {
                ExportKind::Measurements => writer.write_measurements(&store.all_measurements()?, &output)?,
                ExportKind::Predictions => writer.write_predictions(&store.get_predictions(None)?, &output)?,
            };

            if written == 0 {
                println!("No records to write");
                return Ok(());
            }

            println!("Wrote {} {} to {}", written, what.dataset_name(), output.display());
            let file_info = writer.get_file_info(&output)?;
            println!("\n{}", file_info.summary());
        }
    }

    Ok(())
}
