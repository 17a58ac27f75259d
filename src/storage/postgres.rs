use chrono::{DateTime, Duration, Utc};
use postgres::types::ToSql;
use postgres::{Client, GenericClient, NoTls, Row};
use std::sync::{Mutex, MutexGuard};

use super::{MeasurementStore, StoreConnector};
use crate::error::{PipelineError, Result};
use crate::models::{Field, Measurement, MeasurementPatch, Prediction, PredictionSet, Station};

const UNIQUE_CONSTRAINT: &str = "measurements_station_timestamp_key";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS stations (
    id VARCHAR(50) PRIMARY KEY,
    name TEXT NOT NULL,
    latitude DOUBLE PRECISION NOT NULL,
    longitude DOUBLE PRECISION NOT NULL,
    city TEXT
);

CREATE TABLE IF NOT EXISTS measurements (
    id BIGSERIAL PRIMARY KEY,
    station_id VARCHAR(50) NOT NULL,
    timestamp TIMESTAMPTZ NOT NULL,
    pm25 DOUBLE PRECISION,
    pm10 DOUBLE PRECISION,
    no2 DOUBLE PRECISION,
    so2 DOUBLE PRECISION,
    co DOUBLE PRECISION,
    o3 DOUBLE PRECISION,
    aqi DOUBLE PRECISION,
    temp_c DOUBLE PRECISION,
    wind_speed_10m DOUBLE PRECISION,
    wind_speed_80m DOUBLE PRECISION,
    wind_dir DOUBLE PRECISION,
    pbl_height DOUBLE PRECISION,
    aod DOUBLE PRECISION,
    no2_sat DOUBLE PRECISION,
    so2_sat DOUBLE PRECISION,
    generated_fields TEXT[] NOT NULL DEFAULT '{}',
    CONSTRAINT measurements_station_timestamp_key UNIQUE (station_id, timestamp)
);

CREATE INDEX IF NOT EXISTS measurements_timestamp_idx ON measurements (timestamp DESC);

CREATE TABLE IF NOT EXISTS predictions (
    id BIGSERIAL PRIMARY KEY,
    station_id VARCHAR(50) NOT NULL,
    forecast_timestamp TIMESTAMPTZ NOT NULL,
    predicted_pm25 DOUBLE PRECISION NOT NULL,
    confidence DOUBLE PRECISION NOT NULL,
    UNIQUE (station_id, forecast_timestamp)
);
";

/// Comma-separated measurement column list in `Field::ALL` order.
fn measurement_columns() -> String {
    let mut columns = vec!["id", "station_id", "timestamp"];
    columns.extend(Field::ALL.iter().map(|f| f.column()));
    columns.push("generated_fields");
    columns.join(", ")
}

fn measurement_from_row(row: &Row) -> Result<Measurement> {
    let mut measurement = Measurement::new(
        row.try_get::<_, String>("station_id")?,
        row.try_get::<_, DateTime<Utc>>("timestamp")?,
    );
    measurement.id = Some(row.try_get("id")?);

    for field in Field::ALL {
        if let Some(value) = row.try_get::<_, Option<f64>>(field.column())? {
            measurement.values.insert(field, value);
        }
    }

    for name in row.try_get::<_, Vec<String>>("generated_fields")? {
        match name.parse::<Field>() {
            Ok(field) => {
                measurement.generated_fields.insert(field);
            }
            Err(_) => tracing::warn!(column = %name, "Ignoring unknown generated field"),
        }
    }

    Ok(measurement)
}

fn station_from_row(row: &Row) -> Result<Station> {
    let mut station = Station::new(
        row.try_get::<_, String>("id")?,
        row.try_get::<_, String>("name")?,
        row.try_get("latitude")?,
        row.try_get("longitude")?,
    );
    station.city = row.try_get("city")?;
    Ok(station)
}

/// Relational store backed by one PostgreSQL connection.
pub struct PostgresStore {
    client: Mutex<Client>,
}

impl PostgresStore {
    /// Open a connection without touching the schema.
    pub fn open(url: &str) -> Result<Self> {
        let client = Client::connect(url, NoTls)?;
        Ok(Self {
            client: Mutex::new(client),
        })
    }

    /// Open a connection and bootstrap the schema.
    pub fn connect(url: &str) -> Result<Self> {
        let store = Self::open(url)?;
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn ensure_schema(&self) -> Result<()> {
        self.client()?.batch_execute(SCHEMA)?;
        tracing::debug!("Schema bootstrap complete");
        Ok(())
    }

    fn client(&self) -> Result<MutexGuard<'_, Client>> {
        self.client
            .lock()
            .map_err(|_| PipelineError::StorageConflict("database connection lock poisoned".to_string()))
    }

    fn select_measurements(
        client: &mut impl GenericClient,
        tail: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Measurement>> {
        let sql = format!("SELECT {} FROM measurements {}", measurement_columns(), tail);
        client
            .query(sql.as_str(), params)?
            .iter()
            .map(measurement_from_row)
            .collect()
    }
}

impl MeasurementStore for PostgresStore {
    fn get_stations(&self) -> Result<Vec<Station>> {
        let mut client = self.client()?;
        client
            .query(
                "SELECT id, name, latitude, longitude, city FROM stations ORDER BY id",
                &[],
            )?
            .iter()
            .map(station_from_row)
            .collect()
    }

    fn register_stations(&self, stations: &[Station]) -> Result<usize> {
        let mut client = self.client()?;
        let mut tx = client.transaction()?;
        let mut added = 0;

        for station in stations {
            added += tx.execute(
                "INSERT INTO stations (id, name, latitude, longitude, city)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (id) DO NOTHING",
                &[
                    &station.id,
                    &station.name,
                    &station.latitude,
                    &station.longitude,
                    &station.city,
                ],
            )? as usize;
        }

        tx.commit()?;
        Ok(added)
    }

    /// Lock the row (inserting it when absent) and merge in Rust so the
    /// coalesce rules live in one place (`Measurement::merge`).
    fn upsert_measurement(
        &self,
        station_id: &str,
        timestamp: DateTime<Utc>,
        patch: &MeasurementPatch,
    ) -> Result<Measurement> {
        let mut client = self.client()?;
        let mut tx = client.transaction()?;

        // lowest id wins while legacy duplicates await dedup
        const LOCK_ROW: &str =
            "WHERE station_id = $1 AND timestamp = $2 ORDER BY id LIMIT 1 FOR UPDATE";

        let mut row = match Self::select_measurements(&mut tx, LOCK_ROW, &[&station_id, &timestamp])?.pop() {
            Some(row) => row,
            None => {
                // a concurrent writer may win the insert; the unique key absorbs it
                tx.execute(
                    "INSERT INTO measurements (station_id, timestamp) VALUES ($1, $2)
                     ON CONFLICT DO NOTHING",
                    &[&station_id, &timestamp],
                )?;
                Self::select_measurements(&mut tx, LOCK_ROW, &[&station_id, &timestamp])?
                    .pop()
                    .ok_or_else(|| {
                        PipelineError::StorageConflict(format!(
                            "row ({}, {}) missing after insert",
                            station_id, timestamp
                        ))
                    })?
            }
        };

        if row.merge(patch) > 0 {
            let assignments: Vec<String> = Field::ALL
                .iter()
                .enumerate()
                .map(|(i, f)| format!("{} = ${}", f.column(), i + 1))
                .collect();
            let sql = format!(
                "UPDATE measurements SET {}, generated_fields = ${} WHERE id = ${}",
                assignments.join(", "),
                Field::ALL.len() + 1,
                Field::ALL.len() + 2
            );

            let values: Vec<Option<f64>> = Field::ALL.iter().map(|f| row.get(*f)).collect();
            let generated: Vec<String> = row
                .generated_fields
                .iter()
                .map(|f| f.column().to_string())
                .collect();
            let id = row.id.unwrap_or_default();

            let mut params: Vec<&(dyn ToSql + Sync)> =
                values.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
            params.push(&generated);
            params.push(&id);

            tx.execute(sql.as_str(), &params)?;
        }

        tx.commit()?;
        Ok(row)
    }

    fn find_measurement_near(
        &self,
        station_id: &str,
        timestamp: DateTime<Utc>,
        window: Duration,
    ) -> Result<Option<DateTime<Utc>>> {
        let mut client = self.client()?;
        let lower = timestamp - window;
        let upper = timestamp + window;

        let row = client.query_opt(
            "SELECT timestamp FROM measurements
             WHERE station_id = $1 AND timestamp BETWEEN $2 AND $3
             ORDER BY ABS(EXTRACT(EPOCH FROM (timestamp - $4::timestamptz))), timestamp
             LIMIT 1",
            &[&station_id, &lower, &upper, &timestamp],
        )?;

        Ok(match row {
            Some(row) => Some(row.try_get(0)?),
            None => None,
        })
    }

    fn get_recent_measurements(&self, limit: usize, required: Field) -> Result<Vec<Measurement>> {
        let mut client = self.client()?;
        let limit = limit as i64;
        let tail = format!(
            "WHERE {} IS NOT NULL ORDER BY timestamp DESC, id DESC LIMIT $1",
            required.column()
        );
        Self::select_measurements(&mut *client, &tail, &[&limit])
    }

    fn get_latest_measurement(&self, station_id: &str) -> Result<Option<Measurement>> {
        let mut client = self.client()?;
        let mut rows = Self::select_measurements(
            &mut *client,
            "WHERE station_id = $1 ORDER BY timestamp DESC, id DESC LIMIT 1",
            &[&station_id],
        )?;
        Ok(rows.pop())
    }

    fn all_measurements(&self) -> Result<Vec<Measurement>> {
        let mut client = self.client()?;
        Self::select_measurements(&mut *client, "ORDER BY station_id, timestamp", &[])
    }

    fn replace_all_predictions(&self, predictions: &PredictionSet) -> Result<usize> {
        let mut client = self.client()?;
        let mut tx = client.transaction()?;

        tx.execute("DELETE FROM predictions", &[])?;

        let insert = tx.prepare(
            "INSERT INTO predictions (station_id, forecast_timestamp, predicted_pm25, confidence)
             VALUES ($1, $2, $3, $4)",
        )?;

        let mut written = 0;
        for (station_id, points) in predictions {
            for point in points {
                tx.execute(
                    &insert,
                    &[
                        station_id,
                        &point.forecast_timestamp,
                        &point.predicted_pm25,
                        &point.confidence,
                    ],
                )?;
                written += 1;
            }
        }

        tx.commit()?;
        Ok(written)
    }

    fn get_predictions(&self, station_id: Option<&str>) -> Result<Vec<Prediction>> {
        let mut client = self.client()?;
        let rows = match station_id {
            Some(id) => client.query(
                "SELECT station_id, forecast_timestamp, predicted_pm25, confidence
                 FROM predictions WHERE station_id = $1 ORDER BY forecast_timestamp",
                &[&id],
            )?,
            None => client.query(
                "SELECT station_id, forecast_timestamp, predicted_pm25, confidence
                 FROM predictions ORDER BY station_id, forecast_timestamp",
                &[],
            )?,
        };

        rows.iter()
            .map(|row| {
                Ok(Prediction {
                    station_id: row.try_get("station_id")?,
                    forecast_timestamp: row.try_get("forecast_timestamp")?,
                    predicted_pm25: row.try_get("predicted_pm25")?,
                    confidence: row.try_get("confidence")?,
                })
            })
            .collect()
    }

    fn deduplicate_measurements(&self) -> Result<usize> {
        let mut client = self.client()?;
        let removed = client.execute(
            "DELETE FROM measurements a
             USING measurements b
             WHERE a.station_id = b.station_id
               AND a.timestamp = b.timestamp
               AND a.id > b.id",
            &[],
        )?;
        Ok(removed as usize)
    }

    fn ensure_unique_constraint(&self) -> Result<()> {
        let mut client = self.client()?;
        let existing = client.query_opt(
            "SELECT 1 FROM pg_constraint WHERE conname = $1",
            &[&UNIQUE_CONSTRAINT],
        )?;
        if existing.is_some() {
            return Ok(());
        }

        let sql = format!(
            "ALTER TABLE measurements ADD CONSTRAINT {} UNIQUE (station_id, timestamp)",
            UNIQUE_CONSTRAINT
        );
        client.batch_execute(&sql).map_err(|e| {
            PipelineError::StorageConflict(format!("cannot enforce uniqueness: {}", e))
        })?;
        tracing::info!(constraint = UNIQUE_CONSTRAINT, "Added uniqueness constraint");
        Ok(())
    }
}

/// Opens one connection per caller; the schema is assumed bootstrapped.
#[derive(Debug, Clone)]
pub struct PostgresConnector {
    url: String,
}

impl PostgresConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl StoreConnector for PostgresConnector {
    fn connect(&self) -> Result<Box<dyn MeasurementStore>> {
        Ok(Box::new(PostgresStore::open(&self.url)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measurement_columns_follow_field_order() {
        let columns = measurement_columns();
        assert!(columns.starts_with("id, station_id, timestamp, pm25, pm10"));
        assert!(columns.ends_with("so2_sat, generated_fields"));
        assert_eq!(columns.split(", ").count(), Field::ALL.len() + 4);
    }

    #[test]
    fn test_schema_declares_unique_key() {
        assert!(SCHEMA.contains(&format!(
            "CONSTRAINT {} UNIQUE (station_id, timestamp)",
            UNIQUE_CONSTRAINT
        )));
    }

    #[test]
    fn test_schema_declares_every_field() {
        for field in Field::ALL {
            assert!(
                SCHEMA.contains(&format!("{} DOUBLE PRECISION", field.column())),
                "missing column {}",
                field
            );
        }
    }
}
