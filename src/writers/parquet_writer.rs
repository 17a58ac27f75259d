use crate::error::{PipelineError, Result};
use crate::models::{Field, Measurement, Prediction};
use crate::utils::constants::{
    COMPRESSION_GZIP, COMPRESSION_LZ4, COMPRESSION_NONE, COMPRESSION_SNAPPY, COMPRESSION_ZSTD,
    DEFAULT_ROW_GROUP_SIZE,
};
use arrow::array::*;
use arrow::datatypes::{DataType, Field as ArrowField, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, GzipLevel, ZstdLevel};
use parquet::file::properties::WriterProperties;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

const UTC: &str = "UTC";

pub struct ParquetWriter {
    compression: Compression,
    row_group_size: usize,
}

impl ParquetWriter {
    pub fn new() -> Self {
        Self {
            compression: Compression::SNAPPY,
            row_group_size: DEFAULT_ROW_GROUP_SIZE,
        }
    }

    pub fn with_compression(mut self, compression: &str) -> Result<Self> {
        self.compression = match compression.to_lowercase().as_str() {
            COMPRESSION_SNAPPY => Compression::SNAPPY,
            COMPRESSION_GZIP => Compression::GZIP(GzipLevel::default()),
            COMPRESSION_LZ4 => Compression::LZ4,
            COMPRESSION_ZSTD => Compression::ZSTD(ZstdLevel::default()),
            COMPRESSION_NONE => Compression::UNCOMPRESSED,
            _ => {
                return Err(PipelineError::Config(format!(
                    "Unsupported compression: {}",
                    compression
                )))
            }
        };
        Ok(self)
    }

    pub fn with_row_group_size(mut self, size: usize) -> Self {
        self.row_group_size = size.max(1);
        self
    }

    fn properties(&self) -> WriterProperties {
        WriterProperties::builder()
            .set_compression(self.compression)
            .set_max_row_group_size(self.row_group_size)
            .build()
    }

    /// Write canonical rows, one column per tracked field. Absent slots are
    /// nulls, never zeros. Returns the number of rows written.
    pub fn write_measurements(&self, records: &[Measurement], path: &Path) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let schema = measurement_schema();
        let file = File::create(path)?;
        let mut writer = ArrowWriter::try_new(file, schema.clone(), Some(self.properties()))?;

        for chunk in records.chunks(self.row_group_size) {
            let batch = measurements_to_batch(chunk, schema.clone())?;
            writer.write(&batch)?;
        }

        writer.close()?;
        tracing::info!(rows = records.len(), path = %path.display(), "Wrote measurements");
        Ok(records.len())
    }

    pub fn write_predictions(&self, records: &[Prediction], path: &Path) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let schema = prediction_schema();
        let file = File::create(path)?;
        let mut writer = ArrowWriter::try_new(file, schema.clone(), Some(self.properties()))?;

        for chunk in records.chunks(self.row_group_size) {
            let batch = predictions_to_batch(chunk, schema.clone())?;
            writer.write(&batch)?;
        }

        writer.close()?;
        tracing::info!(rows = records.len(), path = %path.display(), "Wrote predictions");
        Ok(records.len())
    }

    /// Get file statistics
    pub fn get_file_info(&self, path: &Path) -> Result<ParquetFileInfo> {
        use parquet::file::reader::{FileReader, SerializedFileReader};

        let file = File::open(path)?;
        let reader = SerializedFileReader::new(file)?;
        let metadata = reader.metadata();

        let row_groups = metadata.num_row_groups();
        let row_group_sizes = (0..row_groups)
            .map(|i| metadata.row_group(i).num_rows())
            .collect();

        Ok(ParquetFileInfo {
            total_rows: metadata.file_metadata().num_rows(),
            row_groups: row_groups as i32,
            row_group_sizes,
            file_size: std::fs::metadata(path)?.len(),
            compression: self.compression,
        })
    }
}

impl Default for ParquetWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn timestamp_type() -> DataType {
    DataType::Timestamp(TimeUnit::Microsecond, Some(UTC.into()))
}

fn measurement_schema() -> Arc<Schema> {
    let mut fields = vec![
        ArrowField::new("id", DataType::Int64, true),
        ArrowField::new("station_id", DataType::Utf8, false),
        ArrowField::new("timestamp", timestamp_type(), false),
    ];
    fields.extend(
        Field::ALL
            .iter()
            .map(|f| ArrowField::new(f.column(), DataType::Float64, true)),
    );
    fields.push(ArrowField::new("generated_fields", DataType::Utf8, false));

    Arc::new(Schema::new(fields))
}

fn prediction_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        ArrowField::new("station_id", DataType::Utf8, false),
        ArrowField::new("forecast_timestamp", timestamp_type(), false),
        ArrowField::new("predicted_pm25", DataType::Float64, false),
        ArrowField::new("confidence", DataType::Float64, false),
    ]))
}

fn measurements_to_batch(records: &[Measurement], schema: Arc<Schema>) -> Result<RecordBatch> {
    let ids: Vec<Option<i64>> = records.iter().map(|r| r.id).collect();
    let station_ids: Vec<&str> = records.iter().map(|r| r.station_id.as_str()).collect();
    let timestamps: Vec<i64> = records.iter().map(|r| r.timestamp.timestamp_micros()).collect();
    let generated: Vec<String> = records
        .iter()
        .map(|r| {
            r.generated_fields
                .iter()
                .map(|f| f.column())
                .collect::<Vec<_>>()
                .join(",")
        })
        .collect();

    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(ids)),
        Arc::new(StringArray::from(station_ids)),
        Arc::new(TimestampMicrosecondArray::from(timestamps).with_timezone(UTC)),
    ];
    for field in Field::ALL {
        let values: Vec<Option<f64>> = records.iter().map(|r| r.get(field)).collect();
        columns.push(Arc::new(Float64Array::from(values)));
    }
    columns.push(Arc::new(StringArray::from(generated)));

    Ok(RecordBatch::try_new(schema, columns)?)
}

fn predictions_to_batch(records: &[Prediction], schema: Arc<Schema>) -> Result<RecordBatch> {
    let station_ids: Vec<&str> = records.iter().map(|r| r.station_id.as_str()).collect();
    let timestamps: Vec<i64> = records
        .iter()
        .map(|r| r.forecast_timestamp.timestamp_micros())
        .collect();
    let values: Vec<f64> = records.iter().map(|r| r.predicted_pm25).collect();
    let confidences: Vec<f64> = records.iter().map(|r| r.confidence).collect();

    Ok(RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(station_ids)),
            Arc::new(TimestampMicrosecondArray::from(timestamps).with_timezone(UTC)),
            Arc::new(Float64Array::from(values)),
            Arc::new(Float64Array::from(confidences)),
        ],
    )?)
}

#[derive(Debug)]
pub struct ParquetFileInfo {
    pub total_rows: i64,
    pub row_groups: i32,
    pub row_group_sizes: Vec<i64>,
    pub file_size: u64,
    pub compression: Compression,
}

impl ParquetFileInfo {
    pub fn summary(&self) -> String {
        format!(
            "Parquet File Summary:\n\
            - Total rows: {}\n\
            - Row groups: {}\n\
            - File size: {:.2} MB\n\
            - Compression: {:?}\n\
            - Avg rows per group: {:.0}",
            self.total_rows,
            self.row_groups,
            self.file_size as f64 / 1_048_576.0,
            self.compression,
            self.total_rows as f64 / self.row_groups.max(1) as f64
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use tempfile::NamedTempFile;

    fn rows(n: usize) -> Vec<Measurement> {
        let start = Utc.with_ymd_and_hms(2024, 11, 3, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                let mut m = Measurement::new("DL-ITO", start + Duration::hours(i as i64))
                    .with_value(Field::Pm25, 100.0 + i as f64);
                m.id = Some(i as i64 + 1);
                m
            })
            .collect()
    }

    #[test]
    fn test_write_empty_records() {
        let writer = ParquetWriter::new();
        let temp_file = NamedTempFile::new().unwrap();

        assert_eq!(writer.write_measurements(&[], temp_file.path()).unwrap(), 0);
        assert_eq!(writer.write_predictions(&[], temp_file.path()).unwrap(), 0);
    }

    #[test]
    fn test_absent_fields_are_nulls() -> Result<()> {
        let writer = ParquetWriter::new();
        let temp_file = NamedTempFile::new()?;
        writer.write_measurements(&rows(3), temp_file.path())?;

        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(temp_file.path())?)?.build()?;
        let batches: Vec<RecordBatch> = reader.collect::<std::result::Result<_, _>>()?;
        let batch = &batches[0];

        let pm25 = batch.column_by_name("pm25").unwrap();
        let no2 = batch.column_by_name("no2").unwrap();
        assert_eq!(pm25.null_count(), 0);
        assert_eq!(no2.null_count(), 3);
        Ok(())
    }

    #[test]
    fn test_row_groups_follow_configured_size() -> Result<()> {
        let writer = ParquetWriter::new().with_row_group_size(4);
        let temp_file = NamedTempFile::new()?;
        writer.write_measurements(&rows(10), temp_file.path())?;

        let info = writer.get_file_info(temp_file.path())?;
        assert_eq!(info.total_rows, 10);
        assert_eq!(info.row_group_sizes, vec![4, 4, 2]);
        assert!(info.summary().contains("Total rows: 10"));
        Ok(())
    }

    #[test]
    fn test_different_compressions() -> Result<()> {
        let prediction = Prediction {
            station_id: "DL-ITO".to_string(),
            forecast_timestamp: Utc.with_ymd_and_hms(2024, 11, 3, 11, 0, 0).unwrap(),
            predicted_pm25: 182.4,
            confidence: 0.71,
        };

        for compression in ["snappy", "gzip", "lz4", "zstd", "none"] {
            let writer = ParquetWriter::new().with_compression(compression)?;
            let temp_file = NamedTempFile::new()?;
            let result = writer.write_predictions(std::slice::from_ref(&prediction), temp_file.path());
            assert!(result.is_ok(), "Failed with compression: {}", compression);
        }

        assert!(ParquetWriter::new().with_compression("brotli9").is_err());
        Ok(())
    }
}
