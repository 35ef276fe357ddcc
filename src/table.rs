use crate::config::OutputConfig;
use crate::error::{PipelineError, Result};
use crate::period::{Granularity, Period};
use crate::schema::{MetricName, MetricPoint};
use crate::utils::{stage_file, write_atomic};
use arrow_array::{ArrayRef, Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema};
use chrono::{DateTime, NaiveDate, Utc};
use log::warn;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

/// Decimal places kept in published values.
pub const OUTPUT_SCALE: u32 = 6;

pub const PERIOD_COLUMN: &str = "period";

/// One row per period, one column per metric.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FinalMetricsTable {
    granularity: Granularity,
    rows: BTreeMap<NaiveDate, BTreeMap<MetricName, Decimal>>,
}

impl FinalMetricsTable {
    pub fn new(granularity: Granularity) -> Self {
        Self {
            granularity,
            rows: BTreeMap::new(),
        }
    }

    /// Ensures a row exists for `period` even if every cell ends up omitted.
    pub fn add_period(&mut self, period: &Period) {
        self.rows.entry(period.start).or_default();
    }

    /// Stores a point, replacing any earlier value for the same cell.
    pub fn insert(&mut self, point: &MetricPoint) -> Option<Decimal> {
        self.rows
            .entry(point.period)
            .or_default()
            .insert(point.metric, point.value)
    }

    pub fn get(&self, period: NaiveDate, metric: MetricName) -> Option<Decimal> {
        self.rows.get(&period)?.get(&metric).copied()
    }

    pub fn periods(&self) -> Vec<NaiveDate> {
        self.rows.keys().copied().collect()
    }

    /// Metrics with at least one value, in column order.
    pub fn columns(&self) -> Vec<MetricName> {
        self.rows
            .values()
            .flat_map(|cells| cells.keys().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn cell_count(&self) -> usize {
        self.rows.values().map(BTreeMap::len).sum()
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn to_csv_bytes(&self) -> Result<Vec<u8>> {
        let columns = self.columns();
        let mut writer = csv::Writer::from_writer(Vec::new());

        let mut header = vec![PERIOD_COLUMN.to_string()];
        header.extend(columns.iter().map(|metric| metric.as_str().to_string()));
        writer.write_record(&header)?;

        for (period, cells) in &self.rows {
            let mut record = vec![period.format("%Y-%m-%d").to_string()];
            record.extend(columns.iter().map(|metric| {
                cells
                    .get(metric)
                    .map(|value| format_value(*value))
                    .unwrap_or_default()
            }));
            writer.write_record(&record)?;
        }

        writer
            .into_inner()
            .map_err(|e| PipelineError::IoError(e.into_error()))
    }

    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        let columns = self.columns();

        let mut fields = vec![Field::new(PERIOD_COLUMN, DataType::Utf8, false)];
        fields.extend(
            columns
                .iter()
                .map(|metric| Field::new(metric.as_str(), DataType::Float64, true)),
        );
        let schema = Arc::new(Schema::new(fields));

        let periods = StringArray::from(
            self.rows
                .keys()
                .map(|period| period.format("%Y-%m-%d").to_string())
                .collect::<Vec<_>>(),
        );
        let mut arrays: Vec<ArrayRef> = vec![Arc::new(periods)];
        for metric in &columns {
            let values = Float64Array::from(
                self.rows
                    .values()
                    .map(|cells| cells.get(metric).and_then(|v| round(*v).to_f64()))
                    .collect::<Vec<_>>(),
            );
            arrays.push(Arc::new(values));
        }

        Ok(RecordBatch::try_new(schema, arrays)?)
    }

    pub fn to_parquet_bytes(&self) -> Result<Vec<u8>> {
        let batch = self.to_record_batch()?;
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let props = WriterProperties::builder()
            .set_created_by("saas-metrics-pipeline".to_string())
            .build();
        let mut writer = ArrowWriter::try_new(&mut cursor, batch.schema(), Some(props))?;
        writer.write(&batch)?;
        writer.close()?;
        Ok(cursor.into_inner())
    }

    pub fn summary_stats(&self) -> Vec<ColumnStats> {
        self.columns()
            .into_iter()
            .filter_map(|metric| {
                let values: Vec<Decimal> = self
                    .rows
                    .values()
                    .filter_map(|cells| cells.get(&metric).copied())
                    .collect();
                ColumnStats::from_values(metric, &values)
            })
            .collect()
    }

    pub fn summary_csv_bytes(&self) -> Result<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(["metric", "count", "min", "max", "mean"])?;
        for stats in self.summary_stats() {
            writer.write_record([
                stats.metric.as_str().to_string(),
                stats.count.to_string(),
                format_value(stats.min),
                format_value(stats.max),
                stats.mean.map(format_value).unwrap_or_default(),
            ])?;
        }
        writer
            .into_inner()
            .map_err(|e| PipelineError::IoError(e.into_error()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnStats {
    pub metric: MetricName,
    pub count: usize,
    pub min: Decimal,
    pub max: Decimal,
    /// `None` when the column total leaves the decimal range.
    pub mean: Option<Decimal>,
}

impl ColumnStats {
    fn from_values(metric: MetricName, values: &[Decimal]) -> Option<Self> {
        let min = values.iter().min().copied()?;
        let max = values.iter().max().copied()?;
        let mean = values
            .iter()
            .try_fold(Decimal::ZERO, |sum, value| sum.checked_add(*value))
            .and_then(|total| total.checked_div(Decimal::from(values.len())))
            .map(round);
        Some(Self {
            metric,
            count: values.len(),
            min,
            max,
            mean,
        })
    }
}

fn round(value: Decimal) -> Decimal {
    value.round_dp(OUTPUT_SCALE).normalize()
}

fn format_value(value: Decimal) -> String {
    round(value).to_string()
}

/// Where one run's artifacts are published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub dir: PathBuf,
    pub csv: PathBuf,
    pub parquet: PathBuf,
    pub summary: PathBuf,
    pub run_summary: PathBuf,
}

impl ArtifactPaths {
    pub fn for_run(output: &OutputConfig, run_at: DateTime<Utc>) -> Self {
        let dir = if output.monthly_partition {
            output.dir.join(run_at.format("%Y-%m").to_string())
        } else {
            output.dir.clone()
        };
        let stem = &output.file_stem;
        Self {
            csv: dir.join(format!("{}.csv", stem)),
            parquet: dir.join(format!("{}.parquet", stem)),
            summary: dir.join(format!("{}_summary.csv", stem)),
            run_summary: dir.join("run_summary.json"),
            dir,
        }
    }
}

/// Artifact bytes rendered in memory, ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedArtifacts {
    pub csv: Vec<u8>,
    pub parquet: Vec<u8>,
    pub summary: Vec<u8>,
}

impl RenderedArtifacts {
    pub fn render(table: &FinalMetricsTable) -> Result<Self> {
        Ok(Self {
            csv: table.to_csv_bytes()?,
            parquet: table.to_parquet_bytes()?,
            summary: table.summary_csv_bytes()?,
        })
    }

    /// Replaces the artifacts as a set. Every file is staged beside its
    /// target before the first rename; if a rename fails, the targets already
    /// replaced get their previous contents back.
    pub fn write_to(&self, paths: &ArtifactPaths) -> Result<()> {
        std::fs::create_dir_all(&paths.dir)?;

        let mut staged = Vec::new();
        for (path, contents) in [
            (&paths.csv, &self.csv),
            (&paths.parquet, &self.parquet),
            (&paths.summary, &self.summary),
        ] {
            let previous = if path.is_file() {
                Some(std::fs::read(path)?)
            } else {
                None
            };
            staged.push((path, stage_file(&paths.dir, contents)?, previous));
        }

        let mut replaced: Vec<(&PathBuf, Option<Vec<u8>>)> = Vec::new();
        for (path, tmp, previous) in staged {
            if let Err(e) = tmp.persist(path) {
                roll_back(&replaced);
                return Err(PipelineError::IoError(e.error));
            }
            replaced.push((path, previous));
        }
        Ok(())
    }
}

fn roll_back(replaced: &[(&PathBuf, Option<Vec<u8>>)]) {
    for (path, previous) in replaced.iter().rev() {
        let restored = match previous {
            Some(contents) => write_atomic(path, contents),
            None => std::fs::remove_file(path).map_err(PipelineError::from),
        };
        if let Err(e) = restored {
            warn!("Could not restore {}: {}", path.display(), e);
        }
    }
}
