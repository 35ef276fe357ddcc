use crate::schema::{EntityType, MetricName, Source};
use chrono::NaiveDate;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Schema mismatch for {entity} record '{external_id}', field '{field}': {details}")]
    SchemaMismatch {
        entity: EntityType,
        external_id: String,
        field: String,
        details: String,
    },

    #[error("Metric {metric} is undefined for period {period}: {details}")]
    DivisionUndefined {
        metric: MetricName,
        period: NaiveDate,
        details: String,
    },

    #[error("Store integrity violation: {0}")]
    StoreIntegrity(String),

    #[error("No {entity} data available from {origin}")]
    ExternalDataUnavailable { origin: Source, entity: EntityType },

    #[error("Invalid pipeline stage transition from {from} to {to}")]
    InvalidStageTransition { from: String, to: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Date calculation error: {0}")]
    DateError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Parquet error: {0}")]
    ParquetError(#[from] parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    ArrowError(#[from] arrow_schema::ArrowError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl PipelineError {
    /// Faults that invalidate the whole table rather than a single row or cell.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::SchemaMismatch { .. }
                | Self::DivisionUndefined { .. }
                | Self::ExternalDataUnavailable { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
