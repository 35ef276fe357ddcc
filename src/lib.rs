//! # SaaS Metrics Pipeline
//!
//! A batch pipeline that turns raw billing and accounting records into one
//! business-metrics table (row = period, column = metric) for dashboards.
//!
//! ## Core Concepts
//!
//! - **Raw records**: subscriptions from the billing source; invoices,
//!   expenses and contacts from the accounting source, kept as opaque JSON
//! - **Normalizer**: flattens each raw payload into a canonical row with
//!   typed fields and derived monthly amounts
//! - **Incremental store**: canonical rows keyed by natural key, merged
//!   last-write-wins on the source timestamp, persisted between runs
//! - **Calculators**: MRR, ARR, churn, CAC, EBITDA, runway and friends,
//!   computed per period from a read-only view of the store, with expense
//!   categories resolved from tags at compute time
//! - **Driver**: runs `INIT -> NORMALIZING -> COMPUTING -> MERGING -> DONE`
//!   and publishes CSV + Parquet artifacts atomically
//!
//! ## Example
//!
//! ```rust,ignore
//! use saas_metrics_pipeline::*;
//! use std::path::Path;
//!
//! let config = PipelineConfig::from_file(Path::new("pipeline.json"))?;
//! let output = run_pipeline(&config, Box::new(LogFacadeSink))?;
//!
//! for period in output.table.periods() {
//!     println!("{} mrr={:?}", period, output.table.get(period, MetricName::Mrr));
//! }
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod ingestion;
pub mod logging;
pub mod metrics;
pub mod normalizer;
pub mod period;
pub mod schema;
pub mod store;
pub mod table;
pub mod utils;

pub use config::{OutputConfig, PipelineConfig};
pub use driver::{
    AggregationDriver, OmittedCell, PipelineStage, RunContext, RunOutput, RunSummary,
    UnavailableData,
};
pub use error::{PipelineError, Result};
pub use ingestion::{drain, JsonFileSource, SourceClient, StaticSource};
pub use logging::{LogFacadeSink, LogSink, MemorySink, PipelineEvent};
pub use metrics::{calculators, CategoryMap, MetricCalculator, StoreView};
pub use normalizer::{EntitySchema, FieldKind, FieldSpec, Normalizer, Requirement};
pub use period::{periods_between, Granularity, Period};
pub use schema::*;
pub use store::{DateRange, IncrementalStore, UpsertOutcome};
pub use table::{ArtifactPaths, ColumnStats, FinalMetricsTable, RenderedArtifacts};
pub use utils::*;

use log::info;

/// Runs the full pipeline described by `config`: replays the raw dumps of
/// both sources, merges them into the store and publishes the metrics table.
pub fn run_pipeline(config: &PipelineConfig, sink: Box<dyn LogSink>) -> Result<RunOutput> {
    let ctx = RunContext::from_config(config, sink)?;

    let mut sources: Vec<Box<dyn SourceClient>> = Source::ALL
        .into_iter()
        .map(|source| {
            Box::new(JsonFileSource::new(source, &config.raw_dir, config.page_size))
                as Box<dyn SourceClient>
        })
        .collect();

    info!(
        "Running pipeline: raw={} store={} output={}",
        config.raw_dir.display(),
        config.store_path.display(),
        config.output.dir.display()
    );

    let mut driver = AggregationDriver::new(ctx, Normalizer::new());
    driver.run_with_sources(&mut sources)
}
