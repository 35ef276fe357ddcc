//! The aggregation run: raw records in, published metrics table out.
//!
//! ```text
//! INIT -> NORMALIZING -> COMPUTING -> MERGING -> DONE
//!   \__________\_____________\___________\______-> FAILED
//! ```
//!
//! A driver performs exactly one run. Row-level problems (schema mismatches)
//! and cell-level problems (undefined ratios) are logged and counted; store
//! integrity faults fail the run before anything is published.

use crate::config::{OutputConfig, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::ingestion::{drain, SourceClient};
use crate::logging::{LogSink, PipelineEvent};
use crate::metrics::{calculators, CategoryMap, MetricCalculator, StoreView};
use crate::normalizer::Normalizer;
use crate::period::{periods_between, Granularity, Period};
use crate::schema::{EntityType, MetricName, MetricPoint, RawRecord, Source};
use crate::store::{IncrementalStore, UpsertOutcome};
use crate::table::{ArtifactPaths, FinalMetricsTable, RenderedArtifacts};
use crate::utils::write_atomic;
use chrono::{DateTime, NaiveDate, Utc};
use log::Level;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    #[default]
    Init,
    Normalizing,
    Computing,
    Merging,
    Done,
    Failed,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Normalizing => "normalizing",
            Self::Computing => "computing",
            Self::Merging => "merging",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn can_transition_to(&self, next: PipelineStage) -> bool {
        use PipelineStage::*;
        match (self, next) {
            (Init, Normalizing)
            | (Normalizing, Computing)
            | (Computing, Merging)
            | (Merging, Done) => true,
            (current, Failed) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything scoped to a single run.
pub struct RunContext {
    pub output: OutputConfig,
    pub store_path: PathBuf,
    pub granularity: Granularity,
    pub cash_balance: Decimal,
    pub categories: CategoryMap,
    pub window: (Option<NaiveDate>, Option<NaiveDate>),
    pub metrics: Option<Vec<MetricName>>,
    pub max_retries: u32,
    pub started_at: DateTime<Utc>,
    sink: Box<dyn LogSink>,
}

impl RunContext {
    pub fn from_config(config: &PipelineConfig, sink: Box<dyn LogSink>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            output: config.output.clone(),
            store_path: config.store_path.clone(),
            granularity: config.granularity,
            cash_balance: config.cash_balance,
            categories: CategoryMap::new(config.category_tags.clone()),
            window: config.window()?,
            metrics: config.metrics.clone(),
            max_retries: config.max_retries,
            started_at: Utc::now(),
            sink,
        })
    }

    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }

    pub fn artifact_paths(&self) -> ArtifactPaths {
        ArtifactPaths::for_run(&self.output, self.started_at)
    }

    pub fn emit(&self, event: PipelineEvent) {
        self.sink.emit(&event);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OmittedCell {
    pub period: NaiveDate,
    pub metric: MetricName,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnavailableData {
    pub source: Source,
    pub entity: EntityType,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub stage: PipelineStage,
    pub started_at: Option<DateTime<Utc>>,
    pub records_seen: usize,
    pub rows_normalized: usize,
    pub rows_skipped: usize,
    pub rows_inserted: usize,
    pub rows_updated: usize,
    pub rows_unchanged: usize,
    pub rows_stale: usize,
    pub periods: usize,
    pub cells_computed: usize,
    pub omitted_cells: Vec<OmittedCell>,
    pub unavailable: Vec<UnavailableData>,
    pub failure: Option<String>,
}

impl RunSummary {
    fn record_upsert(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.rows_inserted += 1,
            UpsertOutcome::Updated => self.rows_updated += 1,
            UpsertOutcome::Unchanged => self.rows_unchanged += 1,
            UpsertOutcome::Stale => self.rows_stale += 1,
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stage={} records={} normalized={} skipped={} inserted={} updated={} unchanged={} stale={} periods={} cells={} omitted={} unavailable={}",
            self.stage,
            self.records_seen,
            self.rows_normalized,
            self.rows_skipped,
            self.rows_inserted,
            self.rows_updated,
            self.rows_unchanged,
            self.rows_stale,
            self.periods,
            self.cells_computed,
            self.omitted_cells.len(),
            self.unavailable.len()
        )
    }
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub table: FinalMetricsTable,
    pub summary: RunSummary,
    pub artifacts: ArtifactPaths,
}

pub struct AggregationDriver {
    ctx: RunContext,
    normalizer: Normalizer,
    calculators: Vec<Box<dyn MetricCalculator>>,
    store: Option<IncrementalStore>,
    stage: PipelineStage,
    summary: RunSummary,
}

impl AggregationDriver {
    pub fn new(ctx: RunContext, normalizer: Normalizer) -> Self {
        let calculators = calculators(ctx.metrics.as_deref());
        let summary = RunSummary {
            started_at: Some(ctx.started_at),
            ..RunSummary::default()
        };
        Self {
            ctx,
            normalizer,
            calculators,
            store: None,
            stage: PipelineStage::Init,
            summary,
        }
    }

    /// Runs against `store` instead of loading one from the store path.
    pub fn with_store(mut self, store: IncrementalStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Replaces the calculator set.
    pub fn with_calculators(mut self, calculators: Vec<Box<dyn MetricCalculator>>) -> Self {
        self.calculators = calculators;
        self
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    pub fn store(&self) -> Option<&IncrementalStore> {
        self.store.as_ref()
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Drains every entity of every client from its watermark, then runs on
    /// whatever was collected. A failing or empty entity is reported and the
    /// run continues without it.
    pub fn run_with_sources(
        &mut self,
        sources: &mut [Box<dyn SourceClient>],
    ) -> Result<RunOutput> {
        let mut raw = Vec::new();
        for client in sources.iter_mut() {
            let source = client.source();
            for entity in client.entities() {
                let since = match self
                    .ensure_store()
                    .map(|store| store.watermark(source, entity))
                {
                    Ok(since) => since,
                    Err(e) => return Err(self.fail(e)),
                };

                let outcome = drain(client.as_mut(), entity, since, self.ctx.max_retries)
                    .and_then(|records| {
                        if records.is_empty() {
                            Err(PipelineError::ExternalDataUnavailable {
                                origin: source,
                                entity,
                            })
                        } else {
                            Ok(records)
                        }
                    });

                match outcome {
                    Ok(records) => raw.extend(records),
                    Err(e) => {
                        self.warn(PipelineStage::Init, format!("{}: {}", entity, e));
                        self.summary.unavailable.push(UnavailableData {
                            source,
                            entity,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }
        self.run(raw)
    }

    pub fn run(&mut self, raw: Vec<RawRecord>) -> Result<RunOutput> {
        match self.execute(raw) {
            Ok(output) => Ok(output),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn execute(&mut self, raw: Vec<RawRecord>) -> Result<RunOutput> {
        let mut store = match self.store.take() {
            Some(store) => store,
            None => IncrementalStore::load(&self.ctx.store_path)?,
        };
        let outcome = self.process(&mut store, raw);
        self.store = Some(store);
        outcome
    }

    fn process(&mut self, store: &mut IncrementalStore, raw: Vec<RawRecord>) -> Result<RunOutput> {
        self.transition(PipelineStage::Normalizing)?;
        self.ingest(store, &raw)?;

        self.transition(PipelineStage::Computing)?;
        let periods = self.periods(store)?;
        let points = self.compute(store, &periods)?;

        self.transition(PipelineStage::Merging)?;
        let mut table = FinalMetricsTable::new(self.ctx.granularity);
        for period in &periods {
            table.add_period(period);
        }
        for point in &points {
            table.insert(point);
        }

        let artifacts = self.ctx.artifact_paths();
        let rendered = RenderedArtifacts::render(&table)?;
        store.save(&self.ctx.store_path)?;
        rendered.write_to(&artifacts)?;

        self.transition(PipelineStage::Done)?;
        self.ctx.emit(PipelineEvent::new(
            Level::Info,
            self.stage,
            format!("published {}", artifacts.csv.display()),
        ));
        self.write_run_summary(&artifacts);

        Ok(RunOutput {
            table,
            summary: self.summary.clone(),
            artifacts,
        })
    }

    fn ingest(&mut self, store: &mut IncrementalStore, raw: &[RawRecord]) -> Result<()> {
        self.summary.records_seen += raw.len();

        let report = self.normalizer.normalize_batch(raw);
        self.summary.rows_normalized += report.rows.len();
        self.summary.rows_skipped += report.rejected.len();
        for rejected in &report.rejected {
            self.warn(self.stage, rejected.to_string());
        }

        for row in report.rows {
            let outcome = store.upsert(row)?;
            self.summary.record_upsert(outcome);
        }

        let mut latest: BTreeMap<(Source, EntityType), DateTime<Utc>> = BTreeMap::new();
        for record in raw {
            let mark = latest
                .entry((record.source, record.entity_type))
                .or_insert(record.fetched_at);
            if record.fetched_at > *mark {
                *mark = record.fetched_at;
            }
        }
        for ((source, entity), fetched_at) in latest {
            store.advance_watermark(source, entity, fetched_at);
        }

        self.ctx.emit(PipelineEvent::new(
            Level::Info,
            self.stage,
            format!(
                "normalized {} of {} records ({} skipped), store holds {} rows",
                self.summary.rows_normalized,
                self.summary.records_seen,
                self.summary.rows_skipped,
                store.len()
            ),
        ));
        Ok(())
    }

    /// Buckets spanned by the store's dated rows, clipped to the configured
    /// window.
    fn periods(&mut self, store: &IncrementalStore) -> Result<Vec<Period>> {
        let Some((first, last)) = store.dated_span() else {
            self.warn(self.stage, "store holds no dated rows".to_string());
            return Ok(Vec::new());
        };

        let (from, to) = self.ctx.window;
        let first = from.map_or(first, |from| first.max(from));
        let last = to.map_or(last, |to| last.min(to));

        let periods = periods_between(first, last, self.ctx.granularity)?;
        self.summary.periods = periods.len();
        Ok(periods)
    }

    fn compute(&mut self, store: &IncrementalStore, periods: &[Period]) -> Result<Vec<MetricPoint>> {
        let view = StoreView::new(store, self.ctx.cash_balance, self.ctx.started_at)
            .with_categories(self.ctx.categories.clone());
        let mut points = Vec::new();
        let mut omitted = Vec::new();

        for period in periods {
            for calculator in &self.calculators {
                let metric = calculator.metric();
                match calculator.compute(&view, period) {
                    Ok(Some(point)) => points.push(point),
                    Ok(None) => {}
                    Err(e) if !e.is_fatal() => {
                        self.ctx.emit(
                            PipelineEvent::new(Level::Warn, self.stage, e.to_string())
                                .with_period(period.start)
                                .with_metric(metric),
                        );
                        omitted.push(OmittedCell {
                            period: period.start,
                            metric,
                            reason: e.to_string(),
                        });
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        self.summary.cells_computed = points.len();
        self.summary.omitted_cells = omitted;
        Ok(points)
    }

    fn transition(&mut self, next: PipelineStage) -> Result<()> {
        if !self.stage.can_transition_to(next) {
            return Err(PipelineError::InvalidStageTransition {
                from: self.stage.to_string(),
                to: next.to_string(),
            });
        }
        self.stage = next;
        self.summary.stage = next;
        self.ctx.emit(PipelineEvent::new(
            Level::Info,
            next,
            format!("entering {}", next),
        ));
        Ok(())
    }

    /// Moves to FAILED (when still possible) and hands the error back.
    fn fail(&mut self, error: PipelineError) -> PipelineError {
        if self.stage.can_transition_to(PipelineStage::Failed) {
            self.stage = PipelineStage::Failed;
            self.summary.stage = PipelineStage::Failed;
        }
        self.summary.failure = Some(error.to_string());
        self.ctx.emit(PipelineEvent::new(
            Level::Error,
            self.stage,
            format!("run failed: {}", error),
        ));
        error
    }

    fn ensure_store(&mut self) -> Result<&IncrementalStore> {
        if self.store.is_none() {
            self.store = Some(IncrementalStore::load(&self.ctx.store_path)?);
        }
        self.store
            .as_ref()
            .ok_or_else(|| PipelineError::StoreIntegrity("store not loaded".to_string()))
    }

    fn warn(&self, stage: PipelineStage, message: String) {
        self.ctx
            .emit(PipelineEvent::new(Level::Warn, stage, message));
    }

    fn write_run_summary(&self, artifacts: &ArtifactPaths) {
        self.ctx.emit(PipelineEvent::new(
            Level::Info,
            self.stage,
            self.summary.to_string(),
        ));

        let written = serde_json::to_vec_pretty(&self.summary)
            .map_err(PipelineError::from)
            .and_then(|json| write_atomic(&artifacts.run_summary, &json));
        if let Err(e) = written {
            self.warn(
                self.stage,
                format!("could not write {}: {}", artifacts.run_summary.display(), e),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemorySink;
    use serde_json::json;

    fn raw(
        source: Source,
        entity_type: EntityType,
        id: &str,
        payload: serde_json::Value,
    ) -> RawRecord {
        RawRecord {
            source,
            entity_type,
            external_id: id.to_string(),
            payload,
            fetched_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        }
    }

    fn context(dir: &std::path::Path, sink: MemorySink) -> RunContext {
        let config = PipelineConfig::rooted_at(dir);
        RunContext::from_config(&config, Box::new(sink)).unwrap()
    }

    #[test]
    fn test_stage_transitions() {
        use PipelineStage::*;
        assert!(Init.can_transition_to(Normalizing));
        assert!(Merging.can_transition_to(Done));
        assert!(Computing.can_transition_to(Failed));
        assert!(!Init.can_transition_to(Computing));
        assert!(!Done.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Init));
        assert!(!Done.can_transition_to(Normalizing));
    }

    #[test]
    fn test_run_reaches_done_and_counts_rows() {
        let dir = tempfile::tempdir().unwrap();
        let sink = MemorySink::new();
        let mut driver =
            AggregationDriver::new(context(dir.path(), sink.clone()), Normalizer::default());

        let output = driver
            .run(vec![
                raw(
                    Source::Billing,
                    EntityType::Subscription,
                    "sub_1",
                    json!({"plan_amount": 100, "start_date": "2024-01-10"}),
                ),
                raw(
                    Source::Accounting,
                    EntityType::Invoice,
                    "inv_1",
                    json!({"date": "2024-01-15"}),
                ),
            ])
            .unwrap();

        assert_eq!(driver.stage(), PipelineStage::Done);
        assert_eq!(output.summary.records_seen, 2);
        assert_eq!(output.summary.rows_normalized, 1);
        assert_eq!(output.summary.rows_skipped, 1);
        assert_eq!(output.summary.rows_inserted, 1);
        assert!(output.artifacts.csv.exists());
        assert!(output.artifacts.run_summary.exists());
        assert!(!sink.events_at(Level::Warn).is_empty());
    }

    #[test]
    fn test_undefined_cells_are_omitted_with_context() {
        let dir = tempfile::tempdir().unwrap();
        let sink = MemorySink::new();
        let mut driver =
            AggregationDriver::new(context(dir.path(), sink.clone()), Normalizer::default());

        let output = driver
            .run(vec![raw(
                Source::Billing,
                EntityType::Subscription,
                "sub_1",
                json!({"plan_amount": 100, "start_date": "2024-01-10", "cancel_date": "2024-02-20"}),
            )])
            .unwrap();

        let feb = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        assert_eq!(output.table.get(feb, MetricName::Mrr), Some(Decimal::ZERO));
        assert_eq!(output.table.get(feb, MetricName::Cac), None);
        assert!(output
            .summary
            .omitted_cells
            .iter()
            .any(|cell| cell.period == feb && cell.metric == MetricName::Cac));
        assert!(sink.events_at(Level::Warn).iter().any(|event| {
            event.period == Some(feb) && event.metric == Some(MetricName::Cac)
        }));
    }

    #[test]
    fn test_driver_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = AggregationDriver::new(
            context(dir.path(), MemorySink::new()),
            Normalizer::default(),
        );
        driver.run(Vec::new()).unwrap();
        let err = driver.run(Vec::new()).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidStageTransition { .. }));
    }

    #[test]
    fn test_window_clips_periods() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            from: Some("2024-02".to_string()),
            ..PipelineConfig::rooted_at(dir.path())
        };
        let ctx = RunContext::from_config(&config, Box::new(MemorySink::new())).unwrap();
        let mut driver = AggregationDriver::new(ctx, Normalizer::default());

        let output = driver
            .run(vec![raw(
                Source::Billing,
                EntityType::Subscription,
                "sub_1",
                json!({"plan_amount": 100, "start_date": "2024-01-10", "cancel_date": "2024-03-05"}),
            )])
            .unwrap();

        let periods: Vec<String> = output
            .table
            .periods()
            .iter()
            .map(|p| p.format("%Y-%m").to_string())
            .collect();
        assert_eq!(periods, vec!["2024-02", "2024-03"]);
    }

    #[test]
    fn test_integrity_fault_fails_run_without_publishing() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = AggregationDriver::new(
            context(dir.path(), MemorySink::new()),
            Normalizer::default(),
        );
        let err = driver
            .run(vec![
                raw(
                    Source::Accounting,
                    EntityType::Expense,
                    "exp_1",
                    json!({"date": "2024-01-05", "total": 10}),
                ),
                raw(
                    Source::Accounting,
                    EntityType::Expense,
                    "exp_1",
                    json!({"date": "2024-01-05", "total": 11}),
                ),
            ])
            .unwrap_err();

        assert!(matches!(err, PipelineError::StoreIntegrity(_)));
        assert_eq!(driver.stage(), PipelineStage::Failed);
        assert!(driver.summary().failure.is_some());
        assert!(!driver.ctx.artifact_paths().csv.exists());
    }
}
