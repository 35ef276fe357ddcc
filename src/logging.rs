//! Structured run events and the sinks that receive them.

use crate::driver::PipelineStage;
use crate::schema::MetricName;
use chrono::NaiveDate;
use log::Level;
use std::fmt;
use std::sync::{Arc, Mutex};

pub const LOG_TARGET: &str = "saas_metrics";

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineEvent {
    pub level: Level,
    pub stage: PipelineStage,
    pub message: String,
    pub period: Option<NaiveDate>,
    pub metric: Option<MetricName>,
}

impl PipelineEvent {
    pub fn new(level: Level, stage: PipelineStage, message: impl Into<String>) -> Self {
        Self {
            level,
            stage,
            message: message.into(),
            period: None,
            metric: None,
        }
    }

    pub fn with_period(mut self, period: NaiveDate) -> Self {
        self.period = Some(period);
        self
    }

    pub fn with_metric(mut self, metric: MetricName) -> Self {
        self.metric = Some(metric);
        self
    }
}

impl fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage={} msg=\"{}\"", self.stage, self.message)?;
        if let Some(period) = self.period {
            write!(f, " period={}", period)?;
        }
        if let Some(metric) = self.metric {
            write!(f, " metric={}", metric)?;
        }
        Ok(())
    }
}

/// Destination for run events. Format and transport are the sink's concern.
pub trait LogSink {
    fn emit(&self, event: &PipelineEvent);
}

/// Forwards events to the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogFacadeSink;

impl LogSink for LogFacadeSink {
    fn emit(&self, event: &PipelineEvent) {
        log::log!(target: LOG_TARGET, event.level, "{}", event);
    }
}

/// Keeps events in memory (and forwards them to `log`), for inspection
/// after a run.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<PipelineEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn events_at(&self, level: Level) -> Vec<PipelineEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.level == level)
            .collect()
    }
}

impl LogSink for MemorySink {
    fn emit(&self, event: &PipelineEvent) {
        LogFacadeSink.emit(event);
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
