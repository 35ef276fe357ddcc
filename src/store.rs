use crate::error::{PipelineError, Result};
use crate::schema::{fields, EntityType, NormalizedRow, Source};
use crate::utils::write_atomic;
use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// A newer version replaced the stored row.
    Updated,
    /// The identical row was already stored.
    Unchanged,
    /// An older version arrived after a newer one and was ignored.
    Stale,
}

/// Inclusive date range for store queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if end < start {
            return Err(PipelineError::DateError(format!(
                "Range end {} is before start {}",
                end, start
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// Normalized rows keyed by natural key, one table per entity type.
///
/// Upserts are last-write-wins on `updated_at`; the store never holds two
/// rows with the same natural key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncrementalStore {
    #[serde(default)]
    tables: BTreeMap<EntityType, BTreeMap<String, NormalizedRow>>,
    /// Latest `fetched_at` seen per `<source>:<entity>`.
    #[serde(default)]
    watermarks: BTreeMap<String, DateTime<Utc>>,
}

impl IncrementalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a persisted store. A missing file is an empty store; anything
    /// unreadable is an integrity fault.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No store at {}, starting empty", path.display());
            return Ok(Self::new());
        }

        let contents = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::StoreIntegrity(format!("cannot read {}: {}", path.display(), e))
        })?;
        let store: Self = serde_json::from_str(&contents).map_err(|e| {
            PipelineError::StoreIntegrity(format!("cannot parse {}: {}", path.display(), e))
        })?;
        store.check_consistency()?;

        info!("Loaded {} rows from {}", store.len(), path.display());
        Ok(store)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &json)?;
        debug!("Persisted {} rows to {}", self.len(), path.display());
        Ok(())
    }

    pub fn upsert(&mut self, row: NormalizedRow) -> Result<UpsertOutcome> {
        if row.natural_key.trim().is_empty() {
            return Err(PipelineError::StoreIntegrity(format!(
                "{} row without a natural key",
                row.entity_type
            )));
        }

        let table = self.tables.entry(row.entity_type).or_default();
        let Some(existing) = table.get(&row.natural_key) else {
            table.insert(row.natural_key.clone(), row);
            return Ok(UpsertOutcome::Inserted);
        };

        let ordering = row.updated_at.cmp(&existing.updated_at);
        let identical = *existing == row;

        match ordering {
            Ordering::Greater => {
                table.insert(row.natural_key.clone(), row);
                Ok(UpsertOutcome::Updated)
            }
            Ordering::Less => Ok(UpsertOutcome::Stale),
            Ordering::Equal if identical => Ok(UpsertOutcome::Unchanged),
            Ordering::Equal => Err(PipelineError::StoreIntegrity(format!(
                "conflicting versions of {} share updated_at {}",
                row.natural_key, row.updated_at
            ))),
        }
    }

    /// Rows whose primary date lies in `range`, ordered by natural key.
    pub fn query(&self, entity_type: EntityType, range: DateRange) -> Vec<&NormalizedRow> {
        self.rows(entity_type)
            .filter(|row| row.primary_date().is_some_and(|d| range.contains(d)))
            .collect()
    }

    /// Every row of one entity type, ordered by natural key.
    pub fn rows(&self, entity_type: EntityType) -> impl Iterator<Item = &NormalizedRow> {
        self.tables
            .get(&entity_type)
            .into_iter()
            .flat_map(|table| table.values())
    }

    pub fn get(&self, entity_type: EntityType, natural_key: &str) -> Option<&NormalizedRow> {
        self.tables.get(&entity_type)?.get(natural_key)
    }

    pub fn count(&self, entity_type: EntityType) -> usize {
        self.tables.get(&entity_type).map_or(0, BTreeMap::len)
    }

    pub fn len(&self) -> usize {
        self.tables.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest and latest business date across subscriptions, invoices and
    /// expenses (cancellation dates included).
    pub fn dated_span(&self) -> Option<(NaiveDate, NaiveDate)> {
        let subscription_dates = self.rows(EntityType::Subscription).flat_map(|row| {
            [row.date(fields::START_DATE), row.date(fields::CANCEL_DATE)]
                .into_iter()
                .flatten()
        });
        let ledger_dates = [EntityType::Invoice, EntityType::Expense]
            .into_iter()
            .flat_map(|entity| self.rows(entity).filter_map(NormalizedRow::primary_date));

        subscription_dates
            .chain(ledger_dates)
            .fold(None, |span, date| match span {
                None => Some((date, date)),
                Some((first, last)) => Some((first.min(date), last.max(date))),
            })
    }

    pub fn watermark(&self, source: Source, entity_type: EntityType) -> Option<DateTime<Utc>> {
        self.watermarks
            .get(&watermark_key(source, entity_type))
            .copied()
    }

    /// Moves the watermark forward; never backwards.
    pub fn advance_watermark(
        &mut self,
        source: Source,
        entity_type: EntityType,
        fetched_at: DateTime<Utc>,
    ) {
        let mark = self
            .watermarks
            .entry(watermark_key(source, entity_type))
            .or_insert(fetched_at);
        if fetched_at > *mark {
            *mark = fetched_at;
        }
    }

    fn check_consistency(&self) -> Result<()> {
        for (entity_type, table) in &self.tables {
            for (key, row) in table {
                if row.entity_type != *entity_type || row.natural_key != *key {
                    return Err(PipelineError::StoreIntegrity(format!(
                        "row {} filed under {} / {}",
                        row.natural_key, entity_type, key
                    )));
                }
            }
        }
        Ok(())
    }
}

fn watermark_key(source: Source, entity_type: EntityType) -> String {
    format!("{}:{}", source, entity_type)
}
