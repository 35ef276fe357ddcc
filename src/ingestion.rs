//! Extraction from the billing and accounting sources.
//!
//! The live HTTP clients stay outside this crate; anything that can page
//! through raw records implements [`SourceClient`].

use crate::error::{PipelineError, Result};
use crate::schema::{EntityType, RawRecord, Source};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Upper bound on pages drained per entity, in case a client never reports
/// exhaustion.
pub const MAX_PAGES: usize = 10_000;

pub trait SourceClient {
    fn source(&self) -> Source;

    /// Entity types this client can serve.
    fn entities(&self) -> Vec<EntityType>;

    /// Returns the next page of records fetched at or after `since`. An empty
    /// page means the entity is exhausted.
    fn fetch(
        &mut self,
        entity_type: EntityType,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawRecord>>;
}

/// Collects every page of one entity, retrying each page up to
/// `max_retries` times before giving up.
pub fn drain(
    client: &mut dyn SourceClient,
    entity_type: EntityType,
    since: Option<DateTime<Utc>>,
    max_retries: u32,
) -> Result<Vec<RawRecord>> {
    let source = client.source();
    let mut records = Vec::new();

    for page_number in 0..MAX_PAGES {
        let page = fetch_with_retries(client, entity_type, since, max_retries)?;
        if page.is_empty() {
            info!(
                "Drained {} {} records from {} in {} pages",
                records.len(),
                entity_type,
                source,
                page_number
            );
            return Ok(records);
        }
        debug!(
            "Page {} of {} {}: {} records",
            page_number + 1,
            source,
            entity_type,
            page.len()
        );
        records.extend(page);
    }

    warn!(
        "Stopped draining {} {} after {} pages",
        source, entity_type, MAX_PAGES
    );
    Ok(records)
}

fn fetch_with_retries(
    client: &mut dyn SourceClient,
    entity_type: EntityType,
    since: Option<DateTime<Utc>>,
    max_retries: u32,
) -> Result<Vec<RawRecord>> {
    let mut attempt = 0;
    loop {
        match client.fetch(entity_type, since) {
            Ok(page) => return Ok(page),
            Err(e) if attempt < max_retries => {
                attempt += 1;
                warn!(
                    "Fetching {} {} failed (attempt {}/{}): {}",
                    client.source(),
                    entity_type,
                    attempt,
                    max_retries + 1,
                    e
                );
            }
            Err(e) => return Err(e),
        }
    }
}

/// Serves fixed records page by page.
#[derive(Debug, Clone)]
pub struct StaticSource {
    source: Source,
    records: BTreeMap<EntityType, Vec<RawRecord>>,
    cursors: BTreeMap<EntityType, usize>,
    page_size: usize,
}

impl StaticSource {
    pub fn new(source: Source, page_size: usize) -> Self {
        Self {
            source,
            records: BTreeMap::new(),
            cursors: BTreeMap::new(),
            page_size: page_size.max(1),
        }
    }

    /// Adds records; ones that belong to another source are ignored.
    pub fn with_records(mut self, records: impl IntoIterator<Item = RawRecord>) -> Self {
        for record in records {
            if record.source == self.source {
                self.records
                    .entry(record.entity_type)
                    .or_default()
                    .push(record);
            }
        }
        self
    }
}

impl SourceClient for StaticSource {
    fn source(&self) -> Source {
        self.source
    }

    fn entities(&self) -> Vec<EntityType> {
        entities_of(self.source)
    }

    fn fetch(
        &mut self,
        entity_type: EntityType,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawRecord>> {
        let records = self
            .records
            .get(&entity_type)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        Ok(next_page(
            records,
            self.cursors.entry(entity_type).or_default(),
            self.page_size,
            since,
        ))
    }
}

/// Replays raw JSON dumps written by an earlier extraction, one file per
/// `(source, entity)`: `<dir>/<source>_<entity>_raw.json`.
///
/// A file may hold a bare array or an object wrapping the array under
/// `data`, `items` or the plural entity name. Every record's `fetched_at` is
/// the file's modification time.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    source: Source,
    dir: PathBuf,
    page_size: usize,
    loaded: BTreeMap<EntityType, Vec<RawRecord>>,
    cursors: BTreeMap<EntityType, usize>,
}

impl JsonFileSource {
    pub fn new(source: Source, dir: impl Into<PathBuf>, page_size: usize) -> Self {
        Self {
            source,
            dir: dir.into(),
            page_size: page_size.max(1),
            loaded: BTreeMap::new(),
            cursors: BTreeMap::new(),
        }
    }

    pub fn path_for(dir: &Path, source: Source, entity_type: EntityType) -> PathBuf {
        dir.join(format!("{}_{}_raw.json", source, entity_type))
    }

    fn load(&self, entity_type: EntityType) -> Result<Vec<RawRecord>> {
        let path = Self::path_for(&self.dir, self.source, entity_type);
        if !path.exists() {
            debug!("No raw dump at {}", path.display());
            return Ok(Vec::new());
        }

        let fetched_at: DateTime<Utc> = std::fs::metadata(&path)?.modified()?.into();
        let contents = std::fs::read_to_string(&path)?;
        let document: Value = serde_json::from_str(&contents)?;
        let items = unwrap_items(document, entity_type).ok_or_else(|| {
            PipelineError::SchemaMismatch {
                entity: entity_type,
                external_id: path.display().to_string(),
                field: "<document>".to_string(),
                details: "expected an array of records".to_string(),
            }
        })?;

        let records: Vec<RawRecord> = items
            .into_iter()
            .map(|payload| RawRecord {
                source: self.source,
                entity_type,
                external_id: record_id(&payload),
                payload,
                fetched_at,
            })
            .collect();
        info!(
            "Loaded {} {} records from {}",
            records.len(),
            entity_type,
            path.display()
        );
        Ok(records)
    }
}

impl SourceClient for JsonFileSource {
    fn source(&self) -> Source {
        self.source
    }

    fn entities(&self) -> Vec<EntityType> {
        entities_of(self.source)
    }

    fn fetch(
        &mut self,
        entity_type: EntityType,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawRecord>> {
        if !self.loaded.contains_key(&entity_type) {
            let records = self.load(entity_type)?;
            self.loaded.insert(entity_type, records);
        }

        let records = self
            .loaded
            .get(&entity_type)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        Ok(next_page(
            records,
            self.cursors.entry(entity_type).or_default(),
            self.page_size,
            since,
        ))
    }
}

pub fn entities_of(source: Source) -> Vec<EntityType> {
    match source {
        Source::Billing => vec![EntityType::Subscription],
        Source::Accounting => vec![
            EntityType::Contact,
            EntityType::Invoice,
            EntityType::Expense,
        ],
    }
}

fn next_page(
    records: &[RawRecord],
    cursor: &mut usize,
    page_size: usize,
    since: Option<DateTime<Utc>>,
) -> Vec<RawRecord> {
    let mut page = Vec::new();
    while page.len() < page_size && *cursor < records.len() {
        let record = &records[*cursor];
        *cursor += 1;
        if since.map_or(true, |since| record.fetched_at >= since) {
            page.push(record.clone());
        }
    }
    page
}

fn unwrap_items(document: Value, entity_type: EntityType) -> Option<Vec<Value>> {
    match document {
        Value::Array(items) => Some(items),
        Value::Object(mut map) => {
            let plural = format!("{}s", entity_type);
            for key in ["data", "items", plural.as_str()] {
                if let Some(Value::Array(items)) = map.remove(key) {
                    return Some(items);
                }
            }
            None
        }
        _ => None,
    }
}

fn record_id(payload: &Value) -> String {
    ["id", "uuid", "_id"]
        .into_iter()
        .find_map(|key| match payload.get(key) {
            Some(Value::String(id)) => Some(id.clone()),
            Some(Value::Number(id)) => Some(id.to_string()),
            _ => None,
        })
        .unwrap_or_default()
}
