use crate::error::{PipelineError, Result};
use crate::schema::{fields, EntityType, FieldValue, NormalizedRow, RawRecord, Source};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use log::debug;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Amount,
    Date,
    Tags,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Requirement {
    Required,
    /// Substituted when every path is absent or null.
    Optional(FieldValue),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    /// Dotted payload paths, tried in order; the first present one wins.
    pub paths: Vec<&'static str>,
    pub kind: FieldKind,
    pub requirement: Requirement,
}

impl FieldSpec {
    pub fn required(name: &'static str, kind: FieldKind, paths: &[&'static str]) -> Self {
        Self {
            name,
            paths: paths.to_vec(),
            kind,
            requirement: Requirement::Required,
        }
    }

    /// Optional field with the kind's natural default: zero amounts, null
    /// dates and text, empty tag lists.
    pub fn optional(name: &'static str, kind: FieldKind, paths: &[&'static str]) -> Self {
        let default = match kind {
            FieldKind::Amount => FieldValue::Amount(Decimal::ZERO),
            FieldKind::Tags => FieldValue::Tags(Vec::new()),
            FieldKind::Text | FieldKind::Date => FieldValue::Null,
        };
        Self::with_default(name, kind, paths, default)
    }

    pub fn with_default(
        name: &'static str,
        kind: FieldKind,
        paths: &[&'static str],
        default: FieldValue,
    ) -> Self {
        Self {
            name,
            paths: paths.to_vec(),
            kind,
            requirement: Requirement::Optional(default),
        }
    }
}

/// Canonical flat layout of one `(source, entity)` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySchema {
    pub source: Source,
    pub entity_type: EntityType,
    pub fields: Vec<FieldSpec>,
    /// Paths holding the source's own last-modified timestamp.
    pub timestamp_paths: Vec<&'static str>,
}

impl EntitySchema {
    pub fn subscription() -> Self {
        Self {
            source: Source::Billing,
            entity_type: EntityType::Subscription,
            fields: vec![
                FieldSpec::optional(
                    fields::CUSTOMER_ID,
                    FieldKind::Text,
                    &["customer_id", "customer_uuid", "customer.uuid", "customer.id"],
                ),
                FieldSpec::optional(
                    fields::PLAN,
                    FieldKind::Text,
                    &["plan.name", "plan_name", "plan_uuid"],
                ),
                FieldSpec::required(
                    fields::PLAN_AMOUNT,
                    FieldKind::Amount,
                    &["plan_amount", "plan.amount", "amount", "price"],
                ),
                FieldSpec::with_default(
                    fields::BILLING_INTERVAL,
                    FieldKind::Text,
                    &["billing_interval", "plan.interval", "billing-cycle", "interval"],
                    FieldValue::Text("month".to_string()),
                ),
                FieldSpec::with_default(
                    fields::INTERVAL_COUNT,
                    FieldKind::Amount,
                    &["interval_count", "plan.interval_count", "billing-cycle-count"],
                    FieldValue::Amount(Decimal::ONE),
                ),
                FieldSpec::required(
                    fields::START_DATE,
                    FieldKind::Date,
                    &["start_date", "start-date", "started_at"],
                ),
                FieldSpec::optional(
                    fields::CANCEL_DATE,
                    FieldKind::Date,
                    &[
                        "cancel_date",
                        "cancellation-date",
                        "cancelled_at",
                        "cancellation_dates.0",
                    ],
                ),
                FieldSpec::optional(fields::CURRENCY, FieldKind::Text, &["currency", "plan.currency"]),
                FieldSpec::with_default(
                    fields::PREVIOUS_PLAN_AMOUNT,
                    FieldKind::Amount,
                    &[
                        "previous_plan_amount",
                        "plan_change.previous_amount",
                        "previous_amount",
                    ],
                    FieldValue::Null,
                ),
                FieldSpec::optional(
                    fields::PLAN_CHANGED_AT,
                    FieldKind::Date,
                    &["plan_changed_at", "plan_change.date", "plan_change.changed_at"],
                ),
            ],
            timestamp_paths: vec!["updated_at", "updated-at"],
        }
    }

    pub fn invoice() -> Self {
        Self {
            source: Source::Accounting,
            entity_type: EntityType::Invoice,
            fields: vec![
                FieldSpec::optional(fields::CONTACT_ID, FieldKind::Text, &["contact_id", "contact"]),
                FieldSpec::required(fields::DATE, FieldKind::Date, &["date", "issued_at"]),
                FieldSpec::required(fields::AMOUNT, FieldKind::Amount, &["amount", "total"]),
                FieldSpec::optional(fields::CURRENCY, FieldKind::Text, &["currency"]),
                FieldSpec::optional(fields::DOC_NUMBER, FieldKind::Text, &["doc_number", "docNumber"]),
            ],
            timestamp_paths: vec!["updated_at", "updatedAt"],
        }
    }

    pub fn expense() -> Self {
        Self {
            source: Source::Accounting,
            entity_type: EntityType::Expense,
            fields: vec![
                FieldSpec::optional(fields::CONTACT_ID, FieldKind::Text, &["contact_id", "contact"]),
                FieldSpec::required(fields::DATE, FieldKind::Date, &["date"]),
                FieldSpec::required(fields::AMOUNT, FieldKind::Amount, &["amount", "total"]),
                FieldSpec::optional(fields::TAGS, FieldKind::Tags, &["tags"]),
                FieldSpec::optional(fields::CURRENCY, FieldKind::Text, &["currency"]),
            ],
            timestamp_paths: vec!["updated_at", "updatedAt"],
        }
    }

    pub fn contact() -> Self {
        Self {
            source: Source::Accounting,
            entity_type: EntityType::Contact,
            fields: vec![
                FieldSpec::required(fields::NAME, FieldKind::Text, &["name", "tradeName"]),
                FieldSpec::optional(fields::KIND, FieldKind::Text, &["kind", "type"]),
                FieldSpec::optional(fields::TAGS, FieldKind::Tags, &["tags"]),
                FieldSpec::optional(
                    fields::CREATED_DATE,
                    FieldKind::Date,
                    &["created_date", "createdAt", "created_at"],
                ),
            ],
            timestamp_paths: vec!["updated_at", "updatedAt"],
        }
    }
}

#[derive(Debug, Default)]
pub struct NormalizeReport {
    pub rows: Vec<NormalizedRow>,
    pub rejected: Vec<PipelineError>,
}

pub struct Normalizer {
    schemas: BTreeMap<(Source, EntityType), EntitySchema>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Normalizer {
    pub fn new() -> Self {
        let mut normalizer = Self {
            schemas: BTreeMap::new(),
        };
        for schema in [
            EntitySchema::subscription(),
            EntitySchema::invoice(),
            EntitySchema::expense(),
            EntitySchema::contact(),
        ] {
            normalizer.register(schema);
        }
        normalizer
    }

    /// Adds or replaces the schema for the schema's `(source, entity)` pair.
    pub fn register(&mut self, schema: EntitySchema) {
        self.schemas
            .insert((schema.source, schema.entity_type), schema);
    }

    pub fn normalize(&self, raw: &RawRecord) -> Result<NormalizedRow> {
        let mismatch = |field: &str, details: String| PipelineError::SchemaMismatch {
            entity: raw.entity_type,
            external_id: raw.external_id.clone(),
            field: field.to_string(),
            details,
        };

        let schema = self
            .schemas
            .get(&(raw.source, raw.entity_type))
            .ok_or_else(|| {
                mismatch(
                    "<schema>",
                    format!("no schema registered for {} {}", raw.source, raw.entity_type),
                )
            })?;

        let external_id = raw.external_id.trim();
        if external_id.is_empty() {
            return Err(mismatch("external_id", "record has no identifier".to_string()));
        }

        let mut values = BTreeMap::new();
        for spec in &schema.fields {
            let found = spec
                .paths
                .iter()
                .find_map(|path| lookup(&raw.payload, path).map(|value| (*path, value)));

            let value = match found {
                Some((path, value)) => coerce(value, spec.kind)
                    .map_err(|details| mismatch(spec.name, format!("at '{}': {}", path, details)))?,
                None => None,
            };

            let value = match (value, &spec.requirement) {
                (Some(value), _) => value,
                (None, Requirement::Optional(default)) => default.clone(),
                (None, Requirement::Required) => {
                    return Err(mismatch(spec.name, "required field is missing".to_string()))
                }
            };
            values.insert(spec.name.to_string(), value);
        }

        derive_fields(raw.entity_type, &mut values)
            .map_err(|(field, details)| mismatch(field, details))?;

        let updated_at = schema
            .timestamp_paths
            .iter()
            .find_map(|path| lookup(&raw.payload, path))
            .and_then(coerce_timestamp)
            .unwrap_or(raw.fetched_at);

        Ok(NormalizedRow {
            entity_type: raw.entity_type,
            natural_key: NormalizedRow::natural_key_for(raw.source, raw.entity_type, external_id),
            fields: values,
            updated_at,
        })
    }

    /// Normalizes every record, collecting mismatches instead of stopping at
    /// the first one.
    pub fn normalize_batch(&self, raws: &[RawRecord]) -> NormalizeReport {
        let mut report = NormalizeReport::default();
        for raw in raws {
            match self.normalize(raw) {
                Ok(row) => {
                    debug!("Normalized {}", row.natural_key);
                    report.rows.push(row);
                }
                Err(e) => {
                    debug!("Rejected {} record '{}': {}", raw.entity_type, raw.external_id, e);
                    report.rejected.push(e);
                }
            }
        }
        report
    }
}

/// Adds the fields computed from other canonical fields. Only source data
/// feeds them, so re-normalizing an unchanged record yields the same row.
fn derive_fields(
    entity_type: EntityType,
    values: &mut BTreeMap<String, FieldValue>,
) -> std::result::Result<(), (&'static str, String)> {
    if entity_type != EntityType::Subscription {
        return Ok(());
    }

    let interval = values
        .get(fields::BILLING_INTERVAL)
        .and_then(FieldValue::as_text)
        .unwrap_or("month")
        .to_string();
    let count = values
        .get(fields::INTERVAL_COUNT)
        .and_then(FieldValue::as_amount)
        .unwrap_or(Decimal::ONE);
    let amount = values
        .get(fields::PLAN_AMOUNT)
        .and_then(FieldValue::as_amount)
        .unwrap_or(Decimal::ZERO);

    let monthly = monthly_amount(amount, &interval, count)
        .map_err(|details| (fields::MONTHLY_AMOUNT, details))?;
    values.insert(
        fields::MONTHLY_AMOUNT.to_string(),
        FieldValue::Amount(monthly),
    );

    // The previous plan only matters together with the date it was replaced.
    let changed = values
        .get(fields::PLAN_CHANGED_AT)
        .and_then(FieldValue::as_date)
        .is_some();
    let previous = match values
        .get(fields::PREVIOUS_PLAN_AMOUNT)
        .and_then(FieldValue::as_amount)
    {
        Some(previous) if changed => FieldValue::Amount(
            monthly_amount(previous, &interval, count)
                .map_err(|details| (fields::PREVIOUS_MONTHLY_AMOUNT, details))?,
        ),
        _ => FieldValue::Null,
    };
    values.insert(fields::PREVIOUS_MONTHLY_AMOUNT.to_string(), previous);
    Ok(())
}

/// Converts a plan price billed every `count` `interval`s into a monthly amount.
pub fn monthly_amount(
    amount: Decimal,
    interval: &str,
    count: Decimal,
) -> std::result::Result<Decimal, String> {
    if count <= Decimal::ZERO {
        return Err(format!("interval count must be positive, got {}", count));
    }

    let per_interval = match interval.trim().to_lowercase().as_str() {
        "day" | "daily" => amount.checked_mul(Decimal::from(30)),
        "week" | "weekly" => amount
            .checked_mul(Decimal::from(52))
            .and_then(|yearly| yearly.checked_div(Decimal::from(12))),
        "month" | "monthly" | "" => Some(amount),
        "quarter" | "quarterly" => amount.checked_div(Decimal::from(3)),
        "year" | "yearly" | "annual" | "annually" => amount.checked_div(Decimal::from(12)),
        other => return Err(format!("unknown billing interval '{}'", other)),
    };

    per_interval
        .and_then(|per_interval| per_interval.checked_div(count))
        .ok_or_else(|| {
            format!(
                "{} every {} {} is out of range as a monthly amount",
                amount, count, interval
            )
        })
}

/// Walks a dotted path through nested objects and arrays. A key that itself
/// contains the full dotted path (already-flattened payloads) is honoured
/// first. Nulls count as absent.
fn lookup<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(value) = payload.get(path) {
        return Some(value).filter(|v| !v.is_null());
    }

    let mut current = payload;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current).filter(|v| !v.is_null())
}

/// `Ok(None)` means "present but empty" and falls through to the default.
fn coerce(value: &Value, kind: FieldKind) -> std::result::Result<Option<FieldValue>, String> {
    match kind {
        FieldKind::Text => match value {
            Value::String(s) if s.trim().is_empty() => Ok(None),
            Value::String(s) => Ok(Some(FieldValue::Text(s.trim().to_string()))),
            Value::Number(n) => Ok(Some(FieldValue::Text(n.to_string()))),
            Value::Bool(b) => Ok(Some(FieldValue::Text(b.to_string()))),
            other => Err(format!("expected text, found {}", type_name(other))),
        },
        FieldKind::Amount => match value {
            Value::Number(n) => parse_decimal(&n.to_string()).map(|d| Some(FieldValue::Amount(d))),
            Value::String(s) if s.trim().is_empty() => Ok(None),
            Value::String(s) => parse_decimal(s).map(|d| Some(FieldValue::Amount(d))),
            other => Err(format!("expected amount, found {}", type_name(other))),
        },
        FieldKind::Date => match value {
            Value::String(s) if s.trim().is_empty() => Ok(None),
            Value::String(s) => parse_date(s)
                .map(|d| Some(FieldValue::Date(d)))
                .ok_or_else(|| format!("unparseable date '{}'", s)),
            Value::Number(n) => n
                .as_i64()
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
                .map(|ts| Some(FieldValue::Date(ts.date_naive())))
                .ok_or_else(|| format!("timestamp {} out of range", n)),
            other => Err(format!("expected date, found {}", type_name(other))),
        },
        FieldKind::Tags => match value {
            Value::Array(items) => {
                let tags = items
                    .iter()
                    .filter_map(|item| match item {
                        Value::String(s) => Some(s.trim().to_lowercase()),
                        Value::Number(n) => Some(n.to_string()),
                        _ => None,
                    })
                    .filter(|tag| !tag.is_empty())
                    .collect();
                Ok(Some(FieldValue::Tags(tags)))
            }
            Value::String(s) => Ok(Some(FieldValue::Tags(
                s.split(',')
                    .map(|tag| tag.trim().to_lowercase())
                    .filter(|tag| !tag.is_empty())
                    .collect(),
            ))),
            other => Err(format!("expected tags, found {}", type_name(other))),
        },
    }
}

fn parse_decimal(raw: &str) -> std::result::Result<Decimal, String> {
    let cleaned = raw.trim().replace('_', "");
    Decimal::from_str(&cleaned)
        .or_else(|_| Decimal::from_scientific(&cleaned))
        .map_err(|_| format!("'{}' is not a decimal amount", raw))
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|ts| ts.date_naive()))
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|ts| ts.date())
        })
        .or_else(|| {
            raw.parse::<i64>()
                .ok()
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
                .map(|ts| ts.date_naive())
        })
}

fn coerce_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
            .or_else(|| {
                parse_date(s)
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|ts| ts.and_utc())
            }),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
