use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Canonical field names shared by the normalizer, the store and the calculators.
pub mod fields {
    pub const CUSTOMER_ID: &str = "customer_id";
    pub const CONTACT_ID: &str = "contact_id";
    pub const PLAN: &str = "plan";
    pub const PLAN_AMOUNT: &str = "plan_amount";
    pub const BILLING_INTERVAL: &str = "billing_interval";
    pub const INTERVAL_COUNT: &str = "interval_count";
    pub const MONTHLY_AMOUNT: &str = "monthly_amount";
    pub const PREVIOUS_PLAN_AMOUNT: &str = "previous_plan_amount";
    pub const PREVIOUS_MONTHLY_AMOUNT: &str = "previous_monthly_amount";
    pub const PLAN_CHANGED_AT: &str = "plan_changed_at";
    pub const START_DATE: &str = "start_date";
    pub const CANCEL_DATE: &str = "cancel_date";
    pub const DATE: &str = "date";
    pub const AMOUNT: &str = "amount";
    pub const CURRENCY: &str = "currency";
    pub const DOC_NUMBER: &str = "doc_number";
    pub const TAGS: &str = "tags";
    pub const NAME: &str = "name";
    pub const KIND: &str = "kind";
    pub const CREATED_DATE: &str = "created_date";
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    #[schemars(description = "Billing-analytics SaaS (subscriptions)")]
    Billing,

    #[schemars(description = "Accounting SaaS (invoices, expenses, contacts)")]
    Accounting,
}

impl Source {
    pub const ALL: [Source; 2] = [Source::Billing, Source::Accounting];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Billing => "billing",
            Self::Accounting => "accounting",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Subscription,
    Invoice,
    Expense,
    Contact,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [
        EntityType::Subscription,
        EntityType::Invoice,
        EntityType::Expense,
        EntityType::Contact,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscription => "subscription",
            Self::Invoice => "invoice",
            Self::Expense => "expense",
            Self::Contact => "contact",
        }
    }

    /// The canonical date field used for range queries and period coverage.
    pub fn primary_date_field(&self) -> &'static str {
        match self {
            Self::Subscription => fields::START_DATE,
            Self::Invoice | Self::Expense => fields::DATE,
            Self::Contact => fields::CREATED_DATE,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metric columns of the final table, in output order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    #[schemars(description = "Monthly recurring revenue of subscriptions active at period end")]
    Mrr,
    #[schemars(description = "Annual recurring revenue (MRR x 12)")]
    Arr,
    #[schemars(description = "Monthly amount of subscriptions started in the period")]
    NewMrr,
    #[schemars(description = "MRR added by plan upgrades during the period")]
    ExpansionMrr,
    #[schemars(description = "MRR lost to plan downgrades during the period")]
    ContractionMrr,
    #[schemars(description = "Monthly amount of subscriptions cancelled during the period")]
    ChurnedMrr,
    ActiveSubscriptions,
    NewSubscriptions,
    #[schemars(description = "Contacts whose first invoice falls in the period")]
    NewCustomers,
    #[schemars(description = "Distinct customers with an active subscription at period end")]
    ActiveCustomers,
    #[schemars(description = "Customers active at period start with no active subscription at period end")]
    ChurnedCustomers,
    #[schemars(description = "Share of subscriptions active at period start cancelled by period end")]
    Churn,
    RevenueChurn,
    #[schemars(description = "Average revenue per active account")]
    Arpa,
    #[schemars(description = "Customer lifetime value (ARPA / churn)")]
    Ltv,
    Revenue,
    Opex,
    Cogs,
    FinancialCosts,
    CacCosts,
    #[schemars(description = "Customer acquisition cost per new subscription")]
    Cac,
    Ebitda,
    BurnRate,
    Runway,
}

impl MetricName {
    pub const ALL: [MetricName; 24] = [
        MetricName::Mrr,
        MetricName::Arr,
        MetricName::NewMrr,
        MetricName::ExpansionMrr,
        MetricName::ContractionMrr,
        MetricName::ChurnedMrr,
        MetricName::ActiveSubscriptions,
        MetricName::NewSubscriptions,
        MetricName::NewCustomers,
        MetricName::ActiveCustomers,
        MetricName::ChurnedCustomers,
        MetricName::Churn,
        MetricName::RevenueChurn,
        MetricName::Arpa,
        MetricName::Ltv,
        MetricName::Revenue,
        MetricName::Opex,
        MetricName::Cogs,
        MetricName::FinancialCosts,
        MetricName::CacCosts,
        MetricName::Cac,
        MetricName::Ebitda,
        MetricName::BurnRate,
        MetricName::Runway,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mrr => "mrr",
            Self::Arr => "arr",
            Self::NewMrr => "new_mrr",
            Self::ExpansionMrr => "expansion_mrr",
            Self::ContractionMrr => "contraction_mrr",
            Self::ChurnedMrr => "churned_mrr",
            Self::ActiveSubscriptions => "active_subscriptions",
            Self::NewSubscriptions => "new_subscriptions",
            Self::NewCustomers => "new_customers",
            Self::ActiveCustomers => "active_customers",
            Self::ChurnedCustomers => "churned_customers",
            Self::Churn => "churn",
            Self::RevenueChurn => "revenue_churn",
            Self::Arpa => "arpa",
            Self::Ltv => "ltv",
            Self::Revenue => "revenue",
            Self::Opex => "opex",
            Self::Cogs => "cogs",
            Self::FinancialCosts => "financial_costs",
            Self::CacCosts => "cac_costs",
            Self::Cac => "cac",
            Self::Ebitda => "ebitda",
            Self::BurnRate => "burn_rate",
            Self::Runway => "runway",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cost bucket derived from supplier/expense tags.
///
/// Declaration order is the precedence used when several tags match.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ExpenseCategory {
    #[schemars(description = "Customer acquisition spend (feeds CAC)")]
    Acquisition,
    #[schemars(description = "Cost of goods sold")]
    Cogs,
    #[schemars(description = "Financial costs such as bank fees")]
    FinancialCosts,
    #[schemars(description = "Operating expenses")]
    Opex,
    #[schemars(description = "No matching tag; excluded from EBITDA")]
    Uncategorized,
}

impl ExpenseCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acquisition => "acquisition",
            Self::Cogs => "cogs",
            Self::FinancialCosts => "financial_costs",
            Self::Opex => "opex",
            Self::Uncategorized => "uncategorized",
        }
    }

    /// Whether expenses in this bucket reduce EBITDA.
    pub fn is_operating(&self) -> bool {
        !matches!(self, Self::Uncategorized)
    }
}

impl fmt::Display for ExpenseCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record exactly as a source client returned it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub source: Source,
    pub entity_type: EntityType,
    pub external_id: String,
    /// Opaque nested payload; only the normalizer's schemas look inside it.
    pub payload: serde_json::Value,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Amount(Decimal),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    Tags(Vec<String>),
    Null,
}

impl FieldValue {
    pub fn as_amount(&self) -> Option<Decimal> {
        match self {
            Self::Amount(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(date) => Some(*date),
            Self::Timestamp(ts) => Some(ts.date_naive()),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text.as_str()),
            _ => None,
        }
    }

    pub fn as_tags(&self) -> Option<&[String]> {
        match self {
            Self::Tags(tags) => Some(tags.as_slice()),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRow {
    pub entity_type: EntityType,
    /// `<source>:<entity>:<external_id>`, unique per entity type.
    pub natural_key: String,
    pub fields: BTreeMap<String, FieldValue>,
    pub updated_at: DateTime<Utc>,
}

impl NormalizedRow {
    pub fn natural_key_for(source: Source, entity_type: EntityType, external_id: &str) -> String {
        format!("{}:{}:{}", source, entity_type, external_id)
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Amount field, with a missing or null value read as zero.
    pub fn amount(&self, name: &str) -> Decimal {
        self.field(name)
            .and_then(FieldValue::as_amount)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn date(&self, name: &str) -> Option<NaiveDate> {
        self.field(name).and_then(FieldValue::as_date)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.field(name)
            .and_then(FieldValue::as_text)
            .filter(|text| !text.is_empty())
    }

    pub fn tags(&self) -> &[String] {
        self.field(fields::TAGS)
            .and_then(FieldValue::as_tags)
            .unwrap_or(&[])
    }

    pub fn primary_date(&self) -> Option<NaiveDate> {
        self.date(self.entity_type.primary_date_field())
    }

    /// The source prefix of the natural key.
    pub fn source_prefix(&self) -> &str {
        self.natural_key.split(':').next().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub metric: MetricName,
    /// First day of the period bucket.
    pub period: NaiveDate,
    pub value: Decimal,
    pub computed_at: DateTime<Utc>,
}
