//! Per-period KPI calculators.
//!
//! Every calculator is a pure function of a read-only [`StoreView`] and a
//! [`Period`]. `Ok(None)` means the store has nothing to compute from;
//! [`PipelineError::DivisionUndefined`] means the inputs exist but the metric
//! has no value for the period (zero denominator, or a total outside the
//! decimal range).
//!
//! Subscription state is sampled at two instants per period:
//!
//! - the *close*, `period.end`;
//! - the *opening*, the close of the day before `period.start`.
//!
//! A subscription is active at `d` when `start <= d` and it is either not
//! cancelled or cancelled after `d`.

use crate::error::{PipelineError, Result};
use crate::period::Period;
use crate::schema::{
    fields, EntityType, ExpenseCategory, FieldValue, MetricName, MetricPoint, NormalizedRow,
};
use crate::store::{DateRange, IncrementalStore};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};

const MONTHS_PER_YEAR: i64 = 12;

/// Tag substring → expense category.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryMap {
    tags: BTreeMap<String, ExpenseCategory>,
}

impl Default for CategoryMap {
    fn default() -> Self {
        Self::new(default_category_tags())
    }
}

pub fn default_category_tags() -> BTreeMap<String, ExpenseCategory> {
    BTreeMap::from([
        ("cac".to_string(), ExpenseCategory::Acquisition),
        ("cogs".to_string(), ExpenseCategory::Cogs),
        ("costes financieros".to_string(), ExpenseCategory::FinancialCosts),
        ("opex".to_string(), ExpenseCategory::Opex),
    ])
}

impl CategoryMap {
    pub fn new(tags: BTreeMap<String, ExpenseCategory>) -> Self {
        let tags = tags
            .into_iter()
            .map(|(tag, category)| (tag.trim().to_lowercase(), category))
            .filter(|(tag, _)| !tag.is_empty())
            .collect();
        Self { tags }
    }

    /// Case-insensitive substring match over all tags; the highest-precedence
    /// category wins.
    pub fn categorize(&self, tags: &[String]) -> ExpenseCategory {
        let joined = tags.join(",").to_lowercase();
        self.tags
            .iter()
            .filter(|(needle, _)| joined.contains(needle.as_str()))
            .map(|(_, category)| *category)
            .min()
            .unwrap_or(ExpenseCategory::Uncategorized)
    }
}

/// Read-only window onto the store plus the run constants calculators need.
pub struct StoreView<'a> {
    store: &'a IncrementalStore,
    categories: CategoryMap,
    cash_balance: Decimal,
    computed_at: DateTime<Utc>,
}

impl<'a> StoreView<'a> {
    pub fn new(
        store: &'a IncrementalStore,
        cash_balance: Decimal,
        computed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            store,
            categories: CategoryMap::default(),
            cash_balance,
            computed_at,
        }
    }

    pub fn with_categories(mut self, categories: CategoryMap) -> Self {
        self.categories = categories;
        self
    }

    pub fn computed_at(&self) -> DateTime<Utc> {
        self.computed_at
    }

    fn has_subscriptions(&self) -> bool {
        self.store.count(EntityType::Subscription) > 0
    }

    fn subscriptions(&self) -> impl Iterator<Item = &'a NormalizedRow> {
        self.store.rows(EntityType::Subscription)
    }

    fn active_at(&self, date: NaiveDate) -> impl Iterator<Item = &'a NormalizedRow> {
        self.subscriptions().filter(move |row| is_active(row, date))
    }

    fn opening_date(period: &Period) -> NaiveDate {
        period.start.pred_opt().unwrap_or(period.start)
    }

    /// `None` when the total leaves the decimal range.
    fn mrr_at(&self, date: NaiveDate) -> Option<Decimal> {
        checked_total(self.active_at(date).map(|row| monthly_amount_at(row, date)))
    }

    fn customers_active_at(&self, date: NaiveDate) -> BTreeSet<&'a str> {
        self.active_at(date).map(customer_of).collect()
    }

    /// Subscriptions open at the opening of `period` that are no longer
    /// active at its close.
    fn churned(&self, period: &Period) -> impl Iterator<Item = &'a NormalizedRow> {
        let opening = Self::opening_date(period);
        let close = period.end;
        self.active_at(opening)
            .filter(move |row| !is_active(row, close))
    }

    fn started_in(&self, period: &Period) -> impl Iterator<Item = &'a NormalizedRow> {
        let period = *period;
        self.subscriptions().filter(move |row| {
            row.date(fields::START_DATE)
                .is_some_and(|start| period.contains(start))
        })
    }

    /// MRR delta of every plan change inside `period`, `None` for a delta
    /// outside the decimal range.
    fn plan_changes(&self, period: &Period) -> impl Iterator<Item = Option<Decimal>> + 'a {
        let period = *period;
        self.subscriptions().filter_map(move |row| {
            let changed = row
                .date(fields::PLAN_CHANGED_AT)
                .filter(|changed| period.contains(*changed))?;
            let previous = row
                .field(fields::PREVIOUS_MONTHLY_AMOUNT)
                .and_then(FieldValue::as_amount)?;
            is_active(row, changed)
                .then(|| row.amount(fields::MONTHLY_AMOUNT).checked_sub(previous))
        })
    }

    fn in_period(&self, entity_type: EntityType, period: &Period) -> Vec<&'a NormalizedRow> {
        self.store.query(
            entity_type,
            DateRange {
                start: period.start,
                end: period.end,
            },
        )
    }

    /// Contact id → date of its first invoice.
    fn first_invoices(&self) -> BTreeMap<&'a str, NaiveDate> {
        let mut first: BTreeMap<&'a str, NaiveDate> = BTreeMap::new();
        for invoice in self.store.rows(EntityType::Invoice) {
            let (Some(contact), Some(date)) =
                (invoice.text(fields::CONTACT_ID), invoice.date(fields::DATE))
            else {
                continue;
            };
            first
                .entry(contact)
                .and_modify(|earliest| *earliest = (*earliest).min(date))
                .or_insert(date);
        }
        first
    }

    /// The category of the expense's own tags, falling back to its supplier
    /// contact's tags.
    pub fn expense_category(&self, expense: &NormalizedRow) -> ExpenseCategory {
        let own = self.categories.categorize(expense.tags());
        if own != ExpenseCategory::Uncategorized {
            return own;
        }

        let Some(contact_id) = expense.text(fields::CONTACT_ID) else {
            return own;
        };
        let source = expense.source_prefix();
        let contact_key = format!("{}:{}:{}", source, EntityType::Contact, contact_id);
        self.store
            .get(EntityType::Contact, &contact_key)
            .map(|contact| self.categories.categorize(contact.tags()))
            .unwrap_or(own)
    }

    /// `Ok(None)` when the period has no expenses at all.
    fn expense_total(
        &self,
        metric: MetricName,
        period: &Period,
        include: impl Fn(ExpenseCategory) -> bool,
    ) -> Result<Option<Decimal>> {
        let expenses = self.in_period(EntityType::Expense, period);
        if expenses.is_empty() {
            return Ok(None);
        }
        total(
            metric,
            period,
            expenses
                .into_iter()
                .filter(|row| include(self.expense_category(row)))
                .map(|row| row.amount(fields::AMOUNT)),
        )
    }

    fn revenue_total(&self, metric: MetricName, period: &Period) -> Result<Option<Decimal>> {
        let invoices = self.in_period(EntityType::Invoice, period);
        if invoices.is_empty() {
            return Ok(None);
        }
        total(
            metric,
            period,
            invoices.into_iter().map(|row| row.amount(fields::AMOUNT)),
        )
    }
}

pub fn is_active(subscription: &NormalizedRow, date: NaiveDate) -> bool {
    let started = subscription
        .date(fields::START_DATE)
        .is_some_and(|start| start <= date);
    let cancelled = subscription
        .date(fields::CANCEL_DATE)
        .is_some_and(|cancel| cancel <= date);
    started && !cancelled
}

/// Monthly amount in force on `date`: the previous plan's until the day the
/// plan changed.
pub fn monthly_amount_at(subscription: &NormalizedRow, date: NaiveDate) -> Decimal {
    let previous = subscription
        .field(fields::PREVIOUS_MONTHLY_AMOUNT)
        .and_then(FieldValue::as_amount);
    match (subscription.date(fields::PLAN_CHANGED_AT), previous) {
        (Some(changed), Some(previous)) if date < changed => previous,
        _ => subscription.amount(fields::MONTHLY_AMOUNT),
    }
}

fn customer_of(subscription: &NormalizedRow) -> &str {
    subscription
        .text(fields::CUSTOMER_ID)
        .unwrap_or(subscription.natural_key.as_str())
}

fn checked_total(values: impl IntoIterator<Item = Decimal>) -> Option<Decimal> {
    values
        .into_iter()
        .try_fold(Decimal::ZERO, |sum, value| sum.checked_add(value))
}

pub trait MetricCalculator {
    fn metric(&self) -> MetricName;

    fn value(&self, view: &StoreView<'_>, period: &Period) -> Result<Option<Decimal>>;

    fn compute(&self, view: &StoreView<'_>, period: &Period) -> Result<Option<MetricPoint>> {
        Ok(self.value(view, period)?.map(|value| MetricPoint {
            metric: self.metric(),
            period: period.start,
            value,
            computed_at: view.computed_at(),
        }))
    }
}

impl MetricCalculator for MetricName {
    fn metric(&self) -> MetricName {
        *self
    }

    fn value(&self, view: &StoreView<'_>, period: &Period) -> Result<Option<Decimal>> {
        match self {
            Self::Mrr => mrr(view, period),
            Self::Arr => arr(view, period),
            Self::NewMrr => new_mrr(view, period),
            Self::ExpansionMrr => expansion_mrr(view, period),
            Self::ContractionMrr => contraction_mrr(view, period),
            Self::ChurnedMrr => churned_mrr(view, period),
            Self::ActiveSubscriptions => Ok(active_subscriptions(view, period)),
            Self::NewSubscriptions => Ok(new_subscriptions(view, period)),
            Self::NewCustomers => Ok(new_customers(view, period)),
            Self::ActiveCustomers => Ok(active_customers(view, period)),
            Self::ChurnedCustomers => Ok(churned_customers(view, period)),
            Self::Churn => churn(view, period),
            Self::RevenueChurn => revenue_churn(view, period),
            Self::Arpa => arpa(view, period),
            Self::Ltv => ltv(view, period),
            Self::Revenue => view.revenue_total(*self, period),
            Self::Opex => view.expense_total(*self, period, |c| c == ExpenseCategory::Opex),
            Self::Cogs => view.expense_total(*self, period, |c| c == ExpenseCategory::Cogs),
            Self::FinancialCosts => {
                view.expense_total(*self, period, |c| c == ExpenseCategory::FinancialCosts)
            }
            Self::CacCosts => {
                view.expense_total(*self, period, |c| c == ExpenseCategory::Acquisition)
            }
            Self::Cac => cac(view, period),
            Self::Ebitda => ebitda(view, period),
            Self::BurnRate => burn_rate(view, period),
            Self::Runway => runway(view, period),
        }
    }
}

/// Enabled calculators in column order, deduplicated. `None` selects all.
pub fn calculators(selection: Option<&[MetricName]>) -> Vec<Box<dyn MetricCalculator>> {
    let metrics: BTreeSet<MetricName> = match selection {
        Some(metrics) => metrics.iter().copied().collect(),
        None => MetricName::ALL.into_iter().collect(),
    };
    metrics
        .into_iter()
        .map(|metric| Box::new(metric) as Box<dyn MetricCalculator>)
        .collect()
}

fn undefined(metric: MetricName, period: &Period, details: &str) -> PipelineError {
    PipelineError::DivisionUndefined {
        metric,
        period: period.start,
        details: details.to_string(),
    }
}

fn out_of_range(metric: MetricName, period: &Period) -> PipelineError {
    undefined(metric, period, "value out of range")
}

/// Re-labels an undefined input metric as the metric derived from it.
fn undefined_input(metric: MetricName, period: Period) -> impl Fn(PipelineError) -> PipelineError {
    move |e| match e {
        PipelineError::DivisionUndefined { details, .. } => undefined(metric, &period, &details),
        other => other,
    }
}

fn total(
    metric: MetricName,
    period: &Period,
    values: impl IntoIterator<Item = Decimal>,
) -> Result<Option<Decimal>> {
    checked_total(values)
        .map(Some)
        .ok_or_else(|| out_of_range(metric, period))
}

fn ratio(
    metric: MetricName,
    period: &Period,
    numerator: Decimal,
    denominator: Decimal,
    details: &str,
) -> Result<Decimal> {
    if denominator.is_zero() {
        return Err(undefined(metric, period, details));
    }
    numerator
        .checked_div(denominator)
        .ok_or_else(|| out_of_range(metric, period))
}

pub fn mrr(view: &StoreView<'_>, period: &Period) -> Result<Option<Decimal>> {
    if !view.has_subscriptions() {
        return Ok(None);
    }
    view.mrr_at(period.end)
        .map(Some)
        .ok_or_else(|| out_of_range(MetricName::Mrr, period))
}

pub fn arr(view: &StoreView<'_>, period: &Period) -> Result<Option<Decimal>> {
    let Some(mrr) = mrr(view, period).map_err(undefined_input(MetricName::Arr, *period))? else {
        return Ok(None);
    };
    mrr.checked_mul(Decimal::from(MONTHS_PER_YEAR))
        .map(Some)
        .ok_or_else(|| out_of_range(MetricName::Arr, period))
}

/// Starting monthly amount of subscriptions started in the period.
pub fn new_mrr(view: &StoreView<'_>, period: &Period) -> Result<Option<Decimal>> {
    if !view.has_subscriptions() {
        return Ok(None);
    }
    total(
        MetricName::NewMrr,
        period,
        view.started_in(period).map(|row| {
            row.date(fields::START_DATE)
                .map_or(row.amount(fields::MONTHLY_AMOUNT), |start| {
                    monthly_amount_at(row, start)
                })
        }),
    )
}

fn plan_movement(
    view: &StoreView<'_>,
    metric: MetricName,
    period: &Period,
    keep: impl Fn(Decimal) -> Option<Decimal>,
) -> Result<Option<Decimal>> {
    if !view.has_subscriptions() {
        return Ok(None);
    }
    let deltas = view
        .plan_changes(period)
        .collect::<Option<Vec<Decimal>>>()
        .ok_or_else(|| out_of_range(metric, period))?;
    total(metric, period, deltas.into_iter().filter_map(keep))
}

pub fn expansion_mrr(view: &StoreView<'_>, period: &Period) -> Result<Option<Decimal>> {
    plan_movement(view, MetricName::ExpansionMrr, period, |delta| {
        (delta > Decimal::ZERO).then_some(delta)
    })
}

pub fn contraction_mrr(view: &StoreView<'_>, period: &Period) -> Result<Option<Decimal>> {
    plan_movement(view, MetricName::ContractionMrr, period, |delta| {
        (delta < Decimal::ZERO).then_some(-delta)
    })
}

pub fn churned_mrr(view: &StoreView<'_>, period: &Period) -> Result<Option<Decimal>> {
    if !view.has_subscriptions() {
        return Ok(None);
    }
    let opening = StoreView::opening_date(period);
    total(
        MetricName::ChurnedMrr,
        period,
        view.churned(period).map(|row| monthly_amount_at(row, opening)),
    )
}

pub fn active_subscriptions(view: &StoreView<'_>, period: &Period) -> Option<Decimal> {
    view.has_subscriptions()
        .then(|| Decimal::from(view.active_at(period.end).count()))
}

pub fn new_subscriptions(view: &StoreView<'_>, period: &Period) -> Option<Decimal> {
    view.has_subscriptions()
        .then(|| Decimal::from(view.started_in(period).count()))
}

/// Contacts invoiced for the first time in the period. Absent when no
/// invoice names a contact.
pub fn new_customers(view: &StoreView<'_>, period: &Period) -> Option<Decimal> {
    let first = view.first_invoices();
    if first.is_empty() {
        return None;
    }
    let new = first.values().filter(|date| period.contains(**date)).count();
    Some(Decimal::from(new))
}

pub fn active_customers(view: &StoreView<'_>, period: &Period) -> Option<Decimal> {
    view.has_subscriptions()
        .then(|| Decimal::from(view.customers_active_at(period.end).len()))
}

pub fn churned_customers(view: &StoreView<'_>, period: &Period) -> Option<Decimal> {
    if !view.has_subscriptions() {
        return None;
    }
    let opening = view.customers_active_at(StoreView::opening_date(period));
    let close = view.customers_active_at(period.end);
    Some(Decimal::from(opening.difference(&close).count()))
}

pub fn churn(view: &StoreView<'_>, period: &Period) -> Result<Option<Decimal>> {
    if !view.has_subscriptions() {
        return Ok(None);
    }
    let opening = view.active_at(StoreView::opening_date(period)).count();
    let churned = view.churned(period).count();
    ratio(
        MetricName::Churn,
        period,
        Decimal::from(churned),
        Decimal::from(opening),
        "no subscriptions active at period start",
    )
    .map(Some)
}

pub fn revenue_churn(view: &StoreView<'_>, period: &Period) -> Result<Option<Decimal>> {
    let metric = MetricName::RevenueChurn;
    let Some(churned) = churned_mrr(view, period).map_err(undefined_input(metric, *period))?
    else {
        return Ok(None);
    };
    let opening_mrr = view
        .mrr_at(StoreView::opening_date(period))
        .ok_or_else(|| out_of_range(metric, period))?;
    ratio(
        metric,
        period,
        churned,
        opening_mrr,
        "no recurring revenue at period start",
    )
    .map(Some)
}

pub fn arpa(view: &StoreView<'_>, period: &Period) -> Result<Option<Decimal>> {
    let Some(mrr) = mrr(view, period).map_err(undefined_input(MetricName::Arpa, *period))? else {
        return Ok(None);
    };
    let accounts = view.customers_active_at(period.end).len();
    ratio(
        MetricName::Arpa,
        period,
        mrr,
        Decimal::from(accounts),
        "no active accounts",
    )
    .map(Some)
}

pub fn ltv(view: &StoreView<'_>, period: &Period) -> Result<Option<Decimal>> {
    let relabel = undefined_input(MetricName::Ltv, *period);
    let Some(arpa) = arpa(view, period).map_err(&relabel)? else {
        return Ok(None);
    };
    let Some(churn) = churn(view, period).map_err(&relabel)? else {
        return Ok(None);
    };
    ratio(MetricName::Ltv, period, arpa, churn, "churn is zero").map(Some)
}

pub fn cac(view: &StoreView<'_>, period: &Period) -> Result<Option<Decimal>> {
    if !view.has_subscriptions() {
        return Ok(None);
    }
    let spend = view
        .expense_total(MetricName::Cac, period, |c| c == ExpenseCategory::Acquisition)?
        .unwrap_or(Decimal::ZERO);
    let new_customers = view.started_in(period).count();
    ratio(
        MetricName::Cac,
        period,
        spend,
        Decimal::from(new_customers),
        "no new subscriptions",
    )
    .map(Some)
}

/// Invoice revenue minus categorized expenses. Absent when the period has
/// neither invoices nor expenses.
pub fn ebitda(view: &StoreView<'_>, period: &Period) -> Result<Option<Decimal>> {
    let metric = MetricName::Ebitda;
    let revenue = view.revenue_total(metric, period)?;
    let costs = view.expense_total(metric, period, |c| c.is_operating())?;
    if revenue.is_none() && costs.is_none() {
        return Ok(None);
    }
    revenue
        .unwrap_or(Decimal::ZERO)
        .checked_sub(costs.unwrap_or(Decimal::ZERO))
        .map(Some)
        .ok_or_else(|| out_of_range(metric, period))
}

pub fn burn_rate(view: &StoreView<'_>, period: &Period) -> Result<Option<Decimal>> {
    let ebitda = ebitda(view, period).map_err(undefined_input(MetricName::BurnRate, *period))?;
    Ok(ebitda.map(|ebitda| {
        if ebitda.is_sign_negative() {
            -ebitda
        } else {
            Decimal::ZERO
        }
    }))
}

pub fn runway(view: &StoreView<'_>, period: &Period) -> Result<Option<Decimal>> {
    let Some(burn) = burn_rate(view, period).map_err(undefined_input(MetricName::Runway, *period))?
    else {
        return Ok(None);
    };
    ratio(
        MetricName::Runway,
        period,
        view.cash_balance,
        burn,
        "burn rate is zero",
    )
    .map(Some)
}
