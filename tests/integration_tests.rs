use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use saas_metrics_pipeline::*;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;

fn write_dump(raw_dir: &Path, source: Source, entity: EntityType, document: Value) {
    std::fs::create_dir_all(raw_dir).unwrap();
    let path = JsonFileSource::path_for(raw_dir, source, entity);
    std::fs::write(path, serde_json::to_vec_pretty(&document).unwrap()).unwrap();
}

fn raw(
    source: Source,
    entity_type: EntityType,
    id: &str,
    fetched_secs: i64,
    payload: Value,
) -> RawRecord {
    RawRecord {
        source,
        entity_type,
        external_id: id.to_string(),
        payload,
        fetched_at: DateTime::from_timestamp(fetched_secs, 0).unwrap(),
    }
}

fn driver_for(config: &PipelineConfig, sink: MemorySink) -> AggregationDriver {
    let ctx = RunContext::from_config(config, Box::new(sink)).unwrap();
    AggregationDriver::new(ctx, Normalizer::new())
}

/// Parses a published CSV into period -> column -> cell.
fn read_table(path: &Path) -> BTreeMap<String, BTreeMap<String, String>> {
    let mut reader = csv::Reader::from_path(path).unwrap();
    let headers = reader.headers().unwrap().clone();
    let mut table = BTreeMap::new();
    for record in reader.records() {
        let record = record.unwrap();
        let cells: BTreeMap<String, String> = headers
            .iter()
            .zip(record.iter())
            .map(|(h, v)| (h.to_string(), v.to_string()))
            .collect();
        table.insert(record[0].to_string(), cells);
    }
    table
}

fn seed_saas_dumps(raw_dir: &Path) {
    write_dump(
        raw_dir,
        Source::Billing,
        EntityType::Subscription,
        json!({"data": [
            {
                "uuid": "sub_1",
                "customer_uuid": "cus_1",
                "plan": {"name": "Pro", "amount": 100, "interval": "month"},
                "start-date": "2024-01-10",
                "cancellation_dates": ["2024-03-05"]
            },
            {
                "uuid": "sub_2",
                "customer_uuid": "cus_2",
                "plan": {"name": "Team", "amount": "1200", "interval": "year"},
                "start-date": "2024-02-03",
                "cancellation_dates": []
            }
        ]}),
    );
    write_dump(
        raw_dir,
        Source::Accounting,
        EntityType::Contact,
        json!([
            {"id": "sup_1", "name": "Cloud Host", "tags": ["cogs"]},
            {"id": "cli_1", "name": "ACME", "type": "client"}
        ]),
    );
    write_dump(
        raw_dir,
        Source::Accounting,
        EntityType::Invoice,
        json!([
            {"id": "inv_1", "contact": "cli_1", "date": 1706745600, "total": 250},
            {"id": "inv_2", "contact": "cli_1", "date": 1709251200, "total": "300.10"},
            {"id": "inv_bad", "contact": "cli_1", "date": 1709251200}
        ]),
    );
    write_dump(
        raw_dir,
        Source::Accounting,
        EntityType::Expense,
        json!([
            {"id": "exp_1", "date": "2024-02-05", "total": 400, "tags": ["opex"]},
            {"id": "exp_2", "date": "2024-02-06", "total": 90, "contact": "sup_1"},
            {"id": "exp_3", "date": "2024-02-07", "total": 60, "tags": ["Ads", "CAC"]}
        ]),
    );
}

#[test]
fn test_subscription_lifecycle_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::rooted_at(dir.path());
    write_dump(
        &config.raw_dir,
        Source::Billing,
        EntityType::Subscription,
        json!([{
            "uuid": "sub_1",
            "customer_uuid": "cus_1",
            "plan": {"name": "Pro", "amount": 100, "interval": "month"},
            "start-date": "2024-01-10",
            "cancellation_dates": ["2024-03-05"]
        }]),
    );

    let output = run_pipeline(&config, Box::new(MemorySink::new())).unwrap();
    assert_eq!(output.summary.stage, PipelineStage::Done);

    let table = read_table(&output.artifacts.csv);
    let periods: Vec<&String> = table.keys().collect();
    assert_eq!(periods, vec!["2024-01-01", "2024-02-01", "2024-03-01"]);

    assert_eq!(table["2024-01-01"]["mrr"], "100");
    assert_eq!(table["2024-02-01"]["mrr"], "100");
    assert_eq!(table["2024-03-01"]["mrr"], "0");
    assert_eq!(table["2024-03-01"]["churn"], "1");
    assert_eq!(table["2024-01-01"]["arr"], "1200");
    assert_eq!(table["2024-03-01"]["cac"], "");

    // no accounting dumps were provided
    let missing: Vec<EntityType> = output
        .summary
        .unavailable
        .iter()
        .map(|u| u.entity)
        .collect();
    assert_eq!(
        missing,
        vec![EntityType::Contact, EntityType::Invoice, EntityType::Expense]
    );
}

#[test]
fn test_full_dataset_metrics() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig {
        cash_balance: Decimal::from(5_000),
        ..PipelineConfig::rooted_at(dir.path())
    };
    seed_saas_dumps(&config.raw_dir);

    let output = run_pipeline(&config, Box::new(MemorySink::new())).unwrap();
    assert_eq!(output.summary.rows_skipped, 1);
    assert!(output.summary.unavailable.is_empty());

    let feb = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
    let table = &output.table;
    assert_eq!(table.get(feb, MetricName::Mrr), Some(Decimal::from(200)));
    assert_eq!(table.get(feb, MetricName::Revenue), Some(Decimal::from(250)));
    assert_eq!(table.get(feb, MetricName::Opex), Some(Decimal::from(400)));
    assert_eq!(table.get(feb, MetricName::Cogs), Some(Decimal::from(90)));
    assert_eq!(table.get(feb, MetricName::CacCosts), Some(Decimal::from(60)));
    assert_eq!(table.get(feb, MetricName::Cac), Some(Decimal::from(60)));
    // 250 - (400 + 90 + 60)
    assert_eq!(table.get(feb, MetricName::Ebitda), Some(Decimal::from(-300)));
    assert_eq!(table.get(feb, MetricName::BurnRate), Some(Decimal::from(300)));

    let runway = table.get(feb, MetricName::Runway).unwrap();
    assert_eq!(
        runway.round_dp(6),
        (Decimal::from(5_000) / Decimal::from(300)).round_dp(6)
    );

    for period in table.periods() {
        if let Some(mrr) = table.get(period, MetricName::Mrr) {
            assert_eq!(
                table.get(period, MetricName::Arr),
                Some(mrr * Decimal::from(12))
            );
        }
    }

    assert!(output.artifacts.parquet.exists());
    let summary = std::fs::read_to_string(&output.artifacts.summary).unwrap();
    assert!(summary.starts_with("metric,count,min,max,mean"));
}

#[test]
fn test_rerun_on_unchanged_input_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::rooted_at(dir.path());
    seed_saas_dumps(&config.raw_dir);

    let first = run_pipeline(&config, Box::new(MemorySink::new())).unwrap();
    let csv_first = std::fs::read(&first.artifacts.csv).unwrap();
    let parquet_first = std::fs::read(&first.artifacts.parquet).unwrap();

    let second = run_pipeline(&config, Box::new(MemorySink::new())).unwrap();
    let csv_second = std::fs::read(&second.artifacts.csv).unwrap();
    let parquet_second = std::fs::read(&second.artifacts.parquet).unwrap();

    assert_eq!(csv_first, csv_second);
    assert_eq!(parquet_first, parquet_second);
    assert_eq!(second.summary.rows_inserted, 0);
    assert_eq!(second.summary.rows_unchanged, first.summary.rows_inserted);
}

#[test]
fn test_invoice_without_amount_is_skipped_and_batch_continues() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::rooted_at(dir.path());
    let sink = MemorySink::new();
    let mut driver = driver_for(&config, sink.clone());

    let output = driver
        .run(vec![
            raw(
                Source::Accounting,
                EntityType::Invoice,
                "inv_1",
                1_000,
                json!({"date": "2024-04-02", "total": 10}),
            ),
            raw(
                Source::Accounting,
                EntityType::Invoice,
                "inv_2",
                1_000,
                json!({"date": "2024-04-03"}),
            ),
            raw(
                Source::Accounting,
                EntityType::Invoice,
                "inv_3",
                1_000,
                json!({"date": "2024-04-04", "amount": 5}),
            ),
        ])
        .unwrap();

    assert_eq!(output.summary.rows_skipped, 1);
    assert_eq!(output.summary.rows_inserted, 2);
    let april = NaiveDate::from_ymd_opt(2024, 4, 1).unwrap();
    assert_eq!(output.table.get(april, MetricName::Revenue), Some(Decimal::from(15)));

    let warnings = sink.events_at(log::Level::Warn);
    assert!(warnings
        .iter()
        .any(|event| event.message.contains("inv_2") && event.message.contains("amount")));
}

#[test]
fn test_later_source_timestamp_wins_in_either_order() {
    let t1 = raw(
        Source::Accounting,
        EntityType::Expense,
        "exp_1",
        1_000,
        json!({"date": "2024-05-10", "total": 100, "tags": ["opex"], "updatedAt": 1_700_000_000}),
    );
    let t2 = raw(
        Source::Accounting,
        EntityType::Expense,
        "exp_1",
        1_000,
        json!({"date": "2024-05-10", "total": 175, "tags": ["opex"], "updatedAt": 1_700_000_500}),
    );

    let mut published = Vec::new();
    for batch in [vec![t1.clone(), t2.clone()], vec![t2, t1]] {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::rooted_at(dir.path());
        let mut driver = driver_for(&config, MemorySink::new());
        let output = driver.run(batch).unwrap();

        let kept = driver
            .store()
            .unwrap()
            .get(EntityType::Expense, "accounting:expense:exp_1")
            .unwrap();
        assert_eq!(kept.amount(fields::AMOUNT), Decimal::from(175));
        assert_eq!(driver.store().unwrap().count(EntityType::Expense), 1);

        published.push(std::fs::read(&output.artifacts.csv).unwrap());
    }
    assert_eq!(published[0], published[1]);
}

#[test]
fn test_integrity_fault_leaves_previous_artifact_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::rooted_at(dir.path());
    let version = |total: i64| {
        raw(
            Source::Accounting,
            EntityType::Expense,
            "exp_1",
            1_000,
            json!({"date": "2024-05-10", "total": total, "updatedAt": "2024-05-11T09:00:00Z"}),
        )
    };

    let first = driver_for(&config, MemorySink::new())
        .run(vec![version(100)])
        .unwrap();
    let csv_before = std::fs::read(&first.artifacts.csv).unwrap();
    let store_before = std::fs::read(&config.store_path).unwrap();

    let sink = MemorySink::new();
    let mut driver = driver_for(&config, sink.clone());
    let err = driver.run(vec![version(250)]).unwrap_err();

    assert!(matches!(err, PipelineError::StoreIntegrity(_)));
    assert_eq!(driver.stage(), PipelineStage::Failed);
    assert_eq!(std::fs::read(&first.artifacts.csv).unwrap(), csv_before);
    assert_eq!(std::fs::read(&config.store_path).unwrap(), store_before);
    assert!(!sink.events_at(log::Level::Error).is_empty());
}

#[test]
fn test_corrupt_store_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::rooted_at(dir.path());
    std::fs::create_dir_all(config.store_path.parent().unwrap()).unwrap();
    std::fs::write(&config.store_path, "[[[").unwrap();

    let mut driver = driver_for(&config, MemorySink::new());
    let err = driver.run(Vec::new()).unwrap_err();
    assert!(matches!(err, PipelineError::StoreIntegrity(_)));
    assert_eq!(driver.stage(), PipelineStage::Failed);
}

#[test]
fn test_watermarks_persist_between_runs() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::rooted_at(dir.path());
    seed_saas_dumps(&config.raw_dir);

    run_pipeline(&config, Box::new(MemorySink::new())).unwrap();
    let store = IncrementalStore::load(&config.store_path).unwrap();
    for entity in [
        EntityType::Contact,
        EntityType::Invoice,
        EntityType::Expense,
    ] {
        assert!(store.watermark(Source::Accounting, entity).is_some());
    }
    assert!(store
        .watermark(Source::Billing, EntityType::Subscription)
        .is_some());
}

#[test]
fn test_static_sources_feed_the_driver() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig {
        metrics: Some(vec![MetricName::Mrr, MetricName::Revenue]),
        ..PipelineConfig::rooted_at(dir.path())
    };
    let fetched: DateTime<Utc> = DateTime::from_timestamp(1_000, 0).unwrap();

    let billing = StaticSource::new(Source::Billing, 1).with_records(vec![
        raw(
            Source::Billing,
            EntityType::Subscription,
            "sub_1",
            fetched.timestamp(),
            json!({"plan_amount": 30, "start_date": "2024-06-01"}),
        ),
        raw(
            Source::Billing,
            EntityType::Subscription,
            "sub_2",
            fetched.timestamp(),
            json!({"plan_amount": 90, "billing_interval": "quarter", "start_date": "2024-06-12"}),
        ),
    ]);
    let accounting = StaticSource::new(Source::Accounting, 1).with_records(vec![raw(
        Source::Accounting,
        EntityType::Invoice,
        "inv_1",
        fetched.timestamp(),
        json!({"date": "2024-06-20", "total": 60}),
    )]);
    let mut sources: Vec<Box<dyn SourceClient>> = vec![Box::new(billing), Box::new(accounting)];

    let mut driver = driver_for(&config, MemorySink::new());
    let output = driver.run_with_sources(&mut sources).unwrap();

    let june = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
    assert_eq!(output.table.get(june, MetricName::Mrr), Some(Decimal::from(60)));
    assert_eq!(output.table.get(june, MetricName::Revenue), Some(Decimal::from(60)));
    assert_eq!(output.table.columns(), vec![MetricName::Mrr, MetricName::Revenue]);

    let header = std::fs::read_to_string(&output.artifacts.csv).unwrap();
    assert_eq!(header.lines().next(), Some("period,mrr,revenue"));
}

#[test]
fn test_rerun_after_category_tags_change() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::rooted_at(dir.path());
    write_dump(
        &config.raw_dir,
        Source::Accounting,
        EntityType::Expense,
        json!([{"id": "e1", "date": "2024-02-05", "total": 40, "tags": ["marketing"]}]),
    );
    let feb = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();

    let first = run_pipeline(&config, Box::new(MemorySink::new())).unwrap();
    assert_eq!(first.table.get(feb, MetricName::CacCosts), Some(Decimal::ZERO));

    let mut category_tags = config.category_tags.clone();
    category_tags.insert("marketing".to_string(), ExpenseCategory::Acquisition);
    let remapped = PipelineConfig {
        category_tags,
        ..config.clone()
    };

    let second = run_pipeline(&remapped, Box::new(MemorySink::new())).unwrap();
    assert_eq!(second.summary.stage, PipelineStage::Done);
    assert_eq!(second.summary.rows_unchanged, 1);
    assert_eq!(second.table.get(feb, MetricName::CacCosts), Some(Decimal::from(40)));
    assert_eq!(second.table.get(feb, MetricName::Ebitda), Some(Decimal::from(-40)));
}

#[test]
fn test_out_of_range_plan_amounts_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::rooted_at(dir.path());
    let mut driver = driver_for(&config, MemorySink::new());

    let output = driver
        .run(vec![
            raw(
                Source::Billing,
                EntityType::Subscription,
                "huge_daily",
                1_000,
                json!({
                    "plan_amount": "79228162514264337593543950335",
                    "billing_interval": "day",
                    "start_date": "2024-07-01"
                }),
            ),
            raw(
                Source::Billing,
                EntityType::Subscription,
                "tiny_count",
                1_000,
                json!({
                    "plan_amount": 100,
                    "interval_count": "0.0000000000000000000000000001",
                    "start_date": "2024-07-01"
                }),
            ),
            raw(
                Source::Billing,
                EntityType::Subscription,
                "ok",
                1_000,
                json!({"plan_amount": 25, "start_date": "2024-07-02"}),
            ),
        ])
        .unwrap();

    assert_eq!(output.summary.rows_skipped, 2);
    assert_eq!(output.summary.rows_inserted, 1);
    let july = NaiveDate::from_ymd_opt(2024, 7, 1).unwrap();
    assert_eq!(output.table.get(july, MetricName::Mrr), Some(Decimal::from(25)));
}

#[test]
fn test_plan_changes_feed_expansion_and_contraction() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::rooted_at(dir.path());
    let mut driver = driver_for(&config, MemorySink::new());

    let output = driver
        .run(vec![
            raw(
                Source::Billing,
                EntityType::Subscription,
                "sub_up",
                1_000,
                json!({
                    "customer_uuid": "cus_1",
                    "plan": {"amount": 1800, "interval": "year"},
                    "plan_change": {"previous_amount": 1200, "date": "2024-02-14"},
                    "start_date": "2024-01-05"
                }),
            ),
            raw(
                Source::Billing,
                EntityType::Subscription,
                "sub_down",
                1_000,
                json!({
                    "customer_uuid": "cus_2",
                    "plan_amount": 20,
                    "previous_plan_amount": 50,
                    "plan_changed_at": "2024-02-20",
                    "start_date": "2024-01-08"
                }),
            ),
            raw(
                Source::Accounting,
                EntityType::Invoice,
                "inv_feb",
                1_000,
                json!({"contact": "cli_1", "date": "2024-02-25", "total": 170}),
            ),
        ])
        .unwrap();

    let jan = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    let feb = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
    let table = &output.table;
    assert_eq!(table.get(jan, MetricName::Mrr), Some(Decimal::from(150)));
    assert_eq!(table.get(jan, MetricName::NewMrr), Some(Decimal::from(150)));
    assert_eq!(table.get(feb, MetricName::Mrr), Some(Decimal::from(170)));
    assert_eq!(table.get(feb, MetricName::ExpansionMrr), Some(Decimal::from(50)));
    assert_eq!(table.get(feb, MetricName::ContractionMrr), Some(Decimal::from(30)));
    assert_eq!(table.get(feb, MetricName::ActiveCustomers), Some(Decimal::from(2)));
    assert_eq!(table.get(feb, MetricName::ChurnedCustomers), Some(Decimal::ZERO));
    assert_eq!(table.get(feb, MetricName::NewCustomers), Some(Decimal::ONE));
}
