use crate::error::{PipelineError, Result};
use crate::metrics::default_category_tags;
use crate::period::Granularity;
use crate::schema::{ExpenseCategory, MetricName};
use crate::utils::parse_period_string;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OutputConfig {
    #[schemars(description = "Directory the metrics artifacts are published into")]
    pub dir: PathBuf,

    #[serde(default = "default_file_stem")]
    #[schemars(description = "Base file name; '.csv', '.parquet' and '_summary.csv' are appended")]
    pub file_stem: String,

    #[serde(default)]
    #[schemars(
        description = "If true, artifacts land in a 'YYYY-MM' subdirectory named after the run month"
    )]
    pub monthly_partition: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/OUTPUT"),
            file_stem: default_file_stem(),
            monthly_partition: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PipelineConfig {
    #[schemars(description = "JSON file holding the incremental store between runs")]
    pub store_path: PathBuf,

    #[schemars(
        description = "Directory with raw dumps named '<source>_<entity>_raw.json' (e.g. 'accounting_invoice_raw.json')"
    )]
    pub raw_dir: PathBuf,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    #[schemars(description = "Bucket size of the metrics table")]
    pub granularity: Granularity,

    #[serde(default = "default_cash_balance")]
    #[schemars(
        with = "String",
        description = "Cash on hand used for runway (cash / burn rate). Defaults to 10000."
    )]
    pub cash_balance: Decimal,

    #[serde(default)]
    #[schemars(description = "First month of the table (YYYY-MM). Defaults to the earliest data.")]
    pub from: Option<String>,

    #[serde(default)]
    #[schemars(description = "Last month of the table (YYYY-MM). Defaults to the latest data.")]
    pub to: Option<String>,

    #[serde(default = "default_page_size")]
    #[schemars(description = "Records per page requested from source clients")]
    pub page_size: usize,

    #[serde(default = "default_max_retries")]
    #[schemars(description = "Sequential retries per page before a source is reported unavailable")]
    pub max_retries: u32,

    #[serde(default)]
    #[schemars(description = "Metrics to compute. Omit to compute every metric.")]
    pub metrics: Option<Vec<MetricName>>,

    #[serde(default = "default_category_tags")]
    #[schemars(
        description = "Tag substring (case-insensitive) to expense category, used for EBITDA and CAC"
    )]
    pub category_tags: BTreeMap<String, ExpenseCategory>,
}

fn default_file_stem() -> String {
    "final_metrics".to_string()
}

fn default_cash_balance() -> Decimal {
    Decimal::from(10_000)
}

fn default_page_size() -> usize {
    100
}

fn default_max_retries() -> u32 {
    2
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("data/STORE/metrics_store.json"),
            raw_dir: PathBuf::from("data/INPUT/raw"),
            output: OutputConfig::default(),
            granularity: Granularity::default(),
            cash_balance: default_cash_balance(),
            from: None,
            to: None,
            page_size: default_page_size(),
            max_retries: default_max_retries(),
            metrics: None,
            category_tags: default_category_tags(),
        }
    }
}

impl PipelineConfig {
    /// Default layout with every path placed under `root`.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            store_path: root.join("store").join("metrics_store.json"),
            raw_dir: root.join("raw"),
            output: OutputConfig {
                dir: root.join("output"),
                ..OutputConfig::default()
            },
            ..Self::default()
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.store_path.as_os_str().is_empty() {
            return Err(PipelineError::InvalidConfig("store_path is empty".to_string()));
        }
        if self.output.dir.as_os_str().is_empty() {
            return Err(PipelineError::InvalidConfig("output.dir is empty".to_string()));
        }
        if self.output.file_stem.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "output.file_stem is empty".to_string(),
            ));
        }
        if self.page_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "page_size must be at least 1".to_string(),
            ));
        }
        if self.cash_balance.is_sign_negative() {
            return Err(PipelineError::InvalidConfig(format!(
                "cash_balance must not be negative, got {}",
                self.cash_balance
            )));
        }
        if let Some(metrics) = &self.metrics {
            if metrics.is_empty() {
                return Err(PipelineError::InvalidConfig(
                    "metrics list is empty; omit it to compute every metric".to_string(),
                ));
            }
        }

        let (from, to) = self.window()?;
        if let (Some(from), Some(to)) = (from, to) {
            if to < from {
                return Err(PipelineError::InvalidConfig(format!(
                    "'to' ({}) is before 'from' ({})",
                    to, from
                )));
            }
        }

        Ok(())
    }

    /// `from` as the first day of its month and `to` as the last day of its month.
    pub fn window(&self) -> Result<(Option<NaiveDate>, Option<NaiveDate>)> {
        let from = self
            .from
            .as_deref()
            .map(parse_period_string)
            .transpose()?
            .map(|(start, _)| start);
        let to = self
            .to
            .as_deref()
            .map(parse_period_string)
            .transpose()?
            .map(|(_, end)| end);
        Ok((from, to))
    }

    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(PipelineConfig)
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_generation() {
        let schema_json = PipelineConfig::schema_as_json().unwrap();
        assert!(schema_json.contains("store_path"));
        assert!(schema_json.contains("category_tags"));
        assert!(schema_json.contains("cash_balance"));
    }

    #[test]
    fn test_minimal_config_fills_defaults() {
        let json = r#"{"store_path": "s.json", "raw_dir": "raw"}"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.granularity, Granularity::Monthly);
        assert_eq!(config.cash_balance, Decimal::from(10_000));
        assert_eq!(config.output.file_stem, "final_metrics");
        assert_eq!(
            config.category_tags.get("cac"),
            Some(&ExpenseCategory::Acquisition)
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cash_balance_accepts_string_or_number() {
        let json = r#"{"store_path": "s", "raw_dir": "r", "cash_balance": "2500.50"}"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.cash_balance.to_string(), "2500.50");

        let json = r#"{"store_path": "s", "raw_dir": "r", "cash_balance": 4000}"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.cash_balance, Decimal::from(4000));
    }

    #[test]
    fn test_window_parsing() {
        let config = PipelineConfig {
            from: Some("2024-01".to_string()),
            to: Some("2024-03".to_string()),
            ..PipelineConfig::default()
        };
        let (from, to) = config.window().unwrap();
        assert_eq!(from, NaiveDate::from_ymd_opt(2024, 1, 1));
        assert_eq!(to, NaiveDate::from_ymd_opt(2024, 3, 31));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let inverted = PipelineConfig {
            from: Some("2024-05".to_string()),
            to: Some("2024-01".to_string()),
            ..PipelineConfig::default()
        };
        assert!(inverted.validate().is_err());

        let zero_page = PipelineConfig {
            page_size: 0,
            ..PipelineConfig::default()
        };
        assert!(zero_page.validate().is_err());

        let bad_month = PipelineConfig {
            from: Some("24/01".to_string()),
            ..PipelineConfig::default()
        };
        assert!(bad_month.validate().is_err());

        let no_metrics = PipelineConfig {
            metrics: Some(vec![]),
            ..PipelineConfig::default()
        };
        assert!(no_metrics.validate().is_err());
    }

    #[test]
    fn test_rooted_at_places_paths_under_root() {
        let config = PipelineConfig::rooted_at(Path::new("/tmp/run"));
        assert!(config.store_path.starts_with("/tmp/run"));
        assert!(config.raw_dir.starts_with("/tmp/run"));
        assert!(config.output.dir.starts_with("/tmp/run"));
    }
}
