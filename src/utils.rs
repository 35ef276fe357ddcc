use crate::error::{PipelineError, Result};
use chrono::{Datelike, Months, NaiveDate};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

pub fn first_day_of_month(year: i32, month: u32) -> Result<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(|| {
        PipelineError::DateError(format!("Invalid year/month: {}-{:02}", year, month))
    })
}

pub fn last_day_of_month(year: i32, month: u32) -> Result<NaiveDate> {
    first_day_of_month(year, month)?
        .checked_add_months(Months::new(1))
        .and_then(|next| next.pred_opt())
        .ok_or_else(|| {
            PipelineError::DateError(format!("Month end out of range: {}-{:02}", year, month))
        })
}

/// Parses a period string in the format "YYYY-MM" or "YYYY-MM:YYYY-MM"
/// Returns (start_date, end_date)
pub fn parse_period_string(period: &str) -> Result<(NaiveDate, NaiveDate)> {
    let parts: Vec<&str> = period.split(':').collect();

    match parts.as_slice() {
        [single] => {
            let start = parse_month(single)?;
            let end = last_day_of_month(start.year(), start.month())?;
            Ok((start, end))
        }
        [from, to] => {
            let start = parse_month(from)?;
            let end_ref = parse_month(to)?;
            let end = last_day_of_month(end_ref.year(), end_ref.month())?;
            if end < start {
                return Err(PipelineError::DateError(format!(
                    "Period '{}' ends before it starts",
                    period
                )));
            }
            Ok((start, end))
        }
        _ => Err(PipelineError::DateError(format!(
            "Invalid period format: {}. Expected 'YYYY-MM' or 'YYYY-MM:YYYY-MM'",
            period
        ))),
    }
}

fn parse_month(value: &str) -> Result<NaiveDate> {
    let start_str = format!("{}-01", value.trim());
    NaiveDate::parse_from_str(&start_str, "%Y-%m-%d").map_err(|_| {
        PipelineError::DateError(format!(
            "Invalid date format in period: {}. Expected YYYY-MM",
            value
        ))
    })
}

/// Writes `contents` to a sibling temp file and renames it over `path`, so
/// readers only ever see the previous file or the complete new one.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    stage_file(dir, contents)?
        .persist(path)
        .map_err(|e| PipelineError::IoError(e.error))?;
    Ok(())
}

/// Writes and syncs `contents` into a temp file in `dir`. The file is removed
/// on drop unless persisted.
pub fn stage_file(dir: &Path, contents: &[u8]) -> Result<NamedTempFile> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    Ok(tmp)
}
