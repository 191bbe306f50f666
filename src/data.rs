//! Transaction records, coercion from raw rows and CSV adapters using Polars

use crate::error::{Error, MalformedRecord};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use polars::prelude::*;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

/// A validated transaction row
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub customer_id: String,
    pub transaction_id: String,
    pub amount: f64,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    /// Product category, when the source carries one
    pub category: Option<String>,
}

impl TransactionRecord {
    pub fn new(
        customer_id: impl Into<String>,
        transaction_id: impl Into<String>,
        amount: f64,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            customer_id: customer_id.into(),
            transaction_id: transaction_id.into(),
            amount,
            value,
            timestamp,
            category: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Reason this record cannot be aggregated, if any
    pub(crate) fn defect(&self) -> Option<String> {
        if self.customer_id.trim().is_empty() {
            Some("missing customer id".to_string())
        } else if !self.amount.is_finite() {
            Some(format!("non-numeric amount {}", self.amount))
        } else if !self.value.is_finite() {
            Some(format!("non-numeric value {}", self.value))
        } else {
            None
        }
    }
}

/// An untyped input row exactly as read from the source
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTransaction {
    pub customer_id: Option<String>,
    pub transaction_id: Option<String>,
    pub amount: Option<String>,
    pub value: Option<String>,
    pub timestamp: Option<String>,
    pub category: Option<String>,
}

impl RawTransaction {
    /// Coerce into a typed record
    pub fn coerce(&self, row: usize) -> Result<TransactionRecord, MalformedRecord> {
        let malformed = |reason: String| MalformedRecord { row, reason };

        let customer_id = self
            .customer_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| malformed("missing customer id".to_string()))?;
        let transaction_id = self
            .transaction_id
            .as_deref()
            .map(str::trim)
            .unwrap_or_default();
        let amount = parse_number(self.amount.as_deref())
            .ok_or_else(|| malformed(format!("non-numeric amount {:?}", self.amount)))?;
        let value = parse_number(self.value.as_deref())
            .ok_or_else(|| malformed(format!("non-numeric value {:?}", self.value)))?;
        let timestamp = self
            .timestamp
            .as_deref()
            .and_then(parse_timestamp)
            .ok_or_else(|| malformed(format!("unparseable timestamp {:?}", self.timestamp)))?;

        let mut record = TransactionRecord::new(customer_id, transaction_id, amount, value, timestamp);
        // a blank category is the same as none
        if let Some(category) = self.category.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            record = record.with_category(category);
        }
        Ok(record)
    }
}

/// Coerce a batch of raw rows, collecting failures instead of aborting
pub fn coerce_records(raw: &[RawTransaction]) -> (Vec<TransactionRecord>, Vec<MalformedRecord>) {
    let mut records = Vec::with_capacity(raw.len());
    let mut rejected = Vec::new();

    for (row, item) in raw.iter().enumerate() {
        match item.coerce(row) {
            Ok(record) => records.push(record),
            Err(bad) => rejected.push(bad),
        }
    }

    if !rejected.is_empty() {
        log::warn!(
            "{} of {} input rows could not be coerced into transactions",
            rejected.len(),
            raw.len()
        );
    }

    (records, rejected)
}

fn parse_number(text: Option<&str>) -> Option<f64> {
    text?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|number| number.is_finite())
}

/// Parse RFC 3339 timestamps, falling back to naive UTC date-times and plain dates
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Column names of the transaction CSV
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvSchema {
    pub customer_id: String,
    pub transaction_id: String,
    pub amount: String,
    pub value: String,
    pub timestamp: String,
    /// Optional column; rows carry no category when it is absent from the file
    pub category: Option<String>,
}

impl Default for CsvSchema {
    fn default() -> Self {
        Self {
            customer_id: "CustomerId".to_string(),
            transaction_id: "TransactionId".to_string(),
            amount: "Amount".to_string(),
            value: "Value".to_string(),
            timestamp: "TransactionStartTime".to_string(),
            category: Some("ProductCategory".to_string()),
        }
    }
}

/// The loaded CSV together with its rows projected onto the transaction schema
#[derive(Debug)]
pub struct TransactionFrame {
    /// Every original column, read as strings
    pub frame: DataFrame,
    /// One raw row per frame row, same order
    pub rows: Vec<RawTransaction>,
}

/// Load a transaction CSV keeping all original columns
///
/// # Arguments
/// * `file_path` - Path to the CSV file
/// * `schema` - Names of the columns holding the transaction fields
pub fn load_transactions(file_path: &Path, schema: &CsvSchema) -> crate::Result<TransactionFrame> {
    let frame = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .try_into_reader_with_file_path(Some(file_path.to_path_buf()))?
        .finish()?;

    if frame.height() == 0 {
        return Err(Error::InvalidConfig(format!(
            "no rows found in {}",
            file_path.display()
        )));
    }

    let customer_ids = string_column(&frame, &schema.customer_id)?;
    let transaction_ids = string_column(&frame, &schema.transaction_id)?;
    let amounts = string_column(&frame, &schema.amount)?;
    let values = string_column(&frame, &schema.value)?;
    let timestamps = string_column(&frame, &schema.timestamp)?;
    let categories = match schema.category.as_deref() {
        Some(name) if frame.get_column_names().iter().any(|column| *column == name) => string_column(&frame, name)?,
        Some(name) => {
            log::debug!("no {name} column in {}, transactions carry no category", file_path.display());
            vec![None; frame.height()]
        }
        None => vec![None; frame.height()],
    };

    let rows = customer_ids
        .into_iter()
        .zip(transaction_ids)
        .zip(amounts)
        .zip(values)
        .zip(timestamps)
        .zip(categories)
        .map(
            |(((((customer_id, transaction_id), amount), value), timestamp), category)| RawTransaction {
                customer_id,
                transaction_id,
                amount,
                value,
                timestamp,
                category,
            },
        )
        .collect();

    log::info!(
        "loaded {} rows x {} columns from {}",
        frame.height(),
        frame.width(),
        file_path.display()
    );

    Ok(TransactionFrame { frame, rows })
}

fn string_column(frame: &DataFrame, name: &str) -> crate::Result<Vec<Option<String>>> {
    let column = frame.column(name)?.cast(&DataType::String)?;
    let values = column
        .str()?
        .into_iter()
        .map(|value| value.map(str::to_owned))
        .collect();
    Ok(values)
}

/// Outcome of writing the labeled transaction table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportSummary {
    pub written: usize,
    pub dropped: usize,
}

/// Write all original columns plus `is_high_risk` (0/1), one row per labeled transaction
///
/// Rows whose customer has no label (malformed input, or dropped upstream) are
/// left out and counted in the summary.
pub fn write_labeled_transactions(
    transactions: &TransactionFrame,
    labels: &BTreeMap<String, bool>,
    output_path: &Path,
) -> crate::Result<ExportSummary> {
    let row_labels: Vec<Option<bool>> = transactions
        .rows
        .iter()
        .enumerate()
        .map(|(row, raw)| {
            raw.coerce(row)
                .ok()
                .and_then(|record| labels.get(&record.customer_id).copied())
        })
        .collect();

    let keep: Vec<bool> = row_labels.iter().map(Option::is_some).collect();
    let flags: Vec<i32> = row_labels.iter().flatten().map(|&high| i32::from(high)).collect();

    let mask = Series::new("keep", keep.as_slice());
    let mut labeled = transactions.frame.filter(mask.bool()?)?;
    labeled.with_column(Series::new("is_high_risk", flags.as_slice()))?;

    let mut file = File::create(output_path)?;
    CsvWriter::new(&mut file)
        .include_header(true)
        .finish(&mut labeled)?;

    let summary = ExportSummary {
        written: labeled.height(),
        dropped: transactions.frame.height() - labeled.height(),
    };
    if summary.dropped > 0 {
        log::warn!("{} unlabeled rows left out of {}", summary.dropped, output_path.display());
    }
    Ok(summary)
}

/// Write one row per scored customer: id, probability and the 0.5-threshold flag
pub fn write_customer_scores(
    customer_ids: &[String],
    probabilities: &[f64],
    output_path: &Path,
) -> crate::Result<()> {
    if customer_ids.len() != probabilities.len() {
        return Err(Error::InvalidConfig(format!(
            "{} customers but {} scores",
            customer_ids.len(),
            probabilities.len()
        )));
    }
    let flags: Vec<i32> = probabilities.iter().map(|&p| i32::from(p >= 0.5)).collect();
    let mut scores = DataFrame::new(vec![
        Series::new("CustomerId", customer_ids),
        Series::new("risk_probability", probabilities),
        Series::new("is_high_risk", flags.as_slice()),
    ])?;

    let mut file = File::create(output_path)?;
    CsvWriter::new(&mut file)
        .include_header(true)
        .finish(&mut scores)?;
    Ok(())
}
