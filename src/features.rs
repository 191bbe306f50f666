//! Per-customer aggregation of transaction rows into a fixed-width feature table
//!
//! Columns are named `<field>_<stat>`: amount and value statistics, calendar
//! spread of the transaction times, and product category mix. Category codes
//! are not used as features, since a label code depends on the categories seen
//! in one batch and would shift between training and scoring.

use crate::data::TransactionRecord;
use crate::error::{Error, MalformedRecord};
use chrono::{Datelike, Timelike, Weekday};
use ndarray::{Array2, ArrayView1};
use std::collections::{BTreeMap, BTreeSet};

/// Column names of the aggregated feature table, in matrix order
pub const FEATURE_COLUMNS: [&str; 19] = [
    "amount_sum",
    "amount_mean",
    "amount_std",
    "amount_max",
    "amount_min",
    "amount_count",
    "value_sum",
    "value_mean",
    "value_std",
    "value_max",
    "value_min",
    "hour_nunique",
    "day_nunique",
    "month_nunique",
    "weekday_nunique",
    "year_nunique",
    "weekend_share",
    "category_nunique",
    "category_top_share",
];

/// Feature matrix with one row per customer
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    /// Customer ids, sorted, one per row
    pub customer_ids: Vec<String>,
    /// Column names, one per matrix column
    pub columns: Vec<String>,
    /// Aggregated features (n_customers, n_columns); `*_std` is NaN for single
    /// transactions and `category_top_share` is NaN without categories
    pub features: Array2<f64>,
}

impl FeatureTable {
    pub fn len(&self) -> usize {
        self.customer_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.customer_ids.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    /// Feature vector of a single customer
    pub fn customer(&self, customer_id: &str) -> Option<ArrayView1<'_, f64>> {
        self.customer_ids
            .binary_search_by(|id| id.as_str().cmp(customer_id))
            .ok()
            .map(|row| self.features.row(row))
    }
}

/// Aggregated table plus the records that were skipped
#[derive(Debug, Clone)]
pub struct AggregationOutcome {
    pub table: FeatureTable,
    pub rejected: Vec<MalformedRecord>,
}

#[derive(Default)]
struct CustomerAccumulator {
    amounts: Vec<f64>,
    values: Vec<f64>,
    hours: BTreeSet<u32>,
    days: BTreeSet<u32>,
    months: BTreeSet<u32>,
    weekdays: BTreeSet<u32>,
    years: BTreeSet<i32>,
    weekend: usize,
    categories: BTreeMap<String, usize>,
}

impl CustomerAccumulator {
    fn push(&mut self, record: &TransactionRecord) {
        let at = record.timestamp;
        self.amounts.push(record.amount);
        self.values.push(record.value);
        self.hours.insert(at.hour());
        self.days.insert(at.day());
        self.months.insert(at.month());
        self.weekdays.insert(at.weekday().num_days_from_monday());
        self.years.insert(at.year());
        if matches!(at.weekday(), Weekday::Sat | Weekday::Sun) {
            self.weekend += 1;
        }
        if let Some(category) = &record.category {
            *self.categories.entry(category.clone()).or_insert(0) += 1;
        }
    }

    fn calendar(&self) -> [f64; 6] {
        [
            self.hours.len() as f64,
            self.days.len() as f64,
            self.months.len() as f64,
            self.weekdays.len() as f64,
            self.years.len() as f64,
            self.weekend as f64 / self.amounts.len() as f64,
        ]
    }

    /// Distinct categories and the share of the most frequent one
    fn category_mix(&self) -> [f64; 2] {
        let labelled: usize = self.categories.values().sum();
        let top = self.categories.values().copied().max().unwrap_or(0);
        let share = if labelled == 0 {
            f64::NAN
        } else {
            top as f64 / labelled as f64
        };
        [self.categories.len() as f64, share]
    }
}

/// Collapses transaction rows into customer feature vectors
#[derive(Debug, Clone, Copy, Default)]
pub struct Aggregator;

impl Aggregator {
    /// Group records by customer and compute the fixed statistic set
    ///
    /// Malformed records are reported in the outcome instead of aborting;
    /// the call only fails when nothing usable is left.
    pub fn aggregate(&self, records: &[TransactionRecord]) -> crate::Result<AggregationOutcome> {
        let mut groups: BTreeMap<&str, CustomerAccumulator> = BTreeMap::new();
        let mut rejected = Vec::new();

        for (row, record) in records.iter().enumerate() {
            if let Some(reason) = record.defect() {
                rejected.push(MalformedRecord { row, reason });
                continue;
            }
            groups.entry(record.customer_id.as_str()).or_default().push(record);
        }

        if groups.is_empty() {
            return Err(Error::MalformedRecords { rejected });
        }
        if !rejected.is_empty() {
            log::warn!("skipped {} malformed records during aggregation", rejected.len());
        }

        let mut data = Vec::with_capacity(groups.len() * FEATURE_COLUMNS.len());
        for group in groups.values() {
            data.extend(summarize(&group.amounts));
            data.push(group.amounts.len() as f64);
            data.extend(summarize(&group.values));
            data.extend(group.calendar());
            data.extend(group.category_mix());
        }

        let customer_ids: Vec<String> = groups.keys().map(|id| (*id).to_string()).collect();
        let features = Array2::from_shape_vec((customer_ids.len(), FEATURE_COLUMNS.len()), data)
            .map_err(|err| Error::InvalidConfig(err.to_string()))?;

        log::info!(
            "aggregated {} transactions into {} customer feature vectors",
            records.len() - rejected.len(),
            customer_ids.len()
        );

        Ok(AggregationOutcome {
            table: FeatureTable {
                customer_ids,
                columns: FEATURE_COLUMNS.iter().map(|name| name.to_string()).collect(),
                features,
            },
            rejected,
        })
    }
}

/// sum, mean, sample std, max, min
fn summarize(values: &[f64]) -> [f64; 5] {
    let n = values.len() as f64;
    let sum: f64 = values.iter().sum();
    let mean = sum / n;
    let std = if values.len() < 2 {
        f64::NAN
    } else {
        (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
    };
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    [sum, mean, std, max, min]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    fn record(customer: &str, amount: f64, day: u32, hour: u32) -> TransactionRecord {
        TransactionRecord::new(
            customer,
            format!("{customer}-{day}-{hour}"),
            amount,
            amount.abs(),
            Utc.with_ymd_and_hms(2023, 1 + day % 12, 1 + day % 28, hour, 0, 0).unwrap(),
        )
    }

    fn value(table: &FeatureTable, customer: &str, column: &str) -> f64 {
        table.customer(customer).unwrap()[table.column_index(column).unwrap()]
    }

    #[test]
    fn test_aggregate_statistics() {
        let records = vec![
            record("C1", 100.0, 0, 10),
            record("C1", 200.0, 0, 10),
            record("C1", -60.0, 1, 12),
            record("C2", 50.0, 3, 8),
        ];

        let outcome = Aggregator.aggregate(&records).unwrap();
        let table = &outcome.table;

        assert_eq!(table.customer_ids, vec!["C1", "C2"]);
        assert_eq!(table.features.shape(), &[2, FEATURE_COLUMNS.len()]);
        assert_eq!(value(table, "C1", "amount_sum"), 240.0);
        assert_eq!(value(table, "C1", "amount_mean"), 80.0);
        assert!((value(table, "C1", "amount_std") - 131.148_770_4).abs() < 1e-6);
        assert_eq!(value(table, "C1", "amount_max"), 200.0);
        assert_eq!(value(table, "C1", "amount_min"), -60.0);
        assert_eq!(value(table, "C1", "amount_count"), 3.0);
        assert_eq!(value(table, "C1", "value_sum"), 360.0);
        assert_eq!(value(table, "C1", "hour_nunique"), 2.0);
        assert_eq!(value(table, "C1", "day_nunique"), 2.0);
        assert_eq!(value(table, "C1", "month_nunique"), 2.0);
        assert!(outcome.rejected.is_empty());
    }

    #[test]
    fn test_calendar_and_category_features() {
        // 2023-01-07 is a Saturday, 2023-01-09 a Monday
        let at = |y, m, d| Utc.with_ymd_and_hms(y, m, d, 9, 0, 0).unwrap();
        let records = vec![
            TransactionRecord::new("C1", "t1", 10.0, 10.0, at(2023, 1, 7)).with_category("airtime"),
            TransactionRecord::new("C1", "t2", 10.0, 10.0, at(2023, 1, 9)).with_category("airtime"),
            TransactionRecord::new("C1", "t3", 10.0, 10.0, at(2023, 1, 14)).with_category("utility_bill"),
            TransactionRecord::new("C1", "t4", 10.0, 10.0, at(2024, 1, 9)).with_category("airtime"),
            TransactionRecord::new("C2", "t5", 10.0, 10.0, at(2023, 1, 9)),
        ];
        let table = Aggregator.aggregate(&records).unwrap().table;

        assert_eq!(value(&table, "C1", "weekend_share"), 0.5);
        // Saturday and Tuesday 2024-01-09 besides Monday 2023-01-09
        assert_eq!(value(&table, "C1", "weekday_nunique"), 3.0);
        assert_eq!(value(&table, "C1", "year_nunique"), 2.0);
        assert_eq!(value(&table, "C1", "category_nunique"), 2.0);
        assert_eq!(value(&table, "C1", "category_top_share"), 0.75);

        assert_eq!(value(&table, "C2", "weekend_share"), 0.0);
        assert_eq!(value(&table, "C2", "category_nunique"), 0.0);
        assert!(value(&table, "C2", "category_top_share").is_nan());
    }

    #[test]
    fn test_single_transaction_std_is_nan() {
        let outcome = Aggregator.aggregate(&[record("C9", 10.0, 2, 3)]).unwrap();
        assert!(value(&outcome.table, "C9", "amount_std").is_nan());
        assert!(value(&outcome.table, "C9", "value_std").is_nan());
        assert_eq!(value(&outcome.table, "C9", "amount_count"), 1.0);
    }

    #[test]
    fn test_duplicate_transactions_are_counted() {
        let records = vec![
            record("C1", 100.0, 0, 0),
            record("C1", 100.0, 0, 0),
            record("C1", 200.0, 1, 0),
        ];
        let outcome = Aggregator.aggregate(&records).unwrap();
        assert_eq!(outcome.table.len(), 1);
        assert_eq!(value(&outcome.table, "C1", "amount_count"), 3.0);
    }

    #[test]
    fn test_malformed_records_are_collected() {
        let mut bad_id = record("C1", 1.0, 0, 0);
        bad_id.customer_id = String::new();
        let mut bad_amount = record("C2", 1.0, 0, 0);
        bad_amount.amount = f64::NAN;
        let records = vec![bad_id, record("C3", 5.0, 0, 0), bad_amount];

        let outcome = Aggregator.aggregate(&records).unwrap();
        assert_eq!(outcome.table.customer_ids, vec!["C3"]);
        let rows: Vec<usize> = outcome.rejected.iter().map(|bad| bad.row).collect();
        assert_eq!(rows, vec![0, 2]);
    }

    #[test]
    fn test_all_malformed_is_an_error() {
        let mut bad = record("C1", 1.0, 0, 0);
        bad.value = f64::INFINITY;
        match Aggregator.aggregate(&[bad]) {
            Err(Error::MalformedRecords { rejected }) => assert_eq!(rejected.len(), 1),
            other => panic!("expected MalformedRecords, got {other:?}"),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_count_positive_and_mean_between_extrema(
            rows in prop::collection::vec((0u8..6, -1.0e4f64..1.0e4, 0u32..365, 0u32..24), 1..120)
        ) {
            let records: Vec<TransactionRecord> = rows
                .iter()
                .map(|&(customer, amount, day, hour)| record(&format!("C{customer}"), amount, day, hour))
                .collect();
            let table = Aggregator.aggregate(&records).unwrap().table;

            let count = table.column_index("amount_count").unwrap();
            let total: f64 = table.features.column(count).sum();
            prop_assert_eq!(total as usize, records.len());

            let weekend = table.column_index("weekend_share").unwrap();
            for row in table.features.outer_iter() {
                prop_assert!(row[count] >= 1.0);
                prop_assert!((0.0..=1.0).contains(&row[weekend]));
                for field in ["amount", "value"] {
                    let mean = row[table.column_index(&format!("{field}_mean")).unwrap()];
                    let max = row[table.column_index(&format!("{field}_max")).unwrap()];
                    let min = row[table.column_index(&format!("{field}_min")).unwrap()];
                    prop_assert!(min <= mean + 1e-9 && mean <= max + 1e-9);
                }
            }
        }
    }
}
