//! Labeled training table: engineered features joined with proxy labels

use crate::features::FeatureTable;
use crate::model::ClusterAssignment;
use ndarray::{Array1, Array2, Axis};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct LabeledDataset {
    pub customer_ids: Vec<String>,
    pub columns: Vec<String>,
    pub features: Array2<f64>,
    /// 1 = high risk
    pub labels: Array1<usize>,
}

impl LabeledDataset {
    /// Inner join on customer id; customers without an assignment are dropped
    pub fn join(table: &FeatureTable, assignments: &[ClusterAssignment]) -> Self {
        let by_customer: BTreeMap<&str, bool> = assignments
            .iter()
            .map(|a| (a.customer_id.as_str(), a.is_high_risk))
            .collect();

        let mut rows = Vec::with_capacity(table.len());
        let mut labels = Vec::with_capacity(table.len());
        for (row, customer_id) in table.customer_ids.iter().enumerate() {
            if let Some(&high_risk) = by_customer.get(customer_id.as_str()) {
                rows.push(row);
                labels.push(usize::from(high_risk));
            }
        }

        let dropped = table.len() - rows.len();
        if dropped > 0 {
            log::warn!("{dropped} customers have no cluster assignment and were dropped");
        }

        Self {
            customer_ids: rows.iter().map(|&row| table.customer_ids[row].clone()).collect(),
            columns: table.columns.clone(),
            features: table.features.select(Axis(0), &rows),
            labels: Array1::from(labels),
        }
    }

    pub fn len(&self) -> usize {
        self.customer_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.customer_ids.is_empty()
    }

    pub fn positives(&self) -> usize {
        self.labels.iter().filter(|&&label| label == 1).count()
    }

    /// Feature rows and labels at the given positions
    pub fn select(&self, rows: &[usize]) -> (Array2<f64>, Array1<usize>) {
        (
            self.features.select(Axis(0), rows),
            self.labels.select(Axis(0), rows),
        )
    }
}

/// Two well separated customer groups with a few missing entries
#[cfg(test)]
pub(crate) fn separable_fixture(per_class: usize) -> LabeledDataset {
    let mut customer_ids = Vec::new();
    let mut rows = Vec::new();
    let mut labels = Vec::new();
    for i in 0..per_class {
        let jitter = (i % 7) as f64 * 0.15;
        customer_ids.push(format!("high{i}"));
        rows.extend_from_slice(&[1.0 + jitter, 40.0 - jitter, if i % 5 == 0 { f64::NAN } else { jitter }]);
        labels.push(1);
        customer_ids.push(format!("low{i}"));
        rows.extend_from_slice(&[9.0 - jitter, 10.0 + jitter, 1.0 - jitter]);
        labels.push(0);
    }
    LabeledDataset {
        customer_ids,
        columns: vec!["frequency".into(), "recency".into(), "spread".into()],
        features: Array2::from_shape_vec((2 * per_class, 3), rows).unwrap(),
        labels: Array1::from(labels),
    }
}
