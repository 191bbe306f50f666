//! Binary classification scores computed on a held-out partition
//!
//! Scores come from linfa's confusion matrix and ROC curve. Both work in
//! `f32`, so values carry single precision.

use linfa::prelude::{BinaryClassification, Pr, ToConfusionMatrix};
use ndarray::{Array1, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassificationMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// Undefined when the evaluated labels hold a single class
    pub roc_auc: Option<f64>,
}

impl ClassificationMetrics {
    /// Score predicted classes and positive-class probabilities against `truth`
    pub fn evaluate(truth: &Array1<usize>, predicted: &Array1<usize>, scores: &Array1<f64>) -> Self {
        let truth = truth.mapv(|t| t == 1);
        let predicted = predicted.mapv(|p| p == 1);

        let precision = subset_agreement(&predicted, &truth);
        let recall = subset_agreement(&truth, &predicted);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };

        Self {
            accuracy: agreement(&truth, &predicted),
            precision,
            recall,
            f1,
            roc_auc: roc_auc_of(&truth, scores),
        }
    }

    /// Named scores as logged to the registry
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        let mut map = BTreeMap::from([
            ("accuracy".to_string(), self.accuracy),
            ("precision".to_string(), self.precision),
            ("recall".to_string(), self.recall),
            ("f1".to_string(), self.f1),
        ]);
        if let Some(auc) = self.roc_auc {
            map.insert("roc_auc".to_string(), auc);
        }
        map
    }
}

/// Share of rows on which `left` and `right` agree, from the linfa confusion matrix
///
/// linfa indexes the matrix by the labels of the receiver only, so the side
/// holding more distinct labels is used as the receiver.
fn agreement(left: &Array1<bool>, right: &Array1<bool>) -> f64 {
    if left.is_empty() {
        return 0.0;
    }
    let distinct = |labels: &Array1<bool>| labels.iter().any(|&l| l) as usize + labels.iter().any(|&l| !l) as usize;
    let (receiver, other) = if distinct(left) >= distinct(right) {
        (left, right)
    } else {
        (right, left)
    };
    match receiver.confusion_matrix(other) {
        Ok(matrix) => {
            let accuracy = f64::from(matrix.accuracy());
            if accuracy.is_finite() {
                accuracy
            } else {
                0.0
            }
        }
        Err(_) => 0.0,
    }
}

/// Agreement of `other` with `condition` on the rows where `condition` is positive
///
/// Precision conditions on the predicted positives, recall on the true
/// positives. Zero when there are no such rows.
fn subset_agreement(condition: &Array1<bool>, other: &Array1<bool>) -> f64 {
    let rows: Vec<usize> = (0..condition.len()).filter(|&i| condition[i]).collect();
    agreement(&condition.select(Axis(0), &rows), &other.select(Axis(0), &rows))
}

/// F1 of the positive class
pub fn f1_score(truth: &Array1<usize>, predicted: &Array1<usize>) -> f64 {
    ClassificationMetrics::evaluate(truth, predicted, &Array1::zeros(truth.len())).f1
}

/// Area under the linfa ROC curve; `None` unless both classes are present
pub fn roc_auc(truth: &Array1<usize>, scores: &Array1<f64>) -> Option<f64> {
    roc_auc_of(&truth.mapv(|t| t == 1), scores)
}

fn roc_auc_of(truth: &Array1<bool>, scores: &Array1<f64>) -> Option<f64> {
    let positives = truth.iter().filter(|&&t| t).count();
    if positives == 0 || positives == truth.len() || scores.len() != truth.len() {
        return None;
    }

    let probabilities = scores
        .iter()
        .map(|&score| Pr::try_from(score as f32).ok())
        .collect::<Option<Vec<Pr>>>()?;
    let truth: Vec<bool> = truth.to_vec();
    let roc = Array1::from(probabilities).roc(truth.as_slice()).ok()?;
    Some(f64::from(roc.area_under_curve()))
}
