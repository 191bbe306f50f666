//! Classifier variants trained against the proxy label
//!
//! Two families are provided: an L2-regularised linfa logistic regression
//! (`c` is the inverse of its `alpha` penalty), and a random forest of linfa
//! decision trees grown on bootstrap samples and random feature subsets. Both expose positive-class
//! probabilities so ROC AUC can be computed.

use crate::error::Error;
use linfa::prelude::*;
use linfa_logistic::{FittedLogisticRegression, LogisticRegression};
use linfa_trees::{DecisionTree, SplitQuality};
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Hyperparameter name -> value
pub type Hyperparams = BTreeMap<String, f64>;

/// Probability-producing binary classifier
pub trait ProbabilisticClassifier {
    /// Probability of the positive class for each row
    fn predict_proba(&self, records: &Array2<f64>) -> Array1<f64>;

    /// Hard class at the 0.5 threshold
    fn classify(&self, records: &Array2<f64>) -> Array1<usize> {
        self.predict_proba(records).mapv(|p| usize::from(p >= 0.5))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ClassifierKind {
    LogisticRegression,
    RandomForest,
}

impl fmt::Display for ClassifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassifierKind::LogisticRegression => write!(f, "LogisticRegression"),
            ClassifierKind::RandomForest => write!(f, "RandomForest"),
        }
    }
}

/// A named classifier configuration tracked through training and tuning
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub name: String,
    pub kind: ClassifierKind,
    pub params: Hyperparams,
}

impl Variant {
    pub fn new(name: impl Into<String>, kind: ClassifierKind, params: Hyperparams) -> Self {
        Self {
            name: name.into(),
            kind,
            params,
        }
    }

    pub fn logistic_regression() -> Self {
        Self::new(
            "LogisticRegression",
            ClassifierKind::LogisticRegression,
            BTreeMap::from([
                ("c".to_string(), 1.0),
                ("max_iter".to_string(), 500.0),
            ]),
        )
    }

    pub fn random_forest() -> Self {
        Self::new(
            "RandomForest",
            ClassifierKind::RandomForest,
            BTreeMap::from([
                ("n_estimators".to_string(), 100.0),
                ("max_depth".to_string(), 0.0),
                ("min_samples_split".to_string(), 2.0),
            ]),
        )
    }

    /// The default baseline pair
    pub fn defaults() -> Vec<Self> {
        vec![Self::logistic_regression(), Self::random_forest()]
    }

    /// Same variant with some hyperparameters replaced
    pub fn with_params(&self, overrides: &Hyperparams) -> Self {
        let mut params = self.params.clone();
        params.extend(overrides.iter().map(|(k, v)| (k.clone(), *v)));
        Self {
            name: self.name.clone(),
            kind: self.kind,
            params,
        }
    }

    fn param(&self, name: &str) -> crate::Result<f64> {
        self.params
            .get(name)
            .copied()
            .filter(|value| value.is_finite())
            .ok_or_else(|| Error::fit_failure(&self.name, format!("missing or invalid hyperparameter {name}")))
    }

    /// Fit on `records` / binary `targets` (0 or 1)
    pub fn fit(&self, records: &Array2<f64>, targets: &Array1<usize>, seed: u64) -> crate::Result<FittedClassifier> {
        if records.nrows() != targets.len() || records.nrows() == 0 {
            return Err(Error::fit_failure(
                &self.name,
                format!("{} rows but {} targets", records.nrows(), targets.len()),
            ));
        }
        let positives = targets.iter().filter(|&&t| t == 1).count();
        if positives == 0 || positives == targets.len() {
            return Err(Error::fit_failure(&self.name, "training targets contain a single class"));
        }

        match self.kind {
            ClassifierKind::LogisticRegression => {
                let settings = LogisticSettings {
                    c: self.param("c")?,
                    max_iter: self.param("max_iter")? as u64,
                };
                LogisticModel::fit(&settings, records, targets)
                    .map(FittedClassifier::Logistic)
                    .map_err(|reason| Error::fit_failure(&self.name, reason))
            }
            ClassifierKind::RandomForest => {
                let settings = ForestSettings {
                    n_estimators: self.param("n_estimators")? as usize,
                    max_depth: self.param("max_depth")? as usize,
                    min_samples_split: self.param("min_samples_split")? as usize,
                };
                ForestModel::fit(&settings, records, targets, seed)
                    .map(FittedClassifier::Forest)
                    .map_err(|reason| Error::fit_failure(&self.name, reason))
            }
        }
    }
}

/// Fitted state of any variant
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FittedClassifier {
    Logistic(LogisticModel),
    Forest(ForestModel),
}

impl ProbabilisticClassifier for FittedClassifier {
    fn predict_proba(&self, records: &Array2<f64>) -> Array1<f64> {
        match self {
            FittedClassifier::Logistic(model) => model.predict_proba(records),
            FittedClassifier::Forest(model) => model.predict_proba(records),
        }
    }
}

struct LogisticSettings {
    c: f64,
    max_iter: u64,
}

/// linfa logistic regression whose positive class is remapped to label 1
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogisticModel {
    pub fitted: FittedLogisticRegression<f64, usize>,
}

impl LogisticModel {
    fn fit(settings: &LogisticSettings, records: &Array2<f64>, targets: &Array1<usize>) -> Result<Self, String> {
        if settings.c <= 0.0 || settings.max_iter == 0 {
            return Err("c and max_iter must be positive".to_string());
        }

        let dataset = Dataset::new(records.clone(), targets.clone());
        let fitted = LogisticRegression::default()
            .alpha(1.0 / settings.c)
            .max_iterations(settings.max_iter)
            .fit(&dataset)
            .map_err(|err| err.to_string())?;

        if !fitted.intercept().is_finite() || fitted.params().iter().any(|w| !w.is_finite()) {
            return Err("logistic regression did not converge to finite coefficients".to_string());
        }
        Ok(Self { fitted })
    }
}

impl ProbabilisticClassifier for LogisticModel {
    fn predict_proba(&self, records: &Array2<f64>) -> Array1<f64> {
        let probabilities = self.fitted.predict_probabilities(records);
        if self.fitted.labels().pos.class == 1 {
            probabilities
        } else {
            probabilities.mapv(|p| 1.0 - p)
        }
    }
}

struct ForestSettings {
    n_estimators: usize,
    /// 0 grows trees without a depth limit
    max_depth: usize,
    min_samples_split: usize,
}

/// One bagged tree and the feature columns it was grown on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestMember {
    pub features: Vec<usize>,
    pub tree: DecisionTree<f64, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestModel {
    pub members: Vec<ForestMember>,
}

impl ForestModel {
    fn fit(
        settings: &ForestSettings,
        records: &Array2<f64>,
        targets: &Array1<usize>,
        seed: u64,
    ) -> Result<Self, String> {
        if settings.n_estimators == 0 || settings.min_samples_split < 2 {
            return Err("n_estimators must be positive and min_samples_split at least 2".to_string());
        }

        let (n_rows, n_features) = records.dim();
        if n_features == 0 {
            return Err("no feature columns".to_string());
        }
        let subset = ((n_features as f64).sqrt().round() as usize).clamp(1, n_features);
        let max_depth = (settings.max_depth > 0).then_some(settings.max_depth);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut members = Vec::with_capacity(settings.n_estimators);

        for _ in 0..settings.n_estimators {
            let rows: Vec<usize> = (0..n_rows).map(|_| rng.gen_range(0..n_rows)).collect();
            let mut features = rand::seq::index::sample(&mut rng, n_features, subset).into_vec();
            features.sort_unstable();

            let sample = records.select(Axis(0), &rows).select(Axis(1), &features);
            let dataset = Dataset::new(sample, targets.select(Axis(0), &rows));
            let tree = DecisionTree::params()
                .split_quality(SplitQuality::Gini)
                .max_depth(max_depth)
                .min_weight_split(settings.min_samples_split as f32)
                .min_weight_leaf(1.0)
                .fit(&dataset)
                .map_err(|err| err.to_string())?;

            members.push(ForestMember { features, tree });
        }

        Ok(Self { members })
    }
}

impl ProbabilisticClassifier for ForestModel {
    /// Share of trees voting for the positive class
    fn predict_proba(&self, records: &Array2<f64>) -> Array1<f64> {
        let mut votes = Array1::<f64>::zeros(records.nrows());
        for member in &self.members {
            let view = records.select(Axis(1), &member.features);
            let predicted: Array1<usize> = member.tree.predict(&view);
            votes.zip_mut_with(&predicted, |vote, &class| *vote += class as f64);
        }
        votes / self.members.len().max(1) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    /// Two blobs separated along the first feature
    fn separable() -> (Array2<f64>, Array1<usize>) {
        let mut rows = Vec::new();
        let mut targets = Vec::new();
        for i in 0..20 {
            let jitter = (i % 5) as f64 * 0.1;
            rows.extend_from_slice(&[2.0 + jitter, 0.5 - jitter, jitter]);
            targets.push(1);
            rows.extend_from_slice(&[-2.0 - jitter, 0.4 + jitter, -jitter]);
            targets.push(0);
        }
        (Array2::from_shape_vec((40, 3), rows).unwrap(), Array1::from(targets))
    }

    #[test]
    fn test_logistic_regression_separates_blobs() {
        let (x, y) = separable();
        let model = Variant::logistic_regression().fit(&x, &y, 0).unwrap();

        assert_eq!(model.classify(&x), y);
        let proba = model.predict_proba(&array![[3.0, 0.0, 0.0], [-3.0, 0.0, 0.0]]);
        assert!(proba[0] > 0.9 && proba[1] < 0.1);
    }

    #[test]
    fn test_random_forest_separates_blobs() {
        let (x, y) = separable();
        let variant = Variant::random_forest().with_params(&BTreeMap::from([("n_estimators".to_string(), 15.0)]));
        let model = variant.fit(&x, &y, 42).unwrap();

        let proba = model.predict_proba(&x);
        assert!(proba.iter().all(|p| (0.0..=1.0).contains(p)));
        let accuracy = model
            .classify(&x)
            .iter()
            .zip(y.iter())
            .filter(|(a, b)| a == b)
            .count() as f64
            / y.len() as f64;
        assert!(accuracy >= 0.9);
    }

    #[test]
    fn test_forest_is_seeded() {
        let (x, y) = separable();
        let variant = Variant::random_forest().with_params(&BTreeMap::from([("n_estimators".to_string(), 5.0)]));
        let a = variant.fit(&x, &y, 9).unwrap().predict_proba(&x);
        let b = variant.fit(&x, &y, 9).unwrap().predict_proba(&x);
        assert_eq!(a, b);
    }

    #[test]
    fn test_single_class_fails() {
        let (x, _) = separable();
        let y = Array1::zeros(x.nrows());
        for variant in Variant::defaults() {
            assert!(matches!(variant.fit(&x, &y, 0), Err(Error::FitFailure { .. })));
        }
    }

    #[test]
    fn test_invalid_hyperparameters_fail() {
        let (x, y) = separable();
        let bad_c = Variant::logistic_regression().with_params(&BTreeMap::from([("c".to_string(), 0.0)]));
        assert!(matches!(bad_c.fit(&x, &y, 0), Err(Error::FitFailure { .. })));
        let bad_iter = Variant::logistic_regression().with_params(&BTreeMap::from([("max_iter".to_string(), 0.0)]));
        assert!(matches!(bad_iter.fit(&x, &y, 0), Err(Error::FitFailure { .. })));

        let bad_split = Variant::random_forest().with_params(&BTreeMap::from([("min_samples_split".to_string(), 1.0)]));
        assert!(matches!(bad_split.fit(&x, &y, 0), Err(Error::FitFailure { .. })));
    }

    #[test]
    fn test_logistic_positive_class_is_label_one() {
        // minority positives, so the label frequencies do not decide orientation
        let (x, y) = separable();
        let keep: Vec<usize> = (0..x.nrows()).filter(|&i| y[i] == 0 || i % 4 == 0).collect();
        let (x, y) = (x.select(Axis(0), &keep), y.select(Axis(0), &keep));
        let FittedClassifier::Logistic(model) = Variant::logistic_regression().fit(&x, &y, 0).unwrap() else {
            panic!("expected logistic model");
        };

        let proba = model.predict_proba(&array![[2.5, 0.0, 0.0]]);
        assert!(proba[0] > 0.5);
        assert_eq!(model.classify(&x), y);
    }

    #[test]
    fn test_fitted_state_round_trips_through_json() {
        let (x, y) = separable();
        let variant = Variant::random_forest().with_params(&BTreeMap::from([("n_estimators".to_string(), 3.0)]));
        let model = variant.fit(&x, &y, 1).unwrap();

        let json = serde_json::to_string(&model).unwrap();
        let restored: FittedClassifier = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.predict_proba(&x), model.predict_proba(&x));

        let logistic = Variant::logistic_regression().fit(&x, &y, 1).unwrap();
        let json = serde_json::to_string(&logistic).unwrap();
        let restored: FittedClassifier = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.predict_proba(&x), logistic.predict_proba(&x));
    }
}
