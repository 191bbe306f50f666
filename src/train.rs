//! Baseline training: split once, fit every variant, evaluate, register

use crate::classifier::{ClassifierKind, FittedClassifier, Hyperparams, ProbabilisticClassifier, Variant};
use crate::dataset::LabeledDataset;
use crate::error::Error;
use crate::metrics::ClassificationMetrics;
use crate::preprocess::{ImputeStrategy, Preprocessor};
use crate::registry::{start_run, Experiment, ExperimentRegistry, ModelArtifact};
use crate::split::{stratified_split, Split};
use chrono::Utc;
use ndarray::{Array1, Array2};

#[derive(Debug, Clone, PartialEq)]
pub struct TrainConfig {
    pub experiment: String,
    pub test_fraction: f64,
    pub seed: u64,
    pub impute: ImputeStrategy,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            experiment: "credit_risk_proxy".to_string(),
            test_fraction: 0.2,
            seed: 42,
            impute: ImputeStrategy::Median,
        }
    }
}

/// Held-out partition with the preprocessor fitted on the training rows only
#[derive(Debug, Clone)]
pub struct PreparedSplit {
    pub split: Split,
    pub columns: Vec<String>,
    pub preprocessor: Preprocessor,
    pub x_train: Array2<f64>,
    pub y_train: Array1<usize>,
    pub x_test: Array2<f64>,
    pub y_test: Array1<usize>,
}

impl PreparedSplit {
    pub fn prepare(dataset: &LabeledDataset, test_fraction: f64, seed: u64) -> crate::Result<Self> {
        Self::prepare_with(dataset, test_fraction, seed, ImputeStrategy::Median)
    }

    pub fn prepare_with(
        dataset: &LabeledDataset,
        test_fraction: f64,
        seed: u64,
        impute: ImputeStrategy,
    ) -> crate::Result<Self> {
        let labels = dataset.labels.to_vec();
        let split = stratified_split(&labels, test_fraction, seed)?;

        let (raw_train, y_train) = dataset.select(&split.train);
        let (raw_test, y_test) = dataset.select(&split.test);
        let preprocessor = Preprocessor::fit_with(&dataset.columns, &raw_train, impute)?;
        let x_train = preprocessor.transform(&dataset.columns, &raw_train)?;
        let x_test = preprocessor.transform(&dataset.columns, &raw_test)?;

        log::info!(
            "split {} customers into {} train / {} test",
            dataset.len(),
            split.train.len(),
            split.test.len()
        );

        Ok(Self {
            split,
            columns: dataset.columns.clone(),
            preprocessor,
            x_train,
            y_train,
            x_test,
            y_test,
        })
    }

    /// Metrics of a fitted classifier on the held-out rows
    pub fn evaluate(&self, classifier: &FittedClassifier) -> ClassificationMetrics {
        let scores = classifier.predict_proba(&self.x_test);
        let predicted = scores.mapv(|p| usize::from(p >= 0.5));
        let metrics = ClassificationMetrics::evaluate(&self.y_test, &predicted, &scores);
        if metrics.roc_auc.is_none() {
            log::warn!("test partition holds a single class, roc_auc omitted");
        }
        metrics
    }

    pub(crate) fn artifact(
        &self,
        variant: &Variant,
        classifier: FittedClassifier,
        metrics: &ClassificationMetrics,
    ) -> ModelArtifact {
        ModelArtifact {
            variant_name: variant.name.clone(),
            kind: variant.kind,
            hyperparameters: variant.params.clone(),
            metrics: metrics.to_map(),
            preprocessor: self.preprocessor.clone(),
            classifier,
            trained_at: Utc::now(),
            registry_version: None,
            run_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VariantOutcome {
    pub variant: String,
    pub kind: ClassifierKind,
    pub params: Hyperparams,
    pub metrics: ClassificationMetrics,
    /// Registered version, absent when logging failed
    pub version: Option<u32>,
    pub registry_error: Option<String>,
}

#[derive(Debug)]
pub struct TrainingReport {
    pub prepared: PreparedSplit,
    pub outcomes: Vec<VariantOutcome>,
    /// Variants that could not be fitted
    pub failures: Vec<Error>,
}

impl TrainingReport {
    pub fn outcome(&self, variant: &str) -> Option<&VariantOutcome> {
        self.outcomes.iter().find(|o| o.variant == variant)
    }
}

/// One run per registered model: params, extra params, metrics, artifact
pub(crate) fn record_run(
    registry: &dyn ExperimentRegistry,
    experiment: &Experiment,
    registered_name: &str,
    artifact: &ModelArtifact,
    extra_params: &[(&str, f64)],
) -> crate::Result<u32> {
    let run = start_run(registry, experiment, registered_name)?;
    run.log_params(&artifact.hyperparameters)?;
    for (key, value) in extra_params {
        run.log_param(key, value)?;
    }
    run.log_metrics(&artifact.metrics)?;
    let version = run.log_model(artifact, registered_name)?;
    run.finish()?;
    Ok(version)
}

pub struct ModelTrainer<'a> {
    registry: &'a dyn ExperimentRegistry,
    config: TrainConfig,
}

impl<'a> ModelTrainer<'a> {
    pub fn new(registry: &'a dyn ExperimentRegistry, config: TrainConfig) -> Self {
        Self { registry, config }
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// Fit and register each variant on one shared stratified split
    pub fn train(&self, dataset: &LabeledDataset, variants: &[Variant]) -> crate::Result<TrainingReport> {
        if variants.is_empty() {
            return Err(Error::InvalidConfig("no classifier variants to train".to_string()));
        }
        let config = &self.config;
        let prepared = PreparedSplit::prepare_with(dataset, config.test_fraction, config.seed, config.impute)?;
        let experiment = self
            .registry
            .set_experiment(&self.config.experiment)
            .map_err(|err| err.to_string());

        let mut outcomes = Vec::with_capacity(variants.len());
        let mut failures = Vec::new();
        for variant in variants {
            let classifier = match variant.fit(&prepared.x_train, &prepared.y_train, self.config.seed) {
                Ok(classifier) => classifier,
                Err(err) => {
                    log::warn!("{err}");
                    failures.push(err);
                    continue;
                }
            };
            let metrics = prepared.evaluate(&classifier);
            log::info!("{}: f1 {:.4}, accuracy {:.4}", variant.name, metrics.f1, metrics.accuracy);

            let artifact = prepared.artifact(variant, classifier, &metrics);
            let logged = experiment
                .clone()
                .and_then(|exp| record_run(self.registry, &exp, &variant.name, &artifact, &[]).map_err(|e| e.to_string()));
            let (version, registry_error) = match logged {
                Ok(version) => (Some(version), None),
                Err(reason) => {
                    log::warn!("could not register {}: {}", variant.name, reason);
                    (None, Some(reason))
                }
            };

            outcomes.push(VariantOutcome {
                variant: variant.name.clone(),
                kind: variant.kind,
                params: variant.params.clone(),
                metrics,
                version,
                registry_error,
            });
        }

        Ok(TrainingReport {
            prepared,
            outcomes,
            failures,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dataset::separable_fixture;
    use crate::registry::{MemoryRegistry, RunRecord, RunStatus};
    use std::collections::BTreeMap;
    use ulid::Ulid;

    /// Accepts experiments but rejects every run write
    pub(crate) struct FailingRegistry;

    impl ExperimentRegistry for FailingRegistry {
        fn set_experiment(&self, name: &str) -> crate::Result<Experiment> {
            Ok(Experiment { name: name.to_string() })
        }
        fn create_run(&self, _: &Experiment, _: &str) -> crate::Result<Ulid> {
            Err(Error::RegistryWrite("store offline".into()))
        }
        fn write_params(&self, _: Ulid, _: &BTreeMap<String, String>) -> crate::Result<()> {
            Err(Error::RegistryWrite("store offline".into()))
        }
        fn write_metrics(&self, _: Ulid, _: &BTreeMap<String, f64>) -> crate::Result<()> {
            Err(Error::RegistryWrite("store offline".into()))
        }
        fn register_model(&self, _: Ulid, _: &str, _: &ModelArtifact) -> crate::Result<u32> {
            Err(Error::RegistryWrite("store offline".into()))
        }
        fn end_run(&self, _: Ulid, _: RunStatus) -> crate::Result<()> {
            Err(Error::RegistryWrite("store offline".into()))
        }
        fn run(&self, _: Ulid) -> crate::Result<RunRecord> {
            Err(Error::RegistryWrite("store offline".into()))
        }
        fn load_model(&self, name: &str, version: u32) -> crate::Result<ModelArtifact> {
            Err(Error::ModelNotFound { name: name.into(), version })
        }
        fn latest_version(&self, _: &str) -> crate::Result<Option<u32>> {
            Ok(None)
        }
    }

    fn small_forest() -> Variant {
        Variant::random_forest().with_params(&BTreeMap::from([("n_estimators".to_string(), 10.0)]))
    }

    #[test]
    fn test_trains_and_registers_each_variant() {
        let registry = MemoryRegistry::new();
        let trainer = ModelTrainer::new(&registry, TrainConfig::default());
        let dataset = separable_fixture(25);

        let report = trainer
            .train(&dataset, &[Variant::logistic_regression(), small_forest()])
            .unwrap();
        assert!(report.failures.is_empty());
        assert_eq!(report.outcomes.len(), 2);
        for outcome in &report.outcomes {
            assert_eq!(outcome.version, Some(1));
            assert!(outcome.registry_error.is_none());
            assert!(outcome.metrics.f1 > 0.9, "{}: {:?}", outcome.variant, outcome.metrics);
            assert!(outcome.metrics.roc_auc.is_some());
        }

        let runs = registry.runs();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|run| run.status == RunStatus::Finished));
        assert!(runs.iter().all(|run| run.metrics.contains_key("f1")));

        // identical inputs still produce new versions
        let again = trainer.train(&dataset, &[Variant::logistic_regression()]).unwrap();
        assert_eq!(again.outcome("LogisticRegression").unwrap().version, Some(2));
    }

    #[test]
    fn test_split_is_stratified_and_preprocessor_sees_train_only() {
        let dataset = separable_fixture(25);
        let prepared = PreparedSplit::prepare(&dataset, 0.2, 42).unwrap();

        assert_eq!(prepared.y_test.len(), 10);
        assert_eq!(prepared.y_test.iter().filter(|&&y| y == 1).count(), 5);
        assert!(prepared.x_train.iter().all(|v| v.is_finite()));
        assert!(prepared.x_test.iter().all(|v| v.is_finite()));

        let (raw_train, _) = dataset.select(&prepared.split.train);
        let refit = Preprocessor::fit(&dataset.columns, &raw_train).unwrap();
        assert_eq!(refit, prepared.preprocessor);
    }

    #[test]
    fn test_configured_imputation_reaches_the_artifact() {
        let registry = MemoryRegistry::new();
        let config = TrainConfig {
            impute: ImputeStrategy::Zero,
            ..TrainConfig::default()
        };
        let report = ModelTrainer::new(&registry, config)
            .train(&separable_fixture(20), &[Variant::logistic_regression()])
            .unwrap();
        assert_eq!(report.prepared.preprocessor.strategy(), ImputeStrategy::Zero);

        let artifact = registry.load_model("LogisticRegression", 1).unwrap();
        assert_eq!(artifact.preprocessor.strategy(), ImputeStrategy::Zero);
        assert!(artifact.preprocessor.fill_values().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_registry_failure_keeps_metrics() {
        let trainer = ModelTrainer::new(&FailingRegistry, TrainConfig::default());
        let report = trainer
            .train(&separable_fixture(20), &[Variant::logistic_regression()])
            .unwrap();

        let outcome = &report.outcomes[0];
        assert_eq!(outcome.version, None);
        assert!(outcome.registry_error.as_deref().unwrap().contains("store offline"));
        assert!(outcome.metrics.f1 > 0.9);
    }

    #[test]
    fn test_failed_variant_does_not_stop_others() {
        let registry = MemoryRegistry::new();
        let trainer = ModelTrainer::new(&registry, TrainConfig::default());
        let broken = Variant::logistic_regression().with_params(&BTreeMap::from([("c".to_string(), -1.0)]));

        let report = trainer
            .train(&separable_fixture(20), &[broken, small_forest()])
            .unwrap();
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(report.failures[0], Error::FitFailure { .. }));
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].variant, "RandomForest");
    }
}
