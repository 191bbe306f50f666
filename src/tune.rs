//! Exhaustive grid search with stratified k-fold cross-validation
//!
//! Every (combination, fold) pair is an independent unit of work. Units are
//! pulled by a pool of scoped worker threads from an atomic cursor and their
//! scores come back over a channel, so no fit shares mutable state with
//! another. The winner is refitted on the whole training partition and scored
//! on the same held-out rows the baseline variants were scored on.

use crate::classifier::{ClassifierKind, Hyperparams, ProbabilisticClassifier, Variant};
use crate::error::Error;
use crate::metrics::{f1_score, ClassificationMetrics};
use crate::registry::ExperimentRegistry;
use crate::split::stratified_folds;
use crate::train::{record_run, PreparedSplit};
use ndarray::Axis;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

/// Hyperparameter name -> discrete candidate values
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SearchSpace {
    grid: BTreeMap<String, Vec<f64>>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, candidates: impl IntoIterator<Item = f64>) -> Self {
        self.grid.insert(name.to_string(), candidates.into_iter().collect());
        self
    }

    pub fn default_for(kind: ClassifierKind) -> Self {
        match kind {
            ClassifierKind::LogisticRegression => Self::new()
                .with("c", [0.01, 0.1, 1.0, 10.0])
                .with("max_iter", [200.0, 500.0]),
            ClassifierKind::RandomForest => Self::new()
                .with("n_estimators", [25.0, 50.0, 100.0])
                .with("max_depth", [0.0, 5.0, 10.0])
                .with("min_samples_split", [2.0, 5.0]),
        }
    }

    /// Number of combinations
    pub fn len(&self) -> usize {
        self.grid.values().map(Vec::len).product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All combinations, parameter names in sorted order with the last varying fastest
    pub fn combinations(&self) -> Vec<Hyperparams> {
        let mut combinations = vec![Hyperparams::new()];
        for (name, candidates) in &self.grid {
            combinations = combinations
                .into_iter()
                .flat_map(|partial| {
                    candidates.iter().map(move |&value| {
                        let mut next = partial.clone();
                        next.insert(name.clone(), value);
                        next
                    })
                })
                .collect();
        }
        combinations
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TuneConfig {
    /// Kept apart from the baseline experiment so tuned runs are grouped on their own
    pub experiment: String,
    pub folds: usize,
    pub seed: u64,
    /// Defaults to the available parallelism
    pub workers: Option<usize>,
}

impl Default for TuneConfig {
    fn default() -> Self {
        Self {
            experiment: "credit_risk_proxy_tuning".to_string(),
            folds: 3,
            seed: 42,
            workers: None,
        }
    }
}

impl TuneConfig {
    /// Tuning experiment paired with a baseline experiment name
    pub fn experiment_for(baseline: &str) -> String {
        format!("{baseline}_tuning")
    }

    fn worker_count(&self) -> usize {
        self.workers
            .unwrap_or_else(|| thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
            .max(1)
    }
}

/// Cross-validated score of one combination
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateScore {
    pub params: Hyperparams,
    pub fold_f1: Vec<f64>,
    pub failed_folds: usize,
    /// Absent when any fold failed
    pub mean_f1: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct TunedOutcome {
    /// Registered name, `<variant>_Tuned`
    pub variant: String,
    pub kind: ClassifierKind,
    pub best_params: Hyperparams,
    pub cv_f1: f64,
    pub metrics: ClassificationMetrics,
    pub version: Option<u32>,
    pub registry_error: Option<String>,
    pub candidates: Vec<CandidateScore>,
    pub failed_units: usize,
}

pub struct Tuner<'a> {
    registry: &'a dyn ExperimentRegistry,
    config: TuneConfig,
}

impl<'a> Tuner<'a> {
    pub fn new(registry: &'a dyn ExperimentRegistry, config: TuneConfig) -> Self {
        Self { registry, config }
    }

    pub fn config(&self) -> &TuneConfig {
        &self.config
    }

    /// Search `space` around `variant`, refit the best combination and register it
    pub fn tune(&self, prepared: &PreparedSplit, variant: &Variant, space: &SearchSpace) -> crate::Result<TunedOutcome> {
        let combinations = space.combinations();
        if combinations.is_empty() {
            return Err(Error::InvalidConfig(format!("empty search space for {}", variant.name)));
        }

        let train_rows: Vec<usize> = (0..prepared.y_train.len()).collect();
        let labels = prepared.y_train.to_vec();
        let folds = stratified_folds(&train_rows, &labels, self.config.folds, self.config.seed)?;
        let candidates: Vec<Variant> = combinations.iter().map(|c| variant.with_params(c)).collect();
        let n_units = candidates.len() * folds.len();
        let workers = self.config.worker_count();
        log::info!(
            "tuning {}: {} combinations x {} folds on {} workers",
            variant.name,
            candidates.len(),
            folds.len(),
            workers
        );

        let scores = execute(n_units, workers, &variant.name, |unit| {
            let candidate = &candidates[unit / folds.len()];
            let fold = &folds[unit % folds.len()];
            let x_fit = prepared.x_train.select(Axis(0), &fold.train);
            let y_fit = prepared.y_train.select(Axis(0), &fold.train);
            let model = candidate.fit(&x_fit, &y_fit, self.config.seed)?;
            let x_val = prepared.x_train.select(Axis(0), &fold.test);
            let y_val = prepared.y_train.select(Axis(0), &fold.test);
            Ok(f1_score(&y_val, &model.classify(&x_val)))
        });

        let mut failed_units = 0;
        let mut ranked = Vec::with_capacity(combinations.len());
        for (params, chunk) in combinations.into_iter().zip(scores.chunks(folds.len())) {
            let mut fold_f1 = Vec::with_capacity(chunk.len());
            let mut failed_folds = 0;
            for score in chunk {
                match score {
                    Ok(f1) => fold_f1.push(*f1),
                    Err(err) => {
                        log::warn!("{err}");
                        failed_folds += 1;
                    }
                }
            }
            failed_units += failed_folds;
            let mean_f1 = (failed_folds == 0).then(|| fold_f1.iter().sum::<f64>() / fold_f1.len() as f64);
            log::debug!("{} {:?}: mean f1 {:?}", variant.name, params, mean_f1);
            ranked.push(CandidateScore {
                params,
                fold_f1,
                failed_folds,
                mean_f1,
            });
        }

        // strict comparison keeps the earliest combination on ties
        let mut best: Option<(usize, f64)> = None;
        for (index, candidate) in ranked.iter().enumerate() {
            if let Some(mean) = candidate.mean_f1 {
                if best.map_or(true, |(_, top)| mean > top) {
                    best = Some((index, mean));
                }
            }
        }
        let (best_index, cv_f1) = best.ok_or_else(|| {
            Error::fit_failure(
                &variant.name,
                format!("every combination failed ({failed_units} failed units)"),
            )
        })?;

        let winner = variant.with_params(&ranked[best_index].params);
        let classifier = winner.fit(&prepared.x_train, &prepared.y_train, self.config.seed)?;
        let metrics = prepared.evaluate(&classifier);
        let registered_name = format!("{}_Tuned", variant.name);
        log::info!(
            "{registered_name}: cv f1 {cv_f1:.4}, held-out f1 {:.4}, {failed_units} failed units",
            metrics.f1
        );

        let artifact = prepared.artifact(&winner, classifier, &metrics);
        let logged = self
            .registry
            .set_experiment(&self.config.experiment)
            .and_then(|experiment| {
                record_run(
                    self.registry,
                    &experiment,
                    &registered_name,
                    &artifact,
                    &[("cv_f1_mean", cv_f1)],
                )
            });
        let (version, registry_error) = match logged {
            Ok(version) => (Some(version), None),
            Err(err) => {
                log::warn!("could not register {registered_name}: {err}");
                (None, Some(err.to_string()))
            }
        };

        Ok(TunedOutcome {
            variant: registered_name,
            kind: variant.kind,
            best_params: winner.params,
            cv_f1,
            metrics,
            version,
            registry_error,
            candidates: ranked,
            failed_units,
        })
    }
}

/// Run `job` for every unit index on up to `workers` threads, results in unit order
///
/// A panicking unit is reported as a fit failure. When no worker thread can be
/// spawned the units run on the calling thread.
fn execute<F>(n_units: usize, workers: usize, variant: &str, job: F) -> Vec<crate::Result<f64>>
where
    F: Fn(usize) -> crate::Result<f64> + Sync,
{
    let guarded = |unit: usize| {
        panic::catch_unwind(AssertUnwindSafe(|| job(unit))).unwrap_or_else(|payload| {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "worker panicked".to_string());
            Err(Error::fit_failure(variant, format!("unit {unit} panicked: {reason}")))
        })
    };

    let cursor = AtomicUsize::new(0);
    let mut results: Vec<Option<crate::Result<f64>>> = (0..n_units).map(|_| None).collect();

    thread::scope(|scope| {
        let (tx, rx) = mpsc::channel();
        let mut spawned = 0;
        for worker in 0..workers.min(n_units) {
            let tx = tx.clone();
            let (cursor, guarded) = (&cursor, &guarded);
            let handle = thread::Builder::new()
                .name(format!("tuner-{worker}"))
                .spawn_scoped(scope, move || loop {
                    let unit = cursor.fetch_add(1, Ordering::Relaxed);
                    if unit >= n_units || tx.send((unit, guarded(unit))).is_err() {
                        break;
                    }
                });
            match handle {
                Ok(_) => spawned += 1,
                Err(err) => log::warn!("could not spawn tuner worker {worker}: {err}"),
            }
        }
        drop(tx);

        if spawned == 0 {
            loop {
                let unit = cursor.fetch_add(1, Ordering::Relaxed);
                if unit >= n_units {
                    break;
                }
                results[unit] = Some(guarded(unit));
            }
        }
        for (unit, outcome) in rx {
            results[unit] = Some(outcome);
        }
    });

    results
        .into_iter()
        .enumerate()
        .map(|(unit, outcome)| {
            outcome.unwrap_or_else(|| Err(Error::fit_failure(variant, format!("unit {unit} produced no result"))))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::separable_fixture;
    use crate::registry::MemoryRegistry;
    use crate::train::tests::FailingRegistry;
    use crate::train::{ModelTrainer, TrainConfig};

    fn prepared() -> PreparedSplit {
        PreparedSplit::prepare(&separable_fixture(30), 0.2, 42).unwrap()
    }

    fn config(workers: usize) -> TuneConfig {
        TuneConfig {
            workers: Some(workers),
            ..TuneConfig::default()
        }
    }

    #[test]
    fn test_combinations_enumerate_in_order() {
        let space = SearchSpace::new().with("b", [1.0, 2.0]).with("a", [10.0, 20.0, 30.0]);
        let combinations = space.combinations();
        assert_eq!(space.len(), 6);
        assert_eq!(combinations.len(), 6);
        assert_eq!(combinations[0], Hyperparams::from([("a".into(), 10.0), ("b".into(), 1.0)]));
        assert_eq!(combinations[1], Hyperparams::from([("a".into(), 10.0), ("b".into(), 2.0)]));
        assert_eq!(combinations[5], Hyperparams::from([("a".into(), 30.0), ("b".into(), 2.0)]));

        assert_eq!(SearchSpace::default_for(ClassifierKind::LogisticRegression).len(), 8);
        assert_eq!(SearchSpace::default_for(ClassifierKind::RandomForest).len(), 18);
        assert!(SearchSpace::new().with("c", []).is_empty());
    }

    #[test]
    fn test_tuned_f1_not_below_baseline() {
        let registry = MemoryRegistry::new();
        let dataset = separable_fixture(30);
        let baseline = Variant::logistic_regression();
        let report = ModelTrainer::new(&registry, TrainConfig::default())
            .train(&dataset, &[baseline.clone()])
            .unwrap();
        let baseline_f1 = report.outcomes[0].metrics.f1;

        let space = SearchSpace::new().with("c", [1.0, 10.0]);
        let tuned = Tuner::new(&registry, config(2))
            .tune(&report.prepared, &baseline, &space)
            .unwrap();

        assert_eq!(tuned.variant, "LogisticRegression_Tuned");
        assert_eq!(tuned.version, Some(1));
        assert_eq!(tuned.candidates.len(), 2);
        assert_eq!(tuned.failed_units, 0);
        assert!(tuned.metrics.f1 >= baseline_f1);

        let run = registry
            .runs()
            .into_iter()
            .find(|run| run.run_name == "LogisticRegression_Tuned")
            .unwrap();
        assert!(run.params.contains_key("cv_f1_mean"));
        assert_eq!(run.params["max_iter"], "500");
    }

    #[test]
    fn test_tuned_runs_use_their_own_experiment() {
        let registry = MemoryRegistry::new();
        let baseline = Variant::logistic_regression();
        let report = ModelTrainer::new(&registry, TrainConfig::default())
            .train(&separable_fixture(30), &[baseline.clone()])
            .unwrap();
        Tuner::new(&registry, config(2))
            .tune(&report.prepared, &baseline, &SearchSpace::new().with("c", [1.0]))
            .unwrap();

        let runs = registry.runs();
        let experiment_of = |name: &str| {
            runs.iter()
                .find(|run| run.run_name == name)
                .map(|run| run.experiment.clone())
                .unwrap()
        };
        assert_eq!(experiment_of("LogisticRegression"), TrainConfig::default().experiment);
        assert_eq!(experiment_of("LogisticRegression_Tuned"), "credit_risk_proxy_tuning");
        assert_eq!(
            TuneConfig::default().experiment,
            TuneConfig::experiment_for(&TrainConfig::default().experiment)
        );
    }

    #[test]
    fn test_ties_keep_earliest_combination() {
        let registry = MemoryRegistry::new();
        // every candidate separates the folds perfectly
        let space = SearchSpace::new().with("c", [1.0, 10.0, 100.0]);
        let tuned = Tuner::new(&registry, config(3))
            .tune(&prepared(), &Variant::logistic_regression(), &space)
            .unwrap();
        assert!(tuned.candidates.iter().all(|c| c.mean_f1 == Some(1.0)));
        assert_eq!(tuned.best_params["c"], 1.0);
    }

    #[test]
    fn test_failed_combinations_are_excluded() {
        let registry = MemoryRegistry::new();
        let space = SearchSpace::new().with("c", [-1.0, 1.0]);
        let tuned = Tuner::new(&registry, config(2))
            .tune(&prepared(), &Variant::logistic_regression(), &space)
            .unwrap();

        assert_eq!(tuned.failed_units, 3);
        assert_eq!(tuned.candidates[0].failed_folds, 3);
        assert_eq!(tuned.candidates[0].mean_f1, None);
        assert_eq!(tuned.best_params["c"], 1.0);
    }

    #[test]
    fn test_all_failures_is_fit_failure() {
        let registry = MemoryRegistry::new();
        let space = SearchSpace::new().with("c", [-1.0, 0.0]);
        let result = Tuner::new(&registry, config(2)).tune(&prepared(), &Variant::logistic_regression(), &space);
        assert!(matches!(result, Err(Error::FitFailure { .. })));
    }

    #[test]
    fn test_results_independent_of_worker_count() {
        let registry = MemoryRegistry::new();
        let forest = Variant::random_forest();
        let space = SearchSpace::new()
            .with("n_estimators", [5.0, 10.0])
            .with("max_depth", [0.0, 2.0]);
        let prepared = prepared();

        let serial = Tuner::new(&registry, config(1)).tune(&prepared, &forest, &space).unwrap();
        let parallel = Tuner::new(&registry, config(4)).tune(&prepared, &forest, &space).unwrap();
        assert_eq!(serial.candidates, parallel.candidates);
        assert_eq!(serial.best_params, parallel.best_params);
        assert_eq!((serial.version, parallel.version), (Some(1), Some(2)));
    }

    #[test]
    fn test_registry_failure_is_reported() {
        let space = SearchSpace::new().with("c", [1.0]);
        let tuned = Tuner::new(&FailingRegistry, config(1))
            .tune(&prepared(), &Variant::logistic_regression(), &space)
            .unwrap();
        assert_eq!(tuned.version, None);
        assert!(tuned.registry_error.is_some());
    }

    #[test]
    fn test_panicking_unit_becomes_failure() {
        let results = execute(5, 2, "Flaky", |unit| {
            if unit == 3 {
                panic!("boom");
            }
            Ok(unit as f64)
        });
        assert_eq!(results.len(), 5);
        assert_eq!(*results[4].as_ref().unwrap(), 4.0);
        match &results[3] {
            Err(Error::FitFailure { variant, reason }) => {
                assert_eq!(variant, "Flaky");
                assert!(reason.contains("boom"));
            }
            other => panic!("expected a fit failure, got {other:?}"),
        }
    }
}
