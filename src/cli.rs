//! Command-line interface definitions and argument parsing

use crate::data::{parse_timestamp, CsvSchema};
use crate::model::{SegmenterConfig, Snapshot};
use crate::preprocess::ImputeStrategy;
use crate::train::TrainConfig;
use crate::tune::TuneConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Proxy credit-risk labeling and model training on transaction data
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Segment customers and write the transactions with an is_high_risk column
    Label(LabelArgs),
    /// Label, then train (and optionally tune) classifiers against the proxy label
    Train(TrainArgs),
    /// Copy a registered model version to a standalone JSON file
    Export(ExportArgs),
    /// Score the customers of a CSV with an exported model
    Score(ScoreArgs),
}

/// Column names of the input CSV
#[derive(clap::Args, Debug, Clone)]
pub struct SchemaArgs {
    #[arg(long, default_value = "CustomerId")]
    pub customer_column: String,

    #[arg(long, default_value = "TransactionId")]
    pub transaction_column: String,

    #[arg(long, default_value = "Amount")]
    pub amount_column: String,

    #[arg(long, default_value = "Value")]
    pub value_column: String,

    #[arg(long, default_value = "TransactionStartTime")]
    pub timestamp_column: String,

    /// Optional product category column; ignored when missing from the file
    #[arg(long, default_value = "ProductCategory")]
    pub category_column: String,
}

impl SchemaArgs {
    pub fn schema(&self) -> CsvSchema {
        CsvSchema {
            customer_id: self.customer_column.clone(),
            transaction_id: self.transaction_column.clone(),
            amount: self.amount_column.clone(),
            value: self.value_column.clone(),
            timestamp: self.timestamp_column.clone(),
            category: Some(self.category_column.clone()),
        }
    }
}

/// K-Means settings for the RFM segmentation
#[derive(clap::Args, Debug, Clone)]
pub struct SegmentArgs {
    /// Number of clusters for K-Means
    #[arg(short = 'k', long, default_value = "3")]
    pub clusters: usize,

    /// Seed for every random choice
    #[arg(long, default_value = "42")]
    pub seed: u64,

    /// Maximum iterations for K-Means algorithm
    #[arg(long, default_value = "300")]
    pub max_iters: u64,

    /// Tolerance for K-Means convergence
    #[arg(long, default_value = "1e-4")]
    pub tolerance: f64,

    /// Number of K-Means initialisations
    #[arg(long, default_value = "10")]
    pub n_runs: usize,

    /// Recency reference instant; defaults to the latest transaction plus one day
    /// Example: --snapshot 2019-02-14T00:00:00Z
    #[arg(long)]
    pub snapshot: Option<String>,
}

impl SegmentArgs {
    pub fn segmenter_config(&self) -> SegmenterConfig {
        SegmenterConfig {
            n_clusters: self.clusters,
            seed: self.seed,
            max_iters: self.max_iters,
            tolerance: self.tolerance,
            n_runs: self.n_runs,
        }
    }

    /// Parse the snapshot override, if any
    pub fn parse_snapshot(&self) -> anyhow::Result<Option<Snapshot>> {
        match self.snapshot.as_deref() {
            Some(text) => parse_timestamp(text)
                .map(|instant| Some(Snapshot::at(instant)))
                .ok_or_else(|| anyhow::anyhow!("Invalid snapshot timestamp: {}", text)),
            None => Ok(None),
        }
    }
}

#[derive(clap::Args, Debug)]
pub struct LabelArgs {
    /// Path to the input CSV file
    #[arg(short, long, default_value = "data.csv")]
    pub input: PathBuf,

    /// Output path for the labeled CSV
    #[arg(short, long, default_value = "labeled.csv")]
    pub output: PathBuf,

    #[command(flatten)]
    pub schema: SchemaArgs,

    #[command(flatten)]
    pub segment: SegmentArgs,
}

#[derive(clap::Args, Debug)]
pub struct TrainArgs {
    /// Path to the input CSV file
    #[arg(short, long, default_value = "data.csv")]
    pub input: PathBuf,

    /// Also write the labeled CSV here
    #[arg(long)]
    pub labeled_output: Option<PathBuf>,

    /// Registry root directory
    #[arg(long, default_value = "mlruns")]
    pub registry: PathBuf,

    /// Experiment name baseline runs are grouped under; tuned runs go to `<name>_tuning`
    #[arg(long, default_value = "credit_risk_proxy")]
    pub experiment: String,

    /// Share of customers held out for evaluation
    #[arg(long, default_value = "0.2")]
    pub test_fraction: f64,

    /// Fill value for missing features, fitted on the training rows
    #[arg(long, value_enum, default_value = "median")]
    pub impute: ImputeStrategy,

    /// Run the grid search after the baseline variants
    #[arg(long)]
    pub tune: bool,

    /// Cross-validation folds used while tuning
    #[arg(long, default_value = "3")]
    pub folds: usize,

    /// Tuner worker threads (defaults to the available parallelism)
    #[arg(long)]
    pub workers: Option<usize>,

    #[command(flatten)]
    pub schema: SchemaArgs,

    #[command(flatten)]
    pub segment: SegmentArgs,
}

impl TrainArgs {
    pub fn train_config(&self) -> TrainConfig {
        TrainConfig {
            experiment: self.experiment.clone(),
            test_fraction: self.test_fraction,
            seed: self.segment.seed,
            impute: self.impute,
        }
    }

    pub fn tune_config(&self) -> TuneConfig {
        TuneConfig {
            experiment: TuneConfig::experiment_for(&self.experiment),
            folds: self.folds,
            seed: self.segment.seed,
            workers: self.workers,
        }
    }
}

#[derive(clap::Args, Debug)]
pub struct ExportArgs {
    /// Registry root directory
    #[arg(long, default_value = "mlruns")]
    pub registry: PathBuf,

    /// Registered model name, e.g. RandomForest_Tuned
    #[arg(short, long)]
    pub name: String,

    /// Version to export (latest when omitted)
    #[arg(long)]
    pub model_version: Option<u32>,

    /// Destination file or directory
    #[arg(short, long, default_value = "model.json")]
    pub output: PathBuf,
}

#[derive(clap::Args, Debug)]
pub struct ScoreArgs {
    /// Exported model artifact
    #[arg(short, long)]
    pub model: PathBuf,

    /// Path to the input CSV file
    #[arg(short, long, default_value = "data.csv")]
    pub input: PathBuf,

    /// Write customer scores here instead of printing them
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    #[command(flatten)]
    pub schema: SchemaArgs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_defaults() {
        let args = Args::try_parse_from(["riskforge", "label", "-i", "tx.csv"]).unwrap();
        assert!(!args.verbose);
        let Command::Label(label) = args.command else {
            panic!("expected label command");
        };
        assert_eq!(label.input, PathBuf::from("tx.csv"));
        assert_eq!(label.output, PathBuf::from("labeled.csv"));
        assert_eq!(label.schema.schema(), CsvSchema::default());
        assert_eq!(label.segment.segmenter_config(), SegmenterConfig::default());
        assert_eq!(label.segment.parse_snapshot().unwrap(), None);
    }

    #[test]
    fn test_train_configs() {
        let args = Args::try_parse_from([
            "riskforge",
            "train",
            "--tune",
            "--seed",
            "7",
            "--folds",
            "5",
            "--workers",
            "2",
            "--experiment",
            "exp",
            "--impute",
            "mean",
            "-v",
        ])
        .unwrap();
        assert!(args.verbose);
        let Command::Train(train) = args.command else {
            panic!("expected train command");
        };
        assert!(train.tune);

        let train_config = train.train_config();
        assert_eq!(train_config.seed, 7);
        assert_eq!(train_config.experiment, "exp");
        assert_eq!(train_config.test_fraction, 0.2);
        assert_eq!(train_config.impute, ImputeStrategy::Mean);

        let tune_config = train.tune_config();
        assert_eq!(tune_config.folds, 5);
        assert_eq!(tune_config.workers, Some(2));
        assert_eq!(tune_config.seed, 7);
        assert_eq!(tune_config.experiment, "exp_tuning");
        assert_ne!(tune_config.experiment, train_config.experiment);
    }

    #[test]
    fn test_impute_defaults_to_median() {
        let args = Args::try_parse_from(["riskforge", "train"]).unwrap();
        let Command::Train(train) = args.command else {
            panic!("expected train command");
        };
        assert_eq!(train.train_config(), TrainConfig::default());
        assert!(Args::try_parse_from(["riskforge", "train", "--impute", "mode"]).is_err());
    }

    #[test]
    fn test_parse_snapshot() {
        let mut segment = SegmentArgs {
            clusters: 3,
            seed: 42,
            max_iters: 300,
            tolerance: 1e-4,
            n_runs: 10,
            snapshot: Some("2019-02-14".to_string()),
        };
        let snapshot = segment.parse_snapshot().unwrap().unwrap();
        assert_eq!(snapshot.instant().to_rfc3339(), "2019-02-14T00:00:00+00:00");

        segment.snapshot = Some("invalid".to_string());
        assert!(segment.parse_snapshot().is_err());
    }

    #[test]
    fn test_export_requires_name() {
        assert!(Args::try_parse_from(["riskforge", "export"]).is_err());
        let args = Args::try_parse_from(["riskforge", "export", "-n", "RandomForest", "--model-version", "3"]).unwrap();
        let Command::Export(export) = args.command else {
            panic!("expected export command");
        };
        assert_eq!(export.model_version, Some(3));
    }
}
