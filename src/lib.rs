//! RiskForge: proxy credit-risk labels from transaction behaviour
//!
//! Transactions are aggregated into customer features, customers are segmented
//! with K-Means on their RFM (Recency, Frequency, Monetary) profile, and the
//! least engaged segment becomes the high-risk proxy label. Classifiers trained
//! against that label are tuned, evaluated and versioned in an experiment
//! registry.

pub mod classifier;
pub mod cli;
pub mod data;
pub mod dataset;
pub mod error;
pub mod features;
pub mod metrics;
pub mod model;
pub mod preprocess;
pub mod registry;
pub mod split;
pub mod train;
pub mod tune;

// Re-export public items for easier access
pub use classifier::{ClassifierKind, FittedClassifier, Hyperparams, ProbabilisticClassifier, Variant};
pub use cli::Args;
pub use data::{load_transactions, write_labeled_transactions, CsvSchema, RawTransaction, TransactionRecord};
pub use dataset::LabeledDataset;
pub use error::{Error, MalformedRecord};
pub use features::{Aggregator, FeatureTable, FEATURE_COLUMNS};
pub use metrics::ClassificationMetrics;
pub use model::{
    compute_rfm, designate_high_risk, ClusterAssignment, RfmOutcome, RfmProfile, RiskSegmenter, SegmenterConfig,
    Segmentation, Snapshot,
};
pub use preprocess::{ImputeStrategy, Preprocessor};
pub use registry::{export_model, start_run, ExperimentRegistry, FileRegistry, MemoryRegistry, ModelArtifact};
pub use train::{ModelTrainer, PreparedSplit, TrainConfig, TrainingReport};
pub use tune::{SearchSpace, TuneConfig, TunedOutcome, Tuner};

/// Common result type used throughout the library
pub type Result<T, E = Error> = std::result::Result<T, E>;
