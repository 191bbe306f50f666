//! RiskForge: proxy credit-risk labeling and model training CLI
//!
//! This is the main entrypoint that orchestrates data loading, segmentation,
//! training, tuning and model export.

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use riskforge::cli::{Command, ExportArgs, LabelArgs, SchemaArgs, ScoreArgs, SegmentArgs, TrainArgs};
use riskforge::data::{coerce_records, write_customer_scores, TransactionFrame};
use riskforge::{
    export_model, load_transactions, write_labeled_transactions, Aggregator, Args, ExperimentRegistry, FeatureTable,
    FileRegistry, LabeledDataset, ModelArtifact, ModelTrainer, RiskSegmenter, SearchSpace, Segmentation, Snapshot,
    TrainingReport, Tuner, Variant,
};
use std::path::Path;
use std::time::Instant;

fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    match &args.command {
        Command::Label(label) => run_label(label),
        Command::Train(train) => run_train(train, args.verbose),
        Command::Export(export) => run_export(export),
        Command::Score(score) => run_score(score),
    }
}

/// Everything produced by loading a CSV and segmenting its customers
struct Labeling {
    frame: TransactionFrame,
    table: FeatureTable,
    segmentation: Segmentation,
}

fn label_customers(input: &Path, schema: &SchemaArgs, segment: &SegmentArgs) -> Result<Labeling> {
    let frame = load_transactions(input, &schema.schema())
        .with_context(|| format!("Failed to load transactions from {}", input.display()))?;
    let (records, malformed) = coerce_records(&frame.rows);
    if !malformed.is_empty() {
        println!("⚠ Skipped {} malformed rows", malformed.len());
        for record in malformed.iter().take(5) {
            log::warn!("{record}");
        }
    }

    let aggregation = Aggregator.aggregate(&records)?;
    println!(
        "✓ Data loaded: {} transactions, {} customers",
        records.len(),
        aggregation.table.len()
    );

    let snapshot = match segment.parse_snapshot()? {
        Some(snapshot) => snapshot,
        None => Snapshot::from_records(&records)?,
    };
    let segmentation = RiskSegmenter::new(segment.segmenter_config())
        .segment(&records, snapshot)
        .context("Failed to segment customers")?;

    Ok(Labeling {
        frame,
        table: aggregation.table,
        segmentation,
    })
}

fn print_cluster_statistics(segmentation: &Segmentation) {
    println!("\n=== Cluster Statistics ===");
    println!("Snapshot: {}", segmentation.snapshot.instant().to_rfc3339());
    let total = segmentation.assignments.len().max(1) as f64;
    println!(
        "{:<8} {:>10} {:>8} {:>12} {:>12} {:>14}",
        "Cluster", "Customers", "Share", "Recency", "Frequency", "Monetary"
    );
    for summary in &segmentation.summaries {
        let marker = if summary.cluster_id == segmentation.high_risk_cluster {
            "  <- high risk"
        } else {
            ""
        };
        println!(
            "{:<8} {:>10} {:>7.1}% {:>12.1} {:>12.2} {:>14.2}{}",
            summary.cluster_id,
            summary.size,
            summary.size as f64 / total * 100.0,
            summary.mean_recency,
            summary.mean_frequency,
            summary.mean_monetary,
            marker
        );
    }
    if segmentation.skipped_records > 0 {
        println!("⚠ {} malformed records left out of the RFM profiles", segmentation.skipped_records);
    }
    println!("\nSilhouette score (sample): {:.3}", segmentation.silhouette);
    println!("Within-cluster sum of squares: {:.2}", segmentation.inertia);
    println!(
        "\nNote: is_high_risk is a proxy derived from engagement clusters ({} of {} customers), not observed defaults.",
        segmentation.high_risk_count(),
        segmentation.assignments.len()
    );
}

fn write_labels(labeling: &Labeling, output: &Path) -> Result<()> {
    let summary = write_labeled_transactions(&labeling.frame, &labeling.segmentation.labels(), output)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!(
        "\n✓ Labeled transactions saved to: {} ({} rows, {} dropped)",
        output.display(),
        summary.written,
        summary.dropped
    );
    Ok(())
}

/// Segment customers and export the labeled transactions
fn run_label(args: &LabelArgs) -> Result<()> {
    println!("=== Proxy Labeling ===\n");
    let start_time = Instant::now();

    let labeling = label_customers(&args.input, &args.schema, &args.segment)?;
    print_cluster_statistics(&labeling.segmentation);
    write_labels(&labeling, &args.output)?;

    println!("\nTotal processing time: {:.2}s", start_time.elapsed().as_secs_f64());
    Ok(())
}

fn print_training_report(report: &TrainingReport) {
    println!("\n=== Baseline Models ===");
    println!(
        "{:<24} {:>9} {:>10} {:>8} {:>8} {:>8} {:>8}",
        "Variant", "Accuracy", "Precision", "Recall", "F1", "ROC AUC", "Version"
    );
    for outcome in &report.outcomes {
        let metrics = &outcome.metrics;
        println!(
            "{:<24} {:>9.4} {:>10.4} {:>8.4} {:>8.4} {:>8} {:>8}",
            outcome.variant,
            metrics.accuracy,
            metrics.precision,
            metrics.recall,
            metrics.f1,
            metrics.roc_auc.map_or("n/a".to_string(), |auc| format!("{auc:.4}")),
            outcome.version.map_or("-".to_string(), |v| v.to_string())
        );
        if let Some(reason) = &outcome.registry_error {
            println!("  ⚠ not registered: {reason}");
        }
    }
    for failure in &report.failures {
        println!("✗ {failure}");
    }
}

/// Label, train the baseline variants and optionally tune them
fn run_train(args: &TrainArgs, verbose: bool) -> Result<()> {
    println!("=== Training Pipeline ===\n");
    let start_time = Instant::now();

    let labeling = label_customers(&args.input, &args.schema, &args.segment)?;
    print_cluster_statistics(&labeling.segmentation);
    if let Some(output) = &args.labeled_output {
        write_labels(&labeling, output)?;
    }

    let dataset = LabeledDataset::join(&labeling.table, &labeling.segmentation.assignments);
    println!(
        "\n✓ Training table: {} customers, {} high risk",
        dataset.len(),
        dataset.positives()
    );

    let registry = FileRegistry::open(&args.registry)
        .with_context(|| format!("Failed to open registry at {}", args.registry.display()))?;
    let trainer = ModelTrainer::new(&registry, args.train_config());
    let variants = Variant::defaults();
    let report = trainer.train(&dataset, &variants)?;
    print_training_report(&report);

    if args.tune {
        println!("\n=== Hyperparameter Tuning ===");
        let tuner = Tuner::new(&registry, args.tune_config());
        for variant in &variants {
            let space = SearchSpace::default_for(variant.kind);
            let tune_start = Instant::now();
            match tuner.tune(&report.prepared, variant, &space) {
                Ok(tuned) => {
                    println!(
                        "✓ {}: cv F1 {:.4}, held-out F1 {:.4}, version {}",
                        tuned.variant,
                        tuned.cv_f1,
                        tuned.metrics.f1,
                        tuned.version.map_or("-".to_string(), |v| v.to_string())
                    );
                    println!("  Best params: {:?}", tuned.best_params);
                    if tuned.failed_units > 0 {
                        println!("  ⚠ {} failed units", tuned.failed_units);
                    }
                    if verbose {
                        for candidate in &tuned.candidates {
                            println!("    {:?} -> {:?}", candidate.params, candidate.mean_f1);
                        }
                        println!("  Tuning time: {:.2}s", tune_start.elapsed().as_secs_f64());
                    }
                }
                Err(err) => println!("✗ {}: {}", variant.name, err),
            }
        }
    }

    println!("\n=== Pipeline Complete ===");
    println!("Registry: {}", registry.root().display());
    println!("Total processing time: {:.2}s", start_time.elapsed().as_secs_f64());
    Ok(())
}

/// Copy a registered model to a standalone file
fn run_export(args: &ExportArgs) -> Result<()> {
    let registry = FileRegistry::open(&args.registry)?;
    let version = match args.model_version {
        Some(version) => version,
        None => registry
            .latest_version(&args.name)?
            .with_context(|| format!("No registered versions of {}", args.name))?,
    };
    let path = export_model(&registry, &args.name, version, &args.output)?;
    println!("✓ Exported {} v{} to {}", args.name, version, path.display());
    Ok(())
}

/// Score every customer of a CSV with an exported artifact
fn run_score(args: &ScoreArgs) -> Result<()> {
    let artifact = ModelArtifact::read_from(&args.model)
        .with_context(|| format!("Failed to read model from {}", args.model.display()))?;
    let frame = load_transactions(&args.input, &args.schema.schema())?;
    let (records, malformed) = coerce_records(&frame.rows);
    if !malformed.is_empty() {
        println!("⚠ Skipped {} malformed rows", malformed.len());
    }
    let table = Aggregator.aggregate(&records)?.table;
    let probabilities = artifact.predict_proba(&table.columns, &table.features)?;

    println!(
        "=== Scores from {} (v{}) ===",
        artifact.variant_name,
        artifact.registry_version.map_or("-".to_string(), |v| v.to_string())
    );
    match &args.output {
        Some(output) => {
            write_customer_scores(&table.customer_ids, &probabilities.to_vec(), output)?;
            println!("✓ {} customer scores saved to: {}", table.len(), output.display());
        }
        None => {
            for (customer_id, probability) in table.customer_ids.iter().zip(probabilities.iter()) {
                println!("{customer_id}: {probability:.4}");
            }
        }
    }
    Ok(())
}
