//! RFM segmentation with K-Means and proxy high-risk label derivation
//!
//! Customers are profiled by recency, frequency and monetary value relative to
//! a single snapshot, the three metrics are standardized, and K-Means splits
//! them into segments. The segment with the lowest mean frequency becomes the
//! high-risk proxy label. The label is derived from unsupervised structure and
//! is not ground truth.

use crate::data::TransactionRecord;
use crate::error::{Error, MalformedRecord};
use crate::preprocess::StandardScaler;
use chrono::{DateTime, Duration, Utc};
use linfa::prelude::*;
use linfa_clustering::KMeans;
use linfa_nn::distance::L2Dist;
use ndarray::{Array1, Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// Reference instant for recency, fixed for a whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot(DateTime<Utc>);

impl Snapshot {
    pub fn at(instant: DateTime<Utc>) -> Self {
        Snapshot(instant)
    }

    /// Latest transaction timestamp plus one day
    pub fn from_records(records: &[TransactionRecord]) -> crate::Result<Self> {
        records
            .iter()
            .map(|record| record.timestamp)
            .max()
            .map(|latest| Snapshot(latest + Duration::days(1)))
            .ok_or_else(|| Error::InvalidConfig("no transactions to derive a snapshot from".into()))
    }

    pub fn instant(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Recency / frequency / monetary metrics of one customer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RfmProfile {
    pub customer_id: String,
    pub recency_days: i64,
    pub frequency: usize,
    pub monetary: f64,
}

impl RfmProfile {
    fn as_row(&self) -> [f64; 3] {
        [self.recency_days as f64, self.frequency as f64, self.monetary]
    }
}

/// RFM profiles plus the records left out of them
#[derive(Debug, Clone)]
pub struct RfmOutcome {
    /// One profile per customer, sorted by customer id
    pub profiles: Vec<RfmProfile>,
    pub rejected: Vec<MalformedRecord>,
}

/// Compute one RFM profile per customer
///
/// Records with a missing customer id or a non-finite amount or value are
/// skipped and reported, the same rule the aggregator applies.
pub fn compute_rfm(records: &[TransactionRecord], snapshot: Snapshot) -> crate::Result<RfmOutcome> {
    let mut groups: BTreeMap<&str, (DateTime<Utc>, usize, f64)> = BTreeMap::new();
    let mut rejected = Vec::new();
    for (row, record) in records.iter().enumerate() {
        if let Some(reason) = record.defect() {
            rejected.push(MalformedRecord { row, reason });
            continue;
        }
        if record.timestamp > snapshot.instant() {
            return Err(Error::InvalidConfig(format!(
                "transaction {} at {} is after snapshot {}",
                record.transaction_id,
                record.timestamp,
                snapshot.instant()
            )));
        }
        let entry = groups
            .entry(record.customer_id.as_str())
            .or_insert((record.timestamp, 0, 0.0));
        entry.0 = entry.0.max(record.timestamp);
        entry.1 += 1;
        entry.2 += record.value;
    }

    if groups.is_empty() {
        return Err(Error::MalformedRecords { rejected });
    }
    if !rejected.is_empty() {
        log::warn!("skipped {} malformed records during RFM profiling", rejected.len());
    }

    let profiles = groups
        .into_iter()
        .map(|(customer_id, (last_seen, frequency, monetary))| RfmProfile {
            customer_id: customer_id.to_string(),
            recency_days: (snapshot.instant() - last_seen).num_days(),
            frequency,
            monetary,
        })
        .collect();
    Ok(RfmOutcome { profiles, rejected })
}

/// K-Means settings for the segmenter
#[derive(Debug, Clone, PartialEq)]
pub struct SegmenterConfig {
    pub n_clusters: usize,
    pub seed: u64,
    pub max_iters: u64,
    pub tolerance: f64,
    pub n_runs: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            n_clusters: 3,
            seed: 42,
            max_iters: 300,
            tolerance: 1e-4,
            n_runs: 10,
        }
    }
}

/// Cluster membership and derived label for one customer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterAssignment {
    pub customer_id: String,
    pub cluster_id: usize,
    pub is_high_risk: bool,
}

/// Mean raw RFM values of one cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub cluster_id: usize,
    pub size: usize,
    pub mean_recency: f64,
    pub mean_frequency: f64,
    pub mean_monetary: f64,
}

/// Order clusters from most to least risky
///
/// Lowest mean frequency first; ties go to the staler cluster (higher mean
/// recency), then the lower mean monetary value, then the lower cluster id.
pub fn rank_clusters(summaries: &[ClusterSummary]) -> Vec<ClusterSummary> {
    let mut ranked = summaries.to_vec();
    ranked.sort_by(|a, b| {
        a.mean_frequency
            .total_cmp(&b.mean_frequency)
            .then_with(|| b.mean_recency.total_cmp(&a.mean_recency))
            .then_with(|| a.mean_monetary.total_cmp(&b.mean_monetary))
            .then_with(|| a.cluster_id.cmp(&b.cluster_id))
    });
    ranked
}

/// Cluster id carrying the high-risk label
pub fn designate_high_risk(summaries: &[ClusterSummary]) -> Option<usize> {
    rank_clusters(summaries).first().map(|summary| summary.cluster_id)
}

/// Result of one segmentation run
#[derive(Debug, Clone)]
pub struct Segmentation {
    pub snapshot: Snapshot,
    pub profiles: Vec<RfmProfile>,
    /// Records left out of the RFM profiles
    pub skipped_records: usize,
    pub assignments: Vec<ClusterAssignment>,
    pub summaries: Vec<ClusterSummary>,
    pub high_risk_cluster: usize,
    /// Scaler fitted on the RFM matrix
    pub scaler: StandardScaler,
    /// Cluster centroids in normalized space
    pub centroids: Array2<f64>,
    /// Within-cluster sum of squares
    pub inertia: f64,
    pub silhouette: f64,
}

impl Segmentation {
    /// customer id -> is_high_risk
    pub fn labels(&self) -> BTreeMap<String, bool> {
        self.assignments
            .iter()
            .map(|assignment| (assignment.customer_id.clone(), assignment.is_high_risk))
            .collect()
    }

    pub fn high_risk_count(&self) -> usize {
        self.assignments.iter().filter(|a| a.is_high_risk).count()
    }

    /// Assign a profile to the nearest centroid using the fitted RFM scaler
    pub fn predict(&self, profile: &RfmProfile) -> ClusterAssignment {
        let row = Array1::from(profile.as_row().to_vec());
        let scaled = self.scaler.transform_row(row.view());
        let cluster_id = nearest_centroid(scaled.view(), &self.centroids);
        ClusterAssignment {
            customer_id: profile.customer_id.clone(),
            cluster_id,
            is_high_risk: cluster_id == self.high_risk_cluster,
        }
    }
}

/// Derives proxy high-risk labels from transaction behaviour
#[derive(Debug, Clone, Default)]
pub struct RiskSegmenter {
    pub config: SegmenterConfig,
}

impl RiskSegmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self { config }
    }

    /// Profile, standardize, cluster and label every customer in `records`
    pub fn segment(&self, records: &[TransactionRecord], snapshot: Snapshot) -> crate::Result<Segmentation> {
        let RfmOutcome { profiles, rejected } = compute_rfm(records, snapshot)?;
        let raw = rfm_matrix(&profiles)?;
        let scaler = StandardScaler::fit(&raw);
        let features = scaler.transform(&raw);

        let n_clusters = self.effective_clusters(&features)?;
        if n_clusters < self.config.n_clusters {
            log::warn!(
                "only {} distinct RFM profiles, clustering into {} instead of {} segments",
                n_clusters,
                n_clusters,
                self.config.n_clusters
            );
        }

        let n_samples = features.nrows();
        let dataset = Dataset::new(features.clone(), Array1::<usize>::zeros(n_samples));
        let rng = StdRng::seed_from_u64(self.config.seed);
        let model = KMeans::params_with(n_clusters, rng, L2Dist)
            .n_runs(self.config.n_runs)
            .max_n_iterations(self.config.max_iters)
            .tolerance(self.config.tolerance)
            .fit(&dataset)
            .map_err(|err| Error::DegenerateCluster(err.to_string()))?;

        let labels: Array1<usize> = model.predict(&features);
        let centroids = model.centroids().clone();

        let summaries = summarize_clusters(&profiles, &labels, n_clusters)?;
        let high_risk_cluster = designate_high_risk(&summaries)
            .ok_or_else(|| Error::DegenerateCluster("no clusters to rank".into()))?;

        let assignments = profiles
            .iter()
            .zip(labels.iter())
            .map(|(profile, &cluster_id)| ClusterAssignment {
                customer_id: profile.customer_id.clone(),
                cluster_id,
                is_high_risk: cluster_id == high_risk_cluster,
            })
            .collect();

        let inertia = compute_inertia(&features, &labels, &centroids);
        let silhouette = compute_silhouette_sample(&features, &labels, n_clusters, 1000);

        log::info!(
            "segmented {} customers into {} clusters (inertia {:.2}, silhouette {:.3}), high-risk cluster {}",
            profiles.len(),
            n_clusters,
            inertia,
            silhouette,
            high_risk_cluster
        );

        Ok(Segmentation {
            snapshot,
            profiles,
            skipped_records: rejected.len(),
            assignments,
            summaries,
            high_risk_cluster,
            scaler,
            centroids,
            inertia,
            silhouette,
        })
    }

    fn effective_clusters(&self, features: &Array2<f64>) -> crate::Result<usize> {
        if self.config.n_clusters < 2 {
            return Err(Error::InvalidConfig(
                "at least two clusters are needed to separate a high-risk segment".into(),
            ));
        }
        let distinct: BTreeSet<Vec<u64>> = features
            .outer_iter()
            .map(|row| row.iter().map(|v| v.to_bits()).collect())
            .collect();
        if distinct.len() < 2 {
            return Err(Error::DegenerateCluster(format!(
                "{} customer(s) with {} distinct RFM profile(s), cannot form two segments",
                features.nrows(),
                distinct.len()
            )));
        }
        Ok(self.config.n_clusters.min(distinct.len()))
    }
}

fn rfm_matrix(profiles: &[RfmProfile]) -> crate::Result<Array2<f64>> {
    let mut data = Vec::with_capacity(profiles.len() * 3);
    for profile in profiles {
        data.extend_from_slice(&profile.as_row());
    }
    Array2::from_shape_vec((profiles.len(), 3), data).map_err(|err| Error::InvalidConfig(err.to_string()))
}

fn summarize_clusters(
    profiles: &[RfmProfile],
    labels: &Array1<usize>,
    n_clusters: usize,
) -> crate::Result<Vec<ClusterSummary>> {
    let mut sums = vec![[0.0f64; 3]; n_clusters];
    let mut sizes = vec![0usize; n_clusters];
    for (profile, &cluster) in profiles.iter().zip(labels.iter()) {
        if cluster >= n_clusters {
            return Err(Error::DegenerateCluster(format!("unexpected cluster id {cluster}")));
        }
        sizes[cluster] += 1;
        for (sum, value) in sums[cluster].iter_mut().zip(profile.as_row()) {
            *sum += value;
        }
    }

    (0..n_clusters)
        .map(|cluster_id| {
            let size = sizes[cluster_id];
            if size == 0 {
                return Err(Error::DegenerateCluster(format!("cluster {cluster_id} is empty")));
            }
            let [recency, frequency, monetary] = sums[cluster_id].map(|sum| sum / size as f64);
            if ![recency, frequency, monetary].iter().all(|v| v.is_finite()) {
                return Err(Error::DegenerateCluster(format!(
                    "cluster {cluster_id} has undefined statistics"
                )));
            }
            Ok(ClusterSummary {
                cluster_id,
                size,
                mean_recency: recency,
                mean_frequency: frequency,
                mean_monetary: monetary,
            })
        })
        .collect()
}

fn nearest_centroid(point: ArrayView1<'_, f64>, centroids: &Array2<f64>) -> usize {
    centroids
        .outer_iter()
        .map(|centroid| euclidean_distance(&point, &centroid))
        .enumerate()
        .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
        .map(|(cluster, _)| cluster)
        .unwrap_or(0)
}

/// Compute within-cluster sum of squares (inertia)
fn compute_inertia(features: &Array2<f64>, labels: &Array1<usize>, centroids: &Array2<f64>) -> f64 {
    let mut inertia = 0.0;

    for (i, &cluster) in labels.iter().enumerate() {
        if cluster < centroids.nrows() {
            let distance = euclidean_distance(&features.row(i), &centroids.row(cluster));
            inertia += distance * distance;
        }
    }

    inertia
}

/// Mean silhouette coefficient over the first `sample_size` points
fn compute_silhouette_sample(
    features: &Array2<f64>,
    labels: &Array1<usize>,
    n_clusters: usize,
    sample_size: usize,
) -> f64 {
    let n_samples = features.nrows().min(sample_size);
    if n_samples < 2 {
        return 0.0;
    }

    let mut silhouette_sum = 0.0;

    for i in 0..n_samples {
        let point = features.row(i);
        let own = labels[i];

        // distances grouped by the other point's cluster
        let mut totals = vec![(0.0f64, 0usize); n_clusters];
        for j in 0..n_samples {
            if i == j {
                continue;
            }
            let other = labels[j];
            if other < n_clusters {
                totals[other].0 += euclidean_distance(&point, &features.row(j));
                totals[other].1 += 1;
            }
        }

        let a_i = match totals[own] {
            (_, 0) => 0.0,
            (sum, count) => sum / count as f64,
        };
        let b_i = totals
            .iter()
            .enumerate()
            .filter(|&(cluster, &(_, count))| cluster != own && count > 0)
            .map(|(_, &(sum, count))| sum / count as f64)
            .fold(f64::INFINITY, f64::min);

        if b_i.is_finite() && (a_i > 0.0 || b_i > 0.0) {
            silhouette_sum += (b_i - a_i) / a_i.max(b_i);
        }
    }

    silhouette_sum / n_samples as f64
}

/// Calculate Euclidean distance between two points
fn euclidean_distance(point1: &ArrayView1<'_, f64>, point2: &ArrayView1<'_, f64>) -> f64 {
    point1
        .iter()
        .zip(point2.iter())
        .map(|(a, b)| (a - b).powi(2))
        .sum::<f64>()
        .sqrt()
}
