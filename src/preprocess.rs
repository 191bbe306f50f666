//! Missing-value imputation and standard scaling, fitted once and applied everywhere

use crate::error::Error;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

/// How a missing (non-finite) feature is filled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ImputeStrategy {
    /// Median of the column's finite fitting values
    #[default]
    Median,
    /// Mean of the column's finite fitting values
    Mean,
    Zero,
}

impl ImputeStrategy {
    /// Fill value for one column; 0.0 when the column has no finite entries
    fn fill_value(self, column: ArrayView1<'_, f64>) -> f64 {
        match self {
            ImputeStrategy::Median => median(column),
            ImputeStrategy::Mean => {
                let finite: Vec<f64> = column.iter().copied().filter(|v| v.is_finite()).collect();
                if finite.is_empty() {
                    0.0
                } else {
                    finite.iter().sum::<f64>() / finite.len() as f64
                }
            }
            ImputeStrategy::Zero => 0.0,
        }
    }
}

/// Zero-mean, unit-variance scaling with parameters frozen at fit time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Array1<f64>,
    /// Population standard deviation, 1.0 for constant columns
    pub scale: Array1<f64>,
}

impl StandardScaler {
    pub fn fit(records: &Array2<f64>) -> Self {
        let n = records.nrows().max(1) as f64;
        let mean = records.sum_axis(Axis(0)) / n;
        let scale = records
            .axis_iter(Axis(1))
            .zip(mean.iter())
            .map(|(column, &mu)| {
                let variance = column.iter().map(|v| (v - mu).powi(2)).sum::<f64>() / n;
                let std = variance.sqrt();
                if std > f64::EPSILON && std.is_finite() {
                    std
                } else {
                    1.0
                }
            })
            .collect();
        Self { mean, scale }
    }

    pub fn transform(&self, records: &Array2<f64>) -> Array2<f64> {
        (records - &self.mean) / &self.scale
    }

    pub fn transform_row(&self, row: ArrayView1<'_, f64>) -> Array1<f64> {
        (&row - &self.mean) / &self.scale
    }
}

/// Imputer + scaler pair bound to a fixed, named column set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preprocessor {
    columns: Vec<String>,
    strategy: ImputeStrategy,
    fill_values: Array1<f64>,
    scaler: StandardScaler,
}

impl Preprocessor {
    /// Median imputation followed by scaling
    pub fn fit(columns: &[String], records: &Array2<f64>) -> crate::Result<Self> {
        Self::fit_with(columns, records, ImputeStrategy::Median)
    }

    /// Fit fill values on the finite entries of each column, then the scaler on the imputed matrix
    pub fn fit_with(columns: &[String], records: &Array2<f64>, strategy: ImputeStrategy) -> crate::Result<Self> {
        if columns.len() != records.ncols() {
            return Err(Error::ShapeMismatch {
                expected: columns.to_vec(),
                found: (0..records.ncols()).map(|i| format!("column {i}")).collect(),
            });
        }
        if records.nrows() == 0 {
            return Err(Error::InvalidConfig(
                "cannot fit a preprocessor on an empty matrix".to_string(),
            ));
        }

        let fill_values: Array1<f64> = records
            .axis_iter(Axis(1))
            .map(|column| strategy.fill_value(column))
            .collect();
        let imputed = impute(records, &fill_values);
        let scaler = StandardScaler::fit(&imputed);

        let missing = records.iter().filter(|v| !v.is_finite()).count();
        log::debug!(
            "fitted preprocessor on {} rows, {} missing entries imputed ({:?})",
            records.nrows(),
            missing,
            strategy
        );

        Ok(Self {
            columns: columns.to_vec(),
            strategy,
            fill_values,
            scaler,
        })
    }

    /// Impute and scale with the fitted parameters; never refits
    pub fn transform(&self, columns: &[String], records: &Array2<f64>) -> crate::Result<Array2<f64>> {
        if columns != self.columns.as_slice() || records.ncols() != self.columns.len() {
            return Err(Error::ShapeMismatch {
                expected: self.columns.clone(),
                found: columns.to_vec(),
            });
        }
        Ok(self.scaler.transform(&impute(records, &self.fill_values)))
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn strategy(&self) -> ImputeStrategy {
        self.strategy
    }

    pub fn fill_values(&self) -> &Array1<f64> {
        &self.fill_values
    }

    pub fn scaler(&self) -> &StandardScaler {
        &self.scaler
    }
}

/// Median of the finite entries; 0.0 when a column has none
fn median(column: ArrayView1<'_, f64>) -> f64 {
    let mut finite: Vec<f64> = column.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return 0.0;
    }
    finite.sort_by(f64::total_cmp);
    let mid = finite.len() / 2;
    if finite.len() % 2 == 0 {
        (finite[mid - 1] + finite[mid]) / 2.0
    } else {
        finite[mid]
    }
}

fn impute(records: &Array2<f64>, fill_values: &Array1<f64>) -> Array2<f64> {
    let mut imputed = records.clone();
    for (mut column, &fill) in imputed.axis_iter_mut(Axis(1)).zip(fill_values.iter()) {
        column.mapv_inplace(|v| if v.is_finite() { v } else { fill });
    }
    imputed
}
