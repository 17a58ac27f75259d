use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use crate::error::{PipelineError, Result};
use crate::models::{Field, Measurement};

/// Ordinary least squares with an intercept and a small ridge term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub target: Field,
    pub predictors: Vec<Field>,
    pub intercept: f64,
    pub coefficients: Vec<f64>,
    pub r_squared: f64,
    pub training_rows: usize,
}

impl LinearModel {
    /// Fit `target` on `predictors` over rows that carry the target.
    /// Missing predictor slots count as 0.0.
    pub fn fit(
        rows: &[Measurement],
        target: Field,
        predictors: &[Field],
        ridge_lambda: f64,
    ) -> Result<Self> {
        let samples: Vec<(Vec<f64>, f64)> = rows
            .iter()
            .filter_map(|m| m.get(target).map(|y| (m.feature_vector(predictors), y)))
            .collect();

        if samples.is_empty() {
            return Err(PipelineError::InsufficientTrainingData {
                available: 0,
                required: 1,
            });
        }

        // design matrix column 0 is the intercept
        let width = predictors.len() + 1;
        let x = DMatrix::from_fn(samples.len(), width, |row, col| {
            if col == 0 {
                1.0
            } else {
                samples[row].0[col - 1]
            }
        });
        let y = DVector::from_iterator(samples.len(), samples.iter().map(|(_, y)| *y));

        let xt = x.transpose();
        let mut xtx = &xt * &x;
        // intercept is not penalised
        for i in 1..width {
            xtx[(i, i)] += ridge_lambda;
        }
        let xty = &xt * &y;

        let beta = solve_normal_equations(xtx, &xty)?;
        let r_squared = r_squared(&x, &y, &beta);

        Ok(Self {
            target,
            predictors: predictors.to_vec(),
            intercept: beta[0],
            coefficients: beta.iter().skip(1).copied().collect(),
            r_squared,
            training_rows: samples.len(),
        })
    }

    fn predict_features(&self, features: &[f64]) -> f64 {
        self.intercept
            + self
                .coefficients
                .iter()
                .zip(features)
                .map(|(c, x)| c * x)
                .sum::<f64>()
    }

    pub fn predict(&self, snapshot: &Measurement) -> f64 {
        self.predict_features(&snapshot.feature_vector(&self.predictors))
    }

    /// Write the model as pretty JSON. The file is disposable; it is rebuilt
    /// every run.
    pub fn save_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }
}

/// Cholesky on the (symmetric) normal matrix, LU when it is not positive
/// definite. A singular system is an error.
fn solve_normal_equations(xtx: DMatrix<f64>, xty: &DVector<f64>) -> Result<DVector<f64>> {
    let beta = match xtx.clone().cholesky() {
        Some(cholesky) => Some(cholesky.solve(xty)),
        None => xtx.lu().solve(xty),
    };

    beta.filter(|b| b.iter().all(|v| v.is_finite())).ok_or_else(|| {
        PipelineError::Config(
            "training matrix is singular; increase forecast.ridge_lambda".to_string(),
        )
    })
}

fn r_squared(x: &DMatrix<f64>, y: &DVector<f64>, beta: &DVector<f64>) -> f64 {
    let ss_res = (y - x * beta).norm_squared();
    let ss_tot = y.add_scalar(-y.mean()).norm_squared();

    if ss_tot <= f64::EPSILON {
        return if ss_res <= f64::EPSILON { 1.0 } else { 0.0 };
    }
    1.0 - ss_res / ss_tot
}
