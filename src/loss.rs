//! # Loss Composition and Epoch Aggregation
//!
//! Per batch, the composer produces three per-feature components:
//!
//! - fitting: mean squared error between prediction and target, reduced
//!   over the sample axis only
//! - regularization: mean squared residual of
//!   `time_derivative - theta . coeffs` under the current coefficients
//! - total: their sum (equal to fitting in fitting-only mode, where the
//!   regularization component is exactly zero)
//!
//! [`BatchLossRecord`] is the 3 x F x B loss tensor of one iteration. It is
//! rebuilt fresh every iteration and reduced by [`BatchLossRecord::epoch_mean`]
//! into per-feature epoch vectors; every batch contributes equally to the
//! mean regardless of its size.

use candle_core::{DType, Tensor};
use ndarray::{Array1, Array2, Axis};

use crate::model::RegressorOutput;
use crate::DiscoveryResult;

/// Per-feature loss components of a single batch, kept as graph tensors so
/// the total can be backpropagated.
#[derive(Debug, Clone)]
pub struct LossComponents {
    /// Total loss per feature, shape (F,)
    pub total: Tensor,
    /// Fitting (MSE) loss per feature, shape (F,)
    pub fitting: Tensor,
    /// Regularization loss per feature, shape (F,)
    pub regularization: Tensor,
}

impl LossComponents {
    /// Scalar training objective: total loss summed over features.
    pub fn objective(&self) -> DiscoveryResult<Tensor> {
        Ok(self.total.sum_all()?)
    }
}

/// Composes batch losses from regressor outputs.
#[derive(Debug, Clone, Copy)]
pub struct LossComposer {
    /// Disable the physics-consistency term.
    pub only_fitting: bool,
}

impl LossComposer {
    pub fn new(only_fitting: bool) -> Self {
        Self { only_fitting }
    }

    /// Compose per-feature losses for one batch.
    ///
    /// `coeffs` are the active coefficient vectors (full library width,
    /// zeros at inactive columns) and `active_counts` the number of active
    /// columns per feature. A feature with zero active columns contributes
    /// an exactly-zero regularization term.
    pub fn compose(
        &self,
        output: &RegressorOutput,
        targets: &Tensor,
        coeffs: &[Vec<f64>],
        active_counts: &[usize],
    ) -> DiscoveryResult<LossComponents> {
        let device = output.prediction.device();
        let n_features = output.time_derivs.len();

        let fitting = (&output.prediction - targets)?.sqr()?.mean(0)?;

        if self.only_fitting {
            let zeros = Tensor::zeros(n_features, DType::F64, device)?;
            return Ok(LossComponents {
                total: fitting.clone(),
                fitting,
                regularization: zeros,
            });
        }

        let mut reg_terms = Vec::with_capacity(n_features);
        for f in 0..n_features {
            if active_counts[f] == 0 {
                // Fully sparse mask: no columns, no contribution.
                reg_terms.push(Tensor::zeros((), DType::F64, device)?);
                continue;
            }
            let width = coeffs[f].len();
            let coeff = Tensor::from_vec(coeffs[f].clone(), (width, 1), device)?;
            let fit = output.thetas[f].matmul(&coeff)?;
            let residual = (&output.time_derivs[f] - &fit)?;
            reg_terms.push(residual.sqr()?.mean_all()?);
        }
        let regularization = Tensor::stack(&reg_terms, 0)?;
        let total = (&fitting + &regularization)?;

        Ok(LossComponents {
            total,
            fitting,
            regularization,
        })
    }
}

/// Epoch-level reduction of a [`BatchLossRecord`]: unweighted means over
/// the batch axis.
#[derive(Debug, Clone)]
pub struct EpochSummary {
    /// Mean total loss per feature
    pub total: Array1<f64>,
    /// Mean fitting loss per feature
    pub fitting: Array1<f64>,
    /// Mean regularization loss per feature
    pub regularization: Array1<f64>,
}

impl EpochSummary {
    /// Mean total loss across features, the headline scalar for logging.
    pub fn mean_total(&self) -> f64 {
        if self.total.is_empty() {
            0.0
        } else {
            self.total.sum() / self.total.len() as f64
        }
    }
}

/// The 3 x F x B loss tensor of one training iteration.
///
/// Entries start at a NaN sentinel and must all be overwritten by the batch
/// loop before reduction; the record carries no state across iterations.
#[derive(Debug, Clone)]
pub struct BatchLossRecord {
    totals: Array2<f64>,
    fitting: Array2<f64>,
    regularization: Array2<f64>,
}

impl BatchLossRecord {
    /// Allocate a record for `n_features` x `n_batches`, NaN-initialized.
    pub fn new(n_features: usize, n_batches: usize) -> Self {
        Self {
            totals: Array2::from_elem((n_features, n_batches), f64::NAN),
            fitting: Array2::from_elem((n_features, n_batches), f64::NAN),
            regularization: Array2::from_elem((n_features, n_batches), f64::NAN),
        }
    }

    /// Record shape as (components, features, batches).
    pub fn shape(&self) -> (usize, usize, usize) {
        (3, self.totals.nrows(), self.totals.ncols())
    }

    /// Store one batch's components at `batch_idx`.
    pub fn record(&mut self, batch_idx: usize, components: &LossComponents) -> DiscoveryResult<()> {
        let total = components.total.to_vec1::<f64>()?;
        let fitting = components.fitting.to_vec1::<f64>()?;
        let regularization = components.regularization.to_vec1::<f64>()?;

        for f in 0..self.totals.nrows() {
            self.totals[[f, batch_idx]] = total[f];
            self.fitting[[f, batch_idx]] = fitting[f];
            self.regularization[[f, batch_idx]] = regularization[f];
        }
        Ok(())
    }

    /// Whether every entry has been overwritten with a finite value.
    pub fn is_complete(&self) -> bool {
        self.totals.iter().all(|v| v.is_finite())
            && self.fitting.iter().all(|v| v.is_finite())
            && self.regularization.iter().all(|v| v.is_finite())
    }

    /// Unweighted mean over the batch axis.
    pub fn epoch_mean(&self) -> EpochSummary {
        EpochSummary {
            total: self.totals.mean_axis(Axis(1)).unwrap_or_default(),
            fitting: self.fitting.mean_axis(Axis(1)).unwrap_or_default(),
            regularization: self.regularization.mean_axis(Axis(1)).unwrap_or_default(),
        }
    }
}
