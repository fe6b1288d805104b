//! # Sparsity Update Scheduling
//!
//! Policies deciding, at each validation checkpoint, whether the model
//! should commit a new sparsity mask. The decision is separate from the
//! mask computation itself: the training loop asks the policy, and only on
//! a true answer runs the model's estimator and replaces the masks.

use std::path::{Path, PathBuf};

use crate::error::DiscoveryError;
use crate::model::Regressor;
use crate::DiscoveryResult;

/// Mask-update decision policy, consulted at validation checkpoints only.
pub trait SparsityPolicy {
    /// Bind the directory used for weight snapshots, once before training.
    fn set_checkpoint_dir(&mut self, dir: &Path);

    /// Decide whether a new mask should be committed now.
    ///
    /// `validation_loss` is the held-out MSE summed across features. The
    /// policy may snapshot or restore model weights but must not touch the
    /// masks itself.
    fn decide(
        &mut self,
        iteration: usize,
        validation_loss: f64,
        model: &mut dyn Regressor,
    ) -> DiscoveryResult<bool>;
}

impl SparsityPolicy for Box<dyn SparsityPolicy> {
    fn set_checkpoint_dir(&mut self, dir: &Path) {
        (**self).set_checkpoint_dir(dir)
    }

    fn decide(
        &mut self,
        iteration: usize,
        validation_loss: f64,
        model: &mut dyn Regressor,
    ) -> DiscoveryResult<bool> {
        (**self).decide(iteration, validation_loss, model)
    }
}

/// Fixed-cadence schedule: update after a burn-in, then at a fixed
/// iteration period.
#[derive(Debug, Clone)]
pub struct PeriodicSchedule {
    burn_in: usize,
    period: usize,
}

impl PeriodicSchedule {
    pub fn new(burn_in: usize, period: usize) -> Self {
        Self {
            burn_in,
            period: period.max(1),
        }
    }
}

impl SparsityPolicy for PeriodicSchedule {
    fn set_checkpoint_dir(&mut self, _dir: &Path) {}

    fn decide(
        &mut self,
        iteration: usize,
        validation_loss: f64,
        _model: &mut dyn Regressor,
    ) -> DiscoveryResult<bool> {
        if !validation_loss.is_finite() {
            return Err(DiscoveryError::Contract(format!(
                "non-finite validation loss {} at iteration {}",
                validation_loss, iteration
            )));
        }
        Ok(iteration >= self.burn_in && (iteration - self.burn_in) % self.period == 0)
    }
}

/// Validation-plateau schedule.
///
/// Tracks the best held-out loss, snapshotting model weights on every
/// improvement. Once no improvement has been seen for `patience`
/// iterations, the best weights are restored and a mask update is
/// triggered; the tracker then restarts from the current checkpoint.
#[derive(Debug)]
pub struct TrainTestSchedule {
    patience: usize,
    delta: f64,
    best_loss: f64,
    best_iteration: Option<usize>,
    checkpoint_dir: Option<PathBuf>,
    snapshot_taken: bool,
}

impl TrainTestSchedule {
    pub fn new(patience: usize, delta: f64) -> Self {
        Self {
            patience,
            delta,
            best_loss: f64::INFINITY,
            best_iteration: None,
            checkpoint_dir: None,
            snapshot_taken: false,
        }
    }

    fn snapshot_path(&self) -> Option<PathBuf> {
        self.checkpoint_dir
            .as_ref()
            .map(|d| d.join("best_model.safetensors"))
    }
}

impl SparsityPolicy for TrainTestSchedule {
    fn set_checkpoint_dir(&mut self, dir: &Path) {
        self.checkpoint_dir = Some(dir.to_path_buf());
    }

    fn decide(
        &mut self,
        iteration: usize,
        validation_loss: f64,
        model: &mut dyn Regressor,
    ) -> DiscoveryResult<bool> {
        if !validation_loss.is_finite() {
            return Err(DiscoveryError::Contract(format!(
                "non-finite validation loss {} at iteration {}",
                validation_loss, iteration
            )));
        }

        if validation_loss < self.best_loss - self.delta || self.best_iteration.is_none() {
            self.best_loss = validation_loss;
            self.best_iteration = Some(iteration);
            if let Some(path) = self.snapshot_path() {
                model.save_weights(&path)?;
                self.snapshot_taken = true;
            }
            return Ok(false);
        }

        let best_iteration = self.best_iteration.unwrap_or(0);
        if iteration.saturating_sub(best_iteration) >= self.patience {
            if self.snapshot_taken {
                if let Some(path) = self.snapshot_path() {
                    model.load_weights(&path)?;
                    log::info!(
                        "Restored best weights from iteration {} before mask update",
                        best_iteration
                    );
                }
            }
            // Restart the tracker: the loss landscape changes once the
            // mask is replaced.
            self.best_loss = f64::INFINITY;
            self.best_iteration = Some(iteration);
            return Ok(true);
        }

        Ok(false)
    }
}
