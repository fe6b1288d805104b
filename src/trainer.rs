//! # Training Loop Orchestration
//!
//! Drives the alternating procedure at the heart of equation discovery:
//! gradient-based optimization of the function approximator, periodic
//! held-out validation, scheduled sparsity-mask commits, and a statistical
//! stopping rule.
//!
//! Each iteration trains over every batch (one optimizer step per batch, in
//! presentation order). At iterations where `iteration % write_iterations
//! == 0` the loop walks an explicit checkpoint state machine:
//!
//! ```text
//! RUNNING -> VALIDATING -> SPARSITY_DECIDING -> CONVERGENCE_CHECKING -> RUNNING
//!                  \ (sparsity disabled) ------^            \-> TERMINATED
//! ```
//!
//! Mask commits reuse the candidate matrices and time derivatives of the
//! last completed training batch instead of a fresh pass over the training
//! set; the loader's stable traversal order keeps that choice
//! deterministic.

use candle_nn::Optimizer;
use ndarray::{Array1, Array2, Axis};
use std::path::PathBuf;

use crate::config::TrainConfig;
use crate::convergence::ConvergencePolicy;
use crate::data::{BatchLoader, FieldBatch};
use crate::error::DiscoveryError;
use crate::export::export_final_batch;
use crate::loss::{BatchLossRecord, EpochSummary, LossComposer};
use crate::metrics::MetricsLogger;
use crate::model::{Regressor, RegressorOutput};
use crate::sparsity::SparsityPolicy;
use crate::DiscoveryResult;

/// Checkpoint-time phases of the training loop state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Validating,
    SparsityDeciding,
    ConvergenceChecking,
}

/// Summary of a finished run.
#[derive(Debug)]
pub struct TrainReport {
    /// Iterations actually executed.
    pub iterations_run: usize,
    /// Iterations at which a checkpoint (validation, logging, sparsity
    /// decision, convergence check) occurred.
    pub checkpoints: Vec<usize>,
    /// Whether the convergence monitor terminated the run (false means the
    /// iteration budget was exhausted).
    pub converged: bool,
    /// Epoch summary of the final iteration.
    pub final_summary: Option<EpochSummary>,
    /// Batch loss record of the final iteration.
    pub final_record: Option<BatchLossRecord>,
    /// Run directory of the logging sink.
    pub log_dir: PathBuf,
}

/// Training loop orchestrator.
///
/// Owns the model, optimizer, schedules, and logging sink for one run.
/// Model state is mutated only through the batch trainer (optimizer steps)
/// and mask commits; the orchestrator itself never touches parameters.
pub struct Trainer<M, O, S, C> {
    model: M,
    optimizer: O,
    sparsity: S,
    convergence: C,
    config: TrainConfig,
    logger: MetricsLogger,
}

impl<M, O, S, C> Trainer<M, O, S, C>
where
    M: Regressor,
    O: Optimizer,
    S: SparsityPolicy,
    C: ConvergencePolicy,
{
    /// Create a trainer with a logging sink derived from the configuration.
    pub fn new(
        model: M,
        optimizer: O,
        sparsity: S,
        convergence: C,
        config: TrainConfig,
    ) -> DiscoveryResult<Self> {
        config.validate().map_err(DiscoveryError::Config)?;
        let logger = MetricsLogger::new(config.output_dir.as_deref(), config.run_id.as_deref())?;
        Ok(Self {
            model,
            optimizer,
            sparsity,
            convergence,
            config,
            logger,
        })
    }

    /// Create a trainer with an explicit logging sink (tests use a
    /// disabled logger).
    pub fn with_logger(
        model: M,
        optimizer: O,
        sparsity: S,
        convergence: C,
        config: TrainConfig,
        logger: MetricsLogger,
    ) -> DiscoveryResult<Self> {
        config.validate().map_err(DiscoveryError::Config)?;
        Ok(Self {
            model,
            optimizer,
            sparsity,
            convergence,
            config,
            logger,
        })
    }

    /// The trained model.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Consume the trainer and hand back the model.
    pub fn into_model(self) -> M {
        self.model
    }

    /// Run the full training loop.
    pub fn run(
        &mut self,
        train: &mut BatchLoader,
        test: &mut BatchLoader,
    ) -> DiscoveryResult<TrainReport> {
        if train.is_empty() {
            return Err(DiscoveryError::Config("training set is empty".to_string()));
        }
        if train.n_features() != self.model.n_features() {
            return Err(DiscoveryError::DimensionMismatch {
                expected: self.model.n_features(),
                got: train.n_features(),
            });
        }

        // The sparsity schedule shares the run directory with the logs.
        if self.logger.is_enabled() {
            let log_dir = self.logger.log_dir().to_path_buf();
            self.sparsity.set_checkpoint_dir(&log_dir);

            let config_json = serde_json::to_string_pretty(&self.config)
                .map_err(|e| DiscoveryError::Serialization(e.to_string()))?;
            std::fs::write(log_dir.join("config.json"), config_json)?;
        }

        let composer = LossComposer::new(self.config.only_fitting);

        let mut checkpoints = Vec::new();
        let mut converged = false;
        let mut iterations_run = 0;
        let mut last_summary: Option<EpochSummary> = None;
        let mut last_record: Option<BatchLossRecord> = None;
        let mut last_batch: Option<(FieldBatch, RegressorOutput)> = None;

        for iteration in 0..self.config.max_iterations {
            iterations_run = iteration + 1;

            let (record, batch_ctx) = self.train_iteration(iteration, train, &composer)?;
            let summary = record.epoch_mean();
            last_record = Some(record);

            if iteration % self.config.write_iterations == 0 {
                checkpoints.push(iteration);
                converged = self.checkpoint(iteration, &summary, &batch_ctx, test)?;
            }

            last_batch = Some(batch_ctx);
            last_summary = Some(summary);
            if converged {
                log::info!("Converged at iteration {}", iteration);
                break;
            }
        }

        if let Some((batch, output)) = &last_batch {
            if self.logger.is_enabled() {
                if let Err(e) = export_final_batch(
                    self.logger.log_dir(),
                    &batch.coords,
                    &output.prediction,
                    &batch.targets,
                ) {
                    log::warn!("Final-batch export failed: {}", e);
                }
            }
        }
        self.logger.close()?;

        Ok(TrainReport {
            iterations_run,
            checkpoints,
            converged,
            final_summary: last_summary,
            final_record: last_record,
            log_dir: self.logger.log_dir().to_path_buf(),
        })
    }

    /// One training iteration: a full pass over the training batches with
    /// exactly one optimizer step per batch, in presentation order.
    fn train_iteration(
        &mut self,
        iteration: usize,
        train: &mut BatchLoader,
        composer: &LossComposer,
    ) -> DiscoveryResult<(BatchLossRecord, (FieldBatch, RegressorOutput))> {
        train.reset();
        let n_features = self.model.n_features();
        let mut record = BatchLossRecord::new(n_features, train.num_batches());
        let mut last: Option<(FieldBatch, RegressorOutput)> = None;

        let mut batch_idx = 0;
        while let Some(batch) = train.next() {
            let batch = batch?;
            let output = self.model.forward(&batch.coords)?;

            let coeffs = self
                .model
                .constraint_coeffs(false, self.config.sparsity_update);
            let active = self.active_counts();
            let losses = composer.compose(&output, &batch.targets, &coeffs, &active)?;

            let objective = losses.objective()?;
            if !objective.to_scalar::<f64>()?.is_finite() {
                return Err(DiscoveryError::NonFinite {
                    iteration,
                    batch: batch_idx,
                });
            }

            let grads = objective.backward()?;
            self.optimizer.step(&grads)?;

            record.record(batch_idx, &losses)?;
            last = Some((batch, output));
            batch_idx += 1;
        }

        let last = last.ok_or_else(|| {
            DiscoveryError::Config("training loader produced no batches".to_string())
        })?;
        Ok((record, last))
    }

    /// Walk the checkpoint state machine. Returns true when the
    /// convergence monitor signals termination.
    fn checkpoint(
        &mut self,
        iteration: usize,
        summary: &EpochSummary,
        last_batch: &(FieldBatch, RegressorOutput),
        test: &mut BatchLoader,
    ) -> DiscoveryResult<bool> {
        let (_, output) = last_batch;
        let mut test_mse = Array1::zeros(0);
        let mut phase = Phase::Validating;

        loop {
            phase = match phase {
                Phase::Validating => {
                    test_mse = self.validate(test)?;

                    // Run the estimator for logging only; the mask is not
                    // touched here.
                    self.model
                        .sparse_estimator(&output.thetas, &output.time_derivs)?;

                    let sparse = self.config.sparsity_update;
                    self.logger.log_checkpoint(
                        iteration,
                        summary.mean_total(),
                        summary.fitting.as_slice().unwrap_or(&[]),
                        summary.regularization.as_slice().unwrap_or(&[]),
                        &self.model.constraint_coeffs(true, sparse),
                        &self.model.constraint_coeffs(false, sparse),
                        &self.model.estimator_coeffs(),
                        test_mse.as_slice().unwrap_or(&[]),
                    )?;

                    if self.config.sparsity_update {
                        Phase::SparsityDeciding
                    } else {
                        Phase::ConvergenceChecking
                    }
                }
                Phase::SparsityDeciding => {
                    let loss_sum = test_mse.sum();
                    if self.sparsity.decide(iteration, loss_sum, &mut self.model)? {
                        let masks = self
                            .model
                            .sparse_estimator(&output.thetas, &output.time_derivs)?;
                        self.model.set_sparsity_masks(masks)?;
                        log::info!("Committed new sparsity mask at iteration {}", iteration);
                    }
                    Phase::ConvergenceChecking
                }
                Phase::ConvergenceChecking => {
                    let statistic = self.monitored_statistic();
                    return self.convergence.converged(iteration, statistic);
                }
            };
        }
    }

    /// Held-out evaluation: per-feature MSE of the function approximation
    /// alone, averaged over the held-out batches. Touches no model state.
    fn validate(&mut self, test: &mut BatchLoader) -> DiscoveryResult<Array1<f64>> {
        if test.is_empty() {
            return Err(DiscoveryError::Config(
                "held-out set is empty; adjust the train/test split".to_string(),
            ));
        }

        let n_features = self.model.n_features();
        test.reset();
        let mut per_batch = Array2::zeros((n_features, test.num_batches()));

        let mut batch_idx = 0;
        while let Some(batch) = test.next() {
            let batch = batch?;
            let got = batch.targets.dims()[1];
            if got != n_features {
                return Err(DiscoveryError::DimensionMismatch {
                    expected: n_features,
                    got,
                });
            }

            let prediction = self.model.predict(&batch.coords)?;
            let mse = (&prediction - &batch.targets)?
                .sqr()?
                .mean(0)?
                .to_vec1::<f64>()?;
            for f in 0..n_features {
                per_batch[[f, batch_idx]] = mse[f];
            }
            batch_idx += 1;
        }

        Ok(per_batch.mean_axis(Axis(1)).unwrap_or_default())
    }

    /// Convergence statistic: L1 norm of all features' scaled coefficient
    /// vectors, masked when sparsity updates are enabled.
    fn monitored_statistic(&self) -> f64 {
        self.model
            .constraint_coeffs(true, self.config.sparsity_update)
            .iter()
            .flat_map(|v| v.iter())
            .map(|c| c.abs())
            .sum()
    }

    /// Active library columns per feature under the current mode.
    fn active_counts(&self) -> Vec<usize> {
        if self.config.sparsity_update {
            self.model
                .sparsity_masks()
                .iter()
                .map(|m| m.iter().filter(|&&b| b).count())
                .collect()
        } else {
            vec![self.model.library_width(); self.model.n_features()]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::FieldDataset;
    use candle_core::{DType, Device, Tensor, Var};
    use candle_nn::{AdamW, ParamsAdamW};
    use std::cell::RefCell;
    use std::path::Path;
    use std::rc::Rc;

    const WIDTH: usize = 3;

    /// Linear test double: prediction = coords . weight, constant thetas
    /// and time derivatives, scripted estimator masks.
    struct MockRegressor {
        weight: Var,
        n_features: usize,
        masks: Vec<Vec<bool>>,
        estimator_output: Vec<Vec<bool>>,
        mask_commits: Rc<RefCell<Vec<Vec<Vec<bool>>>>>,
    }

    impl MockRegressor {
        fn new(n_features: usize) -> Self {
            let weight =
                Var::zeros((1, n_features), DType::F64, &Device::Cpu).unwrap();
            Self {
                weight,
                n_features,
                masks: vec![vec![true; WIDTH]; n_features],
                estimator_output: vec![vec![true, false, true]; n_features],
                mask_commits: Rc::new(RefCell::new(Vec::new())),
            }
        }

        fn optimizer(&self) -> AdamW {
            AdamW::new(
                vec![self.weight.clone()],
                ParamsAdamW {
                    lr: 1e-2,
                    ..ParamsAdamW::default()
                },
            )
            .unwrap()
        }
    }

    impl Regressor for MockRegressor {
        fn forward(&mut self, coords: &Tensor) -> DiscoveryResult<RegressorOutput> {
            let n = coords.dims()[0];
            let prediction = coords.matmul(self.weight.as_tensor())?;
            let time_derivs = (0..self.n_features)
                .map(|_| Tensor::zeros((n, 1), DType::F64, &Device::Cpu).unwrap())
                .collect();
            let thetas = (0..self.n_features)
                .map(|_| Tensor::ones((n, WIDTH), DType::F64, &Device::Cpu).unwrap())
                .collect();
            Ok(RegressorOutput {
                prediction,
                time_derivs,
                thetas,
            })
        }

        fn predict(&self, coords: &Tensor) -> DiscoveryResult<Tensor> {
            Ok(coords.matmul(self.weight.as_tensor())?.detach())
        }

        fn constraint_coeffs(&self, scaled: bool, _sparse: bool) -> Vec<Vec<f64>> {
            let value = if scaled { 0.5 } else { 0.0 };
            vec![vec![value; WIDTH]; self.n_features]
        }

        fn sparse_estimator(
            &mut self,
            _thetas: &[Tensor],
            _time_derivs: &[Tensor],
        ) -> DiscoveryResult<Vec<Vec<bool>>> {
            Ok(self.estimator_output.clone())
        }

        fn estimator_coeffs(&self) -> Vec<Vec<f64>> {
            Vec::new()
        }

        fn set_sparsity_masks(&mut self, masks: Vec<Vec<bool>>) -> DiscoveryResult<()> {
            self.mask_commits.borrow_mut().push(masks.clone());
            self.masks = masks;
            Ok(())
        }

        fn sparsity_masks(&self) -> &[Vec<bool>] {
            &self.masks
        }

        fn save_weights(&self, _path: &Path) -> DiscoveryResult<()> {
            Ok(())
        }

        fn load_weights(&mut self, _path: &Path) -> DiscoveryResult<()> {
            Ok(())
        }

        fn n_features(&self) -> usize {
            self.n_features
        }

        fn library_width(&self) -> usize {
            WIDTH
        }
    }

    /// Sparsity policy that fires at scripted iterations and records calls.
    struct ScriptedSparsity {
        fire_at: Vec<usize>,
        calls: Rc<RefCell<Vec<usize>>>,
    }

    impl SparsityPolicy for ScriptedSparsity {
        fn set_checkpoint_dir(&mut self, _dir: &Path) {}
        fn decide(
            &mut self,
            iteration: usize,
            _validation_loss: f64,
            _model: &mut dyn Regressor,
        ) -> DiscoveryResult<bool> {
            self.calls.borrow_mut().push(iteration);
            Ok(self.fire_at.contains(&iteration))
        }
    }

    /// Convergence policy that stops at a scripted iteration.
    struct ScriptedConvergence {
        stop_at: Option<usize>,
        calls: Rc<RefCell<Vec<usize>>>,
    }

    impl ConvergencePolicy for ScriptedConvergence {
        fn converged(&mut self, iteration: usize, _statistic: f64) -> DiscoveryResult<bool> {
            self.calls.borrow_mut().push(iteration);
            Ok(self.stop_at == Some(iteration))
        }
    }

    fn loaders(n_features: usize) -> (BatchLoader, BatchLoader) {
        let rates: Vec<f64> = (0..n_features).map(|i| 0.5 + i as f64).collect();
        let dataset = FieldDataset::synthetic_decay(50, &rates, 0.0, 42);
        let (train, test) = dataset.train_test_split(0.8);
        (
            train.loader(16, Device::Cpu),
            test.loader(16, Device::Cpu),
        )
    }

    fn scripted_trainer(
        n_features: usize,
        config: TrainConfig,
        fire_at: Vec<usize>,
        stop_at: Option<usize>,
    ) -> (
        Trainer<MockRegressor, AdamW, ScriptedSparsity, ScriptedConvergence>,
        Rc<RefCell<Vec<usize>>>,
        Rc<RefCell<Vec<usize>>>,
        Rc<RefCell<Vec<Vec<Vec<bool>>>>>,
    ) {
        let model = MockRegressor::new(n_features);
        let optimizer = model.optimizer();
        let commits = model.mask_commits.clone();
        let sparsity_calls = Rc::new(RefCell::new(Vec::new()));
        let convergence_calls = Rc::new(RefCell::new(Vec::new()));

        let trainer = Trainer::with_logger(
            model,
            optimizer,
            ScriptedSparsity {
                fire_at,
                calls: sparsity_calls.clone(),
            },
            ScriptedConvergence {
                stop_at,
                calls: convergence_calls.clone(),
            },
            config,
            MetricsLogger::disabled(),
        )
        .unwrap();
        (trainer, sparsity_calls, convergence_calls, commits)
    }

    #[test]
    fn test_checkpoint_cadence() {
        let config = TrainConfig {
            max_iterations: 100,
            write_iterations: 25,
            ..TrainConfig::default()
        };
        let (mut trainer, sparsity_calls, convergence_calls, _) =
            scripted_trainer(1, config, vec![], None);
        let (mut train, mut test) = loaders(1);

        let report = trainer.run(&mut train, &mut test).unwrap();
        assert_eq!(report.checkpoints, vec![0, 25, 50, 75]);
        assert_eq!(report.iterations_run, 100);
        assert!(!report.converged);
        assert_eq!(*sparsity_calls.borrow(), vec![0, 25, 50, 75]);
        assert_eq!(*convergence_calls.borrow(), vec![0, 25, 50, 75]);
    }

    #[test]
    fn test_convergence_stops_immediately() {
        let config = TrainConfig {
            max_iterations: 100,
            write_iterations: 25,
            ..TrainConfig::default()
        };
        let (mut trainer, _, convergence_calls, _) = scripted_trainer(1, config, vec![], Some(50));
        let (mut train, mut test) = loaders(1);

        let report = trainer.run(&mut train, &mut test).unwrap();
        assert!(report.converged);
        assert_eq!(report.iterations_run, 51);
        assert_eq!(report.checkpoints, vec![0, 25, 50]);
        assert_eq!(*convergence_calls.borrow(), vec![0, 25, 50]);
    }

    #[test]
    fn test_sparsity_disabled_never_touches_masks() {
        let config = TrainConfig {
            max_iterations: 50,
            write_iterations: 10,
            sparsity_update: false,
            ..TrainConfig::default()
        };
        let (mut trainer, sparsity_calls, _, commits) =
            scripted_trainer(1, config, vec![0, 10, 20], None);
        let (mut train, mut test) = loaders(1);

        trainer.run(&mut train, &mut test).unwrap();
        assert!(sparsity_calls.borrow().is_empty());
        assert!(commits.borrow().is_empty());
        assert!(trainer.model().sparsity_masks()[0].iter().all(|&b| b));
    }

    #[test]
    fn test_mask_commit_replaces_wholesale() {
        let config = TrainConfig {
            max_iterations: 30,
            write_iterations: 10,
            ..TrainConfig::default()
        };
        let (mut trainer, _, _, commits) = scripted_trainer(2, config, vec![10], None);
        let (mut train, mut test) = loaders(2);

        trainer.run(&mut train, &mut test).unwrap();

        let commits = commits.borrow();
        assert_eq!(commits.len(), 1);
        // The committed mask is exactly the estimator output, not a merge
        // with the previous all-true mask.
        assert_eq!(commits[0], vec![vec![true, false, true]; 2]);
        assert_eq!(trainer.model().sparsity_masks()[0], vec![true, false, true]);
    }

    #[test]
    fn test_record_shape_and_completeness() {
        let config = TrainConfig {
            max_iterations: 5,
            write_iterations: 5,
            ..TrainConfig::default()
        };
        let (mut trainer, _, _, _) = scripted_trainer(2, config, vec![], None);
        let (mut train, mut test) = loaders(2);

        let n_batches = train.num_batches();
        let report = trainer.run(&mut train, &mut test).unwrap();

        let record = report.final_record.unwrap();
        assert_eq!(record.shape(), (3, 2, n_batches));
        assert!(record.is_complete());
    }

    #[test]
    fn test_only_fitting_zero_regularization() {
        let config = TrainConfig {
            max_iterations: 10,
            write_iterations: 5,
            only_fitting: true,
            ..TrainConfig::default()
        };
        let (mut trainer, _, _, _) = scripted_trainer(2, config, vec![], None);
        let (mut train, mut test) = loaders(2);

        let report = trainer.run(&mut train, &mut test).unwrap();
        let summary = report.final_summary.unwrap();
        assert!(summary.regularization.iter().all(|&v| v == 0.0));
        for (t, f) in summary.total.iter().zip(summary.fitting.iter()) {
            assert_eq!(t, f);
        }
    }

    #[test]
    fn test_empty_held_out_set_is_config_error() {
        let config = TrainConfig {
            max_iterations: 10,
            write_iterations: 5,
            ..TrainConfig::default()
        };
        let (mut trainer, _, _, _) = scripted_trainer(1, config, vec![], None);

        let dataset = FieldDataset::synthetic_decay(40, &[1.0], 0.0, 42);
        let (train, test) = dataset.train_test_split(1.0);
        let mut train = train.loader(16, Device::Cpu);
        let mut test = test.loader(16, Device::Cpu);

        let err = trainer.run(&mut train, &mut test).unwrap_err();
        assert!(matches!(err, DiscoveryError::Config(_)));
    }

    #[test]
    fn test_feature_mismatch_is_error() {
        let config = TrainConfig {
            max_iterations: 10,
            write_iterations: 5,
            ..TrainConfig::default()
        };
        let (mut trainer, _, _, _) = scripted_trainer(2, config, vec![], None);

        let train_set = FieldDataset::synthetic_decay(40, &[1.0, 2.0], 0.0, 42);
        let test_set = FieldDataset::synthetic_decay(10, &[1.0], 0.0, 43);
        let mut train = train_set.loader(16, Device::Cpu);
        let mut test = test_set.loader(16, Device::Cpu);

        let err = trainer.run(&mut train, &mut test).unwrap_err();
        assert!(matches!(err, DiscoveryError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_zero_write_iterations_rejected_at_construction() {
        let model = MockRegressor::new(1);
        let optimizer = model.optimizer();
        let config = TrainConfig {
            write_iterations: 0,
            ..TrainConfig::default()
        };
        let result = Trainer::with_logger(
            model,
            optimizer,
            ScriptedSparsity {
                fire_at: vec![],
                calls: Rc::new(RefCell::new(Vec::new())),
            },
            ScriptedConvergence {
                stop_at: None,
                calls: Rc::new(RefCell::new(Vec::new())),
            },
            config,
            MetricsLogger::disabled(),
        );
        assert!(result.is_err());
    }
}
