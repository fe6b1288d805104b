//! # Field Datasets and Batch Loading
//!
//! Samples are (coordinates, targets) pairs: coordinate rows are `(t, x, ...)`
//! tuples with the time coordinate first, target rows are feature vectors
//! index-aligned with the coordinates.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pde_discovery::data::FieldDataset;
//!
//! let dataset = FieldDataset::synthetic_decay(512, &[1.0, 0.5], 0.01, 42);
//! let (train, test) = dataset.train_test_split(0.8);
//! let loader = train.loader(64, Device::Cpu);
//! for batch in loader {
//!     // batch.coords: [batch_size, n_dims], batch.targets: [batch_size, n_features]
//! }
//! ```

use candle_core::{Device, Tensor};
use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::DiscoveryError;
use crate::DiscoveryResult;

/// A dataset of coordinate / target pairs stored on the host.
#[derive(Debug, Clone)]
pub struct FieldDataset {
    /// Sample coordinates, shape (n_samples, n_dims), time first.
    coords: Array2<f64>,
    /// Target feature vectors, shape (n_samples, n_features).
    targets: Array2<f64>,
}

impl FieldDataset {
    /// Create a dataset from coordinate and target arrays.
    ///
    /// The arrays must agree on the number of samples.
    pub fn new(coords: Array2<f64>, targets: Array2<f64>) -> DiscoveryResult<Self> {
        if coords.nrows() != targets.nrows() {
            return Err(DiscoveryError::DimensionMismatch {
                expected: coords.nrows(),
                got: targets.nrows(),
            });
        }
        if coords.ncols() == 0 {
            return Err(DiscoveryError::Config(
                "coordinates need at least a time column".to_string(),
            ));
        }
        Ok(Self { coords, targets })
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.coords.nrows()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.coords.nrows() == 0
    }

    /// Number of coordinate dimensions (time included)
    pub fn n_dims(&self) -> usize {
        self.coords.ncols()
    }

    /// Number of output features
    pub fn n_features(&self) -> usize {
        self.targets.ncols()
    }

    /// Coordinate array, shape (n_samples, n_dims)
    pub fn coords(&self) -> &Array2<f64> {
        &self.coords
    }

    /// Target array, shape (n_samples, n_features)
    pub fn targets(&self) -> &Array2<f64> {
        &self.targets
    }

    /// Split into train and held-out sets.
    ///
    /// The split is contiguous and deterministic: the first `split` fraction
    /// of samples goes to the train set. Loaders built from either half
    /// therefore produce identical batch sequences on every traversal.
    pub fn train_test_split(&self, split: f64) -> (Self, Self) {
        let n_train = ((self.len() as f64) * split).round() as usize;
        let n_train = n_train.min(self.len());

        let (train_coords, test_coords) = self.coords.view().split_at(Axis(0), n_train);
        let (train_targets, test_targets) = self.targets.view().split_at(Axis(0), n_train);

        let train = Self {
            coords: train_coords.to_owned(),
            targets: train_targets.to_owned(),
        };
        let test = Self {
            coords: test_coords.to_owned(),
            targets: test_targets.to_owned(),
        };
        (train, test)
    }

    /// Create a batch loader over this dataset.
    pub fn loader(&self, batch_size: usize, device: Device) -> BatchLoader {
        BatchLoader::new(self.clone(), batch_size, device)
    }

    /// Synthetic exponential-decay dataset for testing and demos.
    ///
    /// One feature per entry of `rates`: `u_i(t) = exp(-rate_i * t)` sampled
    /// on a uniform time grid over [0, 2], governed by `du/dt = -rate * u`.
    /// Gaussian-ish noise of amplitude `noise` is added from a seeded RNG.
    pub fn synthetic_decay(n_samples: usize, rates: &[f64], noise: f64, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let n_features = rates.len();

        let mut coords = Array2::zeros((n_samples, 1));
        let mut targets = Array2::zeros((n_samples, n_features));

        for i in 0..n_samples {
            let t = 2.0 * (i as f64) / ((n_samples - 1).max(1) as f64);
            coords[[i, 0]] = t;
            for (j, &rate) in rates.iter().enumerate() {
                let eps: f64 = rng.gen_range(-1.0..1.0);
                targets[[i, j]] = (-rate * t).exp() + noise * eps;
            }
        }

        Self { coords, targets }
    }

    /// Synthetic advected-wave dataset on a (t, x) grid.
    ///
    /// `u(t, x) = sin(x - speed * t) * exp(-damping * t)`, one feature,
    /// sampled on an `nt` x `nx` grid over t in [0, 1], x in [-pi, pi].
    pub fn synthetic_advection(
        nt: usize,
        nx: usize,
        speed: f64,
        damping: f64,
        noise: f64,
        seed: u64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let n = nt * nx;

        let mut coords = Array2::zeros((n, 2));
        let mut targets = Array2::zeros((n, 1));

        for it in 0..nt {
            let t = (it as f64) / ((nt - 1).max(1) as f64);
            for ix in 0..nx {
                let x = -std::f64::consts::PI
                    + 2.0 * std::f64::consts::PI * (ix as f64) / ((nx - 1).max(1) as f64);
                let row = it * nx + ix;
                let eps: f64 = rng.gen_range(-1.0..1.0);
                coords[[row, 0]] = t;
                coords[[row, 1]] = x;
                targets[[row, 0]] = (x - speed * t).sin() * (-damping * t).exp() + noise * eps;
            }
        }

        Self { coords, targets }
    }
}

/// A single batch moved onto the compute device.
#[derive(Debug, Clone)]
pub struct FieldBatch {
    /// Coordinates [batch_size, n_dims]
    pub coords: Tensor,
    /// Targets [batch_size, n_features]
    pub targets: Tensor,
}

/// Deterministic batch loader.
///
/// Batches are produced in the same stable order on every traversal; the
/// training loop relies on this when it reuses the last batch of an
/// iteration for mask estimation.
pub struct BatchLoader {
    dataset: FieldDataset,
    batch_size: usize,
    position: usize,
    device: Device,
}

impl BatchLoader {
    /// Create a new loader over a dataset.
    pub fn new(dataset: FieldDataset, batch_size: usize, device: Device) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            position: 0,
            device,
        }
    }

    /// Number of batches per traversal
    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Number of output features in the underlying dataset
    pub fn n_features(&self) -> usize {
        self.dataset.n_features()
    }

    /// Target compute device
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Whether the underlying dataset is empty
    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// Rewind to the start of the traversal.
    pub fn reset(&mut self) {
        self.position = 0;
    }

    fn make_batch(&self, start: usize, end: usize) -> DiscoveryResult<FieldBatch> {
        let n = end - start;
        let n_dims = self.dataset.n_dims();
        let n_features = self.dataset.n_features();

        let mut coord_data = Vec::with_capacity(n * n_dims);
        let mut target_data = Vec::with_capacity(n * n_features);
        for row in start..end {
            for col in 0..n_dims {
                coord_data.push(self.dataset.coords[[row, col]]);
            }
            for col in 0..n_features {
                target_data.push(self.dataset.targets[[row, col]]);
            }
        }

        let coords = Tensor::from_vec(coord_data, (n, n_dims), &self.device)?;
        let targets = Tensor::from_vec(target_data, (n, n_features), &self.device)?;
        Ok(FieldBatch { coords, targets })
    }
}

impl Iterator for BatchLoader {
    type Item = DiscoveryResult<FieldBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.dataset.len() {
            return None;
        }
        let start = self.position;
        let end = (start + self.batch_size).min(self.dataset.len());
        self.position = end;
        Some(self.make_batch(start, end))
    }
}
