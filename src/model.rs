//! # Regressor Model
//!
//! The [`Regressor`] trait is the seam between the training loop and the
//! model: the loop only ever asks for a forward evaluation (prediction, time
//! derivatives, candidate-term matrices), coefficient vectors consistent
//! with the current sparsity mask, and estimator-based mask proposals.
//!
//! [`DiscoveryModel`] is the concrete implementation: a tanh MLP function
//! approximator (candle, f64) whose derivatives are taken with central
//! finite-difference stencils of the network itself. Every stencil
//! evaluation is an ordinary forward pass, so the physics-consistency loss
//! backpropagates into the network parameters without second-order autodiff.

use candle_core::{DType, Device, Tensor};
use candle_nn::{linear, Linear, Module, VarBuilder, VarMap};
use ndarray::{Array1, Array2};
use std::path::Path;

use crate::error::DiscoveryError;
use crate::library::{column_norms, lstsq, masked_lstsq, LibrarySpec};
use crate::DiscoveryResult;

/// Output of one regressor forward evaluation.
#[derive(Debug, Clone)]
pub struct RegressorOutput {
    /// Function approximation [n_samples, n_features]
    pub prediction: Tensor,
    /// Per-feature time derivative, each [n_samples, 1]
    pub time_derivs: Vec<Tensor>,
    /// Per-feature candidate-term matrix, each [n_samples, width]
    pub thetas: Vec<Tensor>,
}

/// Capability interface of the regression model, as consumed by the
/// training loop. Substitutable with test doubles.
pub trait Regressor {
    /// Full forward evaluation on a coordinate batch. Refreshes the
    /// constraint coefficient vectors as a side effect.
    fn forward(&mut self, coords: &Tensor) -> DiscoveryResult<RegressorOutput>;

    /// Function-approximation output only, for held-out evaluation. Must
    /// not mutate any model state.
    fn predict(&self, coords: &Tensor) -> DiscoveryResult<Tensor>;

    /// Per-feature coefficient vectors from the last forward pass.
    ///
    /// `sparse` selects the masked fit (full-width, zeros at inactive
    /// columns); otherwise the dense full-width fit. `scaled` rescales each
    /// coefficient by its column norm over the time-derivative norm.
    fn constraint_coeffs(&self, scaled: bool, sparse: bool) -> Vec<Vec<f64>>;

    /// Propose per-feature sparsity masks from the given candidate matrices
    /// and time derivatives. Does not modify the active masks; the fitted
    /// estimator coefficients are retained for logging.
    fn sparse_estimator(
        &mut self,
        thetas: &[Tensor],
        time_derivs: &[Tensor],
    ) -> DiscoveryResult<Vec<Vec<bool>>>;

    /// Estimator coefficient vectors from the last estimator run, for
    /// logging. Empty before the first run.
    fn estimator_coeffs(&self) -> Vec<Vec<f64>>;

    /// Replace the active sparsity masks wholesale.
    fn set_sparsity_masks(&mut self, masks: Vec<Vec<bool>>) -> DiscoveryResult<()>;

    /// Current per-feature sparsity masks.
    fn sparsity_masks(&self) -> &[Vec<bool>];

    /// Snapshot trainable weights to a file (safetensors).
    fn save_weights(&self, path: &Path) -> DiscoveryResult<()>;

    /// Restore trainable weights from a file.
    fn load_weights(&mut self, path: &Path) -> DiscoveryResult<()>;

    /// Number of output features.
    fn n_features(&self) -> usize;

    /// Number of library columns per feature.
    fn library_width(&self) -> usize;
}

/// Configuration of the concrete discovery model.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelConfig {
    /// Coordinate dimensions (time included).
    pub n_dims: usize,
    /// Output features.
    pub n_features: usize,
    /// Hidden layer widths of the MLP.
    pub hidden: Vec<usize>,
    /// Candidate library shape.
    pub library: LibrarySpec,
    /// Finite-difference step for derivative stencils.
    pub fd_step: f64,
    /// Magnitude threshold of the sparse estimator.
    pub threshold: f64,
    /// Ridge stabilizer for the coefficient fits.
    pub ridge: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            n_dims: 1,
            n_features: 1,
            hidden: vec![32, 32],
            library: LibrarySpec::default(),
            fd_step: 1e-3,
            threshold: 0.1,
            ridge: 1e-8,
        }
    }
}

/// Tanh MLP function approximator.
struct Mlp {
    layers: Vec<Linear>,
}

impl Mlp {
    fn new(n_in: usize, hidden: &[usize], n_out: usize, vb: VarBuilder) -> DiscoveryResult<Self> {
        let mut layers = Vec::with_capacity(hidden.len() + 1);
        let mut width = n_in;
        for (i, &h) in hidden.iter().enumerate() {
            layers.push(linear(width, h, vb.pp(format!("layer{}", i)))?);
            width = h;
        }
        layers.push(linear(width, n_out, vb.pp("output"))?);
        Ok(Self { layers })
    }

    fn forward(&self, x: &Tensor) -> DiscoveryResult<Tensor> {
        let n = self.layers.len();
        let mut h = x.clone();
        for layer in &self.layers[..n - 1] {
            h = layer.forward(&h)?.tanh()?;
        }
        Ok(self.layers[n - 1].forward(&h)?)
    }
}

/// Per-feature coefficient cache refreshed on every forward pass.
#[derive(Debug, Clone, Default)]
struct CoeffCache {
    dense: Vec<Array1<f64>>,
    dense_scaled: Vec<Array1<f64>>,
    masked: Vec<Array1<f64>>,
    masked_scaled: Vec<Array1<f64>>,
    /// Detached (theta, time derivative, scale) per feature, kept so a mask
    /// commit can refit the masked vectors without another forward pass.
    fit_inputs: Vec<(Array2<f64>, Array1<f64>, Array1<f64>)>,
}

/// Neural function approximator with a polynomial / derivative candidate
/// library and least-squares constraint coefficients.
pub struct DiscoveryModel {
    config: ModelConfig,
    mlp: Mlp,
    varmap: VarMap,
    device: Device,
    /// Active support per feature; width always equals the library width.
    masks: Vec<Vec<bool>>,
    coeffs: CoeffCache,
    estimator_coeffs: Vec<Vec<f64>>,
}

impl DiscoveryModel {
    /// Build a model with freshly initialized weights.
    pub fn new(config: ModelConfig, device: &Device) -> DiscoveryResult<Self> {
        if config.library.deriv_order > 2 {
            return Err(DiscoveryError::Config(
                "spatial derivative order above 2 is not supported".to_string(),
            ));
        }
        if config.library.deriv_order > 0 && config.n_dims < 2 {
            return Err(DiscoveryError::Config(
                "spatial derivatives need a spatial coordinate".to_string(),
            ));
        }
        if config.fd_step <= 0.0 {
            return Err(DiscoveryError::Config(
                "finite-difference step must be positive".to_string(),
            ));
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, device);
        let mlp = Mlp::new(config.n_dims, &config.hidden, config.n_features, vb)?;

        let width = config.library.width();
        let masks = vec![vec![true; width]; config.n_features];

        Ok(Self {
            config,
            mlp,
            varmap,
            device: device.clone(),
            masks,
            coeffs: CoeffCache::default(),
            estimator_coeffs: Vec::new(),
        })
    }

    /// Trainable variables, for optimizer construction.
    pub fn trainable_vars(&self) -> Vec<candle_core::Var> {
        self.varmap.all_vars()
    }

    /// Model configuration
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Evaluate the network at coordinates shifted by `delta` along `dim`.
    fn shifted_forward(&self, coords: &Tensor, dim: usize, delta: f64) -> DiscoveryResult<Tensor> {
        let mut offset = vec![0.0f64; self.config.n_dims];
        offset[dim] = delta;
        let offset = Tensor::from_vec(offset, (1, self.config.n_dims), &self.device)?;
        let shifted = coords.broadcast_add(&offset)?;
        self.mlp.forward(&shifted)
    }

    /// Central first derivative of the network output along `dim`.
    fn central_diff(&self, coords: &Tensor, dim: usize) -> DiscoveryResult<Tensor> {
        let h = self.config.fd_step;
        let plus = self.shifted_forward(coords, dim, h)?;
        let minus = self.shifted_forward(coords, dim, -h)?;
        Ok((plus - minus)?.affine(1.0 / (2.0 * h), 0.0)?)
    }

    /// Central second derivative of the network output along `dim`.
    fn central_diff2(&self, coords: &Tensor, u: &Tensor, dim: usize) -> DiscoveryResult<Tensor> {
        let h = self.config.fd_step;
        let plus = self.shifted_forward(coords, dim, h)?;
        let minus = self.shifted_forward(coords, dim, -h)?;
        let two_u = u.affine(2.0, 0.0)?;
        Ok(((plus + minus)? - two_u)?.affine(1.0 / (h * h), 0.0)?)
    }

    /// Build the candidate matrix for one feature from its value and
    /// spatial derivatives. Columns: derivative order outer, power inner.
    fn build_theta(
        &self,
        u_f: &Tensor,
        spatial_f: &[Tensor],
        n_samples: usize,
    ) -> DiscoveryResult<Tensor> {
        let spec = &self.config.library;
        let mut cols = Vec::with_capacity(spec.width());

        let ones = Tensor::ones((n_samples, 1), DType::F64, &self.device)?;
        for q in 0..=spec.deriv_order {
            let deriv = if q == 0 { &ones } else { &spatial_f[q - 1] };
            let mut power = ones.clone();
            for p in 0..=spec.poly_order {
                if p > 0 {
                    power = (power * u_f)?;
                }
                cols.push((&power * deriv)?);
            }
        }
        Ok(Tensor::cat(&cols, 1)?)
    }

    /// Refresh the constraint coefficient cache from detached copies of the
    /// forward outputs.
    fn refresh_coeffs(
        &mut self,
        thetas: &[Tensor],
        time_derivs: &[Tensor],
    ) -> DiscoveryResult<()> {
        let mut cache = CoeffCache::default();
        for (f, (theta, dt)) in thetas.iter().zip(time_derivs.iter()).enumerate() {
            let theta_nd = tensor_to_array2(&theta.detach())?;
            let dt_nd = tensor_to_array1(&dt.detach())?;

            let dense = lstsq(&theta_nd, &dt_nd, self.config.ridge);
            let masked = masked_lstsq(&theta_nd, &dt_nd, &self.masks[f], self.config.ridge);

            let norms = column_norms(&theta_nd);
            let dt_norm = dt_nd.dot(&dt_nd).sqrt();
            let scale = if dt_norm > 0.0 {
                norms.mapv(|n| n / dt_norm)
            } else {
                Array1::ones(norms.len())
            };

            cache.dense_scaled.push(&dense * &scale);
            cache.masked_scaled.push(&masked * &scale);
            cache.dense.push(dense);
            cache.masked.push(masked);
            cache.fit_inputs.push((theta_nd, dt_nd, scale));
        }
        self.coeffs = cache;
        Ok(())
    }
}

impl Regressor for DiscoveryModel {
    fn forward(&mut self, coords: &Tensor) -> DiscoveryResult<RegressorOutput> {
        let n_samples = coords.dims()[0];
        let prediction = self.mlp.forward(coords)?;

        // Time derivative, split per feature.
        let u_t = self.central_diff(coords, 0)?;
        let mut time_derivs = Vec::with_capacity(self.config.n_features);
        for f in 0..self.config.n_features {
            time_derivs.push(u_t.narrow(1, f, 1)?);
        }

        // Spatial derivatives up to the library's order, split per feature.
        let mut spatial: Vec<Tensor> = Vec::new();
        if self.config.library.deriv_order >= 1 {
            spatial.push(self.central_diff(coords, 1)?);
        }
        if self.config.library.deriv_order >= 2 {
            spatial.push(self.central_diff2(coords, &prediction, 1)?);
        }

        let mut thetas = Vec::with_capacity(self.config.n_features);
        for f in 0..self.config.n_features {
            let u_f = prediction.narrow(1, f, 1)?;
            let spatial_f: Vec<Tensor> = spatial
                .iter()
                .map(|d| d.narrow(1, f, 1))
                .collect::<Result<_, _>>()?;
            thetas.push(self.build_theta(&u_f, &spatial_f, n_samples)?);
        }

        self.refresh_coeffs(&thetas, &time_derivs)?;

        Ok(RegressorOutput {
            prediction,
            time_derivs,
            thetas,
        })
    }

    fn predict(&self, coords: &Tensor) -> DiscoveryResult<Tensor> {
        Ok(self.mlp.forward(coords)?.detach())
    }

    fn constraint_coeffs(&self, scaled: bool, sparse: bool) -> Vec<Vec<f64>> {
        let source = match (scaled, sparse) {
            (false, false) => &self.coeffs.dense,
            (true, false) => &self.coeffs.dense_scaled,
            (false, true) => &self.coeffs.masked,
            (true, true) => &self.coeffs.masked_scaled,
        };
        source.iter().map(|c| c.to_vec()).collect()
    }

    fn sparse_estimator(
        &mut self,
        thetas: &[Tensor],
        time_derivs: &[Tensor],
    ) -> DiscoveryResult<Vec<Vec<bool>>> {
        let mut masks = Vec::with_capacity(thetas.len());
        let mut est_coeffs = Vec::with_capacity(thetas.len());

        for (theta, dt) in thetas.iter().zip(time_derivs.iter()) {
            let theta_nd = tensor_to_array2(&theta.detach())?;
            let dt_nd = tensor_to_array1(&dt.detach())?;

            // Fit in a column-normalized basis so the magnitude threshold is
            // scale free.
            let norms = column_norms(&theta_nd);
            let mut normalized = theta_nd.clone();
            for j in 0..normalized.ncols() {
                if norms[j] > 0.0 {
                    normalized.column_mut(j).mapv_inplace(|v| v / norms[j]);
                }
            }
            let dt_norm = dt_nd.dot(&dt_nd).sqrt();
            let dt_scaled = if dt_norm > 0.0 {
                dt_nd.mapv(|v| v / dt_norm)
            } else {
                dt_nd.clone()
            };

            let coeffs = lstsq(&normalized, &dt_scaled, self.config.ridge);
            let mask: Vec<bool> = coeffs
                .iter()
                .enumerate()
                .map(|(j, &c)| norms[j] > 0.0 && c.abs() >= self.config.threshold)
                .collect();
            let thresholded: Vec<f64> = coeffs
                .iter()
                .zip(mask.iter())
                .map(|(&c, &keep)| if keep { c } else { 0.0 })
                .collect();

            masks.push(mask);
            est_coeffs.push(thresholded);
        }

        self.estimator_coeffs = est_coeffs;
        Ok(masks)
    }

    fn estimator_coeffs(&self) -> Vec<Vec<f64>> {
        self.estimator_coeffs.clone()
    }

    fn set_sparsity_masks(&mut self, masks: Vec<Vec<bool>>) -> DiscoveryResult<()> {
        if masks.len() != self.config.n_features {
            return Err(DiscoveryError::DimensionMismatch {
                expected: self.config.n_features,
                got: masks.len(),
            });
        }
        let width = self.config.library.width();
        for mask in &masks {
            if mask.len() != width {
                return Err(DiscoveryError::DimensionMismatch {
                    expected: width,
                    got: mask.len(),
                });
            }
        }
        self.masks = masks;

        // Refit the masked vectors under the new mask right away, so reads
        // between the commit and the next forward pass already honor it.
        for (f, (theta, dt, scale)) in self.coeffs.fit_inputs.iter().enumerate() {
            let masked = masked_lstsq(theta, dt, &self.masks[f], self.config.ridge);
            self.coeffs.masked_scaled[f] = &masked * scale;
            self.coeffs.masked[f] = masked;
        }
        Ok(())
    }

    fn sparsity_masks(&self) -> &[Vec<bool>] {
        &self.masks
    }

    fn save_weights(&self, path: &Path) -> DiscoveryResult<()> {
        self.varmap
            .save(path)
            .map_err(|e| DiscoveryError::Serialization(format!("failed to save weights: {}", e)))
    }

    fn load_weights(&mut self, path: &Path) -> DiscoveryResult<()> {
        self.varmap
            .load(path)
            .map_err(|e| DiscoveryError::Serialization(format!("failed to load weights: {}", e)))
    }

    fn n_features(&self) -> usize {
        self.config.n_features
    }

    fn library_width(&self) -> usize {
        self.config.library.width()
    }
}

fn tensor_to_array2(t: &Tensor) -> DiscoveryResult<Array2<f64>> {
    let rows = t.to_vec2::<f64>()?;
    let nrows = rows.len();
    let ncols = rows.first().map(|r| r.len()).unwrap_or(0);
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    Array2::from_shape_vec((nrows, ncols), flat)
        .map_err(|e| DiscoveryError::Serialization(e.to_string()))
}

fn tensor_to_array1(t: &Tensor) -> DiscoveryResult<Array1<f64>> {
    Ok(Array1::from_vec(t.flatten_all()?.to_vec1::<f64>()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tiny_model() -> DiscoveryModel {
        let config = ModelConfig {
            n_dims: 1,
            n_features: 2,
            hidden: vec![8],
            library: LibrarySpec::new(2, 0),
            ..ModelConfig::default()
        };
        DiscoveryModel::new(config, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_forward_shapes() {
        let mut model = tiny_model();
        let coords = Tensor::rand(0.0f64, 1.0, (16, 1), &Device::Cpu).unwrap();
        let out = model.forward(&coords).unwrap();

        assert_eq!(out.prediction.dims(), &[16, 2]);
        assert_eq!(out.time_derivs.len(), 2);
        assert_eq!(out.time_derivs[0].dims(), &[16, 1]);
        assert_eq!(out.thetas.len(), 2);
        assert_eq!(out.thetas[0].dims(), &[16, 3]);
    }

    #[test]
    fn test_constraint_coeffs_widths() {
        let mut model = tiny_model();
        let coords = Tensor::rand(0.0f64, 1.0, (16, 1), &Device::Cpu).unwrap();
        model.forward(&coords).unwrap();

        for sparse in [false, true] {
            for scaled in [false, true] {
                let coeffs = model.constraint_coeffs(scaled, sparse);
                assert_eq!(coeffs.len(), 2);
                assert_eq!(coeffs[0].len(), 3);
            }
        }
    }

    #[test]
    fn test_mask_replacement_changes_masked_fit() {
        let mut model = tiny_model();
        let coords = Tensor::rand(0.0f64, 1.0, (16, 1), &Device::Cpu).unwrap();
        model.forward(&coords).unwrap();

        model
            .set_sparsity_masks(vec![vec![false, true, false], vec![true, false, false]])
            .unwrap();
        model.forward(&coords).unwrap();

        let masked = model.constraint_coeffs(false, true);
        assert_eq!(masked[0][0], 0.0);
        assert_eq!(masked[0][2], 0.0);
        assert_eq!(masked[1][1], 0.0);
        assert_eq!(masked[1][2], 0.0);
    }

    #[test]
    fn test_mask_commit_refits_without_new_forward() {
        let mut model = tiny_model();
        let coords = Tensor::rand(0.0f64, 1.0, (16, 1), &Device::Cpu).unwrap();
        model.forward(&coords).unwrap();

        // No forward pass between the commit and the reads: the masked
        // vectors must already honor the new mask.
        model
            .set_sparsity_masks(vec![vec![false, true, false], vec![false, true, false]])
            .unwrap();

        for scaled in [false, true] {
            let masked = model.constraint_coeffs(scaled, true);
            for coeffs in &masked {
                assert_eq!(coeffs[0], 0.0);
                assert_eq!(coeffs[2], 0.0);
            }
        }
    }

    #[test]
    fn test_bad_mask_width_rejected() {
        let mut model = tiny_model();
        assert!(model
            .set_sparsity_masks(vec![vec![true, true], vec![true, true]])
            .is_err());
    }

    #[test]
    fn test_estimator_recovers_sparse_support() {
        let mut model = tiny_model();
        let device = Device::Cpu;

        // dt = 2 * column1 exactly; columns 0 and 2 are noise-free but
        // uncorrelated with dt.
        let n = 64;
        let mut theta_data = Vec::with_capacity(n * 3);
        let mut dt_data = Vec::with_capacity(n);
        for i in 0..n {
            let x = (i as f64) / (n as f64) - 0.5;
            theta_data.extend_from_slice(&[1.0, x, (7.0 * x).cos()]);
            dt_data.push(2.0 * x);
        }
        let theta = Tensor::from_vec(theta_data, (n, 3), &device).unwrap();
        let dt = Tensor::from_vec(dt_data, (n, 1), &device).unwrap();

        let masks = model
            .sparse_estimator(&[theta.clone(), theta], &[dt.clone(), dt])
            .unwrap();
        assert_eq!(masks.len(), 2);
        assert!(masks[0][1], "dominant column must stay active");
        assert!(!masks[0][0]);

        let est = model.estimator_coeffs();
        assert_eq!(est.len(), 2);
        assert_eq!(est[0].len(), 3);
    }

    #[test]
    fn test_save_and_load_weights() {
        let mut model = tiny_model();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("weights.safetensors");

        model.save_weights(&path).unwrap();
        model.load_weights(&path).unwrap();
    }

    #[test]
    fn test_predict_matches_forward_prediction() {
        let mut model = tiny_model();
        let coords = Tensor::rand(0.0f64, 1.0, (8, 1), &Device::Cpu).unwrap();
        let out = model.forward(&coords).unwrap();
        let pred = model.predict(&coords).unwrap();

        let a = out.prediction.flatten_all().unwrap().to_vec1::<f64>().unwrap();
        let b = pred.flatten_all().unwrap().to_vec1::<f64>().unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-12);
        }
    }
}
