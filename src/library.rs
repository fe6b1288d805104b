//! # Candidate-Term Libraries
//!
//! Describes the library of candidate terms regressed against the time
//! derivative, and provides the small dense linear-algebra routines used to
//! fit coefficient vectors on host memory (library widths are tiny, so a
//! direct normal-equations solve is all that is needed).
//!
//! The library spans products of polynomial powers of the solution and its
//! spatial derivatives: column `(p, q)` is `u^p * d^q u / dx^q`. The
//! differentiable evaluation of these columns lives in the model; this
//! module owns the term structure and the non-differentiable fits.

use ndarray::{Array1, Array2};

/// Shape of a polynomial / derivative candidate library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LibrarySpec {
    /// Highest polynomial power of the solution (inclusive).
    pub poly_order: usize,
    /// Highest spatial derivative order (inclusive). Zero for ODE data.
    pub deriv_order: usize,
}

impl LibrarySpec {
    pub fn new(poly_order: usize, deriv_order: usize) -> Self {
        Self {
            poly_order,
            deriv_order,
        }
    }

    /// Number of library columns: (poly_order + 1) * (deriv_order + 1).
    pub fn width(&self) -> usize {
        (self.poly_order + 1) * (self.deriv_order + 1)
    }

    /// Human-readable term names, in column order.
    ///
    /// Column order iterates derivatives outer, powers inner, matching the
    /// evaluation order in the model: `1, u, u^2, .., u_x, u u_x, ..`.
    pub fn term_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.width());
        for q in 0..=self.deriv_order {
            for p in 0..=self.poly_order {
                let poly = match p {
                    0 => String::new(),
                    1 => "u".to_string(),
                    _ => format!("u^{}", p),
                };
                let deriv = match q {
                    0 => String::new(),
                    1 => "u_x".to_string(),
                    _ => format!("u_{}", "x".repeat(q)),
                };
                let name = match (poly.is_empty(), deriv.is_empty()) {
                    (true, true) => "1".to_string(),
                    (false, true) => poly,
                    (true, false) => deriv,
                    (false, false) => format!("{} {}", poly, deriv),
                };
                names.push(name);
            }
        }
        names
    }
}

impl Default for LibrarySpec {
    fn default() -> Self {
        Self {
            poly_order: 2,
            deriv_order: 0,
        }
    }
}

/// Solve `a x = b` by Gaussian elimination with partial pivoting.
///
/// Returns None for a singular system. Intended for the tiny symmetric
/// systems produced by [`lstsq`].
pub fn solve_dense(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = a.nrows();
    if n != a.ncols() || n != b.len() {
        return None;
    }

    // Augmented working copy.
    let mut m = vec![vec![0.0; n + 1]; n];
    for i in 0..n {
        for j in 0..n {
            m[i][j] = a[[i, j]];
        }
        m[i][n] = b[i];
    }

    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| {
            m[i][col]
                .abs()
                .partial_cmp(&m[j][col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if m[pivot][col].abs() < 1e-14 {
            return None;
        }
        m.swap(col, pivot);

        for row in (col + 1)..n {
            let factor = m[row][col] / m[col][col];
            for k in col..=n {
                m[row][k] -= factor * m[col][k];
            }
        }
    }

    let mut x = Array1::zeros(n);
    for row in (0..n).rev() {
        let mut acc = m[row][n];
        for k in (row + 1)..n {
            acc -= m[row][k] * x[k];
        }
        x[row] = acc / m[row][row];
    }
    Some(x)
}

/// Ridge-stabilized least squares: minimize `|theta c - y|^2 + ridge |c|^2`.
pub fn lstsq(theta: &Array2<f64>, y: &Array1<f64>, ridge: f64) -> Array1<f64> {
    let m = theta.ncols();
    if m == 0 {
        return Array1::zeros(0);
    }

    let mut gram = theta.t().dot(theta);
    for i in 0..m {
        gram[[i, i]] += ridge;
    }
    let rhs = theta.t().dot(y);

    // The ridge keeps the system invertible for any realistic library, but a
    // degenerate batch can still defeat it; fall back to zeros in that case.
    solve_dense(&gram, &rhs).unwrap_or_else(|| Array1::zeros(m))
}

/// Least squares restricted to the active columns of `mask`, scattered back
/// into a full-width vector with zeros at inactive positions.
pub fn masked_lstsq(
    theta: &Array2<f64>,
    y: &Array1<f64>,
    mask: &[bool],
    ridge: f64,
) -> Array1<f64> {
    let width = theta.ncols();
    let active: Vec<usize> = (0..width).filter(|&j| mask[j]).collect();
    let mut full = Array1::zeros(width);
    if active.is_empty() {
        return full;
    }

    let mut sub = Array2::zeros((theta.nrows(), active.len()));
    for (k, &j) in active.iter().enumerate() {
        sub.column_mut(k).assign(&theta.column(j));
    }
    let coeffs = lstsq(&sub, y, ridge);
    for (k, &j) in active.iter().enumerate() {
        full[j] = coeffs[k];
    }
    full
}

/// Euclidean norm of each library column.
pub fn column_norms(theta: &Array2<f64>) -> Array1<f64> {
    let m = theta.ncols();
    let mut norms = Array1::zeros(m);
    for j in 0..m {
        norms[j] = theta.column(j).dot(&theta.column(j)).sqrt();
    }
    norms
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_library_width_and_names() {
        let spec = LibrarySpec::new(2, 1);
        assert_eq!(spec.width(), 6);
        let names = spec.term_names();
        assert_eq!(names[0], "1");
        assert_eq!(names[1], "u");
        assert_eq!(names[2], "u^2");
        assert_eq!(names[3], "u_x");
        assert_eq!(names[4], "u u_x");
    }

    #[test]
    fn test_solve_dense_identity() {
        let a = array![[2.0, 0.0], [0.0, 4.0]];
        let b = array![2.0, 8.0];
        let x = solve_dense(&a, &b).unwrap();
        assert!((x[0] - 1.0).abs() < 1e-12);
        assert!((x[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_solve_dense_singular() {
        let a = array![[1.0, 1.0], [1.0, 1.0]];
        let b = array![1.0, 2.0];
        assert!(solve_dense(&a, &b).is_none());
    }

    #[test]
    fn test_lstsq_recovers_coefficients() {
        // y = 3 * c0 - 2 * c1 with orthogonal columns.
        let theta = array![[1.0, 0.0], [0.0, 1.0], [1.0, 0.0], [0.0, 1.0]];
        let y = array![3.0, -2.0, 3.0, -2.0];
        let c = lstsq(&theta, &y, 1e-10);
        assert!((c[0] - 3.0).abs() < 1e-6);
        assert!((c[1] + 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_masked_lstsq_scatters_zeros() {
        let theta = array![[1.0, 5.0, 0.0], [0.0, 5.0, 1.0], [1.0, 5.0, 0.0], [0.0, 5.0, 1.0]];
        let y = array![3.0, -2.0, 3.0, -2.0];
        let c = masked_lstsq(&theta, &y, &[true, false, true], 1e-10);
        assert_eq!(c.len(), 3);
        assert_eq!(c[1], 0.0);
        assert!((c[0] - 3.0).abs() < 1e-6);
        assert!((c[2] + 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_masked_lstsq_all_inactive() {
        let theta = array![[1.0, 2.0], [3.0, 4.0]];
        let y = array![1.0, 1.0];
        let c = masked_lstsq(&theta, &y, &[false, false], 1e-10);
        assert!(c.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_column_norms() {
        let theta = array![[3.0, 0.0], [4.0, 2.0]];
        let norms = column_norms(&theta);
        assert!((norms[0] - 5.0).abs() < 1e-12);
        assert!((norms[1] - 2.0).abs() < 1e-12);
    }
}
