/// Eigendecomposition of reversible rate matrices
///
/// Decomposes once per model, then every transition matrix and every
/// pruning step works in the eigenbasis.

use faer::{Mat, Side};
use ndarray::prelude::*;

use crate::error::{PhyloError, Result};

/// Relative tolerance for the detailed-balance check
const REVERSIBILITY_TOL: f64 = 1e-8;

/// Cached eigensystem of a reversible Q
#[derive(Clone, Debug)]
pub struct EigenSystem {
    /// Eigenvectors (U), columns are eigenvectors
    pub eigenvectors: Array2<f64>,
    /// Eigenvalues (λ), all ≤ 0 for a valid rate matrix
    pub eigenvalues: Array1<f64>,
    /// U^{-1}
    pub eigenvectors_inv: Array2<f64>,
    pub n: usize,
}

impl EigenSystem {
    /// Decompose a reversible rate matrix with stationary frequencies π
    ///
    /// 1. Symmetrize: S = Π^{1/2} Q Π^{-1/2}
    /// 2. S = V D V^T (symmetric eigensolver)
    /// 3. U = Π^{-1/2} V and U^{-1} = V^T Π^{1/2}
    ///
    /// The inverse is exact because V is orthonormal, and it gives the
    /// identity U^{-1}[i][x] = π_x U[x][i] the likelihood kernels rely on.
    pub fn new(q: ArrayView2<f64>, pi: ArrayView1<f64>) -> Result<Self> {
        let n = q.nrows();

        if q.ncols() != n {
            return Err(PhyloError::malformed(format!(
                "Q matrix must be square, got {}x{}",
                n,
                q.ncols()
            )));
        }
        if pi.len() != n {
            return Err(PhyloError::malformed(format!(
                "pi must have length {}, got {}",
                n,
                pi.len()
            )));
        }
        if pi.iter().any(|&p| !(p > 0.0) || !p.is_finite()) {
            return Err(PhyloError::invalid("pi", "state frequencies must be positive"));
        }
        if !is_reversible(q, pi) {
            return Err(PhyloError::UnsupportedModel(
                "rate matrix violates detailed balance".to_string(),
            ));
        }

        let sqrt_pi = pi.mapv(f64::sqrt);
        let inv_sqrt_pi = sqrt_pi.mapv(|x| 1.0 / x);

        // Average the two triangles so the solver sees an exactly symmetric matrix
        let s = Mat::<f64>::from_fn(n, n, |i, j| {
            let a = sqrt_pi[i] * q[[i, j]] * inv_sqrt_pi[j];
            let b = sqrt_pi[j] * q[[j, i]] * inv_sqrt_pi[i];
            0.5 * (a + b)
        });

        let evd = s
            .as_ref()
            .self_adjoint_eigen(Side::Lower)
            .map_err(|e| PhyloError::EigenDecomposition(format!("{e:?}")))?;
        let values = evd.S().column_vector().as_mat();
        let vectors = evd.U();

        let eigenvalues = Array1::from_shape_fn(n, |i| values[(i, 0)]);
        let eigenvectors = Array2::from_shape_fn((n, n), |(i, j)| inv_sqrt_pi[i] * vectors[(i, j)]);
        let eigenvectors_inv = Array2::from_shape_fn((n, n), |(i, j)| vectors[(j, i)] * sqrt_pi[j]);

        Ok(Self {
            eigenvectors,
            eigenvalues,
            eigenvectors_inv,
            n,
        })
    }

    /// exp(Q t) = U diag(exp(λt)) U^{-1}
    #[inline]
    pub fn expm(&self, t: f64) -> Array2<f64> {
        let exp_lambda_t = self.eigenvalues.mapv(|lambda| (lambda * t).exp());

        let mut u_scaled = self.eigenvectors.to_owned();
        for (j, &scale) in exp_lambda_t.iter().enumerate() {
            u_scaled.column_mut(j).mapv_inplace(|x| x * scale);
        }

        u_scaled.dot(&self.eigenvectors_inv)
    }
}

/// Detailed balance: π_i Q_ij = π_j Q_ji
pub fn is_reversible(q: ArrayView2<f64>, pi: ArrayView1<f64>) -> bool {
    let n = q.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            let lhs = pi[i] * q[[i, j]];
            let rhs = pi[j] * q[[j, i]];
            let scale = lhs.abs().max(rhs.abs()).max(1e-300);
            if (lhs - rhs).abs() > REVERSIBILITY_TOL * scale.max(1.0) {
                return false;
            }
        }
    }
    true
}
