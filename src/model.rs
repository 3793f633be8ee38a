/// Substitution models consumed by the likelihood engine

use std::fmt;

use ndarray::{Array1, Array2};

use crate::error::{PhyloError, Result};
use crate::matrix::EigenSystem;
use crate::qmatrix::{build_codon_q_matrix, build_gtr_q_matrix, build_hky_q_matrix, build_jc_q_matrix};

/// What the engine needs from a substitution process
pub trait SubstitutionModel: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn n_states(&self) -> usize;

    fn state_frequencies(&self) -> &Array1<f64>;

    fn eigen(&self) -> &EigenSystem;

    fn is_reversible(&self) -> bool;

    /// P(t) for one branch
    fn transition_matrix(&self, t: f64) -> Array2<f64> {
        self.eigen().expm(t)
    }
}

/// Time-reversible model with a cached eigensystem
#[derive(Clone)]
pub struct ReversibleModel {
    name: String,
    pi: Array1<f64>,
    q: Array2<f64>,
    eigen: EigenSystem,
}

impl fmt::Debug for ReversibleModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReversibleModel")
            .field("name", &self.name)
            .field("n_states", &self.pi.len())
            .finish()
    }
}

impl ReversibleModel {
    pub fn new(name: impl Into<String>, q: Array2<f64>, pi: Array1<f64>) -> Result<Self> {
        let eigen = EigenSystem::new(q.view(), pi.view())?;
        if eigen.eigenvalues.iter().any(|&l| l > 1e-8) {
            return Err(PhyloError::invalid(
                "q",
                "rate matrix has a positive eigenvalue",
            ));
        }
        Ok(Self {
            name: name.into(),
            pi,
            q,
            eigen,
        })
    }

    pub fn jc69() -> Result<Self> {
        Self::new("JC", build_jc_q_matrix(4), Array1::from_elem(4, 0.25))
    }

    pub fn hky85(kappa: f64, pi: Array1<f64>) -> Result<Self> {
        let q = build_hky_q_matrix(kappa, &pi)?;
        Self::new("HKY", q, pi)
    }

    /// GTR with exchangeabilities (AC, AG, AT, CG, CT, GT)
    pub fn gtr(exchangeabilities: &[f64; 6], pi: Array1<f64>) -> Result<Self> {
        let q = build_gtr_q_matrix(exchangeabilities, &pi)?;
        Self::new("GTR", q, pi)
    }

    /// Equal-rates protein model
    pub fn poisson() -> Result<Self> {
        Self::new("Poisson", build_jc_q_matrix(20), Array1::from_elem(20, 0.05))
    }

    pub fn gy94(kappa: f64, omega: f64, pi: Array1<f64>) -> Result<Self> {
        let q = build_codon_q_matrix(kappa, omega, &pi, None)?;
        Self::new("GY", q, pi)
    }

    pub fn rate_matrix(&self) -> &Array2<f64> {
        &self.q
    }
}

impl SubstitutionModel for ReversibleModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn n_states(&self) -> usize {
        self.pi.len()
    }

    fn state_frequencies(&self) -> &Array1<f64> {
        &self.pi
    }

    fn eigen(&self) -> &EigenSystem {
        &self.eigen
    }

    fn is_reversible(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_models_have_zero_eigenvalue() {
        let models = [
            ReversibleModel::jc69().unwrap(),
            ReversibleModel::hky85(3.0, Array1::from(vec![0.1, 0.2, 0.3, 0.4])).unwrap(),
            ReversibleModel::poisson().unwrap(),
        ];
        for model in &models {
            let max = model.eigen().eigenvalues.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            assert_abs_diff_eq!(max, 0.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_transition_matrix_converges_to_pi() {
        let pi = Array1::from(vec![0.1, 0.2, 0.3, 0.4]);
        let model = ReversibleModel::gtr(&[1.0, 2.0, 0.5, 0.8, 3.0, 1.0], pi.clone()).unwrap();
        let p = model.transition_matrix(200.0);
        for i in 0..4 {
            for j in 0..4 {
                assert_abs_diff_eq!(p[[i, j]], pi[j], epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn test_codon_model_dimensions() {
        let pi = Array1::from_elem(61, 1.0 / 61.0);
        let model = ReversibleModel::gy94(2.0, 0.3, pi).unwrap();
        assert_eq!(model.n_states(), 61);
        let p = model.transition_matrix(0.5);
        assert_abs_diff_eq!(p.row(7).sum(), 1.0, epsilon = 1e-9);
    }
}
