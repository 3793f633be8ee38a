/// Rate matrix construction
///
/// All builders return a reversible Q with rows summing to zero, normalized
/// so that one unit of branch length is one expected substitution per site.
/// Nucleotide order is A, C, G, T.

use ndarray::{Array1, Array2};

use crate::codon::{codon_graph, N_SENSE_CODONS};
use crate::error::{PhyloError, Result};

/// Set the diagonal so each row sums to zero
fn fill_diagonal(q: &mut Array2<f64>) {
    for i in 0..q.nrows() {
        q[[i, i]] = 0.0;
        let row_sum: f64 = q.row(i).sum();
        q[[i, i]] = -row_sum;
    }
}

/// Expected substitution rate -Σ π_i Q_ii
pub fn expected_rate(q: &Array2<f64>, pi: &Array1<f64>) -> f64 {
    -(0..q.nrows()).map(|i| pi[i] * q[[i, i]]).sum::<f64>()
}

fn normalized(q: Array2<f64>, pi: &Array1<f64>) -> Array2<f64> {
    let rate = expected_rate(&q, pi);
    if rate > 0.0 {
        q / rate
    } else {
        q
    }
}

fn check_frequencies(pi: &Array1<f64>, n: usize) -> Result<()> {
    if pi.len() != n {
        return Err(PhyloError::invalid(
            "pi",
            format!("expected {} frequencies, got {}", n, pi.len()),
        ));
    }
    let sum = pi.sum();
    if (sum - 1.0).abs() > 1e-6 || pi.iter().any(|&p| p <= 0.0) {
        return Err(PhyloError::invalid(
            "pi",
            format!("frequencies must be positive and sum to 1 (sum = {sum})"),
        ));
    }
    Ok(())
}

/// General time-reversible Q from the upper triangle of the exchangeability
/// matrix, row by row: (0,1), (0,2), ..., (1,2), ...
pub fn build_gtr_q_matrix(exchangeabilities: &[f64], pi: &Array1<f64>) -> Result<Array2<f64>> {
    let n = pi.len();
    if exchangeabilities.len() != n * (n - 1) / 2 {
        return Err(PhyloError::invalid(
            "exchangeabilities",
            format!(
                "{} states need {} exchangeabilities, got {}",
                n,
                n * (n - 1) / 2,
                exchangeabilities.len()
            ),
        ));
    }
    if exchangeabilities.iter().any(|&r| !(r >= 0.0) || !r.is_finite()) {
        return Err(PhyloError::invalid("exchangeabilities", "must be finite and non-negative"));
    }
    check_frequencies(pi, n)?;

    let mut q = Array2::zeros((n, n));
    let mut k = 0;
    for i in 0..n {
        for j in (i + 1)..n {
            q[[i, j]] = exchangeabilities[k] * pi[j];
            q[[j, i]] = exchangeabilities[k] * pi[i];
            k += 1;
        }
    }
    fill_diagonal(&mut q);
    Ok(normalized(q, pi))
}

/// Equal exchangeabilities and equal frequencies (JC69 for n = 4)
pub fn build_jc_q_matrix(n: usize) -> Array2<f64> {
    let mut q = Array2::from_elem((n, n), 1.0 / (n as f64 - 1.0));
    q.diag_mut().fill(-1.0);
    q
}

/// HKY85: transitions (A<->G, C<->T) at rate kappa
pub fn build_hky_q_matrix(kappa: f64, pi: &Array1<f64>) -> Result<Array2<f64>> {
    if !(kappa > 0.0) {
        return Err(PhyloError::invalid("kappa", format!("must be positive, got {kappa}")));
    }
    // (A,C) (A,G) (A,T) (C,G) (C,T) (G,T)
    build_gtr_q_matrix(&[1.0, kappa, 1.0, 1.0, kappa, 1.0], pi)
}

/// Goldman-Yang codon Q for given kappa, omega and codon frequencies
///
/// `normalization_factor` overrides the expected-rate normalization so that
/// several omega classes can share one time scale.
pub fn build_codon_q_matrix(
    kappa: f64,
    omega: f64,
    pi: &Array1<f64>,
    normalization_factor: Option<f64>,
) -> Result<Array2<f64>> {
    if !(kappa > 0.0) || !(omega >= 0.0) {
        return Err(PhyloError::invalid(
            "kappa/omega",
            format!("need kappa > 0 and omega >= 0, got {kappa}, {omega}"),
        ));
    }
    check_frequencies(pi, N_SENSE_CODONS)?;

    let n = N_SENSE_CODONS;
    let mut q = Array2::zeros((n, n));
    for i in 0..n {
        for edge in codon_graph().neighbors(i) {
            let mut rate = 1.0;
            if edge.is_transition {
                rate *= kappa;
            }
            if !edge.is_synonymous {
                rate *= omega;
            }
            q[[i, edge.to_codon]] = rate * pi[edge.to_codon];
        }
    }
    fill_diagonal(&mut q);

    Ok(match normalization_factor {
        Some(factor) => q / factor,
        None => normalized(q, pi),
    })
}
