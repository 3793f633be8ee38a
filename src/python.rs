/// Python bindings
///
/// Trees arrive as (node_id, parent_id) pairs with one length per node, and
/// sequences as an integer matrix `[n_leaves, n_sites]` of state indices
/// where anything outside `0..n_states` is treated as missing data.

use std::sync::Arc;

use numpy::{PyArray1, PyArray2, PyReadonlyArray1, PyReadonlyArray2};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;

use crate::alignment::{PatternSet, State};
use crate::config::{EngineConfig, FreeRateSchedule};
use crate::error::PhyloError;
use crate::freerate::FreeRate;
use crate::likelihood::LikelihoodEngine;
use crate::matrix::EigenSystem;
use crate::model::{ReversibleModel, SubstitutionModel};
use crate::rates::{DiscreteGamma, RateHeterogeneity, SiteRates};
use crate::tree::Tree;

impl From<PhyloError> for PyErr {
    fn from(err: PhyloError) -> PyErr {
        match err {
            PhyloError::InternalConsistency(_) | PhyloError::ThreadPool(_) => PyRuntimeError::new_err(err.to_string()),
            _ => PyValueError::new_err(err.to_string()),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_engine(
    q: PyReadonlyArray2<f64>,
    pi: PyReadonlyArray1<f64>,
    tree_structure: Vec<(usize, Option<usize>)>,
    branch_lengths: Vec<f64>,
    leaf_names: Vec<String>,
    sequences: PyReadonlyArray2<i32>,
    leaf_node_ids: Vec<usize>,
    rates: SiteRates,
    config: EngineConfig,
) -> PyResult<LikelihoodEngine> {
    let model = ReversibleModel::new("custom", q.as_array().to_owned(), pi.as_array().to_owned())?;
    let n_states = model.n_states();
    let unknown = n_states as State;

    let seq_array = sequences.as_array();
    let rows: Vec<Vec<State>> = seq_array
        .outer_iter()
        .map(|row| {
            row.iter()
                .map(|&s| if s >= 0 && (s as usize) < n_states { s as State } else { unknown })
                .collect()
        })
        .collect();

    let patterns = PatternSet::new(n_states, Vec::new(), leaf_names.clone(), &rows)?;
    let tree = Tree::from_structure(tree_structure, branch_lengths, leaf_names, leaf_node_ids)?;
    Ok(LikelihoodEngine::new(tree, Arc::new(patterns), Arc::new(model), rates, config)?)
}

fn gamma_rates(gamma_shape: Option<f64>, n_categories: usize) -> PyResult<SiteRates> {
    Ok(match gamma_shape {
        Some(shape) => SiteRates::from(DiscreteGamma::new(n_categories, shape)?),
        None => SiteRates::default(),
    })
}

/// Compute matrix exponential exp(Q * t)
///
/// Args:
///     q: Reversible rate matrix (n_states × n_states)
///     pi: Stationary frequencies (n_states,)
///     t: Branch length
///
/// Returns:
///     Transition probability matrix P(t)
#[pyfunction]
fn matrix_exponential<'py>(
    py: Python<'py>,
    q: PyReadonlyArray2<'py, f64>,
    pi: PyReadonlyArray1<'py, f64>,
    t: f64,
) -> PyResult<Bound<'py, PyArray2<f64>>> {
    let eigen = EigenSystem::new(q.as_array(), pi.as_array())?;
    Ok(PyArray2::from_array_bound(py, &eigen.expm(t)))
}

/// Log-likelihood of an alignment on a tree
///
/// Args:
///     gamma_shape: Discrete gamma shape, or None for a single rate
///     n_categories: Number of gamma categories
#[pyfunction]
#[pyo3(signature = (q, pi, tree_structure, branch_lengths, leaf_names, sequences, leaf_node_ids, gamma_shape=None, n_categories=4))]
#[allow(clippy::too_many_arguments)]
fn compute_log_likelihood(
    q: PyReadonlyArray2<f64>,
    pi: PyReadonlyArray1<f64>,
    tree_structure: Vec<(usize, Option<usize>)>,
    branch_lengths: Vec<f64>,
    leaf_names: Vec<String>,
    sequences: PyReadonlyArray2<i32>,
    leaf_node_ids: Vec<usize>,
    gamma_shape: Option<f64>,
    n_categories: usize,
) -> PyResult<f64> {
    let rates = gamma_rates(gamma_shape, n_categories)?;
    let mut engine = build_engine(
        q,
        pi,
        tree_structure,
        branch_lengths,
        leaf_names,
        sequences,
        leaf_node_ids,
        rates,
        EngineConfig::default(),
    )?;
    Ok(engine.compute_likelihood()?)
}

/// Per-site log-likelihoods (n_sites,)
#[pyfunction]
#[pyo3(signature = (q, pi, tree_structure, branch_lengths, leaf_names, sequences, leaf_node_ids, gamma_shape=None, n_categories=4))]
#[allow(clippy::too_many_arguments)]
fn compute_site_log_likelihoods<'py>(
    py: Python<'py>,
    q: PyReadonlyArray2<'py, f64>,
    pi: PyReadonlyArray1<'py, f64>,
    tree_structure: Vec<(usize, Option<usize>)>,
    branch_lengths: Vec<f64>,
    leaf_names: Vec<String>,
    sequences: PyReadonlyArray2<'py, i32>,
    leaf_node_ids: Vec<usize>,
    gamma_shape: Option<f64>,
    n_categories: usize,
) -> PyResult<Bound<'py, PyArray1<f64>>> {
    let rates = gamma_rates(gamma_shape, n_categories)?;
    let mut engine = build_engine(
        q,
        pi,
        tree_structure,
        branch_lengths,
        leaf_names,
        sequences,
        leaf_node_ids,
        rates,
        EngineConfig::default(),
    )?;
    let sites = engine.site_log_likelihoods()?;
    Ok(PyArray1::from_vec_bound(py, sites))
}

/// Optimize every branch length
///
/// Returns:
///     (log-likelihood, Newick string of the optimized tree)
#[pyfunction]
#[pyo3(signature = (q, pi, tree_structure, branch_lengths, leaf_names, sequences, leaf_node_ids, gamma_shape=None, n_categories=4, max_iterations=100, tolerance=0.001))]
#[allow(clippy::too_many_arguments)]
fn optimize_branch_lengths(
    q: PyReadonlyArray2<f64>,
    pi: PyReadonlyArray1<f64>,
    tree_structure: Vec<(usize, Option<usize>)>,
    branch_lengths: Vec<f64>,
    leaf_names: Vec<String>,
    sequences: PyReadonlyArray2<i32>,
    leaf_node_ids: Vec<usize>,
    gamma_shape: Option<f64>,
    n_categories: usize,
    max_iterations: usize,
    tolerance: f64,
) -> PyResult<(f64, String)> {
    let rates = gamma_rates(gamma_shape, n_categories)?;
    let mut engine = build_engine(
        q,
        pi,
        tree_structure,
        branch_lengths,
        leaf_names,
        sequences,
        leaf_node_ids,
        rates,
        EngineConfig::default(),
    )?;
    let log_likelihood = engine.optimize_all_branches(max_iterations, tolerance)?;
    Ok((log_likelihood, engine.tree().to_newick()))
}

/// Fit a free-rate (+Rk) model, alternating rate and branch-length optimization
///
/// Args:
///     schedule: "weights_then_rates", "rates_then_weights", "joint" or "em"
///
/// Returns:
///     (log-likelihood, weights, rates, Newick string)
#[pyfunction]
#[pyo3(signature = (q, pi, tree_structure, branch_lengths, leaf_names, sequences, leaf_node_ids, n_categories=4, schedule="weights_then_rates", epsilon=0.01, max_rounds=10))]
#[allow(clippy::too_many_arguments)]
fn optimize_free_rates(
    q: PyReadonlyArray2<f64>,
    pi: PyReadonlyArray1<f64>,
    tree_structure: Vec<(usize, Option<usize>)>,
    branch_lengths: Vec<f64>,
    leaf_names: Vec<String>,
    sequences: PyReadonlyArray2<i32>,
    leaf_node_ids: Vec<usize>,
    n_categories: usize,
    schedule: &str,
    epsilon: f64,
    max_rounds: usize,
) -> PyResult<(f64, Vec<f64>, Vec<f64>, String)> {
    let schedule: FreeRateSchedule = serde_json::from_value(serde_json::Value::String(schedule.to_string()))
        .map_err(|e| PyValueError::new_err(format!("unknown schedule: {e}")))?;
    let mut config = EngineConfig::default();
    config.free_rate.schedule = schedule;
    config.branch.sweep_tolerance = epsilon.max(1e-8);

    let rates = SiteRates::from(FreeRate::from_gamma(n_categories, 1.0)?);
    let mut engine = build_engine(
        q,
        pi,
        tree_structure,
        branch_lengths,
        leaf_names,
        sequences,
        leaf_node_ids,
        rates,
        config,
    )?;

    let log_likelihood = engine.optimize_model_parameters(epsilon, max_rounds)?;
    let rates = engine.site_rates();
    Ok((
        log_likelihood,
        rates.weights().to_vec(),
        rates.rates().to_vec(),
        engine.tree().to_newick(),
    ))
}

/// Python module definition
#[pymodule]
fn phylolik(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(matrix_exponential, m)?)?;
    m.add_function(wrap_pyfunction!(compute_log_likelihood, m)?)?;
    m.add_function(wrap_pyfunction!(compute_site_log_likelihoods, m)?)?;
    m.add_function(wrap_pyfunction!(optimize_branch_lengths, m)?)?;
    m.add_function(wrap_pyfunction!(optimize_free_rates, m)?)?;
    Ok(())
}
