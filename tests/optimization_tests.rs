use std::sync::Arc;

use approx::assert_abs_diff_eq;
use ndarray::array;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rstest::rstest;

use phylolik::{
    DiscreteGamma, EngineConfig, FreeRate, FreeRateConfig, FreeRateSchedule, LikelihoodEngine, PatternSet,
    RateHeterogeneity, ReversibleModel, SiteRates, SubstitutionModel, Tree,
};

const TAXA: [&str; 6] = ["A", "B", "C", "D", "E", "F"];

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn taxa() -> Vec<String> {
    TAXA.iter().map(|s| s.to_string()).collect()
}

fn small_engine(rates: SiteRates, config: EngineConfig) -> LikelihoodEngine {
    let patterns = PatternSet::from_dna(
        &TAXA,
        &[
            "ACGTACGGTACCATGATTACAAGTCCA",
            "ACGTTCGGTACGATGAATACTAGTCCA",
            "ACCTACGATACCTTGATTGCAAGACCT",
            "GCGTACGATTCCTTGCTTGCATGACGT",
            "GCGAACGTTTCCAAGCATGGATCACGA",
            "GAGAACTTTTGCAAGCATGGCTCACGA",
        ],
    )
    .unwrap();
    // Start away from the optimum so the optimizers have work to do
    let tree = Tree::from_newick("(((A:0.9,B:0.01):0.5,(C:0.05,D:1.5):0.02):0.3,(E:0.4,F:0.8):0.3);", &taxa()).unwrap();
    let model = ReversibleModel::hky85(2.0, array![0.25, 0.25, 0.25, 0.25]).unwrap();
    LikelihoodEngine::new(tree, Arc::new(patterns), Arc::new(model), rates, config).unwrap()
}

#[test]
fn test_newton_raphson_never_decreases() {
    let mut engine = small_engine(SiteRates::from(DiscreteGamma::new(4, 1.0).unwrap()), EngineConfig::default());
    let mut current = engine.compute_likelihood().unwrap();
    for edge in 0..engine.tree().n_edges() {
        let (a, b) = (engine.tree().edge(edge).a, engine.tree().edge(edge).b);
        let optimized = engine.optimize_one_branch(a, b).unwrap();
        assert!(optimized >= current - 1e-9, "edge {edge}: {optimized} < {current}");
        assert_abs_diff_eq!(engine.compute_likelihood().unwrap(), optimized, epsilon = 1e-8);
        current = optimized;
    }
}

#[test]
fn test_optimize_all_branches_converges() {
    let mut engine = small_engine(SiteRates::default(), EngineConfig::default());
    let start = engine.compute_likelihood().unwrap();
    let first = engine.optimize_all_branches(100, 1e-4).unwrap();
    assert!(first > start);
    // A second call starts at a stationary point
    let second = engine.optimize_all_branches(100, 1e-4).unwrap();
    assert!(second >= first - 1e-6);
    assert!(second - first < 1e-2);
    engine.check_slot_invariant().unwrap();
}

#[rstest]
#[case(FreeRateSchedule::WeightsThenRates)]
#[case(FreeRateSchedule::RatesThenWeights)]
#[case(FreeRateSchedule::Joint)]
#[case(FreeRateSchedule::Em)]
fn test_rate_optimization_improves(#[case] schedule: FreeRateSchedule) {
    let config = EngineConfig {
        free_rate: FreeRateConfig {
            schedule,
            ..FreeRateConfig::default()
        },
        ..EngineConfig::default()
    };
    let mut engine = small_engine(SiteRates::from(FreeRate::from_gamma(3, 1.0).unwrap()), config);
    let start = engine.compute_likelihood().unwrap();
    let end = engine.optimize_rate_parameters(0.01).unwrap();
    assert!(end >= start - 1e-3, "{schedule:?}: {end} < {start}");

    let rates = engine.site_rates();
    assert_abs_diff_eq!(rates.weights().iter().sum::<f64>(), 1.0, epsilon = 1e-9);
    assert_abs_diff_eq!(rates.mean_rate(), 1.0, epsilon = 1e-6);
    assert!(rates.rates().windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn test_gamma_shape_optimization_improves() {
    let mut engine = small_engine(SiteRates::from(DiscreteGamma::new(4, 50.0).unwrap()), EngineConfig::default());
    let start = engine.compute_likelihood().unwrap();
    let end = engine.optimize_rate_parameters(0.01).unwrap();
    assert!(end >= start - 1e-9);
}

#[test]
fn test_em_history_is_monotone() {
    init_tracing();
    let mut engine = small_engine(SiteRates::from(FreeRate::from_gamma(4, 0.5).unwrap()), EngineConfig::default());
    let report = engine.optimize_with_em().unwrap();
    assert!(!report.log_likelihoods.is_empty());
    for pair in report.log_likelihoods.windows(2) {
        assert!(pair[1] >= pair[0] - 1e-3, "EM step lowered the likelihood: {pair:?}");
    }
    assert_abs_diff_eq!(
        engine.compute_likelihood().unwrap(),
        *report.log_likelihoods.last().unwrap(),
        epsilon = 1e-6
    );
}

#[test]
fn test_split_rate_category_adds_one() {
    let mut engine = small_engine(SiteRates::from(FreeRate::from_gamma(2, 1.0).unwrap()), EngineConfig::default());
    engine.compute_likelihood().unwrap();
    let log_likelihood = engine.split_rate_category().unwrap();
    assert!(log_likelihood.is_finite());
    assert_eq!(engine.site_rates().n_categories(), 3);
}

/// Evolve `n_sites` columns down the tree under JC with free-rate categories
fn simulate(tree: &Tree, model: &ReversibleModel, weights: &[f64], rates: &[f64], n_sites: usize, seed: u64) -> Vec<String> {
    let mut rng = StdRng::seed_from_u64(seed);
    let n_taxa = tree.n_taxa();
    let mut columns = vec![Vec::with_capacity(n_sites); n_taxa];
    let root = n_taxa;

    for _ in 0..n_sites {
        let mut u: f64 = rng.gen();
        let mut cat = weights.len() - 1;
        for (c, &w) in weights.iter().enumerate() {
            if u < w {
                cat = c;
                break;
            }
            u -= w;
        }

        let mut states = vec![usize::MAX; tree.n_nodes()];
        states[root] = rng.gen_range(0..4);
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            for nb in tree.neighbors(node) {
                if states[nb.node] != usize::MAX {
                    continue;
                }
                let p = model.transition_matrix(tree.branch_length(nb.edge) * rates[cat]);
                let mut v: f64 = rng.gen();
                let mut next = 3;
                for y in 0..4 {
                    if v < p[[states[node], y]] {
                        next = y;
                        break;
                    }
                    v -= p[[states[node], y]];
                }
                states[nb.node] = next;
                stack.push(nb.node);
            }
        }
        for (taxon, column) in columns.iter_mut().enumerate() {
            column.push(b"ACGT"[states[taxon]] as char);
        }
    }
    columns.into_iter().map(|c| c.into_iter().collect()).collect()
}

/// Balanced 16-taxon tree, every branch 0.1
fn balanced_sixteen() -> (Vec<String>, String) {
    let names: Vec<String> = (0..16).map(|i| format!("t{i}")).collect();
    let mut level: Vec<String> = names.clone();
    while level.len() > 1 {
        level = level.chunks(2).map(|pair| format!("({}:0.1,{}:0.1)", pair[0], pair[1])).collect();
    }
    (names, format!("{};", level[0]))
}

#[test]
fn test_em_fits_simulated_free_rates() {
    init_tracing();
    // Near-invariant, medium and fast sites leave very different substitution counts
    let true_weights = [0.5, 0.3, 0.2];
    let raw_rates = [0.05, 1.0, 4.0];
    let mean: f64 = raw_rates.iter().zip(&true_weights).map(|(r, w)| r * w).sum();
    let true_rates: Vec<f64> = raw_rates.iter().map(|r| r / mean).collect();

    let (names, newick) = balanced_sixteen();
    let tree = Tree::from_newick(&newick, &names).unwrap();
    let model = ReversibleModel::jc69().unwrap();
    let sequences = simulate(&tree, &model, &true_weights, &true_rates, 5000, 2024);
    let taxon_refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let refs: Vec<&str> = sequences.iter().map(String::as_str).collect();
    let patterns = Arc::new(PatternSet::from_dna(&taxon_refs, &refs).unwrap());

    let config = EngineConfig {
        free_rate: FreeRateConfig {
            schedule: FreeRateSchedule::Em,
            em_max_iterations: 150,
            ..FreeRateConfig::default()
        },
        ..EngineConfig::default()
    };
    let truth = FreeRate::from_params(&[
        true_weights[0],
        true_rates[0],
        true_weights[1],
        true_rates[1],
        true_weights[2],
        true_rates[2],
    ])
    .unwrap();
    let mut reference = LikelihoodEngine::new(
        tree.clone(),
        patterns.clone(),
        Arc::new(model.clone()),
        SiteRates::from(truth),
        config.clone(),
    )
    .unwrap();
    let true_log_likelihood = reference.compute_likelihood().unwrap();

    let start = FreeRate::from_gamma(3, 1.0).unwrap();
    let mut engine = LikelihoodEngine::new(tree, patterns, Arc::new(model), SiteRates::from(start), config).unwrap();
    let report = engine.optimize_with_em().unwrap();
    let fitted = *report.log_likelihoods.last().unwrap();
    assert!(fitted > true_log_likelihood - 2.0, "EM reached {fitted}, truth scores {true_log_likelihood}");

    let rates = engine.site_rates();
    assert!(rates.rates().windows(2).all(|w| w[0] <= w[1]));
    assert_abs_diff_eq!(rates.mean_rate(), 1.0, epsilon = 1e-6);
    for (k, (&w, &expected)) in rates.weights().iter().zip(&true_weights).enumerate() {
        assert!((w - expected).abs() < 0.05, "category {k}: weight {w}, simulated with {expected}");
    }
    assert!(rates.rates()[0] < 0.2);
    assert!(rates.rates()[2] > 2.5);
}

fn free_rate_config(max_sweeps: usize) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.branch.max_sweeps = max_sweeps;
    config.branch.sweep_tolerance = 1e-4;
    config
}

#[test]
fn test_model_optimization_round_is_rates_then_branches() {
    let start = || SiteRates::from(FreeRate::from_gamma(3, 1.0).unwrap());
    let mut combined = small_engine(start(), free_rate_config(2));
    let mut manual = small_engine(start(), free_rate_config(2));

    let one_round = combined.optimize_model_parameters(0.01, 1).unwrap();
    manual.optimize_rate_parameters(0.01).unwrap();
    let expected = manual.optimize_all_branches(2, 1e-4).unwrap();
    assert_abs_diff_eq!(one_round, expected, epsilon = 1e-6);
    for (a, b) in combined.tree().branch_lengths().iter().zip(manual.tree().branch_lengths()) {
        assert_abs_diff_eq!(a, &b, epsilon = 1e-5);
    }
}

#[test]
fn test_model_optimization_converges() {
    init_tracing();
    let mut engine = small_engine(SiteRates::from(FreeRate::from_gamma(3, 1.0).unwrap()), free_rate_config(100));
    let start = engine.compute_likelihood().unwrap();
    let first = engine.optimize_model_parameters(0.01, 20).unwrap();
    assert!(first > start);
    assert_abs_diff_eq!(engine.compute_likelihood().unwrap(), first, epsilon = 1e-8);

    // Restarting from the optimum gains almost nothing
    let second = engine.optimize_model_parameters(0.01, 20).unwrap();
    assert!(second >= first - 1e-3);
    assert!(second - first < 0.1);

    let rates = engine.site_rates();
    assert_abs_diff_eq!(rates.weights().iter().sum::<f64>(), 1.0, epsilon = 1e-9);
    assert_abs_diff_eq!(rates.mean_rate(), 1.0, epsilon = 1e-6);
}
