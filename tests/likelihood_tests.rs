use std::sync::Arc;

use approx::assert_abs_diff_eq;
use ndarray::array;
use rstest::rstest;

use phylolik::{
    Checkpoint, DiscreteGamma, EngineConfig, FreeRate, LikelihoodEngine, MemoryMode, PatternSet, RateHeterogeneity,
    ReversibleModel, Scaling, SiteRates, SubstitutionModel, Tree,
};

fn names(taxa: &[&str]) -> Vec<String> {
    taxa.iter().map(|s| s.to_string()).collect()
}

fn engine(
    newick: &str,
    taxa: &[&str],
    sequences: &[&str],
    model: ReversibleModel,
    rates: SiteRates,
    config: EngineConfig,
) -> LikelihoodEngine {
    let patterns = PatternSet::from_dna(taxa, sequences).unwrap();
    let tree = Tree::from_newick(newick, &names(taxa)).unwrap();
    LikelihoodEngine::new(tree, Arc::new(patterns), Arc::new(model), rates, config).unwrap()
}

fn nucleotide(c: u8) -> usize {
    match c {
        b'A' => 0,
        b'C' => 1,
        b'G' => 2,
        _ => 3,
    }
}

#[test]
fn test_two_leaf_closed_form() {
    // Root suppressed: a single edge of length 0.3
    let mut engine = engine(
        "(A:0.1,B:0.2);",
        &["A", "B"],
        &["AC", "AG"],
        ReversibleModel::jc69().unwrap(),
        SiteRates::default(),
        EngineConfig::default(),
    );
    let t: f64 = 0.3;
    let decay = (-4.0 * t / 3.0).exp();
    let same = (0.25 * (0.25 + 0.75 * decay)).ln();
    let different = (0.25 * (0.25 - 0.25 * decay)).ln();

    let total = engine.compute_likelihood().unwrap();
    assert_abs_diff_eq!(total, same + different, epsilon = 1e-6);
    let sites = engine.site_log_likelihoods().unwrap();
    assert_abs_diff_eq!(sites[0], same, epsilon = 1e-6);
    assert_abs_diff_eq!(sites[1], different, epsilon = 1e-6);
}

#[test]
fn test_jc_quartet_matches_closed_form() {
    let taxa = ["A", "B", "C", "D"];
    let sequences = ["ACGTTGCA", "ACGATGCC", "TCGAAGCA", "TCCAAGTA"];
    let mut engine = engine(
        "((A:0.1,B:0.2):0.05,(C:0.3,D:0.4):0.15);",
        &taxa,
        &sequences,
        ReversibleModel::jc69().unwrap(),
        SiteRates::default(),
        EngineConfig::default(),
    );
    let p = |t: f64, x: usize, y: usize| {
        let decay = (-4.0 * t / 3.0).exp();
        if x == y {
            0.25 + 0.75 * decay
        } else {
            0.25 - 0.25 * decay
        }
    };

    let computed = engine.site_log_likelihoods().unwrap();
    let mut total = 0.0;
    for site in 0..sequences[0].len() {
        let s: Vec<usize> = sequences.iter().map(|seq| nucleotide(seq.as_bytes()[site])).collect();
        let mut lh = 0.0;
        for x in 0..4 {
            for y in 0..4 {
                lh += 0.25 * p(0.1, x, s[0]) * p(0.2, x, s[1]) * p(0.2, x, y) * p(0.3, y, s[2]) * p(0.4, y, s[3]);
            }
        }
        assert_abs_diff_eq!(computed[site], lh.ln(), epsilon = 1e-10);
        total += lh.ln();
    }
    assert_abs_diff_eq!(total, -34.3971063249893, epsilon = 1e-9);
    assert_abs_diff_eq!(computed[3], -5.711341493828278, epsilon = 1e-10);
    assert_abs_diff_eq!(engine.compute_likelihood().unwrap(), total, epsilon = 1e-9);
}

#[test]
fn test_quartet_matches_brute_force_sum() {
    let taxa = ["A", "B", "C", "D"];
    let sequences = ["ACGTTGCA", "ACGATGCC", "TCGAAGCA", "TCCAAGTA"];
    let pi = array![0.3, 0.2, 0.25, 0.25];
    let model = ReversibleModel::hky85(4.0, pi.clone()).unwrap();
    let gamma = DiscreteGamma::new(4, 0.5).unwrap();
    let (cat_rates, cat_weights) = (gamma.rates().to_vec(), gamma.weights().to_vec());

    // Internal edge 0.05 + 0.15
    let mut engine = engine(
        "((A:0.1,B:0.2):0.05,(C:0.3,D:0.4):0.15);",
        &taxa,
        &sequences,
        model.clone(),
        SiteRates::from(gamma),
        EngineConfig::default(),
    );
    let computed = engine.site_log_likelihoods().unwrap();

    for site in 0..sequences[0].len() {
        let s: Vec<usize> = sequences.iter().map(|seq| nucleotide(seq.as_bytes()[site])).collect();
        let mut lh = 0.0;
        for (&r, &w) in cat_rates.iter().zip(&cat_weights) {
            let (pa, pb) = (model.transition_matrix(0.1 * r), model.transition_matrix(0.2 * r));
            let (pc, pd) = (model.transition_matrix(0.3 * r), model.transition_matrix(0.4 * r));
            let pm = model.transition_matrix(0.2 * r);
            let mut cat_lh = 0.0;
            for x in 0..4 {
                for y in 0..4 {
                    cat_lh += pi[x] * pa[[x, s[0]]] * pb[[x, s[1]]] * pm[[x, y]] * pc[[y, s[2]]] * pd[[y, s[3]]];
                }
            }
            lh += w * cat_lh;
        }
        assert_abs_diff_eq!(computed[site], lh.ln(), epsilon = 1e-6);
    }
}

fn six_taxon(config: EngineConfig) -> LikelihoodEngine {
    engine(
        "(((A:0.3,B:0.5):0.2,(C:0.4,D:0.6):0.1):0.4,(E:0.7,F:0.2):0.3);",
        &["A", "B", "C", "D", "E", "F"],
        &[
            "ACGTACGGTACCATGATTACRN",
            "ACGTTCGGTACGATGAATAC-A",
            "ACCTACGATACCTTGATTGCAA",
            "GCGTACGATTCCTTGCTTGCAT",
            "GCGAACGTTTCCAAGCATGGAY",
            "GAGAACTTTTGCAAGCATGGCT",
        ],
        ReversibleModel::gtr(&[1.2, 3.1, 0.8, 1.1, 4.2, 1.0], array![0.28, 0.22, 0.21, 0.29]).unwrap(),
        SiteRates::from(DiscreteGamma::new(4, 0.6).unwrap()),
        config,
    )
}

#[test]
fn test_auto_scaling_matches_off_on_shallow_tree() {
    let off = EngineConfig {
        scaling: Scaling::Off,
        ..EngineConfig::default()
    };
    let mut auto = six_taxon(EngineConfig::default());
    let a = auto.site_log_likelihoods().unwrap();
    let b = six_taxon(off).site_log_likelihoods().unwrap();
    for i in 0..a.len() {
        assert_abs_diff_eq!(a[i], b[i], epsilon = 1e-9);
    }
    assert_eq!(auto.stats().rescaled_blocks, 0);
}

/// 200-taxon caterpillar with long pendant branches: per-pattern likelihoods
/// sit near 4^-200, under the rescale threshold yet representable unscaled.
fn deep_caterpillar(config: EngineConfig) -> LikelihoodEngine {
    let n_taxa = 200;
    let taxa: Vec<String> = (0..n_taxa).map(|i| format!("s{i}")).collect();
    let sequences: Vec<String> = (0..n_taxa)
        .map(|i| {
            (0..30)
                .map(|j| b"ACGT"[(i * i * 3 + j * (i + 5) + i / 3) % 4] as char)
                .collect()
        })
        .collect();
    let mut newick = format!("({}:1.5,{}:1.5)", taxa[0], taxa[1]);
    for name in &taxa[2..] {
        newick = format!("({newick}:0.2,{name}:1.5)");
    }
    newick.push(';');

    let taxon_refs: Vec<&str> = taxa.iter().map(String::as_str).collect();
    let sequence_refs: Vec<&str> = sequences.iter().map(String::as_str).collect();
    engine(
        &newick,
        &taxon_refs,
        &sequence_refs,
        ReversibleModel::hky85(2.0, array![0.25, 0.25, 0.25, 0.25]).unwrap(),
        SiteRates::from(DiscreteGamma::new(4, 1.0).unwrap()),
        config,
    )
}

#[test]
fn test_rescaling_fires_on_deep_tree_and_matches_unscaled() {
    let mut off = deep_caterpillar(EngineConfig {
        scaling: Scaling::Off,
        ..EngineConfig::default()
    });
    let mut auto = deep_caterpillar(EngineConfig::default());

    let expected = off.site_log_likelihoods().unwrap();
    let got = auto.site_log_likelihoods().unwrap();
    assert_eq!(off.stats().rescaled_blocks, 0);
    assert!(auto.stats().rescaled_blocks > 0);
    for (e, g) in expected.iter().zip(&got) {
        assert!(e.is_finite());
        assert_abs_diff_eq!(g, e, epsilon = 1e-8 * e.abs());
    }
    let lowest = expected.iter().copied().fold(f64::INFINITY, f64::min);
    assert!(lowest < -256.0 * std::f64::consts::LN_2, "deepest site only reaches {lowest}");

    // Derivatives see the rescaled partials too
    let edge = auto.tree().n_edges() / 2;
    let from_off = off.compute_likelihood_derv(edge).unwrap();
    let from_auto = auto.compute_likelihood_derv(edge).unwrap();
    assert_abs_diff_eq!(
        from_auto.log_likelihood,
        from_off.log_likelihood,
        epsilon = 1e-8 * from_off.log_likelihood.abs()
    );
    assert_abs_diff_eq!(from_auto.df, from_off.df, epsilon = 1e-6 * from_off.df.abs().max(1.0));
}

#[rstest]
#[case(MemoryMode::Full)]
#[case(MemoryMode::PerNode)]
fn test_memory_modes_agree_at_every_edge(#[case] mode: MemoryMode) {
    let mut reference = six_taxon(EngineConfig::default());
    let expected = reference.compute_likelihood().unwrap();

    let mut engine = six_taxon(EngineConfig {
        memory_mode: mode,
        ..EngineConfig::default()
    });
    // Walk the edges twice so per-node slots are moved back and forth
    for _ in 0..2 {
        for edge in 0..engine.tree().n_edges() {
            assert_abs_diff_eq!(engine.compute_likelihood_branch(edge).unwrap(), expected, epsilon = 1e-8);
            engine.check_slot_invariant().unwrap();
        }
    }
}

#[test]
fn test_branch_change_matches_fresh_engine() {
    let mut engine = six_taxon(EngineConfig {
        memory_mode: MemoryMode::PerNode,
        ..EngineConfig::default()
    });
    engine.compute_likelihood().unwrap();
    engine.set_branch_length(2, 0.9).unwrap();
    let updated = engine.compute_likelihood_branch(4).unwrap();

    let mut fresh = six_taxon(EngineConfig::default());
    fresh.set_branch_length(2, 0.9).unwrap();
    assert_abs_diff_eq!(updated, fresh.compute_likelihood().unwrap(), epsilon = 1e-8);
}

fn variable_only(ascertainment: bool) -> LikelihoodEngine {
    let taxa = ["A", "B", "C", "D"];
    let sequences = ["ACGTAC", "ACTTTC", "TCGAAG", "TACAAC"];
    let mut patterns = PatternSet::from_dna(&taxa, &sequences).unwrap();
    if ascertainment {
        patterns = patterns.with_ascertainment().unwrap();
    }
    let tree = Tree::from_newick("((A:0.1,B:0.2):0.05,(C:0.3,D:0.4):0.15);", &names(&taxa)).unwrap();
    let model = ReversibleModel::jc69().unwrap();
    LikelihoodEngine::new(tree, Arc::new(patterns), Arc::new(model), SiteRates::default(), EngineConfig::default())
        .unwrap()
}

#[test]
fn test_ascertainment_correction() {
    let mut plain = variable_only(false);
    let mut corrected = variable_only(true);
    let base = plain.compute_likelihood().unwrap();
    let with_asc = corrected.compute_likelihood().unwrap();

    let mass = corrected.ascertainment_mass().unwrap();
    assert!(mass > 0.0 && mass < 1.0);
    assert_abs_diff_eq!(corrected.ascertainment_mass().unwrap(), mass, epsilon = 1e-15);
    assert_abs_diff_eq!(with_asc, base - 6.0 * (1.0 - mass).ln(), epsilon = 1e-8);

    for edge in 0..corrected.tree().n_edges() {
        assert_abs_diff_eq!(corrected.compute_likelihood_branch(edge).unwrap(), with_asc, epsilon = 1e-8);
    }
    assert_abs_diff_eq!(plain.ascertainment_mass().unwrap(), 0.0);
}

#[test]
fn test_ascertainment_rejects_constant_sites() {
    let patterns = PatternSet::from_dna(&["A", "B", "C"], &["AAC", "AGC", "ATC"]).unwrap();
    assert!(patterns.with_ascertainment().is_err());
}

#[test]
fn test_checkpoint_restores_free_rates() {
    let free = FreeRate::from_params(&[0.5, 0.3, 0.3, 1.2, 0.2, 2.6]).unwrap();
    let mut source = six_taxon(EngineConfig::default());
    source.set_site_rates(SiteRates::from(free));
    let expected = source.compute_likelihood().unwrap();

    let mut checkpoint = Checkpoint::new();
    source.save_checkpoint(&mut checkpoint);

    let mut target = six_taxon(EngineConfig::default());
    target.set_site_rates(SiteRates::from(FreeRate::from_gamma(3, 1.0).unwrap()));
    target.restore_checkpoint(&mut checkpoint).unwrap();
    assert_eq!(target.site_rates().weights(), source.site_rates().weights());
    assert_abs_diff_eq!(target.compute_likelihood().unwrap(), expected, epsilon = 1e-10);
}

#[test]
fn test_mismatched_taxa_rejected() {
    let patterns = PatternSet::from_dna(&["A", "B", "C"], &["ACG", "ACG", "ACT"]).unwrap();
    let tree = Tree::from_newick("(A:0.1,C:0.2,B:0.3);", &names(&["A", "C", "B"])).unwrap();
    let model = ReversibleModel::jc69().unwrap();
    let res = LikelihoodEngine::new(tree, Arc::new(patterns), Arc::new(model), SiteRates::default(), EngineConfig::default());
    assert!(res.is_err());
}
