/// Compressed site patterns
///
/// Codes `0..n_states` are observed states, then one code per ambiguity
/// mask, then a single `unknown` code compatible with every state.

use std::collections::HashMap;

use crate::codon::{encode_codons, N_SENSE_CODONS};
use crate::error::{PhyloError, Result};

pub type State = u8;

/// IUPAC nucleotide ambiguity masks over A=1, C=2, G=4, T=8
const DNA_AMBIGUITY: [(u8, u64); 10] = [
    (b'R', 0b0101),
    (b'Y', 0b1010),
    (b'S', 0b0110),
    (b'W', 0b1001),
    (b'K', 0b1100),
    (b'M', 0b0011),
    (b'B', 0b1110),
    (b'D', 0b1101),
    (b'H', 0b1011),
    (b'V', 0b0111),
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pattern {
    /// One code per taxon
    pub states: Vec<State>,
    /// Number of alignment sites with this column
    pub frequency: u32,
}

#[derive(Clone, Debug)]
pub struct PatternSet {
    n_states: usize,
    taxa: Vec<String>,
    ambiguity: Vec<u64>,
    patterns: Vec<Pattern>,
    /// Constant states never observed, appended after the real patterns
    unobserved: Vec<State>,
    /// Pattern index of every alignment site
    site_patterns: Vec<usize>,
}

impl PatternSet {
    /// Compress aligned rows (one per taxon) into patterns
    pub fn new(
        n_states: usize,
        ambiguity: Vec<u64>,
        taxa: Vec<String>,
        rows: &[Vec<State>],
    ) -> Result<Self> {
        if n_states < 2 || n_states > 64 {
            return Err(PhyloError::malformed(format!(
                "number of states must lie in 2..=64, got {n_states}"
            )));
        }
        let n_codes = n_states + ambiguity.len() + 1;
        if n_codes > usize::from(State::MAX) + 1 {
            return Err(PhyloError::malformed(format!("{n_codes} state codes do not fit in a byte")));
        }
        let full = full_mask(n_states);
        if ambiguity.iter().any(|&m| m == 0 || m & !full != 0) {
            return Err(PhyloError::malformed("ambiguity mask outside the state alphabet"));
        }
        if taxa.len() != rows.len() {
            return Err(PhyloError::malformed(format!(
                "{} taxon names for {} sequences",
                taxa.len(),
                rows.len()
            )));
        }
        if taxa.len() < 2 {
            return Err(PhyloError::malformed("need at least two sequences"));
        }
        let n_sites = rows[0].len();
        if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != n_sites) {
            return Err(PhyloError::malformed(format!(
                "sequence '{}' has {} sites, expected {}",
                taxa[i],
                row.len(),
                n_sites
            )));
        }
        if n_sites == 0 {
            return Err(PhyloError::malformed("alignment has no sites"));
        }
        if let Some(row) = rows.iter().position(|r| r.iter().any(|&c| usize::from(c) >= n_codes)) {
            return Err(PhyloError::malformed(format!(
                "sequence '{}' contains a code outside 0..{}",
                taxa[row], n_codes
            )));
        }

        let mut index: HashMap<Vec<State>, usize> = HashMap::new();
        let mut patterns: Vec<Pattern> = Vec::new();
        let mut site_patterns = Vec::with_capacity(n_sites);
        for site in 0..n_sites {
            let column: Vec<State> = rows.iter().map(|r| r[site]).collect();
            let id = *index.entry(column.clone()).or_insert_with(|| {
                patterns.push(Pattern {
                    states: column,
                    frequency: 0,
                });
                patterns.len() - 1
            });
            patterns[id].frequency += 1;
            site_patterns.push(id);
        }

        Ok(Self {
            n_states,
            taxa,
            ambiguity,
            patterns,
            unobserved: Vec::new(),
            site_patterns,
        })
    }

    /// Nucleotide sequences with IUPAC ambiguity; gaps, `N`, `?` are unknown
    pub fn from_dna(taxa: &[&str], sequences: &[&str]) -> Result<Self> {
        let unknown = (4 + DNA_AMBIGUITY.len()) as State;
        let rows = sequences
            .iter()
            .zip(taxa)
            .map(|(seq, name)| {
                seq.bytes()
                    .map(|b| encode_nucleotide(b, unknown).ok_or_else(|| {
                        PhyloError::malformed(format!(
                            "invalid character '{}' in sequence '{name}'",
                            b as char
                        ))
                    }))
                    .collect::<Result<Vec<State>>>()
            })
            .collect::<Result<Vec<_>>>()?;
        let masks = DNA_AMBIGUITY.iter().map(|&(_, m)| m).collect();
        Self::new(4, masks, taxa.iter().map(|s| s.to_string()).collect(), &rows)
    }

    /// In-frame coding sequences over the 61 sense codons
    pub fn from_codons(taxa: &[&str], sequences: &[&str]) -> Result<Self> {
        let unknown = N_SENSE_CODONS as State;
        let rows = sequences
            .iter()
            .zip(taxa)
            .map(|(seq, name)| {
                encode_codons(seq, unknown).ok_or_else(|| {
                    PhyloError::malformed(format!("sequence '{name}' length is not a multiple of 3"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(N_SENSE_CODONS, Vec::new(), taxa.iter().map(|s| s.to_string()).collect(), &rows)
    }

    /// Condition on variable sites: append every constant pattern as unobserved
    ///
    /// Fails if the alignment contains a constant column, since the correction
    /// assumes those were filtered out.
    pub fn with_ascertainment(mut self) -> Result<Self> {
        for state in 0..self.n_states as State {
            if let Some(id) = self.patterns.iter().position(|p| p.states.iter().all(|&s| s == state)) {
                let site = self.site_patterns.iter().position(|&p| p == id).unwrap_or(0);
                return Err(PhyloError::malformed(format!(
                    "ascertainment correction requires variable sites, but site {} is constant",
                    site + 1
                )));
            }
        }
        self.unobserved = (0..self.n_states as State).collect();
        Ok(self)
    }

    pub fn n_taxa(&self) -> usize {
        self.taxa.len()
    }

    pub fn taxa(&self) -> &[String] {
        &self.taxa
    }

    pub fn n_states(&self) -> usize {
        self.n_states
    }

    pub fn n_codes(&self) -> usize {
        self.n_states + self.ambiguity.len() + 1
    }

    pub fn unknown_code(&self) -> State {
        (self.n_states + self.ambiguity.len()) as State
    }

    /// Observed patterns
    pub fn n_patterns(&self) -> usize {
        self.patterns.len()
    }

    /// Observed plus unobserved patterns
    pub fn n_total_patterns(&self) -> usize {
        self.patterns.len() + self.unobserved.len()
    }

    pub fn n_sites(&self) -> usize {
        self.site_patterns.len()
    }

    pub fn has_ascertainment(&self) -> bool {
        !self.unobserved.is_empty()
    }

    pub fn patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    pub fn site_pattern(&self, site: usize) -> usize {
        self.site_patterns[site]
    }

    pub fn site_patterns(&self) -> &[usize] {
        &self.site_patterns
    }

    /// Code of `taxon` in pattern `ptn`, where unobserved patterns follow the real ones
    #[inline]
    pub fn state(&self, ptn: usize, taxon: usize) -> State {
        match self.patterns.get(ptn) {
            Some(p) => p.states[taxon],
            None => self.unobserved[ptn - self.patterns.len()],
        }
    }

    /// Site counts per pattern; unobserved patterns weigh zero
    pub fn frequencies(&self) -> Vec<f64> {
        self.patterns
            .iter()
            .map(|p| f64::from(p.frequency))
            .chain(std::iter::repeat(0.0).take(self.unobserved.len()))
            .collect()
    }

    /// Bitmask of the states a code stands for
    pub fn compatible_states(&self, code: State) -> u64 {
        let code = usize::from(code);
        if code < self.n_states {
            1 << code
        } else if code < self.n_states + self.ambiguity.len() {
            self.ambiguity[code - self.n_states]
        } else {
            full_mask(self.n_states)
        }
    }

    /// Distinct codes found at one taxon, unobserved patterns included
    pub fn leaf_codes(&self, taxon: usize) -> Vec<State> {
        let mut seen = vec![false; self.n_codes()];
        for ptn in 0..self.n_total_patterns() {
            seen[usize::from(self.state(ptn, taxon))] = true;
        }
        seen.iter()
            .enumerate()
            .filter(|(_, &s)| s)
            .map(|(c, _)| c as State)
            .collect()
    }
}

fn full_mask(n_states: usize) -> u64 {
    if n_states == 64 {
        u64::MAX
    } else {
        (1u64 << n_states) - 1
    }
}

fn encode_nucleotide(b: u8, unknown: State) -> Option<State> {
    let upper = b.to_ascii_uppercase();
    match upper {
        b'A' => Some(0),
        b'C' => Some(1),
        b'G' => Some(2),
        b'T' | b'U' => Some(3),
        b'N' | b'-' | b'?' | b'.' | b'X' => Some(unknown),
        _ => DNA_AMBIGUITY
            .iter()
            .position(|&(c, _)| c == upper)
            .map(|i| (4 + i) as State),
    }
}
