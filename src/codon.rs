/// Codon alphabet for 61-state codon models
///
/// Codons are byte triplets over `TCAG`; indices follow the PAML order with
/// the three stop codons removed.

use once_cell::sync::Lazy;

/// Nucleotide order (PAML convention): T=0, C=1, A=2, G=3
pub const NUCLEOTIDES: [u8; 4] = *b"TCAG";

/// Standard code, amino acid per codon in TCAG-major order (`*` = stop)
const STANDARD_CODE: &[u8; 64] =
    b"FFLLSSSSYY**CC*WLLLLPPPPHHQQRRRRIIIMTTTTNNKKSSRRVVVVAAAADDEEGGGG";

pub const N_SENSE_CODONS: usize = 61;

static SENSE_CODONS: Lazy<Vec<[u8; 3]>> = Lazy::new(|| {
    (0..64)
        .filter(|&i| STANDARD_CODE[i] != b'*')
        .map(|i| [NUCLEOTIDES[i / 16], NUCLEOTIDES[(i / 4) % 4], NUCLEOTIDES[i % 4]])
        .collect()
});

/// 64-slot lookup from TCAG-major codon number to sense index
static CODON_INDEX: Lazy<[Option<u8>; 64]> = Lazy::new(|| {
    let mut table = [None; 64];
    let mut next = 0u8;
    for (i, slot) in table.iter_mut().enumerate() {
        if STANDARD_CODE[i] != b'*' {
            *slot = Some(next);
            next += 1;
        }
    }
    table
});

#[inline]
fn nucleotide_index(nuc: u8) -> Option<usize> {
    match nuc.to_ascii_uppercase() {
        b'T' | b'U' => Some(0),
        b'C' => Some(1),
        b'A' => Some(2),
        b'G' => Some(3),
        _ => None,
    }
}

#[inline]
pub fn index_to_codon(index: usize) -> [u8; 3] {
    SENSE_CODONS[index]
}

/// Sense index (0-60) of a codon; `None` for stops and non-ACGT bytes
pub fn codon_to_index(codon: &[u8]) -> Option<usize> {
    if codon.len() != 3 {
        return None;
    }
    let mut number = 0;
    for &nuc in codon {
        number = number * 4 + nucleotide_index(nuc)?;
    }
    CODON_INDEX[number].map(usize::from)
}

/// Amino acid letter of a sense codon
#[inline]
pub fn amino_acid(index: usize) -> u8 {
    let [a, b, c] = SENSE_CODONS[index];
    let number = |n: u8| nucleotide_index(n).unwrap_or(0);
    STANDARD_CODE[number(a) * 16 + number(b) * 4 + number(c)]
}

/// A<->G or C<->T
#[inline]
pub fn is_transition(nuc1: u8, nuc2: u8) -> bool {
    matches!(
        (nuc1, nuc2),
        (b'A', b'G') | (b'G', b'A') | (b'C', b'T') | (b'T', b'C')
    )
}

/// Single-nucleotide substitution between two sense codons
#[derive(Clone, Copy, Debug)]
pub struct CodonEdge {
    pub to_codon: usize,
    pub is_transition: bool,
    pub is_synonymous: bool,
}

/// All single-nucleotide neighbors of every sense codon
pub struct CodonGraph {
    pub edges: Vec<Vec<CodonEdge>>,
}

impl CodonGraph {
    fn new() -> Self {
        let edges = (0..N_SENSE_CODONS)
            .map(|i| {
                let from = index_to_codon(i);
                let mut out = Vec::with_capacity(9);
                for pos in 0..3 {
                    for &nuc in NUCLEOTIDES.iter().filter(|&&n| n != from[pos]) {
                        let mut to = from;
                        to[pos] = nuc;
                        // stop codons drop out here
                        if let Some(j) = codon_to_index(&to) {
                            out.push(CodonEdge {
                                to_codon: j,
                                is_transition: is_transition(from[pos], nuc),
                                is_synonymous: amino_acid(i) == amino_acid(j),
                            });
                        }
                    }
                }
                out
            })
            .collect();
        CodonGraph { edges }
    }

    #[inline]
    pub fn neighbors(&self, codon_index: usize) -> &[CodonEdge] {
        &self.edges[codon_index]
    }
}

static CODON_GRAPH: Lazy<CodonGraph> = Lazy::new(CodonGraph::new);

#[inline]
pub fn codon_graph() -> &'static CodonGraph {
    &CODON_GRAPH
}

/// Split a nucleotide sequence into codon states
///
/// Triplets containing gaps or ambiguity characters, and stop codons, become
/// `unknown`. Returns `None` when the length is not a multiple of three.
pub fn encode_codons(sequence: &str, unknown: u8) -> Option<Vec<u8>> {
    let bytes = sequence.as_bytes();
    if bytes.len() % 3 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(3)
            .map(|triplet| codon_to_index(triplet).map_or(unknown, |i| i as u8))
            .collect(),
    )
}
