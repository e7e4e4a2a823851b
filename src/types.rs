//src/types.rs

/// Number of nucleotide symbols (A, C, G, T).
pub const NUM_BASES: usize = 4;

pub const BASE_A: usize = 0;
pub const BASE_C: usize = 1;
pub const BASE_G: usize = 2;
pub const BASE_T: usize = 3;

/// Symbols in index order; `GAP_SYMBOL` stands for every non-base column.
pub const BASE_SYMBOLS: [char; NUM_BASES] = ['A', 'C', 'G', 'T'];
pub const GAP_SYMBOL: char = '-';

/// Encode one alignment symbol into a base index.
/// Gaps, padding and degenerate codes all map to `None`.
#[inline]
pub fn encode_base(b: u8) -> Option<usize> {
    match b {
        b'A' | b'a' => Some(BASE_A),
        b'C' | b'c' => Some(BASE_C),
        b'G' | b'g' => Some(BASE_G),
        b'T' | b't' | b'U' | b'u' => Some(BASE_T),
        _ => None,
    }
}

/// One line of placement output for a single read.
#[derive(Debug, Clone)]
pub struct AssignmentRecord {
    pub read_id: String,
    /// 1-based inclusive bounds of the aligned region on the consensus.
    pub cs_start: usize,
    pub cs_end: usize,
    /// Gapped alignment over all `L` consensus columns.
    pub alignment: String,
    /// Assigned node; negative means unassigned.
    pub taxon_id: i64,
    /// Negative log10 posterior error of the assignment.
    pub q_taxon: f64,
    pub aln_identity_pass: bool,
    pub hmm_identity_pass: bool,
}

/// A sample's display name and the file its assignments live in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleSpec {
    pub name: String,
    pub path: std::path::PathBuf,
}

/// Posterior consensus sequence of one OTU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusSeq {
    pub name: String,
    pub seq: String,
}
