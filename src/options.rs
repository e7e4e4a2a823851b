//src/options.rs

use crate::assignment::IdentityThresholds;
use crate::otu_table::SubsetMethod;

pub const DEFAULT_EFFECTIVE_N: f64 = 2.0;

/// Settings for summarizing assignment files into an OTU table.
#[derive(Debug, Clone, PartialEq)]
pub struct SumOptions {
    /// Prior pseudocount for consensus inference.
    pub eff_n: f64,
    pub min_read: u64,
    pub min_sample: usize,
    pub min_q: f64,
    pub min_aln_identity: f64,
    pub min_hmm_identity: f64,
    pub normalize: bool,
    /// Target column total; 0 picks the smallest non-zero sample total.
    pub norm_z: f64,
    /// Rarefy every sample to this many reads; 0 disables subsetting.
    pub subset: u64,
    pub subset_method: SubsetMethod,
    pub seed: u64,
}

impl Default for SumOptions {
    fn default() -> Self {
        Self {
            eff_n: DEFAULT_EFFECTIVE_N,
            min_read: 0,
            min_sample: 0,
            min_q: 0.0,
            min_aln_identity: 0.0,
            min_hmm_identity: 0.0,
            normalize: false,
            norm_z: 0.0,
            subset: 0,
            subset_method: SubsetMethod::Uniform,
            seed: 0,
        }
    }
}

impl SumOptions {
    pub fn identity_thresholds(&self) -> IdentityThresholds {
        IdentityThresholds {
            min_aln_identity: self.min_aln_identity,
            min_hmm_identity: self.min_hmm_identity,
        }
    }
}
