//src/consensus.rs

use std::io::Write;

use nalgebra::{Matrix4xX, Vector4};

use crate::error::{OtuError, Result};
use crate::tree::TreeNode;
use crate::types::{ConsensusSeq, BASE_SYMBOLS, GAP_SYMBOL, NUM_BASES};

/// Infer the posterior consensus sequence of `node` from its observed
/// per-column base counts (`freq`, 4 x L) and gap counts (`gap`, length L).
///
/// Each column blends the observed counts with a Dirichlet pseudocount of
/// `eff_n * pi[b]` per base and calls the base of highest posterior weight
/// (lowest index on ties). A column whose gap count reaches the number of
/// observed bases is a gap, so a column without any evidence is a gap too.
pub fn infer_posterior_consensus(
    node: &TreeNode,
    freq: &Matrix4xX<u32>,
    gap: &[u32],
    eff_n: f64,
    pi: &Vector4<f64>,
) -> Result<ConsensusSeq> {
    if freq.ncols() != gap.len() {
        return Err(OtuError::Consistency(format!(
            "node {}: {} frequency columns but {} gap counts",
            node.id,
            freq.ncols(),
            gap.len()
        )));
    }
    if !(eff_n.is_finite() && eff_n >= 0.0) {
        return Err(OtuError::Domain(format!("invalid effective count {eff_n}")));
    }

    let prior = pi * eff_n;
    let seq: String = freq
        .column_iter()
        .zip(gap)
        .map(|(observed, &gaps)| {
            let total: u64 = observed.iter().map(|&c| c as u64).sum();
            if gaps as u64 >= total {
                return GAP_SYMBOL;
            }
            let mut best = 0;
            let mut best_weight = f64::NEG_INFINITY;
            for b in 0..NUM_BASES {
                let weight = observed[b] as f64 + prior[b];
                // strict comparison keeps the lowest index on ties
                if weight > best_weight {
                    best = b;
                    best_weight = weight;
                }
            }
            BASE_SYMBOLS[best]
        })
        .collect();

    Ok(ConsensusSeq {
        name: node.id.to_string(),
        seq,
    })
}

/// Annotation written after a consensus sequence's name.
pub fn consensus_description(
    db_name: &str,
    taxon: &str,
    anno_dist: f64,
    read_count: u64,
    sample_hits: usize,
) -> String {
    format!(
        "DBName={};Taxonomy=\"{}\";AnnoDist={};ReadCount={};SampleHits={}",
        db_name, taxon, anno_dist, read_count, sample_hits
    )
}

/// Write consensus sequences as FASTA, one `(sequence, description)` per record.
pub fn write_consensus_fasta<W: Write>(
    out: &mut W,
    records: &[(ConsensusSeq, String)],
) -> std::io::Result<()> {
    for (cs, desc) in records {
        if desc.is_empty() {
            writeln!(out, ">{}", cs.name)?;
        } else {
            writeln!(out, ">{} {}", cs.name, desc)?;
        }
        writeln!(out, "{}", cs.seq)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::PhyloTree;

    fn node() -> TreeNode {
        let mut tree = PhyloTree::new(1);
        tree.add_node("otu", "Bacteria", None, 0.0).unwrap();
        tree.get_node(0).unwrap().clone()
    }

    fn columns(cols: &[[u32; 4]]) -> Matrix4xX<u32> {
        let mut m = Matrix4xX::zeros(cols.len());
        for (j, col) in cols.iter().enumerate() {
            for b in 0..4 {
                m[(b, j)] = col[b];
            }
        }
        m
    }

    #[test]
    fn plurality_vote_without_prior() {
        let freq = columns(&[[5, 0, 0, 0], [1, 2, 0, 0], [0, 0, 0, 3]]);
        let cs = infer_posterior_consensus(&node(), &freq, &[0, 0, 0], 0.0, &Vector4::repeat(0.25))
            .unwrap();
        assert_eq!(cs.seq, "ACT");
        assert_eq!(cs.name, "0");
    }

    #[test]
    fn ties_break_to_lowest_index() {
        let freq = columns(&[[0, 2, 2, 0], [1, 1, 1, 1]]);
        let cs = infer_posterior_consensus(&node(), &freq, &[0, 0], 0.0, &Vector4::repeat(0.25))
            .unwrap();
        assert_eq!(cs.seq, "CA");
    }

    #[test]
    fn prior_shifts_only_weak_evidence() {
        let g_rich = Vector4::new(0.1, 0.1, 0.7, 0.1);
        // one read saying A versus a pseudocount of 10 leaning to G
        let weak = columns(&[[1, 0, 0, 0]]);
        let cs = infer_posterior_consensus(&node(), &weak, &[0], 10.0, &g_rich).unwrap();
        assert_eq!(cs.seq, "G");

        // fifty reads saying A are not overruled
        let strong = columns(&[[50, 0, 0, 0]]);
        let cs = infer_posterior_consensus(&node(), &strong, &[0], 10.0, &g_rich).unwrap();
        assert_eq!(cs.seq, "A");
    }

    #[test]
    fn gaps_win_at_equality() {
        let freq = columns(&[[2, 1, 0, 0], [2, 1, 0, 0], [0, 0, 0, 0]]);
        let cs = infer_posterior_consensus(&node(), &freq, &[3, 2, 0], 2.0, &Vector4::repeat(0.25))
            .unwrap();
        assert_eq!(cs.seq, "-A-");
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let freq = columns(&[[1, 0, 0, 0]]);
        let err = infer_posterior_consensus(&node(), &freq, &[0, 0], 2.0, &Vector4::repeat(0.25))
            .unwrap_err();
        assert!(matches!(err, OtuError::Consistency(_)));
        assert!(infer_posterior_consensus(&node(), &freq, &[0], -1.0, &Vector4::repeat(0.25)).is_err());
    }

    #[test]
    fn writes_fasta_records() {
        let cs = ConsensusSeq {
            name: "17".to_string(),
            seq: "AC-T".to_string(),
        };
        let desc = consensus_description("gg97", "Bacillus", 0.035, 12, 3);
        let mut out = Vec::new();
        write_consensus_fasta(&mut out, &[(cs, desc)]).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            ">17 DBName=gg97;Taxonomy=\"Bacillus\";AnnoDist=0.035;ReadCount=12;SampleHits=3\nAC-T\n"
        );
    }
}
