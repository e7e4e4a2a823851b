// src/lib.rs
pub mod aggregate;
pub mod assignment;
pub mod consensus;
pub mod error;
pub mod model;
pub mod options;
pub mod otu_table;
pub mod report;
pub mod tree;
pub mod types;

use std::path::PathBuf;

use rayon::prelude::*;

use crate::aggregate::{aggregate_samples, AcceptanceCriteria, IngestStats};
use crate::consensus::{consensus_description, infer_posterior_consensus, write_consensus_fasta};
use crate::error::{OtuError, Result};
use crate::model::SharedModel;
use crate::options::SumOptions;
use crate::otu_table::OtuTable;
use crate::report::Reporter;
use crate::tree::{PhyloTree, TreeFormat};
use crate::types::{ConsensusSeq, SampleSpec};

/// Everything one summary run produces. Text is generated on demand.
#[derive(Debug)]
pub struct SummaryResults {
    pub table: OtuTable,

    /// Consensus sequence and FASTA description per table OTU, in table order
    pub consensus: Vec<(ConsensusSeq, String)>,

    /// Newick subtree spanning the table OTUs
    pub tree_newick: String,

    pub stats: IngestStats,

    /// Samples that held fewer reads than the subset size
    pub undersized_samples: Vec<String>,
}

impl SummaryResults {
    /// OTU table as TSV, with `comments` written as leading `#` lines
    pub fn get_otu_table_text(&self, comments: &[String]) -> Result<String> {
        let mut buf = Vec::new();
        self.table.write_to(&mut buf, comments)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Consensus sequences as FASTA
    pub fn get_consensus_fasta(&self) -> Result<String> {
        let mut buf = Vec::new();
        write_consensus_fasta(&mut buf, &self.consensus)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    pub fn get_tree_text(&self) -> String {
        format!("{}\n", self.tree_newick)
    }
}

/// Output of merging saved tables.
#[derive(Debug)]
pub struct MergeResults {
    pub table: OtuTable,
    /// Present when a reference tree was supplied
    pub tree_newick: Option<String>,
}

/// Resolve table OTU ids to node ids of `tree`.
fn table_node_ids(table: &OtuTable, tree: &PhyloTree) -> Result<Vec<usize>> {
    table
        .rows()
        .iter()
        .map(|row| -> Result<usize> {
            let id = row.id.parse::<i64>().map_err(|_| {
                OtuError::format("OTU table", format!("OTU id '{}' is not a node id", row.id))
            })?;
            Ok(tree.get_node(id)?.id)
        })
        .collect()
}

/// Summarize assignment files into an OTU table, consensus sequences and an
/// OTU tree.
pub fn summarize_samples(
    tree: &PhyloTree,
    model: &SharedModel,
    samples: &[SampleSpec],
    options: &SumOptions,
    db_name: &str,
    reporter: &dyn Reporter,
) -> Result<SummaryResults> {
    if samples.is_empty() {
        return Err(OtuError::Domain("no input samples given".to_string()));
    }

    // 1. Aggregate per-sample observations in parallel
    let criteria = AcceptanceCriteria {
        min_q: options.min_q,
    };
    let aggregator = aggregate_samples(
        samples,
        tree,
        criteria,
        options.identity_thresholds(),
        reporter,
    )?;
    let stats = aggregator.stats();
    reporter.info(&format!(
        "{} of {} assignments accepted into {} OTUs",
        stats.accepted,
        stats.total(),
        aggregator.num_otus()
    ));
    if stats.bad_length > 0 {
        reporter.warn(&format!(
            "{} assignments skipped: alignment length differs from {} sites",
            stats.bad_length,
            tree.num_alignment_sites()
        ));
    }

    // 2. Build and post-process the table
    reporter.info("Computing OTU Table");
    let sample_names: Vec<String> = samples.iter().map(|s| s.name.clone()).collect();
    let mut table = aggregator.build_table(&sample_names, options.min_read, options.min_sample)?;

    if options.normalize {
        reporter.info("Normalizing OTU Table");
        table.normalize(options.norm_z)?;
    }

    let mut undersized_samples = Vec::new();
    if options.subset > 0 {
        reporter.info(&format!(
            "Subsampling OTU Table to {} reads ({})",
            options.subset, options.subset_method
        ));
        undersized_samples = table.subset(options.subset, options.subset_method, options.seed)?;
        for name in &undersized_samples {
            reporter.warn(&format!(
                "sample {} has fewer than {} reads and was not subsampled",
                name, options.subset
            ));
        }
        table.prune_samples(options.subset as f64);
        table.prune_otus(options.min_read as f64);
    }

    // 3. Consensus sequences for the OTUs that made it into the table
    let pi = model.pi();
    let node_ids = table_node_ids(&table, tree)?;
    let consensus = node_ids
        .par_iter()
        .zip(table.rows().par_iter())
        .map(|(&id, row)| -> Result<(ConsensusSeq, String)> {
            let observed = aggregator.get(id).ok_or_else(|| {
                OtuError::Consistency(format!("OTU {id} is in the table but was never observed"))
            })?;
            let node = tree.get_node(id as i64)?;
            let cs = infer_posterior_consensus(node, &observed.freq, &observed.gap, options.eff_n, &pi)?;
            let desc = consensus_description(
                db_name,
                &row.taxon,
                node.anno_dist,
                observed.num_reads(),
                observed.num_samples(),
            );
            Ok((cs, desc))
        })
        .collect::<Result<Vec<_>>>()?;

    // 4. OTU tree
    let tree_newick = tree.export_subtree(node_ids, TreeFormat::Newick)?;

    Ok(SummaryResults {
        table,
        consensus,
        tree_newick,
        stats,
        undersized_samples,
    })
}

/// Merge saved OTU tables; with a `tree`, also export the subtree spanning
/// the merged OTUs.
pub fn merge_table_files(
    paths: &[PathBuf],
    tree: Option<&PhyloTree>,
    reporter: &dyn Reporter,
) -> Result<MergeResults> {
    reporter.info("Merging OTUTables");
    let mut merged = OtuTable::default();
    for path in paths {
        reporter.info(&path.display().to_string());
        let table = OtuTable::load(path)?;
        merged += &table;
    }

    let tree_newick = match tree {
        Some(tree) => {
            let ids = table_node_ids(&merged, tree)?;
            Some(tree.export_subtree(ids, TreeFormat::Newick)?)
        }
        None => None,
    };

    Ok(MergeResults {
        table: merged,
        tree_newick,
    })
}
