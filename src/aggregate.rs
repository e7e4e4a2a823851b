//src/aggregate.rs

use std::ops::AddAssign;

use ahash::AHashMap;
use nalgebra::Matrix4xX;
use rayon::prelude::*;

use crate::assignment::{open_assignment_file, IdentityThresholds};
use crate::error::{OtuError, Result};
use crate::otu_table::OtuTable;
use crate::report::Reporter;
use crate::tree::{PhyloTree, TreeNode};
use crate::types::{encode_base, AssignmentRecord, SampleSpec};

/// Per-node observations accumulated across all samples.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedOtu {
    pub id: usize,
    pub taxon: String,
    /// Accepted reads per sample.
    pub counts: Vec<u64>,
    /// Base counts per alignment column (4 x L).
    pub freq: Matrix4xX<u32>,
    /// Gap counts per alignment column.
    pub gap: Vec<u32>,
}

impl ObservedOtu {
    pub fn new(node: &TreeNode, num_sites: usize, num_samples: usize) -> Self {
        Self {
            id: node.id,
            taxon: node.taxon.clone(),
            counts: vec![0; num_samples],
            freq: Matrix4xX::zeros(num_sites),
            gap: vec![0; num_sites],
        }
    }

    pub fn num_reads(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn num_samples(&self) -> usize {
        self.counts.iter().filter(|&&c| c > 0).count()
    }

    fn observe(&mut self, sample: usize, alignment: &[u8]) {
        self.counts[sample] += 1;
        for (j, &sym) in alignment.iter().enumerate() {
            match encode_base(sym) {
                Some(b) => self.freq[(b, j)] += 1,
                None => self.gap[j] += 1,
            }
        }
    }

    fn absorb(&mut self, other: &ObservedOtu) {
        for (a, b) in self.counts.iter_mut().zip(&other.counts) {
            *a += b;
        }
        self.freq += &other.freq;
        for (a, b) in self.gap.iter_mut().zip(&other.gap) {
            *a += b;
        }
    }
}

/// Minimum placement quality for a record to count.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AcceptanceCriteria {
    pub min_q: f64,
}

/// Tally of how records were handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub accepted: u64,
    pub unassigned: u64,
    pub low_quality: u64,
    pub low_aln_identity: u64,
    pub low_hmm_identity: u64,
    pub bad_length: u64,
}

impl IngestStats {
    pub fn total(&self) -> u64 {
        self.accepted + self.rejected()
    }

    pub fn rejected(&self) -> u64 {
        self.unassigned
            + self.low_quality
            + self.low_aln_identity
            + self.low_hmm_identity
            + self.bad_length
    }
}

impl AddAssign for IngestStats {
    fn add_assign(&mut self, rhs: Self) {
        self.accepted += rhs.accepted;
        self.unassigned += rhs.unassigned;
        self.low_quality += rhs.low_quality;
        self.low_aln_identity += rhs.low_aln_identity;
        self.low_hmm_identity += rhs.low_hmm_identity;
        self.bad_length += rhs.bad_length;
    }
}

/// Collects accepted assignments into per-node observations.
#[derive(Debug, Clone)]
pub struct OtuAggregator {
    num_samples: usize,
    num_sites: usize,
    criteria: AcceptanceCriteria,
    otus: AHashMap<usize, ObservedOtu>,
    stats: IngestStats,
}

impl OtuAggregator {
    pub fn new(num_samples: usize, num_sites: usize, criteria: AcceptanceCriteria) -> Self {
        Self {
            num_samples,
            num_sites,
            criteria,
            otus: AHashMap::new(),
            stats: IngestStats::default(),
        }
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    pub fn num_otus(&self) -> usize {
        self.otus.len()
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    pub fn get(&self, id: usize) -> Option<&ObservedOtu> {
        self.otus.get(&id)
    }

    /// Add one record for `sample`. Returns whether it was accepted.
    ///
    /// A record assigned to a node missing from `tree` is an error, not a
    /// rejection.
    pub fn ingest(
        &mut self,
        sample: usize,
        record: &AssignmentRecord,
        tree: &PhyloTree,
    ) -> Result<bool> {
        if sample >= self.num_samples {
            return Err(OtuError::Consistency(format!(
                "sample index {} out of range for {} samples",
                sample, self.num_samples
            )));
        }

        if record.taxon_id < 0 {
            self.stats.unassigned += 1;
            return Ok(false);
        }
        if record.q_taxon < self.criteria.min_q {
            self.stats.low_quality += 1;
            return Ok(false);
        }
        if !record.aln_identity_pass {
            self.stats.low_aln_identity += 1;
            return Ok(false);
        }
        if !record.hmm_identity_pass {
            self.stats.low_hmm_identity += 1;
            return Ok(false);
        }
        let alignment = record.alignment.as_bytes();
        if alignment.len() != self.num_sites {
            self.stats.bad_length += 1;
            return Ok(false);
        }

        let node = tree.get_node(record.taxon_id)?;
        let (num_sites, num_samples) = (self.num_sites, self.num_samples);
        self.otus
            .entry(node.id)
            .or_insert_with(|| ObservedOtu::new(node, num_sites, num_samples))
            .observe(sample, alignment);
        self.stats.accepted += 1;
        Ok(true)
    }

    /// Fold `other` into `self` by elementwise sums.
    pub fn merge(&mut self, other: OtuAggregator) -> Result<()> {
        if other.num_samples != self.num_samples || other.num_sites != self.num_sites {
            return Err(OtuError::Consistency(format!(
                "cannot merge aggregators of {}x{} and {}x{} (samples x sites)",
                self.num_samples, self.num_sites, other.num_samples, other.num_sites
            )));
        }
        self.otus.reserve(other.otus.len());
        for (id, otu) in other.otus {
            match self.otus.get_mut(&id) {
                Some(existing) => existing.absorb(&otu),
                None => {
                    self.otus.insert(id, otu);
                }
            }
        }
        self.stats += other.stats;
        Ok(())
    }

    /// Build a table of the OTUs with at least `min_read` reads seen in at
    /// least `min_sample` samples, in ascending node-id order.
    pub fn build_table(
        &self,
        sample_names: &[String],
        min_read: u64,
        min_sample: usize,
    ) -> Result<OtuTable> {
        if sample_names.len() != self.num_samples {
            return Err(OtuError::Consistency(format!(
                "{} sample names for {} samples",
                sample_names.len(),
                self.num_samples
            )));
        }
        let mut ids: Vec<usize> = self.otus.keys().copied().collect();
        ids.sort_unstable();

        let mut table = OtuTable::new(sample_names.to_vec());
        for id in ids {
            let otu = &self.otus[&id];
            if otu.num_reads() >= min_read && otu.num_samples() >= min_sample {
                let values = otu.counts.iter().map(|&c| c as f64).collect();
                table.add_otu(&otu.id.to_string(), &otu.taxon, values)?;
            }
        }
        Ok(table)
    }
}

/// Aggregate every sample file on the rayon pool, one shard per file.
pub fn aggregate_samples(
    samples: &[SampleSpec],
    tree: &PhyloTree,
    criteria: AcceptanceCriteria,
    thresholds: IdentityThresholds,
    reporter: &dyn Reporter,
) -> Result<OtuAggregator> {
    let num_samples = samples.len();
    let num_sites = tree.num_alignment_sites();

    samples
        .par_iter()
        .enumerate()
        .map(|(s, sample)| -> Result<OtuAggregator> {
            reporter.info(&format!("Processing sample {} ...", sample.name));
            let mut shard = OtuAggregator::new(num_samples, num_sites, criteria);
            for record in open_assignment_file(&sample.path, thresholds)? {
                shard.ingest(s, &record?, tree)?;
            }
            let stats = shard.stats();
            reporter.debug(&format!(
                "Sample {}: {} of {} records accepted",
                sample.name,
                stats.accepted,
                stats.total()
            ));
            Ok(shard)
        })
        .try_reduce(
            || OtuAggregator::new(num_samples, num_sites, criteria),
            |mut a, b| {
                a.merge(b)?;
                Ok(a)
            },
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::LogReporter;

    fn tree() -> PhyloTree {
        let mut tree = PhyloTree::new(4);
        let root = tree.add_node("root", "Bacteria", None, 0.0).unwrap();
        let a = tree.add_node("a", "Bacteria;Firmicutes", Some(root), 0.1).unwrap();
        tree.add_node("b", "Bacteria;Proteobacteria", Some(root), 0.2).unwrap();
        tree.add_node("c", "Bacteria;Firmicutes;Bacilli", Some(a), 0.05).unwrap();
        tree
    }

    fn record(taxon_id: i64, q: f64, alignment: &str) -> AssignmentRecord {
        AssignmentRecord {
            read_id: "r".to_string(),
            cs_start: 1,
            cs_end: alignment.len(),
            alignment: alignment.to_string(),
            taxon_id,
            q_taxon: q,
            aln_identity_pass: true,
            hmm_identity_pass: true,
        }
    }

    #[test]
    fn ingest_counts_bases_and_gaps() {
        let tree = tree();
        let mut agg = OtuAggregator::new(2, 4, AcceptanceCriteria::default());
        assert!(agg.ingest(0, &record(3, 10.0, "AC-T"), &tree).unwrap());
        assert!(agg.ingest(1, &record(3, 10.0, "acgN"), &tree).unwrap());

        let otu = agg.get(3).unwrap();
        assert_eq!(otu.counts, vec![1, 1]);
        assert_eq!(otu.taxon, "Bacteria;Firmicutes;Bacilli");
        assert_eq!(otu.freq[(0, 0)], 2);
        assert_eq!(otu.freq[(1, 1)], 2);
        assert_eq!(otu.freq[(2, 2)], 1);
        assert_eq!(otu.gap, vec![0, 0, 1, 1]);
        assert_eq!(otu.num_reads(), 2);
        assert_eq!(otu.num_samples(), 2);
    }

    #[test]
    fn rejections_are_tallied() {
        let tree = tree();
        let mut agg = OtuAggregator::new(1, 4, AcceptanceCriteria { min_q: 5.0 });
        assert!(!agg.ingest(0, &record(-1, 50.0, "ACGT"), &tree).unwrap());
        assert!(!agg.ingest(0, &record(1, 4.9, "ACGT"), &tree).unwrap());
        let mut low_aln = record(1, 50.0, "ACGT");
        low_aln.aln_identity_pass = false;
        assert!(!agg.ingest(0, &low_aln, &tree).unwrap());
        let mut low_hmm = record(1, 50.0, "ACGT");
        low_hmm.hmm_identity_pass = false;
        assert!(!agg.ingest(0, &low_hmm, &tree).unwrap());
        assert!(!agg.ingest(0, &record(1, 50.0, "ACG"), &tree).unwrap());
        assert!(agg.ingest(0, &record(1, 5.0, "ACGT"), &tree).unwrap());

        let stats = agg.stats();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.unassigned, 1);
        assert_eq!(stats.low_quality, 1);
        assert_eq!(stats.low_aln_identity, 1);
        assert_eq!(stats.low_hmm_identity, 1);
        assert_eq!(stats.bad_length, 1);
        assert_eq!(stats.total(), 6);
        assert_eq!(agg.num_otus(), 1);
    }

    #[test]
    fn unknown_node_is_lookup_error() {
        let tree = tree();
        let mut agg = OtuAggregator::new(1, 4, AcceptanceCriteria::default());
        let err = agg.ingest(0, &record(42, 1.0, "ACGT"), &tree).unwrap_err();
        assert!(matches!(err, OtuError::Lookup(42)));
        assert!(agg.ingest(3, &record(1, 1.0, "ACGT"), &tree).is_err());
    }

    #[test]
    fn shards_merge_to_serial_totals() {
        let tree = tree();
        let records = [
            (0, record(1, 1.0, "ACGT")),
            (1, record(1, 1.0, "ACGA")),
            (1, record(2, 1.0, "TT--")),
            (2, record(3, 1.0, "GGGG")),
            (0, record(3, 1.0, "GG-G")),
            (2, record(-1, 1.0, "GGGG")),
        ];

        let mut serial = OtuAggregator::new(3, 4, AcceptanceCriteria::default());
        for (s, rec) in &records {
            serial.ingest(*s, rec, &tree).unwrap();
        }

        let mut merged = OtuAggregator::new(3, 4, AcceptanceCriteria::default());
        for sample in 0..3 {
            let mut shard = OtuAggregator::new(3, 4, AcceptanceCriteria::default());
            for (s, rec) in records.iter().filter(|(s, _)| *s == sample) {
                shard.ingest(*s, rec, &tree).unwrap();
            }
            merged.merge(shard).unwrap();
        }

        assert_eq!(merged.stats(), serial.stats());
        for id in [1, 2, 3] {
            assert_eq!(merged.get(id), serial.get(id));
        }
        assert!(merged.merge(OtuAggregator::new(2, 4, AcceptanceCriteria::default())).is_err());
    }

    #[test]
    fn build_table_filters_and_orders() {
        let tree = tree();
        let mut agg = OtuAggregator::new(2, 4, AcceptanceCriteria::default());
        for _ in 0..3 {
            agg.ingest(0, &record(3, 1.0, "ACGT"), &tree).unwrap();
        }
        agg.ingest(1, &record(3, 1.0, "ACGT"), &tree).unwrap();
        agg.ingest(0, &record(1, 1.0, "ACGT"), &tree).unwrap();
        agg.ingest(1, &record(2, 1.0, "ACGT"), &tree).unwrap();
        agg.ingest(1, &record(2, 1.0, "ACGT"), &tree).unwrap();

        let names = vec!["s1".to_string(), "s2".to_string()];
        let all = agg.build_table(&names, 0, 0).unwrap();
        let ids: Vec<&str> = all.rows().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(all.get("3").unwrap().values, vec![3.0, 1.0]);

        let filtered = agg.build_table(&names, 2, 2).unwrap();
        assert_eq!(filtered.num_otus(), 1);
        assert_eq!(filtered.rows()[0].id, "3");

        assert!(agg.build_table(&names[..1], 0, 0).is_err());
    }

    #[test]
    fn aggregates_sample_files_in_parallel() {
        let dir = tempfile::tempdir().unwrap();
        let header = "CS_start\tCS_end\talignment\ttaxon_id\tQ_taxon\n";
        let mut samples = Vec::new();
        for (i, body) in ["1\t4\tACGT\t3\t9\n1\t4\tACGA\t1\t9\n", "1\t4\tACGT\t3\t0.5\n"]
            .iter()
            .enumerate()
        {
            let path = dir.path().join(format!("s{i}.tsv"));
            std::fs::write(&path, format!("{header}{body}")).unwrap();
            samples.push(SampleSpec {
                name: format!("s{i}"),
                path,
            });
        }

        let agg = aggregate_samples(
            &samples,
            &tree(),
            AcceptanceCriteria { min_q: 1.0 },
            IdentityThresholds::default(),
            &LogReporter,
        )
        .unwrap();
        assert_eq!(agg.get(3).unwrap().counts, vec![1, 0]);
        assert_eq!(agg.get(1).unwrap().counts, vec![1, 0]);
        assert_eq!(agg.stats().low_quality, 1);
    }
}
