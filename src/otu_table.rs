//src/otu_table.rs

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::ops::AddAssign;
use std::path::Path;
use std::str::FromStr;

use ahash::AHashMap;
use rand::rngs::StdRng;
use rand::seq::index;
use rand::SeedableRng;
use rand_distr::{Binomial, Distribution};

use crate::error::{OtuError, Result};

pub const HEADER_OTU_ID: &str = "OTUID";
pub const HEADER_TAXONOMY: &str = "Taxonomy";

/// How `OtuTable::subset` draws reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SubsetMethod {
    /// Without replacement.
    #[default]
    Uniform,
    /// With replacement.
    Multinomial,
}

impl FromStr for SubsetMethod {
    type Err = OtuError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "uniform" => Ok(SubsetMethod::Uniform),
            "multinomial" => Ok(SubsetMethod::Multinomial),
            other => Err(OtuError::format(
                "subset method",
                format!("unknown method '{other}', expected 'uniform' or 'multinomial'"),
            )),
        }
    }
}

impl fmt::Display for SubsetMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubsetMethod::Uniform => write!(f, "uniform"),
            SubsetMethod::Multinomial => write!(f, "multinomial"),
        }
    }
}

/// One OTU's row: id, taxonomy label and one value per sample.
#[derive(Debug, Clone, PartialEq)]
pub struct OtuRow {
    pub id: String,
    pub taxon: String,
    pub values: Vec<f64>,
}

impl OtuRow {
    pub fn total(&self) -> f64 {
        self.values.iter().sum()
    }
}

/// Abundance table of OTUs (rows) by samples (columns).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OtuTable {
    samples: Vec<String>,
    rows: Vec<OtuRow>,
    index: AHashMap<String, usize>,
}

impl OtuTable {
    pub fn new(samples: Vec<String>) -> Self {
        Self {
            samples,
            rows: Vec::new(),
            index: AHashMap::new(),
        }
    }

    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn num_otus(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &[OtuRow] {
        &self.rows
    }

    pub fn get(&self, id: &str) -> Option<&OtuRow> {
        self.index.get(id).map(|&i| &self.rows[i])
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Add a row. Adding an id already present sums into that row.
    pub fn add_otu(&mut self, id: &str, taxon: &str, values: Vec<f64>) -> Result<()> {
        if values.len() != self.samples.len() {
            return Err(OtuError::Consistency(format!(
                "OTU {} has {} values for {} samples",
                id,
                values.len(),
                self.samples.len()
            )));
        }
        match self.index.get(id) {
            Some(&i) => {
                for (a, b) in self.rows[i].values.iter_mut().zip(values) {
                    *a += b;
                }
            }
            None => {
                self.index.insert(id.to_string(), self.rows.len());
                self.rows.push(OtuRow {
                    id: id.to_string(),
                    taxon: taxon.to_string(),
                    values,
                });
            }
        }
        Ok(())
    }

    /// Column totals, one per sample.
    pub fn sample_totals(&self) -> Vec<f64> {
        let mut totals = vec![0.0; self.samples.len()];
        for row in &self.rows {
            for (t, v) in totals.iter_mut().zip(&row.values) {
                *t += v;
            }
        }
        totals
    }

    /// Merge `other` into `self`.
    ///
    /// Samples are unioned (new columns start at zero); rows with the same
    /// OTU id are summed and the existing taxonomy label is kept.
    pub fn merge(&mut self, other: &OtuTable) {
        let mut sample_index: AHashMap<&str, usize> = self
            .samples
            .iter()
            .enumerate()
            .map(|(i, s)| (s.as_str(), i))
            .collect();
        let mut new_samples = Vec::new();
        let column_map: Vec<usize> = other
            .samples
            .iter()
            .map(|s| match sample_index.get(s.as_str()) {
                Some(&i) => i,
                None => {
                    let i = self.samples.len() + new_samples.len();
                    sample_index.insert(s.as_str(), i);
                    new_samples.push(s.clone());
                    i
                }
            })
            .collect();

        self.samples.extend(new_samples);
        let width = self.samples.len();
        for row in &mut self.rows {
            row.values.resize(width, 0.0);
        }

        for row in &other.rows {
            let i = match self.index.get(&row.id) {
                Some(&i) => i,
                None => {
                    self.index.insert(row.id.clone(), self.rows.len());
                    self.rows.push(OtuRow {
                        id: row.id.clone(),
                        taxon: row.taxon.clone(),
                        values: vec![0.0; width],
                    });
                    self.rows.len() - 1
                }
            };
            for (&col, &v) in column_map.iter().zip(&row.values) {
                self.rows[i].values[col] += v;
            }
        }
    }

    /// Scale each sample to sum to `z`. With `z == 0` the smallest
    /// non-zero sample total is used. Empty samples are left alone.
    pub fn normalize(&mut self, z: f64) -> Result<()> {
        if !(z.is_finite() && z >= 0.0) {
            return Err(OtuError::Domain(format!("invalid normalization constant {z}")));
        }
        let totals = self.sample_totals();
        let target = if z > 0.0 {
            z
        } else {
            match totals
                .iter()
                .copied()
                .filter(|&t| t > 0.0)
                .min_by(|a, b| a.total_cmp(b))
            {
                Some(min) => min,
                None => return Ok(()),
            }
        };
        for row in &mut self.rows {
            for (v, &total) in row.values.iter_mut().zip(&totals) {
                if total > 0.0 {
                    *v = *v / total * target;
                }
            }
        }
        Ok(())
    }

    /// Rarefy every sample holding at least `n` reads to exactly `n` reads.
    ///
    /// Values are rounded to whole read counts first. Returns the names of
    /// samples that had fewer than `n` reads; those are left unchanged.
    pub fn subset(&mut self, n: u64, method: SubsetMethod, seed: u64) -> Result<Vec<String>> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut too_small = Vec::new();

        for s in 0..self.samples.len() {
            let counts: Vec<u64> = self
                .rows
                .iter()
                .map(|row| row.values[s].round().max(0.0) as u64)
                .collect();
            let total: u64 = counts.iter().sum();
            if total < n {
                too_small.push(self.samples[s].clone());
                continue;
            }

            let drawn = match method {
                SubsetMethod::Uniform => draw_without_replacement(&counts, total, n, &mut rng)?,
                SubsetMethod::Multinomial => draw_with_replacement(&counts, total, n, &mut rng)?,
            };
            for (row, x) in self.rows.iter_mut().zip(drawn) {
                row.values[s] = x as f64;
            }
        }
        Ok(too_small)
    }

    /// Drop samples whose total is zero or below `min`.
    pub fn prune_samples(&mut self, min: f64) -> Vec<String> {
        let totals = self.sample_totals();
        let keep: Vec<bool> = totals.iter().map(|&t| t > 0.0 && t >= min).collect();
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.samples.len());
        for (name, &k) in self.samples.drain(..).zip(&keep) {
            if k {
                kept.push(name);
            } else {
                removed.push(name);
            }
        }
        self.samples = kept;
        for row in &mut self.rows {
            let mut flags = keep.iter();
            row.values.retain(|_| flags.next().copied().unwrap_or(false));
        }
        removed
    }

    /// Drop OTUs whose total is zero or below `min`.
    pub fn prune_otus(&mut self, min: f64) -> usize {
        let before = self.rows.len();
        self.rows.retain(|row| {
            let total = row.total();
            total > 0.0 && total >= min
        });
        self.reindex();
        before - self.rows.len()
    }

    fn reindex(&mut self) {
        self.index = self
            .rows
            .iter()
            .enumerate()
            .map(|(i, row)| (row.id.clone(), i))
            .collect();
    }

    /// Write the table as TSV, preceded by `comments` as `#` lines.
    pub fn write_to<W: Write>(&self, out: &mut W, comments: &[String]) -> Result<()> {
        for c in comments {
            writeln!(out, "# {}", c)?;
        }
        write!(out, "{}\t{}", HEADER_OTU_ID, HEADER_TAXONOMY)?;
        for s in &self.samples {
            write!(out, "\t{}", s)?;
        }
        writeln!(out)?;
        for row in &self.rows {
            write!(out, "{}\t{}", row.id, row.taxon)?;
            for v in &row.values {
                write!(out, "\t{}", v)?;
            }
            writeln!(out)?;
        }
        Ok(())
    }

    pub fn save<P: AsRef<Path>>(&self, path: P, comments: &[String]) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        self.write_to(&mut out, comments)?;
        out.flush()?;
        Ok(())
    }

    /// Parse a table written by `write_to`.
    pub fn read_from<R: BufRead>(reader: R, source: &str) -> Result<Self> {
        let mut table: Option<OtuTable> = None;
        for (lineno, line_result) in reader.lines().enumerate() {
            let line = line_result?;
            let line = line.trim_end_matches('\r');
            if line.starts_with('#') || line.trim().is_empty() {
                continue;
            }
            let context = || format!("{}:{}", source, lineno + 1);
            let fields: Vec<&str> = line.split('\t').collect();

            let Some(t) = table.as_mut() else {
                if fields.len() < 2 || fields[0] != HEADER_OTU_ID || fields[1] != HEADER_TAXONOMY {
                    return Err(OtuError::format(
                        context(),
                        format!("expected header starting with '{HEADER_OTU_ID}\\t{HEADER_TAXONOMY}'"),
                    ));
                }
                let samples = fields[2..].iter().map(|s| s.to_string()).collect();
                table = Some(OtuTable::new(samples));
                continue;
            };

            if fields.len() != t.num_samples() + 2 {
                return Err(OtuError::format(
                    context(),
                    format!("expected {} fields, found {}", t.num_samples() + 2, fields.len()),
                ));
            }
            let values = fields[2..]
                .iter()
                .map(|v| {
                    v.trim()
                        .parse::<f64>()
                        .ok()
                        .filter(|x| x.is_finite())
                        .ok_or_else(|| OtuError::format(context(), format!("bad value '{v}'")))
                })
                .collect::<Result<Vec<f64>>>()?;
            t.add_otu(fields[0], fields[1], values)?;
        }
        table.ok_or_else(|| OtuError::format(source, "missing table header"))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        Self::read_from(reader, &path.display().to_string())
    }
}

impl AddAssign<&OtuTable> for OtuTable {
    fn add_assign(&mut self, rhs: &OtuTable) {
        self.merge(rhs);
    }
}

/// Exactly `n` of `total` reads without replacement: pick read indices,
/// then bin them by the cumulative OTU counts.
fn draw_without_replacement(
    counts: &[u64],
    total: u64,
    n: u64,
    rng: &mut StdRng,
) -> Result<Vec<u64>> {
    let population = usize::try_from(total)
        .map_err(|_| OtuError::Domain(format!("cannot subset a sample of {total} reads")))?;
    let amount = usize::try_from(n)
        .map_err(|_| OtuError::Domain(format!("cannot draw {n} reads")))?;

    let mut picked = index::sample(rng, population, amount).into_vec();
    picked.sort_unstable();

    let mut drawn = Vec::with_capacity(counts.len());
    let mut picked = picked.into_iter().peekable();
    let mut upper = 0u64;
    for &k in counts {
        upper += k;
        let mut x = 0u64;
        while picked.next_if(|&i| (i as u64) < upper).is_some() {
            x += 1;
        }
        drawn.push(x);
    }
    Ok(drawn)
}

/// Sequential conditional binomial draws: exactly `n` reads with replacement.
fn draw_with_replacement(
    counts: &[u64],
    total: u64,
    n: u64,
    rng: &mut StdRng,
) -> Result<Vec<u64>> {
    let mut remaining_mass = total;
    let mut remaining_draw = n;
    let mut drawn = Vec::with_capacity(counts.len());
    for &k in counts {
        let x = if remaining_draw == 0 || k == 0 {
            0
        } else if k == remaining_mass {
            remaining_draw
        } else {
            let p = k as f64 / remaining_mass as f64;
            Binomial::new(remaining_draw, p)
                .map_err(|e| OtuError::Domain(format!("binomial draw: {e}")))?
                .sample(rng)
        };
        remaining_mass -= k;
        remaining_draw -= x;
        drawn.push(x);
    }
    Ok(drawn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn table(samples: &[&str], rows: &[(&str, &str, &[f64])]) -> OtuTable {
        let mut t = OtuTable::new(samples.iter().map(|s| s.to_string()).collect());
        for (id, taxon, values) in rows {
            t.add_otu(id, taxon, values.to_vec()).unwrap();
        }
        t
    }

    fn value(t: &OtuTable, id: &str, sample: &str) -> f64 {
        let col = t.samples().iter().position(|s| s == sample).unwrap();
        t.get(id).map(|r| r.values[col]).unwrap_or(0.0)
    }

    #[test]
    fn merge_unions_samples_and_sums_rows() {
        let mut a = table(&["s1", "s2"], &[("1", "Firmicutes", &[3.0, 1.0])]);
        let b = table(
            &["s2", "s3"],
            &[("1", "Other label", &[2.0, 5.0]), ("7", "Proteobacteria", &[0.0, 4.0])],
        );
        a += &b;
        assert_eq!(a.samples(), &["s1", "s2", "s3"]);
        assert_eq!(a.get("1").unwrap().values, vec![3.0, 3.0, 5.0]);
        assert_eq!(a.get("1").unwrap().taxon, "Firmicutes");
        assert_eq!(a.get("7").unwrap().values, vec![0.0, 0.0, 4.0]);
    }

    #[test]
    fn merge_is_commutative_and_associative() {
        let a = table(&["x", "y"], &[("1", "t1", &[1.0, 2.0]), ("2", "t2", &[3.0, 0.0])]);
        let b = table(&["y", "z"], &[("2", "t2", &[1.0, 1.0]), ("3", "t3", &[5.0, 6.0])]);
        let c = table(&["z"], &[("1", "t1", &[9.0])]);

        let mut ab = a.clone();
        ab += &b;
        let mut ba = b.clone();
        ba += &a;
        let mut ab_c = ab.clone();
        ab_c += &c;
        let mut bc = b.clone();
        bc += &c;
        let mut a_bc = a.clone();
        a_bc += &bc;

        for id in ["1", "2", "3"] {
            for s in ["x", "y", "z"] {
                assert_eq!(value(&ab, id, s), value(&ba, id, s));
                assert_eq!(value(&ab_c, id, s), value(&a_bc, id, s));
            }
        }
    }

    #[test]
    fn normalize_scales_columns() {
        let mut t = table(
            &["a", "b", "empty"],
            &[("1", "t", &[1.0, 30.0, 0.0]), ("2", "t", &[3.0, 10.0, 0.0])],
        );
        let mut fixed = t.clone();
        fixed.normalize(100.0).unwrap();
        assert_eq!(fixed.sample_totals(), vec![100.0, 100.0, 0.0]);
        assert_eq!(fixed.get("1").unwrap().values[0], 25.0);

        // z == 0 scales to the smallest non-zero total
        t.normalize(0.0).unwrap();
        let totals = t.sample_totals();
        assert!((totals[0] - 4.0).abs() < 1e-12);
        assert!((totals[1] - 4.0).abs() < 1e-12);
        assert_eq!(totals[2], 0.0);
        assert!(t.normalize(-1.0).is_err());
    }

    #[test]
    fn uniform_subset_is_exact() {
        let mut t = table(
            &["big", "small"],
            &[
                ("1", "t", &[40.0, 2.0]),
                ("2", "t", &[25.0, 1.0]),
                ("3", "t", &[35.0, 0.0]),
            ],
        );
        let skipped = t.subset(50, SubsetMethod::Uniform, 7).unwrap();
        assert_eq!(skipped, vec!["small".to_string()]);
        let totals = t.sample_totals();
        assert_eq!(totals, vec![50.0, 3.0]);
        for (row, cap) in t.rows().iter().zip([40.0, 25.0, 35.0]) {
            assert!(row.values[0] <= cap);
        }
        assert_eq!(t.get("1").unwrap().values[1], 2.0);
    }

    #[test]
    fn uniform_subset_at_sequencing_depth() {
        let base = table(
            &["deep", "shallow"],
            &[("1", "t", &[500.0, 250.0]), ("2", "t", &[52263.0, 40003.0]), ("3", "t", &[0.0, 0.0])],
        );
        for n in [78, 100, 1000, 40253] {
            let mut t = base.clone();
            let skipped = t.subset(n, SubsetMethod::Uniform, 42).unwrap();
            assert!(skipped.is_empty());
            assert_eq!(t.sample_totals(), vec![n as f64, n as f64]);
            for (row, orig) in t.rows().iter().zip(base.rows()) {
                assert!(row.values[0] <= orig.values[0]);
                assert!(row.values[1] <= orig.values[1]);
            }
            assert_eq!(t.get("3").unwrap().values, vec![0.0, 0.0]);
        }

        let mut again = base.clone();
        let mut t = base.clone();
        t.subset(1000, SubsetMethod::Uniform, 9).unwrap();
        again.subset(1000, SubsetMethod::Uniform, 9).unwrap();
        assert_eq!(t, again);
    }

    #[test]
    fn multinomial_subset_is_exact_and_seeded() {
        let base = table(&["s"], &[("1", "t", &[10.0]), ("2", "t", &[90.0])]);
        let mut a = base.clone();
        let mut b = base.clone();
        a.subset(500, SubsetMethod::Multinomial, 42).unwrap();
        b.subset(500, SubsetMethod::Multinomial, 42).unwrap();
        assert_eq!(a.sample_totals(), vec![500.0]);
        assert_eq!(a, b);
    }

    #[test]
    fn subset_of_whole_sample_is_identity() {
        let mut t = table(&["s"], &[("1", "t", &[4.0]), ("2", "t", &[6.0])]);
        t.subset(10, SubsetMethod::Uniform, 1).unwrap();
        assert_eq!(t.get("1").unwrap().values, vec![4.0]);
        assert_eq!(t.get("2").unwrap().values, vec![6.0]);
    }

    #[test]
    fn prune_drops_small_samples_and_otus() {
        let mut t = table(
            &["a", "b", "c"],
            &[("1", "t", &[5.0, 0.0, 1.0]), ("2", "t", &[0.0, 0.0, 1.0]), ("3", "t", &[5.0, 0.0, 0.0])],
        );
        let removed = t.prune_samples(5.0);
        assert_eq!(removed, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(t.samples(), &["a"]);
        assert_eq!(t.get("1").unwrap().values, vec![5.0]);

        assert_eq!(t.prune_otus(1.0), 1);
        assert!(t.get("2").is_none());
        assert_eq!(t.get("3").unwrap().values, vec![5.0]);
        assert_eq!(t.num_otus(), 2);
    }

    #[test]
    fn text_round_trip() {
        let t = table(
            &["gut", "skin"],
            &[("3", "Bacteria;Firmicutes", &[12.0, 0.5]), ("10", "Bacteria", &[0.0, 7.0])],
        );
        let mut buf = Vec::new();
        t.write_to(&mut buf, &["generated for a test".to_string()]).unwrap();
        let text = String::from_utf8(buf.clone()).unwrap();
        assert!(text.starts_with("# generated for a test\nOTUID\tTaxonomy\tgut\tskin\n3\tBacteria;Firmicutes\t12\t0.5\n"));

        let back = OtuTable::read_from(Cursor::new(buf), "mem").unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn rejects_malformed_tables() {
        let bad_header = "ID\tTaxonomy\ta\n1\tt\t3\n";
        assert!(OtuTable::read_from(Cursor::new(bad_header), "t").is_err());
        let short_row = "OTUID\tTaxonomy\ta\tb\n1\tt\t3\n";
        match OtuTable::read_from(Cursor::new(short_row), "t").unwrap_err() {
            OtuError::Format { context, .. } => assert_eq!(context, "t:2"),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(OtuTable::read_from(Cursor::new("# only comments\n"), "t").is_err());
    }

    #[test]
    fn parses_subset_methods() {
        assert_eq!("Uniform".parse::<SubsetMethod>().unwrap(), SubsetMethod::Uniform);
        assert_eq!("multinomial".parse::<SubsetMethod>().unwrap(), SubsetMethod::Multinomial);
        assert!("bootstrap".parse::<SubsetMethod>().is_err());
    }
}
