//src/assignment.rs

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use ahash::AHashMap;
use flate2::read::MultiGzDecoder;

use crate::error::{OtuError, Result};
use crate::types::{AssignmentRecord, SampleSpec};

pub const COL_ID: &str = "id";
pub const COL_CS_START: &str = "CS_start";
pub const COL_CS_END: &str = "CS_end";
pub const COL_ALIGNMENT: &str = "alignment";
pub const COL_TAXON_ID: &str = "taxon_id";
pub const COL_Q_TAXON: &str = "Q_taxon";
pub const COL_ALN_IDENTITY: &str = "aln_identity";
pub const COL_HMM_IDENTITY: &str = "hmm_identity";

/// Identity minimums used to set a record's acceptance flags.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IdentityThresholds {
    pub min_aln_identity: f64,
    pub min_hmm_identity: f64,
}

/// Column positions resolved from the header line.
#[derive(Debug, Clone)]
struct Columns {
    id: Option<usize>,
    cs_start: usize,
    cs_end: usize,
    alignment: usize,
    taxon_id: usize,
    q_taxon: usize,
    aln_identity: Option<usize>,
    hmm_identity: Option<usize>,
    width: usize,
}

impl Columns {
    fn from_header(header: &str, source: &str) -> Result<Self> {
        let index: AHashMap<&str, usize> = header
            .split('\t')
            .enumerate()
            .map(|(i, name)| (name.trim(), i))
            .collect();
        let required = |name: &str| {
            index.get(name).copied().ok_or_else(|| {
                OtuError::format(source, format!("missing required column '{name}'"))
            })
        };
        let cols = Columns {
            id: index.get(COL_ID).copied(),
            cs_start: required(COL_CS_START)?,
            cs_end: required(COL_CS_END)?,
            alignment: required(COL_ALIGNMENT)?,
            taxon_id: required(COL_TAXON_ID)?,
            q_taxon: required(COL_Q_TAXON)?,
            aln_identity: index.get(COL_ALN_IDENTITY).copied(),
            hmm_identity: index.get(COL_HMM_IDENTITY).copied(),
            width: 0,
        };
        let width = [cols.cs_start, cols.cs_end, cols.alignment, cols.taxon_id, cols.q_taxon]
            .into_iter()
            .chain(cols.id)
            .chain(cols.aln_identity)
            .chain(cols.hmm_identity)
            .max()
            .unwrap_or(0)
            + 1;
        Ok(Columns { width, ..cols })
    }
}

/// Streams `AssignmentRecord`s out of a placement TSV.
///
/// Lines starting with `#` are skipped; the first other line is the header.
pub struct AssignmentReader<R: BufRead> {
    reader: R,
    source: String,
    thresholds: IdentityThresholds,
    columns: Option<Columns>,
    line: String,
    lineno: usize,
}

impl<R: BufRead> AssignmentReader<R> {
    pub fn new(reader: R, source: &str, thresholds: IdentityThresholds) -> Self {
        Self {
            reader,
            source: source.to_string(),
            thresholds,
            columns: None,
            line: String::new(),
            lineno: 0,
        }
    }

    fn context(&self) -> String {
        format!("{}:{}", self.source, self.lineno)
    }

    /// Next non-comment, non-blank line, or `None` at EOF.
    fn next_line(&mut self) -> Result<Option<()>> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line)? == 0 {
                return Ok(None);
            }
            self.lineno += 1;
            let trimmed = self.line.trim_end_matches(['\n', '\r']);
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            return Ok(Some(()));
        }
    }

    fn parse_record(&self, cols: &Columns) -> Result<AssignmentRecord> {
        let fields: Vec<&str> = self.line.trim_end_matches(['\n', '\r']).split('\t').collect();
        if fields.len() < cols.width {
            return Err(OtuError::format(
                self.context(),
                format!("expected at least {} fields, found {}", cols.width, fields.len()),
            ));
        }

        let num = |col: usize, what: &str| -> Result<f64> {
            fields[col]
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|x| !x.is_nan())
                .ok_or_else(|| {
                    OtuError::format(self.context(), format!("bad {what} '{}'", fields[col]))
                })
        };
        let int = |col: usize, what: &str| -> Result<i64> {
            fields[col].trim().parse::<i64>().map_err(|_| {
                OtuError::format(self.context(), format!("bad {what} '{}'", fields[col]))
            })
        };

        let pos = |col: usize, what: &str| -> Result<usize> {
            fields[col].trim().parse::<usize>().map_err(|_| {
                OtuError::format(self.context(), format!("bad {what} '{}'", fields[col]))
            })
        };

        let cs_start = pos(cols.cs_start, COL_CS_START)?;
        let cs_end = pos(cols.cs_end, COL_CS_END)?;
        let taxon_id = int(cols.taxon_id, COL_TAXON_ID)?;
        let q_taxon = num(cols.q_taxon, COL_Q_TAXON)?;

        let aln_identity_pass = match cols.aln_identity {
            Some(col) => num(col, COL_ALN_IDENTITY)? >= self.thresholds.min_aln_identity,
            None => true,
        };
        let hmm_identity_pass = match cols.hmm_identity {
            Some(col) => num(col, COL_HMM_IDENTITY)? >= self.thresholds.min_hmm_identity,
            None => true,
        };

        Ok(AssignmentRecord {
            read_id: cols
                .id
                .map(|c| fields[c].to_string())
                .unwrap_or_else(|| format!("read{}", self.lineno)),
            cs_start,
            cs_end,
            alignment: fields[cols.alignment].trim().to_string(),
            taxon_id,
            q_taxon,
            aln_identity_pass,
            hmm_identity_pass,
        })
    }
}

impl<R: BufRead> Iterator for AssignmentReader<R> {
    type Item = Result<AssignmentRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        // header first
        if self.columns.is_none() {
            match self.next_line() {
                Ok(Some(())) => {}
                Ok(None) => return None,
                Err(e) => return Some(Err(e)),
            }
            match Columns::from_header(self.line.trim_end_matches(['\n', '\r']), &self.source) {
                Ok(cols) => self.columns = Some(cols),
                Err(e) => return Some(Err(e)),
            }
        }

        match self.next_line() {
            Ok(Some(())) => {}
            Ok(None) => return None,
            Err(e) => return Some(Err(e)),
        }
        let cols = self.columns.clone()?;
        Some(self.parse_record(&cols))
    }
}

/// Open an assignment file, transparently decompressing `.gz`.
pub fn open_assignment_file<P: AsRef<Path>>(
    path: P,
    thresholds: IdentityThresholds,
) -> Result<AssignmentReader<Box<dyn BufRead + Send>>> {
    let path = path.as_ref();
    let f = File::open(path)?;

    let is_gz = path
        .extension()
        .map(|ext| ext == "gz")
        .unwrap_or(false);

    let reader: Box<dyn BufRead + Send> = if is_gz {
        Box::new(BufReader::new(MultiGzDecoder::new(f)))
    } else {
        Box::new(BufReader::new(f))
    };

    Ok(AssignmentReader::new(reader, &path.display().to_string(), thresholds))
}

/// Reads a `name<TAB>file` sample list. Lines starting with `#` are skipped.
pub fn read_sample_list<P: AsRef<Path>>(path: P) -> Result<Vec<SampleSpec>> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);
    let mut samples = Vec::new();
    for line_result in reader.lines() {
        let line = line_result?;
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() >= 2 {
            samples.push(SampleSpec {
                name: fields[0].trim().to_string(),
                path: fields[1].trim().into(),
            });
        }
    }
    Ok(samples)
}
