use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{ArgAction, Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use otuphylo::assignment::read_sample_list;
use otuphylo::error::{OtuError, Result};
use otuphylo::model::{load_model, Jc69, SharedModel};
use otuphylo::options::{SumOptions, DEFAULT_EFFECTIVE_N};
use otuphylo::otu_table::SubsetMethod;
use otuphylo::report::Reporter;
use otuphylo::tree::PhyloTree;
use otuphylo::types::SampleSpec;
use otuphylo::{merge_table_files, summarize_samples};

const NODE_TABLE_SUFFIX: &str = ".nodes";
const MODEL_SUFFIX: &str = ".dm";

#[derive(Parser, Debug)]
#[command(
    name = "otuphylo",
    about = "Summarize phylogenetic read placements into OTU tables, consensus sequences and OTU trees",
    version,
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase logging verbosity (repeat for more)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build an OTU table from per-sample assignment files
    Sum(SumArgs),
    /// Merge OTU tables from separate runs
    Merge(MergeArgs),
}

#[derive(Args, Debug)]
struct SumArgs {
    /// Database prefix (<db>.nodes, optional <db>.dm)
    db: PathBuf,

    /// Assignment files, one per sample (.gz supported)
    #[arg(num_args = 0..)]
    inputs: Vec<PathBuf>,

    /// OTU table output
    #[arg(short = 'o', long = "out")]
    out: PathBuf,

    /// Sample list (name<TAB>file); replaces the input files
    #[arg(short = 'l', long = "list")]
    list: Option<PathBuf>,

    /// OTU consensus sequence FASTA output
    #[arg(short = 'c', long = "cs")]
    cs: Option<PathBuf>,

    /// OTU tree (Newick) output
    #[arg(short = 't', long = "tree")]
    tree: Option<PathBuf>,

    /// Minimum Q_taxon of an accepted assignment
    #[arg(short = 'q', long = "min-q", default_value_t = 0.0)]
    min_q: f64,

    /// Minimum alignment identity
    #[arg(long = "aln-iden", default_value_t = 0.0)]
    aln_iden: f64,

    /// Minimum profile-HMM identity
    #[arg(long = "hmm-iden", default_value_t = 0.0)]
    hmm_iden: f64,

    /// Effective pseudocount for consensus inference, 0 for a plurality vote
    #[arg(short = 'e', long = "effN", default_value_t = DEFAULT_EFFECTIVE_N)]
    eff_n: f64,

    /// Minimum reads across all samples to report an OTU
    #[arg(short = 'n', long = "min-read", default_value_t = 0)]
    min_read: u64,

    /// Minimum samples an OTU must be observed in
    #[arg(short = 's', long = "min-sample", default_value_t = 0)]
    min_sample: usize,

    /// Normalize sample totals
    #[arg(short = 'N', long = "norm")]
    normalize: bool,

    /// Normalization target for -N, 0 for the smallest sample total
    #[arg(short = 'Z', long = "norm-z", default_value_t = 0.0)]
    norm_z: f64,

    /// Subsample every sample to this many reads, 0 to disable
    #[arg(long = "subset", default_value_t = 0)]
    subset: u64,

    /// Subsampling method: uniform (without replacement) or multinomial (with replacement)
    #[arg(long = "sub-method", default_value = "uniform")]
    sub_method: String,

    /// Random seed for subsampling (defaults to the current time)
    #[arg(short = 'S', long = "seed")]
    seed: Option<u64>,
}

#[derive(Args, Debug)]
struct MergeArgs {
    /// OTU tables to merge
    #[arg(num_args = 1.., required = true)]
    tables: Vec<PathBuf>,

    /// Merged table output (stdout if omitted)
    #[arg(short = 'o', long = "out")]
    out: Option<PathBuf>,

    /// OTU tree (Newick) output, requires --db
    #[arg(short = 't', long = "tree", requires = "db")]
    tree: Option<PathBuf>,

    /// Database prefix used for --tree
    #[arg(long = "db")]
    db: Option<PathBuf>,
}

/// Spinner-backed reporter: messages update the spinner and go to the log.
struct SpinnerReporter {
    bar: ProgressBar,
}

impl SpinnerReporter {
    fn new(color: &str) -> Self {
        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
            .template(&format!("{{spinner:.{color}}} {{msg}}"))
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        bar.set_style(style);
        Self { bar }
    }

    fn finish(&self, msg: &str) {
        self.bar.finish_with_message(msg.to_string());
    }
}

impl Reporter for SpinnerReporter {
    fn info(&self, msg: &str) {
        self.bar.set_message(msg.to_string());
        self.bar.suspend(|| log::info!("{}", msg));
    }

    fn warn(&self, msg: &str) {
        self.bar.suspend(|| log::warn!("{}", msg));
    }

    fn debug(&self, msg: &str) {
        self.bar.suspend(|| log::debug!("{}", msg));
    }
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut s = prefix.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

fn db_name(prefix: &Path) -> String {
    prefix
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| prefix.display().to_string())
}

fn load_tree(db: &Path) -> Result<PhyloTree> {
    let tree = PhyloTree::load_node_table(with_suffix(db, NODE_TABLE_SUFFIX))?;
    log::info!(
        "Phylogenetic tree loaded: {} nodes, {} alignment sites",
        tree.num_nodes(),
        tree.num_alignment_sites()
    );
    Ok(tree)
}

fn load_shared_model(db: &Path) -> Result<SharedModel> {
    let path = with_suffix(db, MODEL_SUFFIX);
    if !path.exists() {
        log::warn!(
            "No substitution model at {}, using JC69 base frequencies",
            path.display()
        );
        return Ok(SharedModel::new(Box::new(Jc69)));
    }
    let mut reader = BufReader::new(File::open(&path)?);
    let model = load_model(&mut reader)?;
    log::info!("{} substitution model loaded", model.model_type());
    Ok(SharedModel::new(model))
}

fn time_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn write_text(path: &Path, text: &str) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(text.as_bytes())?;
    out.flush()?;
    Ok(())
}

fn run_sum(args: SumArgs) -> Result<()> {
    let samples: Vec<SampleSpec> = match &args.list {
        Some(list) => read_sample_list(list)?,
        None => args
            .inputs
            .iter()
            .map(|p| SampleSpec {
                name: p.display().to_string(),
                path: p.clone(),
            })
            .collect(),
    };
    if samples.is_empty() {
        return Err(OtuError::format(
            "command line",
            "no assignment files given, see --help for usage",
        ));
    }

    let options = SumOptions {
        eff_n: args.eff_n,
        min_read: args.min_read,
        min_sample: args.min_sample,
        min_q: args.min_q,
        min_aln_identity: args.aln_iden,
        min_hmm_identity: args.hmm_iden,
        normalize: args.normalize,
        norm_z: args.norm_z,
        subset: args.subset,
        subset_method: args.sub_method.parse::<SubsetMethod>()?,
        seed: args.seed.unwrap_or_else(time_seed),
    };
    if !(options.eff_n >= 0.0) || !(options.norm_z >= 0.0) || !(options.min_q >= 0.0) {
        return Err(OtuError::Domain(
            "-e, -Z and -q must be non-negative".to_string(),
        ));
    }

    let tree = load_tree(&args.db)?;
    let model = load_shared_model(&args.db)?;

    let reporter = SpinnerReporter::new("green");
    let results = summarize_samples(
        &tree,
        &model,
        &samples,
        &options,
        &db_name(&args.db),
        &reporter,
    )?;
    reporter.finish(&format!(
        "Summarized {} OTUs across {} samples.",
        results.table.num_otus(),
        results.table.num_samples()
    ));

    let comments = vec![format!(
        "OTU table generated by otuphylo {}",
        env!("CARGO_PKG_VERSION")
    )];
    log::info!("Writing OTU Table");
    results.table.save(&args.out, &comments)?;

    if let Some(cs_path) = &args.cs {
        log::info!("Writing OTU Consensus Sequences");
        write_text(cs_path, &results.get_consensus_fasta()?)?;
    }
    if let Some(tree_path) = &args.tree {
        log::info!("Writing OTU tree");
        write_text(tree_path, &results.get_tree_text())?;
    }
    Ok(())
}

fn run_merge(args: MergeArgs) -> Result<()> {
    let tree = match (&args.tree, &args.db) {
        (Some(_), Some(db)) => Some(load_tree(db)?),
        (Some(_), None) => {
            return Err(OtuError::format("command line", "--tree requires --db"));
        }
        _ => None,
    };

    let reporter = SpinnerReporter::new("cyan");
    let merged = merge_table_files(&args.tables, tree.as_ref(), &reporter)?;
    reporter.finish(&format!(
        "Merged {} tables into {} OTUs.",
        args.tables.len(),
        merged.table.num_otus()
    ));

    let comments = vec![format!(
        "OTU table merged by otuphylo {}",
        env!("CARGO_PKG_VERSION")
    )];
    match &args.out {
        Some(path) => merged.table.save(path, &comments)?,
        None => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            merged.table.write_to(&mut out, &comments)?;
            out.flush()?;
        }
    }

    if let (Some(tree_path), Some(newick)) = (&args.tree, &merged.tree_newick) {
        log::info!("Writing merged OTU tree");
        fs::write(tree_path, format!("{newick}\n"))?;
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let outcome = match cli.command {
        Commands::Sum(args) => run_sum(args),
        Commands::Merge(args) => run_merge(args),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
