use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use log::info;
use serde::Serialize;

#[derive(Debug)]
pub enum ParserError {
    MissingInput,
    ExtractWithoutAlignment,
    ReconstructWithoutDiff,
    UnsupportedSeqType,
    NonPositive(&'static str),
    NegativeWeight,
}

impl std::error::Error for ParserError {}

impl std::fmt::Display for ParserError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::MissingInput => write!(f, "Neither --alignment nor --diff was provided; nothing to infer from."),
            Self::ExtractWithoutAlignment => write!(f, "--extract-diff requires an alignment. Please supply one via --alignment <PATH>."),
            Self::ReconstructWithoutDiff => write!(f, "--output-aln reconstructs an alignment from a diff file; please supply one via --diff <PATH>."),
            Self::UnsupportedSeqType => write!(f, "Protein data (--seqtype AA) is recognised but not supported by this build; only DNA models ship."),
            Self::NonPositive(arg) => write!(f, "--{arg} must be strictly positive."),
            Self::NegativeWeight => write!(f, "--hamming-weight must be non-negative."),
        }
    }
}

/// Alphabet of the input sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SeqType {
    Dna,
    Aa,
}

impl FromStr for SeqType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DNA" => Ok(SeqType::Dna),
            "AA" => Ok(SeqType::Aa),
            other => Err(format!("unknown sequence type '{other}' (expected DNA or AA)")),
        }
    }
}

/// How much topology search to run after the initial placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TreeSearch {
    No,
    Partial,
    Complete,
}

impl FromStr for TreeSearch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NO" => Ok(TreeSearch::No),
            "PARTIAL" => Ok(TreeSearch::Partial),
            "COMPLETE" => Ok(TreeSearch::Complete),
            other => Err(format!("unknown tree search mode '{other}' (expected NO, PARTIAL or COMPLETE)")),
        }
    }
}

/// Worker pool size for branch-support replicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Threads {
    Auto,
    Count(usize),
}

impl Threads {
    /// Resolve AUTO against the machine.
    #[must_use]
    pub fn resolve(self) -> usize {
        match self {
            Threads::Auto => std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
            Threads::Count(n) => n,
        }
    }
}

impl FromStr for Threads {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Threads::Auto);
        }
        match s.parse::<usize>() {
            Ok(n) if n >= 1 => Ok(Threads::Count(n)),
            _ => Err(format!("--threads expects a positive integer or AUTO, got '{s}'")),
        }
    }
}

#[derive(Parser, Debug, Serialize)]
#[clap(name = "sprig-rs", about = "Phylogenetic placement of pandemic-scale alignments from sparse mutation lists")]
pub struct Cli {
    /// Input alignment (FASTA or PHYLIP).
    ///
    /// Mutually completed by --diff: when an alignment is given it is first
    /// converted into the diff representation, next to the input file or at
    /// the --diff path if provided.
    #[clap(long, visible_alias("aln"))]
    pub alignment: Option<PathBuf>,

    /// Input (or output) diff file of per-taxon mutation lists.
    #[clap(long)]
    pub diff: Option<PathBuf>,

    /// Reference genome (FASTA).
    ///
    /// Mandatory when reading a diff without an embedded reference. When
    /// extracting a diff from an alignment without a reference, the
    /// column-wise majority consensus is used instead.
    #[clap(long, visible_alias("ref"))]
    pub reference: Option<PathBuf>,

    /// Prefix of every output file.
    ///
    /// Defaults to the diff path.
    #[clap(long, visible_alias("prf"))]
    pub prefix: Option<PathBuf>,

    /// Reconstruct a FASTA alignment from the diff file, write it here and
    /// exit.
    #[clap(long = "output-aln", visible_alias("out-aln"))]
    pub output_aln: Option<PathBuf>,

    /// Starting tree (Newick). Taxa already in the tree keep their
    /// position; the remaining ones are placed incrementally.
    #[clap(short = 't', long)]
    pub tree: Option<PathBuf>,

    /// Substitution model: JC, GTR or UNREST.
    #[clap(short = 'm', long, default_value("GTR"))]
    pub model: String,

    /// Sequence type: DNA or AA.
    #[clap(long, visible_alias("st"), default_value("DNA"))]
    pub seqtype: SeqType,

    /// Topology search effort: NO (placement only), PARTIAL (short-range),
    /// COMPLETE.
    #[clap(long = "tree-search", default_value("COMPLETE"))]
    pub tree_search: TreeSearch,

    /// Weight of ambiguous characters in the sequence ordering distance.
    #[clap(long, default_value("1000"))]
    pub hamming_weight: f64,

    /// Override the minimum branch length (absolute, not a factor).
    #[clap(long)]
    pub min_blength: Option<f64>,

    /// Probability floor below which likelihood contributions are clamped.
    #[clap(long, default_value("1e-8"))]
    pub threshold_prob: f64,

    /// Re-estimate the mutation matrix every this many placements.
    #[clap(long = "mutation-update", default_value("25"))]
    pub mutation_update: u32,

    /// Consecutive non-improving steps tolerated by the placement search.
    #[clap(long = "failure-limit", default_value("5"))]
    pub failure_limit: u32,

    /// Consecutive non-improving steps tolerated by the regraft search.
    #[clap(long = "failure-limit-subtree", default_value("4"))]
    pub failure_limit_subtree: u32,

    /// Only convert the alignment into a diff file, then exit.
    #[clap(long)]
    pub extract_diff: bool,

    /// Emit a multifurcating tree (collapse zero-length internal branches).
    #[clap(long)]
    pub multifurcating_tree: bool,

    /// Run a radius-limited topology search before the full one.
    #[clap(long)]
    pub short_topology_search: bool,

    /// Keep the branch lengths of the input tree fixed.
    #[clap(long)]
    pub fixed_blength: bool,

    /// Overwrite existing output files.
    #[clap(short = 'w', long)]
    pub overwrite: bool,

    /// Allow the topology search to change the input tree.
    #[clap(long)]
    pub replace_input_tree: bool,

    /// Compute SH-like branch supports after the search.
    #[clap(long)]
    pub branch_support: bool,

    /// Resampling replicates for branch supports.
    #[clap(long, default_value("1000"))]
    pub replicates: u32,

    /// Slack allowed when an arrangement defends its branch in a replicate.
    #[clap(long, default_value("0.05"))]
    pub epsilon: f64,

    /// Worker threads for branch-support replicates (integer or AUTO).
    #[clap(long, default_value("AUTO"))]
    pub threads: Threads,

    /// Seed of the support resampling stream.
    #[clap(long, default_value("1"))]
    pub seed: u64,

    /// Model the substitution rate per genome position.
    #[clap(long)]
    pub rate_variation: bool,

    /// With --rate-variation: estimate one scalar rate per site instead of
    /// refitting every matrix entry.
    #[clap(long)]
    pub site_rates: bool,

    /// Set the verbosity level (-v -vv -vvv -vvvv)
    ///
    /// Set the verbosity level of this program. With multiple levels
    ///    -v : Info  |  -vv : Debug  | -vvv : Trace
    /// By default, the program will still output Warnings. Use --quiet/-q to disable them
    #[clap(short = 'v', long, parse(from_occurrences))]
    pub verbose: u8,

    /// Disable warnings.
    #[clap(short = 'q', long)]
    pub quiet: bool,
}

impl Cli {
    /// Echo the parsed arguments at INFO level, as YAML.
    pub fn serialize(&self) {
        match serde_yaml::to_string(self) {
            Ok(yaml) => info!("\n---- Command line args ----\n{yaml}\n---"),
            Err(err) => info!("Could not serialize command line args: {err}"),
        }
    }

    /// Cross-field validation, run before anything touches the filesystem.
    pub fn validate(&self) -> Result<(), ParserError> {
        if self.alignment.is_none() && self.diff.is_none() {
            return Err(ParserError::MissingInput);
        }
        if self.extract_diff && self.alignment.is_none() {
            return Err(ParserError::ExtractWithoutAlignment);
        }
        if self.output_aln.is_some() && self.diff.is_none() {
            return Err(ParserError::ReconstructWithoutDiff);
        }
        if self.seqtype == SeqType::Aa {
            return Err(ParserError::UnsupportedSeqType);
        }
        if self.hamming_weight < 0.0 {
            return Err(ParserError::NegativeWeight);
        }
        if self.threshold_prob <= 0.0 {
            return Err(ParserError::NonPositive("threshold-prob"));
        }
        if self.mutation_update == 0 {
            return Err(ParserError::NonPositive("mutation-update"));
        }
        if self.failure_limit == 0 {
            return Err(ParserError::NonPositive("failure-limit"));
        }
        if self.failure_limit_subtree == 0 {
            return Err(ParserError::NonPositive("failure-limit-subtree"));
        }
        if self.replicates == 0 {
            return Err(ParserError::NonPositive("replicates"));
        }
        if matches!(self.min_blength, Some(b) if b <= 0.0) {
            return Err(ParserError::NonPositive("min-blength"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn parse(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("sprig-rs").chain(args.iter().copied()))
    }

    #[test]
    fn minimal_diff_invocation() -> Result<()> {
        let cli = parse(&["--diff", "input.maple"]);
        cli.validate()?;
        assert_eq!(cli.model, "GTR");
        assert_eq!(cli.tree_search, TreeSearch::Complete);
        assert_eq!(cli.mutation_update, 25);
        Ok(())
    }

    #[test]
    fn aliases_resolve() -> Result<()> {
        let cli = parse(&["--aln", "input.fa", "--ref", "ref.fa", "--prf", "out"]);
        cli.validate()?;
        assert_eq!(cli.alignment.as_deref(), Some(std::path::Path::new("input.fa")));
        assert_eq!(cli.reference.as_deref(), Some(std::path::Path::new("ref.fa")));
        Ok(())
    }

    #[test]
    fn missing_input_is_rejected() {
        let cli = parse(&["--overwrite"]);
        assert!(matches!(cli.validate(), Err(ParserError::MissingInput)));
    }

    #[test]
    fn aa_is_recognised_but_rejected() {
        let cli = parse(&["--diff", "x.maple", "--seqtype", "AA"]);
        assert!(matches!(cli.validate(), Err(ParserError::UnsupportedSeqType)));
    }

    #[test]
    fn extract_diff_requires_an_alignment() {
        let cli = parse(&["--diff", "x.maple", "--extract-diff"]);
        assert!(matches!(cli.validate(), Err(ParserError::ExtractWithoutAlignment)));
    }

    #[test]
    fn threads_parse_auto_and_counts() {
        assert_eq!("AUTO".parse::<Threads>().unwrap(), Threads::Auto);
        assert_eq!("8".parse::<Threads>().unwrap(), Threads::Count(8));
        assert!("0".parse::<Threads>().is_err());
    }

    #[test]
    fn verbosity_accumulates() {
        let cli = parse(&["--diff", "x.maple", "-vvv"]);
        assert_eq!(cli.verbose, 3);
    }

    #[test]
    fn invalid_tree_search_mode_fails_to_parse() {
        let result = Cli::try_parse_from(["sprig-rs", "--diff", "x", "--tree-search", "SOMETIMES"]);
        assert!(result.is_err());
    }
}
