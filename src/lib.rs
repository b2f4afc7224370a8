//! Orchestration of a full inference run: load the input, prepare model
//! and thresholds, build the initial tree by incremental placement,
//! improve its topology and branch lengths, then write the outputs.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};

use genome::{Alignment, RefSeq, Sequence};
use likelihood::model::SubstitutionModel;
use likelihood::regions::SeqRegions;
use likelihood::{MergeCtx, Model, ModelKind};
use parser::{Cli, TreeSearch};
use phylo::placement::Placement;
use phylo::support::SupportParams;
use phylo::{SearchParams, Tree};
use sprig_io::read::{self, InputFormat};
use sprig_io::write;

/// Smoothing mass added to every per-site waiting time during rate
/// re-estimation.
const WAITING_TIME_PSEUDOCOUNT: f64 = 0.1;

/// Main runner: everything between argument parsing and process exit.
pub fn run(cli: &Cli) -> Result<()> {
    let Some((reference, sequences)) = load_input(cli)? else {
        // Conversion-only invocations stop here.
        return Ok(());
    };

    let mut session = pre_inference(cli, reference, sequences)?;
    build_initial_tree(cli, &mut session)?;
    optimize_tree(cli, &mut session)?;
    post_inference(cli, &mut session)
}

/// All mutable state of one inference.
struct Session {
    alignment: Alignment,
    model: Model,
    params: SearchParams,
    prefix: PathBuf,
    tree: Option<Tree>,
    input_tree: Option<read::NewickNode>,
}

impl Session {
    fn tree_mut(&mut self) -> &mut Tree {
        self.tree.as_mut().expect("tree built before use")
    }
}

/// Output file prefix: `--prefix`, else the diff path, else the alignment
/// path.
fn output_prefix(cli: &Cli) -> PathBuf {
    cli.prefix.clone()
        .or_else(|| cli.diff.clone())
        .or_else(|| cli.alignment.clone())
        .expect("validated: some input path exists")
}

fn suffixed(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Read (or convert) the input into a reference plus per-taxon mutation
/// lists. `None` when the invocation only asked for a format conversion.
fn load_input(cli: &Cli) -> Result<Option<(RefSeq, Vec<Sequence>)>> {
    if let Some(alignment_path) = &cli.alignment {
        let format = read::detect_format(alignment_path)?;
        let raw = match format {
            InputFormat::Fasta => read::read_fasta(alignment_path)?,
            InputFormat::Phylip => read::read_phylip(alignment_path)?,
            other => bail!(
                "{} looks like {other:?}; expected a FASTA or PHYLIP alignment",
                alignment_path.display()
            ),
        };

        let reference = match &cli.reference {
            Some(path) => read::read_reference(path)?,
            None => {
                info!("No reference given; generating the column-wise consensus");
                read::generate_consensus(&raw)?
            }
        };
        let sequences = read::extract_mutations(&raw, &reference)?;

        let diff_path = cli.diff.clone().unwrap_or_else(|| suffixed(alignment_path, ".maple"));
        write::write_diff(&diff_path, &reference, &sequences, cli.overwrite)?;
        info!("The input alignment was converted into diff format at {}", diff_path.display());

        if cli.extract_diff {
            return Ok(None);
        }
        return Ok(Some((reference, sequences)));
    }

    let diff_path = cli.diff.as_ref().expect("validated: diff set when alignment is not");
    let reference_override = cli.reference.as_ref().map(|p| read::read_reference(p)).transpose()?;
    let (reference, sequences) = read::read_diff(diff_path, reference_override.as_ref())?;

    if let Some(output_aln) = &cli.output_aln {
        write::reconstruct_alignment(output_aln, &reference, &sequences, cli.overwrite)?;
        return Ok(None);
    }
    Ok(Some((reference, sequences)))
}

/// Validate, sort, and set up model plus search thresholds.
fn pre_inference(cli: &Cli, reference: RefSeq, sequences: Vec<Sequence>) -> Result<Session> {
    if sequences.len() < 3 {
        bail!("The number of input sequences must be at least 3! Please check and try again");
    }

    let prefix = output_prefix(cli);
    let treefile = suffixed(&prefix, ".treefile");
    if treefile.exists() && !cli.overwrite {
        return Err(write::WriteError::FileExists(treefile).into());
    }

    let mut alignment = Alignment::new(reference, sequences)?;
    alignment.sort_by_distance(cli.hamming_weight);

    let kind: ModelKind = cli.model.parse()?;
    let model = if cli.rate_variation {
        Model::new_per_site(kind, alignment.reference(), WAITING_TIME_PSEUDOCOUNT)
    } else {
        Model::new(kind, alignment.reference())
    };

    let mut params = SearchParams::new(alignment.genome_length());
    params.threshold_prob = cli.threshold_prob;
    params.failure_limit_sample = cli.failure_limit;
    params.failure_limit_subtree = cli.failure_limit_subtree;
    params.fixed_blength = cli.fixed_blength && cli.tree.is_some();
    if cli.fixed_blength && cli.tree.is_none() {
        warn!("Ignoring --fixed-blength: no input tree was supplied");
    }
    if let Some(min_blength) = cli.min_blength {
        params.min_blength = min_blength;
        params.min_blength_sensitivity = min_blength * 1e-5;
    }

    if cli.branch_support {
        let threads = cli.threads.resolve();
        if let Err(err) = rayon::ThreadPoolBuilder::new().num_threads(threads).build_global() {
            debug!("Rayon pool was already initialized: {err}");
        }
    }

    let input_tree = match &cli.tree {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read the input tree at {}", path.display()))?;
            Some(read::parse_newick(&text)?)
        }
        None => None,
    };

    Ok(Session { alignment, model, params, prefix, tree: None, input_tree })
}

/// Place every taxon, most informative first, updating the model
/// periodically from the observed mutations.
fn build_initial_tree(cli: &Cli, session: &mut Session) -> Result<()> {
    let genome_length = session.alignment.genome_length();
    let reference = session.alignment.reference().clone();

    let (mut tree, placed) = match session.input_tree.take() {
        Some(newick) => {
            let tree = tree_from_newick(&newick, &session.alignment, &session.model, &session.params)?;
            info!("Loaded an input tree covering {} taxa", tree.num_taxa());
            let placed: ahash::AHashSet<String> = session.alignment.sequences().iter()
                .filter(|s| tree.find_leaf(s.name()).is_some())
                .map(|s| s.name().to_string())
                .collect();
            (tree, placed)
        }
        None => {
            let first = &session.alignment.sequences()[0];
            let lower = SeqRegions::from_sequence(first, genome_length);
            debug!("Root sample: {}", first.name());
            let tree = Tree::with_root_sample(first.name().to_string(), lower, genome_length);
            (tree, std::iter::once(first.name().to_string()).collect())
        }
    };

    let bar = ProgressBar::new(session.alignment.len() as u64)
        .with_style(ProgressStyle::with_template("{msg} [{bar:40}] {pos}/{len}").expect("static template"));
    let bar = match logger::Logger::try_multi() {
        Some(multi) => multi.add(bar),
        None => bar,
    };
    bar.set_message("Placing samples");
    bar.inc(placed.len().min(session.alignment.len()) as u64);

    for i in 0..session.alignment.len() {
        let sequence = &session.alignment.sequences()[i];
        if placed.contains(sequence.name()) {
            continue;
        }
        let sample = SeqRegions::from_sequence(sequence, genome_length);

        if i > 0 && (i as u32) % cli.mutation_update == 0 && session.model.update_empirical(&reference) {
            debug!("Empirical model update after {i} placements");
        }

        let name = sequence.name().to_string();
        let placement = {
            let ctx = MergeCtx::new(&session.model, &reference, session.params.threshold_prob);
            tree.seek_placement(&sample, &session.params, &ctx)
        };
        match placement {
            Placement::LessInformative { leaf } => {
                debug!("{name} adds no information; absorbed");
                tree.absorb_less_informative(leaf, name);
            }
            Placement::Attach(site) => {
                tree.place_sample(&site, name, sample, &mut session.model, &session.params, &reference);
            }
        }
        bar.inc(1);
    }
    bar.finish_and_clear();

    // Recompute everything under the final model estimate.
    session.model.update_empirical(&reference);
    let ctx = MergeCtx::new(&session.model, &reference, session.params.threshold_prob);
    tree.refresh_all(&ctx);
    info!("Initial tree holds {} taxa on {} leaves", tree.num_taxa(), tree.num_leaves());

    session.tree = Some(tree);
    Ok(())
}

/// Topology search, rate-variation refit and branch-length optimisation.
fn optimize_tree(cli: &Cli, session: &mut Session) -> Result<()> {
    let reference = session.alignment.reference().clone();
    export_tree(cli, session, "_init.treefile", false)?;

    if cli.rate_variation {
        let estimator = {
            let Session { tree, model, params, .. } = &mut *session;
            tree.as_mut().expect("tree built")
                .estimate_rate_variation(model, params, &reference, cli.site_rates)
        };
        dump_rate_matrices(cli, session, estimator.as_ref())?;
    }

    let searchable = cli.tree.is_none() || cli.replace_input_tree;
    if !searchable && cli.tree_search != TreeSearch::No {
        info!("Keeping the input topology (pass --replace-input-tree to allow changes)");
    }

    if searchable && cli.tree_search != TreeSearch::No {
        if cli.short_topology_search || cli.tree_search == TreeSearch::Partial {
            let improvement = {
                let Session { tree, model, params, .. } = &mut *session;
                tree.as_mut().expect("tree built").optimize_topology(model, params, &reference, true)
            };
            info!("Short-range topology search improved the tree by {improvement:.4}");
            export_tree(cli, session, "_short_search.treefile", false)?;
        }
        if cli.tree_search == TreeSearch::Complete {
            let improvement = {
                let Session { tree, model, params, .. } = &mut *session;
                tree.as_mut().expect("tree built").optimize_topology(model, params, &reference, false)
            };
            info!("Topology search improved the tree by {improvement:.4}");
            export_tree(cli, session, "_topo.treefile", false)?;
        }
    }

    if !session.params.fixed_blength {
        let improved = {
            let Session { tree, model, params, .. } = &mut *session;
            tree.as_mut().expect("tree built").optimize_branch_lengths(model, params, &reference)
        };
        info!("Branch-length optimisation accepted {improved} updates");
    }
    Ok(())
}

/// Branch supports and the final tree file.
fn post_inference(cli: &Cli, session: &mut Session) -> Result<()> {
    let reference = session.alignment.reference().clone();

    if cli.branch_support {
        let support = SupportParams {
            replicates: cli.replicates,
            epsilon: cli.epsilon,
            seed: cli.seed,
        };
        let Session { tree, model, params, .. } = &mut *session;
        tree.as_mut().expect("tree built").compute_branch_supports(model, params, &reference, &support);
    }

    export_tree(cli, session, ".treefile", cli.branch_support)?;

    let Session { tree, model, params, .. } = &mut *session;
    let ctx = MergeCtx::new(model, &reference, params.threshold_prob);
    let total_lh = tree.as_mut().expect("tree built").log_lh(&ctx);
    info!("Total log-likelihood: {total_lh:.6}");
    Ok(())
}

fn export_tree(cli: &Cli, session: &mut Session, suffix: &str, with_support: bool) -> Result<()> {
    let path = suffixed(&session.prefix, suffix);
    let newick = session.tree_mut().to_newick(!cli.multifurcating_tree, with_support);
    write::write_tree_file(&path, &newick, cli.overwrite)?;
    Ok(())
}

fn dump_rate_matrices(
    cli: &Cli,
    session: &mut Session,
    estimator: Option<&likelihood::model::PerEntryEstimator>,
) -> Result<()> {
    if !log::log_enabled!(log::Level::Debug) {
        return Ok(());
    }
    let Some(per_site) = session.model.per_site() else {
        return Ok(());
    };
    let path = suffixed(&session.prefix, ".rateMatrices.txt");
    let mut out = write::create_output(&path, cli.overwrite)?;
    per_site.write_rate_matrices(&mut out)?;
    info!("Wrote per-site rate matrices to {}", path.display());

    if let Some(estimator) = estimator {
        let path = suffixed(&session.prefix, ".countMatrices.txt");
        let mut out = write::create_output(&path, cli.overwrite)?;
        estimator.write_counts(&mut out)?;
        info!("Wrote per-site count matrices to {}", path.display());
    }
    Ok(())
}

/// Turn a parsed Newick topology into a working tree: bind the leaves to
/// the alignment's taxa, binarise multifurcations with zero-length
/// junctions, and fill the likelihood caches.
fn tree_from_newick(
    newick: &read::NewickNode,
    alignment: &Alignment,
    model: &Model,
    params: &SearchParams,
) -> Result<Tree> {
    let genome_length = alignment.genome_length();
    let by_name: ahash::AHashMap<&str, &Sequence> = alignment.sequences().iter()
        .map(|s| (s.name(), s))
        .collect();

    let mut tree = Tree::new(genome_length);
    let root = build_newick_node(newick, &by_name, &mut tree, genome_length)?;
    tree.set_root(root);
    tree.set_blength(root, 0.0);

    if tree.node(root).is_leaf() {
        bail!("The input tree holds a single taxon");
    }
    let ctx = MergeCtx::new(model, alignment.reference(), params.threshold_prob);
    tree.refresh_all(&ctx);
    Ok(tree)
}

fn build_newick_node(
    node: &read::NewickNode,
    by_name: &ahash::AHashMap<&str, &Sequence>,
    tree: &mut Tree,
    genome_length: genome::Position,
) -> Result<phylo::NodeIndex> {
    if node.children.is_empty() {
        let name = node.name.as_deref()
            .ok_or_else(|| anyhow::anyhow!("the input tree holds an unnamed leaf"))?;
        let sequence = by_name.get(name)
            .ok_or_else(|| anyhow::anyhow!("taxon '{name}' of the input tree is missing from the alignment"))?;
        let lower = SeqRegions::from_sequence(sequence, genome_length);
        let idx = tree.add_leaf(name.to_string(), lower);
        tree.set_blength(idx, node.blength.max(0.0));
        return Ok(idx);
    }

    let children: Vec<phylo::NodeIndex> = node.children.iter()
        .map(|child| build_newick_node(child, by_name, tree, genome_length))
        .collect::<Result<_>>()?;

    // Fold polytomies into a left-leaning cascade of zero-length
    // junctions.
    let mut current = children[0];
    for (i, &child) in children.iter().enumerate().skip(1) {
        let junction = tree.add_internal();
        tree.set_children(junction, [current, child]);
        let blength = if i == children.len() - 1 { node.blength.max(0.0) } else { 0.0 };
        tree.set_blength(junction, blength);
        current = junction;
    }
    Ok(current)
}
