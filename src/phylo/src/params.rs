/// Tunables of the placement search, topology search and branch-length
/// optimisation, bundled into one explicit value threaded through every
/// operation.
///
/// The branch-length scales derive from the genome length: the default
/// initial branch carries one expected mutation (`1 / L`).
#[derive(Debug, Clone)]
pub struct SearchParams {
    pub default_blength: f64,
    pub min_blength: f64,
    pub max_blength: f64,
    pub min_blength_mid: f64,
    pub min_blength_sensitivity: f64,

    pub threshold_prob: f64,
    /// A step along a search path counts as a failure once its cost drops
    /// this far below its parent's.
    pub thresh_log_lh_failure: f64,

    pub failure_limit_sample: u32,
    pub failure_limit_subtree: u32,
    pub failure_limit_subtree_short_search: u32,
    pub strict_stop_seeking_placement_sample: bool,
    pub strict_stop_seeking_placement_subtree: bool,

    /// Minimum cost delta before a regraft is worth applying.
    pub thresh_placement_cost: f64,
    pub thresh_placement_cost_short_search: f64,

    pub num_tree_improvement: u32,
    pub thresh_entire_tree_improvement: f64,
    /// Edge radius of the regraft search in short-range mode.
    pub short_range_radius: usize,

    /// Keep input branch lengths untouched.
    pub fixed_blength: bool,
}

impl SearchParams {
    /// Defaults scaled to a genome of `genome_length` positions.
    #[must_use]
    pub fn new(genome_length: u32) -> SearchParams {
        let default_blength = 1.0 / f64::from(genome_length);
        let min_blength = 0.2 * default_blength;
        SearchParams {
            default_blength,
            min_blength,
            max_blength: 40.0 * default_blength,
            min_blength_mid: 4.1 * default_blength,
            min_blength_sensitivity: min_blength * 1e-5,
            threshold_prob: 1e-8,
            thresh_log_lh_failure: 0.01,
            failure_limit_sample: 5,
            failure_limit_subtree: 4,
            failure_limit_subtree_short_search: 1,
            strict_stop_seeking_placement_sample: false,
            strict_stop_seeking_placement_subtree: false,
            thresh_placement_cost: -1e-5,
            thresh_placement_cost_short_search: -1.0,
            num_tree_improvement: 1,
            thresh_entire_tree_improvement: 1.0,
            short_range_radius: 5,
            fixed_blength: false,
        }
    }

    #[must_use]
    pub fn threshold_prob2(&self) -> f64 {
        self.threshold_prob * self.threshold_prob
    }
}
