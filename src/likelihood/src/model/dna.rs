use genome::{Base, Position, RefSeq, ALPHABET_SIZE};

use super::{ModelKind, SubstitutionModel};
use crate::regions::SeqRegions;

/// Empirical updates below this per-entry delta count as "nothing moved".
const THRESH_DIFF_UPDATE: f64 = 1e-7;

/// One rate matrix for the whole genome.
///
/// The matrix starts from JC and, for the empirical kinds, is rebuilt from
/// the mutation counts observed against the reference while samples are
/// placed. Row sums are kept at zero and the matrix is normalised so the
/// stationary flow equals one substitution per unit branch length.
#[derive(Debug, Clone)]
pub struct DnaModel {
    kind: ModelKind,
    freqs: [f64; ALPHABET_SIZE],
    log_freqs: [f64; ALPHABET_SIZE],
    q: [[f64; ALPHABET_SIZE]; ALPHABET_SIZE],
    freq_j_qji: [[f64; ALPHABET_SIZE]; ALPHABET_SIZE],
    pseudocounts: [[f64; ALPHABET_SIZE]; ALPHABET_SIZE],
    cumulative_rate: Vec<f64>,
    cumulative_logfreq: Vec<f64>,
}

impl DnaModel {
    #[must_use]
    pub fn new(kind: ModelKind, reference: &RefSeq) -> DnaModel {
        // One pseudo-observation per base keeps the stationary
        // distribution strictly positive.
        let len = reference.len() as f64;
        let mut freqs = reference.base_freqs();
        for freq in &mut freqs {
            *freq = (*freq * len + 1.0) / (len + ALPHABET_SIZE as f64);
        }
        let mut log_freqs = [0.0; ALPHABET_SIZE];
        for (log_freq, freq) in log_freqs.iter_mut().zip(freqs) {
            *log_freq = freq.ln();
        }

        // Every off-diagonal starts with one pseudo-observation, so the
        // first empirical update is defined even before any mutation is
        // seen.
        let mut pseudocounts = [[1.0; ALPHABET_SIZE]; ALPHABET_SIZE];
        for (i, row) in pseudocounts.iter_mut().enumerate() {
            row[i] = 0.0;
        }

        let mut model = DnaModel {
            kind,
            freqs,
            log_freqs,
            q: Self::jc_matrix(),
            freq_j_qji: [[0.0; ALPHABET_SIZE]; ALPHABET_SIZE],
            pseudocounts,
            cumulative_rate: Vec::new(),
            cumulative_logfreq: Vec::new(),
        };
        model.rebuild_derived(reference);
        model
    }

    fn jc_matrix() -> [[f64; ALPHABET_SIZE]; ALPHABET_SIZE] {
        let mut q = [[1.0 / 3.0; ALPHABET_SIZE]; ALPHABET_SIZE];
        for (i, row) in q.iter_mut().enumerate() {
            row[i] = -1.0;
        }
        q
    }

    #[must_use]
    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    /// The full rate matrix, row = source state.
    #[must_use]
    pub fn matrix(&self) -> &[[f64; ALPHABET_SIZE]; ALPHABET_SIZE] {
        &self.q
    }

    /// Recompute the derived products and cumulative tables after the rate
    /// matrix changed.
    fn rebuild_derived(&mut self, reference: &RefSeq) {
        for i in 0..ALPHABET_SIZE {
            for j in 0..ALPHABET_SIZE {
                self.freq_j_qji[i][j] = self.freqs[j] * self.q[j][i];
            }
        }

        let len = reference.len();
        self.cumulative_rate.clear();
        self.cumulative_rate.reserve(len + 1);
        self.cumulative_rate.push(0.0);
        self.cumulative_logfreq.clear();
        self.cumulative_logfreq.reserve(len + 1);
        self.cumulative_logfreq.push(0.0);
        for (k, base) in reference.bases().iter().enumerate() {
            let i = base.index();
            self.cumulative_rate.push(self.cumulative_rate[k] - self.q[i][i]);
            self.cumulative_logfreq.push(self.cumulative_logfreq[k] + self.log_freqs[i]);
        }
    }

    /// Rebuild `q` from the pseudocount matrix: GTR symmetrises the counts,
    /// UNREST uses them raw; rows are scaled by 1/pi and the whole matrix
    /// normalised to unit stationary flow. Row sums return to zero through
    /// the diagonal.
    fn rebuild_from_counts(&mut self, reference: &RefSeq) -> bool {
        let mut q = [[0.0; ALPHABET_SIZE]; ALPHABET_SIZE];
        for i in 0..ALPHABET_SIZE {
            for j in 0..ALPHABET_SIZE {
                if i == j {
                    continue;
                }
                let count = match self.kind {
                    ModelKind::Gtr => self.pseudocounts[i][j] + self.pseudocounts[j][i],
                    _ => self.pseudocounts[i][j],
                };
                q[i][j] = count / self.freqs[i];
            }
            q[i][i] = -q[i].iter().sum::<f64>();
        }

        // Normalise: one expected substitution per unit time at stationarity.
        let total_rate: f64 = (0..ALPHABET_SIZE).map(|i| -self.freqs[i] * q[i][i]).sum();
        for row in &mut q {
            for value in row.iter_mut() {
                *value /= total_rate;
            }
        }

        let changed = self.q.iter().flatten()
            .zip(q.iter().flatten())
            .any(|(old, new)| (old - new).abs() > THRESH_DIFF_UPDATE);
        if changed {
            self.q = q;
            self.rebuild_derived(reference);
        }
        changed
    }
}

impl SubstitutionModel for DnaModel {
    fn freqs(&self) -> &[f64; ALPHABET_SIZE] {
        &self.freqs
    }

    fn log_freqs(&self) -> &[f64; ALPHABET_SIZE] {
        &self.log_freqs
    }

    fn entry(&self, from: Base, to: Base, _pos: Position) -> f64 {
        self.q[from.index()][to.index()]
    }

    fn diagonal(&self, state: Base, _pos: Position) -> f64 {
        self.q[state.index()][state.index()]
    }

    fn freq_j_qji(&self, i: Base, j: Base, _pos: Position) -> f64 {
        self.freq_j_qji[i.index()][j.index()]
    }

    fn cumulative_rate_span(&self, start: Position, end: Position) -> f64 {
        self.cumulative_rate[end as usize + 1] - self.cumulative_rate[start as usize]
    }

    fn cumulative_logfreq_span(&self, start: Position, end: Position) -> f64 {
        self.cumulative_logfreq[end as usize + 1] - self.cumulative_logfreq[start as usize]
    }

    fn update_empirical(&mut self, reference: &RefSeq) -> bool {
        if !self.kind.is_empirical() {
            return false;
        }
        self.rebuild_from_counts(reference)
    }

    fn update_pseudocounts(&mut self, reference: &RefSeq, node: &SeqRegions, sample: &SeqRegions) {
        if !self.kind.is_empirical() {
            return;
        }
        for seg in node.shared_segments(sample) {
            let (Some(from), Some(to)) = (
                seg.a.concrete_state(reference, seg.end),
                seg.b.concrete_state(reference, seg.end),
            ) else {
                continue;
            };
            if from != to {
                self.pseudocounts[from.index()][to.index()] += 1.0;
            }
        }
    }
}
