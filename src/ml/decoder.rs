// ============================================================
// Layer 5 — Sequence Decoder
// ============================================================
// Turns a grid of per-token label scores into label sequences.
//
//   ArgMax   each token independently takes its best label
//   Crf      linear-chain Viterbi over a (T × T) transition
//            matrix, T = L + 2 (L labels plus START and STOP)
//
//            score(y) = trans[START, y_0]
//                     + Σ_t emit[t, y_t]
//                     + Σ_t trans[y_{t-1}, y_t]
//                     + trans[y_n, STOP]
//
// The draft stage always decodes with ArgMax; only the
// refinement stage may use the CRF.
//
// Everything here is plain Rust over f32 slices: the trainer
// differentiates the CRF objective in `ml::crf`, and this file
// carries the reference objective the tensor version is
// checked against.
//
// Reference: Lafferty et al. (2001) Conditional Random Fields
//            Viterbi (1967)

use serde::{Deserialize, Serialize};

/// Decoder selection made at configuration time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecoderKind {
    ArgMax,
    Crf,
}

impl DecoderKind {
    pub fn from_use_crf(use_crf: bool) -> Self {
        if use_crf { Self::Crf } else { Self::ArgMax }
    }
}

/// Flat row-major [rows, cols, tags] emission scores
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreGrid {
    pub rows:   usize,
    pub cols:   usize,
    pub tags:   usize,
    pub scores: Vec<f32>,
}

impl ScoreGrid {
    pub fn new(rows: usize, cols: usize, tags: usize, scores: Vec<f32>) -> Self {
        debug_assert_eq!(scores.len(), rows * cols * tags);
        Self { rows, cols, tags, scores }
    }

    /// Scores of token `col` in sequence `row`
    pub fn token(&self, row: usize, col: usize) -> &[f32] {
        let at = (row * self.cols + col) * self.tags;
        &self.scores[at..at + self.tags]
    }
}

// ─── Transitions ──────────────────────────────────────────────────────────────
/// Square transition matrix; `get(from, to)`.
/// The last two tags are START and STOP.
#[derive(Debug, Clone, PartialEq)]
pub struct Transitions {
    pub size:   usize,
    pub values: Vec<f32>,
}

/// Score placed on forbidden transitions
pub const IMPOSSIBLE: f32 = -10_000.0;

impl Transitions {
    /// All-zero matrix over `num_labels + 2` tags
    pub fn zeros(num_labels: usize) -> Self {
        let size = num_labels + 2;
        Self { size, values: vec![0.0; size * size] }
    }

    /// Zero matrix with the structural constraints applied:
    /// nothing enters START, nothing leaves STOP, and the padding
    /// label 0 is unreachable.
    pub fn constrained(num_labels: usize) -> Self {
        let mut t = Self::zeros(num_labels);
        let (start, stop) = (t.start(), t.stop());
        for i in 0..t.size {
            t.set(i, start, IMPOSSIBLE);
            t.set(stop, i, IMPOSSIBLE);
            t.set(i, 0, IMPOSSIBLE);
            t.set(0, i, IMPOSSIBLE);
        }
        t
    }

    pub fn start(&self) -> usize { self.size - 2 }

    pub fn stop(&self) -> usize { self.size - 1 }

    pub fn get(&self, from: usize, to: usize) -> f32 {
        self.values[from * self.size + to]
    }

    pub fn set(&mut self, from: usize, to: usize, value: f32) {
        self.values[from * self.size + to] = value;
    }
}

/// Flattened transition indices (`from * size + to`) touched by the
/// gold path of every sequence: START→y_0, y_{t-1}→y_t, y_n→STOP.
/// `labels` is flat [rows, cols]; `lengths` per row.
pub fn gold_transition_indices(labels: &[usize], lengths: &[usize], cols: usize, size: usize) -> Vec<usize> {
    let (start, stop) = (size - 2, size - 1);
    let mut out = Vec::new();
    for (row, &len) in lengths.iter().enumerate() {
        if len == 0 {
            continue;
        }
        let seq = &labels[row * cols..row * cols + len];
        out.push(start * size + seq[0]);
        for pair in seq.windows(2) {
            out.push(pair[0] * size + pair[1]);
        }
        out.push(seq[len - 1] * size + stop);
    }
    out
}

// ─── Decoder ──────────────────────────────────────────────────────────────────
#[derive(Debug, Clone)]
pub enum SequenceDecoder {
    ArgMax,
    Crf(Transitions),
}

impl SequenceDecoder {
    /// Decode every row of `grid`; `mask` is flat [rows, cols].
    /// Returns flat [rows, cols] labels with 0 at padding.
    pub fn decode(&self, grid: &ScoreGrid, mask: &[bool]) -> Vec<usize> {
        let mut out = vec![0usize; grid.rows * grid.cols];
        for row in 0..grid.rows {
            let len = mask[row * grid.cols..(row + 1) * grid.cols].iter().filter(|&&m| m).count();
            if len == 0 {
                continue;
            }
            let path = match self {
                Self::ArgMax         => (0..len).map(|t| argmax(grid.token(row, t))).collect(),
                Self::Crf(trans)     => viterbi(grid, row, len, trans),
            };
            out[row * grid.cols..row * grid.cols + len].copy_from_slice(&path);
        }
        out
    }
}

fn argmax(scores: &[f32]) -> usize {
    let mut best = 0;
    for (i, &s) in scores.iter().enumerate() {
        if s > scores[best] {
            best = i;
        }
    }
    best
}

/// Best path of the first `len` tokens of `row`; O(len · T²)
pub fn viterbi(grid: &ScoreGrid, row: usize, len: usize, trans: &Transitions) -> Vec<usize> {
    let t_size = trans.size;

    // ── Step 1: initial scores out of START ───────────────────────────────
    let first = grid.token(row, 0);
    let mut score: Vec<f32> = (0..t_size).map(|j| trans.get(trans.start(), j) + first[j]).collect();
    let mut back: Vec<Vec<usize>> = Vec::with_capacity(len);

    // ── Step 2: recurrence ────────────────────────────────────────────────
    for t in 1..len {
        let emit = grid.token(row, t);
        let mut next    = vec![f32::NEG_INFINITY; t_size];
        let mut pointer = vec![0usize; t_size];
        for j in 0..t_size {
            for i in 0..t_size {
                let s = score[i] + trans.get(i, j);
                if s > next[j] {
                    next[j]    = s;
                    pointer[j] = i;
                }
            }
            next[j] += emit[j];
        }
        back.push(pointer);
        score = next;
    }

    // ── Step 3: close with STOP and backtrack ─────────────────────────────
    let closing: Vec<f32> = (0..t_size).map(|j| score[j] + trans.get(j, trans.stop())).collect();
    let mut best = argmax(&closing);
    let mut path = vec![best; len];
    for t in (1..len).rev() {
        best = back[t - 1][best];
        path[t - 1] = best;
    }
    path
}

fn log_sum_exp(values: &[f32]) -> f32 {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f32>().ln()
}

/// Negative log-likelihood of the gold paths, summed over rows:
/// forward-algorithm log partition minus gold path score.
pub fn crf_nll(grid: &ScoreGrid, labels: &[usize], lengths: &[usize], trans: &Transitions) -> f32 {
    let t_size = trans.size;
    let mut total = 0.0f32;

    for (row, &len) in lengths.iter().enumerate() {
        if len == 0 {
            continue;
        }

        // log partition
        let first = grid.token(row, 0);
        let mut alpha: Vec<f32> = (0..t_size).map(|j| trans.get(trans.start(), j) + first[j]).collect();
        for t in 1..len {
            let emit = grid.token(row, t);
            alpha = (0..t_size)
                .map(|j| {
                    let incoming: Vec<f32> = (0..t_size).map(|i| alpha[i] + trans.get(i, j)).collect();
                    log_sum_exp(&incoming) + emit[j]
                })
                .collect();
        }
        let closing: Vec<f32> = (0..t_size).map(|j| alpha[j] + trans.get(j, trans.stop())).collect();
        let log_z = log_sum_exp(&closing);

        // gold path
        let seq = &labels[row * grid.cols..row * grid.cols + len];
        let mut gold = trans.get(trans.start(), seq[0]) + trans.get(seq[len - 1], trans.stop());
        for (t, &y) in seq.iter().enumerate() {
            gold += grid.token(row, t)[y];
            if t > 0 {
                gold += trans.get(seq[t - 1], y);
            }
        }

        total += log_z - gold;
    }
    total
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    /// One row, `len` tokens, L=3 labels + START/STOP columns
    fn grid(values: &[[f32; 3]]) -> ScoreGrid {
        let mut scores = Vec::new();
        for v in values {
            scores.extend_from_slice(v);
            scores.extend_from_slice(&[0.0, 0.0]);
        }
        ScoreGrid::new(1, values.len(), 5, scores)
    }

    #[test]
    fn test_zero_transitions_match_argmax() {
        let g    = grid(&[[0.1, 2.0, 0.3], [0.0, 0.2, 1.5], [3.0, 0.1, 0.2]]);
        let mask = vec![true; 3];
        let crf  = SequenceDecoder::Crf(Transitions::zeros(3)).decode(&g, &mask);
        let max  = SequenceDecoder::ArgMax.decode(&g, &mask);
        assert_eq!(crf, max);
        assert_eq!(crf, vec![1, 2, 0]);
    }

    #[test]
    fn test_single_label_degenerate_decodes_that_label() {
        // one real label besides padding; padding forbidden by constraints
        let trans = Transitions::constrained(2);
        let g = ScoreGrid::new(1, 3, 4, vec![
            0.0, 0.5, 0.0, 0.0,
            0.9, 0.1, 0.0, 0.0,
            0.0, 0.2, 0.0, 0.0,
        ]);
        let out = SequenceDecoder::Crf(trans).decode(&g, &[true, true, true]);
        assert_eq!(out, vec![1, 1, 1]);
    }

    #[test]
    fn test_transitions_override_emissions() {
        let mut trans = Transitions::zeros(3);
        // 1 → 2 is heavily penalised
        trans.set(1, 2, -100.0);
        let g   = grid(&[[0.0, 2.0, 0.0], [0.0, 0.0, 1.0]]);
        let out = SequenceDecoder::Crf(trans).decode(&g, &[true, true]);
        assert_ne!(out, vec![1, 2]);
    }

    #[test]
    fn test_all_padding_row_decodes_to_zeros() {
        let g = ScoreGrid::new(2, 2, 5, vec![1.0; 20]);
        let out = SequenceDecoder::Crf(Transitions::constrained(3)).decode(&g, &[true, true, false, false]);
        assert_eq!(&out[2..], &[0, 0]);
        assert_ne!(&out[..2], &[0, 0]);
    }

    #[test]
    fn test_gold_transition_indices() {
        // size 5: START=3, STOP=4
        let idx = gold_transition_indices(&[1, 2, 0, 2, 0, 0], &[2, 1], 3, 5);
        assert_eq!(idx, vec![3 * 5 + 1, 5 + 2, 2 * 5 + 4, 3 * 5 + 2, 2 * 5 + 4]);
    }

    #[test]
    fn test_nll_is_non_negative_and_small_for_dominant_path() {
        let g     = grid(&[[0.0, 20.0, 0.0], [0.0, 0.0, 20.0]]);
        let trans = Transitions::zeros(3);
        let good  = crf_nll(&g, &[1, 2], &[2], &trans);
        let bad   = crf_nll(&g, &[2, 1], &[2], &trans);
        assert!(good >= 0.0 && good < 1e-3);
        assert!(bad > 30.0);
    }

    #[test]
    fn test_nll_of_single_token_with_zero_transitions_is_softmax_ce() {
        let g    = grid(&[[1.0, 2.0, 0.5]]);
        let nll  = crf_nll(&g, &[1], &[1], &Transitions::zeros(3));
        let z    = [1.0f32, 2.0, 0.5, 0.0, 0.0].iter().map(|v| v.exp()).sum::<f32>();
        let want = z.ln() - 2.0;
        assert!((nll - want).abs() < 1e-5);
    }
}
