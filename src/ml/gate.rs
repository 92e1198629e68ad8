// ============================================================
// Layer 5 — Uncertainty Estimator and Gate/Merge
// ============================================================
// Decides, token by token, whether the refined label replaces
// the draft label.
//
//   H[i]    = -Σ_l p[i,l] · ln(p[i,l] + ε)       (0 at padding)
//   mask[i] = policy(H)                           true → refined
//   final   = mask ? refined : draft              (0 at padding)
//
// Two mutually exclusive policies:
//   Threshold(t): mask[i] = H[i] > t   (strict)
//   TopK(k):      per sentence, the k most uncertain real tokens;
//                 equal entropies go to the earlier position
//
// All arrays are flat row-major [rows, cols] in the canonical
// (length-sorted) layout of the batch.

use crate::domain::error::{TaggerError, TaggerResult};

const EPSILON: f32 = 1e-12;

/// Per-token entropy of a flat [rows*cols, num_labels] distribution.
pub fn entropy(probs: &[f32], num_labels: usize, mask: &[bool]) -> Vec<f32> {
    mask.iter()
        .enumerate()
        .map(|(i, &real)| {
            if !real {
                return 0.0;
            }
            let h: f32 = probs[i * num_labels..(i + 1) * num_labels]
                .iter()
                .map(|&p| -p * (p + EPSILON).ln())
                .sum();
            // rounding can push a one-hot row a hair below zero
            h.max(0.0)
        })
        .collect()
}

// ─── Gate Policy ──────────────────────────────────────────────────────────────
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GatePolicy {
    Threshold(f32),
    TopK(usize),
}

impl GatePolicy {
    /// Resolve the `threshold` / `topk` options.
    ///
    /// # Errors
    /// Configuration error when both or neither are given, or when
    /// the threshold is not a finite number.
    pub fn from_options(threshold: Option<f32>, topk: Option<usize>) -> TaggerResult<Self> {
        match (threshold, topk) {
            (Some(_), Some(_)) => Err(TaggerError::configuration(
                "`threshold` and `topk` are mutually exclusive",
            )),
            (None, None) => Err(TaggerError::configuration(
                "one of `threshold` or `topk` must be set",
            )),
            (Some(t), None) if !t.is_finite() => Err(TaggerError::configuration(format!(
                "threshold must be finite, got {t}"
            ))),
            (Some(t), None) => Ok(Self::Threshold(t)),
            (None, Some(k)) => Ok(Self::TopK(k)),
        }
    }

    /// Label mask over a flat [rows, cols] entropy array
    pub fn label_mask(&self, entropy: &[f32], mask: &[bool], rows: usize, cols: usize) -> Vec<bool> {
        match *self {
            Self::Threshold(t) => entropy
                .iter()
                .zip(mask)
                .map(|(&h, &real)| real && h > t)
                .collect(),
            Self::TopK(k) => {
                let mut out = vec![false; rows * cols];
                for r in 0..rows {
                    let row = r * cols..(r + 1) * cols;
                    // rank every slot; stable sort keeps earlier positions first on ties
                    let mut ranked: Vec<usize> = (0..cols).collect();
                    ranked.sort_by(|&a, &b| entropy[row.start + b].total_cmp(&entropy[row.start + a]));
                    ranked
                        .into_iter()
                        .filter(|&c| mask[row.start + c])
                        .take(k)
                        .for_each(|c| out[row.start + c] = true);
                }
                out
            }
        }
    }
}

/// Per-token merge of draft and refined labels
pub fn merge(draft: &[usize], refined: &[usize], label_mask: &[bool], mask: &[bool]) -> Vec<usize> {
    (0..mask.len())
        .map(|i| match (mask[i], label_mask[i]) {
            (false, _)    => 0,
            (true, true)  => refined[i],
            (true, false) => draft[i],
        })
        .collect()
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_entropy_of_uniform_and_one_hot() {
        let probs = vec![0.25, 0.25, 0.25, 0.25, 1.0, 0.0, 0.0, 0.0];
        let h = entropy(&probs, 4, &[true, true]);
        assert!((h[0] - 4f32.ln()).abs() < 1e-5);
        assert!(h[1].abs() < 1e-6);
    }

    #[test]
    fn test_entropy_is_zero_at_padding() {
        let probs = vec![0.5, 0.5, 0.5, 0.5];
        let h = entropy(&probs, 2, &[true, false]);
        assert!(h[0] > 0.0);
        assert_eq!(h[1], 0.0);
    }

    #[test]
    fn test_threshold_zero_marks_every_real_token() {
        let probs = vec![0.7, 0.2, 0.1, 0.6, 0.3, 0.1, 0.5, 0.4, 0.1];
        let mask  = vec![true, true, false];
        let h     = entropy(&probs, 3, &mask);
        let gate  = GatePolicy::from_options(Some(0.0), None).unwrap();
        assert_eq!(gate.label_mask(&h, &mask, 1, 3), vec![true, true, false]);
    }

    #[test]
    fn test_threshold_is_strict() {
        let gate = GatePolicy::Threshold(0.5);
        assert_eq!(gate.label_mask(&[0.5, 0.6], &[true, true], 1, 2), vec![false, true]);
    }

    #[test]
    fn test_topk_breaks_ties_by_position() {
        let gate = GatePolicy::TopK(2);
        let h    = vec![0.3, 0.9, 0.3, 0.3, 0.0, 0.2, 0.2, 0.0];
        let mask = vec![true, true, true, true, true, true, true, false];
        let out  = gate.label_mask(&h, &mask, 2, 4);
        assert_eq!(out, vec![true, true, false, false, false, true, true, false]);
    }

    #[test]
    fn test_topk_larger_than_sentence_skips_padding() {
        let gate = GatePolicy::TopK(5);
        let out  = gate.label_mask(&[0.1, 0.2, 0.0], &[true, true, false], 1, 3);
        assert_eq!(out, vec![true, true, false]);
    }

    #[test]
    fn test_policy_options_are_exclusive() {
        assert!(matches!(GatePolicy::from_options(Some(0.1), Some(3)), Err(TaggerError::Configuration(_))));
        assert!(matches!(GatePolicy::from_options(None, None), Err(TaggerError::Configuration(_))));
        assert!(GatePolicy::from_options(Some(f32::NAN), None).is_err());
        assert_eq!(GatePolicy::from_options(None, Some(3)).unwrap(), GatePolicy::TopK(3));
    }

    #[test]
    fn test_merge_takes_refined_only_where_masked() {
        let draft   = vec![1, 1, 1, 1];
        let refined = vec![2, 2, 2, 2];
        let out = merge(&draft, &refined, &[true, false, true, false], &[true, true, false, false]);
        assert_eq!(out, vec![2, 1, 0, 0]);
    }

    fn distribution(n: usize) -> impl Strategy<Value = Vec<f32>> {
        prop::collection::vec(0.0f32..1.0, n).prop_map(|raw| {
            let total: f32 = raw.iter().sum::<f32>() + 1e-3;
            raw.iter().map(|v| (v + 1e-3 / raw.len() as f32) / total).collect()
        })
    }

    proptest! {
        #[test]
        fn prop_entropy_within_bounds(probs in distribution(5)) {
            let h = entropy(&probs, 5, &[true])[0];
            prop_assert!(h >= 0.0);
            prop_assert!(h <= 5f32.ln() + 1e-4);
        }

        #[test]
        fn prop_merge_partitions_valid_tokens(
            label_mask in prop::collection::vec(any::<bool>(), 12),
            mask in prop::collection::vec(any::<bool>(), 12),
        ) {
            let draft   = vec![3usize; 12];
            let refined = vec![5usize; 12];
            let out = merge(&draft, &refined, &label_mask, &mask);
            let from_refined = out.iter().filter(|&&l| l == 5).count();
            let from_draft   = out.iter().filter(|&&l| l == 3).count();
            let real         = mask.iter().filter(|&&m| m).count();
            prop_assert_eq!(from_refined + from_draft, real);
            for i in 0..12 {
                prop_assert_eq!(out[i] == 5, mask[i] && label_mask[i]);
            }
        }
    }
}
