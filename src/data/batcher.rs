// ============================================================
// Layer 4 — Length Sorter / Recoverer (Batcher)
// ============================================================
// Turns a list of variable-length sentences into rectangular,
// length-sorted arrays, and remembers how to undo the sort.
//
// How canonicalisation works here:
//   Input:  N sentences of lengths l_0 … l_{N-1}
//   Output: CanonicalBatch with [N, S] arrays, S = max l_i,
//           rows sorted by descending length (stable), plus a
//           [N*S, W] character array, W = longest word, whose
//           rows are sorted by descending word length.
//
// Two independent permutation spaces:
//
//   SentenceOrder   over sentence rows          (0..N)
//   TokenOrder      over flattened token slots  (0..N*S)
//
// The token axis is laid out in *sentence-sorted* row order,
// so recovering character features with TokenOrder lines them
// up with the sorted word array; SentenceOrder then restores
// the caller's sentence order for evaluation and output.
//
// Padding positions hold id 0 and mask=false. A slot with no
// characters (a padding slot, or an empty word) still gets one
// padding character so no character row is empty.
//
// Reference: Burn Book §4 (Batcher)
//            Rust Book §8 (Vectors)

use std::cmp::Reverse;

use burn::prelude::*;

use crate::data::dataset::SentenceInstance;
use crate::domain::error::{TaggerError, TaggerResult};

// ─── SentenceOrder ────────────────────────────────────────────────────────────
/// Bijection between caller order and length-sorted order of
/// sentence rows. `order[k]` is the caller row placed at sorted
/// row k; `recover[order[k]] == k`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentenceOrder {
    order:   Vec<usize>,
    recover: Vec<usize>,
}

impl SentenceOrder {
    /// Sort rows by descending length; equal lengths keep caller order
    pub fn by_descending_length(lengths: &[usize]) -> Self {
        let mut order: Vec<usize> = (0..lengths.len()).collect();
        order.sort_by(|&a, &b| lengths[b].cmp(&lengths[a]));

        let mut recover = vec![0usize; order.len()];
        for (sorted_row, &caller_row) in order.iter().enumerate() {
            recover[caller_row] = sorted_row;
        }
        Self { order, recover }
    }

    pub fn order(&self) -> &[usize] { &self.order }

    pub fn recover(&self) -> &[usize] { &self.recover }

    pub fn len(&self) -> usize { self.order.len() }

    /// Reorder one value per row into sorted order
    pub fn sort<T: Clone>(&self, per_row: &[T]) -> Vec<T> {
        self.order.iter().map(|&r| per_row[r].clone()).collect()
    }

    /// Inverse of `sort`
    pub fn restore<T: Clone>(&self, sorted: &[T]) -> Vec<T> {
        self.recover.iter().map(|&k| sorted[k].clone()).collect()
    }

    /// Reorder a flat row-major [rows, width] array into sorted order
    pub fn sort_rows<T: Clone>(&self, flat: &[T], width: usize) -> Vec<T> {
        let mut out = Vec::with_capacity(flat.len());
        for &r in &self.order {
            out.extend_from_slice(&flat[r * width..(r + 1) * width]);
        }
        out
    }

    /// Inverse of `sort_rows`
    pub fn restore_rows<T: Clone>(&self, sorted: &[T], width: usize) -> Vec<T> {
        let mut out = Vec::with_capacity(sorted.len());
        for &k in &self.recover {
            out.extend_from_slice(&sorted[k * width..(k + 1) * width]);
        }
        out
    }
}

// ─── TokenOrder ───────────────────────────────────────────────────────────────
/// Bijection over flattened token slots, sorting character rows
/// by descending word length. Kept separate from SentenceOrder:
/// its domain is slot indices, not sentence indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenOrder {
    order:   Vec<usize>,
    recover: Vec<usize>,
}

impl TokenOrder {
    pub fn by_descending_word_length(word_lengths: &[usize]) -> Self {
        let mut order: Vec<usize> = (0..word_lengths.len()).collect();
        // sort_by_key is stable: equal lengths keep slot order
        order.sort_by_key(|&slot| Reverse(word_lengths[slot]));

        let mut recover = vec![0usize; word_lengths.len()];
        order
            .iter()
            .enumerate()
            .for_each(|(sorted_slot, &slot)| recover[slot] = sorted_slot);
        Self { order, recover }
    }

    pub fn order(&self) -> &[usize] { &self.order }

    pub fn recover(&self) -> &[usize] { &self.recover }

    pub fn len(&self) -> usize { self.order.len() }

    /// Sort per-slot values
    pub fn sort<T: Copy>(&self, per_slot: &[T]) -> Vec<T> {
        self.order.iter().map(|&s| per_slot[s]).collect()
    }

    /// Sort a flat [slots, width] character array
    pub fn sort_slots<T: Copy>(&self, flat: &[T], width: usize) -> Vec<T> {
        self.order
            .iter()
            .flat_map(|&s| flat[s * width..s * width + width].iter().copied())
            .collect()
    }

    /// Restore a flat [slots, width] array to slot order
    pub fn restore_slots<T: Copy>(&self, sorted: &[T], width: usize) -> Vec<T> {
        self.recover
            .iter()
            .flat_map(|&k| sorted[k * width..k * width + width].iter().copied())
            .collect()
    }
}

// ─── CanonicalBatch ───────────────────────────────────────────────────────────
/// Rectangular, length-sorted arrays for one batch.
/// All [N, S] arrays are flat row-major in sentence-sorted order.
#[derive(Debug, Clone)]
pub struct CanonicalBatch {
    pub batch_size:   usize,
    pub max_seq_len:  usize,
    pub max_word_len: usize,

    /// Sentence lengths, sorted (descending)
    pub lengths:      Vec<usize>,

    /// [N, S] word ids
    pub words:        Vec<usize>,
    /// One [N, S] array per feature channel
    pub features:     Vec<Vec<usize>>,
    /// [N, S] gold label ids (0 at padding or when unlabeled)
    pub labels:       Vec<usize>,
    /// [N, S] true = real token
    pub mask:         Vec<bool>,
    /// [N, S] document id of every slot (0 at padding)
    pub doc_ids:      Vec<usize>,
    /// [N, S] within-document position (0 at padding)
    pub positions:    Vec<usize>,

    /// [N*S, W] character ids, rows sorted by TokenOrder
    pub chars:        Vec<usize>,
    /// [N*S] character counts (≥ 1), sorted by TokenOrder
    pub char_lengths: Vec<usize>,

    pub word_order:   SentenceOrder,
    pub char_order:   TokenOrder,

    /// False for decode-only batches
    pub has_gold:     bool,
}

impl CanonicalBatch {
    /// Canonicalise a list of sentences.
    ///
    /// # Errors
    /// InvalidInput for an empty batch, a zero-length sentence,
    /// per-token arrays whose lengths disagree with the word array,
    /// or tokens with differing feature-channel counts.
    pub fn build(sentences: &[&SentenceInstance], has_gold: bool) -> TaggerResult<Self> {
        validate(sentences)?;

        let batch_size  = sentences.len();
        let max_seq_len = sentences.iter().map(|s| s.len()).max().unwrap_or(0);
        let feature_num = sentences[0].features.first().map_or(0, Vec::len);
        let cells       = batch_size * max_seq_len;

        // ── Fill [N, S] arrays in caller order ────────────────────────────────
        let mut words     = vec![0usize; cells];
        let mut features  = vec![vec![0usize; cells]; feature_num];
        let mut labels    = vec![0usize; cells];
        let mut mask      = vec![false; cells];
        let mut doc_ids   = vec![0usize; cells];
        let mut positions = vec![0usize; cells];

        for (row, sent) in sentences.iter().enumerate() {
            for t in 0..sent.len() {
                let cell = row * max_seq_len + t;
                words[cell]     = sent.words[t];
                labels[cell]    = if has_gold { sent.labels[t] } else { 0 };
                mask[cell]      = true;
                doc_ids[cell]   = sent.doc_id;
                positions[cell] = sent.positions[t];
                for (c, channel) in features.iter_mut().enumerate() {
                    channel[cell] = sent.features[t][c];
                }
            }
        }

        // ── Sort rows by descending sentence length ───────────────────────────
        let caller_lengths: Vec<usize> = sentences.iter().map(|s| s.len()).collect();
        let word_order = SentenceOrder::by_descending_length(&caller_lengths);

        let lengths   = word_order.sort(&caller_lengths);
        let words     = word_order.sort_rows(&words, max_seq_len);
        let features  = features.iter().map(|ch| word_order.sort_rows(ch, max_seq_len)).collect();
        let labels    = word_order.sort_rows(&labels, max_seq_len);
        let mask      = word_order.sort_rows(&mask, max_seq_len);
        let doc_ids   = word_order.sort_rows(&doc_ids, max_seq_len);
        let positions = word_order.sort_rows(&positions, max_seq_len);

        // ── Characters over the sentence-sorted token slots ──────────────────
        let slot_chars: Vec<&[usize]> = word_order
            .order()
            .iter()
            .flat_map(|&row| {
                let sent = sentences[row];
                (0..max_seq_len).map(move |t| match sent.chars.get(t) {
                    Some(chars) => chars.as_slice(),
                    None        => &[][..],
                })
            })
            .collect();

        let slot_lengths: Vec<usize> = slot_chars.iter().map(|c| c.len().max(1)).collect();
        let max_word_len = slot_lengths.iter().copied().max().unwrap_or(1);

        let mut chars = vec![0usize; cells * max_word_len];
        for (slot, word) in slot_chars.iter().enumerate() {
            chars[slot * max_word_len..slot * max_word_len + word.len()].copy_from_slice(word);
        }

        let char_order   = TokenOrder::by_descending_word_length(&slot_lengths);
        let chars        = char_order.sort_slots(&chars, max_word_len);
        let char_lengths = char_order.sort(&slot_lengths);

        tracing::debug!(
            "Canonical batch: {} sentences × {} tokens, words up to {} chars",
            batch_size,
            max_seq_len,
            max_word_len
        );

        Ok(Self {
            batch_size,
            max_seq_len,
            max_word_len,
            lengths,
            words,
            features,
            labels,
            mask,
            doc_ids,
            positions,
            chars,
            char_lengths,
            word_order,
            char_order,
            has_gold,
        })
    }

    /// Number of real (unmasked) tokens
    pub fn token_count(&self) -> usize {
        self.lengths.iter().sum()
    }

    /// Mask of one sorted row
    pub fn mask_row(&self, row: usize) -> &[bool] {
        &self.mask[row * self.max_seq_len..(row + 1) * self.max_seq_len]
    }

    /// Rows of a sorted [N, S] array in caller order, each trimmed
    /// to its sentence length.
    pub fn restore_sequences<T: Clone>(&self, sorted: &[T]) -> Vec<Vec<T>> {
        let caller_order = self.word_order.restore_rows(sorted, self.max_seq_len);
        let caller_lens  = self.word_order.restore(&self.lengths);
        caller_lens
            .iter()
            .enumerate()
            .map(|(row, &len)| {
                let start = row * self.max_seq_len;
                caller_order[start..start + len].to_vec()
            })
            .collect()
    }
}

fn validate(sentences: &[&SentenceInstance]) -> TaggerResult<()> {
    if sentences.is_empty() {
        return Err(TaggerError::invalid_input("batch contains no sentences"));
    }
    let feature_num = sentences[0].features.first().map_or(0, Vec::len);

    for (i, s) in sentences.iter().enumerate() {
        if s.is_empty() {
            return Err(TaggerError::invalid_input(format!(
                "sentence {i} of document {} has length 0", s.doc_id
            )));
        }
        let n = s.len();
        if s.labels.len() != n || s.chars.len() != n || s.positions.len() != n || s.features.len() != n {
            return Err(TaggerError::invalid_input(format!(
                "sentence {i}: {} words but {} labels, {} char lists, {} positions, {} feature lists",
                n, s.labels.len(), s.chars.len(), s.positions.len(), s.features.len()
            )));
        }
        if let Some(bad) = s.features.iter().position(|f| f.len() != feature_num) {
            return Err(TaggerError::invalid_input(format!(
                "sentence {i}, token {bad}: {} feature channels, expected {feature_num}",
                s.features[bad].len()
            )));
        }
    }
    Ok(())
}

// ─── Tensor Batch ─────────────────────────────────────────────────────────────
/// A canonical batch moved onto a device.
/// B is the Burn Backend — generic so the same batcher works
/// for the autodiff training backend and the inference backend.
#[derive(Debug, Clone)]
pub struct TaggerBatch<B: Backend> {
    /// [N, S]
    pub words:        Tensor<B, 2, Int>,
    /// One [N, S] tensor per feature channel
    pub features:     Vec<Tensor<B, 2, Int>>,
    /// [N*S, W], rows in TokenOrder
    pub chars:        Tensor<B, 2, Int>,
    /// [N*S] gather indices restoring slot order from TokenOrder
    pub char_recover: Tensor<B, 1, Int>,
    /// [N, S]
    pub labels:       Tensor<B, 2, Int>,
    /// [N, S] true = real token
    pub mask:         Tensor<B, 2, Bool>,
}

/// Holds the target device so tensors are created on the
/// correct GPU/CPU.
#[derive(Clone, Debug)]
pub struct TaggerBatcher<B: Backend> {
    pub device: B::Device,
}

impl<B: Backend> TaggerBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }

    /// Convert a canonical batch into device tensors
    pub fn batch(&self, cb: &CanonicalBatch) -> TaggerBatch<B> {
        let shape = [cb.batch_size, cb.max_seq_len];
        let mask_ids: Vec<usize> = cb.mask.iter().map(|&m| usize::from(m)).collect();

        TaggerBatch {
            words:        int_tensor(&cb.words, shape, &self.device),
            features:     cb.features.iter().map(|f| int_tensor(f, shape, &self.device)).collect(),
            chars:        int_tensor(&cb.chars, [cb.batch_size * cb.max_seq_len, cb.max_word_len], &self.device),
            char_recover: int_tensor(cb.char_order.recover(), [cb.char_order.len()], &self.device),
            labels:       int_tensor(&cb.labels, shape, &self.device),
            mask:         int_tensor(&mask_ids, shape, &self.device).equal_elem(1),
        }
    }
}

/// Build an Int tensor from usize ids (Burn Int tensors hold i64)
pub fn int_tensor<B: Backend, const D: usize>(
    values: &[usize],
    shape:  [usize; D],
    device: &B::Device,
) -> Tensor<B, D, Int> {
    let data: Vec<i64> = values.iter().map(|&v| v as i64).collect();
    Tensor::from_data(TensorData::new(data, shape), device)
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::ElementConversion;
    use proptest::prelude::*;

    /// Sentence whose word ids are `base + t`, single-character words
    fn sentence(doc_id: usize, base: usize, len: usize) -> SentenceInstance {
        SentenceInstance {
            doc_id,
            words:     (0..len).map(|t| base + t).collect(),
            features:  (0..len).map(|t| vec![100 + t]).collect(),
            chars:     (0..len).map(|t| vec![base + t]).collect(),
            labels:    vec![1; len],
            positions: (0..len).collect(),
        }
    }

    #[test]
    fn test_three_and_five_canonicalise_to_two_by_five() {
        let a  = sentence(0, 10, 3);
        let b  = sentence(1, 20, 5);
        let cb = CanonicalBatch::build(&[&a, &b], true).unwrap();

        assert_eq!((cb.batch_size, cb.max_seq_len), (2, 5));
        assert_eq!(cb.word_order.order(), &[1, 0]);
        for k in 0..2 {
            assert_eq!(cb.word_order.recover()[cb.word_order.order()[k]], k);
        }
        // length-3 sentence sits in sorted row 1 with two padding slots
        assert_eq!(cb.mask_row(1), &[true, true, true, false, false]);
        assert_eq!(&cb.words[5..10], &[10, 11, 12, 0, 0]);
        assert_eq!(cb.features.len(), 1);
        assert_eq!(&cb.features[0][0..5], &[100, 101, 102, 103, 104]);
        assert_eq!(cb.max_word_len, 1);
    }

    #[test]
    fn test_mask_sums_equal_lengths() {
        let sents: Vec<_> = [4, 1, 7, 7, 2].iter().enumerate().map(|(i, &l)| sentence(i, 0, l)).collect();
        let refs: Vec<_>  = sents.iter().collect();
        let cb = CanonicalBatch::build(&refs, true).unwrap();

        for row in 0..cb.batch_size {
            let real = cb.mask_row(row).iter().filter(|&&m| m).count();
            assert_eq!(real, cb.lengths[row]);
        }
        // stable tie: the two length-7 sentences keep caller order
        assert_eq!(&cb.word_order.order()[..2], &[2, 3]);
    }

    #[test]
    fn test_restore_sequences_returns_caller_order() {
        let a  = sentence(0, 10, 2);
        let b  = sentence(0, 20, 4);
        let c  = sentence(1, 30, 3);
        let cb = CanonicalBatch::build(&[&a, &b, &c], true).unwrap();

        let words = cb.restore_sequences(&cb.words);
        assert_eq!(words, vec![a.words.clone(), b.words.clone(), c.words.clone()]);
        let positions = cb.restore_sequences(&cb.positions);
        assert_eq!(positions[2], vec![0, 1, 2]);
    }

    #[test]
    fn test_char_rows_recover_to_sorted_word_slots() {
        let mut a = sentence(0, 10, 2);
        a.chars = vec![vec![1, 2, 3], vec![]];
        let b = sentence(0, 20, 3);
        let cb = CanonicalBatch::build(&[&a, &b], true).unwrap();

        assert_eq!(cb.max_word_len, 3);
        // every slot has at least one (padding) character
        assert!(cb.char_lengths.iter().all(|&l| l >= 1));
        assert_eq!(cb.char_lengths[0], 3);

        let slots = cb.char_order.restore_slots(&cb.chars, cb.max_word_len);
        // sorted row 1 is sentence a: slot 3 holds "1 2 3", slot 4 the empty word
        assert_eq!(&slots[3 * 3..4 * 3], &[1, 2, 3]);
        assert_eq!(&slots[4 * 3..5 * 3], &[0, 0, 0]);
        // sorted row 0 is sentence b
        assert_eq!(&slots[0..3], &[20, 0, 0]);
    }

    #[test]
    fn test_unlabeled_batch_zeroes_labels() {
        let a  = sentence(0, 10, 3);
        let cb = CanonicalBatch::build(&[&a], false).unwrap();
        assert!(cb.labels.iter().all(|&l| l == 0));
        assert!(!cb.has_gold);
    }

    #[test]
    fn test_zero_length_sentence_is_invalid() {
        let a   = sentence(0, 10, 3);
        let b   = sentence(0, 10, 0);
        let err = CanonicalBatch::build(&[&a, &b], true).unwrap_err();
        assert!(matches!(err, TaggerError::InvalidInput(_)));
    }

    #[test]
    fn test_mixed_feature_counts_are_invalid() {
        let a     = sentence(0, 10, 3);
        let mut b = sentence(0, 10, 2);
        b.features[1] = vec![1, 2];
        assert!(matches!(
            CanonicalBatch::build(&[&a, &b], true),
            Err(TaggerError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_label_length_mismatch_is_invalid() {
        let mut a = sentence(0, 10, 3);
        a.labels.pop();
        assert!(CanonicalBatch::build(&[&a], true).is_err());
    }

    #[test]
    fn test_empty_batch_is_invalid() {
        assert!(CanonicalBatch::build(&[], true).is_err());
    }

    #[test]
    fn test_tensor_batch_shapes() {
        type B = burn::backend::NdArray;
        let a  = sentence(0, 10, 3);
        let b  = sentence(1, 20, 5);
        let cb = CanonicalBatch::build(&[&a, &b], true).unwrap();

        let batch = TaggerBatcher::<B>::new(Default::default()).batch(&cb);
        assert_eq!(batch.words.dims(), [2, 5]);
        assert_eq!(batch.chars.dims(), [10, 1]);
        assert_eq!(batch.char_recover.dims(), [10]);
        let real: i64 = batch.mask.int().sum().into_scalar().elem::<i64>();
        assert_eq!(real, 8);
    }

    proptest! {
        #[test]
        fn prop_sentence_order_round_trips(lengths in prop::collection::vec(1usize..12, 1..16)) {
            let order = SentenceOrder::by_descending_length(&lengths);
            let rows: Vec<usize> = (0..lengths.len()).collect();
            prop_assert_eq!(order.restore(&order.sort(&rows)), rows.clone());
            for k in 0..order.len() {
                prop_assert_eq!(order.recover()[order.order()[k]], k);
            }
            let sorted = order.sort(&lengths);
            prop_assert!(sorted.windows(2).all(|w| w[0] >= w[1]));

            let width = 3;
            let flat: Vec<usize> = (0..lengths.len() * width).collect();
            prop_assert_eq!(order.restore_rows(&order.sort_rows(&flat, width), width), flat);
        }

        #[test]
        fn prop_token_order_round_trips(word_lengths in prop::collection::vec(1usize..20, 1..64)) {
            let order = TokenOrder::by_descending_word_length(&word_lengths);
            for k in 0..order.len() {
                prop_assert_eq!(order.recover()[order.order()[k]], k);
            }
            let width = 2;
            let flat: Vec<u32> = (0..(word_lengths.len() * width) as u32).collect();
            prop_assert_eq!(order.restore_slots(&order.sort_slots(&flat, width), width), flat);
        }

        #[test]
        fn prop_canonical_masks_match_lengths(lengths in prop::collection::vec(1usize..9, 1..10)) {
            let sents: Vec<_> = lengths.iter().enumerate().map(|(i, &l)| sentence(i, i * 10, l)).collect();
            let refs: Vec<_>  = sents.iter().collect();
            let cb = CanonicalBatch::build(&refs, true).unwrap();

            for row in 0..cb.batch_size {
                prop_assert_eq!(cb.mask_row(row).iter().filter(|&&m| m).count(), cb.lengths[row]);
            }
            let words = cb.restore_sequences(&cb.words);
            for (restored, original) in words.iter().zip(&sents) {
                prop_assert_eq!(restored, &original.words);
            }
        }
    }
}
