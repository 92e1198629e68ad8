// ============================================================
// Layer 5 — ML / Model Layer (Burn)
// ============================================================
// Everything that touches tensors lives here, together with
// the host-side pieces of the two-stage step they feed.
//
// What's in this layer:
//
//   memory.rs       — Document memory cache
//                     (doc_id, position) → (representation,
//                     label embedding), FIFO by generation,
//                     nearest-position reads
//
//   gate.rs         — Uncertainty estimation and merge
//                     • per-token entropy of averaged probs
//                     • threshold / top-k gate policies
//                     • draft ⊕ refined label merge
//
//   decoder.rs      — Sequence decoding over score grids
//                     • arg-max
//                     • Viterbi over CRF transitions
//                     • host CRF negative log-likelihood
//
//   crf.rs          — Trainable CRF transition module
//
//   model.rs        — Feature extractors
//                     • word representation (word, feature,
//                       char CNN/LSTM embeddings)
//                     • draft BiLSTM with MC dropout
//                     • refinement transformer encoder with
//                       memory attention
//
//   orchestrator.rs — One two-stage step:
//                     draft → uncertainty → memory write →
//                     refine → decode → merge → loss
//
//   trainer.rs      — The epoch loop, evaluation and
//                     checkpointing of the best dev score
//
//   inferencer.rs   — Dataset-wide prediction and checkpoint
//                     reloading for `decode`
//
// Reference: Burn Book §3 (Building Blocks)
//            Burn Book §5 (Training)
//            Vaswani et al. (2017) Attention Is All You Need
//            Lafferty et al. (2001) Conditional Random Fields
//            Gal & Ghahramani (2016) Dropout as a Bayesian Approximation

/// Per-document memory cache of token states
pub mod memory;

/// Entropy, gate policies and label merge
pub mod gate;

/// Arg-max and Viterbi decoding
pub mod decoder;

/// CRF transition parameters and tensor log-likelihood
pub mod crf;

/// Draft and refinement networks
pub mod model;

/// Two-stage training / inference step
pub mod orchestrator;

/// Training loop with evaluation and checkpointing
pub mod trainer;

/// Batch-wise prediction over whole datasets
pub mod inferencer;
