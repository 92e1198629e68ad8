// ============================================================
// Layer 6 — Infrastructure Layer
// ============================================================
// Everything a trained model leaves on disk, and the scoring
// used to pick which epoch is kept:
//
//   checkpoint.rs      — Saving and loading model weights
//                        with Burn's CompactRecorder, plus
//                        TrainConfig as JSON so `decode` can
//                        rebuild the same architecture.
//
//   alphabet_store.rs  — Vocabulary persistence
//                        Guarantees `decode` maps words and
//                        labels to the ids used in training.
//
//   metrics.rs         — Evaluation and metrics logging
//                        Token accuracy, span P/R/F1 and one
//                        CSV row per epoch.
//
// Reference: Rust Book §7 (Modules)
//            Rust Book §9 (Error Handling with anyhow)
//            Burn Book §5 (Checkpointing)

/// Model checkpoint saving and loading
pub mod checkpoint;

/// Alphabet saving and loading
pub mod alphabet_store;

/// Evaluation scores and the metrics CSV logger
pub mod metrics;
