// ============================================================
// Layer 4 — Data Pipeline
// ============================================================
// This layer takes corpus files all the way to the padded,
// length-sorted batches the orchestrator consumes.
//
// The pipeline flows in this order:
//
//   .jsonl corpus
//       │
//       ▼
//   JsonlCorpusLoader → one Document per line, consecutive ids
//       │
//       ▼
//   Preprocessor      → digit normalisation of words
//       │
//       ▼
//   Alphabets         → word / char / feature / label ids
//       │
//       ▼
//   SentenceChunker   → caps sentence length, keeps positions
//       │
//       ▼
//   TaggingDataset    → documents in id form, shuffled per epoch
//       │
//       ▼
//   CanonicalBatch    → sorted, padded host batch + recover order
//       │
//       ▼
//   TaggerBatcher     → tensors on the device
//
// Each module is responsible for exactly one step.
//
// Reference: Burn Book §4 (Datasets and Batchers)
//            Rust Book §13 (Iterators and Closures)

/// Vocabularies and tag scheme detection
pub mod alphabet;

/// Loads JSON Lines corpora
pub mod loader;

/// Word normalisation
pub mod preprocessor;

/// Splits overlong sentences
pub mod chunker;

/// Documents and sentences in id form
pub mod dataset;

/// Length sorting, padding and tensor conversion
pub mod batcher;
