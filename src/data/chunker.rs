// ============================================================
// Layer 4 — Sentence Chunker
// ============================================================
// Enforces the sentence-length cap before batching.
//
// Sentences longer than `max_len` tokens are split into
// consecutive, non-overlapping pieces. Nothing is dropped and
// nothing is duplicated, so every token keeps exactly one
// within-document position (and therefore one memory key).
//
// Example with max_len=4:
//   Sentence: "A B C D E F G H I J"
//   Piece 1:  "A B C D"      (positions 0-3)
//   Piece 2:  "E F G H"      (positions 4-7)
//   Piece 3:  "I J"          (positions 8-9)
//
// Reference: Rust Book §8 (Slices)

use std::ops::Range;

use crate::domain::document::{Document, Sentence};

pub struct SentenceChunker {
    /// Maximum number of tokens per sentence piece
    max_len: usize,
}

impl SentenceChunker {
    /// Create a new SentenceChunker.
    ///
    /// # Panics
    /// Panics if max_len is 0, because no piece could hold a token
    pub fn new(max_len: usize) -> Self {
        assert!(max_len > 0, "max_len must be greater than 0");
        Self { max_len }
    }

    /// Token ranges of the pieces a sentence of `len` tokens is cut into
    pub fn ranges(&self, len: usize) -> Vec<Range<usize>> {
        (0..len)
            .step_by(self.max_len)
            .map(|start| start..(start + self.max_len).min(len))
            .collect()
    }

    /// Split one sentence into capped pieces.
    /// Empty sentences produce no pieces.
    pub fn split(&self, sentence: &Sentence) -> Vec<Sentence> {
        self.ranges(sentence.len())
            .into_iter()
            .map(|r| Sentence::new(sentence.tokens[r].to_vec()))
            .collect()
    }

    /// Apply the cap to every sentence of a document
    pub fn apply(&self, doc: &Document) -> Document {
        let mut sentences = Vec::with_capacity(doc.sentences.len());
        for sentence in &doc.sentences {
            if sentence.len() > self.max_len {
                tracing::warn!(
                    "Document {}: splitting a {}-token sentence (cap {})",
                    doc.doc_id,
                    sentence.len(),
                    self.max_len
                );
            }
            sentences.extend(self.split(sentence));
        }
        Document::new(doc.doc_id, sentences)
    }

    /// Returns how many pieces a sentence of `len` tokens produces
    pub fn num_chunks(&self, len: usize) -> usize {
        (len + self.max_len - 1) / self.max_len
    }
}
