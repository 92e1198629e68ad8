// ============================================================
// Layer 4 — Tagging Dataset
// ============================================================
// Integer-id view of a corpus, ready for batching.
//
// Every token becomes a word id, one id per feature channel,
// a list of character ids, a label id (0 when unlabeled) and
// a position that is unique inside its document. Positions
// run across sentence boundaries:
//
//   doc 4:  [EU rejects German call] [Peter Blackburn]
//   pos:     0  1       2      3      4     5
//
// A training batch is a run of whole documents; their
// sentences are flattened into one list before canonicalising.

use rand::{seq::SliceRandom, Rng};

use crate::data::{
    alphabet::{Alphabets, PAD_ID},
    chunker::SentenceChunker,
    preprocessor::Preprocessor,
};
use crate::domain::{
    document::Document,
    error::{TaggerError, TaggerResult},
};

/// One sentence in id form.
#[derive(Debug, Clone, PartialEq)]
pub struct SentenceInstance {
    pub doc_id:    usize,
    pub words:     Vec<usize>,
    /// Per token, one id per feature channel
    pub features:  Vec<Vec<usize>>,
    /// Per token, the ids of its characters
    pub chars:     Vec<Vec<usize>>,
    /// Per token, gold label id (PAD_ID when unlabeled)
    pub labels:    Vec<usize>,
    /// Per token, position within the parent document
    pub positions: Vec<usize>,
}

impl SentenceInstance {
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

/// One document in id form.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentInstance {
    pub doc_id:    usize,
    pub sentences: Vec<SentenceInstance>,
    pub labeled:   bool,
}

/// An ordered collection of documents in id form.
pub struct TaggingDataset {
    docs: Vec<DocumentInstance>,
}

impl TaggingDataset {
    /// Convert documents to ids, applying normalisation and the
    /// sentence-length cap.
    ///
    /// # Errors
    /// `InvalidInput` when a token does not carry exactly one
    /// value per feature channel of `alphabets`.
    pub fn from_documents(
        docs:         &[Document],
        alphabets:    &Alphabets,
        preprocessor: &Preprocessor,
        chunker:      &SentenceChunker,
    ) -> TaggerResult<Self> {
        let docs = docs
            .iter()
            .map(|d| to_instance(&chunker.apply(d), alphabets, preprocessor))
            .collect::<TaggerResult<_>>()?;
        Ok(Self { docs })
    }

    pub fn len(&self) -> usize { self.docs.len() }

    pub fn documents(&self) -> &[DocumentInstance] { &self.docs }

    pub fn shuffle<R: Rng>(&mut self, rng: &mut R) {
        self.docs.shuffle(rng);
    }

    /// Consecutive runs of `batch_size` documents
    pub fn batches(&self, batch_size: usize) -> impl Iterator<Item = &[DocumentInstance]> {
        self.docs.chunks(batch_size.max(1))
    }
}

/// Flatten a run of documents into the sentence list of one batch
pub fn flatten_sentences(docs: &[DocumentInstance]) -> Vec<&SentenceInstance> {
    docs.iter().flat_map(|d| d.sentences.iter()).collect()
}

fn to_instance(doc: &Document, alphabets: &Alphabets, preprocessor: &Preprocessor) -> TaggerResult<DocumentInstance> {
    let mut position  = 0usize;
    let mut sentences = Vec::with_capacity(doc.sentences.len());

    for sentence in &doc.sentences {
        let mut inst = SentenceInstance {
            doc_id:    doc.doc_id,
            words:     Vec::with_capacity(sentence.len()),
            features:  Vec::with_capacity(sentence.len()),
            chars:     Vec::with_capacity(sentence.len()),
            labels:    Vec::with_capacity(sentence.len()),
            positions: Vec::with_capacity(sentence.len()),
        };

        for token in &sentence.tokens {
            if token.features.len() != alphabets.features.len() {
                return Err(TaggerError::invalid_input(format!(
                    "document {}, token {} ('{}') has {} feature(s), expected {}",
                    doc.doc_id,
                    position,
                    token.word,
                    token.features.len(),
                    alphabets.features.len()
                )));
            }

            let word = preprocessor.normalize(&token.word);
            inst.words.push(alphabets.word.get_index(&word));
            inst.chars.push(
                word.chars()
                    .map(|c| alphabets.char.get_index(c.encode_utf8(&mut [0u8; 4])))
                    .collect(),
            );
            inst.features.push(
                alphabets.features
                    .iter()
                    .zip(&token.features)
                    .map(|(a, v)| a.get_index(v))
                    .collect(),
            );
            inst.labels.push(
                token.label
                    .as_deref()
                    .map_or(PAD_ID, |l| alphabets.label.get_index(l)),
            );
            inst.positions.push(position);
            position += 1;
        }

        sentences.push(inst);
    }

    Ok(DocumentInstance {
        doc_id: doc.doc_id,
        sentences,
        labeled: doc.is_labeled(),
    })
}
