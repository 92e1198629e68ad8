// ============================================================
// Layer 4 — Alphabets (Vocabularies)
// ============================================================
// An Alphabet maps instances (words, characters, feature
// values, labels) to dense integer ids and back.
//
// Id layout:
//   0  → padding, never a real instance
//   1  → "</unk>" in word/char/feature alphabets
//   2… → instances in insertion order
//
// The label alphabet has no unknown entry, so real labels
// start at 1 and id 0 doubles as "no gold label".
//
// Alphabets grow while the training, dev and test corpora are
// scanned, then get closed; afterwards unseen instances map to
// the unknown id.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::data::preprocessor::Preprocessor;
use crate::domain::document::Document;

/// Id reserved for padding in every alphabet
pub const PAD_ID: usize = 0;

/// Instance used for out-of-vocabulary lookups
pub const UNKNOWN: &str = "</unk>";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alphabet {
    name:         String,
    instances:    Vec<String>,
    has_unknown:  bool,
    keep_growing: bool,
    #[serde(skip)]
    index:        HashMap<String, usize>,
}

impl Alphabet {
    pub fn new(name: impl Into<String>, is_label: bool) -> Self {
        let mut alphabet = Self {
            name:         name.into(),
            instances:    Vec::new(),
            has_unknown:  !is_label,
            keep_growing: true,
            index:        HashMap::new(),
        };
        if alphabet.has_unknown {
            alphabet.add(UNKNOWN);
        }
        alphabet
    }

    /// Insert an instance if the alphabet is still open
    pub fn add(&mut self, instance: &str) {
        if !self.keep_growing || self.index.contains_key(instance) {
            return;
        }
        self.instances.push(instance.to_string());
        self.index.insert(instance.to_string(), self.instances.len());
    }

    /// Id of an instance; unseen instances map to the unknown id
    /// (or to PAD_ID for the label alphabet)
    pub fn get_index(&self, instance: &str) -> usize {
        match self.index.get(instance) {
            Some(&id) => id,
            None if self.has_unknown => self.index.get(UNKNOWN).copied().unwrap_or(PAD_ID),
            None => PAD_ID,
        }
    }

    /// Instance behind an id; None for padding or out-of-range ids
    pub fn get_instance(&self, id: usize) -> Option<&str> {
        if id == PAD_ID {
            return None;
        }
        self.instances.get(id - 1).map(String::as_str)
    }

    /// Number of ids, padding included
    pub fn size(&self) -> usize {
        self.instances.len() + 1
    }

    /// All real instances in id order
    pub fn instances(&self) -> impl Iterator<Item = &str> {
        self.instances.iter().map(String::as_str)
    }

    pub fn close(&mut self) {
        self.keep_growing = false;
    }

    /// Rebuild the lookup table after deserialisation
    pub fn rebuild_index(&mut self) {
        self.index = self
            .instances
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i + 1))
            .collect();
    }
}

// ─── Tag Scheme ───────────────────────────────────────────────────────────────
/// How labels encode entity spans; decides the evaluation metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TagScheme {
    /// B-/I-/O labels
    Bio,
    /// B-/M-/E-/S-/O labels
    Bmes,
    /// Plain per-token labels (e.g. POS); token accuracy only
    NoSeg,
}

impl TagScheme {
    pub fn detect<'a>(labels: impl Iterator<Item = &'a str>) -> Self {
        let (mut has_b, mut has_s) = (false, false);
        for label in labels {
            let upper = label.to_uppercase();
            if upper.starts_with("S-") {
                has_s = true;
            } else if upper.starts_with("B-") {
                has_b = true;
            }
        }
        match (has_b, has_s) {
            (true, true)  => TagScheme::Bmes,
            (true, false) => TagScheme::Bio,
            _             => TagScheme::NoSeg,
        }
    }

    pub fn is_segmented(&self) -> bool {
        !matches!(self, TagScheme::NoSeg)
    }
}

// ─── Alphabets ────────────────────────────────────────────────────────────────
/// Every vocabulary a corpus needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alphabets {
    pub word:     Alphabet,
    pub char:     Alphabet,
    pub features: Vec<Alphabet>,
    pub label:    Alphabet,
}

impl Alphabets {
    pub fn new(feature_num: usize) -> Self {
        Self {
            word:     Alphabet::new("word", false),
            char:     Alphabet::new("character", false),
            features: (0..feature_num)
                .map(|i| Alphabet::new(format!("feature_{i}"), false))
                .collect(),
            label:    Alphabet::new("label", true),
        }
    }

    /// Number of feature channels, taken from the first token seen
    pub fn infer_feature_num(docs: &[Document]) -> usize {
        docs.iter()
            .flat_map(|d| d.sentences.iter())
            .flat_map(|s| s.tokens.iter())
            .map(|t| t.features.len())
            .next()
            .unwrap_or(0)
    }

    /// Grow every alphabet with the instances of `docs`
    pub fn extend_from(&mut self, docs: &[Document], preprocessor: &Preprocessor) {
        for token in docs.iter().flat_map(|d| d.sentences.iter()).flat_map(|s| s.tokens.iter()) {
            let word = preprocessor.normalize(&token.word);
            for c in word.chars() {
                self.char.add(c.encode_utf8(&mut [0u8; 4]));
            }
            self.word.add(&word);
            for (alphabet, value) in self.features.iter_mut().zip(&token.features) {
                alphabet.add(value);
            }
            if let Some(label) = &token.label {
                self.label.add(label);
            }
        }
    }

    pub fn close(&mut self) {
        self.word.close();
        self.char.close();
        self.label.close();
        self.features.iter_mut().for_each(Alphabet::close);
    }

    pub fn rebuild_index(&mut self) {
        self.word.rebuild_index();
        self.char.rebuild_index();
        self.label.rebuild_index();
        self.features.iter_mut().for_each(Alphabet::rebuild_index);
    }

    pub fn tag_scheme(&self) -> TagScheme {
        TagScheme::detect(self.label.instances())
    }

    /// Sizes of the feature alphabets, padding included
    pub fn feature_sizes(&self) -> Vec<usize> {
        self.features.iter().map(Alphabet::size).collect()
    }

    pub fn summary(&self) {
        tracing::info!(
            "Alphabets: {} words, {} chars, {} labels, {} feature channel(s) {:?}; scheme {:?}",
            self.word.size(),
            self.char.size(),
            self.label.size(),
            self.features.len(),
            self.feature_sizes(),
            self.tag_scheme(),
        );
    }
}
