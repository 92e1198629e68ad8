// ============================================================
// Layer 3 — Corpus Domain Types
// ============================================================
// A Document is an ordered list of Sentences, a Sentence an
// ordered list of Tokens. Tokens still carry their surface
// strings here; integer ids are assigned later by the
// alphabets in the data layer.
//
// The JSON shape of one document (one line of a corpus file):
//
//   {"sentences":[{"tokens":[
//       {"word":"EU","features":["NNP"],"label":"B-ORG"},
//       {"word":"rejects","features":["VBZ"],"label":"O"}]}]}
//
// `label` is optional: raw (decode-only) corpora leave it out.

use serde::{Deserialize, Serialize};

/// One token of a sentence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    /// Surface form of the word
    pub word: String,

    /// Auxiliary categorical features (POS tag, chunk tag, ...).
    /// Every token of a corpus must carry the same number of them.
    #[serde(default)]
    pub features: Vec<String>,

    /// Gold label, absent for unlabeled data
    #[serde(default)]
    pub label: Option<String>,
}

impl Token {
    pub fn new(word: impl Into<String>, label: Option<&str>) -> Self {
        Self {
            word:     word.into(),
            features: Vec::new(),
            label:    label.map(str::to_string),
        }
    }

    pub fn with_features(mut self, features: &[&str]) -> Self {
        self.features = features.iter().map(|f| f.to_string()).collect();
        self
    }
}

/// An ordered sequence of tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sentence {
    pub tokens: Vec<Token>,
}

impl Sentence {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// A document: the unit the memory cache is scoped to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Assigned by the loader; unique across every split of a run
    #[serde(default)]
    pub doc_id: usize,

    pub sentences: Vec<Sentence>,
}

impl Document {
    pub fn new(doc_id: usize, sentences: Vec<Sentence>) -> Self {
        Self { doc_id, sentences }
    }

    /// Total number of tokens across all sentences
    pub fn token_count(&self) -> usize {
        self.sentences.iter().map(Sentence::len).sum()
    }

    /// True when every token carries a gold label
    pub fn is_labeled(&self) -> bool {
        self.sentences
            .iter()
            .flat_map(|s| s.tokens.iter())
            .all(|t| t.label.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialise_without_labels() {
        let json = r#"{"sentences":[{"tokens":[{"word":"Paris"},{"word":"sleeps"}]}]}"#;
        let doc: Document = serde_json::from_str(json).unwrap();
        assert_eq!(doc.token_count(), 2);
        assert!(!doc.is_labeled());
        assert!(doc.sentences[0].tokens[0].features.is_empty());
    }

    #[test]
    fn test_labeled_document() {
        let doc = Document::new(
            3,
            vec![Sentence::new(vec![
                Token::new("EU", Some("B-ORG")).with_features(&["NNP"]),
                Token::new("rejects", Some("O")).with_features(&["VBZ"]),
            ])],
        );
        assert!(doc.is_labeled());
        assert_eq!(doc.sentences[0].tokens[1].features, vec!["VBZ".to_string()]);
    }
}
