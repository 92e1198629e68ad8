// ============================================================
// Layer 4 — Corpus Loader
// ============================================================
// Loads a JSON Lines corpus: one document per non-blank line.
//
//   {"sentences":[{"tokens":[{"word":"EU","label":"B-ORG"}, ...]}]}
//   {"sentences":[ ... ]}
//
// Documents are numbered consecutively starting from the id
// the caller passes in, so train, dev, test and raw corpora
// loaded one after the other never share a doc_id (the memory
// cache is keyed by it).
//
// Every document line is kept as written, including documents
// and sentences without tokens, so a decoded corpus has one
// output line per input line. Empty sentences disappear later,
// in the chunker, and never reach a batch.
//
// Reference: serde_json documentation
//            Rust Book §9 (Error Handling)

use anyhow::{Context, Result};
use std::{fs, path::Path};

use crate::domain::document::Document;
use crate::domain::traits::CorpusSource;

/// Loads documents from a .jsonl file.
/// Implements the CorpusSource trait from Layer 3.
pub struct JsonlCorpusLoader {
    /// Path to the corpus file
    path: String,
}

impl JsonlCorpusLoader {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl CorpusSource for JsonlCorpusLoader {
    fn load_all(&self, first_doc_id: usize) -> Result<Vec<Document>> {
        let text = fs::read_to_string(Path::new(&self.path))
            .with_context(|| format!("Cannot read corpus '{}'", self.path))?;
        let docs = parse_documents(&text, first_doc_id)
            .with_context(|| format!("Malformed corpus '{}'", self.path))?;

        tracing::info!(
            "Loaded {} documents ({} tokens) from '{}'",
            docs.len(),
            docs.iter().map(Document::token_count).sum::<usize>(),
            self.path
        );
        Ok(docs)
    }
}

/// Parse JSON Lines text into documents with consecutive ids.
/// Blank lines are ignored; every other line is one document.
pub fn parse_documents(text: &str, first_doc_id: usize) -> Result<Vec<Document>> {
    let mut docs = Vec::new();

    for (line_no, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut doc: Document = serde_json::from_str(line)
            .with_context(|| format!("line {}: not a document", line_no + 1))?;

        if doc.token_count() == 0 {
            tracing::warn!("line {}: document has no tokens", line_no + 1);
        }

        doc.doc_id = first_doc_id + docs.len();
        docs.push(doc);
    }

    Ok(docs)
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CORPUS: &str = r#"
{"sentences":[{"tokens":[{"word":"EU","label":"B-ORG"},{"word":"rejects","label":"O"}]}]}

{"sentences":[{"tokens":[]}]}
{"sentences":[{"tokens":[{"word":"Peter","label":"B-PER"}]},{"tokens":[{"word":"Blackburn","label":"I-PER"}]}]}
"#;

    #[test]
    fn test_ids_are_consecutive_from_offset() {
        let docs = parse_documents(CORPUS, 10).unwrap();
        assert_eq!(docs.len(), 3);
        assert_eq!(docs.iter().map(|d| d.doc_id).collect::<Vec<_>>(), vec![10, 11, 12]);
        assert_eq!(docs[2].sentences.len(), 2);
    }

    #[test]
    fn test_token_less_documents_are_kept_in_place() {
        let text = concat!(
            r#"{"sentences":[{"tokens":[{"word":"a"}]},{"tokens":[]}]}"#, "\n",
            r#"{"sentences":[]}"#, "\n",
            r#"{"sentences":[{"tokens":[{"word":"b"}]}]}"#,
        );
        let docs = parse_documents(text, 0).unwrap();
        assert_eq!(docs.len(), 3);
        assert_eq!(docs[0].sentences.len(), 2);
        assert!(docs[1].sentences.is_empty());
        assert_eq!(docs[2].sentences[0].tokens[0].word, "b");
    }

    #[test]
    fn test_malformed_line_is_an_error() {
        let err = parse_documents("{\"sentences\": 3}", 0).unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CORPUS.as_bytes()).unwrap();

        let loader = JsonlCorpusLoader::new(file.path().to_string_lossy());
        let docs   = loader.load_all(0).unwrap();
        assert_eq!(docs.len(), 3);
    }

    #[test]
    fn test_missing_file_reports_path() {
        let loader = JsonlCorpusLoader::new("/definitely/not/here.jsonl");
        let err    = loader.load_all(0).unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.jsonl"));
    }
}
