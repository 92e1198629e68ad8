// ============================================================
// Layer 2 — DecodeUseCase
// ============================================================
// Tags a raw corpus with a trained model:
//
//   Step 1: Reload config, alphabets and best checkpoint
//   Step 2: Load the raw corpus and convert it to ids
//   Step 3: Run inference with a fresh memory cache
//   Step 4: Write one JSON line per document with its labels
//   Step 5: Score the run when the corpus carries gold labels
//
// Predictions come back per capped sentence; they are laid
// over the original tokens in order, so sentences split by the
// length cap are stitched back together.

use anyhow::{Context, Result};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use crate::application::train_use_case::TrainConfig;
use crate::data::{
    alphabet::{Alphabet, Alphabets},
    dataset::TaggingDataset,
    loader::JsonlCorpusLoader,
};
use crate::domain::{
    document::Document,
    error::{TaggerError, TaggerResult},
    traits::CorpusSource,
};
use crate::infra::{
    alphabet_store::AlphabetStore,
    checkpoint::CheckpointManager,
    metrics::Evaluation,
};
use crate::ml::{
    inferencer::{Inferencer, PredictionRun},
    trainer::{label_name, score_predictions},
};

const RESULTS_FILE: &str = "results.jsonl";

/// What one decode run produced
#[derive(Debug)]
pub struct DecodeSummary {
    pub documents:   usize,
    pub tokens:      usize,
    pub uncertain:   usize,
    pub output_path: PathBuf,
    /// Present when every input document was labeled
    pub evaluation:  Option<Evaluation>,
}

pub struct DecodeUseCase {
    model_dir:  String,
    config:     TrainConfig,
    alphabets:  Alphabets,
    inferencer: Inferencer,
}

impl DecodeUseCase {
    pub fn new(model_dir: String) -> Result<Self> {
        let ckpt       = CheckpointManager::new(&model_dir)?;
        let config     = ckpt.load_config()?;
        let alphabets  = AlphabetStore::new(&model_dir).load()?;
        let inferencer = Inferencer::from_checkpoint(&ckpt, &alphabets)?;
        Ok(Self { model_dir, config, alphabets, inferencer })
    }

    /// Tag `raw_path`; results go to `output` or `<model_dir>/results.jsonl`
    pub fn decode(&mut self, raw_path: &str, output: Option<String>) -> Result<DecodeSummary> {
        // ── Step 2: Raw corpus → ids ──────────────────────────────────────────
        let docs    = JsonlCorpusLoader::new(raw_path).load_all(0)?;
        let dataset = TaggingDataset::from_documents(
            &docs,
            &self.alphabets,
            &self.config.preprocessor(),
            &self.config.chunker(),
        )?;

        // ── Step 3: Inference ─────────────────────────────────────────────────
        let run = self.inferencer.predict(&dataset)?;

        // ── Step 4: Write labeled documents ───────────────────────────────────
        let tagged      = annotate(&docs, &run, &self.alphabets.label)?;
        let output_path = output
            .map(PathBuf::from)
            .unwrap_or_else(|| Path::new(&self.model_dir).join(RESULTS_FILE));
        write_results(&output_path, &tagged)?;
        tracing::info!("Wrote {} tagged documents to '{}'", tagged.len(), output_path.display());

        // ── Step 5: Score against gold labels if there are any ────────────────
        let evaluation = (!docs.is_empty() && docs.iter().all(Document::is_labeled))
            .then(|| score_predictions(&dataset, &run, &self.alphabets));
        if let Some(e) = &evaluation {
            tracing::info!(
                "Decode: acc={:.4} p={:.4} r={:.4} f1={:.4}",
                e.accuracy(), e.precision(), e.recall(), e.f1()
            );
        }

        Ok(DecodeSummary {
            documents: docs.len(),
            tokens:    run.tokens,
            uncertain: run.uncertain,
            output_path,
            evaluation,
        })
    }
}

/// Copy `docs`, replacing every token label with the predicted one
pub fn annotate(docs: &[Document], run: &PredictionRun, labels: &Alphabet) -> TaggerResult<Vec<Document>> {
    if docs.len() != run.documents.len() {
        return Err(TaggerError::invalid_input(format!(
            "{} documents but {} predictions", docs.len(), run.documents.len()
        )));
    }

    docs.iter()
        .zip(&run.documents)
        .map(|(doc, pred)| {
            let flat = pred.flat_labels();
            if flat.len() != doc.token_count() {
                return Err(TaggerError::invalid_input(format!(
                    "document {} has {} tokens but {} predicted labels",
                    doc.doc_id, doc.token_count(), flat.len()
                )));
            }

            let mut tagged = doc.clone();
            let tokens = tagged.sentences.iter_mut().flat_map(|s| s.tokens.iter_mut());
            for (token, id) in tokens.zip(flat) {
                token.label = Some(label_name(labels, id).to_string());
            }
            Ok(tagged)
        })
        .collect()
}

/// One JSON document per line
pub fn write_results(path: &Path, docs: &[Document]) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Cannot create results file '{}'", path.display()))?;
    let mut out = BufWriter::new(file);
    for doc in docs {
        serde_json::to_writer(&mut out, doc)?;
        writeln!(out)?;
    }
    out.flush()
        .with_context(|| format!("Cannot write results file '{}'", path.display()))
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{loader::parse_documents, preprocessor::Preprocessor};
    use crate::domain::document::{Sentence, Token};
    use crate::ml::inferencer::DocumentPrediction;

    fn label_alphabet() -> Alphabet {
        let mut alphabets = Alphabets::new(0);
        let docs = vec![Document::new(0, vec![Sentence::new(vec![
            Token::new("a", Some("O")),
            Token::new("b", Some("B-PER")),
        ])])];
        alphabets.extend_from(&docs, &Preprocessor::default());
        alphabets.close();
        alphabets.label
    }

    #[test]
    fn test_annotate_stitches_split_sentences() {
        let labels = label_alphabet();
        let (o, per) = (labels.get_index("O"), labels.get_index("B-PER"));

        // one original sentence of 4 tokens, predicted as two capped chunks
        let doc = Document::new(7, vec![Sentence::new(
            ["w", "x", "y", "z"].iter().map(|w| Token::new(*w, None)).collect(),
        )]);
        let run = PredictionRun {
            documents: vec![DocumentPrediction { doc_id: 7, sentences: vec![vec![per, o, o], vec![0]] }],
            ..PredictionRun::default()
        };

        let tagged = annotate(&[doc], &run, &labels).unwrap();
        let out: Vec<_> = tagged[0].sentences[0].tokens.iter().map(|t| t.label.clone().unwrap()).collect();
        assert_eq!(out, vec!["B-PER", "O", "O", "O"]);
        assert_eq!(tagged[0].sentences.len(), 1);
    }

    #[test]
    fn test_annotate_rejects_length_mismatch() {
        let labels = label_alphabet();
        let doc = Document::new(0, vec![Sentence::new(vec![Token::new("w", None), Token::new("x", None)])]);
        let run = PredictionRun {
            documents: vec![DocumentPrediction { doc_id: 0, sentences: vec![vec![1]] }],
            ..PredictionRun::default()
        };
        assert!(matches!(annotate(&[doc], &run, &labels), Err(TaggerError::InvalidInput(_))));
    }

    #[test]
    fn test_token_less_documents_keep_their_output_line() {
        let labels = label_alphabet();
        let docs = vec![
            Document::new(0, vec![]),
            Document::new(1, vec![Sentence::new(vec![]), Sentence::new(vec![Token::new("w", None)])]),
        ];
        let run = PredictionRun {
            documents: vec![
                DocumentPrediction { doc_id: 0, sentences: vec![] },
                DocumentPrediction { doc_id: 1, sentences: vec![vec![labels.get_index("O")]] },
            ],
            ..PredictionRun::default()
        };

        let tagged = annotate(&docs, &run, &labels).unwrap();
        assert_eq!(tagged.len(), 2);
        assert!(tagged[0].sentences.is_empty());
        assert_eq!(tagged[1].sentences.len(), 2);
        assert_eq!(tagged[1].sentences[1].tokens[0].label.as_deref(), Some("O"));
    }

    #[test]
    fn test_results_are_readable_as_a_corpus() {
        let dir  = tempfile::tempdir().unwrap();
        let path = dir.path().join(RESULTS_FILE);
        let docs = vec![
            Document::new(0, vec![Sentence::new(vec![Token::new("Oslo", Some("S-LOC"))])]),
            Document::new(1, vec![Sentence::new(vec![Token::new("is", Some("O"))])]),
        ];
        write_results(&path, &docs).unwrap();

        let back = parse_documents(&std::fs::read_to_string(&path).unwrap(), 0).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].sentences[0].tokens[0].label.as_deref(), Some("S-LOC"));
    }
}
