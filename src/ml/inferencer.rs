// ============================================================
// Layer 5 — Inferencer
// ============================================================
// Runs whole datasets through the orchestrator without
// gradients, batch by batch in dataset order, and regroups the
// per-sentence predictions by document.
//
// Used twice:
//   - by the trainer for dev/test evaluation after each epoch
//   - by `decode`, which rebuilds the model from the best
//     checkpoint and starts from an empty memory cache

use anyhow::Result;
use burn::prelude::*;

use crate::application::train_use_case::TrainConfig;
use crate::data::{
    alphabet::Alphabets,
    batcher::CanonicalBatch,
    dataset::{flatten_sentences, TaggingDataset},
};
use crate::infra::checkpoint::CheckpointManager;
use crate::ml::{
    model::TaggerModel,
    orchestrator::{StepMode, TwoStageOrchestrator},
};

type InferBackend = burn::backend::Wgpu;

/// Label ids of one document, one list per (capped) sentence
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentPrediction {
    pub doc_id:    usize,
    pub sentences: Vec<Vec<usize>>,
}

impl DocumentPrediction {
    /// Labels in within-document position order
    pub fn flat_labels(&self) -> Vec<usize> {
        self.sentences.iter().flatten().copied().collect()
    }
}

/// Result of running one dataset
#[derive(Debug, Clone, Default)]
pub struct PredictionRun {
    pub documents: Vec<DocumentPrediction>,
    /// Summed loss over batches that carried gold labels
    pub loss:      f64,
    pub uncertain: usize,
    pub tokens:    usize,
}

/// Predict every document of `dataset` in order
pub fn predict_documents<B: Backend>(
    orchestrator: &mut TwoStageOrchestrator,
    model:        &TaggerModel<B>,
    dataset:      &TaggingDataset,
    batch_size:   usize,
    device:       &B::Device,
) -> Result<PredictionRun> {
    let mut run = PredictionRun::default();

    for docs in dataset.batches(batch_size) {
        let sentences = flatten_sentences(docs);
        if sentences.is_empty() {
            tracing::warn!("Skipping a batch of {} documents with no tokens", docs.len());
            run.documents.extend(docs.iter().map(|d| DocumentPrediction { doc_id: d.doc_id, sentences: Vec::new() }));
            continue;
        }

        let has_gold = docs.iter().all(|d| d.labeled);
        let batch    = CanonicalBatch::build(&sentences, has_gold)?;
        let out      = orchestrator.step(model, &batch, StepMode::Infer, device)?;

        if let Some(loss) = out.loss {
            run.loss += loss.into_scalar().elem::<f64>();
        }
        run.uncertain += out.uncertain;
        run.tokens    += out.tokens;

        // predictions come back in flattened sentence order
        let mut predictions = out.predictions.into_iter();
        for doc in docs {
            run.documents.push(DocumentPrediction {
                doc_id:    doc.doc_id,
                sentences: predictions.by_ref().take(doc.sentences.len()).collect(),
            });
        }
    }

    Ok(run)
}

pub struct Inferencer {
    model:        TaggerModel<InferBackend>,
    orchestrator: TwoStageOrchestrator,
    batch_size:   usize,
    device:       burn::backend::wgpu::WgpuDevice,
}

impl Inferencer {
    /// Rebuild the trained model from `train_config.json` and the
    /// best checkpoint.
    pub fn from_checkpoint(ckpt_manager: &CheckpointManager, alphabets: &Alphabets) -> Result<Self> {
        let device = burn::backend::wgpu::WgpuDevice::default();
        let cfg: TrainConfig = ckpt_manager.load_config()?;
        cfg.validate()?;

        let model_cfg = cfg.model_config(alphabets)?;
        let model: TaggerModel<InferBackend> = model_cfg.init(&device);
        let model = ckpt_manager.load_best(model, &device)?;
        let orchestrator = TwoStageOrchestrator::new(cfg.orchestrator_options()?, &model_cfg)?;

        tracing::info!(
            "Model loaded: {} labels, decoder {:?}, {} MC sample(s), memory {}",
            model_cfg.num_labels,
            cfg.decoder_kind(),
            cfg.nsamples,
            cfg.max_read_memory
        );
        Ok(Self { model, orchestrator, batch_size: cfg.batch_size, device })
    }

    pub fn predict(&mut self, dataset: &TaggingDataset) -> Result<PredictionRun> {
        predict_documents(&mut self.orchestrator, &self.model, dataset, self.batch_size, &self.device)
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{chunker::SentenceChunker, preprocessor::Preprocessor};
    use crate::domain::document::{Document, Sentence, Token};
    use crate::ml::{decoder::DecoderKind, gate::GatePolicy, model::{CharEncoderKind, TaggerModelConfig}, orchestrator::OrchestratorOptions};

    type B = burn::backend::NdArray;

    fn docs() -> Vec<Document> {
        let sent = |words: &[&str]| Sentence::new(words.iter().map(|w| Token::new(*w, Some("O"))).collect());
        vec![
            Document::new(0, vec![sent(&["a", "b", "c"]), sent(&["d"])]),
            Document::new(1, vec![sent(&["e", "f"])]),
            Document::new(2, vec![sent(&["g", "h", "i", "j"]), sent(&["k", "l"])]),
        ]
    }

    #[test]
    fn test_predictions_regroup_by_document() {
        let docs = docs();
        let mut alphabets = Alphabets::new(0);
        alphabets.extend_from(&docs, &Preprocessor::default());
        alphabets.close();
        let dataset = TaggingDataset::from_documents(&docs, &alphabets, &Preprocessor::default(), &SentenceChunker::new(3)).unwrap();

        let model_cfg = TaggerModelConfig::new(alphabets.word.size(), alphabets.char.size(), vec![], alphabets.label.size(), CharEncoderKind::None)
            .with_word_emb_dim(4)
            .with_lstm_hidden(4)
            .with_label_emb_dim(2)
            .with_d_model(4)
            .with_num_heads(1)
            .with_num_layers(1)
            .with_d_ff(8)
            .with_max_sentence_length(3)
            .with_max_read_memory(2);
        let device = Default::default();
        let model  = model_cfg.init::<B>(&device);
        let mut orchestrator = TwoStageOrchestrator::new(
            OrchestratorOptions {
                gate:               GatePolicy::Threshold(0.5),
                decoder:            DecoderKind::ArgMax,
                nsamples:           1,
                max_read_memory:    2,
                average_batch_loss: false,
                seed:               1,
            },
            &model_cfg,
        ).unwrap();

        let run = predict_documents(&mut orchestrator, &model, &dataset, 2, &device).unwrap();

        assert_eq!(run.documents.iter().map(|d| d.doc_id).collect::<Vec<_>>(), vec![0, 1, 2]);
        // document 2 has its 4-token sentence split by the cap of 3
        let shapes: Vec<Vec<usize>> = run.documents
            .iter()
            .map(|d| d.sentences.iter().map(Vec::len).collect())
            .collect();
        assert_eq!(shapes, vec![vec![3, 1], vec![2], vec![3, 1, 2]]);
        assert_eq!(run.documents[2].flat_labels().len(), 6);
        assert_eq!(run.tokens, 12);
        assert!(run.loss.is_finite());
        assert_eq!(orchestrator.steps(), 2);
    }
}
