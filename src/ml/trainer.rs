// ============================================================
// Layer 5 — Training Loop
// ============================================================
// Epoch loop over whole documents with Adam, one shared
// orchestrator (and therefore one memory cache) for training
// and evaluation.
//
// Per epoch:
//   - shuffle documents with the seeded RNG
//   - batches of `batch_size` documents → orchestrator step
//     → loss.backward() → Adam update (weight decay + clipping)
//   - divergence check every 500 documents and at epoch end
//   - model.valid() → dev/test evaluation on the inner backend
//   - best dev score → checkpoint; one row in metrics.csv
//
// Backend notes:
//   - training runs on Autodiff<Wgpu> for gradients
//   - model.valid() returns the model on the inner backend,
//     where Dropout modules are no-ops
//   - both backends share one Device type, so evaluation
//     reuses the training device
//
// Reference: Burn Book §5, Kingma & Ba (2015) Adam

use anyhow::Result;
use std::time::Instant;
use burn::{
    grad_clipping::GradientClippingConfig,
    module::AutodiffModule,
    optim::{decay::WeightDecayConfig, AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use rand::{rngs::StdRng, SeedableRng};

use crate::application::train_use_case::TrainConfig;
use crate::data::{
    alphabet::{Alphabet, Alphabets},
    batcher::CanonicalBatch,
    dataset::{flatten_sentences, TaggingDataset},
};
use crate::domain::error::{TaggerError, TaggerResult};
use crate::infra::{
    checkpoint::{BestCheckpoint, CheckpointManager},
    metrics::{EpochMetrics, Evaluation, MetricsLogger},
};
use crate::ml::{
    inferencer::{predict_documents, PredictionRun},
    model::{TaggerModel, TaggerModelConfig},
    orchestrator::{StepMode, TwoStageOrchestrator},
};

type MyBackend = burn::backend::Autodiff<burn::backend::Wgpu>;

/// Documents between two divergence checks
const DIVERGENCE_WINDOW: usize = 500;

/// Loss above which training is considered diverged
const DIVERGENCE_LIMIT: f64 = 1e8;

/// Corpora of one training run, already in id form
pub struct TrainingSplits {
    pub train: TaggingDataset,
    pub dev:   Option<TaggingDataset>,
    pub test:  Option<TaggingDataset>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    pub epochs: usize,
    pub best:   Option<BestCheckpoint>,
}

/// Fail on a non-finite or exploding accumulated loss
pub fn check_divergence(loss: f64, context: &str) -> TaggerResult<()> {
    if !loss.is_finite() || loss > DIVERGENCE_LIMIT {
        return Err(TaggerError::divergence(format!(
            "loss {loss:e} at {context} (limit {DIVERGENCE_LIMIT:e})"
        )));
    }
    Ok(())
}

/// Label string of an id; padding reads as "O"
pub fn label_name(alphabet: &Alphabet, id: usize) -> &str {
    alphabet.get_instance(id).unwrap_or("O")
}

/// Score the merged predictions of a labeled dataset
pub fn evaluate<B: Backend>(
    orchestrator: &mut TwoStageOrchestrator,
    model:        &TaggerModel<B>,
    dataset:      &TaggingDataset,
    alphabets:    &Alphabets,
    batch_size:   usize,
    device:       &B::Device,
) -> Result<Evaluation> {
    let run = predict_documents(orchestrator, model, dataset, batch_size, device)?;
    Ok(score_predictions(dataset, &run, alphabets))
}

/// Compare a prediction run with the gold labels of its dataset
pub fn score_predictions(dataset: &TaggingDataset, run: &PredictionRun, alphabets: &Alphabets) -> Evaluation {
    let scheme = alphabets.tag_scheme();
    let mut eval = Evaluation::default();

    for (doc, pred) in dataset.documents().iter().zip(&run.documents) {
        for (sentence, labels) in doc.sentences.iter().zip(&pred.sentences) {
            let gold: Vec<&str> = sentence.labels.iter().map(|&id| label_name(&alphabets.label, id)).collect();
            let pred: Vec<&str> = labels.iter().map(|&id| label_name(&alphabets.label, id)).collect();
            eval.add_sentence(&gold, &pred, scheme);
        }
    }
    eval
}

pub fn run_training(
    cfg:          &TrainConfig,
    model_cfg:    &TaggerModelConfig,
    splits:       TrainingSplits,
    alphabets:    &Alphabets,
    ckpt_manager: &CheckpointManager,
    metrics:      &MetricsLogger,
) -> Result<TrainingSummary> {
    let device = burn::backend::wgpu::WgpuDevice::default();
    tracing::info!("Using WGPU device: {:?}", device);
    train_loop::<MyBackend>(cfg, model_cfg, splits, alphabets, ckpt_manager, metrics, device)
}

pub fn train_loop<B: AutodiffBackend>(
    cfg:          &TrainConfig,
    model_cfg:    &TaggerModelConfig,
    mut splits:   TrainingSplits,
    alphabets:    &Alphabets,
    ckpt_manager: &CheckpointManager,
    metrics:      &MetricsLogger,
    device:       B::Device,
) -> Result<TrainingSummary> {
    B::seed(cfg.seed);

    // ── Build model and orchestrator ──────────────────────────────────────────
    let mut model: TaggerModel<B> = model_cfg.init(&device);
    let mut orchestrator = TwoStageOrchestrator::new(cfg.orchestrator_options()?, model_cfg)?;
    tracing::info!(
        "Model ready: word rep {}, BiLSTM {}, {} encoder layer(s), d_model={}, {} labels",
        model_cfg.word_rep_dim(),
        model_cfg.lstm_hidden,
        model_cfg.num_layers,
        model_cfg.d_model,
        model_cfg.num_labels
    );

    // ── Adam optimiser ────────────────────────────────────────────────────────
    // m = β1*m + (1-β1)*g        (mean)
    // v = β2*v + (1-β2)*g²       (variance)
    // θ = θ - lr * m / (√v + ε)  (update)
    let optim_cfg = AdamConfig::new()
        .with_epsilon(1e-8)
        .with_weight_decay((cfg.l2 > 0.0).then(|| WeightDecayConfig::new(cfg.l2 as f32)))
        .with_grad_clipping(cfg.clip_grad.map(GradientClippingConfig::Norm));
    let mut optim = optim_cfg.init();

    let mut rng  = StdRng::seed_from_u64(cfg.seed);
    let scheme   = alphabets.tag_scheme();
    let mut best: Option<BestCheckpoint> = None;

    // ── Epoch loop ────────────────────────────────────────────────────────────
    for epoch in 1..=cfg.epochs {
        let started = Instant::now();
        let lr = cfg.lr / (1.0 + cfg.lr_decay * (epoch - 1) as f64);
        splits.train.shuffle(&mut rng);

        // ── Training phase ────────────────────────────────────────────────────
        let mut epoch_loss  = 0.0f64;
        let mut window_loss = 0.0f64;
        let mut window_docs = 0usize;
        let mut seen_docs   = 0usize;
        let mut uncertain   = 0usize;
        let mut tokens      = 0usize;

        for docs in splits.train.batches(cfg.batch_size) {
            seen_docs += docs.len();
            let sentences = flatten_sentences(docs);
            if sentences.is_empty() {
                tracing::warn!("Skipping a batch of {} documents with no tokens", docs.len());
                continue;
            }

            let has_gold = docs.iter().all(|d| d.labeled);
            let batch    = CanonicalBatch::build(&sentences, has_gold)?;
            let out      = orchestrator.step(&model, &batch, StepMode::Train, &device)?;
            uncertain += out.uncertain;
            tokens    += out.tokens;

            let Some(loss) = out.loss else {
                tracing::warn!("Batch ending at document {} has unlabeled documents; no update", seen_docs);
                continue;
            };

            let loss_val: f64 = loss.clone().into_scalar().elem::<f64>();
            epoch_loss  += loss_val;
            window_loss += loss_val;
            window_docs += docs.len();

            if window_docs >= DIVERGENCE_WINDOW {
                check_divergence(window_loss, &format!("epoch {epoch}, document {seen_docs}"))?;
                tracing::info!(
                    "Epoch {} | {} documents | window loss={:.4}",
                    epoch, seen_docs, window_loss
                );
                window_loss = 0.0;
                window_docs = 0;
            }

            // Backward pass + Adam update
            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optim.step(lr, model, grads);
        }
        check_divergence(epoch_loss, &format!("end of epoch {epoch}"))?;

        // ── Evaluation phase ──────────────────────────────────────────────────
        // model.valid() → TaggerModel<B::InnerBackend>, dropout disabled
        let model_valid = model.valid();

        let dev = match &splits.dev {
            Some(ds) => Some(evaluate(&mut orchestrator, &model_valid, ds, alphabets, cfg.batch_size, &device)?),
            None     => None,
        };
        let test = match &splits.test {
            Some(ds) => Some(evaluate(&mut orchestrator, &model_valid, ds, alphabets, cfg.batch_size, &device)?),
            None     => None,
        };

        let dev_score     = dev.as_ref().map_or(f64::NAN, |e| e.score(scheme));
        let test_score    = test.as_ref().map_or(f64::NAN, |e| e.score(scheme));
        let refined_ratio = if tokens > 0 { uncertain as f64 / tokens as f64 } else { 0.0 };

        println!(
            "Epoch {:>3}/{} | lr={:.5} | loss={:.4} | dev={:.4} | test={:.4} | refined={:.1}% | {:.1}s",
            epoch, cfg.epochs, lr, epoch_loss, dev_score, test_score,
            refined_ratio * 100.0, started.elapsed().as_secs_f64(),
        );
        if let Some(e) = &dev {
            tracing::info!(
                "Dev: acc={:.4} p={:.4} r={:.4} f1={:.4}",
                e.accuracy(), e.precision(), e.recall(), e.f1()
            );
        }

        let row = EpochMetrics::new(epoch, epoch_loss, dev_score, test_score, refined_ratio);
        metrics.log(&row)?;

        // Without a dev split the latest epoch is kept
        let improved = match (&dev, best) {
            (None, _)          => true,
            (Some(_), None)    => true,
            (Some(_), Some(b)) => row.is_improvement(b.dev_score),
        };
        if improved {
            let checkpoint = BestCheckpoint { epoch, dev_score };
            ckpt_manager.save_best(&model, checkpoint)?;
            tracing::info!("Checkpoint saved for epoch {} (dev {:.4})", epoch, dev_score);
            best = Some(checkpoint);
        }
    }

    tracing::info!(
        "Training complete! Memory cache holds {} entries over {} documents",
        orchestrator.memory().len(),
        orchestrator.memory().doc_count()
    );
    Ok(TrainingSummary { epochs: cfg.epochs, best })
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{chunker::SentenceChunker, preprocessor::Preprocessor};
    use crate::domain::document::{Document, Sentence, Token};

    type TestBackend = burn::backend::Autodiff<burn::backend::NdArray>;

    #[test]
    fn test_divergence_limits() {
        assert!(check_divergence(10.0, "x").is_ok());
        assert!(matches!(check_divergence(2e8, "x"), Err(TaggerError::NumericDivergence(_))));
        assert!(check_divergence(f64::NAN, "x").is_err());
        assert!(check_divergence(f64::INFINITY, "x").is_err());
    }

    fn corpus(first_id: usize) -> Vec<Document> {
        let tok = |w: &str, l: &str| Token::new(w, Some(l));
        (0..4)
            .map(|i| Document::new(first_id + i, vec![
                Sentence::new(vec![tok("Anna", "B-PER"), tok("lives", "O"), tok("in", "O"), tok("Rome", "B-LOC")]),
                Sentence::new(vec![tok("Rome", "B-LOC"), tok("is", "O"), tok("old", "O")]),
            ]))
            .collect()
    }

    #[test]
    fn test_short_training_run_saves_best_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().to_string_lossy().to_string();

        let (train_docs, dev_docs) = (corpus(0), corpus(4));
        let prep = Preprocessor::default();
        let mut alphabets = Alphabets::new(0);
        alphabets.extend_from(&train_docs, &prep);
        alphabets.extend_from(&dev_docs, &prep);
        alphabets.close();

        let cfg = TrainConfig {
            model_dir:     model_dir.clone(),
            epochs:        2,
            batch_size:    2,
            char_encoder:  "cnn".to_string(),
            word_emb_dim:  8,
            char_emb_dim:  4,
            char_hidden:   4,
            lstm_hidden:   8,
            label_emb_dim: 4,
            d_model:       8,
            num_heads:     2,
            num_layers:    1,
            d_ff:          16,
            max_read_memory: 4,
            nsamples:      2,
            use_crf:       true,
            ..TrainConfig::default()
        };
        cfg.validate().unwrap();
        let model_cfg = cfg.model_config(&alphabets).unwrap();

        let chunker = SentenceChunker::new(cfg.max_sentence_length);
        let splits  = TrainingSplits {
            train: TaggingDataset::from_documents(&train_docs, &alphabets, &prep, &chunker).unwrap(),
            dev:   Some(TaggingDataset::from_documents(&dev_docs, &alphabets, &prep, &chunker).unwrap()),
            test:  None,
        };
        let ckpt    = CheckpointManager::new(model_dir.clone()).unwrap();
        let metrics = MetricsLogger::new(model_dir).unwrap();

        let summary = train_loop::<TestBackend>(
            &cfg, &model_cfg, splits, &alphabets, &ckpt, &metrics, Default::default(),
        ).unwrap();

        assert_eq!(summary.epochs, 2);
        let best = summary.best.unwrap();
        assert!(best.epoch >= 1 && best.epoch <= 2);
        assert_eq!(ckpt.best().unwrap(), best);

        let csv = std::fs::read_to_string(metrics.csv_path()).unwrap();
        assert_eq!(csv.lines().count(), 3);
    }
}
