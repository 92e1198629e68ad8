// ============================================================
// Layer 2 — TrainUseCase
// ============================================================
// Orchestrates the full training pipeline in order:
//
//   Step 1: Validate the configuration  (Layer 2)
//   Step 2: Load train/dev/test corpora (Layer 4 - data)
//   Step 3: Build and close alphabets   (Layer 4 - data)
//   Step 4: Convert corpora to ids      (Layer 4 - data)
//   Step 5: Save config and alphabets   (Layer 6 - infra)
//   Step 6: Run training loop           (Layer 5 - ml)
//
// The three corpora share one doc_id counter, so memory cache
// keys never collide between splits.
//
// Reference: Rust Book §13 (Iterators and Closures)
//            Burn Book §5 (Training)

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::data::{
    alphabet::Alphabets,
    chunker::SentenceChunker,
    dataset::TaggingDataset,
    loader::JsonlCorpusLoader,
    preprocessor::Preprocessor,
};
use crate::domain::{
    document::Document,
    error::{TaggerError, TaggerResult},
    traits::CorpusSource,
};
use crate::infra::{
    alphabet_store::AlphabetStore,
    checkpoint::CheckpointManager,
    metrics::MetricsLogger,
};
use crate::ml::{
    decoder::DecoderKind,
    gate::GatePolicy,
    model::{CharEncoderKind, TaggerModelConfig},
    orchestrator::OrchestratorOptions,
    trainer::{run_training, TrainingSplits, TrainingSummary},
};

/// Entropy threshold used when neither gate option is given
pub const DEFAULT_THRESHOLD: f32 = 0.15;

// ─── Training Configuration ──────────────────────────────────────────────────
// All hyperparameters for a training run.
// Serialisable so it can be saved next to the checkpoint and
// reloaded by `decode`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub train_path:          String,
    pub dev_path:            Option<String>,
    pub test_path:           Option<String>,
    pub model_dir:           String,
    pub number_normalized:   bool,
    pub max_sentence_length: usize,
    pub batch_size:          usize,
    pub epochs:              usize,
    pub lr:                  f64,
    pub lr_decay:            f64,
    pub l2:                  f64,
    pub clip_grad:           Option<f32>,
    pub seed:                u64,
    /// "cnn", "lstm" or "none"
    pub char_encoder:        String,
    pub word_emb_dim:        usize,
    pub feature_emb_dim:     usize,
    pub char_emb_dim:        usize,
    pub char_hidden:         usize,
    pub lstm_hidden:         usize,
    pub label_emb_dim:       usize,
    pub d_model:             usize,
    pub num_heads:           usize,
    pub num_layers:          usize,
    pub d_ff:                usize,
    pub dropout:             f64,
    pub mc_dropout:          f64,
    /// Entropy threshold gate; exclusive with `topk`
    pub threshold:           Option<f32>,
    /// Top-k uncertainty gate; exclusive with `threshold`
    pub topk:                Option<usize>,
    pub max_read_memory:     usize,
    pub use_crf:             bool,
    pub nsamples:            usize,
    pub average_batch_loss:  bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            train_path:          "data/train.jsonl".to_string(),
            dev_path:            None,
            test_path:           None,
            model_dir:           "model".to_string(),
            number_normalized:   true,
            max_sentence_length: 250,
            batch_size:          1,
            epochs:              100,
            lr:                  0.015,
            lr_decay:            0.05,
            l2:                  1e-6,
            clip_grad:           Some(1.0),
            seed:                333,
            char_encoder:        "cnn".to_string(),
            word_emb_dim:        100,
            feature_emb_dim:     20,
            char_emb_dim:        30,
            char_hidden:         50,
            lstm_hidden:         200,
            label_emb_dim:       50,
            d_model:             128,
            num_heads:           4,
            num_layers:          2,
            d_ff:                256,
            dropout:             0.5,
            mc_dropout:          0.5,
            threshold:           Some(DEFAULT_THRESHOLD),
            topk:                None,
            max_read_memory:     10,
            use_crf:             false,
            nsamples:            32,
            average_batch_loss:  true,
        }
    }
}

impl TrainConfig {
    pub fn gate_policy(&self) -> TaggerResult<GatePolicy> {
        GatePolicy::from_options(self.threshold, self.topk)
    }

    pub fn char_encoder_kind(&self) -> TaggerResult<CharEncoderKind> {
        self.char_encoder.parse()
    }

    pub fn decoder_kind(&self) -> DecoderKind {
        DecoderKind::from_use_crf(self.use_crf)
    }

    /// Reject settings no run could start with
    pub fn validate(&self) -> TaggerResult<()> {
        self.gate_policy()?;
        let char_encoder = self.char_encoder_kind()?;

        let fail = |msg: String| Err(TaggerError::configuration(msg));

        if self.nsamples == 0 {
            return fail("`nsamples` must be at least 1".into());
        }
        if self.batch_size == 0 {
            return fail("`batch_size` must be at least 1".into());
        }
        if self.max_sentence_length == 0 {
            return fail("`max_sentence_length` must be at least 1".into());
        }
        if self.lstm_hidden == 0 || self.lstm_hidden % 2 != 0 {
            return fail(format!("`lstm_hidden` must be even and positive, got {}", self.lstm_hidden));
        }
        if char_encoder == CharEncoderKind::Lstm && (self.char_hidden == 0 || self.char_hidden % 2 != 0) {
            return fail(format!("`char_hidden` must be even for the lstm char encoder, got {}", self.char_hidden));
        }
        if self.num_heads == 0 || self.d_model % self.num_heads != 0 {
            return fail(format!(
                "`d_model` ({}) must be divisible by `num_heads` ({})",
                self.d_model, self.num_heads
            ));
        }
        for (name, p) in [("dropout", self.dropout), ("mc_dropout", self.mc_dropout)] {
            if !(0.0..1.0).contains(&p) {
                return fail(format!("`{name}` must be in [0, 1), got {p}"));
            }
        }
        if let Some(clip) = self.clip_grad {
            if !(clip.is_finite() && clip > 0.0) {
                return fail(format!("`clip_grad` must be positive, got {clip}"));
            }
        }
        Ok(())
    }

    /// Architecture of the model for the given vocabularies
    pub fn model_config(&self, alphabets: &Alphabets) -> TaggerResult<TaggerModelConfig> {
        Ok(TaggerModelConfig::new(
            alphabets.word.size(),
            alphabets.char.size(),
            alphabets.feature_sizes(),
            alphabets.label.size(),
            self.char_encoder_kind()?,
        )
        .with_word_emb_dim(self.word_emb_dim)
        .with_feature_emb_dim(self.feature_emb_dim)
        .with_char_emb_dim(self.char_emb_dim)
        .with_char_hidden(self.char_hidden)
        .with_lstm_hidden(self.lstm_hidden)
        .with_label_emb_dim(self.label_emb_dim)
        .with_d_model(self.d_model)
        .with_num_heads(self.num_heads)
        .with_num_layers(self.num_layers)
        .with_d_ff(self.d_ff)
        .with_max_sentence_length(self.max_sentence_length)
        .with_dropout(self.dropout)
        .with_mc_dropout(self.mc_dropout)
        .with_max_read_memory(self.max_read_memory)
        .with_use_crf(self.use_crf))
    }

    pub fn orchestrator_options(&self) -> TaggerResult<OrchestratorOptions> {
        Ok(OrchestratorOptions {
            gate:               self.gate_policy()?,
            decoder:            self.decoder_kind(),
            nsamples:           self.nsamples,
            max_read_memory:    self.max_read_memory,
            average_batch_loss: self.average_batch_loss,
            seed:               self.seed,
        })
    }

    pub fn preprocessor(&self) -> Preprocessor {
        Preprocessor::new(self.number_normalized)
    }

    pub fn chunker(&self) -> SentenceChunker {
        SentenceChunker::new(self.max_sentence_length)
    }
}

// ─── Corpus Loading ───────────────────────────────────────────────────────────
/// Raw documents of the three splits
pub struct LoadedCorpora {
    pub train: Vec<Document>,
    pub dev:   Option<Vec<Document>>,
    pub test:  Option<Vec<Document>>,
}

/// Load train, then dev, then test, numbering documents with one
/// running counter.
pub fn load_corpora(cfg: &TrainConfig) -> Result<LoadedCorpora> {
    let train = JsonlCorpusLoader::new(&cfg.train_path).load_all(0)?;
    let mut next_id = train.len();

    let mut load_optional = |path: &Option<String>| -> Result<Option<Vec<Document>>> {
        match path {
            Some(p) => {
                let docs = JsonlCorpusLoader::new(p).load_all(next_id)?;
                next_id += docs.len();
                Ok(Some(docs))
            }
            None => Ok(None),
        }
    };
    let dev  = load_optional(&cfg.dev_path)?;
    let test = load_optional(&cfg.test_path)?;

    Ok(LoadedCorpora { train, dev, test })
}

/// Alphabets grown over every loaded split, then closed
pub fn build_alphabets(corpora: &LoadedCorpora, preprocessor: &Preprocessor) -> Alphabets {
    let mut alphabets = Alphabets::new(Alphabets::infer_feature_num(&corpora.train));
    alphabets.extend_from(&corpora.train, preprocessor);
    for docs in [&corpora.dev, &corpora.test].into_iter().flatten() {
        alphabets.extend_from(docs, preprocessor);
    }
    alphabets.close();
    alphabets
}

// ─── TrainUseCase ─────────────────────────────────────────────────────────────
// Owns the config and runs the full training pipeline.
pub struct TrainUseCase {
    config: TrainConfig,
}

impl TrainUseCase {
    pub fn new(config: TrainConfig) -> Self {
        Self { config }
    }

    /// Execute the full training pipeline end to end
    pub fn execute(&self) -> Result<TrainingSummary> {
        let cfg = &self.config;

        // ── Step 1: Validate before touching any data ─────────────────────────
        cfg.validate()?;
        let gate = cfg.gate_policy()?;
        tracing::info!(
            "Gate {:?}, decoder {:?}, {} MC sample(s), memory reads {}",
            gate, cfg.decoder_kind(), cfg.nsamples, cfg.max_read_memory
        );

        // ── Step 2: Load corpora with one doc_id counter ──────────────────────
        let corpora = load_corpora(cfg)?;
        if corpora.train.is_empty() {
            return Err(TaggerError::invalid_input(format!(
                "training corpus '{}' has no documents", cfg.train_path
            )).into());
        }

        // ── Step 3: Alphabets ─────────────────────────────────────────────────
        let preprocessor = cfg.preprocessor();
        let alphabets    = build_alphabets(&corpora, &preprocessor);
        alphabets.summary();

        // ── Step 4: Id-form datasets ──────────────────────────────────────────
        let chunker  = cfg.chunker();
        let to_dataset = |docs: &[Document]| {
            TaggingDataset::from_documents(docs, &alphabets, &preprocessor, &chunker)
        };
        let splits = TrainingSplits {
            train: to_dataset(&corpora.train)?,
            dev:   corpora.dev.as_deref().map(to_dataset).transpose()?,
            test:  corpora.test.as_deref().map(to_dataset).transpose()?,
        };
        tracing::info!(
            "Datasets: {} train, {} dev, {} test documents",
            splits.train.len(),
            splits.dev.as_ref().map_or(0, TaggingDataset::len),
            splits.test.as_ref().map_or(0, TaggingDataset::len),
        );

        // ── Step 5: Persist what `decode` needs to rebuild the model ──────────
        let model_cfg    = cfg.model_config(&alphabets)?;
        let ckpt_manager = CheckpointManager::new(&cfg.model_dir)?;
        ckpt_manager.save_config(cfg)?;
        AlphabetStore::new(&cfg.model_dir).save(&alphabets)?;
        let metrics = MetricsLogger::new(&cfg.model_dir)?;

        // ── Step 6: Run training loop (Layer 5) ───────────────────────────────
        run_training(cfg, &model_cfg, splits, &alphabets, &ckpt_manager, &metrics)
    }
}
