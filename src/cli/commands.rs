// ============================================================
// Layer 1 — CLI Commands and Arguments
// ============================================================
// Defines the two subcommands, `train` and `decode`, and all
// their configurable flags.
//
// clap's derive macros automatically generate:
//   - help text (--help)
//   - error messages for missing args
//   - type conversion (string → usize, f64, Option<f32>, ...)
//
// Reference: Rust Book §12 (Building a CLI Program)

use clap::{ArgAction, Args, Subcommand};
use crate::application::train_use_case::{TrainConfig, DEFAULT_THRESHOLD};

/// The two top-level subcommands available to the user
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train a tagger on labeled .jsonl corpora
    Train(TrainArgs),

    /// Tag a raw .jsonl corpus with a trained model
    Decode(DecodeArgs),
}

/// All arguments for the `train` command.
/// Each field becomes a --flag on the command line.
#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Training corpus, one JSON document per line
    #[arg(long)]
    pub train: String,

    /// Development corpus; the best dev score picks the checkpoint
    #[arg(long)]
    pub dev: Option<String>,

    /// Test corpus, scored after every epoch
    #[arg(long)]
    pub test: Option<String>,

    /// Directory for checkpoint, config, alphabets and metrics
    #[arg(long, default_value = "model")]
    pub model_dir: String,

    /// Keep digits as they are instead of mapping them to 0
    #[arg(long)]
    pub no_number_normalized: bool,

    /// Sentences longer than this are split into chunks
    #[arg(long, default_value_t = 250)]
    pub max_sentence_length: usize,

    /// Documents per batch
    #[arg(long, default_value_t = 1)]
    pub batch_size: usize,

    /// Number of full passes through the training data
    #[arg(long, default_value_t = 100)]
    pub epochs: usize,

    /// Initial learning rate
    #[arg(long, default_value_t = 0.015)]
    pub lr: f64,

    /// lr_epoch = lr / (1 + lr_decay * (epoch - 1))
    #[arg(long, default_value_t = 0.05)]
    pub lr_decay: f64,

    /// Weight decay
    #[arg(long, default_value_t = 1e-6)]
    pub l2: f64,

    /// Clip gradients to this global norm; 0 turns clipping off
    #[arg(long, default_value_t = 1.0)]
    pub clip_grad: f32,

    /// Seed for shuffling, dropout and MC sampling
    #[arg(long, default_value_t = 333)]
    pub seed: u64,

    /// Character encoder: cnn, lstm or none
    #[arg(long, default_value = "cnn")]
    pub char_encoder: String,

    #[arg(long, default_value_t = 100)]
    pub word_emb_dim: usize,

    #[arg(long, default_value_t = 20)]
    pub feature_emb_dim: usize,

    #[arg(long, default_value_t = 30)]
    pub char_emb_dim: usize,

    #[arg(long, default_value_t = 50)]
    pub char_hidden: usize,

    /// Draft BiLSTM width, both directions together (must be even)
    #[arg(long, default_value_t = 200)]
    pub lstm_hidden: usize,

    #[arg(long, default_value_t = 50)]
    pub label_emb_dim: usize,

    /// Width of the refinement encoder
    #[arg(long, default_value_t = 128)]
    pub d_model: usize,

    /// d_model must be divisible by num_heads
    #[arg(long, default_value_t = 4)]
    pub num_heads: usize,

    #[arg(long, default_value_t = 2)]
    pub num_layers: usize,

    #[arg(long, default_value_t = 256)]
    pub d_ff: usize,

    #[arg(long, default_value_t = 0.5)]
    pub dropout: f64,

    /// Dropout applied to the draft stage's Monte-Carlo samples
    #[arg(long, default_value_t = 0.5)]
    pub mc_dropout: f64,

    /// Refine tokens whose entropy exceeds this value
    /// (0.15 unless --topk is given)
    #[arg(long, conflicts_with = "topk")]
    pub threshold: Option<f32>,

    /// Refine the k most uncertain tokens of each sentence
    #[arg(long)]
    pub topk: Option<usize>,

    /// Memory entries read per token; 0 disables the cache
    #[arg(long, default_value_t = 10)]
    pub max_read_memory: usize,

    /// Decode the refinement stage with a CRF
    #[arg(long)]
    pub use_crf: bool,

    /// Monte-Carlo draft samples averaged at inference
    #[arg(long, default_value_t = 32)]
    pub nsamples: usize,

    /// Divide the batch loss by the batch size
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub average_batch_loss: bool,
}

/// Convert CLI TrainArgs into the application-layer TrainConfig.
/// The application layer never sees clap types.
impl From<TrainArgs> for TrainConfig {
    fn from(a: TrainArgs) -> Self {
        TrainConfig {
            train_path:          a.train,
            dev_path:            a.dev,
            test_path:           a.test,
            model_dir:           a.model_dir,
            number_normalized:   !a.no_number_normalized,
            max_sentence_length: a.max_sentence_length,
            batch_size:          a.batch_size,
            epochs:              a.epochs,
            lr:                  a.lr,
            lr_decay:            a.lr_decay,
            l2:                  a.l2,
            clip_grad:           (a.clip_grad > 0.0).then_some(a.clip_grad),
            seed:                a.seed,
            char_encoder:        a.char_encoder,
            word_emb_dim:        a.word_emb_dim,
            feature_emb_dim:     a.feature_emb_dim,
            char_emb_dim:        a.char_emb_dim,
            char_hidden:         a.char_hidden,
            lstm_hidden:         a.lstm_hidden,
            label_emb_dim:       a.label_emb_dim,
            d_model:             a.d_model,
            num_heads:           a.num_heads,
            num_layers:          a.num_layers,
            d_ff:                a.d_ff,
            dropout:             a.dropout,
            mc_dropout:          a.mc_dropout,
            threshold:           a.threshold.or_else(|| a.topk.is_none().then_some(DEFAULT_THRESHOLD)),
            topk:                a.topk,
            max_read_memory:     a.max_read_memory,
            use_crf:             a.use_crf,
            nsamples:            a.nsamples,
            average_batch_loss:  a.average_batch_loss,
        }
    }
}

/// All arguments for the `decode` command
#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// Corpus to tag; labels, if present, are used for scoring
    #[arg(long)]
    pub raw: String,

    /// Directory written by `train`
    #[arg(long, default_value = "model")]
    pub model_dir: String,

    /// Output file (default: <model_dir>/results.jsonl)
    #[arg(long)]
    pub output: Option<String>,
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use crate::cli::Cli;
    use super::*;
    use clap::Parser;

    fn train_config(args: &[&str]) -> TrainConfig {
        let cli = Cli::try_parse_from(["doc-ner", "train"].iter().chain(args).copied()).unwrap();
        match cli.command {
            Commands::Train(a) => a.into(),
            other              => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_train_args_map_to_config() {
        let cfg = train_config(&["--train", "t.jsonl", "--dev", "d.jsonl", "--topk", "2", "--use-crf"]);
        assert_eq!(cfg.train_path, "t.jsonl");
        assert_eq!(cfg.dev_path.as_deref(), Some("d.jsonl"));
        assert_eq!(cfg.topk, Some(2));
        assert_eq!(cfg.threshold, None);
        assert!(cfg.use_crf);
        assert!(cfg.number_normalized);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_cli_defaults_match_config_defaults() {
        let cli = train_config(&["--train", "t.jsonl"]);
        let cfg = TrainConfig { train_path: "t.jsonl".into(), ..TrainConfig::default() };
        assert_eq!(serde_json::to_value(&cli).unwrap(), serde_json::to_value(&cfg).unwrap());
        cli.validate().unwrap();
    }

    #[test]
    fn test_clip_grad_zero_disables_clipping() {
        let cfg = train_config(&["--train", "t.jsonl", "--clip-grad", "0", "--average-batch-loss", "false"]);
        assert_eq!(cfg.clip_grad, None);
        assert!(!cfg.average_batch_loss);
    }

    #[test]
    fn test_threshold_and_topk_conflict() {
        let res = Cli::try_parse_from([
            "doc-ner", "train", "--train", "t.jsonl", "--threshold", "0.4", "--topk", "1",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn test_decode_args() {
        let cli = Cli::try_parse_from(["doc-ner", "decode", "--raw", "r.jsonl"]).unwrap();
        match cli.command {
            Commands::Decode(a) => {
                assert_eq!(a.raw, "r.jsonl");
                assert_eq!(a.model_dir, "model");
                assert!(a.output.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
