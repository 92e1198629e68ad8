use std::{fmt, str::FromStr};

use burn::{
    nn::{
        attention::{MhaInput, MultiHeadAttention, MultiHeadAttentionConfig},
        conv::{Conv1d, Conv1dConfig},
        BiLstm, BiLstmConfig,
        Dropout, DropoutConfig,
        Embedding, EmbeddingConfig,
        Initializer,
        LayerNorm, LayerNormConfig,
        Linear, LinearConfig,
        PaddingConfig1d,
    },
    prelude::*,
    tensor::{activation::{gelu, softmax}, Distribution},
};
use serde::{Deserialize, Serialize};

use crate::data::batcher::TaggerBatch;
use crate::domain::error::TaggerError;
use crate::ml::crf::{Crf, CrfConfig};

/// Masked-out attention logit
const MASKED: f32 = -1.0e4;

// ─── Char Encoder Selection ───────────────────────────────────────────────────
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CharEncoderKind {
    None,
    Cnn,
    Lstm,
}

impl FromStr for CharEncoderKind {
    type Err = TaggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "cnn"       => Ok(Self::Cnn),
            "lstm"      => Ok(Self::Lstm),
            other       => Err(TaggerError::configuration(format!(
                "unknown char encoder '{other}' (expected cnn, lstm or none)"
            ))),
        }
    }
}

impl fmt::Display for CharEncoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Cnn  => "cnn",
            Self::Lstm => "lstm",
        };
        f.write_str(name)
    }
}

// #[derive(Config)] brings Clone + serde; adding them again conflicts.
#[derive(Config, Debug)]
pub struct TaggerModelConfig {
    pub word_vocab:     usize,
    pub char_vocab:     usize,
    pub feature_vocabs: Vec<usize>,
    /// Label alphabet size, padding id included
    pub num_labels:     usize,
    pub char_encoder:   CharEncoderKind,
    #[config(default = 50)]
    pub word_emb_dim:   usize,
    #[config(default = 20)]
    pub feature_emb_dim: usize,
    #[config(default = 30)]
    pub char_emb_dim:   usize,
    #[config(default = 50)]
    pub char_hidden:    usize,
    #[config(default = 200)]
    pub lstm_hidden:    usize,
    #[config(default = 50)]
    pub label_emb_dim:  usize,
    #[config(default = 128)]
    pub d_model:        usize,
    #[config(default = 4)]
    pub num_heads:      usize,
    #[config(default = 2)]
    pub num_layers:     usize,
    #[config(default = 256)]
    pub d_ff:           usize,
    #[config(default = 250)]
    pub max_sentence_length: usize,
    #[config(default = 0.5)]
    pub dropout:        f64,
    #[config(default = 0.5)]
    pub mc_dropout:     f64,
    #[config(default = 0)]
    pub max_read_memory: usize,
    #[config(default = false)]
    pub use_crf:        bool,
}

fn uniform_embedding(vocab: usize, dim: usize) -> EmbeddingConfig {
    let scale = (3.0 / dim as f64).sqrt();
    EmbeddingConfig::new(vocab, dim).with_initializer(Initializer::Uniform { min: -scale, max: scale })
}

impl TaggerModelConfig {
    /// Width of the word representation fed to both stages
    pub fn word_rep_dim(&self) -> usize {
        let chars = match self.char_encoder {
            CharEncoderKind::None => 0,
            _                     => self.char_hidden,
        };
        self.word_emb_dim + self.feature_emb_dim * self.feature_vocabs.len() + chars
    }

    /// Width of one memory entry: draft hidden ; soft label embedding
    pub fn memory_dim(&self) -> usize {
        self.lstm_hidden + self.label_emb_dim
    }

    /// Refinement output columns (START/STOP appended under CRF)
    pub fn refine_outputs(&self) -> usize {
        if self.use_crf { self.num_labels + 2 } else { self.num_labels }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> TaggerModel<B> {
        let word_rep = WordRep {
            word_embedding:     uniform_embedding(self.word_vocab, self.word_emb_dim).init(device),
            feature_embeddings: self.feature_vocabs
                .iter()
                .map(|&v| uniform_embedding(v, self.feature_emb_dim).init(device))
                .collect(),
            char_cnn:  (self.char_encoder == CharEncoderKind::Cnn).then(|| self.build_char_cnn(device)),
            char_lstm: (self.char_encoder == CharEncoderKind::Lstm).then(|| self.build_char_lstm(device)),
            dropout:   DropoutConfig::new(self.dropout).init(),
        };

        let draft = DraftTagger {
            lstm:       BiLstmConfig::new(self.word_rep_dim(), self.lstm_hidden / 2, true).init(device),
            output:     LinearConfig::new(self.lstm_hidden, self.num_labels).init(device),
            mc_dropout: self.mc_dropout,
        };

        let refine = RefineTagger {
            word_proj:          LinearConfig::new(self.word_rep_dim(), self.d_model).init(device),
            label_proj:         LinearConfig::new(self.label_emb_dim, self.d_model).init(device),
            position_embedding: EmbeddingConfig::new(self.max_sentence_length, self.d_model).init(device),
            layers:             (0..self.num_layers).map(|_| self.build_encoder_block(device)).collect(),
            memory:             (self.max_read_memory > 0).then(|| MemoryAttention {
                query:   LinearConfig::new(self.d_model, self.d_model).init(device),
                key:     LinearConfig::new(self.memory_dim(), self.d_model).init(device),
                value:   LinearConfig::new(self.memory_dim(), self.d_model).init(device),
                d_model: self.d_model,
            }),
            final_norm:         LayerNormConfig::new(self.d_model).init(device),
            output:             LinearConfig::new(2 * self.d_model, self.refine_outputs()).init(device),
            dropout:            DropoutConfig::new(self.dropout).init(),
        };

        TaggerModel {
            word_rep,
            draft,
            refine,
            label_embedding: uniform_embedding(self.num_labels, self.label_emb_dim).init(device),
            crf:             self.use_crf.then(|| CrfConfig::new(self.num_labels).init(device)),
            num_labels:      self.num_labels,
        }
    }

    fn build_char_cnn<B: Backend>(&self, device: &B::Device) -> CharCnn<B> {
        CharCnn {
            embedding: uniform_embedding(self.char_vocab, self.char_emb_dim).init(device),
            conv:      Conv1dConfig::new(self.char_emb_dim, self.char_hidden, 3)
                .with_padding(PaddingConfig1d::Explicit(1))
                .init(device),
        }
    }

    fn build_char_lstm<B: Backend>(&self, device: &B::Device) -> CharLstm<B> {
        CharLstm {
            embedding: uniform_embedding(self.char_vocab, self.char_emb_dim).init(device),
            lstm:      BiLstmConfig::new(self.char_emb_dim, self.char_hidden / 2, true).init(device),
        }
    }

    fn build_encoder_block<B: Backend>(&self, device: &B::Device) -> EncoderBlock<B> {
        let self_attn   = MultiHeadAttentionConfig::new(self.d_model, self.num_heads)
            .with_dropout(self.dropout)
            .init(device);
        let ffn_linear1 = LinearConfig::new(self.d_model, self.d_ff).init(device);
        let ffn_linear2 = LinearConfig::new(self.d_ff, self.d_model).init(device);
        let norm1   = LayerNormConfig::new(self.d_model).init(device);
        let norm2   = LayerNormConfig::new(self.d_model).init(device);
        let dropout = DropoutConfig::new(self.dropout).init();
        EncoderBlock { self_attn, ffn_linear1, ffn_linear2, norm1, norm2, dropout }
    }
}

// ─── Character Encoders ───────────────────────────────────────────────────────
#[derive(Module, Debug)]
pub struct CharCnn<B: Backend> {
    pub embedding: Embedding<B>,
    pub conv:      Conv1d<B>,
}

impl<B: Backend> CharCnn<B> {
    /// chars: [words, W] → [words, char_hidden] (max over width)
    pub fn forward(&self, chars: Tensor<B, 2, Int>) -> Tensor<B, 2> {
        let x = self.embedding.forward(chars).swap_dims(1, 2); // [words, E, W]
        let x = self.conv.forward(x);                          // [words, H, W]
        let [words, hidden, _] = x.dims();
        x.max_dim(2).reshape([words, hidden])
    }
}

#[derive(Module, Debug)]
pub struct CharLstm<B: Backend> {
    pub embedding: Embedding<B>,
    pub lstm:      BiLstm<B>,
}

impl<B: Backend> CharLstm<B> {
    /// chars: [words, W] → [words, char_hidden] (max over width)
    pub fn forward(&self, chars: Tensor<B, 2, Int>) -> Tensor<B, 2> {
        let (x, _) = self.lstm.forward(self.embedding.forward(chars), None); // [words, W, H]
        let [words, _, hidden] = x.dims();
        x.swap_dims(1, 2).max_dim(2).reshape([words, hidden])             // max over W on the last axis
    }
}

// ─── Word Representation ──────────────────────────────────────────────────────
#[derive(Module, Debug)]
pub struct WordRep<B: Backend> {
    pub word_embedding:     Embedding<B>,
    pub feature_embeddings: Vec<Embedding<B>>,
    pub char_cnn:           Option<CharCnn<B>>,
    pub char_lstm:          Option<CharLstm<B>>,
    pub dropout:            Dropout,
}

impl<B: Backend> WordRep<B> {
    /// → [N, S, word_rep_dim]
    pub fn forward(&self, batch: &TaggerBatch<B>) -> Tensor<B, 3> {
        let [n, s] = batch.words.dims();
        let mut parts = vec![self.word_embedding.forward(batch.words.clone())];

        for (emb, ids) in self.feature_embeddings.iter().zip(&batch.features) {
            parts.push(emb.forward(ids.clone()));
        }

        // Char features come out in char-sorted order; select with
        // char_recover to line them up with the word slots again.
        let chars = match (&self.char_cnn, &self.char_lstm) {
            (Some(cnn), _)     => Some(cnn.forward(batch.chars.clone())),
            (None, Some(lstm)) => Some(lstm.forward(batch.chars.clone())),
            (None, None)       => None,
        };
        if let Some(chars) = chars {
            let [_, hidden] = chars.dims();
            let restored = chars.select(0, batch.char_recover.clone()).reshape([n, s, hidden]);
            parts.push(restored);
        }

        self.dropout.forward(Tensor::cat(parts, 2))
    }
}

// ─── Draft Stage ──────────────────────────────────────────────────────────────
#[derive(Module, Debug)]
pub struct DraftTagger<B: Backend> {
    pub lstm:       BiLstm<B>,
    pub output:     Linear<B>,
    pub mc_dropout: f64,
}

pub struct DraftOutput<B: Backend> {
    /// [N, S, lstm_hidden] — what gets written to memory
    pub hidden: Tensor<B, 3>,
    /// [N, S, L]
    pub logits: Tensor<B, 3>,
}

impl<B: Backend> DraftTagger<B> {
    /// Contextual hidden states, shared by every Monte-Carlo sample
    pub fn encode(&self, word_rep: Tensor<B, 3>) -> Tensor<B, 3> {
        self.lstm.forward(word_rep, None).0
    }

    /// One pass of the output layer. With `stochastic` set, a fresh
    /// inverted-dropout mask is drawn regardless of backend, so
    /// repeated calls at inference give Monte-Carlo samples.
    pub fn sample(&self, hidden: Tensor<B, 3>, stochastic: bool) -> Tensor<B, 3> {
        let p = self.mc_dropout;
        let x = if stochastic && p > 0.0 && p < 1.0 {
            let keep = Tensor::<B, 3>::random(hidden.shape(), Distribution::Bernoulli(1.0 - p), &hidden.device());
            hidden * keep / (1.0 - p)
        } else {
            hidden
        };
        self.output.forward(x)
    }

    pub fn forward(&self, word_rep: Tensor<B, 3>, stochastic: bool) -> DraftOutput<B> {
        let hidden = self.encode(word_rep);
        let logits = self.sample(hidden.clone(), stochastic);
        DraftOutput { hidden, logits }
    }
}

// ─── Refinement Stage ─────────────────────────────────────────────────────────
#[derive(Module, Debug)]
pub struct EncoderBlock<B: Backend> {
    pub self_attn:   MultiHeadAttention<B>,
    pub ffn_linear1: Linear<B>,
    pub ffn_linear2: Linear<B>,
    pub norm1:       LayerNorm<B>,
    pub norm2:       LayerNorm<B>,
    pub dropout:     Dropout,
}

impl<B: Backend> EncoderBlock<B> {
    /// pad_mask: [N, S], true at padding
    pub fn forward(&self, x: Tensor<B, 3>, pad_mask: Tensor<B, 2, Bool>) -> Tensor<B, 3> {
        let input       = MhaInput::self_attn(x.clone()).mask_pad(pad_mask);
        let attn_output = self.self_attn.forward(input).context;
        let x = self.norm1.forward(x + self.dropout.forward(attn_output));
        let ffn_out = self.ffn_linear2.forward(gelu(self.ffn_linear1.forward(x.clone())));
        self.norm2.forward(x + self.dropout.forward(ffn_out))
    }
}

/// Memory reads on the device
#[derive(Debug, Clone)]
pub struct MemoryTensors<B: Backend> {
    /// [N, S, K, memory_dim]
    pub entries: Tensor<B, 4>,
    /// [N, S, K], true = entry present
    pub valid:   Tensor<B, 3, Bool>,
}

/// Scaled dot-product attention of each token over its memory reads
#[derive(Module, Debug)]
pub struct MemoryAttention<B: Backend> {
    pub query:   Linear<B>,
    pub key:     Linear<B>,
    pub value:   Linear<B>,
    pub d_model: usize,
}

impl<B: Backend> MemoryAttention<B> {
    /// state: [N, S, d] → [N, S, d]; zero where a token has no reads
    pub fn forward(&self, state: Tensor<B, 3>, memory: MemoryTensors<B>) -> Tensor<B, 3> {
        let [n, s, d] = state.dims();
        let [_, _, k, _] = memory.entries.dims();

        let q = self.query.forward(state).unsqueeze_dim::<4>(2);      // [N, S, 1, d]
        let keys   = self.key.forward(memory.entries.clone());         // [N, S, K, d]
        let values = self.value.forward(memory.entries);               // [N, S, K, d]

        let scores = (q * keys).sum_dim(3).reshape([n, s, k]) / (self.d_model as f64).sqrt();
        let scores = scores.mask_fill(memory.valid.clone().bool_not(), MASKED);
        let weights = softmax(scores, 2).unsqueeze_dim::<4>(3);       // [N, S, K, 1]

        let context = (weights * values).sum_dim(2).reshape([n, s, d]);
        let any     = memory.valid.int().sum_dim(2).greater_elem(0).float(); // [N, S, 1]
        context * any
    }
}

#[derive(Module, Debug)]
pub struct RefineTagger<B: Backend> {
    pub word_proj:          Linear<B>,
    pub label_proj:         Linear<B>,
    pub position_embedding: Embedding<B>,
    pub layers:             Vec<EncoderBlock<B>>,
    pub memory:             Option<MemoryAttention<B>>,
    pub final_norm:         LayerNorm<B>,
    pub output:             Linear<B>,
    pub dropout:            Dropout,
}

impl<B: Backend> RefineTagger<B> {
    /// word_rep: [N, S, Dw], soft_labels: [N, S, E], pad_mask: [N, S]
    /// (true at padding) → logits [N, S, refine_outputs]
    pub fn forward(
        &self,
        word_rep:    Tensor<B, 3>,
        soft_labels: Tensor<B, 3>,
        pad_mask:    Tensor<B, 2, Bool>,
        memory:      Option<MemoryTensors<B>>,
    ) -> Tensor<B, 3> {
        let [batch_size, seq_len, _] = word_rep.dims();

        let positions = Tensor::<B, 1, Int>::arange(0..seq_len as i64, &word_rep.device())
            .unsqueeze::<2>()
            .expand([batch_size, seq_len]);
        let pos_emb = self.position_embedding.forward(positions);

        let mut x = self.dropout.forward(self.word_proj.forward(word_rep) + pos_emb);
        for layer in &self.layers {
            x = layer.forward(x, pad_mask.clone());
        }
        let x = self.final_norm.forward(x); // [N, S, d_model]

        let mut label_state = self.label_proj.forward(soft_labels);
        if let (Some(attention), Some(memory)) = (&self.memory, memory) {
            label_state = label_state + attention.forward(x.clone(), memory);
        }

        self.output.forward(Tensor::cat(vec![x, self.dropout.forward(label_state)], 2))
    }
}

// ─── Full Model ───────────────────────────────────────────────────────────────
#[derive(Module, Debug)]
pub struct TaggerModel<B: Backend> {
    pub word_rep:        WordRep<B>,
    pub draft:           DraftTagger<B>,
    pub refine:          RefineTagger<B>,
    pub label_embedding: Embedding<B>,
    pub crf:             Option<Crf<B>>,
    pub num_labels:      usize,
}

impl<B: Backend> TaggerModel<B> {
    pub fn uses_memory(&self) -> bool {
        self.refine.memory.is_some()
    }

    /// E_p[label embedding]: probs [N, S, L] → [N, S, E], zero at padding
    pub fn soft_label_embedding(&self, probs: Tensor<B, 3>, mask: Tensor<B, 2, Bool>) -> Tensor<B, 3> {
        let [n, s, l] = probs.dims();
        let table     = self.label_embedding.weight.val();        // [L, E]
        let [_, e]    = table.dims();
        let soft      = probs.reshape([n * s, l]).matmul(table).reshape([n, s, e]);
        soft * mask.float().unsqueeze_dim::<3>(2)
    }
}

/// Summed token cross entropy over real tokens with a gold label.
/// logits: [N, S, C], labels: [N, S] (0 = no gold) → [1]
pub fn token_cross_entropy<B: Backend>(
    logits: Tensor<B, 3>,
    labels: Tensor<B, 2, Int>,
    mask:   Tensor<B, 2, Bool>,
) -> Tensor<B, 1> {
    let [n, s, _] = logits.dims();
    let counted   = mask.float() * labels.clone().not_equal_elem(0).float();
    let log_probs = burn::tensor::activation::log_softmax(logits, 2);
    let picked    = log_probs.gather(2, labels.unsqueeze_dim::<3>(2)).reshape([n, s]);
    (picked * counted).sum().neg()
}
