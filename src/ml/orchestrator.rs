// ============================================================
// Layer 5 — Two-Stage Orchestrator
// ============================================================
// Runs one batch through both stages:
//
//   1. draft pass (BiLSTM) + arg-max       → distribution, hidden
//   2. entropy + gate policy               → label mask
//   3. soft label embedding E_p[emb]       (zero at padding)
//   4. write hidden ; soft embedding into the document memory
//   5. refinement pass reading that memory
//   6. decode refinement (arg-max or CRF Viterbi)
//   7. merge draft/refined by the label mask, restore caller order
//   8. loss = draft CE + refinement (CE or CRF NLL) when gold exists
//
// The orchestrator owns the memory cache, so `step` takes
// `&mut self`: exactly one step can be in flight.
//
// Inference with nsamples > 1 draws Monte-Carlo dropout masks;
// the backend RNG is reseeded with `seed + step` first so a run
// can be replayed.

use anyhow::{anyhow, bail, Result};
use burn::{prelude::*, tensor::activation::softmax};

use crate::data::batcher::{int_tensor, CanonicalBatch, TaggerBatcher};
use crate::domain::error::{TaggerError, TaggerResult};
use crate::ml::{
    decoder::{gold_transition_indices, DecoderKind, ScoreGrid, SequenceDecoder},
    gate::{self, GatePolicy},
    memory::{DocumentMemory, MemoryRead},
    model::{token_cross_entropy, MemoryTensors, TaggerModel, TaggerModelConfig},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    Train,
    Infer,
}

/// Runtime options of the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorOptions {
    pub gate:               GatePolicy,
    pub decoder:            DecoderKind,
    pub nsamples:           usize,
    pub max_read_memory:    usize,
    pub average_batch_loss: bool,
    pub seed:               u64,
}

pub struct StepOutput<B: Backend> {
    /// Present when the batch carries gold labels
    pub loss:          Option<Tensor<B, 1>>,
    /// Merged labels per sentence, caller order, trimmed to length
    pub predictions:   Vec<Vec<usize>>,
    /// [N, S, L] draft distribution, canonical order
    pub draft_probs:   Tensor<B, 3>,
    /// [N, S, L] refinement distribution, canonical order
    pub refined_probs: Tensor<B, 3>,
    /// Tokens that took the refined label
    pub uncertain:     usize,
    pub tokens:        usize,
}

pub struct TwoStageOrchestrator {
    memory:             DocumentMemory,
    gate:               GatePolicy,
    decoder:            DecoderKind,
    nsamples:           usize,
    average_batch_loss: bool,
    seed:               u64,
    steps:              u64,
}

impl TwoStageOrchestrator {
    /// # Errors
    /// Configuration error for `nsamples == 0`, or for a CRF decoder
    /// over a model built without the CRF layer.
    pub fn new(options: OrchestratorOptions, model_cfg: &TaggerModelConfig) -> TaggerResult<Self> {
        if options.nsamples == 0 {
            return Err(TaggerError::configuration("nsamples must be at least 1"));
        }
        if options.decoder == DecoderKind::Crf && !model_cfg.use_crf {
            return Err(TaggerError::configuration("CRF decoding needs a model built with use_crf"));
        }
        Ok(Self {
            memory: DocumentMemory::new(options.max_read_memory, model_cfg.lstm_hidden, model_cfg.label_emb_dim),
            gate:               options.gate,
            decoder:            options.decoder,
            nsamples:           options.nsamples,
            average_batch_loss: options.average_batch_loss,
            seed:               options.seed,
            steps:              0,
        })
    }

    pub fn memory(&self) -> &DocumentMemory { &self.memory }

    pub fn steps(&self) -> u64 { self.steps }

    /// Seed used for the Monte-Carlo passes of the current step
    pub fn inference_seed(&self) -> u64 {
        self.seed.wrapping_add(self.steps)
    }

    pub fn step<B: Backend>(
        &mut self,
        model:  &TaggerModel<B>,
        batch:  &CanonicalBatch,
        mode:   StepMode,
        device: &B::Device,
    ) -> Result<StepOutput<B>> {
        self.steps += 1;
        self.memory.advance();

        let tensors = TaggerBatcher::<B>::new(device.clone()).batch(batch);
        let (n, s, l) = (batch.batch_size, batch.max_seq_len, model.num_labels);

        // ── Step 1: draft pass ────────────────────────────────────────────────
        let samples    = if mode == StepMode::Train { 1 } else { self.nsamples };
        let stochastic = mode == StepMode::Train || samples > 1;
        if mode == StepMode::Infer && samples > 1 {
            let seed = self.inference_seed();
            B::seed(seed);
            tracing::debug!("Step {}: {} Monte-Carlo samples, seed {}", self.steps, samples, seed);
        }

        let word_rep     = model.word_rep.forward(&tensors);
        let hidden       = model.draft.encode(word_rep.clone());
        let draft_logits = model.draft.sample(hidden.clone(), stochastic);
        let mut probs    = softmax(draft_logits.clone(), 2);
        for _ in 1..samples {
            probs = probs + softmax(model.draft.sample(hidden.clone(), true), 2);
        }
        let draft_probs = probs / samples as f64;

        let host_draft   = to_host(draft_probs.clone())?;
        let draft_labels = SequenceDecoder::ArgMax.decode(&ScoreGrid::new(n, s, l, host_draft.clone()), &batch.mask);

        // ── Step 2: uncertainty and gate ──────────────────────────────────────
        let entropy    = gate::entropy(&host_draft, l, &batch.mask);
        let label_mask = self.gate.label_mask(&entropy, &batch.mask, n, s);

        // ── Step 3: soft label embedding ──────────────────────────────────────
        let soft_labels = model.soft_label_embedding(draft_probs.clone(), tensors.mask.clone());

        // ── Step 4: memory write, then read ───────────────────────────────────
        let memory = if self.memory.is_enabled() && model.uses_memory() {
            self.write_memory(batch, &to_host(hidden)?, &to_host(soft_labels.clone())?);
            let read = self.memory.read(&batch.doc_ids, &batch.positions, &batch.mask);
            tracing::debug!(
                "Step {}: memory holds {} entries over {} documents, {} slots read",
                self.steps,
                self.memory.len(),
                self.memory.doc_count(),
                read.valid_count()
            );
            Some(memory_tensors::<B>(read, n, s, device))
        } else {
            None
        };

        // ── Step 5: refinement pass ───────────────────────────────────────────
        let logits = model.refine.forward(word_rep, soft_labels, tensors.mask.clone().bool_not(), memory);
        let [_, _, tags] = logits.dims();
        let refined_probs = softmax(logits.clone().slice([0..n, 0..s, 0..l]), 2);

        // ── Step 6: decode refinement ─────────────────────────────────────────
        let decoder = match (self.decoder, &model.crf) {
            (DecoderKind::ArgMax, _)       => SequenceDecoder::ArgMax,
            (DecoderKind::Crf, Some(crf))  => SequenceDecoder::Crf(crf.to_transitions()?),
            (DecoderKind::Crf, None)       => bail!(TaggerError::configuration("model has no CRF layer")),
        };
        let grid = ScoreGrid::new(n, s, tags, to_host(logits.clone())?);
        let refined_labels = decoder.decode(&grid, &batch.mask);

        // ── Step 7: merge ─────────────────────────────────────────────────────
        let merged      = gate::merge(&draft_labels, &refined_labels, &label_mask, &batch.mask);
        let predictions = batch.restore_sequences(&merged);
        let uncertain   = label_mask.iter().filter(|&&m| m).count();

        // ── Step 8: loss ──────────────────────────────────────────────────────
        let loss = if batch.has_gold {
            let draft_loss  = token_cross_entropy(draft_logits, tensors.labels.clone(), tensors.mask.clone());
            let refine_loss = match (&decoder, &model.crf) {
                (SequenceDecoder::Crf(_), Some(crf)) => {
                    let gold = gold_transition_indices(&batch.labels, &batch.lengths, s, crf.num_tags);
                    let gold = int_tensor::<B, 1>(&gold, [gold.len()], device);
                    crf.neg_log_likelihood(logits, tensors.labels, tensors.mask, gold)
                }
                _ => token_cross_entropy(logits, tensors.labels, tensors.mask),
            };
            let total = draft_loss + refine_loss;
            Some(if self.average_batch_loss { total / n as f64 } else { total })
        } else {
            None
        };

        tracing::debug!(
            "Step {}: {}×{} batch, {}/{} tokens refined",
            self.steps,
            n,
            s,
            uncertain,
            batch.token_count()
        );

        Ok(StepOutput {
            loss,
            predictions,
            draft_probs,
            refined_probs,
            uncertain,
            tokens: batch.token_count(),
        })
    }

    fn write_memory(&mut self, batch: &CanonicalBatch, hidden: &[f32], soft_labels: &[f32]) {
        let cells = batch.mask.len();
        let h = hidden.len() / cells;
        let e = soft_labels.len() / cells;
        for cell in (0..cells).filter(|&c| batch.mask[c]) {
            self.memory.put(
                batch.doc_ids[cell],
                batch.positions[cell],
                &hidden[cell * h..(cell + 1) * h],
                &soft_labels[cell * e..(cell + 1) * e],
            );
        }
    }
}

/// Copy a tensor's values to the host as f32
pub fn to_host<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow!("Cannot read tensor data: {e:?}"))
}

fn memory_tensors<B: Backend>(read: MemoryRead, n: usize, s: usize, device: &B::Device) -> MemoryTensors<B> {
    let valid: Vec<usize> = read.valid.iter().map(|&v| usize::from(v)).collect();
    MemoryTensors {
        entries: Tensor::from_data(TensorData::new(read.entries, [n, s, read.slots, read.entry_dim]), device),
        valid:   int_tensor::<B, 3>(&valid, [n, s, read.slots], device).equal_elem(1),
    }
}
