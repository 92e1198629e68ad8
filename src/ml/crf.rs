// ============================================================
// Layer 5 — CRF Transition Layer (Burn)
// ============================================================
// Learnable (T × T) transition matrix plus the differentiable
// negative log-likelihood used to train the refinement stage
// when `use_crf` is set. T = L + 2 (START, STOP).
//
// Forward algorithm, batched over rows:
//
//   α_0[j]   = trans[START, j] + emit_0[j]
//   α_t[j]   = logsumexp_i(α_{t-1}[i] + trans[i, j]) + emit_t[j]
//              (rows whose sequence ended keep α_{t-1})
//   log Z    = logsumexp_j(α_n[j] + trans[j, STOP])
//
// Gold path score gathers emissions with the label ids and
// transitions with flat indices precomputed on the host
// (`decoder::gold_transition_indices`).
//
// Decoding reads the matrix back into `decoder::Transitions`
// and runs Viterbi on the host.

use anyhow::{anyhow, Result};
use burn::{
    module::Param,
    prelude::*,
};

use crate::ml::decoder::{Transitions, IMPOSSIBLE};

#[derive(Config, Debug)]
pub struct CrfConfig {
    /// Number of real labels L, padding included
    pub num_labels: usize,
}

impl CrfConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Crf<B> {
        let init = Transitions::constrained(self.num_labels);
        let transitions = Tensor::<B, 2>::from_data(
            TensorData::new(init.values, [init.size, init.size]),
            device,
        );
        Crf {
            transitions: Param::from_tensor(transitions),
            num_tags:    init.size,
        }
    }
}

#[derive(Module, Debug)]
pub struct Crf<B: Backend> {
    /// [T, T], row = from, column = to
    pub transitions: Param<Tensor<B, 2>>,
    pub num_tags:    usize,
}

/// Stable log-sum-exp over the last axis: [N, A, B] → [N, A, 1].
/// Reductions stay on the last axis for autodiff; the max shift is detached.
fn log_sum_exp<B: Backend>(x: Tensor<B, 3>) -> Tensor<B, 3> {
    let max = x.clone().max_dim(2).detach();
    (x - max.clone()).exp().sum_dim(2).log() + max
}

impl<B: Backend> Crf<B> {
    pub fn start(&self) -> usize { self.num_tags - 2 }

    pub fn stop(&self) -> usize { self.num_tags - 1 }

    /// Log partition per row.
    /// emissions: [N, S, T], mask: [N, S] → [N]
    pub fn log_partition(&self, emissions: Tensor<B, 3>, mask: Tensor<B, 2, Bool>) -> Tensor<B, 1> {
        let [n, s, t] = emissions.dims();
        let trans     = self.transitions.val();
        let mask      = mask.float();

        let from_start = trans.clone().slice([self.start()..self.start() + 1, 0..t]); // [1, T]
        let to_stop    = trans.clone().slice([0..t, self.stop()..self.stop() + 1])
            .reshape([1, t]);                                                         // [1, T]
        let trans3     = trans.unsqueeze::<3>();                                      // [1, T, T]

        let emit = |step: usize| emissions.clone().slice([0..n, step..step + 1, 0..t]).reshape([n, t]);

        let mut alpha = emit(0) + from_start;                                        // [N, T]
        for step in 1..s {
            let scores = (alpha.clone().unsqueeze_dim::<3>(2) + trans3.clone())      // [N, T(from), T(to)]
                .swap_dims(1, 2);                                                     // [N, T(to), T(from)]
            let next   = log_sum_exp(scores).reshape([n, t]) + emit(step);
            let live   = mask.clone().slice([0..n, step..step + 1]);                  // [N, 1]
            alpha = next * live.clone() + alpha * (live.neg() + 1.0);
        }

        log_sum_exp((alpha + to_stop).unsqueeze::<3>()).reshape([n])
    }

    /// Summed gold path score.
    /// labels: [N, S] ids, gold_transitions: flat indices into trans
    pub fn gold_score(
        &self,
        emissions:        Tensor<B, 3>,
        labels:           Tensor<B, 2, Int>,
        mask:             Tensor<B, 2, Bool>,
        gold_transitions: Tensor<B, 1, Int>,
    ) -> Tensor<B, 1> {
        let [n, s, _] = emissions.dims();
        let emitted = emissions
            .gather(2, labels.unsqueeze_dim::<3>(2))
            .reshape([n, s])
            * mask.float();

        let flat  = self.transitions.val().reshape([self.num_tags * self.num_tags]);
        let moves = flat.select(0, gold_transitions);

        emitted.sum() + moves.sum()
    }

    /// Batch NLL: Σ log Z − Σ gold score, shape [1]
    pub fn neg_log_likelihood(
        &self,
        emissions:        Tensor<B, 3>,
        labels:           Tensor<B, 2, Int>,
        mask:             Tensor<B, 2, Bool>,
        gold_transitions: Tensor<B, 1, Int>,
    ) -> Tensor<B, 1> {
        let log_z = self.log_partition(emissions.clone(), mask.clone()).sum();
        log_z - self.gold_score(emissions, labels, mask, gold_transitions)
    }

    /// Copy the current matrix to the host for Viterbi
    pub fn to_transitions(&self) -> Result<Transitions> {
        let values = self.transitions
            .val()
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| anyhow!("Cannot read CRF transitions: {e:?}"))?;
        Ok(Transitions { size: self.num_tags, values })
    }

    /// True while the structural constraints still hold
    pub fn is_constrained(&self) -> Result<bool> {
        let t = self.to_transitions()?;
        Ok((0..t.size).all(|i| t.get(i, t.start()) <= IMPOSSIBLE / 2.0 && t.get(t.stop(), i) <= IMPOSSIBLE / 2.0))
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::batcher::int_tensor;
    use crate::ml::decoder::{crf_nll, gold_transition_indices, ScoreGrid};
    use burn::tensor::ElementConversion;

    type B = burn::backend::NdArray;

    #[test]
    fn test_init_applies_constraints() {
        let device = Default::default();
        let crf    = CrfConfig::new(3).init::<B>(&device);
        assert_eq!(crf.num_tags, 5);
        assert!(crf.is_constrained().unwrap());
        let t = crf.to_transitions().unwrap();
        assert_eq!(t.get(1, 2), 0.0);
        assert_eq!(t.get(1, 0), IMPOSSIBLE);
    }

    #[test]
    fn test_tensor_nll_matches_host_reference() {
        let device = Default::default();
        let crf    = CrfConfig::new(3).init::<B>(&device);
        let trans  = crf.to_transitions().unwrap();

        // two rows, lengths 3 and 2, T = 5
        let (n, s, t) = (2, 3, 5);
        let scores: Vec<f32> = (0..n * s * t).map(|i| ((i * 7) % 11) as f32 * 0.1).collect();
        let labels  = vec![1, 2, 2, 2, 1, 0];
        let lengths = vec![3, 2];
        let mask    = vec![1usize, 1, 1, 1, 1, 0];

        let want = crf_nll(&ScoreGrid::new(n, s, t, scores.clone()), &labels, &lengths, &trans);

        let emissions = Tensor::<B, 3>::from_data(TensorData::new(scores, [n, s, t]), &device);
        let labels_t  = int_tensor::<B, 2>(&labels, [n, s], &device);
        let mask_t    = int_tensor::<B, 2>(&mask, [n, s], &device).equal_elem(1);
        let gold      = gold_transition_indices(&labels, &lengths, s, t);
        let gold_t    = int_tensor::<B, 1>(&gold, [gold.len()], &device);

        let got: f32 = crf.neg_log_likelihood(emissions, labels_t, mask_t, gold_t)
            .into_scalar()
            .elem::<f32>();
        assert!((got - want).abs() < 1e-2, "tensor {got} vs host {want}");
    }

    #[test]
    fn test_masked_steps_do_not_change_partition() {
        let device = Default::default();
        let crf    = CrfConfig::new(2).init::<B>(&device);

        let short = Tensor::<B, 3>::from_data(TensorData::new(vec![0.3f32, 1.0, 0.0, 0.0], [1, 1, 4]), &device);
        let long  = Tensor::<B, 3>::from_data(
            TensorData::new(vec![0.3f32, 1.0, 0.0, 0.0, 9.0, 9.0, 9.0, 9.0], [1, 2, 4]),
            &device,
        );
        let m1 = int_tensor::<B, 2>(&[1], [1, 1], &device).equal_elem(1);
        let m2 = int_tensor::<B, 2>(&[1, 0], [1, 2], &device).equal_elem(1);

        let a: f32 = crf.log_partition(short, m1).into_scalar().elem::<f32>();
        let b: f32 = crf.log_partition(long, m2).into_scalar().elem::<f32>();
        assert!((a - b).abs() < 1e-4);
    }

    #[test]
    fn test_nll_backward_reaches_transitions() {
        type AB = burn::backend::Autodiff<B>;
        let device = Default::default();
        let crf    = CrfConfig::new(3).init::<AB>(&device);

        let (n, s, t) = (2, 3, 5);
        let scores: Vec<f32> = (0..n * s * t).map(|i| ((i * 5) % 7) as f32 * 0.2).collect();
        let labels  = vec![1, 2, 1, 2, 2, 0];
        let lengths = vec![3, 2];
        let mask    = vec![1usize, 1, 1, 1, 1, 0];

        let emissions = Tensor::<AB, 3>::from_data(TensorData::new(scores, [n, s, t]), &device).require_grad();
        let labels_t  = int_tensor::<AB, 2>(&labels, [n, s], &device);
        let mask_t    = int_tensor::<AB, 2>(&mask, [n, s], &device).equal_elem(1);
        let gold      = gold_transition_indices(&labels, &lengths, s, t);
        let gold_t    = int_tensor::<AB, 1>(&gold, [gold.len()], &device);

        let grads = crf.neg_log_likelihood(emissions.clone(), labels_t, mask_t, gold_t).backward();
        let trans_grad = crf.transitions.val().grad(&grads).expect("transition gradient");
        let emit_grad  = emissions.grad(&grads).expect("emission gradient");

        let values: Vec<f32> = trans_grad.into_data().convert::<f32>().to_vec().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
        assert!(values.iter().any(|v| *v != 0.0));
        assert_eq!(emit_grad.dims(), [n, s, t]);
    }
}
