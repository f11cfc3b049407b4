// ============================================================
// Layer 6 — Cross-Attention Aggregator
// ============================================================
// Every query patch votes with its k retrieved neighbours:
//
//   q̂      = q / ‖q‖                       [B, N, 1, D]
//   K̂      = K / ‖K‖  (per neighbour)      [B, N, K, D]
//   logits = q̂ · K̂ᵀ / τ                    [B, N, 1, K]
//   w      = softmax(logits)  over K
//   label  = w · V                          [B, N, 1, C] → [B, N, C]
//
// All patches of all images run through one batched matmul.
// τ is small (0.02 by default), so 1/τ scales logits up to
// ~50 and the softmax must subtract the row max first.

use burn::prelude::*;

use crate::domain::error::{HbirdError, HbirdResult};

const NORM_EPS: f64 = 1e-12;

/// Scale every slice along `dim` to unit L2 norm.
pub fn l2_normalize<B: Backend, const D: usize>(x: Tensor<B, D>, dim: usize) -> Tensor<B, D> {
    let norm = (x.clone() * x.clone()).sum_dim(dim).sqrt().clamp_min(NORM_EPS);
    x / norm
}

/// Softmax along `dim`, shifted by the max logit.
pub fn stable_softmax<B: Backend, const D: usize>(logits: Tensor<B, D>, dim: usize) -> Tensor<B, D> {
    let max     = logits.clone().max_dim(dim);
    let shifted = (logits - max).exp();
    let total   = shifted.clone().sum_dim(dim);
    shifted / total
}

/// Attention-weighted vote of neighbour labels.
///
/// `query [B, N, D]`, `keys [B, N, K, D]`, `values [B, N, K, C]` → `[B, N, C]`.
pub fn cross_attention<B: Backend>(
    query:       Tensor<B, 3>,
    keys:        Tensor<B, 4>,
    values:      Tensor<B, 4>,
    temperature: f64,
) -> HbirdResult<Tensor<B, 3>> {
    let [b, n, d]          = query.dims();
    let [kb, kn, k, kd]    = keys.dims();
    let [vb, vn, vk, c]    = values.dims();

    if [kb, kn, kd] != [b, n, d] {
        return Err(HbirdError::shape(format!("keys [{b}, {n}, K, {d}]"), format!("{:?}", keys.dims())));
    }
    if [vb, vn, vk] != [b, n, k] {
        return Err(HbirdError::shape(format!("values [{b}, {n}, {k}, C]"), format!("{:?}", values.dims())));
    }
    if temperature <= 0.0 {
        return Err(HbirdError::Precondition(format!("temperature must be positive, got {temperature}")));
    }

    let query = l2_normalize(query, 2).unsqueeze_dim::<4>(2); // [B, N, 1, D]
    let keys  = l2_normalize(keys, 3);

    let logits  = query.matmul(keys.swap_dims(2, 3)).div_scalar(temperature); // [B, N, 1, K]
    let weights = stable_softmax(logits, 3);

    Ok(weights.matmul(values).reshape([b, n, c]))
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray;

    fn tensor<const D: usize>(values: Vec<f32>, shape: [usize; D]) -> Tensor<TestBackend, D> {
        Tensor::from_data(TensorData::new(values, shape), &Default::default())
    }

    fn host<const D: usize>(t: Tensor<TestBackend, D>) -> Vec<f32> {
        t.into_data().iter::<f32>().collect()
    }

    #[test]
    fn test_identical_labels_pass_through() {
        // Two queries, three neighbours each, every neighbour labelled [0.2, 0.8].
        let query  = tensor(vec![1.0, 0.0, 0.3, -0.7], [1, 2, 2]);
        let keys   = tensor(vec![0.5, 0.1, -1.0, 2.0, 3.0, 3.0, 0.0, 1.0, 1.0, 0.0, -2.0, 0.4], [1, 2, 3, 2]);
        let values = tensor([0.2, 0.8].repeat(6), [1, 2, 3, 2]);

        for temperature in [0.02, 1.0, 10.0] {
            let out = host(cross_attention(query.clone(), keys.clone(), values.clone(), temperature).unwrap());
            for pair in out.chunks_exact(2) {
                assert!((pair[0] - 0.2).abs() < 1e-6);
                assert!((pair[1] - 0.8).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_softmax_is_normalized() {
        let logits = tensor(vec![1000.0, 999.0, -1000.0, 0.0, 0.0, 0.0, -3.0, 50.0, 2.5], [3, 3]);
        for temperature in [0.02, 1.0] {
            let w = host(stable_softmax(logits.clone().div_scalar(temperature), 1));
            assert!(w.iter().all(|x| x.is_finite() && *x >= 0.0));
            for row in w.chunks_exact(3) {
                assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_two_class_memory_vote() {
        let query  = tensor(vec![1.0, 0.0], [1, 1, 2]);
        let keys   = tensor(vec![1.0, 0.0, 0.9, 0.1, 0.0, 1.0, -0.1, 0.9], [1, 1, 4, 2]);
        let values = tensor(vec![1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0], [1, 1, 4, 2]);

        let out = host(cross_attention(query, keys, values, 0.02).unwrap());
        assert!(out[0] > 0.999, "got {out:?}");
        assert!(out[1] < 1e-3);
    }

    #[test]
    fn test_sharp_temperature_picks_closest() {
        let query  = tensor(vec![0.0, 1.0], [1, 1, 2]);
        let keys   = tensor(vec![1.0, 0.0, 0.1, 1.0], [1, 1, 2, 2]);
        let values = tensor(vec![1.0, 0.0, 0.0, 1.0], [1, 1, 2, 2]);
        let out = host(cross_attention(query, keys, values, 0.001).unwrap());
        assert!(out[1] > 0.999);
    }

    #[test]
    fn test_l2_normalize_rows() {
        let out = host(l2_normalize(tensor(vec![3.0, 4.0, 0.0, 0.0], [2, 2]), 1));
        assert!((out[0] - 0.6).abs() < 1e-6 && (out[1] - 0.8).abs() < 1e-6);
        assert_eq!(&out[2..], &[0.0, 0.0]);
    }

    #[test]
    fn test_rejects_mismatched_shapes() {
        let query  = tensor(vec![1.0, 0.0], [1, 1, 2]);
        let keys   = tensor(vec![1.0, 0.0, 0.0], [1, 1, 1, 3]);
        let values = tensor(vec![1.0], [1, 1, 1, 1]);
        assert!(cross_attention(query, keys, values, 0.02).is_err());
    }
}
