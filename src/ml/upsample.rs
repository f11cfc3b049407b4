// ============================================================
// Layer 6 — Bilinear Upsampling
// ============================================================
// Resizes the patch-grid soft labels back to pixel resolution
// with the half-pixel grid (align_corners = false):
//
//   src = (dst + 0.5) · in / out − 0.5,  clamped to [0, in − 1]
//
// Each axis is a fixed [out, in] weight matrix, so the resize
// is two plain matmuls:
//
//   x [B·C·Rh, Rw]  · Wwᵀ [Rw, W]  → [B·C·Rh, W]
//   swap to [B·C·W, Rh] · Whᵀ [Rh, H] → [B·C·W, H]
//   swap back                         → [B, C, H, W]

use burn::{prelude::*, tensor::TensorData};

/// Interpolation weights for one axis, row-major `[output, input]`.
/// Every row sums to 1.
pub fn half_pixel_weights(input: usize, output: usize) -> Vec<f32> {
    let mut weights = vec![0.0f32; output * input];
    if input == 0 || output == 0 {
        return weights;
    }
    let scale = input as f32 / output as f32;
    for dst in 0..output {
        let src  = ((dst as f32 + 0.5) * scale - 0.5).max(0.0);
        let low  = (src.floor() as usize).min(input - 1);
        let high = (low + 1).min(input - 1);
        let frac = src - low as f32;
        weights[dst * input + low]  += 1.0 - frac;
        weights[dst * input + high] += frac;
    }
    weights
}

fn axis_weights<B: Backend>(input: usize, output: usize, device: &B::Device) -> Tensor<B, 2> {
    let weights = TensorData::new(half_pixel_weights(input, output), [output, input]);
    Tensor::<B, 2>::from_data(weights, device).transpose()
}

/// `[B, C, h, w]` → `[B, C, height, width]`.
pub fn upsample_bilinear<B: Backend>(x: Tensor<B, 4>, [height, width]: [usize; 2]) -> Tensor<B, 4> {
    let [batch, channels, in_h, in_w] = x.dims();
    let device = x.device();
    let planes = batch * channels;

    x.reshape([planes * in_h, in_w])
        .matmul(axis_weights::<B>(in_w, width, &device))
        .reshape([planes, in_h, width])
        .swap_dims(1, 2)
        .reshape([planes * width, in_h])
        .matmul(axis_weights::<B>(in_h, height, &device))
        .reshape([planes, width, height])
        .swap_dims(1, 2)
        .reshape([batch, channels, height, width])
}
