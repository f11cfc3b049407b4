// ============================================================
// Layer 6 — Feature Extractor
// ============================================================
// The evaluator only needs a function from an image batch to
// a grid of patch features. `FeatureExtractor` is that seam.
//
// RandomPatchEncoder is the built-in implementation: a fixed,
// seeded Gaussian projection of every flattened P×P×3 patch.
//
//   images [B, 3, H, W]
//       │ reshape  [B, 3, R, P, R, P]
//       │ permute  [B, R, R, 3, P, P]
//       │ reshape  [B·R·R, 3·P·P]
//       ▼ matmul   W [3·P·P, D]
//   patches [B, R·R, D]              (row-major over the grid)
//
// Weights for a trained encoder of the same shape can be
// loaded from a full-precision named MessagePack record; the
// architecture config decides the shape, the record only fills
// in the values.

use std::path::PathBuf;

use burn::{
    module::Param,
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
    tensor::TensorData,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::domain::error::{HbirdError, HbirdResult};

/// Weight records are kept at f32 so a reload is bit-exact.
type WeightRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Anything that turns an image batch into a square grid of patch features.
pub trait FeatureExtractor<B: Backend> {
    /// images `[B, 3, H, W]` → patches `[B, R·R, D]` in row-major grid order.
    fn forward_features(&self, images: Tensor<B, 4>) -> HbirdResult<Tensor<B, 3>>;

    /// Patches per side of the grid (R).
    fn eval_spatial_resolution(&self) -> usize;

    /// Feature dimension (D).
    fn d_model(&self) -> usize;
}

// NOTE: #[derive(Config)] already provides Clone + serde impls.
#[derive(Config, Debug)]
pub struct RandomPatchEncoderConfig {
    pub input_size:  usize,
    pub patch_size:  usize,
    pub d_model:     usize,
    #[config(default = 3)]
    pub in_channels: usize,
    #[config(default = 42)]
    pub seed:        u64,
}

impl RandomPatchEncoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> HbirdResult<RandomPatchEncoder<B>> {
        if self.patch_size == 0 || self.input_size % self.patch_size != 0 {
            return Err(HbirdError::InvalidShape(format!(
                "input size {} is not a multiple of patch size {}",
                self.input_size, self.patch_size
            )));
        }
        if self.d_model == 0 || self.in_channels == 0 {
            return Err(HbirdError::InvalidShape("d_model and in_channels must be positive".into()));
        }

        let fan_in = self.in_channels * self.patch_size * self.patch_size;
        let scale  = 1.0 / (fan_in as f32).sqrt();
        let mut rng = StdRng::seed_from_u64(self.seed);
        let values: Vec<f32> = (0..fan_in * self.d_model)
            .map(|_| rng.sample::<f32, _>(StandardNormal) * scale)
            .collect();

        let weight = Tensor::<B, 2>::from_data(TensorData::new(values, [fan_in, self.d_model]), device);
        Ok(RandomPatchEncoder {
            weight:      Param::from_tensor(weight),
            input_size:  self.input_size,
            patch_size:  self.patch_size,
            in_channels: self.in_channels,
            d_model:     self.d_model,
        })
    }
}

#[derive(Module, Debug)]
pub struct RandomPatchEncoder<B: Backend> {
    pub weight:      Param<Tensor<B, 2>>,
    pub input_size:  usize,
    pub patch_size:  usize,
    pub in_channels: usize,
    pub d_model:     usize,
}

impl<B: Backend> RandomPatchEncoder<B> {
    /// images: [B, C, H, W] → patches: [B, R·R, D]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 3> {
        let [batch, channels, height, width] = images.dims();
        let p    = self.patch_size;
        let rows = height / p;
        let cols = width / p;

        images
            .reshape([batch, channels, rows, p, cols, p])
            .permute([0, 2, 4, 1, 3, 5])
            .reshape([batch * rows * cols, channels * p * p])
            .matmul(self.weight.val())
            .reshape([batch, rows * cols, self.d_model])
    }

    /// Replace the projection with weights recorded by `save_weights`.
    pub fn load_weights(self, path: impl Into<PathBuf>, device: &B::Device) -> HbirdResult<Self> {
        let path = path.into();
        let record = WeightRecorder::new()
            .load(path.clone(), device)
            .map_err(|e| HbirdError::Artifact(format!("cannot load encoder weights '{}': {e}", path.display())))?;
        tracing::info!("Loaded extractor weights from '{}'", path.display());
        Ok(self.load_record(record))
    }

    pub fn save_weights(&self, path: impl Into<PathBuf>) -> HbirdResult<()> {
        let path = path.into();
        WeightRecorder::new()
            .record(self.clone().into_record(), path.clone())
            .map_err(|e| HbirdError::Artifact(format!("cannot save encoder weights '{}': {e}", path.display())))
    }
}

impl<B: Backend> FeatureExtractor<B> for RandomPatchEncoder<B> {
    fn forward_features(&self, images: Tensor<B, 4>) -> HbirdResult<Tensor<B, 3>> {
        let [batch, channels, height, width] = images.dims();
        if channels != self.in_channels || height != self.input_size || width != self.input_size {
            return Err(HbirdError::shape(
                format!("[B, {}, {}, {}]", self.in_channels, self.input_size, self.input_size),
                format!("{:?}", [batch, channels, height, width]),
            ));
        }

        Ok(self.forward(images))
    }

    fn eval_spatial_resolution(&self) -> usize {
        self.input_size / self.patch_size
    }

    fn d_model(&self) -> usize {
        self.d_model
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn host<const D: usize>(t: Tensor<TestBackend, D>) -> Vec<f32> {
        t.into_data().iter::<f32>().collect()
    }

    fn encoder(seed: u64) -> RandomPatchEncoder<TestBackend> {
        RandomPatchEncoderConfig::new(4, 2, 8)
            .with_seed(seed)
            .init(&Default::default())
            .unwrap()
    }

    #[test]
    fn test_output_shape_and_resolution() {
        let enc    = encoder(42);
        let images = Tensor::<TestBackend, 4>::ones([2, 3, 4, 4], &Default::default());
        let out    = enc.forward_features(images).unwrap();
        assert_eq!(out.dims(), [2, 4, 8]);
        assert_eq!(enc.eval_spatial_resolution(), 2);
        assert_eq!(enc.d_model(), 8);
    }

    #[test]
    fn test_same_seed_same_weights() {
        assert_eq!(host(encoder(7).weight.val()), host(encoder(7).weight.val()));
        assert_ne!(host(encoder(7).weight.val()), host(encoder(8).weight.val()));
    }

    #[test]
    fn test_weights_are_scaled_gaussian() {
        // fan_in = 3·8·8 = 192, so the draws should have std ≈ 1/√192.
        let enc = RandomPatchEncoderConfig::new(8, 8, 64).init::<TestBackend>(&Default::default()).unwrap();
        let w   = host(enc.weight.val());
        let n   = w.len() as f32;
        let mean = w.iter().sum::<f32>() / n;
        let std  = (w.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n).sqrt();
        assert!(mean.abs() < 0.01, "mean {mean}");
        assert!((std - 1.0 / 192f32.sqrt()).abs() < 0.01, "std {std}");
    }

    #[test]
    fn test_patch_order_is_row_major() {
        let enc = encoder(1);
        // Pixel value encodes (channel, y, x) so every patch is distinct.
        let pixels: Vec<f32> = (0..3 * 4 * 4).map(|i| i as f32 / 10.0).collect();
        let images = Tensor::<TestBackend, 4>::from_data(TensorData::new(pixels.clone(), [1, 3, 4, 4]), &Default::default());
        let out = host(enc.forward(images));
        let w   = host(enc.weight.val());

        // Patch 1 is grid row 0, column 1: x in 2..4, y in 0..2.
        let mut flat = Vec::new();
        for ch in 0..3 {
            for y in 0..2 {
                for x in 2..4 {
                    flat.push(pixels[(ch * 4 + y) * 4 + x]);
                }
            }
        }
        for d in 0..8 {
            let expected: f32 = flat.iter().enumerate().map(|(i, v)| v * w[i * 8 + d]).sum();
            assert!((out[8 + d] - expected).abs() < 1e-4);
        }
    }

    #[test]
    fn test_rejects_wrong_input_size() {
        let enc    = encoder(0);
        let images = Tensor::<TestBackend, 4>::zeros([1, 3, 6, 6], &Default::default());
        assert!(enc.forward_features(images).is_err());
    }

    #[test]
    fn test_indivisible_patch_size_is_rejected() {
        let r = RandomPatchEncoderConfig::new(10, 4, 8).init::<TestBackend>(&Default::default());
        assert!(r.is_err());
    }

    #[test]
    fn test_weights_round_trip() {
        let dir  = tempfile::tempdir().unwrap();
        let path = dir.path().join("encoder");
        let original = encoder(3);
        original.save_weights(&path).unwrap();

        let restored = encoder(4).load_weights(&path, &Default::default()).unwrap();
        assert_eq!(host(original.weight.val()), host(restored.weight.val()));
    }
}
