// ============================================================
// Layer 4 — Image / Mask Transforms
// ============================================================
// Brings a decoded (RGB image, label mask) pair to the model
// input size, applying the same geometry to both:
//
//   Train:  random resized crop (area 50–100%, aspect 3/4–4/3)
//           → horizontal flip with p = 0.5
//           → resize to input_size × input_size
//   Val:    resize to input_size × input_size
//
// Images resize with the triangle (bilinear) filter; masks use
// nearest so no new class ids appear. Images then leave as CHW
// floats normalized with the ImageNet mean and std.

use image::{
    imageops::{self, FilterType},
    GrayImage, RgbImage,
};
use rand::Rng;

use crate::data::dataset::SegmentationSample;
use crate::domain::error::{HbirdError, HbirdResult};

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD:  [f32; 3] = [0.229, 0.224, 0.225];

const CROP_ATTEMPTS: usize = 10;
const ASPECT_RANGE:  (f32, f32) = (3.0 / 4.0, 4.0 / 3.0);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SegmentationTransform {
    Train {
        input_size:       u32,
        min_scale:        f32,
        max_scale:        f32,
        flip_probability: f64,
    },
    Val {
        input_size: u32,
    },
}

impl SegmentationTransform {
    pub fn train(input_size: u32) -> Self {
        Self::Train { input_size, min_scale: 0.5, max_scale: 1.0, flip_probability: 0.5 }
    }

    pub fn val(input_size: u32) -> Self {
        Self::Val { input_size }
    }

    pub fn input_size(&self) -> u32 {
        match self {
            Self::Train { input_size, .. } | Self::Val { input_size } => *input_size,
        }
    }

    pub fn apply<R: Rng>(&self, image: RgbImage, mask: GrayImage, rng: &mut R) -> HbirdResult<SegmentationSample> {
        if image.dimensions() != mask.dimensions() {
            return Err(HbirdError::shape(
                format!("mask of {:?}", image.dimensions()),
                format!("{:?}", mask.dimensions()),
            ));
        }

        let (image, mask) = match *self {
            Self::Val { .. } => (image, mask),
            Self::Train { min_scale, max_scale, flip_probability, .. } => {
                let (w, h) = image.dimensions();
                let (x, y, cw, ch) = random_resized_crop(w, h, (min_scale, max_scale), rng);
                let mut image = imageops::crop_imm(&image, x, y, cw, ch).to_image();
                let mut mask  = imageops::crop_imm(&mask, x, y, cw, ch).to_image();
                if rng.gen_bool(flip_probability) {
                    image = imageops::flip_horizontal(&image);
                    mask  = imageops::flip_horizontal(&mask);
                }
                (image, mask)
            }
        };

        let size  = self.input_size();
        let image = imageops::resize(&image, size, size, FilterType::Triangle);
        let mask  = imageops::resize(&mask, size, size, FilterType::Nearest);

        SegmentationSample::new(normalize_chw(&image), mask.into_raw(), size as usize, size as usize)
    }
}

/// Crop window `(x, y, width, height)` covering a random share of the area.
fn random_resized_crop<R: Rng>(width: u32, height: u32, scale: (f32, f32), rng: &mut R) -> (u32, u32, u32, u32) {
    let area = (width * height) as f32;
    let (log_lo, log_hi) = (ASPECT_RANGE.0.ln(), ASPECT_RANGE.1.ln());

    for _ in 0..CROP_ATTEMPTS {
        let target = area * rng.gen_range(scale.0..=scale.1);
        let aspect = rng.gen_range(log_lo..=log_hi).exp();
        let cw = (target * aspect).sqrt().round() as u32;
        let ch = (target / aspect).sqrt().round() as u32;
        if cw > 0 && ch > 0 && cw <= width && ch <= height {
            let x = rng.gen_range(0..=width - cw);
            let y = rng.gen_range(0..=height - ch);
            return (x, y, cw, ch);
        }
    }
    // Fallback: the whole image.
    (0, 0, width, height)
}

/// RGB bytes → CHW floats, ImageNet-normalized.
pub fn normalize_chw(image: &RgbImage) -> Vec<f32> {
    let n = (image.width() * image.height()) as usize;
    let mut out = vec![0.0f32; 3 * n];
    for (i, pixel) in image.pixels().enumerate() {
        for ch in 0..3 {
            out[ch * n + i] = (pixel[ch] as f32 / 255.0 - IMAGENET_MEAN[ch]) / IMAGENET_STD[ch];
        }
    }
    out
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb};
    use rand::{rngs::StdRng, SeedableRng};

    fn pair(w: u32, h: u32) -> (RgbImage, GrayImage) {
        let image = RgbImage::from_fn(w, h, |x, y| Rgb([(x * 10) as u8, (y * 10) as u8, 128]));
        let mask  = GrayImage::from_fn(w, h, |x, _| Luma([if x < w / 2 { 3 } else { 255 }]));
        (image, mask)
    }

    #[test]
    fn test_val_resizes_to_input_size() {
        let (image, mask) = pair(20, 12);
        let mut rng = StdRng::seed_from_u64(0);
        let s = SegmentationTransform::val(8).apply(image, mask, &mut rng).unwrap();
        assert_eq!((s.height, s.width), (8, 8));
        assert_eq!(s.image.len(), 3 * 64);
        // Nearest resize never invents new ids.
        assert!(s.label.iter().all(|&v| v == 3 || v == 255));
    }

    #[test]
    fn test_train_output_is_square_and_valid() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..20 {
            let (image, mask) = pair(30, 18);
            let s = SegmentationTransform::train(16).apply(image, mask, &mut rng).unwrap();
            assert_eq!(s.label.len(), 256);
            assert!(s.label.iter().all(|&v| v == 3 || v == 255));
        }
    }

    #[test]
    fn test_crop_stays_inside_image() {
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..100 {
            let (x, y, w, h) = random_resized_crop(40, 25, (0.5, 1.0), &mut rng);
            assert!(x + w <= 40 && y + h <= 25);
            assert!(w * h >= 40 * 25 / 3);
        }
    }

    #[test]
    fn test_normalization() {
        let image = RgbImage::from_pixel(1, 1, Rgb([255, 0, 255]));
        let out = normalize_chw(&image);
        assert!((out[0] - (1.0 - 0.485) / 0.229).abs() < 1e-5);
        assert!((out[1] - (-0.456 / 0.224)).abs() < 1e-5);
    }

    #[test]
    fn test_mismatched_mask_is_rejected() {
        let (image, _) = pair(4, 4);
        let mask = GrayImage::new(3, 4);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(SegmentationTransform::val(4).apply(image, mask, &mut rng).is_err());
    }
}
