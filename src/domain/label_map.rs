// ============================================================
// Layer 3 — Label Maps and Batches
// ============================================================
// Plain containers for what flows out of a data loader:
// a batch of normalized CHW images and the matching batch
// of per-pixel class indices.
//
// Layouts (row-major, no padding):
//   images → [batch, 3, height, width]   f32
//   labels → [batch, height, width]      u8, 255 = ignore

use crate::domain::error::{HbirdError, HbirdResult};

/// Pixel value marking "no ground truth here".
pub const IGNORE_LABEL: u8 = 255;

/// Number of image channels every extractor receives.
pub const IMAGE_CHANNELS: usize = 3;

/// A batch of per-pixel integer label maps.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelMapBatch {
    pub data:   Vec<u8>,
    pub batch:  usize,
    pub height: usize,
    pub width:  usize,
}

impl LabelMapBatch {
    pub fn new(data: Vec<u8>, batch: usize, height: usize, width: usize) -> HbirdResult<Self> {
        let expected = batch * height * width;
        if data.len() != expected {
            return Err(HbirdError::shape(
                format!("{expected} label pixels ({batch}x{height}x{width})"),
                data.len(),
            ));
        }
        Ok(Self { data, batch, height, width })
    }

    /// A batch where every pixel carries the same class.
    pub fn filled(value: u8, batch: usize, height: usize, width: usize) -> Self {
        Self { data: vec![value; batch * height * width], batch, height, width }
    }

    pub fn pixels_per_image(&self) -> usize {
        self.height * self.width
    }

    #[inline]
    pub fn pixel(&self, b: usize, y: usize, x: usize) -> u8 {
        self.data[(b * self.height + y) * self.width + x]
    }

    pub fn image(&self, b: usize) -> &[u8] {
        let n = self.pixels_per_image();
        &self.data[b * n..(b + 1) * n]
    }

    /// Copy with every ignore pixel turned into class 0.
    ///
    /// Used only when building memory labels. Scoring masks the
    /// original ignore pixels instead.
    pub fn remap_ignore_to_background(&self) -> Self {
        let data = self
            .data
            .iter()
            .map(|&v| if v == IGNORE_LABEL { 0 } else { v })
            .collect();
        Self { data, ..*self }
    }
}

/// One batch as yielded by a segmentation data source.
#[derive(Debug, Clone)]
pub struct SegmentationBatch {
    pub images: Vec<f32>,
    pub labels: LabelMapBatch,
}

impl SegmentationBatch {
    pub fn new(images: Vec<f32>, labels: LabelMapBatch) -> HbirdResult<Self> {
        let expected = labels.batch * IMAGE_CHANNELS * labels.height * labels.width;
        if images.len() != expected {
            return Err(HbirdError::shape(
                format!(
                    "{expected} image values ({}x{IMAGE_CHANNELS}x{}x{})",
                    labels.batch, labels.height, labels.width
                ),
                images.len(),
            ));
        }
        Ok(Self { images, labels })
    }

    pub fn batch_size(&self) -> usize { self.labels.batch }

    pub fn height(&self) -> usize { self.labels.height }

    pub fn width(&self) -> usize { self.labels.width }

    /// Image tensor shape as [batch, channels, height, width].
    pub fn image_shape(&self) -> [usize; 4] {
        [self.labels.batch, IMAGE_CHANNELS, self.labels.height, self.labels.width]
    }
}
